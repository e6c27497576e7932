// SPDX-License-Identifier: MIT OR Apache-2.0

//! The channel state machine.
//!
//! A channel is a group of participants inside a broadcast room who share an end-to-end
//! encrypted conversation. The room delivers every broadcast to every participant in the same
//! total order but provides no secrecy, authenticity or consensus; the channel maintains a
//! replicated, Byzantine-resistant view of who is in the group, who has authorized whom, and
//! what everyone has seen so far.
//!
//! All state lives in a single [`Channel`] value. Entry points run to completion; outbound
//! broadcasts accumulate in an outbox drained by the embedder with
//! [`Channel::take_outgoing`]. Within a running channel no fault is propagated to the caller:
//! malformed messages are dropped, Byzantine peers are removed.
mod event;
mod participant;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cbor::DecodeError;
use crate::crypto::sha2::sha2_256;
use crate::crypto::triple_dh::triple_diffie_hellman;
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::{Rng, RngError};
use crate::hash::Hash;
use crate::message::{self, KeyEventKind, Message, MessageType, SignedDecodeError, StatusEvent};
use crate::traits::{ChannelObserver, ChatEvent, EncryptedChat, StatusTimer};

pub use event::{ChannelStatusEvent, ConsistencyCheckEvent, Event, KeyEvent};
pub use participant::{AuthenticationStatus, Participant};

/// Wire type byte used when folding a transport-level departure into the status hash; it can
/// never collide with a real message type.
const USER_LEFT_TYPE_BYTE: u8 = 0;

/// Channel parameters.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Period of the consistency-status prompt while the channel is active.
    pub status_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs(10),
        }
    }
}

/// Errors surfaced when constructing a channel from a status snapshot.
///
/// A malformed snapshot leaves no channel behind; once a channel runs, faults are handled
/// internally and never reach the caller.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error("status snapshot lists participant \"{0}\" twice")]
    DuplicateParticipant(String),

    #[error("status snapshot lists key exchange {0} twice")]
    DuplicateKeyExchange(Hash),

    #[error("encrypted-chat layer rejected a serialized key exchange: {0}")]
    KeyExchangeState(#[from] DecodeError),

    #[error("cancelled key-exchange event {0} refers to a live key exchange")]
    CancelledKeyExchangeExists(Hash),

    #[error("key-exchange event {0} refers to no live key exchange")]
    UnknownKeyExchange(Hash),

    #[error("status snapshot lists more than one event for key exchange {0}")]
    DuplicateKeyExchangeEvent(Hash),

    #[error("key-activation event {0} refers to a live key exchange")]
    ActivationForLiveKeyExchange(Hash),

    #[error("status snapshot lists more than one activation event for key {0}")]
    DuplicateKeyActivationEvent(Hash),

    #[error("status snapshot event list is malformed")]
    MalformedStatusEvent,

    #[error("{exchanges} live key exchanges but {events} key-exchange events")]
    KeyExchangeEventCountMismatch { exchanges: usize, events: usize },
}

/// The channel state machine.
///
/// Generic over the encrypted-chat collaborator and the timer capability; see
/// [`crate::traits`].
pub struct Channel<C, T>
where
    C: EncryptedChat,
    T: StatusTimer,
{
    username: String,
    long_term_secret_key: SecretKey,
    long_term_public_key: PublicKey,
    ephemeral_secret_key: SecretKey,
    ephemeral_public_key: PublicKey,

    /// Nonce offered in authentication requests while we are not yet a full member.
    authentication_nonce: Hash,
    /// Running hash over every broadcast observed on the channel.
    channel_status_hash: Hash,

    joined: bool,
    active: bool,
    authorized: bool,

    participants: BTreeMap<String, Participant>,
    events: VecDeque<Event>,

    encrypted_chat: C,
    observer: Option<Box<dyn ChannelObserver>>,
    timer: T,
    timer_guard: Option<T::Guard>,
    config: ChannelConfig,

    outbox: VecDeque<Message>,
    rng: Rng,
}

impl<C, T> Channel<C, T>
where
    C: EncryptedChat,
    T: StatusTimer,
{
    /// Creates a brand-new channel with the local user as its only, self-authorized
    /// participant.
    pub fn new(
        username: String,
        long_term_secret_key: SecretKey,
        encrypted_chat: C,
        timer: T,
        config: ChannelConfig,
        rng: Rng,
    ) -> Result<Self, ChannelError> {
        let channel_status_hash = Hash::random(&rng)?;
        let mut channel = Self::init(
            username,
            long_term_secret_key,
            encrypted_chat,
            timer,
            config,
            rng,
            channel_status_hash,
        )?;
        channel.joined = true;
        channel.authorized = true;

        let me = Participant {
            username: channel.username.clone(),
            long_term_public_key: channel.long_term_public_key,
            ephemeral_public_key: channel.ephemeral_public_key,
            authorization_nonce: channel.channel_status_hash,
            authorized: true,
            authentication_status: AuthenticationStatus::Authenticated,
            authorized_by: BTreeSet::new(),
            authorized_peers: BTreeSet::new(),
        };
        channel.participants.insert(me.username.clone(), me);

        let chat_events = channel.encrypted_chat.create_solo_session();
        channel.apply_chat_events(chat_events);

        Ok(channel)
    }

    /// Reconstructs an existing channel from a received status snapshot.
    ///
    /// `encoded_message` is the broadcast the snapshot arrived in; the snapshot's event queue
    /// does not contain the event describing the status message itself, so it is rebuilt here
    /// and appended last.
    pub fn from_status(
        username: String,
        long_term_secret_key: SecretKey,
        encrypted_chat: C,
        timer: T,
        config: ChannelConfig,
        rng: Rng,
        status: &message::ChannelStatus,
        encoded_message: &Message,
    ) -> Result<Self, ChannelError> {
        let mut channel = Self::init(
            username,
            long_term_secret_key,
            encrypted_chat,
            timer,
            config,
            rng,
            status.channel_status_hash,
        )?;

        let mut status_event_remaining = BTreeSet::new();

        for p in &status.participants {
            if channel.participants.contains_key(&p.username) {
                return Err(ChannelError::DuplicateParticipant(p.username.clone()));
            }
            channel.participants.insert(
                p.username.clone(),
                Participant {
                    username: p.username.clone(),
                    long_term_public_key: p.long_term_public_key,
                    ephemeral_public_key: p.ephemeral_public_key,
                    authorization_nonce: p.authorization_nonce,
                    authorized: true,
                    authentication_status: AuthenticationStatus::Unauthenticated,
                    authorized_by: BTreeSet::new(),
                    authorized_peers: BTreeSet::new(),
                },
            );
            status_event_remaining.insert(p.username.clone());

            let chat_events = channel
                .encrypted_chat
                .do_add_user(&p.username, p.long_term_public_key);
            channel.apply_chat_events(chat_events);
        }

        for p in &status.unauthorized_participants {
            if channel.participants.contains_key(&p.username) {
                return Err(ChannelError::DuplicateParticipant(p.username.clone()));
            }

            // Witnesses who are not (or no longer) participants carry no weight.
            let authorized_by = p
                .authorized_by
                .iter()
                .filter(|peer| channel.participants.contains_key(*peer))
                .cloned()
                .collect();
            let authorized_peers = p
                .authorized_peers
                .iter()
                .filter(|peer| channel.participants.contains_key(*peer))
                .cloned()
                .collect();

            channel.participants.insert(
                p.username.clone(),
                Participant {
                    username: p.username.clone(),
                    long_term_public_key: p.long_term_public_key,
                    ephemeral_public_key: p.ephemeral_public_key,
                    authorization_nonce: p.authorization_nonce,
                    authorized: false,
                    authentication_status: AuthenticationStatus::Unauthenticated,
                    authorized_by,
                    authorized_peers,
                },
            );
            status_event_remaining.insert(p.username.clone());
        }

        let mut key_exchange_ids = BTreeSet::new();
        for exchange in &status.key_exchanges {
            if !key_exchange_ids.insert(exchange.key_id) {
                return Err(ChannelError::DuplicateKeyExchange(exchange.key_id));
            }
            let chat_events = channel.encrypted_chat.unserialize_key_exchange(exchange)?;
            channel.apply_chat_events(chat_events);
        }

        let mut key_exchange_event_ids = BTreeSet::new();
        let mut key_activation_event_ids = BTreeSet::new();
        for status_event in &status.events {
            let event = match status_event {
                StatusEvent::ChannelStatus {
                    searcher_username,
                    searcher_nonce,
                    status_message_hash,
                    remaining_users,
                } => Event::ChannelStatus(ChannelStatusEvent {
                    searcher_username: searcher_username.clone(),
                    searcher_nonce: *searcher_nonce,
                    status_message_hash: *status_message_hash,
                    remaining_users: remaining_users.clone(),
                }),
                StatusEvent::ConsistencyCheck {
                    channel_status_hash,
                    remaining_users,
                } => Event::ConsistencyCheck(ConsistencyCheckEvent {
                    channel_status_hash: *channel_status_hash,
                    remaining_users: remaining_users.clone(),
                }),
                StatusEvent::KeyExchange {
                    kind,
                    key_id,
                    cancelled,
                    remaining_users,
                } => {
                    if *kind == KeyEventKind::Activation {
                        return Err(ChannelError::MalformedStatusEvent);
                    }
                    if *cancelled {
                        if key_exchange_ids.contains(key_id) {
                            return Err(ChannelError::CancelledKeyExchangeExists(*key_id));
                        }
                    } else {
                        if !key_exchange_ids.contains(key_id) {
                            return Err(ChannelError::UnknownKeyExchange(*key_id));
                        }
                        if !key_exchange_event_ids.insert(*key_id) {
                            return Err(ChannelError::DuplicateKeyExchangeEvent(*key_id));
                        }
                    }
                    Event::Key(KeyEvent {
                        kind: *kind,
                        key_id: *key_id,
                        remaining_users: remaining_users.clone(),
                    })
                }
                StatusEvent::KeyActivation {
                    key_id,
                    remaining_users,
                } => {
                    if key_exchange_ids.contains(key_id) {
                        return Err(ChannelError::ActivationForLiveKeyExchange(*key_id));
                    }
                    if !key_activation_event_ids.insert(*key_id) {
                        return Err(ChannelError::DuplicateKeyActivationEvent(*key_id));
                    }
                    Event::Key(KeyEvent {
                        kind: KeyEventKind::Activation,
                        key_id: *key_id,
                        remaining_users: remaining_users.clone(),
                    })
                }
            };
            channel.events.push_back(event);
        }

        // Each live key exchange must appear as exactly one key-exchange event.
        if key_exchange_ids.len() != key_exchange_event_ids.len() {
            return Err(ChannelError::KeyExchangeEventCountMismatch {
                exchanges: key_exchange_ids.len(),
                events: key_exchange_event_ids.len(),
            });
        }

        channel
            .events
            .push_back(Event::ChannelStatus(ChannelStatusEvent {
                searcher_username: status.searcher_username.clone(),
                searcher_nonce: status.searcher_nonce,
                status_message_hash: encoded_message.payload_hash(),
                remaining_users: status_event_remaining,
            }));

        Ok(channel)
    }

    /// Reconstructs a channel known only from a minimal announcement; only the announcing
    /// peer is known.
    pub fn from_announcement(
        username: String,
        long_term_secret_key: SecretKey,
        encrypted_chat: C,
        timer: T,
        config: ChannelConfig,
        rng: Rng,
        announcement: &message::ChannelAnnouncement,
        sender: &str,
    ) -> Result<Self, ChannelError> {
        let mut channel = Self::init(
            username,
            long_term_secret_key,
            encrypted_chat,
            timer,
            config,
            rng,
            announcement.channel_status_hash,
        )?;

        channel.participants.insert(
            sender.to_string(),
            Participant {
                username: sender.to_string(),
                long_term_public_key: announcement.long_term_public_key,
                ephemeral_public_key: announcement.ephemeral_public_key,
                authorization_nonce: announcement.channel_status_hash,
                authorized: true,
                authentication_status: AuthenticationStatus::Unauthenticated,
                authorized_by: BTreeSet::new(),
                authorized_peers: BTreeSet::new(),
            },
        );

        let chat_events = channel
            .encrypted_chat
            .do_add_user(sender, announcement.long_term_public_key);
        channel.apply_chat_events(chat_events);

        Ok(channel)
    }

    fn init(
        username: String,
        long_term_secret_key: SecretKey,
        encrypted_chat: C,
        timer: T,
        config: ChannelConfig,
        rng: Rng,
        channel_status_hash: Hash,
    ) -> Result<Self, ChannelError> {
        let ephemeral_secret_key = SecretKey::generate(&rng)?;
        let ephemeral_public_key = ephemeral_secret_key.public_key();
        let long_term_public_key = long_term_secret_key.public_key();
        let authentication_nonce = Hash::random(&rng)?;

        Ok(Self {
            username,
            long_term_secret_key,
            long_term_public_key,
            ephemeral_secret_key,
            ephemeral_public_key,
            authentication_nonce,
            channel_status_hash,
            joined: false,
            active: false,
            authorized: false,
            participants: BTreeMap::new(),
            events: VecDeque::new(),
            encrypted_chat,
            observer: None,
            timer,
            timer_guard: None,
            config,
            outbox: VecDeque::new(),
            rng,
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn long_term_public_key(&self) -> PublicKey {
        self.long_term_public_key
    }

    pub fn ephemeral_public_key(&self) -> PublicKey {
        self.ephemeral_public_key
    }

    pub fn channel_status_hash(&self) -> Hash {
        self.channel_status_hash
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    pub fn participants(&self) -> &BTreeMap<String, Participant> {
        &self.participants
    }

    pub fn pending_events(&self) -> &VecDeque<Event> {
        &self.events
    }

    pub fn encrypted_chat(&self) -> &C {
        &self.encrypted_chat
    }

    /// Registers the observer receiving user-interface notifications.
    pub fn set_observer(&mut self, observer: Box<dyn ChannelObserver>) {
        self.observer = Some(observer);
    }

    /// Drains the broadcasts queued by previous entry points, in order.
    pub fn take_outgoing(&mut self) -> Vec<Message> {
        self.outbox.drain(..).collect()
    }

    /// Broadcasts a minimal advertisement of this channel.
    pub fn announce(&mut self) {
        let payload = message::ChannelAnnouncement {
            long_term_public_key: self.long_term_public_key,
            ephemeral_public_key: self.ephemeral_public_key,
            channel_status_hash: self.channel_status_hash,
        };
        self.broadcast(MessageType::ChannelAnnouncement, &payload);
    }

    /// Broadcasts a request to join this channel.
    pub fn join(&mut self) {
        let payload = message::JoinRequest {
            long_term_public_key: self.long_term_public_key,
            ephemeral_public_key: self.ephemeral_public_key,
            peer_usernames: self.participants.keys().cloned().collect(),
        };
        self.broadcast(MessageType::JoinRequest, &payload);
    }

    /// Starts participating in channel-status replies and the periodic consistency prompt.
    pub fn activate(&mut self) {
        self.active = true;
        self.schedule_status_timer();
    }

    /// Entry point for the embedder's timer when the consistency prompt elapses.
    pub fn status_timer_fired(&mut self) {
        if !self.active {
            return;
        }
        self.broadcast(MessageType::ConsistencyStatus, &message::ConsistencyStatus {});
        self.schedule_status_timer();
    }

    /// Hands a chat message to the encrypted-chat layer for encryption and broadcast.
    pub fn send_chat(&mut self, text: &str) {
        let chat_events = self.encrypted_chat.send_message(text);
        self.apply_chat_events(chat_events);
    }

    /// Re-requests authentication from a participant that never completed it.
    pub fn confirm_participant(&mut self, username: &str) {
        let Some(participant) = self.participants.get_mut(username) else {
            return;
        };
        if participant.authentication_status != AuthenticationStatus::Unauthenticated {
            return;
        }
        participant.authentication_status = AuthenticationStatus::AuthenticatingWithNonce;
        let peer_long_term_public_key = participant.long_term_public_key;
        let peer_ephemeral_public_key = participant.ephemeral_public_key;

        let payload = message::AuthenticationRequest {
            sender_long_term_public_key: self.long_term_public_key,
            sender_ephemeral_public_key: self.ephemeral_public_key,
            peer_username: username.to_string(),
            peer_long_term_public_key,
            peer_ephemeral_public_key,
            nonce: self.authentication_nonce,
        };
        self.broadcast(MessageType::AuthenticationRequest, &payload);
    }

    /// Broadcasts a signed authorization for the named participant, unless the symmetric
    /// obligation between us is already discharged.
    pub fn authorize(&mut self, username: &str) {
        if username == self.username {
            return;
        }
        let payload = {
            let Some(participant) = self.participants.get(username) else {
                return;
            };
            let Some(me) = self.participants.get(&self.username) else {
                return;
            };

            if me.authorized {
                if participant.authorized {
                    return;
                }
                if participant.authorized_by.contains(&self.username) {
                    return;
                }
            } else {
                if !participant.authorized {
                    return;
                }
                if me.authorized_peers.contains(username) {
                    return;
                }
            }

            message::Authorization {
                username: participant.username.clone(),
                long_term_public_key: participant.long_term_public_key,
                ephemeral_public_key: participant.ephemeral_public_key,
                authorization_nonce: participant.authorization_nonce,
            }
        };
        self.broadcast_signed(MessageType::Authorization, &payload);
    }

    /// Produces the status snapshot message answering a search by `searcher_username` with
    /// `searcher_nonce`. With an empty searcher and a zero nonce this is the snapshot fed
    /// into the status-hash chain.
    pub fn channel_status(&self, searcher_username: &str, searcher_nonce: Hash) -> Message {
        let payload = self.status_payload(searcher_username, searcher_nonce);
        Message::encode(MessageType::ChannelStatus, &payload)
            .expect("status snapshot is always encodable")
    }

    /// Entry point for every broadcast observed on the channel.
    ///
    /// The status-hash chain is updated for every message, valid or not, before any
    /// dispatching; this keeps all honest views of history identical.
    pub fn message_received(&mut self, sender: &str, message: &Message) {
        self.hash_message(sender, message);

        match message.message_type {
            MessageType::ChannelSearch => self.on_channel_search(sender, message),
            MessageType::ChannelStatus => self.on_channel_status(sender, message),
            MessageType::ChannelAnnouncement => self.on_channel_announcement(sender, message),
            MessageType::JoinRequest => self.on_join_request(sender, message),
            MessageType::AuthenticationRequest => self.on_authentication_request(sender, message),
            MessageType::Authentication => self.on_authentication(sender, message),
            MessageType::Authorization => self.on_authorization(sender, message),
            MessageType::ConsistencyStatus => self.on_consistency_status(sender),
            MessageType::ConsistencyCheck => self.on_consistency_check(sender, message),
            MessageType::KeyExchangePublicKey => self.on_key_exchange_public_key(sender, message),
            MessageType::KeyExchangeSecretShare => self.on_key_exchange_secret_share(sender, message),
            MessageType::KeyExchangeAcceptance => self.on_key_exchange_acceptance(sender, message),
            MessageType::KeyExchangeReveal => self.on_key_exchange_reveal(sender, message),
            MessageType::KeyActivation => self.on_key_activation(sender, message),
            MessageType::Chat => self.on_chat(sender, message),
        }
    }

    /// Entry point for a transport-level departure.
    pub fn user_left(&mut self, username: &str) {
        self.hash_payload(username, USER_LEFT_TYPE_BYTE, b"left");
        self.remove_user(username);
    }

    /// Removes a participant: explicit kick or consistency failure.
    pub fn remove_user(&mut self, username: &str) {
        self.remove_users(&BTreeSet::from([username.to_string()]));
    }

    /// Removes a set of participants, purging them from every witness set and every pending
    /// event, then re-checking whether a blocked promotion became possible.
    pub fn remove_users(&mut self, usernames: &BTreeSet<String>) {
        for username in usernames {
            if self.participants.contains_key(username) {
                self.do_remove_user(username);
            }
        }

        // A departed peer may have been the last one blocking a promotion.
        let unauthorized: Vec<String> = self
            .participants
            .values()
            .filter(|p| !p.authorized)
            .map(|p| p.username.clone())
            .collect();
        for username in unauthorized {
            if self.try_promote_unauthorized_participant(&username) {
                let long_term_public_key = self.participants[&username].long_term_public_key;
                let chat_events = self
                    .encrypted_chat
                    .do_add_user(&username, long_term_public_key);
                self.apply_chat_events(chat_events);
                break;
            }
        }

        let chat_events = self.encrypted_chat.remove_users(usernames);
        self.apply_chat_events(chat_events);
    }

    fn on_channel_search(&mut self, sender: &str, message: &Message) {
        let Ok(search) = message.decode::<message::ChannelSearch>() else {
            return;
        };

        let all_users: BTreeSet<String> = self.participants.keys().cloned().collect();

        self.events
            .push_back(Event::ConsistencyCheck(ConsistencyCheckEvent {
                channel_status_hash: self.channel_status_hash,
                remaining_users: all_users.clone(),
            }));

        if self.active {
            let check = message::ConsistencyCheck {
                channel_status_hash: self.channel_status_hash,
            };
            self.broadcast_signed(MessageType::ConsistencyCheck, &check);
        }

        let reply = self.channel_status(sender, search.nonce);

        self.events.push_back(Event::ChannelStatus(ChannelStatusEvent {
            searcher_username: sender.to_string(),
            searcher_nonce: search.nonce,
            status_message_hash: reply.payload_hash(),
            remaining_users: all_users,
        }));

        if self.active {
            self.send_message(reply);
        }
    }

    fn on_channel_status(&mut self, sender: &str, message: &Message) {
        let Ok(status) = message.decode::<message::ChannelStatus>() else {
            return;
        };

        let matching = self.first_user_event_index(sender).filter(|index| {
            match &self.events[*index] {
                Event::ChannelStatus(event) => {
                    event.searcher_username == status.searcher_username
                        && event.searcher_nonce == status.searcher_nonce
                        && event.status_message_hash == message.payload_hash()
                }
                _ => false,
            }
        });
        let Some(index) = matching else {
            warn!(sender, "channel status does not match the pending event");
            self.remove_user(sender);
            return;
        };

        self.acknowledge_event(index, sender);
    }

    fn on_channel_announcement(&mut self, sender: &str, message: &Message) {
        if message.decode::<message::ChannelAnnouncement>().is_err() {
            return;
        }

        // Announcements are only valid from outsiders.
        if self.participants.contains_key(sender) {
            self.remove_user(sender);
        }
    }

    fn on_join_request(&mut self, sender: &str, message: &Message) {
        let Ok(request) = message.decode::<message::JoinRequest>() else {
            return;
        };

        self.remove_user(sender);

        // A join request naming none of our participants concerns another channel instance
        // in the same room.
        let ours = request
            .peer_usernames
            .iter()
            .any(|username| self.participants.contains_key(username));
        if !ours {
            return;
        }

        let authentication_status = if sender == self.username {
            AuthenticationStatus::Authenticated
        } else if !self.active {
            AuthenticationStatus::AuthenticatingWithNonce
        } else {
            AuthenticationStatus::Authenticating
        };

        self.participants.insert(
            sender.to_string(),
            Participant {
                username: sender.to_string(),
                long_term_public_key: request.long_term_public_key,
                ephemeral_public_key: request.ephemeral_public_key,
                authorization_nonce: self.channel_status_hash,
                authorized: false,
                authentication_status,
                authorized_by: BTreeSet::new(),
                authorized_peers: BTreeSet::new(),
            },
        );

        if authentication_status == AuthenticationStatus::AuthenticatingWithNonce {
            let payload = message::AuthenticationRequest {
                sender_long_term_public_key: self.long_term_public_key,
                sender_ephemeral_public_key: self.ephemeral_public_key,
                peer_username: sender.to_string(),
                peer_long_term_public_key: request.long_term_public_key,
                peer_ephemeral_public_key: request.ephemeral_public_key,
                nonce: self.authentication_nonce,
            };
            self.broadcast(MessageType::AuthenticationRequest, &payload);
        }

        self.notify(|observer| observer.user_joined(sender));

        if sender == self.username {
            self.self_joined();
        }
    }

    fn on_authentication_request(&mut self, sender: &str, message: &Message) {
        let Ok(request) = message.decode::<message::AuthenticationRequest>() else {
            return;
        };

        if !self.active {
            return;
        }

        if request.peer_username == self.username
            && request.peer_long_term_public_key == self.long_term_public_key
            && request.peer_ephemeral_public_key == self.ephemeral_public_key
        {
            self.authenticate_to(
                sender,
                request.sender_long_term_public_key,
                request.sender_ephemeral_public_key,
                request.nonce,
            );
        }
    }

    fn on_authentication(&mut self, sender: &str, message: &Message) {
        let Ok(authentication) = message.decode::<message::Authentication>() else {
            return;
        };

        if !(authentication.peer_username == self.username
            && authentication.peer_long_term_public_key == self.long_term_public_key
            && authentication.peer_ephemeral_public_key == self.ephemeral_public_key)
        {
            return;
        }

        let Some(participant) = self.participants.get(sender) else {
            return;
        };
        if !(authentication.sender_long_term_public_key == participant.long_term_public_key
            && authentication.sender_ephemeral_public_key == participant.ephemeral_public_key)
        {
            return;
        }

        match participant.authentication_status {
            AuthenticationStatus::Authenticating => {
                if authentication.nonce != participant.authorization_nonce {
                    return;
                }
            }
            AuthenticationStatus::AuthenticatingWithNonce => {
                if authentication.nonce != participant.authorization_nonce
                    && authentication.nonce != self.authentication_nonce
                {
                    return;
                }
            }
            _ => return,
        }

        let long_term_public_key = participant.long_term_public_key;
        let correct_token = self.authentication_token(
            sender,
            &participant.long_term_public_key,
            &participant.ephemeral_public_key,
            &authentication.nonce,
            true,
        );

        let participant = self
            .participants
            .get_mut(sender)
            .expect("participant checked above");
        if authentication.authentication_confirmation == correct_token {
            participant.authentication_status = AuthenticationStatus::Authenticated;
            self.notify(|observer| observer.user_authenticated(sender, long_term_public_key));
        } else {
            participant.authentication_status = AuthenticationStatus::AuthenticationFailed;
            warn!(sender, "authentication token mismatch");
            self.notify(|observer| observer.user_authentication_failed(sender));
        }
    }

    fn on_authorization(&mut self, sender: &str, message: &Message) {
        if !self.participants.contains_key(sender) {
            return;
        }
        let Some(authorization) = self.decode_signed_from::<message::Authorization>(sender, message)
        else {
            return;
        };

        let subject = authorization.username.as_str();
        let Some(subject_participant) = self.participants.get(subject) else {
            return;
        };
        if !(subject_participant.long_term_public_key == authorization.long_term_public_key
            && subject_participant.ephemeral_public_key == authorization.ephemeral_public_key
            && subject_participant.authorization_nonce == authorization.authorization_nonce)
        {
            return;
        }

        // Exactly one endpoint of the authorization must already be authorized; the other
        // records the witness.
        let sender_authorized = self.participants[sender].authorized;
        let subject_authorized = subject_participant.authorized;
        let (authorized_name, unauthorized_name) = if sender_authorized {
            if subject_authorized {
                return;
            }
            (sender.to_string(), subject.to_string())
        } else {
            if !subject_authorized {
                return;
            }
            (subject.to_string(), sender.to_string())
        };

        let witness_from_sender = authorized_name == sender;
        let unauthorized_participant = self
            .participants
            .get_mut(&unauthorized_name)
            .expect("unauthorized endpoint is a participant");
        if witness_from_sender {
            unauthorized_participant
                .authorized_by
                .insert(authorized_name);
        } else {
            unauthorized_participant
                .authorized_peers
                .insert(authorized_name);
        }

        self.notify(|observer| observer.user_authorized_by(sender, subject));

        if self.try_promote_unauthorized_participant(&unauthorized_name) {
            let long_term_public_key = self.participants[&unauthorized_name].long_term_public_key;
            let chat_events = self
                .encrypted_chat
                .add_user(&unauthorized_name, long_term_public_key);
            self.apply_chat_events(chat_events);
        }
    }

    fn on_consistency_status(&mut self, sender: &str) {
        if !self.participants.contains_key(sender) {
            return;
        }

        if self.active && sender == self.username {
            let check = message::ConsistencyCheck {
                channel_status_hash: self.channel_status_hash,
            };
            self.broadcast_signed(MessageType::ConsistencyCheck, &check);
        }

        self.events
            .push_back(Event::ConsistencyCheck(ConsistencyCheckEvent {
                channel_status_hash: self.channel_status_hash,
                remaining_users: BTreeSet::from([sender.to_string()]),
            }));
    }

    fn on_consistency_check(&mut self, sender: &str, message: &Message) {
        if !self.participants.contains_key(sender) {
            return;
        }
        let Some(check) = self.decode_signed_from::<message::ConsistencyCheck>(sender, message)
        else {
            return;
        };

        let matching = self.first_user_event_index(sender).filter(|index| {
            match &self.events[*index] {
                Event::ConsistencyCheck(event) => {
                    event.channel_status_hash == check.channel_status_hash
                }
                _ => false,
            }
        });
        let Some(index) = matching else {
            warn!(sender, "consistency check does not match the pending event");
            self.remove_user(sender);
            return;
        };

        self.acknowledge_event(index, sender);
    }

    fn on_key_exchange_public_key(&mut self, sender: &str, message: &Message) {
        let Some(payload) = self.decode_signed_from::<message::KeyExchangePublicKey>(sender, message)
        else {
            return;
        };
        if !self.match_key_event(sender, KeyEventKind::PublicKey, &payload.key_id) {
            return;
        }

        let chat_events =
            self.encrypted_chat
                .user_public_key(sender, &payload.key_id, payload.public_key);
        self.apply_chat_events(chat_events);
    }

    fn on_key_exchange_secret_share(&mut self, sender: &str, message: &Message) {
        let Some(payload) =
            self.decode_signed_from::<message::KeyExchangeSecretShare>(sender, message)
        else {
            return;
        };
        if !self.match_key_event(sender, KeyEventKind::SecretShare, &payload.key_id) {
            return;
        }

        if !self.encrypted_chat.have_key_exchange(&payload.key_id) {
            return;
        }
        let chat_events = self.encrypted_chat.user_secret_share(
            sender,
            &payload.key_id,
            payload.group_hash,
            payload.secret_share,
        );
        self.apply_chat_events(chat_events);
    }

    fn on_key_exchange_acceptance(&mut self, sender: &str, message: &Message) {
        let Some(payload) =
            self.decode_signed_from::<message::KeyExchangeAcceptance>(sender, message)
        else {
            return;
        };
        if !self.match_key_event(sender, KeyEventKind::Acceptance, &payload.key_id) {
            return;
        }

        if !self.encrypted_chat.have_key_exchange(&payload.key_id) {
            return;
        }
        let chat_events =
            self.encrypted_chat
                .user_key_hash(sender, &payload.key_id, payload.key_hash);
        self.apply_chat_events(chat_events);
    }

    fn on_key_exchange_reveal(&mut self, sender: &str, message: &Message) {
        let Some(payload) = self.decode_signed_from::<message::KeyExchangeReveal>(sender, message)
        else {
            return;
        };
        if !self.match_key_event(sender, KeyEventKind::Reveal, &payload.key_id) {
            return;
        }

        if !self.encrypted_chat.have_key_exchange(&payload.key_id) {
            return;
        }
        let chat_events =
            self.encrypted_chat
                .user_private_key(sender, &payload.key_id, payload.private_key);
        self.apply_chat_events(chat_events);
    }

    fn on_key_activation(&mut self, sender: &str, message: &Message) {
        let Some(payload) = self.decode_signed_from::<message::KeyActivation>(sender, message)
        else {
            return;
        };
        if !self.match_key_event(sender, KeyEventKind::Activation, &payload.key_id) {
            return;
        }

        if self.encrypted_chat.have_session(&payload.key_id) {
            let chat_events = self.encrypted_chat.user_activation(sender, &payload.key_id);
            self.apply_chat_events(chat_events);
        }
    }

    fn on_chat(&mut self, sender: &str, message: &Message) {
        let Ok(chat) = message.decode::<message::Chat>() else {
            return;
        };
        let chat_events = self.encrypted_chat.decrypt_message(sender, &chat);
        self.apply_chat_events(chat_events);
    }

    /// The local user's own join request came back on the broadcast: we are now part of the
    /// channel and authenticate to everyone.
    fn self_joined(&mut self) {
        self.joined = true;

        let peers: Vec<(String, PublicKey, PublicKey)> = self
            .participants
            .values()
            .filter(|p| p.username != self.username)
            .map(|p| {
                (
                    p.username.clone(),
                    p.long_term_public_key,
                    p.ephemeral_public_key,
                )
            })
            .collect();
        let nonce = self.channel_status_hash;
        for (username, long_term_public_key, ephemeral_public_key) in peers {
            self.authenticate_to(&username, long_term_public_key, ephemeral_public_key, nonce);
        }

        self.notify(|observer| observer.joined());
    }

    /// Promotes the participant if, for every authorized peer, the symmetric authorization
    /// obligation is discharged in both directions.
    fn try_promote_unauthorized_participant(&mut self, username: &str) -> bool {
        let authorized_usernames: Vec<String> = self
            .participants
            .values()
            .filter(|p| p.authorized)
            .map(|p| p.username.clone())
            .collect();

        let Some(participant) = self.participants.get_mut(username) else {
            return false;
        };
        debug_assert!(!participant.authorized);

        for peer in &authorized_usernames {
            if !participant.authorized_by.contains(peer)
                || !participant.authorized_peers.contains(peer)
            {
                return false;
            }
        }

        participant.authorized = true;
        participant.authorized_by.clear();
        participant.authorized_peers.clear();
        debug!(username, "participant promoted to authorized");

        let is_self = username == self.username;
        if is_self {
            self.authorized = true;
        }

        self.notify(|observer| observer.user_promoted(username));
        if is_self {
            self.notify(|observer| observer.authorized());
        }

        true
    }

    fn do_remove_user(&mut self, username: &str) {
        debug!(username, "removing user from channel");

        self.participants.remove(username);
        for participant in self.participants.values_mut() {
            if !participant.authorized {
                participant.authorized_by.remove(username);
                participant.authorized_peers.remove(username);
            }
        }

        self.events.retain_mut(|event| {
            event.remaining_users_mut().remove(username);
            !event.remaining_users().is_empty()
        });

        self.notify(|observer| observer.user_left(username));
    }

    /// The oldest pending event still listing the given user; what the channel expects from
    /// them next.
    fn first_user_event_index(&self, username: &str) -> Option<usize> {
        self.events
            .iter()
            .position(|event| event.remaining_users().contains(username))
    }

    fn acknowledge_event(&mut self, index: usize, username: &str) {
        let event = &mut self.events[index];
        event.remaining_users_mut().remove(username);
        if event.remaining_users().is_empty() {
            self.events.remove(index);
        }
    }

    /// Matches a key-exchange reply against the sender's oldest pending event and consumes
    /// it. A mismatch is a protocol-ordering violation and removes the sender.
    fn match_key_event(&mut self, sender: &str, kind: KeyEventKind, key_id: &Hash) -> bool {
        let matching = self.first_user_event_index(sender).filter(|index| {
            matches!(
                &self.events[*index],
                Event::Key(event) if event.kind == kind && event.key_id == *key_id
            )
        });
        let Some(index) = matching else {
            warn!(sender, ?kind, "key event does not match the pending event");
            self.remove_user(sender);
            return false;
        };

        self.acknowledge_event(index, sender);
        true
    }

    fn decode_signed_from<P: for<'a> serde::Deserialize<'a>>(
        &mut self,
        sender: &str,
        message: &Message,
    ) -> Option<P> {
        let ephemeral_public_key = self.participants.get(sender)?.ephemeral_public_key;
        match message.decode_signed::<P>(&ephemeral_public_key) {
            Ok(payload) => Some(payload),
            Err(SignedDecodeError::Decode(_)) => None,
            Err(SignedDecodeError::InvalidSignature) => {
                warn!(sender, message_type = ?message.message_type, "invalid message signature");
                self.remove_user(sender);
                None
            }
        }
    }

    /// Sends an authentication to the given peer, proving control over our key pair for the
    /// given nonce.
    fn authenticate_to(
        &mut self,
        username: &str,
        long_term_public_key: PublicKey,
        ephemeral_public_key: PublicKey,
        nonce: Hash,
    ) {
        let token = self.authentication_token(
            username,
            &long_term_public_key,
            &ephemeral_public_key,
            &nonce,
            false,
        );
        let payload = message::Authentication {
            sender_long_term_public_key: self.long_term_public_key,
            sender_ephemeral_public_key: self.ephemeral_public_key,
            peer_username: username.to_string(),
            peer_long_term_public_key: long_term_public_key,
            peer_ephemeral_public_key: ephemeral_public_key,
            nonce,
            authentication_confirmation: token,
        };
        self.broadcast(MessageType::Authentication, &payload);
    }

    /// The triple-DH authentication token for a peer and nonce.
    ///
    /// The token binds the receiving side's identity: when computing a token to send,
    /// `for_peer` is false and our own identity is bound; when verifying a received token it
    /// is true and the peer's identity is bound. The triple-DH secret itself is symmetric.
    fn authentication_token(
        &self,
        username: &str,
        long_term_public_key: &PublicKey,
        ephemeral_public_key: &PublicKey,
        nonce: &Hash,
        for_peer: bool,
    ) -> Hash {
        let shared_secret = triple_diffie_hellman(
            &self.long_term_secret_key,
            &self.ephemeral_secret_key,
            long_term_public_key,
            ephemeral_public_key,
        );
        let (directed_key, directed_username) = if for_peer {
            (long_term_public_key, username)
        } else {
            (&self.long_term_public_key, self.username.as_str())
        };
        Hash::from_bytes(sha2_256(&[
            &shared_secret,
            nonce.as_bytes(),
            directed_key.as_bytes(),
            directed_username.as_bytes(),
        ]))
    }

    fn status_payload(
        &self,
        searcher_username: &str,
        searcher_nonce: Hash,
    ) -> message::ChannelStatus {
        let mut participants = Vec::new();
        let mut unauthorized_participants = Vec::new();
        for p in self.participants.values() {
            if p.authorized {
                participants.push(message::StatusParticipant {
                    username: p.username.clone(),
                    long_term_public_key: p.long_term_public_key,
                    ephemeral_public_key: p.ephemeral_public_key,
                    authorization_nonce: p.authorization_nonce,
                });
            } else {
                unauthorized_participants.push(message::StatusUnauthorizedParticipant {
                    username: p.username.clone(),
                    long_term_public_key: p.long_term_public_key,
                    ephemeral_public_key: p.ephemeral_public_key,
                    authorization_nonce: p.authorization_nonce,
                    authorized_by: p.authorized_by.clone(),
                    authorized_peers: p.authorized_peers.clone(),
                });
            }
        }

        let events = self
            .events
            .iter()
            .map(|event| match event {
                Event::ChannelStatus(event) => StatusEvent::ChannelStatus {
                    searcher_username: event.searcher_username.clone(),
                    searcher_nonce: event.searcher_nonce,
                    status_message_hash: event.status_message_hash,
                    remaining_users: event.remaining_users.clone(),
                },
                Event::ConsistencyCheck(event) => StatusEvent::ConsistencyCheck {
                    channel_status_hash: event.channel_status_hash,
                    remaining_users: event.remaining_users.clone(),
                },
                Event::Key(event) if event.kind == KeyEventKind::Activation => {
                    StatusEvent::KeyActivation {
                        key_id: event.key_id,
                        remaining_users: event.remaining_users.clone(),
                    }
                }
                Event::Key(event) => StatusEvent::KeyExchange {
                    kind: event.kind,
                    key_id: event.key_id,
                    cancelled: !self.encrypted_chat.have_key_exchange(&event.key_id),
                    remaining_users: event.remaining_users.clone(),
                },
            })
            .collect();

        message::ChannelStatus {
            searcher_username: searcher_username.to_string(),
            searcher_nonce,
            channel_status_hash: self.channel_status_hash,
            participants,
            unauthorized_participants,
            key_exchanges: self.encrypted_chat.encode_key_exchanges(),
            events,
        }
    }

    fn hash_message(&mut self, sender: &str, message: &Message) {
        self.hash_payload(sender, message.message_type.to_byte(), &message.payload);
    }

    /// Folds one observed broadcast into the status-hash chain. The snapshot of our entire
    /// state (with zeroed searcher fields) is part of the preimage, so the chain commits to
    /// the full channel history, not just the message stream.
    fn hash_payload(&mut self, sender: &str, type_byte: u8, payload: &[u8]) {
        let snapshot = self.channel_status("", Hash::zero());
        self.channel_status_hash = Hash::from_bytes(sha2_256(&[
            &snapshot.payload,
            sender.as_bytes(),
            &[type_byte],
            payload,
        ]));
    }

    fn apply_chat_events(&mut self, chat_events: Vec<ChatEvent>) {
        for chat_event in chat_events {
            match chat_event {
                ChatEvent::Broadcast(message) => self.send_message(message),
                ChatEvent::BroadcastSigned {
                    message_type,
                    payload,
                } => {
                    match Message::sign_encoded(
                        message_type,
                        payload,
                        &self.ephemeral_secret_key,
                        &self.rng,
                    ) {
                        Ok(message) => self.send_message(message),
                        Err(err) => {
                            warn!(%err, ?message_type, "failed to sign encrypted-chat message")
                        }
                    }
                }
                ChatEvent::KeyExchangeEvent {
                    kind,
                    key_id,
                    remaining_users,
                } => self.events.push_back(Event::Key(KeyEvent {
                    kind,
                    key_id,
                    remaining_users,
                })),
                ChatEvent::KeyActivationEvent {
                    key_id,
                    remaining_users,
                } => self.events.push_back(Event::Key(KeyEvent {
                    kind: KeyEventKind::Activation,
                    key_id,
                    remaining_users,
                })),
            }
        }
    }

    fn schedule_status_timer(&mut self) {
        self.timer_guard = Some(self.timer.schedule(self.config.status_interval));
    }

    fn send_message(&mut self, message: Message) {
        self.outbox.push_back(message);
    }

    fn broadcast<P: Serialize>(&mut self, message_type: MessageType, payload: &P) {
        match Message::encode(message_type, payload) {
            Ok(message) => self.send_message(message),
            Err(err) => warn!(%err, ?message_type, "failed to encode outbound message"),
        }
    }

    fn broadcast_signed<P: Serialize>(&mut self, message_type: MessageType, payload: &P) {
        match Message::encode_signed(message_type, payload, &self.ephemeral_secret_key, &self.rng)
        {
            Ok(message) => self.send_message(message),
            Err(err) => warn!(%err, ?message_type, "failed to sign outbound message"),
        }
    }

    fn notify(&mut self, f: impl FnOnce(&mut dyn ChannelObserver)) {
        if let Some(observer) = self.observer.as_deref_mut() {
            f(observer);
        }
    }
}
