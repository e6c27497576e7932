// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic harness for driving channels in tests: a total-order broadcast network, a
//! scripted encrypted-chat stub, a recording observer and a counting timer.
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use crate::channel::{Channel, ChannelConfig};
use crate::crypto::Rng;
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::hash::Hash;
use crate::message::{Chat, KeyEventKind, KeyExchangeState, Message, MessageType};
use crate::traits::{ChannelObserver, ChatEvent, EncryptedChat, StatusTimer};

pub type TestChannel = Channel<TestEncryptedChat, TestTimer>;

/// A call recorded by [`TestEncryptedChat`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatCall {
    CreateSoloSession,
    DoAddUser(String),
    AddUser(String),
    RemoveUsers(BTreeSet<String>),
    UserPublicKey { sender: String, key_id: Hash },
    UserSecretShare { sender: String, key_id: Hash },
    UserKeyHash { sender: String, key_id: Hash },
    UserPrivateKey { sender: String, key_id: Hash },
    UserActivation { sender: String, key_id: Hash },
    DecryptMessage { sender: String, ciphertext: Vec<u8> },
    SendMessage(String),
}

#[derive(Debug, Default)]
struct TestEncryptedChatInner {
    my_id: String,
    users: BTreeSet<String>,
    key_exchanges: BTreeMap<Hash, KeyExchangeState>,
    sessions: BTreeSet<Hash>,
    calls: Vec<ChatCall>,
    exchange_on_add: Option<Hash>,
    events_on_send: Option<Vec<ChatEvent>>,
}

/// Scripted stand-in for the group key-agreement collaborator.
///
/// Clones share state, so tests keep a handle for scripting and assertions while the channel
/// owns its own clone.
#[derive(Clone, Debug, Default)]
pub struct TestEncryptedChat {
    inner: Rc<RefCell<TestEncryptedChatInner>>,
}

impl TestEncryptedChat {
    pub fn new(my_id: &str) -> Self {
        let chat = Self::default();
        chat.inner.borrow_mut().my_id = my_id.to_string();
        chat
    }

    /// Makes the next `add_user` call open a key exchange with this id: a public-key event
    /// listing every user of the chat is emitted, along with the local user's own signed
    /// public-key round.
    pub fn script_exchange_on_add(&self, key_id: Hash) {
        self.inner.borrow_mut().exchange_on_add = Some(key_id);
    }

    /// Makes the next `send_message` call return the given events instead of the default
    /// chat broadcast.
    pub fn script_on_send(&self, events: Vec<ChatEvent>) {
        self.inner.borrow_mut().events_on_send = Some(events);
    }

    /// Marks an exchange as finished: it disappears from the in-flight set and becomes a
    /// session.
    pub fn finish_exchange(&self, key_id: Hash) {
        let mut inner = self.inner.borrow_mut();
        inner.key_exchanges.remove(&key_id);
        inner.sessions.insert(key_id);
    }

    pub fn users(&self) -> BTreeSet<String> {
        self.inner.borrow().users.clone()
    }

    pub fn calls(&self) -> Vec<ChatCall> {
        self.inner.borrow().calls.clone()
    }

    fn record(&self, call: ChatCall) {
        self.inner.borrow_mut().calls.push(call);
    }
}

impl EncryptedChat for TestEncryptedChat {
    fn create_solo_session(&mut self) -> Vec<ChatEvent> {
        self.record(ChatCall::CreateSoloSession);
        let mut inner = self.inner.borrow_mut();
        let my_id = inner.my_id.clone();
        inner.users.insert(my_id);
        Vec::new()
    }

    fn do_add_user(&mut self, username: &str, _long_term_public_key: PublicKey) -> Vec<ChatEvent> {
        self.record(ChatCall::DoAddUser(username.to_string()));
        self.inner.borrow_mut().users.insert(username.to_string());
        Vec::new()
    }

    fn add_user(&mut self, username: &str, _long_term_public_key: PublicKey) -> Vec<ChatEvent> {
        self.record(ChatCall::AddUser(username.to_string()));
        let mut inner = self.inner.borrow_mut();
        inner.users.insert(username.to_string());

        let Some(key_id) = inner.exchange_on_add.take() else {
            return Vec::new();
        };
        inner.key_exchanges.insert(
            key_id,
            KeyExchangeState {
                key_id,
                state: Vec::new(),
            },
        );
        let payload = crate::cbor::encode(&crate::message::KeyExchangePublicKey {
            key_id,
            public_key: PublicKey::from_bytes([0; 32]),
        })
        .expect("key exchange payload is always encodable");
        vec![
            ChatEvent::KeyExchangeEvent {
                kind: KeyEventKind::PublicKey,
                key_id,
                remaining_users: inner.users.clone(),
            },
            ChatEvent::BroadcastSigned {
                message_type: MessageType::KeyExchangePublicKey,
                payload,
            },
        ]
    }

    fn remove_users(&mut self, usernames: &BTreeSet<String>) -> Vec<ChatEvent> {
        self.record(ChatCall::RemoveUsers(usernames.clone()));
        let mut inner = self.inner.borrow_mut();
        for username in usernames {
            inner.users.remove(username);
        }
        Vec::new()
    }

    fn have_key_exchange(&self, key_id: &Hash) -> bool {
        self.inner.borrow().key_exchanges.contains_key(key_id)
    }

    fn have_session(&self, key_id: &Hash) -> bool {
        self.inner.borrow().sessions.contains(key_id)
    }

    fn unserialize_key_exchange(
        &mut self,
        exchange: &KeyExchangeState,
    ) -> Result<Vec<ChatEvent>, crate::cbor::DecodeError> {
        self.inner
            .borrow_mut()
            .key_exchanges
            .insert(exchange.key_id, exchange.clone());
        Ok(Vec::new())
    }

    fn encode_key_exchanges(&self) -> Vec<KeyExchangeState> {
        self.inner.borrow().key_exchanges.values().cloned().collect()
    }

    fn user_public_key(
        &mut self,
        sender: &str,
        key_id: &Hash,
        _public_key: PublicKey,
    ) -> Vec<ChatEvent> {
        self.record(ChatCall::UserPublicKey {
            sender: sender.to_string(),
            key_id: *key_id,
        });
        Vec::new()
    }

    fn user_secret_share(
        &mut self,
        sender: &str,
        key_id: &Hash,
        _group_hash: Hash,
        _secret_share: Hash,
    ) -> Vec<ChatEvent> {
        self.record(ChatCall::UserSecretShare {
            sender: sender.to_string(),
            key_id: *key_id,
        });
        Vec::new()
    }

    fn user_key_hash(&mut self, sender: &str, key_id: &Hash, _key_hash: Hash) -> Vec<ChatEvent> {
        self.record(ChatCall::UserKeyHash {
            sender: sender.to_string(),
            key_id: *key_id,
        });
        Vec::new()
    }

    fn user_private_key(
        &mut self,
        sender: &str,
        key_id: &Hash,
        _private_key: SecretKey,
    ) -> Vec<ChatEvent> {
        self.record(ChatCall::UserPrivateKey {
            sender: sender.to_string(),
            key_id: *key_id,
        });
        Vec::new()
    }

    fn user_activation(&mut self, sender: &str, key_id: &Hash) -> Vec<ChatEvent> {
        self.record(ChatCall::UserActivation {
            sender: sender.to_string(),
            key_id: *key_id,
        });
        Vec::new()
    }

    fn decrypt_message(&mut self, sender: &str, message: &Chat) -> Vec<ChatEvent> {
        self.record(ChatCall::DecryptMessage {
            sender: sender.to_string(),
            ciphertext: message.ciphertext.clone(),
        });
        Vec::new()
    }

    fn send_message(&mut self, text: &str) -> Vec<ChatEvent> {
        self.record(ChatCall::SendMessage(text.to_string()));
        if let Some(events) = self.inner.borrow_mut().events_on_send.take() {
            return events;
        }
        // "Encryption" in tests is the identity; the channel only sees opaque bytes anyway.
        let message = Message::encode(
            MessageType::Chat,
            &Chat {
                ciphertext: text.as_bytes().to_vec(),
            },
        )
        .expect("chat payload is always encodable");
        vec![ChatEvent::Broadcast(message)]
    }
}

/// A notification recorded by [`TestObserver`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    Joined,
    Authorized,
    UserJoined(String),
    UserAuthenticated(String, PublicKey),
    UserAuthenticationFailed(String),
    UserAuthorizedBy { authorizer: String, subject: String },
    UserPromoted(String),
    UserLeft(String),
}

/// Observer recording every notification. Clones share the record.
#[derive(Clone, Debug, Default)]
pub struct TestObserver {
    notifications: Rc<RefCell<Vec<Notification>>>,
}

impl TestObserver {
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.borrow().clone()
    }

    pub fn contains(&self, notification: &Notification) -> bool {
        self.notifications.borrow().contains(notification)
    }
}

impl ChannelObserver for TestObserver {
    fn joined(&mut self) {
        self.notifications.borrow_mut().push(Notification::Joined);
    }

    fn authorized(&mut self) {
        self.notifications
            .borrow_mut()
            .push(Notification::Authorized);
    }

    fn user_joined(&mut self, username: &str) {
        self.notifications
            .borrow_mut()
            .push(Notification::UserJoined(username.to_string()));
    }

    fn user_authenticated(&mut self, username: &str, long_term_public_key: PublicKey) {
        self.notifications
            .borrow_mut()
            .push(Notification::UserAuthenticated(
                username.to_string(),
                long_term_public_key,
            ));
    }

    fn user_authentication_failed(&mut self, username: &str) {
        self.notifications
            .borrow_mut()
            .push(Notification::UserAuthenticationFailed(username.to_string()));
    }

    fn user_authorized_by(&mut self, authorizer: &str, subject: &str) {
        self.notifications
            .borrow_mut()
            .push(Notification::UserAuthorizedBy {
                authorizer: authorizer.to_string(),
                subject: subject.to_string(),
            });
    }

    fn user_promoted(&mut self, username: &str) {
        self.notifications
            .borrow_mut()
            .push(Notification::UserPromoted(username.to_string()));
    }

    fn user_left(&mut self, username: &str) {
        self.notifications
            .borrow_mut()
            .push(Notification::UserLeft(username.to_string()));
    }
}

/// Counting timer capability. Clones share the schedule record.
#[derive(Clone, Debug, Default)]
pub struct TestTimer {
    scheduled: Rc<RefCell<Vec<Duration>>>,
}

impl TestTimer {
    pub fn scheduled(&self) -> Vec<Duration> {
        self.scheduled.borrow().clone()
    }
}

impl StatusTimer for TestTimer {
    type Guard = ();

    fn schedule(&mut self, after: Duration) -> Self::Guard {
        self.scheduled.borrow_mut().push(after);
    }
}

/// Handles a test keeps on a channel's collaborators.
pub struct TestHarness {
    pub chat: TestEncryptedChat,
    pub observer: TestObserver,
    pub timer: TestTimer,
}

impl TestHarness {
    pub fn new(username: &str) -> Self {
        Self {
            chat: TestEncryptedChat::new(username),
            observer: TestObserver::default(),
            timer: TestTimer::default(),
        }
    }
}

/// Creates a solo channel for `username`, seeded deterministically, with fresh collaborator
/// handles.
pub fn solo_channel(username: &str, seed: u8) -> (TestChannel, TestHarness) {
    let rng = Rng::from_seed([seed; 32]);
    let long_term_secret_key = SecretKey::generate(&rng).unwrap();

    let harness = TestHarness::new(username);

    let mut channel = Channel::new(
        username.to_string(),
        long_term_secret_key,
        harness.chat.clone(),
        harness.timer.clone(),
        ChannelConfig::default(),
        rng,
    )
    .unwrap();
    channel.set_observer(Box::new(harness.observer.clone()));

    (channel, harness)
}

/// A deterministic total-order broadcast room.
///
/// Every queued message is delivered to every channel, including the sender's own; channels
/// learn their own broadcasts from the echo, exactly as over a real room.
#[derive(Default)]
pub struct Network {
    channels: BTreeMap<String, TestChannel>,
    queue: VecDeque<(String, Message)>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, channel: TestChannel) {
        self.channels.insert(channel.username().to_string(), channel);
    }

    pub fn channel(&self, username: &str) -> &TestChannel {
        self.channels.get(username).expect("channel exists")
    }

    pub fn channel_mut(&mut self, username: &str) -> &mut TestChannel {
        self.channels.get_mut(username).expect("channel exists")
    }

    pub fn remove(&mut self, username: &str) -> TestChannel {
        self.channels.remove(username).expect("channel exists")
    }

    /// Queues a broadcast from outside any tracked channel (a searcher, or a forged
    /// message).
    pub fn broadcast(&mut self, sender: &str, message: Message) {
        self.queue.push_back((sender.to_string(), message));
    }

    /// Moves every channel's queued outbound messages into the broadcast queue, in channel
    /// name order.
    pub fn collect_outgoing(&mut self) {
        for (username, channel) in self.channels.iter_mut() {
            for message in channel.take_outgoing() {
                self.queue.push_back((username.clone(), message));
            }
        }
    }

    /// Runs the room until no messages remain: collects outgoing broadcasts and delivers
    /// each queued message to every channel in the shared total order.
    pub fn run(&mut self) {
        loop {
            self.collect_outgoing();
            let Some((sender, message)) = self.queue.pop_front() else {
                break;
            };
            for channel in self.channels.values_mut() {
                channel.message_received(&sender, &message);
            }
        }
    }
}
