// SPDX-License-Identifier: MIT OR Apache-2.0

//! Capability boundaries of the channel.
//!
//! The channel is a single-threaded state machine; everything it needs from the outside world
//! is injected through these traits. The encrypted-chat layer performs the group key agreement
//! and payload encryption, the observer receives fire-and-forget notifications, and the timer
//! capability schedules the periodic consistency prompt.
use std::collections::BTreeSet;
use std::time::Duration;

use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::hash::Hash;
use crate::message::{Chat, KeyEventKind, KeyExchangeState, Message};

/// Outcome of an encrypted-chat operation, handed back to the channel.
///
/// The chat layer never touches the transport or the event queue directly; whatever a call
/// produces is returned as a list of these and applied by the channel.
#[derive(Clone, Debug)]
pub enum ChatEvent {
    /// A message to broadcast to the room.
    Broadcast(Message),

    /// An encoded payload the channel signs with its ephemeral conversation key before
    /// broadcasting; key-exchange rounds travel this way.
    BroadcastSigned {
        message_type: crate::message::MessageType,
        payload: Vec<u8>,
    },

    /// A key-exchange round was initiated or advanced; the channel records the peers who still
    /// owe a reply.
    KeyExchangeEvent {
        kind: KeyEventKind,
        key_id: Hash,
        remaining_users: BTreeSet<String>,
    },

    /// A key is ready for activation; the channel records the peers who still owe a
    /// [`KeyActivation`](crate::message::KeyActivation).
    KeyActivationEvent {
        key_id: Hash,
        remaining_users: BTreeSet<String>,
    },
}

/// The group key-agreement and encryption collaborator.
///
/// The channel owns its instance exclusively and forwards validated key-exchange traffic into
/// it; everything about the ratchet itself stays behind this boundary.
pub trait EncryptedChat {
    /// Sets up a session for a channel whose only participant is the local user.
    fn create_solo_session(&mut self) -> Vec<ChatEvent>;

    /// Adds a user without scheduling a key exchange (replay or departure-triggered
    /// promotion).
    fn do_add_user(&mut self, username: &str, long_term_public_key: PublicKey) -> Vec<ChatEvent>;

    /// Adds a user and schedules a key exchange including them.
    fn add_user(&mut self, username: &str, long_term_public_key: PublicKey) -> Vec<ChatEvent>;

    /// Removes users and rotates accordingly.
    fn remove_users(&mut self, usernames: &BTreeSet<String>) -> Vec<ChatEvent>;

    /// Whether a key exchange with this id is currently in flight.
    fn have_key_exchange(&self, key_id: &Hash) -> bool;

    /// Whether a session with this key id exists.
    fn have_session(&self, key_id: &Hash) -> bool;

    /// Restores an in-flight key exchange from a status snapshot.
    fn unserialize_key_exchange(
        &mut self,
        exchange: &KeyExchangeState,
    ) -> Result<Vec<ChatEvent>, crate::cbor::DecodeError>;

    /// Serializes all in-flight key exchanges for a status snapshot.
    fn encode_key_exchanges(&self) -> Vec<KeyExchangeState>;

    /// A validated key-exchange public key from a peer.
    fn user_public_key(
        &mut self,
        sender: &str,
        key_id: &Hash,
        public_key: PublicKey,
    ) -> Vec<ChatEvent>;

    /// A validated secret share from a peer.
    fn user_secret_share(
        &mut self,
        sender: &str,
        key_id: &Hash,
        group_hash: Hash,
        secret_share: Hash,
    ) -> Vec<ChatEvent>;

    /// A validated key-hash acceptance from a peer.
    fn user_key_hash(&mut self, sender: &str, key_id: &Hash, key_hash: Hash) -> Vec<ChatEvent>;

    /// A validated private-key reveal from a peer.
    fn user_private_key(
        &mut self,
        sender: &str,
        key_id: &Hash,
        private_key: SecretKey,
    ) -> Vec<ChatEvent>;

    /// A validated key activation from a peer.
    fn user_activation(&mut self, sender: &str, key_id: &Hash) -> Vec<ChatEvent>;

    /// An encrypted chat message to decrypt and deliver.
    fn decrypt_message(&mut self, sender: &str, message: &Chat) -> Vec<ChatEvent>;

    /// Encrypts and emits a chat message from the local user.
    fn send_message(&mut self, text: &str) -> Vec<ChatEvent>;
}

/// Fire-and-forget notifications towards the user interface.
///
/// All methods default to doing nothing, so observers implement only what they present. The
/// channel never blocks on an observer.
pub trait ChannelObserver {
    /// The local user is now part of the participant table.
    fn joined(&mut self) {}

    /// The local user passed the authorization quorum.
    fn authorized(&mut self) {}

    fn user_joined(&mut self, _username: &str) {}

    fn user_authenticated(&mut self, _username: &str, _long_term_public_key: PublicKey) {}

    fn user_authentication_failed(&mut self, _username: &str) {}

    /// `authorizer` signed an authorization concerning `subject`.
    fn user_authorized_by(&mut self, _authorizer: &str, _subject: &str) {}

    /// A participant passed the authorization quorum.
    fn user_promoted(&mut self, _username: &str) {}

    fn user_left(&mut self, _username: &str) {}
}

/// Schedules the periodic consistency-status callback.
///
/// `schedule` returns a guard; dropping the guard cancels the pending callback. The embedder
/// invokes [`Channel::status_timer_fired`](crate::channel::Channel::status_timer_fired) when
/// its timer elapses.
pub trait StatusTimer {
    type Guard;

    fn schedule(&mut self, after: Duration) -> Self::Guard;
}
