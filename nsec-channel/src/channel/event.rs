// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pending per-peer obligations.
//!
//! Whenever a broadcast demands acknowledgement from a set of peers, the channel records an
//! event carrying that peer set. Peers must answer their outstanding events in the order the
//! events were recorded; the oldest event still listing a peer defines what the channel
//! expects from them next. An event is dropped the moment its remaining-user set empties.
use std::collections::BTreeSet;

use crate::hash::Hash;
use crate::message::{KeyEventKind, MessageType};

/// A pending obligation for a set of peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A channel-status reply was broadcast (or observed); each listed peer owes a matching
    /// status message.
    ChannelStatus(ChannelStatusEvent),

    /// Each listed peer owes a consistency check over the same status hash.
    ConsistencyCheck(ConsistencyCheckEvent),

    /// Each listed peer owes a key-exchange round or key activation for the same key id.
    Key(KeyEvent),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelStatusEvent {
    pub searcher_username: String,
    pub searcher_nonce: Hash,
    pub status_message_hash: Hash,
    pub remaining_users: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsistencyCheckEvent {
    pub channel_status_hash: Hash,
    pub remaining_users: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyEvent {
    pub kind: KeyEventKind,
    pub key_id: Hash,
    pub remaining_users: BTreeSet<String>,
}

impl Event {
    /// The wire message type a reply to this event must carry.
    pub fn message_type(&self) -> MessageType {
        match self {
            Event::ChannelStatus(_) => MessageType::ChannelStatus,
            Event::ConsistencyCheck(_) => MessageType::ConsistencyCheck,
            Event::Key(event) => event.kind.message_type(),
        }
    }

    pub fn remaining_users(&self) -> &BTreeSet<String> {
        match self {
            Event::ChannelStatus(event) => &event.remaining_users,
            Event::ConsistencyCheck(event) => &event.remaining_users,
            Event::Key(event) => &event.remaining_users,
        }
    }

    pub fn remaining_users_mut(&mut self) -> &mut BTreeSet<String> {
        match self {
            Event::ChannelStatus(event) => &mut event.remaining_users,
            Event::ConsistencyCheck(event) => &mut event.remaining_users,
            Event::Key(event) => &mut event.remaining_users,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::hash::Hash;
    use crate::message::KeyEventKind;

    use super::{Event, KeyEvent};

    #[test]
    fn shared_remaining_users_accessor() {
        let mut event = Event::Key(KeyEvent {
            kind: KeyEventKind::PublicKey,
            key_id: Hash::zero(),
            remaining_users: BTreeSet::from(["alice".to_string(), "bob".to_string()]),
        });

        event.remaining_users_mut().remove("alice");
        assert_eq!(
            event.remaining_users(),
            &BTreeSet::from(["bob".to_string()])
        );
    }
}
