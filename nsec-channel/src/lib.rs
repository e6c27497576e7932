// SPDX-License-Identifier: MIT OR Apache-2.0

//! `nsec-channel` implements the channel core of the (n+1)sec multiparty off-the-record
//! secure group-messaging protocol: participant tracking, mutual authentication and
//! authorization, causal-consistency enforcement and message dispatch for a group
//! conversation carried over an untrusted broadcast room.
//!
//! ## Model
//!
//! The room delivers `(sender, message)` broadcasts to every participant in one total order
//! but provides no secrecy, authenticity or consensus. On top of that, each member runs a
//! [`Channel`]: a single-threaded state machine holding a replicated view of who is in the
//! group, who has authorized whom, which key exchanges are in flight and what everyone has
//! seen so far. Honest members observing the same broadcast prefix hold byte-identical
//! views.
//!
//! Three mechanisms keep the view Byzantine-resistant:
//!
//! - a **status-hash chain** folds every observed broadcast (valid or not) into a running
//!   hash, a collective commitment to the channel's history;
//! - a per-peer **event queue** records which peers still owe a reply to which broadcast and
//!   demands the replies arrive in the recorded order, so nobody can contribute without
//!   having witnessed the same history;
//! - **mutual authentication and authorization**: each pair of members proves control over
//!   their key pairs through a triple Diffie-Hellman token exchange, and an unauthorized
//!   participant becomes a member only once every authorized member has vouched for them
//!   and been vouched for in return.
//!
//! ## Boundaries
//!
//! The group key agreement and payload encryption live behind the
//! [`EncryptedChat`](traits::EncryptedChat) trait; user-interface notifications behind
//! [`ChannelObserver`](traits::ChannelObserver); the periodic consistency prompt behind
//! [`StatusTimer`](traits::StatusTimer). The channel owns no sockets, threads or clocks.
//!
//! ## Security
//!
//! This crate covers conversation integrity and membership only. It does not protect
//! against an adversarial transport withholding or partitioning broadcasts, and the
//! encryption scheme itself is out of its scope.
pub mod cbor;
pub mod channel;
pub mod crypto;
pub mod hash;
pub mod message;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
pub mod traits;

pub use channel::{Channel, ChannelConfig, ChannelError};
pub use crypto::{Rng, RngError};
pub use hash::{Hash, HashError};
pub use message::{Message, MessageType};
