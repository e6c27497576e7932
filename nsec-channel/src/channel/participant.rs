// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-participant state tracked by the channel.
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::crypto::x25519::PublicKey;
use crate::hash::Hash;

/// Where a participant stands in proving control over their key pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthenticationStatus {
    /// No authentication traffic exchanged yet.
    Unauthenticated,

    /// We expect an unprompted authentication using the participant's authorization nonce.
    Authenticating,

    /// We sent an authentication request carrying our own authentication nonce; a reply may
    /// use either nonce.
    AuthenticatingWithNonce,

    /// The authentication token verified.
    Authenticated,

    /// The authentication token did not verify.
    AuthenticationFailed,
}

/// A participant of the channel.
///
/// `authorized_by` holds the already-authorized peers who vouched for this participant;
/// `authorized_peers` holds the already-authorized peers this participant vouched for in turn.
/// Both sets are only populated while `authorized` is false and are cleared on promotion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Participant {
    pub username: String,
    pub long_term_public_key: PublicKey,
    pub ephemeral_public_key: PublicKey,
    /// The channel-status hash at the moment this participant was inserted or learned about.
    pub authorization_nonce: Hash,
    pub authorized: bool,
    pub authentication_status: AuthenticationStatus,
    pub authorized_by: BTreeSet<String>,
    pub authorized_peers: BTreeSet<String>,
}

impl Participant {
    pub fn is_authenticated(&self) -> bool {
        self.authentication_status == AuthenticationStatus::Authenticated
    }
}
