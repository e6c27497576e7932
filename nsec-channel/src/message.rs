// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire messages exchanged over the broadcast transport.
//!
//! Every message is a type byte plus a CBOR payload. Signed variants wrap their payload in a
//! [`Signed`] envelope carrying an XEdDSA signature by the sender's ephemeral conversation key
//! over the type byte and the payload bytes.
//!
//! The payload bytes of a message are also the unit of the channel-status hash chain: peers
//! fold `sender ‖ type byte ‖ payload` of every observed broadcast into their running hash,
//! whether or not the message validates.
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cbor::{self, DecodeError, EncodeError};
use crate::crypto::Rng;
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::xeddsa::{XEdDSAError, XSignature, xeddsa_sign, xeddsa_verify};
use crate::hash::Hash;

/// Wire type of a message.
///
/// The byte value of the type is chained into the channel-status hash, so it is part of the
/// protocol and must not be reassigned.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    ChannelSearch,
    ChannelStatus,
    ChannelAnnouncement,
    JoinRequest,
    AuthenticationRequest,
    Authentication,
    Authorization,
    ConsistencyStatus,
    ConsistencyCheck,
    KeyExchangePublicKey,
    KeyExchangeSecretShare,
    KeyExchangeAcceptance,
    KeyExchangeReveal,
    KeyActivation,
    Chat,
}

impl MessageType {
    pub fn to_byte(self) -> u8 {
        match self {
            MessageType::ChannelSearch => 1,
            MessageType::ChannelStatus => 2,
            MessageType::ChannelAnnouncement => 3,
            MessageType::JoinRequest => 4,
            MessageType::AuthenticationRequest => 5,
            MessageType::Authentication => 6,
            MessageType::Authorization => 7,
            MessageType::ConsistencyStatus => 8,
            MessageType::ConsistencyCheck => 9,
            MessageType::KeyExchangePublicKey => 10,
            MessageType::KeyExchangeSecretShare => 11,
            MessageType::KeyExchangeAcceptance => 12,
            MessageType::KeyExchangeReveal => 13,
            MessageType::KeyActivation => 14,
            MessageType::Chat => 15,
        }
    }
}

/// A message as broadcast to the room: wire type plus CBOR payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_type: MessageType,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Message {
    /// Encodes an unsigned message.
    pub fn encode<T: Serialize>(
        message_type: MessageType,
        payload: &T,
    ) -> Result<Self, EncodeError> {
        Ok(Self {
            message_type,
            payload: cbor::encode(payload)?,
        })
    }

    /// Encodes a signed message, signing with the sender's ephemeral conversation key.
    pub fn encode_signed<T: Serialize>(
        message_type: MessageType,
        payload: &T,
        ephemeral_secret_key: &SecretKey,
        rng: &Rng,
    ) -> Result<Self, SignError> {
        Self::sign_encoded(message_type, cbor::encode(payload)?, ephemeral_secret_key, rng)
    }

    /// Signs already-encoded payload bytes; used when the payload is produced elsewhere (the
    /// encrypted-chat layer hands the channel its key-exchange payloads this way).
    pub fn sign_encoded(
        message_type: MessageType,
        payload_bytes: Vec<u8>,
        ephemeral_secret_key: &SecretKey,
        rng: &Rng,
    ) -> Result<Self, SignError> {
        let signature = xeddsa_sign(
            &signed_bytes(message_type, &payload_bytes),
            ephemeral_secret_key,
            rng,
        )?;
        let envelope = Signed {
            payload: payload_bytes,
            signature,
        };
        Ok(Self {
            message_type,
            payload: cbor::encode(&envelope)?,
        })
    }

    /// Decodes the payload of an unsigned message.
    pub fn decode<T: for<'a> Deserialize<'a>>(&self) -> Result<T, DecodeError> {
        cbor::decode(&self.payload)
    }

    /// Decodes the payload of a signed message, verifying the signature against the sender's
    /// ephemeral public key.
    ///
    /// A malformed envelope or payload is a [`SignedDecodeError::Decode`]; an envelope whose
    /// signature does not verify is [`SignedDecodeError::InvalidSignature`]. Callers treat the
    /// two differently: garbage is dropped, a bad signature marks the sender as Byzantine.
    pub fn decode_signed<T: for<'a> Deserialize<'a>>(
        &self,
        ephemeral_public_key: &PublicKey,
    ) -> Result<T, SignedDecodeError> {
        let envelope: Signed = cbor::decode(&self.payload)?;
        xeddsa_verify(
            &signed_bytes(self.message_type, &envelope.payload),
            ephemeral_public_key,
            &envelope.signature,
        )
        .map_err(|_| SignedDecodeError::InvalidSignature)?;
        Ok(cbor::decode(&envelope.payload)?)
    }

    /// Hash over the payload bytes, as referenced by channel-status events.
    pub fn payload_hash(&self) -> Hash {
        Hash::new(&self.payload)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        cbor::encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        cbor::decode(bytes)
    }
}

/// Envelope of a signed message payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Signed {
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub signature: XSignature,
}

fn signed_bytes(message_type: MessageType, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(1 + payload.len());
    bytes.push(message_type.to_byte());
    bytes.extend_from_slice(payload);
    bytes
}

#[derive(Debug, Error)]
pub enum SignError {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Signature(#[from] XEdDSAError),
}

#[derive(Debug, Error)]
pub enum SignedDecodeError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("message signature does not match the sender's ephemeral key")]
    InvalidSignature,
}

/// Probe for channels in a room. Answered by a [`ChannelStatus`] snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSearch {
    pub nonce: Hash,
}

/// Full snapshot of a channel: participants, pending key exchanges and pending events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub searcher_username: String,
    pub searcher_nonce: Hash,
    pub channel_status_hash: Hash,
    pub participants: Vec<StatusParticipant>,
    pub unauthorized_participants: Vec<StatusUnauthorizedParticipant>,
    pub key_exchanges: Vec<KeyExchangeState>,
    pub events: Vec<StatusEvent>,
}

/// An authorized participant as listed in a status snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusParticipant {
    pub username: String,
    pub long_term_public_key: PublicKey,
    pub ephemeral_public_key: PublicKey,
    pub authorization_nonce: Hash,
}

/// An unauthorized participant as listed in a status snapshot, with their authorization
/// witness sets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUnauthorizedParticipant {
    pub username: String,
    pub long_term_public_key: PublicKey,
    pub ephemeral_public_key: PublicKey,
    pub authorization_nonce: Hash,
    pub authorized_by: BTreeSet<String>,
    pub authorized_peers: BTreeSet<String>,
}

/// Opaque serialized state of one in-flight key exchange, owned by the encrypted-chat layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchangeState {
    pub key_id: Hash,
    #[serde(with = "serde_bytes")]
    pub state: Vec<u8>,
}

/// The key-exchange round or activation a key event refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyEventKind {
    PublicKey,
    SecretShare,
    Acceptance,
    Reveal,
    Activation,
}

impl KeyEventKind {
    /// The wire message type a reply to this event must carry.
    pub fn message_type(self) -> MessageType {
        match self {
            KeyEventKind::PublicKey => MessageType::KeyExchangePublicKey,
            KeyEventKind::SecretShare => MessageType::KeyExchangeSecretShare,
            KeyEventKind::Acceptance => MessageType::KeyExchangeAcceptance,
            KeyEventKind::Reveal => MessageType::KeyExchangeReveal,
            KeyEventKind::Activation => MessageType::KeyActivation,
        }
    }
}

/// A pending event as listed in a status snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusEvent {
    ChannelStatus {
        searcher_username: String,
        searcher_nonce: Hash,
        status_message_hash: Hash,
        remaining_users: BTreeSet<String>,
    },
    ConsistencyCheck {
        channel_status_hash: Hash,
        remaining_users: BTreeSet<String>,
    },
    KeyExchange {
        kind: KeyEventKind,
        key_id: Hash,
        /// A cancelled exchange no longer exists in the encrypted-chat layer; the event is
        /// carried only so late replies can still be reconciled.
        cancelled: bool,
        remaining_users: BTreeSet<String>,
    },
    KeyActivation {
        key_id: Hash,
        remaining_users: BTreeSet<String>,
    },
}

/// Minimal advertisement of a channel by one of its participants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAnnouncement {
    pub long_term_public_key: PublicKey,
    pub ephemeral_public_key: PublicKey,
    pub channel_status_hash: Hash,
}

/// Request to join the channel whose participants include the listed peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub long_term_public_key: PublicKey,
    pub ephemeral_public_key: PublicKey,
    pub peer_usernames: Vec<String>,
}

/// Challenge asking a peer to prove control over their key pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationRequest {
    pub sender_long_term_public_key: PublicKey,
    pub sender_ephemeral_public_key: PublicKey,
    pub peer_username: String,
    pub peer_long_term_public_key: PublicKey,
    pub peer_ephemeral_public_key: PublicKey,
    pub nonce: Hash,
}

/// Proof of control over a key pair: the triple-DH authentication token for the given nonce.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authentication {
    pub sender_long_term_public_key: PublicKey,
    pub sender_ephemeral_public_key: PublicKey,
    pub peer_username: String,
    pub peer_long_term_public_key: PublicKey,
    pub peer_ephemeral_public_key: PublicKey,
    pub nonce: Hash,
    pub authentication_confirmation: Hash,
}

/// Signed statement that the sender vouches for the named participant. Binds the subject's
/// full identity and the history they joined at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub username: String,
    pub long_term_public_key: PublicKey,
    pub ephemeral_public_key: PublicKey,
    pub authorization_nonce: Hash,
}

/// Prompt for all active members to broadcast a [`ConsistencyCheck`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyStatus {}

/// Signed commitment to the sender's current channel-status hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyCheck {
    pub channel_status_hash: Hash,
}

/// First key-exchange round: the sender's per-exchange public key. Signed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchangePublicKey {
    pub key_id: Hash,
    pub public_key: PublicKey,
}

/// Second key-exchange round: the sender's secret share. Signed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchangeSecretShare {
    pub key_id: Hash,
    pub group_hash: Hash,
    pub secret_share: Hash,
}

/// Third key-exchange round: the sender's hash of the agreed key. Signed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchangeAcceptance {
    pub key_id: Hash,
    pub key_hash: Hash,
}

/// Failure round: the sender reveals their exchange private key for fault attribution. Signed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyExchangeReveal {
    pub key_id: Hash,
    pub private_key: SecretKey,
}

/// Announcement that the sender switched to the identified session key. Signed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyActivation {
    pub key_id: Hash,
}

/// An encrypted chat message, opaque to the channel layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;
    use crate::crypto::x25519::SecretKey;
    use crate::hash::Hash;

    use super::{
        Authorization, ChannelSearch, Message, MessageType, SignedDecodeError,
    };

    #[test]
    fn unsigned_round_trip() {
        let rng = Rng::from_seed([5; 32]);
        let payload = ChannelSearch {
            nonce: Hash::random(&rng).unwrap(),
        };

        let message = Message::encode(MessageType::ChannelSearch, &payload).unwrap();
        assert_eq!(message.message_type, MessageType::ChannelSearch);

        let decoded: ChannelSearch = message.decode().unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn signed_round_trip() {
        let rng = Rng::from_seed([6; 32]);
        let ephemeral = SecretKey::generate(&rng).unwrap();
        let identity = SecretKey::generate(&rng).unwrap();

        let payload = Authorization {
            username: "bob".to_string(),
            long_term_public_key: identity.public_key(),
            ephemeral_public_key: ephemeral.public_key(),
            authorization_nonce: Hash::random(&rng).unwrap(),
        };

        let message =
            Message::encode_signed(MessageType::Authorization, &payload, &ephemeral, &rng).unwrap();

        let decoded: Authorization = message.decode_signed(&ephemeral.public_key()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn signed_rejects_wrong_key() {
        let rng = Rng::from_seed([7; 32]);
        let ephemeral = SecretKey::generate(&rng).unwrap();
        let other = SecretKey::generate(&rng).unwrap();

        let payload = ChannelSearch {
            nonce: Hash::random(&rng).unwrap(),
        };
        let message =
            Message::encode_signed(MessageType::ChannelSearch, &payload, &ephemeral, &rng).unwrap();

        let result = message.decode_signed::<ChannelSearch>(&other.public_key());
        assert!(matches!(result, Err(SignedDecodeError::InvalidSignature)));
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        let message = Message {
            message_type: MessageType::ConsistencyCheck,
            payload: vec![0xff, 0x13, 0x37],
        };
        let rng = Rng::from_seed([8; 32]);
        let key = SecretKey::generate(&rng).unwrap();

        let result = message.decode_signed::<super::ConsistencyCheck>(&key.public_key());
        assert!(matches!(result, Err(SignedDecodeError::Decode(_))));
    }

    #[test]
    fn type_bytes_are_distinct() {
        let types = [
            MessageType::ChannelSearch,
            MessageType::ChannelStatus,
            MessageType::ChannelAnnouncement,
            MessageType::JoinRequest,
            MessageType::AuthenticationRequest,
            MessageType::Authentication,
            MessageType::Authorization,
            MessageType::ConsistencyStatus,
            MessageType::ConsistencyCheck,
            MessageType::KeyExchangePublicKey,
            MessageType::KeyExchangeSecretShare,
            MessageType::KeyExchangeAcceptance,
            MessageType::KeyExchangeReveal,
            MessageType::KeyActivation,
            MessageType::Chat,
        ];
        let mut seen = std::collections::BTreeSet::new();
        for message_type in types {
            assert!(seen.insert(message_type.to_byte()));
        }
    }
}
