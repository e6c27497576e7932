// SPDX-License-Identifier: MIT OR Apache-2.0

//! Elliptic-curve Diffie-Hellman key agreement (X25519).
//!
//! The same key pair format doubles as a signing key pair through
//! [XEdDSA](crate::crypto::xeddsa), which is how channel messages are authenticated without
//! carrying a second key per participant.
use std::fmt;

use curve25519_dalek::MontgomeryPoint;
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::crypto::rng::{Rng, RngError};

pub const SECRET_KEY_SIZE: usize = 32;

pub const PUBLIC_KEY_SIZE: usize = 32;

pub const AGREEMENT_SIZE: usize = 32;

/// X25519 secret key.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SecretKey(#[serde(with = "serde_bytes")] [u8; SECRET_KEY_SIZE]);

impl SecretKey {
    /// Interprets the given bytes as an X25519 scalar, applying the usual clamping.
    pub fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        let mut bytes = bytes;
        bytes[0] &= 248u8;
        bytes[31] &= 127u8;
        bytes[31] |= 64u8;
        SecretKey(bytes)
    }

    /// Generates a fresh secret key.
    pub fn generate(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self::from_bytes(rng.random_array()?))
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.0
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(MontgomeryPoint::mul_base_clamped(self.0).to_bytes())
    }

    /// Diffie-Hellman agreement with the peer's public key.
    pub fn calculate_agreement(&self, their_public: &PublicKey) -> [u8; AGREEMENT_SIZE] {
        MontgomeryPoint(their_public.0).mul_clamped(self.0).to_bytes()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keep secret key material out of logs.
        f.write_str("SecretKey(..)")
    }
}

/// X25519 public key.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "serde_bytes")] [u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;

    use super::SecretKey;

    #[test]
    fn diffie_hellman() {
        let rng = Rng::from_seed([1; 32]);

        let alice_secret_key = SecretKey::generate(&rng).unwrap();
        let alice_public_key = alice_secret_key.public_key();

        let bob_secret_key = SecretKey::generate(&rng).unwrap();
        let bob_public_key = bob_secret_key.public_key();

        let alice_shared_secret = alice_secret_key.calculate_agreement(&bob_public_key);
        let bob_shared_secret = bob_secret_key.calculate_agreement(&alice_public_key);

        assert_eq!(alice_shared_secret, bob_shared_secret);
    }

    #[test]
    fn clamping() {
        let secret_key = SecretKey::from_bytes([0xff; 32]);
        let bytes = secret_key.as_bytes();
        assert_eq!(bytes[0] & 0b0000_0111, 0);
        assert_eq!(bytes[31] & 0b1000_0000, 0);
        assert_eq!(bytes[31] & 0b0100_0000, 0b0100_0000);
    }
}
