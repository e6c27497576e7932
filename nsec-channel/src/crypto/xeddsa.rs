// SPDX-License-Identifier: MIT OR Apache-2.0

//! XEdDSA signatures: EdDSA with X25519 key pairs, so the same ephemeral conversation key
//! performs both Diffie-Hellman and message signing.
//!
//! <https://signal.org/docs/specifications/xeddsa/>
use std::fmt;

use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::{EdwardsPoint, MontgomeryPoint, Scalar};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::crypto::rng::{Rng, RngError};
use crate::crypto::sha2::sha2_512;
use crate::crypto::x25519::{PublicKey, SecretKey};

/// 512-bit signature.
pub const SIGNATURE_SIZE: usize = 64;

// hash1(X) = SHA-512(0xFE || 0xFF * 31 || X).
const HASH_1_PREFIX: [u8; 32] = [
    0xFEu8, 0xFFu8, 0xFFu8, 0xFFu8, 0xFFu8, 0xFFu8, 0xFFu8, 0xFFu8, 0xFFu8, 0xFFu8, 0xFFu8, 0xFFu8,
    0xFFu8, 0xFFu8, 0xFFu8, 0xFFu8, 0xFFu8, 0xFFu8, 0xFFu8, 0xFFu8, 0xFFu8, 0xFFu8, 0xFFu8, 0xFFu8,
    0xFFu8, 0xFFu8, 0xFFu8, 0xFFu8, 0xFFu8, 0xFFu8, 0xFFu8, 0xFFu8,
];

/// XEdDSA signature.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct XSignature(#[serde(with = "serde_bytes")] [u8; SIGNATURE_SIZE]);

impl XSignature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; SIGNATURE_SIZE] {
        self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl fmt::Display for XSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Signs the given bytes with an X25519 secret key.
pub fn xeddsa_sign(
    bytes: &[u8],
    secret_key: &SecretKey,
    rng: &Rng,
) -> Result<XSignature, XEdDSAError> {
    // Z = 64 bytes secure random data
    let cap_z: [u8; SIGNATURE_SIZE] = rng.random_array()?;

    // A, a = calculate_key_pair(k): derive the Edwards key pair whose public part has a zero
    // sign bit, negating the scalar if necessary.
    let (cap_a, a) = {
        let k = Scalar::from_bytes_mod_order(*secret_key.as_bytes());

        let cap_e = &k * ED25519_BASEPOINT_TABLE;
        let mut cap_a = cap_e.compress();
        let sign_bit = cap_a.0[31] >> 7;
        cap_a.0[31] &= 0b0111_1111_u8;

        let a = if sign_bit == 1 { -k } else { k };

        (cap_a, a)
    };

    // r = hash1(a || M || Z) (mod q)
    let r = Scalar::from_bytes_mod_order_wide(&sha2_512(&[
        &HASH_1_PREFIX,
        a.as_bytes(),
        bytes,
        &cap_z,
    ]));

    // R = rB
    let cap_r = (&r * ED25519_BASEPOINT_TABLE).compress();

    // h = hash(R || A || M) (mod q)
    let h = Scalar::from_bytes_mod_order_wide(&sha2_512(&[
        cap_r.as_bytes(),
        cap_a.as_bytes(),
        bytes,
    ]));

    // s = r + ha (mod q)
    let s = r + (h * a);

    let mut result = [0u8; SIGNATURE_SIZE];
    result[..32].copy_from_slice(cap_r.as_bytes());
    result[32..].copy_from_slice(s.as_bytes());
    Ok(XSignature::from_bytes(result))
}

/// Verifies a signature against the X25519 public counterpart of the signing key.
pub fn xeddsa_verify(
    bytes: &[u8],
    their_public_key: &PublicKey,
    signature: &XSignature,
) -> Result<(), XEdDSAError> {
    // R || s = signature to verify
    let mut cap_r = [0u8; 32];
    cap_r.copy_from_slice(&signature.as_bytes()[..32]);
    let mut s = [0u8; 32];
    s.copy_from_slice(&signature.as_bytes()[32..]);
    s[31] &= 0b0111_1111_u8;

    // Reject s with excess bits.
    if (s[31] & 0b1110_0000_u8) != 0 {
        return Err(XEdDSAError::InvalidArgument);
    }

    // A = convert_mont(u): the Edwards point with the same y coordinate and zero sign bit.
    let a = {
        let mont_point = MontgomeryPoint(their_public_key.to_bytes());
        match mont_point.to_edwards(0) {
            Some(point) => point,
            None => return Err(XEdDSAError::InvalidArgument),
        }
    };
    let cap_a = a.compress();

    // h = hash(R || A || M) (mod q)
    let h = Scalar::from_bytes_mod_order_wide(&sha2_512(&[&cap_r, cap_a.as_bytes(), bytes]));

    // Rcheck = sB - hA
    let cap_r_check = EdwardsPoint::vartime_double_scalar_mul_basepoint(
        &h,
        &(-a),
        &Scalar::from_bytes_mod_order(s),
    )
    .compress();

    if bool::from(cap_r_check.as_bytes().ct_eq(&cap_r)) {
        Ok(())
    } else {
        Err(XEdDSAError::VerificationFailed)
    }
}

#[derive(Debug, Error)]
pub enum XEdDSAError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error("invalid xeddsa public key or signature")]
    InvalidArgument,

    #[error("signature does not match public key and bytes")]
    VerificationFailed,
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;
    use crate::crypto::x25519::SecretKey;

    use super::{XEdDSAError, xeddsa_sign, xeddsa_verify};

    #[test]
    fn sign_and_verify() {
        let rng = Rng::from_seed([1; 32]);

        let secret_key = SecretKey::generate(&rng).unwrap();
        let public_key = secret_key.public_key();

        let signature = xeddsa_sign(b"test channel", &secret_key, &rng).unwrap();
        assert!(xeddsa_verify(b"test channel", &public_key, &signature).is_ok());
    }

    #[test]
    fn verify_rejects_tampering() {
        let rng = Rng::from_seed([2; 32]);

        let secret_key = SecretKey::generate(&rng).unwrap();
        let public_key = secret_key.public_key();
        let signature = xeddsa_sign(b"test channel", &secret_key, &rng).unwrap();

        let other_secret_key = SecretKey::generate(&rng).unwrap();
        let other_public_key = other_secret_key.public_key();
        let other_signature = xeddsa_sign(b"test channel", &other_secret_key, &rng).unwrap();

        assert!(matches!(
            xeddsa_verify(b"different bytes", &public_key, &signature),
            Err(XEdDSAError::VerificationFailed)
        ));
        assert!(matches!(
            xeddsa_verify(b"test channel", &other_public_key, &signature),
            Err(XEdDSAError::VerificationFailed)
        ));
        assert!(matches!(
            xeddsa_verify(b"test channel", &public_key, &other_signature),
            Err(XEdDSAError::VerificationFailed)
        ));
    }
}
