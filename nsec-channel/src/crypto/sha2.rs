// SPDX-License-Identifier: MIT OR Apache-2.0

//! SHA2 hashing functions.
use sha2::{Digest, Sha256, Sha512};

pub const SHA256_DIGEST_SIZE: usize = 32;

pub const SHA512_DIGEST_SIZE: usize = 64;

/// SHA2-256 over the concatenation of all given segments.
pub fn sha2_256(segments: &[&[u8]]) -> [u8; SHA256_DIGEST_SIZE] {
    let mut hasher = Sha256::new();
    for segment in segments {
        hasher.update(segment);
    }
    hasher.finalize()[..].try_into().expect("sha256 digest size")
}

/// SHA2-512 over the concatenation of all given segments.
pub fn sha2_512(segments: &[&[u8]]) -> [u8; SHA512_DIGEST_SIZE] {
    let mut hasher = Sha512::new();
    for segment in segments {
        hasher.update(segment);
    }
    hasher.finalize()[..].try_into().expect("sha512 digest size")
}

#[cfg(test)]
mod tests {
    use super::{sha2_256, sha2_512};

    #[test]
    fn segments_are_concatenated() {
        assert_eq!(sha2_256(&[b"ab", b"cd"]), sha2_256(&[b"abcd"]));
        assert_eq!(sha2_512(&[b"ab", b"cd"]), sha2_512(&[b"abcd"]));
        assert_ne!(sha2_256(&[b"ab"]), sha2_256(&[b"cd"]));
    }
}
