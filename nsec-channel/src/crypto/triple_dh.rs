// SPDX-License-Identifier: MIT OR Apache-2.0

//! Triple Diffie-Hellman between two parties who each hold a long-term identity key and an
//! ephemeral conversation key.
//!
//! Three agreements are combined: long-term against ephemeral in both directions, and ephemeral
//! against ephemeral. Both endpoints arrive at the same secret; proving knowledge of it proves
//! control over both private keys at once.
use crate::crypto::sha2::{SHA256_DIGEST_SIZE, sha2_256};
use crate::crypto::x25519::{AGREEMENT_SIZE, PublicKey, SecretKey};

/// Computes the shared triple Diffie-Hellman secret with a peer.
///
/// The two cross agreements (our long-term key against their ephemeral key and vice versa) are
/// swapped between the endpoints, so they are ordered lexicographically before hashing to make
/// the result direction-independent.
pub fn triple_diffie_hellman(
    my_long_term: &SecretKey,
    my_ephemeral: &SecretKey,
    their_long_term: &PublicKey,
    their_ephemeral: &PublicKey,
) -> [u8; SHA256_DIGEST_SIZE] {
    let long_term_to_ephemeral = my_long_term.calculate_agreement(their_ephemeral);
    let ephemeral_to_long_term = my_ephemeral.calculate_agreement(their_long_term);
    let ephemeral_to_ephemeral = my_ephemeral.calculate_agreement(their_ephemeral);

    let (first, second): (
        &[u8; AGREEMENT_SIZE],
        &[u8; AGREEMENT_SIZE],
    ) = if long_term_to_ephemeral <= ephemeral_to_long_term {
        (&long_term_to_ephemeral, &ephemeral_to_long_term)
    } else {
        (&ephemeral_to_long_term, &long_term_to_ephemeral)
    };

    sha2_256(&[first, second, &ephemeral_to_ephemeral])
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;
    use crate::crypto::x25519::SecretKey;

    use super::triple_diffie_hellman;

    #[test]
    fn symmetric_between_endpoints() {
        let rng = Rng::from_seed([3; 32]);

        let alice_long_term = SecretKey::generate(&rng).unwrap();
        let alice_ephemeral = SecretKey::generate(&rng).unwrap();
        let bob_long_term = SecretKey::generate(&rng).unwrap();
        let bob_ephemeral = SecretKey::generate(&rng).unwrap();

        let alice_secret = triple_diffie_hellman(
            &alice_long_term,
            &alice_ephemeral,
            &bob_long_term.public_key(),
            &bob_ephemeral.public_key(),
        );
        let bob_secret = triple_diffie_hellman(
            &bob_long_term,
            &bob_ephemeral,
            &alice_long_term.public_key(),
            &alice_ephemeral.public_key(),
        );

        assert_eq!(alice_secret, bob_secret);
    }

    #[test]
    fn distinct_per_peer() {
        let rng = Rng::from_seed([4; 32]);

        let alice_long_term = SecretKey::generate(&rng).unwrap();
        let alice_ephemeral = SecretKey::generate(&rng).unwrap();
        let bob_long_term = SecretKey::generate(&rng).unwrap();
        let bob_ephemeral = SecretKey::generate(&rng).unwrap();
        let carol_ephemeral = SecretKey::generate(&rng).unwrap();

        let with_bob = triple_diffie_hellman(
            &alice_long_term,
            &alice_ephemeral,
            &bob_long_term.public_key(),
            &bob_ephemeral.public_key(),
        );
        let with_impostor = triple_diffie_hellman(
            &alice_long_term,
            &alice_ephemeral,
            &bob_long_term.public_key(),
            &carol_ephemeral.public_key(),
        );

        assert_ne!(with_bob, with_impostor);
    }
}
