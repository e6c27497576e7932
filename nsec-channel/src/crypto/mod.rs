// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core cryptographic algorithms and random number generator.
//!
//! Algorithms:
//! - X25519 Diffie-Hellman (with a triple-DH composition for mutual authentication)
//! - XEdDSA (DSA with X25519 key pairs)
//! - SHA2-256 / SHA2-512
//!
//! Random Number Generator:
//! - ChaCha20 stream cipher, seeded via the operating system
mod rng;
pub mod sha2;
pub mod triple_dh;
pub mod x25519;
pub mod xeddsa;

pub use rng::{Rng, RngError};
