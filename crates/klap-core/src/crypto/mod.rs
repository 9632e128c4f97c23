//! Cryptographic primitives for the KLAP protocol.
//!
//! - [`klap`]: auth hash derivation, handshake proofs, and the per-session
//!   AES-128-CBC cipher with sequence-numbered IVs and signatures

pub mod klap;

pub use klap::{
    AuthHash, CipherContext, CipherError, CipherKeys, generate_auth_hash,
    handshake1_seed_auth_hash, handshake2_seed_auth_hash,
};
