//! # QLIC Crypto
//!
//! Cryptographic primitives for the QLIC transport protocol.
//!
//! This crate provides:
//! - The HKDF-based key schedule (root secret, per-direction traffic
//!   secrets, key-update chaining)
//! - The running handshake transcript hash
//! - `ChaCha20-Poly1305` traffic sealing with counter nonces
//! - X25519 key shares
//! - Pluggable identity attestation (provider/verifier seams)
//! - A serialization guard for platform keystore calls
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 | 128-bit |
//! | AEAD | ChaCha20-Poly1305 | 256-bit key |
//! | Transcript Hash | SHA-256 | 128-bit collision |
//! | KDF | HKDF-SHA256 | 128-bit |
//! | Pretrusted Signatures | Ed25519 | 128-bit |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod auth;
pub mod error;
pub mod guard;
pub mod kex;
pub mod random;
pub mod schedule;
pub mod transcript;

pub use error::CryptoError;
pub use guard::CryptoGuard;
pub use schedule::{KeySchedule, Phase, SecurityLevel, TrafficKey, TrafficSecret};
pub use transcript::TranscriptHash;

/// X25519 key share size on the wire
pub const KEY_SHARE_SIZE: usize = 32;

/// Traffic symmetric key size
pub const TRAFFIC_KEY_SIZE: usize = 32;

/// Traffic IV material size (ChaCha20-Poly1305 nonce width)
pub const TRAFFIC_IV_SIZE: usize = 12;

/// AEAD authentication tag size
pub const TAG_SIZE: usize = 16;

/// Transcript hash output size (SHA-256)
pub const TRANSCRIPT_HASH_SIZE: usize = 32;

/// Ed25519 signature size
pub const SIGNATURE_SIZE: usize = 64;
