//! Error types for QLIC cryptographic operations.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key derivation produced an invalid length or the PRK was rejected
    #[error("key derivation failed")]
    KeyDerivation,

    /// AEAD open failed (bad key, nonce, or tampered ciphertext)
    #[error("decryption failed")]
    DecryptFailed,

    /// AEAD seal failed
    #[error("encryption failed")]
    EncryptFailed,

    /// The per-key nonce counter is exhausted; a key update is required
    #[error("nonce counter exhausted for current traffic key")]
    NonceExhausted,

    /// Signature did not verify
    #[error("signature verification failed")]
    SignatureInvalid,

    /// Remote attestation payload was rejected
    #[error("attestation rejected")]
    AttestationRejected,

    /// No provider/verifier for the negotiated algorithm
    #[error("unsupported authentication algorithm: {0}")]
    UnsupportedAlgorithm(u64),

    /// Malformed key material (wrong length, invalid point encoding)
    #[error("invalid key material")]
    InvalidKeyMaterial,

    /// The OS CSPRNG failed
    #[error("random number generation failed")]
    RandomFailed,
}
