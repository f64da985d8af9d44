//! Pluggable identity attestation.
//!
//! The handshake negotiates one algorithm for each direction out of the
//! client's advertised lists; the chosen algorithm selects how the local
//! side proves its identity ([`IdentityProvider`]) and how the remote
//! side's proof is checked ([`IdentityVerifier`]). Platform-specific
//! schemes (hardware attestation, X.509 chains) live behind these traits;
//! this crate ships the pretrusted-public-key scheme used by tests and by
//! deployments that pin the peer key at bonding time.

use crate::error::CryptoError;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use subtle::ConstantTimeEq;

/// Pretrusted Ed25519 public key: the verifier pins the peer's key and the
/// attestation proves possession of it.
pub const ALG_PRETRUSTED_ED25519: u64 = 1;

/// Generates the local side's identity proofs.
pub trait IdentityProvider: Send + Sync {
    /// Algorithm identifiers this provider can prove, in preference order.
    fn algorithms(&self) -> Vec<u64>;

    /// Produce an attestation payload for the negotiated algorithm over a
    /// handshake-supplied challenge.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnsupportedAlgorithm`] for algorithms this
    /// provider did not advertise.
    fn generate_attestation(&self, algorithm: u64, challenge: &[u8])
        -> Result<Vec<u8>, CryptoError>;

    /// Sign an opaque message (the transcript hash) with the identity key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnsupportedAlgorithm`] for unknown algorithms.
    fn sign(&self, algorithm: u64, message: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Validates the remote side's identity proofs.
pub trait IdentityVerifier: Send + Sync {
    /// Algorithm identifiers this verifier accepts, in preference order.
    fn algorithms(&self) -> Vec<u64>;

    /// Validate a remote attestation payload against the challenge.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::AttestationRejected`] if the payload does not
    /// prove the expected identity.
    fn validate_attestation(
        &self,
        algorithm: u64,
        challenge: &[u8],
        payload: &[u8],
    ) -> Result<(), CryptoError>;

    /// Verify a signature over an opaque message (the transcript hash).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SignatureInvalid`] on verification failure.
    fn verify(&self, algorithm: u64, message: &[u8], signature: &[u8])
        -> Result<(), CryptoError>;
}

/// Local identity backed by a raw Ed25519 signing key.
pub struct PretrustedIdentity {
    signing: SigningKey,
}

impl PretrustedIdentity {
    /// Wrap an existing signing key.
    #[must_use]
    pub fn new(signing: SigningKey) -> Self {
        Self { signing }
    }

    /// Build from raw seed bytes (deterministic, for tests and stored keys).
    #[must_use]
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::new(SigningKey::from_bytes(&seed))
    }

    /// The public identity key a peer should pin.
    #[must_use]
    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }
}

impl IdentityProvider for PretrustedIdentity {
    fn algorithms(&self) -> Vec<u64> {
        vec![ALG_PRETRUSTED_ED25519]
    }

    fn generate_attestation(
        &self,
        algorithm: u64,
        challenge: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if algorithm != ALG_PRETRUSTED_ED25519 {
            return Err(CryptoError::UnsupportedAlgorithm(algorithm));
        }
        // Payload: claimed public key, then proof of possession over the
        // challenge.
        let mut payload = Vec::with_capacity(32 + 64);
        payload.extend_from_slice(&self.public_key());
        payload.extend_from_slice(&self.signing.sign(challenge).to_bytes());
        Ok(payload)
    }

    fn sign(&self, algorithm: u64, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if algorithm != ALG_PRETRUSTED_ED25519 {
            return Err(CryptoError::UnsupportedAlgorithm(algorithm));
        }
        Ok(self.signing.sign(message).to_bytes().to_vec())
    }
}

/// Verifier that pins a single pretrusted peer public key.
pub struct PretrustedVerifier {
    trusted: VerifyingKey,
}

impl PretrustedVerifier {
    /// Pin a peer public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] if the bytes are not a
    /// valid Ed25519 public key.
    pub fn new(trusted_public_key: [u8; 32]) -> Result<Self, CryptoError> {
        let trusted = VerifyingKey::from_bytes(&trusted_public_key)
            .map_err(|_| CryptoError::InvalidKeyMaterial)?;
        Ok(Self { trusted })
    }
}

impl IdentityVerifier for PretrustedVerifier {
    fn algorithms(&self) -> Vec<u64> {
        vec![ALG_PRETRUSTED_ED25519]
    }

    fn validate_attestation(
        &self,
        algorithm: u64,
        challenge: &[u8],
        payload: &[u8],
    ) -> Result<(), CryptoError> {
        if algorithm != ALG_PRETRUSTED_ED25519 {
            return Err(CryptoError::UnsupportedAlgorithm(algorithm));
        }
        if payload.len() != 32 + 64 {
            return Err(CryptoError::AttestationRejected);
        }
        let (claimed, proof) = payload.split_at(32);
        if claimed.ct_eq(&self.trusted.to_bytes()).unwrap_u8() != 1 {
            return Err(CryptoError::AttestationRejected);
        }
        let signature =
            Signature::from_slice(proof).map_err(|_| CryptoError::AttestationRejected)?;
        self.trusted
            .verify(challenge, &signature)
            .map_err(|_| CryptoError::AttestationRejected)
    }

    fn verify(
        &self,
        algorithm: u64,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        if algorithm != ALG_PRETRUSTED_ED25519 {
            return Err(CryptoError::UnsupportedAlgorithm(algorithm));
        }
        let signature =
            Signature::from_slice(signature).map_err(|_| CryptoError::SignatureInvalid)?;
        self.trusted
            .verify(message, &signature)
            .map_err(|_| CryptoError::SignatureInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (PretrustedIdentity, PretrustedVerifier) {
        let identity = PretrustedIdentity::from_seed([0x55u8; 32]);
        let verifier = PretrustedVerifier::new(identity.public_key()).unwrap();
        (identity, verifier)
    }

    #[test]
    fn attestation_roundtrip() {
        let (identity, verifier) = pair();
        let challenge = [0xAAu8; 64];

        let payload = identity
            .generate_attestation(ALG_PRETRUSTED_ED25519, &challenge)
            .unwrap();
        verifier
            .validate_attestation(ALG_PRETRUSTED_ED25519, &challenge, &payload)
            .unwrap();
    }

    #[test]
    fn attestation_binds_challenge() {
        let (identity, verifier) = pair();
        let payload = identity
            .generate_attestation(ALG_PRETRUSTED_ED25519, b"challenge-a")
            .unwrap();
        assert!(verifier
            .validate_attestation(ALG_PRETRUSTED_ED25519, b"challenge-b", &payload)
            .is_err());
    }

    #[test]
    fn untrusted_key_is_rejected() {
        let (_, verifier) = pair();
        let other = PretrustedIdentity::from_seed([0x66u8; 32]);
        let payload = other
            .generate_attestation(ALG_PRETRUSTED_ED25519, b"challenge")
            .unwrap();
        assert!(verifier
            .validate_attestation(ALG_PRETRUSTED_ED25519, b"challenge", &payload)
            .is_err());
    }

    #[test]
    fn transcript_signature_roundtrip() {
        let (identity, verifier) = pair();
        let transcript = [0x12u8; 32];

        let sig = identity.sign(ALG_PRETRUSTED_ED25519, &transcript).unwrap();
        verifier
            .verify(ALG_PRETRUSTED_ED25519, &transcript, &sig)
            .unwrap();
        assert!(verifier
            .verify(ALG_PRETRUSTED_ED25519, &[0x13u8; 32], &sig)
            .is_err());
    }

    #[test]
    fn unknown_algorithm_is_refused() {
        let (identity, verifier) = pair();
        assert!(matches!(
            identity.generate_attestation(99, b"c"),
            Err(CryptoError::UnsupportedAlgorithm(99))
        ));
        assert!(verifier.verify(99, b"m", &[0u8; 64]).is_err());
    }
}
