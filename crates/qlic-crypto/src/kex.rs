//! X25519 key shares for the hello exchange.

use crate::error::CryptoError;
use crate::random;
use crate::KEY_SHARE_SIZE;
use x25519_dalek::{PublicKey, StaticSecret};

/// An ephemeral key-exchange keypair for one handshake.
///
/// Uses `StaticSecret` rather than the single-use ephemeral type so tests
/// can pin the secret and reproduce exact transcripts.
pub struct KeyExchange {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyExchange {
    /// Generate a fresh keypair from the OS CSPRNG.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the CSPRNG fails.
    pub fn generate() -> Result<Self, CryptoError> {
        let bytes = random::random_32()?;
        Ok(Self::from_secret_bytes(bytes))
    }

    /// Build a keypair from fixed secret bytes (clamped internally).
    #[must_use]
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public key share sent in ClientHello/ServerHello.
    #[must_use]
    pub fn public_share(&self) -> [u8; KEY_SHARE_SIZE] {
        self.public.to_bytes()
    }

    /// Complete the exchange against the peer's key share.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] if the peer share has the
    /// wrong length or yields an all-zero (low-order point) shared secret.
    pub fn shared_secret(&self, peer_share: &[u8]) -> Result<[u8; 32], CryptoError> {
        let bytes: [u8; KEY_SHARE_SIZE] = peer_share
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyMaterial)?;
        let peer = PublicKey::from(bytes);
        let shared = self.secret.diffie_hellman(&peer);
        let shared = *shared.as_bytes();
        if shared == [0u8; 32] {
            return Err(CryptoError::InvalidKeyMaterial);
        }
        Ok(shared)
    }
}
