//! `ChaCha20-Poly1305` traffic sealing.
//!
//! Each direction of a connection owns one sealer (transmit) or opener
//! (receive) built from the active [`TrafficKey`]. Nonces are the key's IV
//! material XORed with a packet counter; the underlying link is ordered and
//! reliable, so both peers advance their counters in lockstep. Counters
//! reset to zero whenever a key-update installs a replacement key.

use crate::error::CryptoError;
use crate::schedule::{SecurityLevel, TrafficKey};
use crate::TRAFFIC_IV_SIZE;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};

/// Counter value at which the holder should request a key update.
///
/// Well below any cryptographic bound for ChaCha20-Poly1305; the point is
/// to exercise rotation long before IV reuse is conceivable.
pub const REKEY_SOFT_LIMIT: u64 = 1 << 20;

/// Counter value at which sealing refuses to continue.
pub const REKEY_HARD_LIMIT: u64 = 1 << 21;

fn nonce_for(iv: &[u8; TRAFFIC_IV_SIZE], counter: u64) -> [u8; TRAFFIC_IV_SIZE] {
    let mut nonce = *iv;
    let counter_bytes = counter.to_be_bytes();
    for (n, c) in nonce[TRAFFIC_IV_SIZE - 8..].iter_mut().zip(counter_bytes) {
        *n ^= c;
    }
    nonce
}

/// Transmit-direction AEAD state.
pub struct TrafficSealer {
    cipher: ChaCha20Poly1305,
    key: TrafficKey,
    counter: u64,
}

impl TrafficSealer {
    /// Build a sealer from a freshly installed traffic key.
    #[must_use]
    pub fn new(key: TrafficKey) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.key()));
        Self {
            cipher,
            key,
            counter: 0,
        }
    }

    /// Security level of the active key.
    #[must_use]
    pub fn level(&self) -> SecurityLevel {
        self.key.level()
    }

    /// Whether the counter has crossed the soft rotation threshold.
    #[must_use]
    pub fn needs_rekey(&self) -> bool {
        self.counter >= REKEY_SOFT_LIMIT
    }

    /// Seal one packet payload.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NonceExhausted`] past the hard counter limit
    /// and [`CryptoError::EncryptFailed`] on AEAD failure.
    pub fn seal(&mut self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.counter >= REKEY_HARD_LIMIT {
            return Err(CryptoError::NonceExhausted);
        }
        if self.counter == REKEY_SOFT_LIMIT {
            tracing::debug!(level = ?self.key.level(), "soft rekey limit reached, key update due");
        }
        let nonce = nonce_for(self.key.iv(), self.counter);
        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptFailed)?;
        self.counter += 1;
        Ok(sealed)
    }
}

/// Receive-direction AEAD state.
pub struct TrafficOpener {
    cipher: ChaCha20Poly1305,
    key: TrafficKey,
    counter: u64,
}

impl TrafficOpener {
    /// Build an opener from a freshly installed traffic key.
    #[must_use]
    pub fn new(key: TrafficKey) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.key()));
        Self {
            cipher,
            key,
            counter: 0,
        }
    }

    /// Security level of the active key.
    #[must_use]
    pub fn level(&self) -> SecurityLevel {
        self.key.level()
    }

    /// Open one packet payload.
    ///
    /// A failure here means the peer sealed under a different key or the
    /// ciphertext was tampered with; both are fatal to the connection.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptFailed`] on authentication failure.
    pub fn open(&mut self, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = nonce_for(self.key.iv(), self.counter);
        let opened = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptFailed)?;
        self.counter += 1;
        Ok(opened)
    }
}
