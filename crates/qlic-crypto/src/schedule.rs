//! The QLIC key schedule.
//!
//! Traffic keys are derived from the key-exchange shared secret and the
//! running handshake transcript with an HKDF-based label expansion:
//!
//! ```text
//! info = u16(out_len) || u8(label_len) || "qlic " + label
//!      || u8(transcript_len) || transcript
//! okm  = HKDF-Expand-SHA256(prk, info, out_len)
//! ```
//!
//! The root secret feeds one client-direction and one server-direction
//! secret per phase (handshake, application). Each direction secret expands
//! into a symmetric key plus IV material. Post-handshake rotation chains the
//! current traffic secret forward under a fixed label with no new shared
//! secret or transcript input, so rotation can continue indefinitely.

use crate::error::CryptoError;
use crate::{TRAFFIC_IV_SIZE, TRAFFIC_KEY_SIZE, TRANSCRIPT_HASH_SIZE};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

const LABEL_PREFIX: &[u8] = b"qlic ";
const LABEL_ROOT: &str = "root";
const LABEL_CLIENT_HS: &str = "c hs traffic";
const LABEL_SERVER_HS: &str = "s hs traffic";
const LABEL_CLIENT_APP: &str = "c ap traffic";
const LABEL_SERVER_APP: &str = "s ap traffic";
const LABEL_KEY: &str = "key";
const LABEL_IV: &str = "iv";
const LABEL_UPDATE: &str = "traffic upd";

/// Security level a traffic key belongs to.
///
/// Handshake-level keys protect handshake records only; application-level
/// keys (and their key-update successors) protect all stream data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    /// Keys derived at the hello boundary, valid for handshake records
    Handshake,
    /// Keys derived at handshake completion, valid for stream data
    Application,
}

/// Key-schedule phase selector. Identical value space to [`SecurityLevel`].
pub type Phase = SecurityLevel;

/// HKDF-Expand with the QLIC label convention.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if the requested output length is
/// not representable or the PRK is rejected.
pub fn hkdf_expand_label(
    prk: &[u8; 32],
    label: &str,
    transcript: &[u8],
    out: &mut [u8],
) -> Result<(), CryptoError> {
    let full_label_len = LABEL_PREFIX.len() + label.len();
    if full_label_len > u8::MAX as usize
        || transcript.len() > u8::MAX as usize
        || out.len() > u16::MAX as usize
    {
        return Err(CryptoError::KeyDerivation);
    }

    let mut info = Vec::with_capacity(4 + full_label_len + transcript.len());
    info.extend_from_slice(&(out.len() as u16).to_be_bytes());
    info.push(full_label_len as u8);
    info.extend_from_slice(LABEL_PREFIX);
    info.extend_from_slice(label.as_bytes());
    info.push(transcript.len() as u8);
    info.extend_from_slice(transcript);

    let hk = Hkdf::<Sha256>::from_prk(prk).map_err(|_| CryptoError::KeyDerivation)?;
    hk.expand(&info, out).map_err(|_| CryptoError::KeyDerivation)
}

/// A per-direction traffic secret at one security level.
///
/// The secret itself never touches the wire; it exists to derive the
/// concrete [`TrafficKey`] and its key-update successors.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TrafficSecret {
    secret: [u8; 32],
    #[zeroize(skip)]
    level: SecurityLevel,
}

impl TrafficSecret {
    /// Wrap raw secret bytes at the given level.
    #[must_use]
    pub fn from_bytes(secret: [u8; 32], level: SecurityLevel) -> Self {
        Self { secret, level }
    }

    /// Security level of keys derived from this secret.
    #[must_use]
    pub fn level(&self) -> SecurityLevel {
        self.level
    }

    /// Expand this secret into a symmetric key plus IV material.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivation`] on HKDF failure.
    pub fn traffic_key(&self) -> Result<TrafficKey, CryptoError> {
        let mut key = [0u8; TRAFFIC_KEY_SIZE];
        let mut iv = [0u8; TRAFFIC_IV_SIZE];
        hkdf_expand_label(&self.secret, LABEL_KEY, &[], &mut key)?;
        hkdf_expand_label(&self.secret, LABEL_IV, &[], &mut iv)?;
        Ok(TrafficKey {
            key,
            iv,
            level: self.level,
        })
    }

    /// Derive the next traffic secret in the key-update chain.
    ///
    /// Takes no shared-secret or transcript input, so rotation can be
    /// repeated indefinitely for forward secrecy.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivation`] on HKDF failure.
    pub fn next(&self) -> Result<TrafficSecret, CryptoError> {
        let mut secret = [0u8; 32];
        hkdf_expand_label(&self.secret, LABEL_UPDATE, &[], &mut secret)?;
        Ok(TrafficSecret {
            secret,
            level: self.level,
        })
    }
}

/// A concrete traffic key: symmetric key, IV material, security level.
///
/// Exactly one transmit and one receive key are active at a time; the
/// connection replaces them atomically on a confirmed key update.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TrafficKey {
    key: [u8; TRAFFIC_KEY_SIZE],
    iv: [u8; TRAFFIC_IV_SIZE],
    #[zeroize(skip)]
    level: SecurityLevel,
}

impl TrafficKey {
    /// Raw symmetric key bytes.
    #[must_use]
    pub fn key(&self) -> &[u8; TRAFFIC_KEY_SIZE] {
        &self.key
    }

    /// Raw IV material.
    #[must_use]
    pub fn iv(&self) -> &[u8; TRAFFIC_IV_SIZE] {
        &self.iv
    }

    /// Security level this key is valid for.
    #[must_use]
    pub fn level(&self) -> SecurityLevel {
        self.level
    }
}

impl std::fmt::Debug for TrafficKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never appears in logs.
        f.debug_struct("TrafficKey")
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

/// The connection key schedule, rooted in the key-exchange shared secret.
pub struct KeySchedule {
    root: [u8; 32],
}

impl KeySchedule {
    /// Derive the root secret from the shared secret and the transcript
    /// hash at the hello boundary.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivation`] on HKDF failure.
    pub fn root(
        shared_secret: &[u8],
        transcript: &[u8; TRANSCRIPT_HASH_SIZE],
    ) -> Result<Self, CryptoError> {
        let (prk, _) = Hkdf::<Sha256>::extract(None, shared_secret);
        let prk: [u8; 32] = prk.into();
        let mut root = [0u8; 32];
        hkdf_expand_label(&prk, LABEL_ROOT, transcript, &mut root)?;
        Ok(Self { root })
    }

    /// Derive the client-direction and server-direction secrets for one
    /// phase, bound to the transcript at that phase boundary.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivation`] on HKDF failure.
    pub fn expand_peer_secrets(
        &self,
        phase: Phase,
        transcript: &[u8; TRANSCRIPT_HASH_SIZE],
    ) -> Result<(TrafficSecret, TrafficSecret), CryptoError> {
        let (client_label, server_label) = match phase {
            SecurityLevel::Handshake => (LABEL_CLIENT_HS, LABEL_SERVER_HS),
            SecurityLevel::Application => (LABEL_CLIENT_APP, LABEL_SERVER_APP),
        };

        let mut client = [0u8; 32];
        let mut server = [0u8; 32];
        hkdf_expand_label(&self.root, client_label, transcript, &mut client)?;
        hkdf_expand_label(&self.root, server_label, transcript, &mut server)?;

        Ok((
            TrafficSecret::from_bytes(client, phase),
            TrafficSecret::from_bytes(server, phase),
        ))
    }
}

impl Drop for KeySchedule {
    fn drop(&mut self) {
        self.root.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> KeySchedule {
        KeySchedule::root(&[0x42u8; 32], &[0x07u8; 32]).unwrap()
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = schedule()
            .expand_peer_secrets(SecurityLevel::Handshake, &[0x07u8; 32])
            .unwrap();
        let b = schedule()
            .expand_peer_secrets(SecurityLevel::Handshake, &[0x07u8; 32])
            .unwrap();

        assert_eq!(a.0.traffic_key().unwrap().key(), b.0.traffic_key().unwrap().key());
        assert_eq!(a.1.traffic_key().unwrap().iv(), b.1.traffic_key().unwrap().iv());
    }

    #[test]
    fn directions_are_independent() {
        let (client, server) = schedule()
            .expand_peer_secrets(SecurityLevel::Handshake, &[0x07u8; 32])
            .unwrap();
        assert_ne!(
            client.traffic_key().unwrap().key(),
            server.traffic_key().unwrap().key()
        );
    }

    #[test]
    fn phases_are_independent() {
        let hs = schedule()
            .expand_peer_secrets(SecurityLevel::Handshake, &[0x07u8; 32])
            .unwrap();
        let app = schedule()
            .expand_peer_secrets(SecurityLevel::Application, &[0x07u8; 32])
            .unwrap();

        assert_ne!(
            hs.0.traffic_key().unwrap().key(),
            app.0.traffic_key().unwrap().key()
        );
        assert_eq!(hs.0.level(), SecurityLevel::Handshake);
        assert_eq!(app.0.level(), SecurityLevel::Application);
    }

    #[test]
    fn transcript_binds_the_schedule() {
        let a = KeySchedule::root(&[0x42u8; 32], &[0x01u8; 32]).unwrap();
        let b = KeySchedule::root(&[0x42u8; 32], &[0x02u8; 32]).unwrap();
        let (ka, _) = a
            .expand_peer_secrets(SecurityLevel::Handshake, &[0x01u8; 32])
            .unwrap();
        let (kb, _) = b
            .expand_peer_secrets(SecurityLevel::Handshake, &[0x02u8; 32])
            .unwrap();
        assert_ne!(
            ka.traffic_key().unwrap().key(),
            kb.traffic_key().unwrap().key()
        );
    }

    #[test]
    fn update_chain_walks_forward() {
        let (secret, _) = schedule()
            .expand_peer_secrets(SecurityLevel::Application, &[0x07u8; 32])
            .unwrap();

        let next = secret.next().unwrap();
        let next_next = next.next().unwrap();

        assert_ne!(
            secret.traffic_key().unwrap().key(),
            next.traffic_key().unwrap().key()
        );
        assert_ne!(
            next.traffic_key().unwrap().key(),
            next_next.traffic_key().unwrap().key()
        );
        // Level is preserved across updates.
        assert_eq!(next_next.level(), SecurityLevel::Application);
    }

    #[test]
    fn key_and_iv_are_distinct_expansions() {
        let (secret, _) = schedule()
            .expand_peer_secrets(SecurityLevel::Application, &[0x07u8; 32])
            .unwrap();
        let key = secret.traffic_key().unwrap();
        assert_ne!(&key.key()[..TRAFFIC_IV_SIZE], &key.iv()[..]);
    }

    #[test]
    fn oversized_transcript_is_rejected() {
        let prk = [0u8; 32];
        let transcript = vec![0u8; 300];
        let mut out = [0u8; 32];
        assert!(hkdf_expand_label(&prk, "key", &transcript, &mut out).is_err());
    }
}
