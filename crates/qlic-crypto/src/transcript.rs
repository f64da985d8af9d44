//! Running handshake transcript hash.
//!
//! The transcript hash is a SHA-256 digest over every handshake record's
//! wire bytes, in the exact order sent or received. It binds the key
//! schedule to the negotiated parameters and is the payload signed by
//! AuthVerify records.

use crate::TRANSCRIPT_HASH_SIZE;
use sha2::{Digest, Sha256};

/// Incremental transcript hash over handshake record bytes.
#[derive(Clone)]
pub struct TranscriptHash {
    hasher: Sha256,
}

impl TranscriptHash {
    /// Create an empty transcript.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    /// Absorb the wire bytes of one handshake record.
    pub fn absorb(&mut self, record_bytes: &[u8]) {
        self.hasher.update(record_bytes);
    }

    /// Snapshot the current hash without consuming the running state.
    ///
    /// AuthVerify signatures cover the transcript *before* the AuthVerify
    /// record itself, so callers snapshot first and absorb after.
    #[must_use]
    pub fn current(&self) -> [u8; TRANSCRIPT_HASH_SIZE] {
        self.hasher.clone().finalize().into()
    }
}

impl Default for TranscriptHash {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn matches_known_sha256_vectors() {
        let empty = TranscriptHash::new();
        assert_eq!(
            hex::encode(empty.current()),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );

        let mut abc = TranscriptHash::new();
        abc.absorb(b"abc");
        assert_eq!(
            hex::encode(abc.current()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn snapshot_does_not_consume() {
        let mut t = TranscriptHash::new();
        t.absorb(b"hello-record");

        let first = t.current();
        let second = t.current();
        assert_eq!(first, second);

        t.absorb(b"more");
        assert_ne!(t.current(), first);
    }

    #[test]
    fn order_matters() {
        let mut a = TranscriptHash::new();
        a.absorb(b"one");
        a.absorb(b"two");

        let mut b = TranscriptHash::new();
        b.absorb(b"two");
        b.absorb(b"one");

        assert_ne!(a.current(), b.current());
    }

    #[test]
    fn split_absorbs_match_concatenated() {
        let mut a = TranscriptHash::new();
        a.absorb(b"client");
        a.absorb(b"hello");

        let mut b = TranscriptHash::new();
        b.absorb(b"clienthello");

        assert_eq!(a.current(), b.current());
    }

    proptest! {
        #[test]
        fn any_split_matches_the_whole(data in proptest::collection::vec(any::<u8>(), 0..256), cut in 0usize..256) {
            let cut = cut.min(data.len());

            let mut split = TranscriptHash::new();
            split.absorb(&data[..cut]);
            split.absorb(&data[cut..]);

            let mut whole = TranscriptHash::new();
            whole.absorb(&data);

            prop_assert_eq!(split.current(), whole.current());
        }
    }
}
