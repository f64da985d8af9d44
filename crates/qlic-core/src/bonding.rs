//! Bonding records.
//!
//! A bond is the durable outcome of pairing: which peer this is, how to
//! reach it, and the public key a [`PretrustedVerifier`] should pin on the
//! next connection. Records are keyed by a stable bonding id derived from
//! the assigned connection id and the peer's link address, so re-pairing
//! the same device overwrites its old record instead of accumulating
//! duplicates.
//!
//! [`PretrustedVerifier`]: qlic_crypto::auth::PretrustedVerifier

use serde::{Deserialize, Serialize};

/// One bonded peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BondingRecord {
    /// Connection id assigned to this peer at bonding time
    pub assigned_id: u64,
    /// Link-layer address the peer was reached at
    pub peer_link_address: String,
    /// The peer's self-reported device identifier
    pub peer_device_id: String,
    /// The peer's pinned identity public key, hex encoded
    pub peer_public_key: String,
}

impl BondingRecord {
    /// Assemble a record, hex-encoding the identity key.
    #[must_use]
    pub fn new(
        assigned_id: u64,
        peer_link_address: impl Into<String>,
        peer_device_id: impl Into<String>,
        peer_public_key: &[u8; 32],
    ) -> Self {
        Self {
            assigned_id,
            peer_link_address: peer_link_address.into(),
            peer_device_id: peer_device_id.into(),
            peer_public_key: hex::encode(peer_public_key),
        }
    }

    /// The stable id this record is stored under.
    #[must_use]
    pub fn bonding_id(&self) -> String {
        bonding_id(self.assigned_id, &self.peer_link_address)
    }

    /// Decode the pinned identity key.
    ///
    /// # Errors
    ///
    /// Returns `None` if the stored hex is damaged or the wrong length.
    #[must_use]
    pub fn public_key(&self) -> Option<[u8; 32]> {
        let bytes = hex::decode(&self.peer_public_key).ok()?;
        bytes.try_into().ok()
    }
}

/// Stable bonding id: BLAKE3 over the assigned id and link address.
#[must_use]
pub fn bonding_id(assigned_id: u64, peer_link_address: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&assigned_id.to_be_bytes());
    hasher.update(peer_link_address.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Persistence seam for bonding records. The engine never does I/O itself;
/// the host wires in whatever storage the platform provides.
pub trait BondingStore: Send + Sync {
    /// Insert or overwrite the record under its bonding id.
    ///
    /// # Errors
    ///
    /// Returns the storage backend's error message.
    fn put(&mut self, record: BondingRecord) -> Result<(), String>;

    /// Fetch a record by bonding id.
    fn get(&self, bonding_id: &str) -> Option<BondingRecord>;

    /// Remove a record; `true` if it existed.
    fn remove(&mut self, bonding_id: &str) -> bool;

    /// Every stored record.
    fn list(&self) -> Vec<BondingRecord>;
}

/// Volatile in-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryBondingStore {
    records: std::collections::HashMap<String, BondingRecord>,
}

impl MemoryBondingStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BondingStore for MemoryBondingStore {
    fn put(&mut self, record: BondingRecord) -> Result<(), String> {
        self.records.insert(record.bonding_id(), record);
        Ok(())
    }

    fn get(&self, bonding_id: &str) -> Option<BondingRecord> {
        self.records.get(bonding_id).cloned()
    }

    fn remove(&mut self, bonding_id: &str) -> bool {
        self.records.remove(bonding_id).is_some()
    }

    fn list(&self) -> Vec<BondingRecord> {
        self.records.values().cloned().collect()
    }
}
