//! Handshake record encoding and decoding.
//!
//! Every record is `u8(recordType)` followed by record-specific fields.
//! Byte-sequence fields are length-delimited records; counted collections
//! are `varint(count)` followed by that many elements. The type tags are
//! part of the stable wire contract and must match on both peers.

use crate::error::WireError;
use crate::record::FrameReader;
use crate::varint::put_varint;

/// Size of the client/server hello random contribution.
pub const RANDOM_SIZE: usize = 32;

/// Upper bound on advertised algorithm list length; a peer listing more is
/// malformed.
pub const MAX_ALGORITHMS: u64 = 32;

/// Handshake record type tags (stable wire contract)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    /// Opens every connection; carries randoms, key share, algorithm lists
    ClientHello = 0x01,
    /// Server's random and key share
    ServerHello = 0x02,
    /// Remote attestation payload
    AuthShare = 0x0B,
    /// Server's algorithm selection (1-based indexes, 0 = no match)
    AuthRequest = 0x0D,
    /// Transcript signature
    AuthVerify = 0x0F,
    /// Post-handshake traffic-key rotation
    KeyUpdate = 0x18,
}

impl RecordType {
    /// Whether `tag` belongs to the handshake record tag space.
    #[must_use]
    pub fn owns_tag(tag: u8) -> bool {
        Self::try_from(tag).is_ok()
    }
}

impl TryFrom<u8> for RecordType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::ClientHello),
            0x02 => Ok(Self::ServerHello),
            0x0B => Ok(Self::AuthShare),
            0x0D => Ok(Self::AuthRequest),
            0x0F => Ok(Self::AuthVerify),
            0x18 => Ok(Self::KeyUpdate),
            _ => Err(WireError::UnknownFrameType(value)),
        }
    }
}

/// A decoded handshake record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeRecord {
    /// Connection opener
    ClientHello {
        /// Client random contribution
        client_random: [u8; RANDOM_SIZE],
        /// Client X25519 key share
        key_share: Vec<u8>,
        /// Algorithms the client can use to prove its identity, in
        /// preference order
        client_auth_algorithms: Vec<u64>,
        /// Algorithms the client accepts to verify the server, in
        /// preference order
        server_auth_algorithms: Vec<u64>,
    },
    /// Server's hello response
    ServerHello {
        /// Server random contribution
        server_random: [u8; RANDOM_SIZE],
        /// Server X25519 key share
        key_share: Vec<u8>,
    },
    /// Algorithm selection; indexes are 1-based into the ClientHello
    /// lists, 0 meaning "no compatible algorithm"
    AuthRequest {
        /// Index into `client_auth_algorithms`
        client_algorithm_index: u64,
        /// Index into `server_auth_algorithms`
        server_algorithm_index: u64,
    },
    /// Identity attestation payload
    AuthShare {
        /// Opaque attestation bytes for the negotiated algorithm
        attestation: Vec<u8>,
    },
    /// Signature over the transcript hash up to (excluding) this record
    AuthVerify {
        /// Opaque signature bytes
        signature: Vec<u8>,
    },
    /// Traffic-key rotation
    KeyUpdate {
        /// Whether the sender asks the receiver to rotate as well
        update_requested: bool,
    },
}

impl HandshakeRecord {
    /// This record's type tag.
    #[must_use]
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::ClientHello { .. } => RecordType::ClientHello,
            Self::ServerHello { .. } => RecordType::ServerHello,
            Self::AuthRequest { .. } => RecordType::AuthRequest,
            Self::AuthShare { .. } => RecordType::AuthShare,
            Self::AuthVerify { .. } => RecordType::AuthVerify,
            Self::KeyUpdate { .. } => RecordType::KeyUpdate,
        }
    }

    /// Serialize the record, tag included, into `buf`.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] for out-of-range fields.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        buf.push(self.record_type() as u8);
        match self {
            Self::ClientHello {
                client_random,
                key_share,
                client_auth_algorithms,
                server_auth_algorithms,
            } => {
                crate::record::put_record(buf, client_random)?;
                crate::record::put_record(buf, key_share)?;
                put_algorithms(buf, client_auth_algorithms)?;
                put_algorithms(buf, server_auth_algorithms)?;
            }
            Self::ServerHello {
                server_random,
                key_share,
            } => {
                crate::record::put_record(buf, server_random)?;
                crate::record::put_record(buf, key_share)?;
            }
            Self::AuthRequest {
                client_algorithm_index,
                server_algorithm_index,
            } => {
                put_varint(buf, *client_algorithm_index)?;
                put_varint(buf, *server_algorithm_index)?;
            }
            Self::AuthShare { attestation } => {
                crate::record::put_record(buf, attestation)?;
            }
            Self::AuthVerify { signature } => {
                crate::record::put_record(buf, signature)?;
            }
            Self::KeyUpdate { update_requested } => {
                buf.push(u8::from(*update_requested));
            }
        }
        Ok(())
    }

    /// Serialize to a fresh buffer.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] for out-of-range fields.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Parse one record, tag included, from the reader.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] on malformed input.
    pub fn decode(reader: &mut FrameReader<'_>) -> Result<Self, WireError> {
        let record_type = RecordType::try_from(reader.u8()?)?;
        match record_type {
            RecordType::ClientHello => Ok(Self::ClientHello {
                client_random: fixed_random(reader.record()?)?,
                key_share: reader.record()?.to_vec(),
                client_auth_algorithms: read_algorithms(reader)?,
                server_auth_algorithms: read_algorithms(reader)?,
            }),
            RecordType::ServerHello => Ok(Self::ServerHello {
                server_random: fixed_random(reader.record()?)?,
                key_share: reader.record()?.to_vec(),
            }),
            RecordType::AuthRequest => Ok(Self::AuthRequest {
                client_algorithm_index: reader.varint()?,
                server_algorithm_index: reader.varint()?,
            }),
            RecordType::AuthShare => Ok(Self::AuthShare {
                attestation: reader.record()?.to_vec(),
            }),
            RecordType::AuthVerify => Ok(Self::AuthVerify {
                signature: reader.record()?.to_vec(),
            }),
            RecordType::KeyUpdate => {
                let flag = reader.u8()?;
                if flag > 1 {
                    return Err(WireError::InvalidField);
                }
                Ok(Self::KeyUpdate {
                    update_requested: flag == 1,
                })
            }
        }
    }
}

fn fixed_random(bytes: &[u8]) -> Result<[u8; RANDOM_SIZE], WireError> {
    bytes.try_into().map_err(|_| WireError::InvalidField)
}

fn put_algorithms(buf: &mut Vec<u8>, algorithms: &[u64]) -> Result<(), WireError> {
    if algorithms.len() as u64 > MAX_ALGORITHMS {
        return Err(WireError::InvalidField);
    }
    put_varint(buf, algorithms.len() as u64)?;
    for algorithm in algorithms {
        put_varint(buf, *algorithm)?;
    }
    Ok(())
}

fn read_algorithms(reader: &mut FrameReader<'_>) -> Result<Vec<u64>, WireError> {
    let count = reader.varint()?;
    if count > MAX_ALGORITHMS {
        return Err(WireError::InvalidField);
    }
    let mut algorithms = Vec::with_capacity(count as usize);
    for _ in 0..count {
        algorithms.push(reader.varint()?);
    }
    Ok(algorithms)
}
