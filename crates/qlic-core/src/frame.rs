//! Stream-level frame encoding and decoding.
//!
//! Frames share a packet with handshake records; the first byte of every
//! frame is its type tag, and the connection engine dispatches on that tag
//! to whichever engine owns it. Handshake record tags live below 0x20
//! (see [`crate::handshake::record`]); stream frames use the 0x30 block.

use crate::error::WireError;
use crate::record::FrameReader;
use crate::stream::StreamId;
use crate::varint::{put_varint, varint_len};

/// Stream frame type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Stream payload bytes, optionally final
    StreamData = 0x30,
    /// Abnormal write-half termination with an application error code
    ResetStream = 0x31,
    /// Ask the peer to stop sending on a stream
    StopSending = 0x32,
    /// Cumulative delivery acknowledgment (bookkeeping only)
    Ack = 0x33,
}

impl TryFrom<u8> for FrameType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x30 => Ok(Self::StreamData),
            0x31 => Ok(Self::ResetStream),
            0x32 => Ok(Self::StopSending),
            0x33 => Ok(Self::Ack),
            _ => Err(WireError::UnknownFrameType(value)),
        }
    }
}

const FLAG_FIN: u8 = 0b0000_0001;

/// One stream-engine frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// Payload bytes for a stream; `fin` marks the final fragment
    Data {
        /// Target stream
        id: StreamId,
        /// Final fragment flag
        fin: bool,
        /// Payload bytes
        data: Vec<u8>,
    },
    /// Abnormal write-half termination
    Reset {
        /// Target stream
        id: StreamId,
        /// Application error code
        error_code: u64,
    },
    /// Request that the peer stop sending
    StopSending {
        /// Target stream
        id: StreamId,
        /// Application error code
        error_code: u64,
    },
    /// Cumulative delivered-byte acknowledgment
    Ack {
        /// Target stream
        id: StreamId,
        /// Cumulative received offset
        offset: u64,
    },
}

impl StreamFrame {
    /// The stream this frame addresses.
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        match self {
            Self::Data { id, .. }
            | Self::Reset { id, .. }
            | Self::StopSending { id, .. }
            | Self::Ack { id, .. } => *id,
        }
    }

    /// Exact encoded size in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        // Field widths are all within varint range by construction.
        let id_len = varint_len(self.stream_id().value()).unwrap_or(8);
        match self {
            Self::Data { data, .. } => {
                1 + id_len + 1 + varint_len(data.len() as u64).unwrap_or(8) + data.len()
            }
            Self::Reset { error_code, .. } | Self::StopSending { error_code, .. } => {
                1 + id_len + varint_len(*error_code).unwrap_or(8)
            }
            Self::Ack { offset, .. } => 1 + id_len + varint_len(*offset).unwrap_or(8),
        }
    }

    /// Serialize into `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::RecordTooLong`] for oversized data payloads.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        match self {
            Self::Data { id, fin, data } => {
                buf.push(FrameType::StreamData as u8);
                put_varint(buf, id.value())?;
                buf.push(if *fin { FLAG_FIN } else { 0 });
                crate::record::put_record(buf, data)?;
            }
            Self::Reset { id, error_code } => {
                buf.push(FrameType::ResetStream as u8);
                put_varint(buf, id.value())?;
                put_varint(buf, *error_code)?;
            }
            Self::StopSending { id, error_code } => {
                buf.push(FrameType::StopSending as u8);
                put_varint(buf, id.value())?;
                put_varint(buf, *error_code)?;
            }
            Self::Ack { id, offset } => {
                buf.push(FrameType::Ack as u8);
                put_varint(buf, id.value())?;
                put_varint(buf, *offset)?;
            }
        }
        Ok(())
    }

    /// Parse one frame, the type tag included, from the reader.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] on any malformed field; inside a complete
    /// packet truncation is malformed, not EOF.
    pub fn decode(reader: &mut FrameReader<'_>) -> Result<Self, WireError> {
        let frame_type = FrameType::try_from(reader.u8()?)?;
        let id = StreamId::from_value(reader.varint()?);
        match frame_type {
            FrameType::StreamData => {
                let flags = reader.u8()?;
                if flags & !FLAG_FIN != 0 {
                    return Err(WireError::InvalidField);
                }
                let data = reader.record()?.to_vec();
                Ok(Self::Data {
                    id,
                    fin: flags & FLAG_FIN != 0,
                    data,
                })
            }
            FrameType::ResetStream => Ok(Self::Reset {
                id,
                error_code: reader.varint()?,
            }),
            FrameType::StopSending => Ok(Self::StopSending {
                id,
                error_code: reader.varint()?,
            }),
            FrameType::Ack => Ok(Self::Ack {
                id,
                offset: reader.varint()?,
            }),
        }
    }
}
