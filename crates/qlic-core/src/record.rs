//! Length-delimited records and packet framing.
//!
//! A record is a varint byte-count followed by that many raw bytes. A
//! packet is one record whose payload carries serialized frames; a packet
//! record of length zero means "end of stream" to the framing layer.
//!
//! [`PacketWriter`] lets the caller write a payload of unknown final length
//! into a pre-allocated buffer: a header region sized from the buffer's
//! *capacity* is reserved up front, frame bytes land after it, and
//! `finish` re-encodes the true payload length right-justified at the tail
//! of the reservation. Only the leading slack is discarded; payload bytes
//! are never copied a second time.

use crate::error::WireError;
use crate::varint::{decode_varint, put_varint, put_varint_width, varint_len};

/// Hard ceiling on a single record's declared length.
pub const MAX_RECORD_LEN: usize = 1 << 16;

/// Append a length-delimited record.
///
/// # Errors
///
/// Returns [`WireError::RecordTooLong`] past [`MAX_RECORD_LEN`].
pub fn put_record(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), WireError> {
    if bytes.len() > MAX_RECORD_LEN {
        return Err(WireError::RecordTooLong {
            declared: bytes.len() as u64,
            ceiling: MAX_RECORD_LEN,
        });
    }
    put_varint(buf, bytes.len() as u64)?;
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Decode one record from the head of `buf`.
///
/// `Ok(None)` means the buffer does not yet hold a complete record, an
/// expected condition on a live byte pipe rather than an error. A declared length
/// past the ceiling is malformed and fatal, reported before any payload
/// bytes are consumed.
pub fn decode_record(buf: &[u8], ceiling: usize) -> Result<Option<(&[u8], usize)>, WireError> {
    let Some((declared, header)) = decode_varint(buf) else {
        return Ok(None);
    };
    if declared > ceiling as u64 {
        return Err(WireError::RecordTooLong { declared, ceiling });
    }
    let declared = declared as usize;
    if buf.len() < header + declared {
        return Ok(None);
    }
    Ok(Some((&buf[header..header + declared], header + declared)))
}

/// Fixed-capacity packet assembly with a reserved, late-filled header.
pub struct PacketWriter {
    buf: Vec<u8>,
    capacity: usize,
    reserved: usize,
}

impl PacketWriter {
    /// Create a writer for a packet of at most `capacity` bytes, header
    /// included. The reservation is sized from the capacity, not from the
    /// payload the caller eventually writes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::VarintRange`] for absurd capacities.
    pub fn new(capacity: usize) -> Result<Self, WireError> {
        let reserved = varint_len(capacity as u64)?;
        let mut buf = Vec::with_capacity(capacity);
        buf.resize(reserved, 0);
        Ok(Self {
            buf,
            capacity,
            reserved,
        })
    }

    /// Bytes still available for payload.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Payload bytes written so far.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.buf.len() - self.reserved
    }

    /// Whether any payload has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload_len() == 0
    }

    /// Append frame bytes to the payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::BudgetExceeded`] if the bytes do not fit.
    pub fn put(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        if bytes.len() > self.remaining() {
            return Err(WireError::BudgetExceeded);
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Finalize: encode the payload length right-justified at the tail of
    /// the reservation and return the header+payload span.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::VarintRange`] only if internal accounting is
    /// violated; it cannot occur for payloads within capacity.
    pub fn finish(mut self) -> Result<Vec<u8>, WireError> {
        let payload_len = self.payload_len();
        let width = varint_len(payload_len as u64)?;
        let start = self.reserved - width;
        put_varint_width(&mut self.buf[start..self.reserved], payload_len as u64)?;
        self.buf.drain(..start);
        Ok(self.buf)
    }
}

/// Borrowing reader over a fully-delimited packet body.
///
/// Inside a complete packet truncation is malformed input, never EOF.
pub struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    /// Wrap a packet payload.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Whether all bytes have been consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Current read position, usable with [`Self::taken_since`].
    #[must_use]
    pub fn mark(&self) -> usize {
        self.pos
    }

    /// The exact wire bytes consumed since `mark` (e.g. for the handshake
    /// transcript).
    #[must_use]
    pub fn taken_since(&self, mark: usize) -> &'a [u8] {
        &self.buf[mark..self.pos]
    }

    /// Peek the next byte without consuming it.
    #[must_use]
    pub fn peek_u8(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    /// Read one byte.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] at end of input.
    pub fn u8(&mut self) -> Result<u8, WireError> {
        let byte = *self.buf.get(self.pos).ok_or(WireError::Truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    /// Read `n` raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] if fewer remain.
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() - self.pos < n {
            return Err(WireError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Read one varint.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] on incomplete input.
    pub fn varint(&mut self) -> Result<u64, WireError> {
        let (value, consumed) =
            decode_varint(&self.buf[self.pos..]).ok_or(WireError::Truncated)?;
        self.pos += consumed;
        Ok(value)
    }

    /// Read one length-delimited record.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::RecordTooLong`] past the ceiling and
    /// [`WireError::Truncated`] if the declared length reads past the
    /// available input.
    pub fn record(&mut self) -> Result<&'a [u8], WireError> {
        let declared = self.varint()?;
        if declared > MAX_RECORD_LEN as u64 {
            return Err(WireError::RecordTooLong {
                declared,
                ceiling: MAX_RECORD_LEN,
            });
        }
        self.bytes(declared as usize)
    }
}
