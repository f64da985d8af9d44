//! Error types for the QLIC core protocol.
//!
//! The taxonomy mirrors the blast radius of each failure: wire and
//! handshake errors are fatal to the whole connection, stream errors are
//! scoped to one stream, and cancellation is an expected outcome surfaced
//! only to the cancelled call.

use crate::handshake::record::RecordType;
use thiserror::Error;

/// Umbrella error for connection-level operations
#[derive(Debug, Error)]
pub enum Error {
    /// Wire decoding error
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Handshake protocol error
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Stream-scoped error
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] qlic_crypto::CryptoError),

    /// The connection was torn down
    #[error("connection closed: {0}")]
    Closed(CloseReason),
}

/// Terminal reason reported when a connection closes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CloseReason {
    /// Local side closed deliberately
    #[error("closed by local peer")]
    LocalClose,

    /// A malformed packet, record, or frame was received
    #[error("malformed input")]
    DecodeFailure,

    /// The handshake sequence was violated or authentication failed
    #[error("handshake failure")]
    HandshakeFailure,

    /// A packet failed to decrypt under the active receive key
    #[error("decryption failure")]
    DecryptFailure,

    /// The underlying link reported an error or was closed
    #[error("link failure")]
    LinkFailure,
}

/// Frame- and record-level decoding errors. Always fatal to the connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Input ended inside a structure that a complete packet must contain
    #[error("truncated input")]
    Truncated,

    /// A varint value exceeds the 62-bit encodable range
    #[error("value out of varint range: {0}")]
    VarintRange(u64),

    /// A record declared more bytes than the hard ceiling allows
    #[error("record length {declared} exceeds ceiling {ceiling}")]
    RecordTooLong {
        /// Length declared by the record header
        declared: u64,
        /// Hard ceiling the decoder enforces
        ceiling: usize,
    },

    /// Unknown frame type byte
    #[error("unknown frame type: 0x{0:02X}")]
    UnknownFrameType(u8),

    /// A frame field held a value the protocol does not permit
    #[error("invalid field value")]
    InvalidField,

    /// The packet writer ran out of budget
    #[error("packet budget exceeded")]
    BudgetExceeded,
}

/// Handshake sequence and authentication errors. Fatal to the connection;
/// there is no partial-handshake recovery.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// A record arrived while the engine expected a different type.
    /// Carries the offending record type for diagnostics.
    #[error("unexpected {got:?} record while expecting {expected}")]
    UnexpectedRecord {
        /// What the state machine was waiting for
        expected: &'static str,
        /// The record that actually arrived
        got: RecordType,
    },

    /// A record could not be decoded
    #[error("malformed handshake record: {0}")]
    Decode(#[from] WireError),

    /// AuthRequest carried index 0 or an index past the advertised list
    #[error("no compatible authentication algorithm")]
    NoCompatibleAlgorithm,

    /// Attestation or transcript signature verification failed
    #[error("authentication failed: {0}")]
    AuthenticationFailed(qlic_crypto::CryptoError),

    /// Data was queued for transmit while a key update awaits confirmation
    #[error("transmit key update not yet confirmed")]
    KeyUpdateNotConfirmed,

    /// A record followed a key-rotation point inside the same packet
    #[error("record crossed a key update boundary")]
    KeyBoundaryViolated,

    /// Key schedule or key exchange failure
    #[error("crypto failure: {0}")]
    Crypto(#[from] qlic_crypto::CryptoError),

    /// A handshake record arrived after the handshake completed and was
    /// not a KeyUpdate
    #[error("handshake already complete")]
    AlreadyComplete,

    /// A post-handshake operation was attempted before establishment
    #[error("handshake not yet complete")]
    NotEstablished,
}

/// Stream-scoped errors. Never affect other streams or the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The half is closed normally; no further transfer is possible
    #[error("stream closed")]
    Closed,

    /// The peer reset the stream with an application error code
    #[error("stream reset by peer: code {0}")]
    Reset(u64),

    /// The peer asked us to stop sending with an application error code
    #[error("peer stopped reading: code {0}")]
    Stopped(u64),

    /// The read half was closed locally with an application error code
    #[error("read half closed locally: code {0}")]
    ReadAborted(u64),

    /// A pending receive was cancelled by its caller
    #[error("receive cancelled")]
    Cancelled,

    /// The stream id is unknown (already destroyed or never opened)
    #[error("unknown stream: {0}")]
    UnknownStream(u64),

    /// The connection died underneath the stream
    #[error("connection closed: {0}")]
    ConnectionClosed(CloseReason),
}
