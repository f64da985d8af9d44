//! # QLIC Core
//!
//! The QLIC protocol engine: a secure multiplexed transport for a
//! companion/wearable pair over an ordered reliable link (BLE L2CAP in
//! production, an in-memory pipe in tests).
//!
//! The crate is layered as sequential cores composed under one lock:
//!
//! - [`varint`] / [`record`]: the wire codec. QUIC-style variable-length
//!   integers, length-delimited records, packet assembly and parsing
//! - [`frame`]: stream-level frames sharing the packet space with
//!   handshake records
//! - [`handshake`]: the record codec and the handshake state machine
//!   (hellos, algorithm negotiation, mutual attestation, key updates)
//! - [`stream`]: stream multiplexing with independent read/write halves
//! - [`connection`]: the composition root plus the async [`Connection`]
//!   handle driving everything over a [`Link`]
//! - [`bonding`]: durable pairing records
//!
//! Cryptography (key schedule, transcript, AEAD, attestation) lives in the
//! `qlic-crypto` crate.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod bonding;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod link;
pub mod record;
pub mod stream;
pub mod varint;

pub use connection::{Connection, MAX_PACKET_SIZE};
pub use error::{CloseReason, Error, HandshakeError, StreamError, WireError};
pub use link::Link;
pub use stream::StreamId;
