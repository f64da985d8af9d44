//! The QLIC handshake: record codec and the sequential protocol engine.

pub mod engine;
pub mod record;

pub use engine::{HandshakeConfig, HandshakeEngine, HandshakeEvent, Role};
pub use record::{HandshakeRecord, RecordType};
