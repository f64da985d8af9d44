//! The connection engine.
//!
//! [`ConnectionInner`] is the sequential composition root: one handshake
//! engine, one stream engine, and the per-direction AEAD state. It turns
//! link bytes into engine deliveries (`ingest`) and engine output into
//! sealed packets (`poll_transmit`), with no waiting of its own.
//!
//! [`Connection`] is the shared handle: the inner core behind a mutex, a
//! [`Notify`] as the "something changed" signal, and a `drive` pump that
//! couples the core to a [`Link`]. All public calls lock briefly and never
//! hold the lock across an await point.

use crate::error::{CloseReason, Error, HandshakeError, StreamError, WireError};
use crate::frame::StreamFrame;
use crate::handshake::record::RecordType;
use crate::handshake::{
    HandshakeConfig, HandshakeEngine, HandshakeEvent, HandshakeRecord, Role,
};
use crate::link::Link;
use crate::record::{decode_record, FrameReader, PacketWriter, MAX_RECORD_LEN};
use crate::stream::{StreamEngine, StreamId};
use crate::varint::varint_len;
use qlic_crypto::aead::{TrafficOpener, TrafficSealer};
use qlic_crypto::auth::{IdentityProvider, IdentityVerifier};
use qlic_crypto::{CryptoGuard, TAG_SIZE};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, Notify};

/// Ceiling on one wire packet, header and AEAD tag included. Sized for a
/// BLE L2CAP MTU with headroom.
pub const MAX_PACKET_SIZE: usize = 1024;

/// Bytes pulled off the link per read.
const LINK_READ_CHUNK: usize = 4096;

/// Ceiling on buffered handshake bytes awaiting a record boundary. Every
/// record field is length-limited to [`MAX_RECORD_LEN`], so any legal
/// record completes well inside this.
const HANDSHAKE_BUFFER_CEILING: usize = 4 * MAX_RECORD_LEN;

/// The sequential connection core.
struct ConnectionInner {
    handshake: HandshakeEngine,
    streams: StreamEngine,
    sealer: Option<TrafficSealer>,
    opener: Option<TrafficOpener>,
    rx_buf: Vec<u8>,
    // Handshake bytes carried over from a packet that ended mid-record.
    hs_rx: Vec<u8>,
    close_reason: Option<CloseReason>,
}

impl ConnectionInner {
    fn new(
        role: Role,
        config: HandshakeConfig,
        provider: Arc<dyn IdentityProvider>,
        verifier: Arc<dyn IdentityVerifier>,
        guard: CryptoGuard,
    ) -> Result<Self, Error> {
        let handshake = match role {
            Role::Client => HandshakeEngine::new_client(config, provider, verifier, guard)?,
            Role::Server => HandshakeEngine::new_server(config, provider, verifier, guard)?,
        };
        Ok(Self {
            handshake,
            streams: StreamEngine::new(role),
            sealer: None,
            opener: None,
            rx_buf: Vec::new(),
            hs_rx: Vec::new(),
            close_reason: None,
        })
    }

    /// Feed raw link bytes; packets are reassembled across calls.
    fn ingest(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if self.close_reason.is_some() {
            return Ok(());
        }
        self.rx_buf.extend_from_slice(bytes);
        loop {
            let (body, consumed) = match decode_record(&self.rx_buf, MAX_PACKET_SIZE) {
                Ok(Some((body, consumed))) => (body.to_vec(), consumed),
                Ok(None) => break,
                Err(e) => return Err(self.fail_with(Error::Wire(e))),
            };
            self.rx_buf.drain(..consumed);
            if let Err(e) = self.handle_packet(&body) {
                return Err(self.fail_with(e));
            }
        }
        Ok(())
    }

    fn handle_packet(&mut self, body: &[u8]) -> Result<(), Error> {
        let plaintext = match self.opener.as_mut() {
            Some(opener) => opener.open(&[], body)?,
            None => body.to_vec(),
        };

        // A packet carries either handshake records or stream frames,
        // never both (see `build_packet`). Handshake records may span
        // packets; a packet arriving while a record tail is outstanding
        // continues that record.
        let continues_record = !self.hs_rx.is_empty();
        let starts_record = plaintext.first().is_some_and(|tag| RecordType::owns_tag(*tag));
        if continues_record || starts_record {
            return self.deliver_handshake_bytes(&plaintext);
        }

        if !self.handshake.is_established() {
            return Err(HandshakeError::NotEstablished.into());
        }
        let mut reader = FrameReader::new(&plaintext);
        while !reader.is_empty() {
            let frame = StreamFrame::decode(&mut reader).map_err(Error::Wire)?;
            self.streams.handle_frame(frame);
        }
        Ok(())
    }

    /// Buffer handshake bytes and deliver every complete record in them.
    fn deliver_handshake_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.hs_rx.extend_from_slice(bytes);
        while !self.hs_rx.is_empty() {
            let mut reader = FrameReader::new(&self.hs_rx);
            let record = match HandshakeRecord::decode(&mut reader) {
                Ok(record) => record,
                // The tail of this record is still in flight.
                Err(WireError::Truncated) => {
                    if self.hs_rx.len() > HANDSHAKE_BUFFER_CEILING {
                        return Err(Error::Wire(WireError::RecordTooLong {
                            declared: self.hs_rx.len() as u64,
                            ceiling: HANDSHAKE_BUFFER_CEILING,
                        }));
                    }
                    return Ok(());
                }
                Err(e) => return Err(HandshakeError::Decode(e).into()),
            };
            let consumed = reader.mark();
            let wire: Vec<u8> = self.hs_rx.drain(..consumed).collect();
            let mut rotated = false;
            for event in self.handshake.deliver_record(record, &wire)? {
                match event {
                    HandshakeEvent::InstallRxKey(key) => {
                        tracing::debug!(level = ?key.level(), "receive key installed");
                        self.opener = Some(TrafficOpener::new(key));
                        rotated = true;
                    }
                    HandshakeEvent::Established => {
                        tracing::debug!("connection established");
                    }
                }
            }
            // Nothing may follow a rotation point under the old key; the
            // sender is required to start a fresh packet under the new one.
            if rotated && !self.hs_rx.is_empty() {
                return Err(HandshakeError::KeyBoundaryViolated.into());
            }
        }
        Ok(())
    }

    /// Assemble the next outbound packet, or `None` when idle.
    fn poll_transmit(&mut self) -> Result<Option<Vec<u8>>, Error> {
        if self.close_reason.is_some() {
            return Ok(None);
        }
        match self.build_packet() {
            Ok(packet) => Ok(packet),
            Err(e) => Err(self.fail_with(e)),
        }
    }

    fn build_packet(&mut self) -> Result<Option<Vec<u8>>, Error> {
        loop {
            while let Some(key) = self.handshake.install_tx_key() {
                tracing::debug!(level = ?key.level(), "transmit key installed");
                self.sealer = Some(TrafficSealer::new(key));
            }

            if self.handshake.is_established()
                && self.sealer.as_ref().is_some_and(TrafficSealer::needs_rekey)
                && !self.handshake.rotation_pending()
            {
                tracing::warn!("rekey threshold crossed, rotating transmit key");
                self.handshake.deliver_key_update_trigger(true)?;
            }

            let header = varint_len(MAX_PACKET_SIZE as u64).map_err(Error::Wire)?;
            let overhead = if self.sealer.is_some() { TAG_SIZE } else { 0 };
            let budget = MAX_PACKET_SIZE - header - overhead;

            let mut payload = match self.handshake.dequeue_transmit(budget) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => Vec::new(),
                // A sealed flight just drained; install the key and retry.
                Err(HandshakeError::KeyUpdateNotConfirmed) => continue,
                Err(e) => return Err(e.into()),
            };

            // Stream frames never share a packet with handshake records,
            // so a packet can never straddle a key boundary.
            if payload.is_empty() && self.handshake.is_established() {
                while payload.len() < budget {
                    let Some(frame) = self.streams.next_frame(budget - payload.len()) else {
                        break;
                    };
                    frame.encode(&mut payload).map_err(Error::Wire)?;
                }
            }
            if payload.is_empty() {
                return Ok(None);
            }

            let body = match self.sealer.as_mut() {
                Some(sealer) => sealer.seal(&[], &payload)?,
                None => payload,
            };
            let mut writer = PacketWriter::new(MAX_PACKET_SIZE).map_err(Error::Wire)?;
            writer.put(&body).map_err(Error::Wire)?;
            return Ok(Some(writer.finish().map_err(Error::Wire)?));
        }
    }

    /// Tear down: release both traffic keys, fail every pending stream
    /// call, record one terminal reason. Idempotent; the first reason wins.
    fn fail(&mut self, reason: CloseReason) {
        if self.close_reason.is_some() {
            return;
        }
        self.close_reason = Some(reason);
        self.sealer = None;
        self.opener = None;
        self.streams.fail_all(reason);
        if reason == CloseReason::LocalClose {
            tracing::debug!("connection closed locally");
        } else {
            tracing::warn!(%reason, "connection failed");
        }
    }

    fn fail_with(&mut self, error: Error) -> Error {
        let reason = match &error {
            Error::Wire(_) => CloseReason::DecodeFailure,
            Error::Handshake(_) => CloseReason::HandshakeFailure,
            Error::Crypto(_) => CloseReason::DecryptFailure,
            Error::Closed(reason) => *reason,
            Error::Stream(_) => CloseReason::LocalClose,
        };
        self.fail(reason);
        error
    }

    fn check_open(&self) -> Result<(), Error> {
        match self.close_reason {
            Some(reason) => Err(Error::Closed(reason)),
            None => Ok(()),
        }
    }
}

/// A QLIC connection handle. Cheap to clone; all clones share one core.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Mutex<ConnectionInner>>,
    changed: Arc<Notify>,
}

impl Connection {
    /// Create the client (connecting) side.
    ///
    /// # Errors
    ///
    /// Returns a [`HandshakeError`] if hello construction fails.
    pub fn connect(
        provider: Arc<dyn IdentityProvider>,
        verifier: Arc<dyn IdentityVerifier>,
        guard: CryptoGuard,
    ) -> Result<Self, Error> {
        Self::with_config(Role::Client, HandshakeConfig::default(), provider, verifier, guard)
    }

    /// Create the server (accepting) side.
    ///
    /// # Errors
    ///
    /// Returns a [`HandshakeError`] if engine construction fails.
    pub fn accept(
        provider: Arc<dyn IdentityProvider>,
        verifier: Arc<dyn IdentityVerifier>,
        guard: CryptoGuard,
    ) -> Result<Self, Error> {
        Self::with_config(Role::Server, HandshakeConfig::default(), provider, verifier, guard)
    }

    /// Create either side with explicit handshake configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`HandshakeError`] if engine construction fails.
    pub fn with_config(
        role: Role,
        config: HandshakeConfig,
        provider: Arc<dyn IdentityProvider>,
        verifier: Arc<dyn IdentityVerifier>,
        guard: CryptoGuard,
    ) -> Result<Self, Error> {
        let inner = ConnectionInner::new(role, config, provider, verifier, guard)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
            changed: Arc::new(Notify::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        // The core holds no invariant across a panic; recover and continue.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn shutdown(&self, reason: CloseReason) -> Error {
        let reason = {
            let mut inner = self.lock();
            inner.fail(reason);
            inner.close_reason.unwrap_or(reason)
        };
        self.changed.notify_waiters();
        Error::Closed(reason)
    }

    /// Pump the connection over a link until it closes.
    ///
    /// Exactly one task should drive a connection; every other handle just
    /// queues work and waits on the results.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`Error::Closed`] reason for every outcome
    /// except a deliberate local close.
    pub async fn drive<L: Link + ?Sized>(&self, link: &L) -> Result<(), Error> {
        let mut buf = vec![0u8; LINK_READ_CHUNK];
        loop {
            self.flush(link).await?;
            self.changed.notify_waiters();

            // Register for wakeups before the final look at the state.
            // A call that queues work or closes after this point completes
            // `changed` inside the select; one that landed before it is
            // caught by the second flush and the close check below.
            let changed = self.changed.notified();
            self.flush(link).await?;

            let closed = self.lock().close_reason;
            if let Some(reason) = closed {
                let _ = link.close().await;
                if reason == CloseReason::LocalClose {
                    return Ok(());
                }
                return Err(Error::Closed(reason));
            }

            tokio::select! {
                read = link.read(&mut buf) => match read {
                    Ok(0) | Err(_) => return Err(self.shutdown(CloseReason::LinkFailure)),
                    Ok(n) => {
                        let outcome = self.lock().ingest(&buf[..n]);
                        self.changed.notify_waiters();
                        if let Err(e) = outcome {
                            let _ = link.close().await;
                            return Err(e);
                        }
                    }
                },
                () = changed => {}
            }
        }
    }

    /// Write every sendable packet to the link.
    async fn flush<L: Link + ?Sized>(&self, link: &L) -> Result<(), Error> {
        loop {
            let packet = self.lock().poll_transmit();
            match packet {
                Ok(Some(packet)) => {
                    if link.write_all(&packet).await.is_err() {
                        return Err(self.shutdown(CloseReason::LinkFailure));
                    }
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    let _ = link.close().await;
                    self.changed.notify_waiters();
                    return Err(e);
                }
            }
        }
    }

    /// Wait until the handshake completes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the connection dies first.
    pub async fn established(&self) -> Result<(), Error> {
        loop {
            let notified = self.changed.notified();
            {
                let inner = self.lock();
                inner.check_open()?;
                if inner.handshake.is_established() {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Whether the handshake has completed.
    #[must_use]
    pub fn is_established(&self) -> bool {
        self.lock().handshake.is_established()
    }

    /// The terminal close reason, once the connection has died.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lock().close_reason
    }

    /// Open a new locally-initiated stream.
    ///
    /// # Errors
    ///
    /// Fails before establishment or after close.
    pub fn open_stream(&self, unidirectional: bool) -> Result<StreamId, Error> {
        let id = {
            let mut inner = self.lock();
            inner.check_open()?;
            if !inner.handshake.is_established() {
                return Err(HandshakeError::NotEstablished.into());
            }
            inner.streams.open(unidirectional)
        };
        self.changed.notify_waiters();
        Ok(id)
    }

    /// Wait for the peer to open a stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the connection dies first.
    pub async fn accept_stream(&self) -> Result<StreamId, Error> {
        loop {
            let notified = self.changed.notified();
            {
                let mut inner = self.lock();
                inner.check_open()?;
                if let Some(id) = inner.streams.take_incoming() {
                    return Ok(id);
                }
            }
            notified.await;
        }
    }

    /// Queue bytes on a stream's write half.
    ///
    /// # Errors
    ///
    /// Fails with the write half's stored cause once it is closed.
    pub fn send(&self, id: StreamId, data: &[u8]) -> Result<(), Error> {
        {
            let mut inner = self.lock();
            inner.check_open()?;
            inner.streams.send(id, data, false).map_err(Error::Stream)?;
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Close the write half normally: queued bytes drain, then FIN.
    ///
    /// # Errors
    ///
    /// Fails if the half is already closed.
    pub fn finish(&self, id: StreamId) -> Result<(), Error> {
        {
            let mut inner = self.lock();
            inner.check_open()?;
            inner.streams.finish(id).map_err(Error::Stream)?;
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Abort the write half: queued bytes are dropped and the peer gets a
    /// reset carrying `error_code`.
    ///
    /// # Errors
    ///
    /// Fails for an unknown stream.
    pub fn reset(&self, id: StreamId, error_code: u64) -> Result<(), Error> {
        {
            let mut inner = self.lock();
            inner.check_open()?;
            inner.streams.reset(id, error_code).map_err(Error::Stream)?;
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Close the read half locally and ask the peer to stop sending.
    ///
    /// # Errors
    ///
    /// Fails for an unknown stream.
    pub fn close_read(&self, id: StreamId, error_code: u64) -> Result<(), Error> {
        {
            let mut inner = self.lock();
            inner.check_open()?;
            inner
                .streams
                .close_read(id, error_code)
                .map_err(Error::Stream)?;
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Receive between `min` and `max` bytes from a stream.
    ///
    /// Resolves as soon as `min` bytes (or the stream's end) are available.
    /// Dropping the future withdraws the request; if `cancellation_code` is
    /// set, the drop also closes the read half with that code, otherwise
    /// cancellation leaves the stream untouched.
    ///
    /// # Errors
    ///
    /// Fails with the read half's stored cause, or [`StreamError::Closed`]
    /// at a cleanly finished stream's end.
    pub async fn receive(
        &self,
        id: StreamId,
        min: usize,
        max: usize,
        cancellation_code: Option<u64>,
    ) -> Result<Vec<u8>, Error> {
        let (request_id, rx) = {
            let mut inner = self.lock();
            inner.check_open()?;
            let request_id = inner.streams.next_request_id();
            let (tx, rx) = oneshot::channel();
            inner
                .streams
                .request_receive(id, min, max, request_id, tx)
                .map_err(Error::Stream)?;
            (request_id, rx)
        };
        self.changed.notify_waiters();

        let mut guard = CancelOnDrop {
            connection: self,
            id,
            request_id,
            cancellation_code,
            armed: true,
        };
        let outcome = rx.await;
        guard.armed = false;
        match outcome {
            Ok(result) => result.map_err(Error::Stream),
            Err(_) => Err(Error::Stream(StreamError::Cancelled)),
        }
    }

    /// Rotate the transmit key and ask the peer to rotate too.
    ///
    /// # Errors
    ///
    /// Fails before establishment.
    pub fn request_key_update(&self) -> Result<(), Error> {
        {
            let mut inner = self.lock();
            inner.check_open()?;
            inner.handshake.deliver_key_update_trigger(true)?;
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Close the connection deliberately. Pending stream calls fail with
    /// [`CloseReason::LocalClose`]; the drive task shuts the link down.
    pub fn close(&self) {
        self.lock().fail(CloseReason::LocalClose);
        self.changed.notify_waiters();
    }
}

/// Withdraws a parked receive when its future is dropped mid-flight.
struct CancelOnDrop<'a> {
    connection: &'a Connection,
    id: StreamId,
    request_id: u64,
    cancellation_code: Option<u64>,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut inner = self.connection.lock();
            inner.streams.cancel_receive(self.id, self.request_id);
            if let Some(code) = self.cancellation_code {
                let _ = inner.streams.close_read(self.id, code);
            }
        }
        self.connection.changed.notify_waiters();
    }
}
