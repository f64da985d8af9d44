//! Stream multiplexing.
//!
//! The stream engine is a sequential core like the handshake engine: the
//! connection pushes decoded inbound frames in and pulls outbound frames
//! out, and all waiting happens one layer up. Each stream has independent
//! read and write halves; closing or erroring one stream never disturbs
//! another.
//!
//! Outbound scheduling is strict-priority control then round-robin data:
//! stop-sending requests first, then resets, then coalesced acks, then one
//! data frame per active stream in rotation so a bulk transfer cannot
//! starve its neighbors.

use crate::error::{CloseReason, StreamError};
use crate::frame::StreamFrame;
use crate::handshake::Role;
use crate::varint::varint_len;
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;

/// Stream identifier.
///
/// Bit 0 marks the initiator (set = client-initiated), bit 1 the
/// directionality (set = unidirectional), and the remaining bits are a
/// per-kind sequence index. The two sides therefore allocate from disjoint
/// id spaces and can open streams without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    /// Build an id from its parts.
    #[must_use]
    pub fn new(index: u64, client_initiated: bool, unidirectional: bool) -> Self {
        Self(index << 2 | u64::from(unidirectional) << 1 | u64::from(client_initiated))
    }

    /// Reconstruct an id from its wire value.
    #[must_use]
    pub fn from_value(value: u64) -> Self {
        Self(value)
    }

    /// The wire value.
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }

    /// Whether the client opened this stream.
    #[must_use]
    pub fn is_client_initiated(self) -> bool {
        self.0 & 0b01 != 0
    }

    /// Whether this stream carries data in one direction only.
    #[must_use]
    pub fn is_unidirectional(self) -> bool {
        self.0 & 0b10 != 0
    }

    /// Per-kind sequence index.
    #[must_use]
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a stream's write half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteHalf {
    Open,
    /// FIN queued or sent; no further writes
    Finished,
    /// Peer sent StopSending with this code; a Reset has been queued
    Stopped(u64),
    /// Locally reset with this code
    Reset(u64),
}

impl WriteHalf {
    fn terminal(self) -> bool {
        !matches!(self, Self::Open)
    }
}

/// State of a stream's read half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadHalf {
    Open,
    /// FIN received and every byte delivered
    Finished,
    /// Peer reset with this code
    Reset(u64),
    /// Closed locally with this code; a StopSending has been queued
    Aborted(u64),
}

impl ReadHalf {
    fn terminal(self) -> bool {
        !matches!(self, Self::Open)
    }
}

/// A receive call parked until enough bytes arrive.
struct PendingReceive {
    request_id: u64,
    min: usize,
    max: usize,
    reply: oneshot::Sender<Result<Vec<u8>, StreamError>>,
}

struct Stream {
    // Outbound
    send_buf: Vec<u8>,
    send_fin: bool,
    write: WriteHalf,
    // Inbound
    recv_buf: VecDeque<u8>,
    recv_fin: bool,
    recv_offset: u64,
    ack_queued: bool,
    peer_acked: u64,
    read: ReadHalf,
    pending: VecDeque<PendingReceive>,
}

impl Stream {
    fn new(id: StreamId, locally_initiated: bool) -> Self {
        // A unidirectional stream only flows initiator -> acceptor.
        let (write, read) = if id.is_unidirectional() {
            if locally_initiated {
                (WriteHalf::Open, ReadHalf::Finished)
            } else {
                (WriteHalf::Finished, ReadHalf::Open)
            }
        } else {
            (WriteHalf::Open, ReadHalf::Open)
        };
        Self {
            send_buf: Vec::new(),
            send_fin: false,
            write,
            recv_buf: VecDeque::new(),
            recv_fin: false,
            recv_offset: 0,
            ack_queued: false,
            peer_acked: 0,
            read,
            pending: VecDeque::new(),
        }
    }

    fn has_sendable(&self) -> bool {
        !self.send_buf.is_empty() || self.send_fin
    }

    /// Both halves done and nothing left buffered or parked.
    fn finished(&self) -> bool {
        self.write.terminal()
            && self.read.terminal()
            && !self.has_sendable()
            && self.pending.is_empty()
            && !self.ack_queued
    }
}

/// The stream multiplexing engine for one connection.
pub struct StreamEngine {
    role: Role,
    streams: HashMap<StreamId, Stream>,
    /// Round-robin rotation of streams with sendable data.
    active: VecDeque<StreamId>,
    stop_sending_queue: VecDeque<(StreamId, u64)>,
    reset_queue: VecDeque<(StreamId, u64)>,
    ack_queue: VecDeque<StreamId>,
    /// Peer-opened streams not yet claimed by an accept call.
    incoming: VecDeque<StreamId>,
    next_bidi_index: u64,
    next_uni_index: u64,
    /// High-water marks for peer-initiated indexes; ids below these have
    /// been seen (and possibly destroyed) already.
    peer_next_bidi: u64,
    peer_next_uni: u64,
    next_request_id: u64,
}

impl StreamEngine {
    /// Create the engine for one side of a connection.
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            role,
            streams: HashMap::new(),
            active: VecDeque::new(),
            stop_sending_queue: VecDeque::new(),
            reset_queue: VecDeque::new(),
            ack_queue: VecDeque::new(),
            incoming: VecDeque::new(),
            next_bidi_index: 0,
            next_uni_index: 0,
            peer_next_bidi: 0,
            peer_next_uni: 0,
            next_request_id: 0,
        }
    }

    fn locally_initiated(&self, id: StreamId) -> bool {
        id.is_client_initiated() == (self.role == Role::Client)
    }

    /// Error for an id with no live stream: indexes below the relevant
    /// allocation mark belonged to a stream that ran to completion and was
    /// destroyed, anything above was never opened.
    fn absent(&self, id: StreamId) -> StreamError {
        let next = match (self.locally_initiated(id), id.is_unidirectional()) {
            (true, true) => self.next_uni_index,
            (true, false) => self.next_bidi_index,
            (false, true) => self.peer_next_uni,
            (false, false) => self.peer_next_bidi,
        };
        if id.index() < next {
            StreamError::Closed
        } else {
            StreamError::UnknownStream(id.value())
        }
    }

    /// Open a new locally-initiated stream.
    pub fn open(&mut self, unidirectional: bool) -> StreamId {
        let index = if unidirectional {
            let index = self.next_uni_index;
            self.next_uni_index += 1;
            index
        } else {
            let index = self.next_bidi_index;
            self.next_bidi_index += 1;
            index
        };
        let id = StreamId::new(index, self.role == Role::Client, unidirectional);
        self.streams.insert(id, Stream::new(id, true));
        tracing::debug!(stream = %id, unidirectional, "stream opened");
        id
    }

    /// Take the next peer-opened stream, if one arrived.
    pub fn take_incoming(&mut self) -> Option<StreamId> {
        self.incoming.pop_front()
    }

    /// Allocate a request id for a receive call.
    pub fn next_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    /// Cumulative byte count the peer has acknowledged on a stream.
    #[must_use]
    pub fn delivered(&self, id: StreamId) -> u64 {
        self.streams.get(&id).map_or(0, |s| s.peer_acked)
    }

    // ------------------------------------------------------------------
    // Local operations
    // ------------------------------------------------------------------

    /// Queue bytes on a stream's write half; `fin` closes it after them.
    ///
    /// # Errors
    ///
    /// Returns a [`StreamError`] if the write half cannot accept data;
    /// a retired stream reads as [`StreamError::Closed`].
    pub fn send(&mut self, id: StreamId, data: &[u8], fin: bool) -> Result<(), StreamError> {
        let Some(stream) = self.streams.get_mut(&id) else {
            return Err(self.absent(id));
        };
        match stream.write {
            WriteHalf::Open => {}
            WriteHalf::Finished => return Err(StreamError::Closed),
            WriteHalf::Stopped(code) => return Err(StreamError::Stopped(code)),
            WriteHalf::Reset(code) => return Err(StreamError::Reset(code)),
        }
        stream.send_buf.extend_from_slice(data);
        if fin {
            stream.send_fin = true;
            stream.write = WriteHalf::Finished;
        }
        if !self.active.contains(&id) {
            self.active.push_back(id);
        }
        Ok(())
    }

    /// Close the write half normally (FIN after any queued bytes).
    ///
    /// # Errors
    ///
    /// Returns a [`StreamError`] if the half is already closed.
    pub fn finish(&mut self, id: StreamId) -> Result<(), StreamError> {
        self.send(id, &[], true)
    }

    /// Abort the write half with an application error code. Queued bytes
    /// are discarded and the peer gets a Reset.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Closed`] for a retired stream and
    /// [`StreamError::UnknownStream`] for an id that never existed.
    pub fn reset(&mut self, id: StreamId, error_code: u64) -> Result<(), StreamError> {
        let Some(stream) = self.streams.get_mut(&id) else {
            return Err(self.absent(id));
        };
        if matches!(stream.write, WriteHalf::Reset(_) | WriteHalf::Stopped(_)) {
            return Ok(());
        }
        stream.write = WriteHalf::Reset(error_code);
        stream.send_buf.clear();
        stream.send_fin = false;
        self.active.retain(|a| *a != id);
        self.reset_queue.push_back((id, error_code));
        self.maybe_destroy(id);
        Ok(())
    }

    /// Close the read half locally: discard buffered bytes, fail parked
    /// receives, and ask the peer to stop sending.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Closed`] for a retired stream and
    /// [`StreamError::UnknownStream`] for an id that never existed.
    pub fn close_read(&mut self, id: StreamId, error_code: u64) -> Result<(), StreamError> {
        let Some(stream) = self.streams.get_mut(&id) else {
            return Err(self.absent(id));
        };
        if stream.read.terminal() {
            return Ok(());
        }
        stream.read = ReadHalf::Aborted(error_code);
        stream.recv_buf.clear();
        for pending in stream.pending.drain(..) {
            let _ = pending.reply.send(Err(StreamError::ReadAborted(error_code)));
        }
        self.stop_sending_queue.push_back((id, error_code));
        self.maybe_destroy(id);
        Ok(())
    }

    /// Park a receive for between `min` and `max` bytes. The reply fires
    /// as soon as `min` bytes (or the stream's end) are available; earlier
    /// receives on the same stream are always served first.
    ///
    /// # Errors
    ///
    /// Fails immediately if the read half is already terminal with an
    /// error, the stream is retired, or the id is unknown.
    pub fn request_receive(
        &mut self,
        id: StreamId,
        min: usize,
        max: usize,
        request_id: u64,
        reply: oneshot::Sender<Result<Vec<u8>, StreamError>>,
    ) -> Result<(), StreamError> {
        let Some(stream) = self.streams.get_mut(&id) else {
            return Err(self.absent(id));
        };
        match stream.read {
            ReadHalf::Open => {}
            ReadHalf::Finished => return Err(StreamError::Closed),
            ReadHalf::Reset(code) => return Err(StreamError::Reset(code)),
            ReadHalf::Aborted(code) => return Err(StreamError::ReadAborted(code)),
        }
        stream.pending.push_back(PendingReceive {
            request_id,
            min: min.max(1),
            max: max.max(min).max(1),
            reply,
        });
        Self::service_receives(stream);
        self.maybe_destroy(id);
        Ok(())
    }

    /// Withdraw a parked receive. A no-op if it already completed.
    pub fn cancel_receive(&mut self, id: StreamId, request_id: u64) {
        if let Some(stream) = self.streams.get_mut(&id) {
            if let Some(pos) = stream
                .pending
                .iter()
                .position(|p| p.request_id == request_id)
            {
                if let Some(pending) = stream.pending.remove(pos) {
                    let _ = pending.reply.send(Err(StreamError::Cancelled));
                }
            }
            self.maybe_destroy(id);
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Apply one decoded inbound frame.
    pub fn handle_frame(&mut self, frame: StreamFrame) {
        let id = frame.stream_id();
        if !self.streams.contains_key(&id) {
            if self.locally_initiated(id) {
                // Frames for a stream we already destroyed; benign.
                tracing::debug!(stream = %id, "frame for departed stream ignored");
                return;
            }
            let next = if id.is_unidirectional() {
                self.peer_next_uni
            } else {
                self.peer_next_bidi
            };
            if id.index() < next {
                // Trailing frames (typically the final ack) for a stream
                // that already ran to completion; benign.
                tracing::debug!(stream = %id, "frame for retired stream ignored");
                return;
            }
            // The peer allocates indexes sequentially, so every index up
            // to this one is open on its side too.
            for index in next..=id.index() {
                let opened =
                    StreamId::new(index, id.is_client_initiated(), id.is_unidirectional());
                self.streams.insert(opened, Stream::new(opened, false));
                self.incoming.push_back(opened);
                tracing::debug!(stream = %opened, "peer opened stream");
            }
            if id.is_unidirectional() {
                self.peer_next_uni = id.index() + 1;
            } else {
                self.peer_next_bidi = id.index() + 1;
            }
        }
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };

        match frame {
            StreamFrame::Data { fin, data, .. } => {
                if stream.read.terminal() {
                    // Late data after reset/abort; drop it on the floor.
                    return;
                }
                stream.recv_offset += data.len() as u64;
                stream.recv_buf.extend(data);
                if fin {
                    stream.recv_fin = true;
                }
                if !stream.ack_queued {
                    stream.ack_queued = true;
                    self.ack_queue.push_back(id);
                }
                Self::service_receives(stream);
            }
            StreamFrame::Reset { error_code, .. } => {
                stream.read = ReadHalf::Reset(error_code);
                stream.recv_buf.clear();
                for pending in stream.pending.drain(..) {
                    let _ = pending.reply.send(Err(StreamError::Reset(error_code)));
                }
                tracing::debug!(stream = %id, error_code, "peer reset stream");
            }
            StreamFrame::StopSending { error_code, .. } => {
                if !matches!(stream.write, WriteHalf::Reset(_) | WriteHalf::Stopped(_)) {
                    stream.write = WriteHalf::Stopped(error_code);
                    stream.send_buf.clear();
                    stream.send_fin = false;
                    self.active.retain(|a| *a != id);
                    // Confirm the stop with a reset carrying the same code.
                    self.reset_queue.push_back((id, error_code));
                }
            }
            StreamFrame::Ack { offset, .. } => {
                stream.peer_acked = stream.peer_acked.max(offset);
            }
        }
        self.maybe_destroy(id);
    }

    /// Fail every parked receive; called when the connection dies.
    pub fn fail_all(&mut self, reason: CloseReason) {
        for stream in self.streams.values_mut() {
            for pending in stream.pending.drain(..) {
                let _ = pending
                    .reply
                    .send(Err(StreamError::ConnectionClosed(reason)));
            }
        }
        self.streams.clear();
        self.active.clear();
        self.stop_sending_queue.clear();
        self.reset_queue.clear();
        self.ack_queue.clear();
        self.incoming.clear();
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Whether any frame is ready to transmit.
    #[must_use]
    pub fn has_pending_frames(&self) -> bool {
        !self.stop_sending_queue.is_empty()
            || !self.reset_queue.is_empty()
            || !self.ack_queue.is_empty()
            || self.active.iter().any(|id| {
                self.streams
                    .get(id)
                    .is_some_and(Stream::has_sendable)
            })
    }

    /// Produce the next frame fitting in `budget` encoded bytes, or `None`
    /// if nothing fits (or nothing is pending).
    pub fn next_frame(&mut self, budget: usize) -> Option<StreamFrame> {
        if let Some(frame) = self.next_control_frame(budget) {
            return Some(frame);
        }
        self.next_data_frame(budget)
    }

    fn next_control_frame(&mut self, budget: usize) -> Option<StreamFrame> {
        if let Some(&(id, error_code)) = self.stop_sending_queue.front() {
            let frame = StreamFrame::StopSending { id, error_code };
            if frame.encoded_len() > budget {
                return None;
            }
            self.stop_sending_queue.pop_front();
            return Some(frame);
        }
        if let Some(&(id, error_code)) = self.reset_queue.front() {
            let frame = StreamFrame::Reset { id, error_code };
            if frame.encoded_len() > budget {
                return None;
            }
            self.reset_queue.pop_front();
            self.maybe_destroy(id);
            return Some(frame);
        }
        if let Some(&id) = self.ack_queue.front() {
            let offset = self.streams.get(&id).map_or(0, |s| s.recv_offset);
            let frame = StreamFrame::Ack { id, offset };
            if frame.encoded_len() > budget {
                return None;
            }
            self.ack_queue.pop_front();
            if let Some(stream) = self.streams.get_mut(&id) {
                stream.ack_queued = false;
            }
            self.maybe_destroy(id);
            return Some(frame);
        }
        None
    }

    fn next_data_frame(&mut self, budget: usize) -> Option<StreamFrame> {
        let id = loop {
            let id = *self.active.front()?;
            let sendable = self
                .streams
                .get(&id)
                .is_some_and(Stream::has_sendable);
            if sendable {
                break id;
            }
            self.active.pop_front();
        };

        // Tag byte, stream id, flags byte, then the length-delimited data.
        let base = 1 + varint_len(id.value()).unwrap_or(8) + 1;
        if base + 1 > budget {
            return None;
        }
        let stream = self.streams.get_mut(&id)?;

        let avail = stream.send_buf.len();
        let mut take = avail.min(budget - base - 1);
        while take > 0 && base + varint_len(take as u64).unwrap_or(8) + take > budget {
            take -= 1;
        }
        if take == 0 && !(stream.send_fin && avail == 0) {
            // Not even one payload byte fits; leave the stream queued.
            return None;
        }

        let data: Vec<u8> = stream.send_buf.drain(..take).collect();
        let drained = stream.send_buf.is_empty();
        let fin = stream.send_fin && drained;
        if fin {
            stream.send_fin = false;
        }

        self.active.pop_front();
        if stream.has_sendable() {
            self.active.push_back(id);
        }
        self.maybe_destroy(id);
        Some(StreamFrame::Data { id, fin, data })
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Complete parked receives in arrival order while data allows.
    fn service_receives(stream: &mut Stream) {
        loop {
            let Some(front) = stream.pending.front() else {
                break;
            };
            let buffered = stream.recv_buf.len();
            let end_of_stream = stream.recv_fin;
            if buffered < front.min && !end_of_stream {
                break;
            }
            let take = buffered.min(front.max);
            if take == 0 && !end_of_stream {
                break;
            }
            let Some(pending) = stream.pending.pop_front() else {
                break;
            };
            if take == 0 {
                // FIN with nothing left to deliver.
                let _ = pending.reply.send(Err(StreamError::Closed));
            } else {
                let data: Vec<u8> = stream.recv_buf.drain(..take).collect();
                let _ = pending.reply.send(Ok(data));
            }
        }
        if stream.recv_fin && stream.recv_buf.is_empty() && stream.read == ReadHalf::Open {
            stream.read = ReadHalf::Finished;
        }
    }

    fn maybe_destroy(&mut self, id: StreamId) {
        let finished = self.streams.get(&id).is_some_and(Stream::finished);
        let referenced = self.stop_sending_queue.iter().any(|(q, _)| *q == id)
            || self.reset_queue.iter().any(|(q, _)| *q == id)
            || self.incoming.contains(&id);
        if finished && !referenced {
            self.streams.remove(&id);
            self.active.retain(|a| *a != id);
            tracing::debug!(stream = %id, "stream destroyed");
        }
    }
}
