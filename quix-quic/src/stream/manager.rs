//! Stream table, ID allocation, per-stream state machines, and both
//! levels of flow control.
//!
//! Stream 0 carries the TLS handshake: always open, exempt from flow
//! control, its inbound bytes surfaced separately from application
//! streams. Local stream IDs are allocated as the minimum unused ID of
//! the requested kind.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::{Error, QuicError, Result};
use crate::flow::{RecvWindow, SendWindow};
use crate::frames::Frame;
use crate::stream::buffer::{RecvBuffer, SendBuffer};
use crate::stream::{RecvState, SendState, StreamId};
use crate::{varint, Side};

struct StreamEntry {
    send_state: SendState,
    recv_state: RecvState,
    send: SendBuffer,
    recv: RecvBuffer,
    send_window: SendWindow,
    recv_window: RecvWindow,
    blocked_reported: bool,
}

impl StreamEntry {
    fn new(send_limit: u64, recv_window: u64) -> Self {
        Self {
            send_state: SendState::Ready,
            recv_state: RecvState::Recv,
            send: SendBuffer::new(),
            recv: RecvBuffer::new(),
            send_window: SendWindow::new(send_limit),
            recv_window: RecvWindow::new(recv_window),
            blocked_reported: false,
        }
    }

    fn send_open(&self) -> bool {
        matches!(self.send_state, SendState::Ready | SendState::Send)
    }
}

pub struct StreamManager {
    side: Side,

    streams: BTreeMap<u64, StreamEntry>,

    // Connection-level windows; stream 0 is exempt.
    conn_send: SendWindow,
    conn_recv: RecvWindow,
    conn_received_total: u64,
    conn_blocked_reported: bool,

    // Peer-granted limits for streams we open.
    remote_stream_window: u64,
    max_local_bidi: Option<u64>,
    max_local_uni: Option<u64>,
    next_local_bidi: u64,
    next_local_uni: u64,

    // Limits we advertise for peer-opened streams.
    local_stream_window: u64,
    max_remote_bidi: u64,
    max_remote_uni: u64,
    remote_id_window: u64,

    control_out: Vec<Frame>,
    readable: VecDeque<(StreamId, Bytes, bool)>,
    handshake_readable: VecDeque<Bytes>,
    opened: VecDeque<StreamId>,
    resets: VecDeque<(StreamId, u16)>,
}

impl StreamManager {
    pub fn new(
        side: Side,
        initial_max_data: u64,
        local_stream_window: u64,
        max_remote_bidi: u64,
        max_remote_uni: u64,
    ) -> Self {
        let mut streams = BTreeMap::new();
        // The handshake stream is always open and effectively unlimited.
        streams.insert(0, StreamEntry::new(varint::MAX, varint::MAX));

        Self {
            side,
            streams,
            conn_send: SendWindow::new(0),
            conn_recv: RecvWindow::new(initial_max_data),
            conn_received_total: 0,
            conn_blocked_reported: false,
            remote_stream_window: 0,
            max_local_bidi: None,
            max_local_uni: None,
            next_local_bidi: match side {
                Side::Client => 4,
                Side::Server => 1,
            },
            next_local_uni: match side {
                Side::Client => 2,
                Side::Server => 3,
            },
            local_stream_window,
            max_remote_bidi,
            max_remote_uni,
            remote_id_window: max_remote_bidi,
            control_out: Vec::new(),
            readable: VecDeque::new(),
            handshake_readable: VecDeque::new(),
            opened: VecDeque::new(),
            resets: VecDeque::new(),
        }
    }

    /// Install the peer's transport parameters. Existing streams pick up
    /// the raised limits; limits never shrink.
    pub fn apply_peer_params(
        &mut self,
        initial_max_data: u64,
        initial_max_stream_data: u64,
        max_stream_id_bidi: u64,
        max_stream_id_uni: u64,
    ) {
        self.conn_send.on_max(initial_max_data);
        if initial_max_stream_data > self.remote_stream_window {
            self.remote_stream_window = initial_max_stream_data;
        }
        self.max_local_bidi = Some(self.max_local_bidi.unwrap_or(0).max(max_stream_id_bidi));
        self.max_local_uni = Some(self.max_local_uni.unwrap_or(0).max(max_stream_id_uni));
        for (&id, entry) in self.streams.iter_mut() {
            if id != 0 {
                entry.send_window.on_max(initial_max_stream_data);
            }
        }
    }

    /// Allocate the next local stream: the minimum unused ID whose type
    /// bits match.
    pub fn open(&mut self, unidirectional: bool) -> Result<StreamId> {
        let (next, limit) = if unidirectional {
            (self.next_local_uni, self.max_local_uni)
        } else {
            (self.next_local_bidi, self.max_local_bidi)
        };
        if let Some(limit) = limit {
            if next > limit {
                self.control_out.push(Frame::StreamIdBlocked { stream_id: StreamId(next) });
                return Err(Error::Quic(QuicError::StreamIdError));
            }
        }
        self.streams.insert(
            next,
            StreamEntry::new(self.remote_stream_window, self.local_stream_window),
        );
        if unidirectional {
            self.next_local_uni += 4;
        } else {
            self.next_local_bidi += 4;
        }
        debug!(stream = next, "opened local stream");
        Ok(StreamId(next))
    }

    /// Queue application data on a stream.
    pub fn write(&mut self, id: StreamId, data: Bytes, fin: bool) -> Result<()> {
        let entry = self
            .streams
            .get_mut(&id.0)
            .ok_or(Error::Quic(QuicError::StreamStateError))?;
        if !entry.send_open() {
            return Err(Error::Quic(QuicError::StreamStateError));
        }
        entry.send.write(data, fin)?;
        entry.send_state = SendState::Send;
        Ok(())
    }

    /// Abruptly terminate our send side.
    pub fn reset(&mut self, id: StreamId, error_code: u16) -> Result<()> {
        let entry = self
            .streams
            .get_mut(&id.0)
            .ok_or(Error::Quic(QuicError::StreamStateError))?;
        if !entry.send_open() {
            return Ok(());
        }
        entry.send_state = SendState::ResetSent;
        self.control_out.push(Frame::RstStream {
            stream_id: id,
            error_code,
            final_offset: entry.send_window.used(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound frame handling
    // ------------------------------------------------------------------

    /// Route a STREAM frame.
    pub fn on_stream_frame(&mut self, id: StreamId, offset: u64, data: Bytes, fin: bool) -> Result<()> {
        self.ensure_recv_stream(id)?;
        let is_handshake = id == StreamId::HANDSHAKE;

        // Flow-control accounting happens against the pre-insert high
        // watermark; stream 0 is exempt.
        let end = offset + data.len() as u64;
        if !is_handshake {
            let entry = self.streams.get_mut(&id.0).ok_or(Error::Quic(QuicError::InternalError))?;
            let previous_high = entry.recv.high_watermark();
            entry.recv_window.on_received(end)?;
            if end > previous_high {
                let delta = end - previous_high;
                self.conn_recv.on_received(self.conn_received_total + delta)?;
                self.conn_received_total += delta;
            }
        }

        let entry = self.streams.get_mut(&id.0).ok_or(Error::Quic(QuicError::InternalError))?;
        if matches!(entry.recv_state, RecvState::ResetRecvd | RecvState::ResetRead) {
            return Ok(());
        }
        entry.recv.insert(offset, data, fin)?;
        if fin && entry.recv_state == RecvState::Recv {
            entry.recv_state = RecvState::SizeKnown;
        }

        // Deliver whatever just became contiguous.
        let mut delivered = 0u64;
        while let Some(chunk) = entry.recv.read() {
            delivered += chunk.len() as u64;
            if is_handshake {
                self.handshake_readable.push_back(chunk);
            } else {
                self.readable.push_back((id, chunk, false));
            }
        }
        if entry.recv.fin_ready() {
            entry.recv_state = RecvState::DataRead;
            if !is_handshake {
                self.readable.push_back((id, Bytes::new(), true));
            }
        } else if entry.recv_state == RecvState::SizeKnown
            && entry.recv.final_offset() == Some(entry.recv.read_offset())
        {
            entry.recv_state = RecvState::DataRecvd;
        }

        if delivered > 0 && !is_handshake {
            if let Some(new_max) = entry.recv_window.on_consumed(delivered) {
                self.control_out.push(Frame::MaxStreamData { stream_id: id, maximum: new_max });
            }
            if let Some(new_max) = self.conn_recv.on_consumed(delivered) {
                self.control_out.push(Frame::MaxData { maximum: new_max });
            }
        }
        Ok(())
    }

    pub fn on_max_data(&mut self, maximum: u64) {
        self.conn_send.on_max(maximum);
        self.conn_blocked_reported = false;
    }

    pub fn on_max_stream_data(&mut self, id: StreamId, maximum: u64) -> Result<()> {
        let entry = self
            .streams
            .get_mut(&id.0)
            .ok_or(Error::Quic(QuicError::StreamStateError))?;
        entry.send_window.on_max(maximum);
        entry.blocked_reported = false;
        Ok(())
    }

    /// MAX_STREAM_ID raises the limit for the kind its ID encodes.
    pub fn on_max_stream_id(&mut self, maximum: StreamId) {
        if maximum.initiator() != self.side {
            // Limits for streams the peer opens are its own business.
            return;
        }
        let slot = if maximum.is_unidirectional() {
            &mut self.max_local_uni
        } else {
            &mut self.max_local_bidi
        };
        *slot = Some(slot.unwrap_or(0).max(maximum.0));
    }

    pub fn on_rst_stream(&mut self, id: StreamId, error_code: u16, final_offset: u64) -> Result<()> {
        if id == StreamId::HANDSHAKE {
            return Err(Error::Quic(QuicError::ProtocolViolation));
        }
        self.ensure_recv_stream(id)?;
        let entry = self.streams.get_mut(&id.0).ok_or(Error::Quic(QuicError::InternalError))?;

        if let Some(known) = entry.recv.final_offset() {
            if known != final_offset {
                return Err(Error::Quic(QuicError::FinalOffsetError));
            }
        }
        entry.recv_window.on_received(final_offset)?;
        let previous_high = entry.recv.high_watermark();
        if final_offset > previous_high {
            let delta = final_offset - previous_high;
            self.conn_recv.on_received(self.conn_received_total + delta)?;
            self.conn_received_total += delta;
        }
        if !matches!(entry.recv_state, RecvState::ResetRecvd | RecvState::ResetRead) {
            entry.recv_state = RecvState::ResetRead;
            self.resets.push_back((id, error_code));
        }
        Ok(())
    }

    /// Peer no longer wants our data: answer with RST_STREAM.
    pub fn on_stop_sending(&mut self, id: StreamId, error_code: u16) -> Result<()> {
        if id == StreamId::HANDSHAKE {
            return Err(Error::Quic(QuicError::ProtocolViolation));
        }
        if self.streams.get(&id.0).is_none() {
            return Err(Error::Quic(QuicError::StreamStateError));
        }
        self.reset(id, error_code)
    }

    /// Create state for a peer-referenced stream, enforcing ID limits.
    fn ensure_recv_stream(&mut self, id: StreamId) -> Result<()> {
        if self.streams.contains_key(&id.0) {
            return Ok(());
        }
        if id.initiator() == self.side {
            // Data on a local stream we never opened.
            return Err(Error::Quic(QuicError::StreamStateError));
        }
        let limit = if id.is_unidirectional() {
            self.max_remote_uni
        } else {
            self.max_remote_bidi
        };
        if id.0 > limit {
            return Err(Error::Quic(QuicError::StreamIdError));
        }
        self.streams.insert(
            id.0,
            StreamEntry::new(self.remote_stream_window, self.local_stream_window),
        );
        self.opened.push_back(id);
        trace!(stream = id.0, "peer opened stream");

        // Keep the peer's ID space from running dry.
        if !id.is_unidirectional() && limit - id.0 < self.remote_id_window / 2 {
            self.max_remote_bidi = limit + self.remote_id_window;
            self.control_out.push(Frame::MaxStreamId { maximum: StreamId(self.max_remote_bidi) });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Next chunk of handshake-stream data, if any.
    pub fn poll_handshake_frame(&mut self, max_len: usize) -> Option<Frame> {
        let entry = self.streams.get_mut(&0)?;
        let (offset, data, fin) = entry.send.pop_chunk(max_len, varint::MAX)?;
        Some(Frame::Stream { stream_id: StreamId::HANDSHAKE, offset, data, fin })
    }

    pub fn has_handshake_data(&self) -> bool {
        self.streams
            .get(&0)
            .map_or(false, |e| e.send.wants_send(varint::MAX))
    }

    /// Next application STREAM frame within stream and connection flow
    /// limits.
    pub fn poll_app_frame(&mut self, max_len: usize) -> Option<Frame> {
        let conn_used = self.conn_send.used();
        let conn_limit = self.conn_send.limit();
        let mut result = None;
        let mut conn_consumed = 0u64;
        let mut blocked_frame = None;

        for (&raw_id, entry) in self.streams.iter_mut() {
            if raw_id == 0 || !matches!(entry.send_state, SendState::Send) {
                continue;
            }
            let stream_limit = entry.send_window.limit();
            let sent_high = entry.send_window.used();
            // New bytes also draw on the connection window; retransmitted
            // offsets below `sent_high` do not.
            let conn_budget = conn_limit.saturating_sub(conn_used);
            let effective_limit = stream_limit.min(sent_high.saturating_add(conn_budget));

            match entry.send.pop_chunk(max_len, effective_limit) {
                Some((offset, data, fin)) => {
                    let end = offset + data.len() as u64;
                    if end > sent_high {
                        let delta = end - sent_high;
                        entry.send_window.consume(delta);
                        conn_consumed = delta;
                    }
                    if fin && !entry.send.wants_send(varint::MAX) {
                        entry.send_state = SendState::DataSent;
                    }
                    result = Some(Frame::Stream { stream_id: StreamId(raw_id), offset, data, fin });
                    break;
                }
                None => {
                    if entry.send.is_blocked(stream_limit) && !entry.blocked_reported {
                        entry.blocked_reported = true;
                        blocked_frame = Some(Frame::StreamBlocked {
                            stream_id: StreamId(raw_id),
                            offset: stream_limit,
                        });
                        break;
                    }
                    if entry.send.is_blocked(effective_limit)
                        && conn_budget == 0
                        && !self.conn_blocked_reported
                    {
                        self.conn_blocked_reported = true;
                        blocked_frame = Some(Frame::Blocked { offset: conn_limit });
                        break;
                    }
                }
            }
        }

        if conn_consumed > 0 {
            self.conn_send.consume(conn_consumed);
        }
        if let Some(frame) = blocked_frame {
            self.control_out.push(frame);
        }
        result
    }

    pub fn has_app_data(&self) -> bool {
        self.streams.iter().any(|(&id, e)| {
            if id == 0 || !matches!(e.send_state, SendState::Send) {
                return false;
            }
            let effective = e
                .send_window
                .limit()
                .min(e.send_window.used().saturating_add(self.conn_send.available()));
            e.send.wants_send(effective)
        })
    }

    /// Control frames (MAX_*, BLOCKED, RST_STREAM) waiting to go out.
    pub fn take_control_frames(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.control_out)
    }

    pub fn has_control_frames(&self) -> bool {
        !self.control_out.is_empty()
    }

    // ------------------------------------------------------------------
    // Ack / loss feedback
    // ------------------------------------------------------------------

    pub fn on_frame_acked(&mut self, frame: &Frame) {
        match frame {
            Frame::Stream { stream_id, data, fin, .. } => {
                if let Some(entry) = self.streams.get_mut(&stream_id.0) {
                    entry.send.on_acked(data.len(), *fin);
                    if entry.send.all_acked()
                        && matches!(entry.send_state, SendState::Send | SendState::DataSent)
                        && entry.send.fin_offset().is_some()
                    {
                        entry.send_state = SendState::DataRecvd;
                    }
                }
            }
            Frame::RstStream { stream_id, .. } => {
                if let Some(entry) = self.streams.get_mut(&stream_id.0) {
                    if entry.send_state == SendState::ResetSent {
                        entry.send_state = SendState::ResetRecvd;
                    }
                }
            }
            _ => {}
        }
    }

    pub fn on_frame_lost(&mut self, frame: Frame) {
        match frame {
            Frame::Stream { stream_id, offset, data, fin } => {
                if let Some(entry) = self.streams.get_mut(&stream_id.0) {
                    if entry.send_state != SendState::ResetSent {
                        entry.send.on_lost(offset, data, fin);
                        if entry.send_state == SendState::DataSent {
                            entry.send_state = SendState::Send;
                        }
                    }
                }
            }
            // Window updates are re-emitted at their current values.
            Frame::MaxStreamData { stream_id, .. } => {
                if let Some(entry) = self.streams.get(&stream_id.0) {
                    self.control_out.push(Frame::MaxStreamData {
                        stream_id,
                        maximum: entry.recv_window.max(),
                    });
                }
            }
            Frame::MaxData { .. } => {
                self.control_out.push(Frame::MaxData { maximum: self.conn_recv.max() });
            }
            other if other.is_retransmittable() => self.control_out.push(other),
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Event drains
    // ------------------------------------------------------------------

    pub fn next_readable(&mut self) -> Option<(StreamId, Bytes, bool)> {
        self.readable.pop_front()
    }

    pub fn next_handshake_data(&mut self) -> Option<Bytes> {
        self.handshake_readable.pop_front()
    }

    pub fn next_opened(&mut self) -> Option<StreamId> {
        self.opened.pop_front()
    }

    pub fn next_reset(&mut self) -> Option<(StreamId, u16)> {
        self.resets.pop_front()
    }

    #[cfg(test)]
    fn send_state(&self, id: StreamId) -> Option<SendState> {
        self.streams.get(&id.0).map(|e| e.send_state)
    }
}
