//! Connection state machine and packet pipeline.
//!
//! Pure state machine: datagrams and time in, datagrams and events out.
//! A driver feeds [`Connection::handle_datagram`], drains
//! [`Connection::poll_transmit`] and [`Connection::poll_event`], and calls
//! [`Connection::on_timeout`] at [`Connection::next_timeout`].

pub mod events;

#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::crypto::{self, Epoch, KeyPair, EPOCH_COUNT, TAG_LEN};
use crate::error::{Error, LocalError, QuicError, Result};
use crate::frames::parse::FrameIter;
use crate::frames::{AckFrame, Frame};
use crate::packet::number::{self, PnWidth};
use crate::packet::{Header, PacketSpace, PacketType, SpaceId, SPACE_COUNT};
use crate::recovery::{LossDetector, NewReno, SentPacket};
use crate::stream::{StreamId, StreamManager};
use crate::tls::TlsEngine;
use crate::transport::TransportParameters;
use crate::version::{self, VERSION_DRAFT_12};
use crate::{ConnectionId, Side, MAX_DATAGRAM_SIZE, MIN_INITIAL_SIZE};

pub use events::ConnectionEvent;

/// Consecutive handshake-epoch decryption failures tolerated before the
/// connection is torn down.
const HANDSHAKE_DECRYPT_FAILURE_LIMIT: u32 = 8;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Nothing on the wire yet.
    Initial,
    /// ClientInitial sent, waiting for the server's flight.
    WaitingHandshake,
    /// Handshake packets are flowing.
    Handshake,
    /// Handshake complete, 1-RTT keys installed.
    Established,
    /// Close sent or received; lingering until the drain period ends.
    Draining,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub version: u32,
    pub local_params: TransportParameters,
    pub cid_len: usize,
    /// Server: validate the client address with a Retry round trip.
    pub use_retry: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            version: VERSION_DRAFT_12,
            local_params: TransportParameters::default(),
            cid_len: 8,
            use_retry: false,
        }
    }
}

pub struct Connection {
    side: Side,
    state: ConnectionState,
    config: ConnectionConfig,

    /// Version used on the wire right now.
    version: u32,
    /// Version of the very first flight, before any negotiation.
    initial_version: u32,

    local_cid: ConnectionId,
    remote_cid: ConnectionId,
    /// Destination ID the initial keys derive from.
    initial_keys_cid: ConnectionId,

    // Connection-ID discipline.
    retry_scid: Option<ConnectionId>,
    remote_cid_locked: bool,
    vn_handled: bool,
    retry_sent: bool,
    retry_pending: bool,

    tls: Box<dyn TlsEngine>,
    /// Alternate IDs the peer offered via NEW_CONNECTION_ID, by sequence.
    peer_alternate_cids: Vec<(u64, ConnectionId)>,
    params_remote: Option<TransportParameters>,
    peer_ack_delay_exponent: u8,
    idle_timeout: Duration,

    keys: [Option<KeyPair>; EPOCH_COUNT],
    spaces: [PacketSpace; SPACE_COUNT],

    streams: StreamManager,
    recovery: LossDetector,
    congestion: NewReno,

    /// Control frames queued per epoch.
    pending: [Vec<Frame>; EPOCH_COUNT],
    events: VecDeque<ConnectionEvent>,

    /// CONNECTION_CLOSE / APPLICATION_CLOSE waiting to be flushed.
    close_pending: Option<Frame>,
    drain_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,

    handshake_decrypt_failures: u32,
}

impl Connection {
    pub fn new_client(config: ConnectionConfig, mut tls: Box<dyn TlsEngine>) -> Result<Self> {
        let local_cid = ConnectionId::random(config.cid_len);
        let remote_cid = ConnectionId::random(config.cid_len);

        let first_flight = tls.start()?;
        let mut conn = Self::new(Side::Client, config, tls, local_cid, remote_cid.clone());
        conn.initial_keys_cid = remote_cid.clone();
        conn.keys[Epoch::Initial.index()] =
            Some(crypto::initial_keys(&remote_cid, Side::Client)?);
        conn.streams
            .write(StreamId::HANDSHAKE, Bytes::from(first_flight), false)?;

        // Whatever the engine can already derive (handshake secrets bind
        // only client-known material; 0-RTT needs an imported ticket).
        conn.install_keys(Epoch::Handshake)?;
        if conn.tls.has_early_secrets() {
            conn.install_keys(Epoch::ZeroRtt)?;
        }
        Ok(conn)
    }

    pub fn new_server(config: ConnectionConfig, tls: Box<dyn TlsEngine>) -> Result<Self> {
        let local_cid = ConnectionId::random(config.cid_len);
        Ok(Self::new(Side::Server, config, tls, local_cid, ConnectionId::empty()))
    }

    fn new(
        side: Side,
        config: ConnectionConfig,
        tls: Box<dyn TlsEngine>,
        local_cid: ConnectionId,
        remote_cid: ConnectionId,
    ) -> Self {
        let params = &config.local_params;
        let streams = StreamManager::new(
            side,
            params.initial_max_data as u64,
            params.initial_max_stream_data as u64,
            params.initial_max_stream_id_bidi as u64,
            params.initial_max_stream_id_uni as u64,
        );
        let idle_timeout = Duration::from_secs(params.idle_timeout as u64);
        Self {
            side,
            state: ConnectionState::Initial,
            version: config.version,
            initial_version: config.version,
            local_cid,
            remote_cid,
            initial_keys_cid: ConnectionId::empty(),
            retry_scid: None,
            remote_cid_locked: false,
            vn_handled: false,
            retry_sent: false,
            retry_pending: false,
            tls,
            peer_alternate_cids: Vec::new(),
            params_remote: None,
            peer_ack_delay_exponent: 3,
            idle_timeout,
            keys: [None, None, None, None],
            spaces: [PacketSpace::new(), PacketSpace::new()],
            streams,
            recovery: LossDetector::new(),
            congestion: NewReno::new(),
            pending: Default::default(),
            events: VecDeque::new(),
            close_pending: None,
            drain_deadline: None,
            idle_deadline: None,
            handshake_decrypt_failures: 0,
            config,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }

    pub fn local_cid(&self) -> &ConnectionId {
        &self.local_cid
    }

    pub fn remote_cid(&self) -> &ConnectionId {
        &self.remote_cid
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Version offered before any negotiation.
    pub fn initial_version(&self) -> u32 {
        self.initial_version
    }

    /// Alternate connection IDs offered by the peer, usable on migration.
    pub fn peer_alternate_cids(&self) -> &[(u64, ConnectionId)] {
        &self.peer_alternate_cids
    }

    /// Session ticket issued by the peer, once available.
    pub fn session_ticket(&self) -> Option<Bytes> {
        self.tls.session_ticket()
    }

    /// Peer parameters remembered from a previous session; required before
    /// 0-RTT data can be admitted.
    pub fn apply_session_params(&mut self, params: &TransportParameters) {
        self.streams.apply_peer_params(
            params.initial_max_data as u64,
            params.initial_max_stream_data as u64,
            params.initial_max_stream_id_bidi as u64,
            params.initial_max_stream_id_uni as u64,
        );
    }

    // ------------------------------------------------------------------
    // Application surface
    // ------------------------------------------------------------------

    pub fn open_stream(&mut self, unidirectional: bool) -> Result<StreamId> {
        self.streams.open(unidirectional)
    }

    pub fn stream_send(&mut self, id: StreamId, data: Bytes, fin: bool) -> Result<()> {
        if id == StreamId::HANDSHAKE {
            return Err(Error::Quic(QuicError::StreamIdError));
        }
        self.streams.write(id, data, fin)
    }

    pub fn reset_stream(&mut self, id: StreamId, error_code: u16) -> Result<()> {
        self.streams.reset(id, error_code)
    }

    pub fn stop_sending(&mut self, id: StreamId, error_code: u16) {
        let epoch = self.best_epoch();
        self.pending[epoch.index()].push(Frame::StopSending { stream_id: id, error_code });
    }

    /// Close gracefully with NO_ERROR.
    pub fn close(&mut self, now: Instant) {
        self.start_close(
            Frame::ConnectionClose {
                error_code: QuicError::NoError.to_wire(),
                reason: Bytes::new(),
            },
            now,
        );
    }

    /// Close with an application error code.
    pub fn close_application(&mut self, error_code: u16, reason: Bytes, now: Instant) {
        self.start_close(Frame::ApplicationClose { error_code, reason }, now);
    }

    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    pub fn next_timeout(&self) -> Option<Instant> {
        let mut deadline = self.drain_deadline;
        if self.state < ConnectionState::Draining {
            for candidate in [self.idle_deadline, self.recovery.next_alarm()] {
                deadline = match (deadline, candidate) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
        }
        deadline
    }

    pub fn on_timeout(&mut self, now: Instant) {
        if let Some(deadline) = self.drain_deadline {
            if now >= deadline {
                debug!("drain period over");
                self.state = ConnectionState::Closed;
                self.recovery.cancel();
                return;
            }
        }
        if self.state >= ConnectionState::Draining {
            return;
        }
        if let Some(deadline) = self.idle_deadline {
            if now >= deadline {
                debug!("idle timeout");
                self.state = ConnectionState::Closed;
                self.recovery.cancel();
                self.events.push_back(ConnectionEvent::Closed {
                    error_code: QuicError::NoError.to_wire(),
                    reason: Bytes::from_static(b"idle timeout"),
                });
                return;
            }
        }
        if let Some(alarm) = self.recovery.next_alarm() {
            if now >= alarm {
                let outcome = self.recovery.on_alarm(now);
                for packet in outcome.retransmit {
                    if packet.in_flight {
                        self.congestion.on_packet_abandoned(packet.size);
                    }
                    self.requeue_frames(packet.epoch, packet.frames);
                }
                self.on_packets_lost(outcome.lost);
                if outcome.rto_verified {
                    debug!("retransmission timeout verified");
                    self.congestion.on_retransmission_timeout_verified();
                }
                let epoch = self.best_epoch();
                for _ in 0..outcome.probes {
                    self.pending[epoch.index()].push(Frame::Ping);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Feed one received UDP datagram.
    pub fn handle_datagram(&mut self, data: &[u8], now: Instant) {
        if self.state >= ConnectionState::Draining {
            return;
        }
        let mut offset = 0;
        while offset < data.len() {
            match self.process_packet(data, offset, now) {
                Ok(next) if next > offset => offset = next,
                Ok(_) => break,
                Err(Error::Quic(err)) => {
                    warn!(?err, "fatal error processing packet");
                    self.start_close(
                        Frame::ConnectionClose { error_code: err.to_wire(), reason: Bytes::new() },
                        now,
                    );
                    return;
                }
                Err(Error::Local(err)) => {
                    trace!(?err, "dropping datagram remainder");
                    break;
                }
            }
        }
    }

    /// Process one packet; returns the offset where the next coalesced
    /// packet starts. Recoverable conditions skip the packet.
    fn process_packet(&mut self, data: &[u8], offset: usize, now: Instant) -> Result<usize> {
        let packet = &data[offset..];
        let (header, header_len) = match Header::parse(packet, self.local_cid.len()) {
            Ok(parsed) => parsed,
            Err(_) if offset > 0 => {
                // Trailing garbage after valid coalesced packets.
                return Err(Error::Local(LocalError::IgnorePacket));
            }
            Err(err) => return Err(err),
        };

        match header.ty {
            PacketType::VersionNegotiation => {
                self.handle_version_negotiation(&header, now)?;
                return Ok(data.len());
            }
            PacketType::Retry => {
                self.handle_retry(packet, &header, header_len, now)?;
                return Ok(data.len());
            }
            _ => {}
        }

        // Delimit this packet within the datagram.
        let epoch = match header.ty {
            PacketType::Initial => Epoch::Initial,
            PacketType::ZeroRtt => Epoch::ZeroRtt,
            PacketType::Handshake => Epoch::Handshake,
            PacketType::Short => Epoch::OneRtt,
            _ => unreachable!("handled above"),
        };
        let packet_end = match header.payload_len {
            Some(len) => {
                let ct_len = len as usize - header.pn_width.len();
                if header_len + ct_len > packet.len() {
                    return Err(Error::Quic(QuicError::FrameEncodingError));
                }
                header_len + ct_len
            }
            None => packet.len(),
        };
        let next_offset = offset + packet_end;

        if header.is_long() && header.version != self.version {
            trace!(version = header.version, "wrong version, packet dropped");
            return Ok(next_offset);
        }

        // Server bootstrap: initial keys derive from the client's chosen
        // destination ID (re-derived when a Retry changed it).
        if self.side == Side::Server
            && header.ty == PacketType::Initial
            && header.dcid != self.initial_keys_cid
        {
            self.keys[Epoch::Initial.index()] =
                Some(crypto::initial_keys(&header.dcid, Side::Server)?);
            self.initial_keys_cid = header.dcid.clone();
        }
        if self.side == Side::Server && self.state == ConnectionState::Initial {
            if header.ty != PacketType::Initial {
                return Ok(next_offset);
            }
            if self.config.use_retry && !self.retry_sent {
                self.send_retry(&header);
                return Ok(data.len());
            }
            if self.retry_sent && header.dcid != self.local_cid {
                // Address not validated: the Initial must echo the ID the
                // Retry handed out.
                return Ok(next_offset);
            }
            self.remote_cid = header.scid.clone().unwrap_or_else(ConnectionId::empty);
            self.remote_cid_locked = true;
            self.state = ConnectionState::Handshake;
        }

        // Source-ID discipline after the ID is locked: a mismatch drops
        // the packet, the connection stays up.
        if let Some(scid) = &header.scid {
            if self.remote_cid_locked && *scid != self.remote_cid {
                debug!(got = %scid, "source connection ID mismatch, packet dropped");
                return Ok(next_offset);
            }
        }
        // The client locks onto the server's ID with the first Handshake
        // packet (one more change is legal if a Retry intervened).
        if self.side == Side::Client
            && header.ty == PacketType::Handshake
            && !self.remote_cid_locked
        {
            if let Some(scid) = &header.scid {
                self.remote_cid = scid.clone();
                self.remote_cid_locked = true;
            }
            if self.state < ConnectionState::Handshake {
                self.state = ConnectionState::Handshake;
            }
        }

        if self.keys[epoch.index()].is_none() {
            // The engine may have derived this epoch's secrets since the
            // last packet.
            self.install_keys(epoch)?;
        }
        let keys = match &self.keys[epoch.index()] {
            Some(keys) => keys,
            None => {
                trace!(?epoch, "no keys for epoch, packet dropped");
                return Ok(next_offset);
            }
        };

        let space = epoch.space();
        let pn = number::recover(
            header.pn_truncated,
            self.spaces[space.index()].largest_recv(),
            header.pn_width,
        );
        if self.spaces[space.index()].is_duplicate(pn) {
            return Ok(next_offset);
        }

        let aad = &packet[..header_len];
        let ciphertext = packet[header_len..packet_end].to_vec();
        let plaintext = match keys.open.open(pn, aad, ciphertext) {
            Ok(plain) => plain,
            Err(_) => {
                if self.state < ConnectionState::Established && epoch != Epoch::OneRtt {
                    self.handshake_decrypt_failures += 1;
                    if self.handshake_decrypt_failures >= HANDSHAKE_DECRYPT_FAILURE_LIMIT {
                        return Err(Error::Quic(QuicError::ProtocolViolation));
                    }
                }
                trace!(pn, ?epoch, "AEAD open failed, packet dropped");
                return Ok(next_offset);
            }
        };
        self.handshake_decrypt_failures = 0;

        // Frames of a verified packet.
        let mut ack_eliciting = false;
        for item in FrameIter::new(Bytes::from(plaintext)) {
            let frame = item?;
            ack_eliciting |= frame.is_ack_eliciting();
            self.handle_frame(epoch, frame, now)?;
            if self.state >= ConnectionState::Draining {
                return Ok(data.len());
            }
        }

        self.spaces[space.index()].record_received(pn, ack_eliciting, now);
        self.touch(now);
        Ok(next_offset)
    }

    fn handle_version_negotiation(&mut self, header: &Header, now: Instant) -> Result<()> {
        if self.side != Side::Client
            || self.vn_handled
            || self.state > ConnectionState::WaitingHandshake
        {
            return Ok(());
        }
        // The packet must echo our IDs back.
        if header.dcid != self.local_cid || header.scid.as_ref() != Some(&self.remote_cid) {
            return Ok(());
        }
        // A list containing our version is a no-op by definition.
        if header.supported_versions.contains(&self.version) {
            return Ok(());
        }
        let chosen = version::select_version(&header.supported_versions)?;
        debug!(from = self.version, to = chosen, "version renegotiated");
        self.version = chosen;
        self.vn_handled = true;
        self.restart_first_flight(now);
        Ok(())
    }

    fn handle_retry(
        &mut self,
        packet: &[u8],
        header: &Header,
        header_len: usize,
        now: Instant,
    ) -> Result<()> {
        if self.side != Side::Client || self.state > ConnectionState::WaitingHandshake {
            return Ok(());
        }
        let scid = match &header.scid {
            Some(scid) => scid.clone(),
            None => return Ok(()),
        };
        // Only the first Retry counts; later ones (any source ID) are
        // ignored.
        if self.retry_scid.is_some() {
            debug!("repeat Retry ignored");
            return Ok(());
        }

        // The Retry is protected under the original initial keys; its
        // payload may carry handshake-stream data.
        if let (Some(keys), Some(payload_len)) =
            (&self.keys[Epoch::Initial.index()], header.payload_len)
        {
            let ct_len = (payload_len as usize).saturating_sub(header.pn_width.len());
            if header_len + ct_len <= packet.len() {
                let pn = number::recover(
                    header.pn_truncated,
                    self.spaces[SpaceId::Handshake.index()].largest_recv(),
                    header.pn_width,
                );
                let ciphertext = packet[header_len..header_len + ct_len].to_vec();
                if let Ok(plaintext) = keys.open.open(pn, &packet[..header_len], ciphertext) {
                    for item in FrameIter::new(Bytes::from(plaintext)) {
                        let frame = item?;
                        if let Frame::Stream { stream_id, offset, data, fin } = frame {
                            if stream_id == StreamId::HANDSHAKE {
                                self.streams.on_stream_frame(stream_id, offset, data, fin)?;
                            }
                        }
                    }
                    self.pump_tls(now)?;
                }
            }
        }

        debug!(new_dcid = %scid, "Retry accepted, restarting first flight");
        self.retry_scid = Some(scid.clone());
        self.remote_cid = scid.clone();
        self.initial_keys_cid = scid.clone();
        self.keys[Epoch::Initial.index()] = Some(crypto::initial_keys(&scid, Side::Client)?);
        self.restart_first_flight(now);
        Ok(())
    }

    /// Abandon everything in flight in the handshake space and reschedule
    /// its frames, for a VN- or Retry-triggered restart.
    fn restart_first_flight(&mut self, now: Instant) {
        for packet in self.recovery.take_space_packets(SpaceId::Handshake, now) {
            if packet.in_flight {
                self.congestion.on_packet_abandoned(packet.size);
            }
            self.requeue_frames(packet.epoch, packet.frames);
        }
        self.state = ConnectionState::Initial;
    }

    fn send_retry(&mut self, header: &Header) {
        self.retry_sent = true;
        self.retry_pending = true;
        self.remote_cid = header.scid.clone().unwrap_or_else(ConnectionId::empty);
        // The client proves address ownership by echoing our ID in its
        // next Initial.
        debug!(scid = %self.local_cid, "sending Retry");
    }

    fn build_retry(&mut self, now: Instant) -> Result<Vec<u8>> {
        let pn = self.spaces[SpaceId::Handshake.index()].next_packet_number();
        let mut payload = Vec::new();
        Frame::Padding { len: 1 }.encode(&mut payload)?;

        let mut header = Header::long(
            PacketType::Retry,
            self.version,
            self.remote_cid.clone(),
            self.local_cid.clone(),
            pn,
        );
        header.payload_len = Some((PnWidth::Four.len() + payload.len() + TAG_LEN) as u64);
        let mut head = Vec::new();
        header.encode(&mut head)?;

        let keys = self.keys[Epoch::Initial.index()]
            .as_ref()
            .ok_or(Error::Quic(QuicError::InternalError))?;
        keys.seal.seal(pn, &head, &mut payload)?;
        self.touch(now);

        let mut out = head;
        out.extend_from_slice(&payload);
        Ok(out)
    }

    fn handle_frame(&mut self, epoch: Epoch, frame: Frame, now: Instant) -> Result<()> {
        match frame {
            Frame::Padding { .. } | Frame::Ping => Ok(()),
            Frame::Ack(ack) => self.handle_ack(epoch, ack, now),
            Frame::Stream { stream_id, offset, data, fin } => {
                // Handshake packets carry only the handshake stream, and
                // the handshake stream never travels in 0-RTT.
                let allowed = match epoch {
                    Epoch::Initial | Epoch::Handshake => stream_id == StreamId::HANDSHAKE,
                    Epoch::ZeroRtt => stream_id != StreamId::HANDSHAKE,
                    Epoch::OneRtt => true,
                };
                if !allowed {
                    return Err(Error::Quic(QuicError::ProtocolViolation));
                }
                self.streams.on_stream_frame(stream_id, offset, data, fin)?;
                if stream_id == StreamId::HANDSHAKE {
                    self.pump_tls(now)?;
                }
                self.pump_stream_events();
                Ok(())
            }
            Frame::MaxData { maximum } => {
                self.streams.on_max_data(maximum);
                Ok(())
            }
            Frame::MaxStreamData { stream_id, maximum } => {
                self.streams.on_max_stream_data(stream_id, maximum)
            }
            Frame::MaxStreamId { maximum } => {
                self.streams.on_max_stream_id(maximum);
                Ok(())
            }
            Frame::Blocked { offset } => {
                debug!(offset, "peer is connection-blocked");
                Ok(())
            }
            Frame::StreamBlocked { stream_id, offset } => {
                debug!(stream = %stream_id, offset, "peer is stream-blocked");
                Ok(())
            }
            Frame::StreamIdBlocked { stream_id } => {
                debug!(stream = %stream_id, "peer is out of stream IDs");
                Ok(())
            }
            Frame::NewConnectionId { sequence, cid, .. } => {
                trace!(sequence, new = %cid, "peer offered connection ID");
                if !self.peer_alternate_cids.iter().any(|(seq, _)| *seq == sequence) {
                    self.peer_alternate_cids.push((sequence, cid));
                }
                Ok(())
            }
            Frame::StopSending { stream_id, error_code } => {
                self.streams.on_stop_sending(stream_id, error_code)
            }
            Frame::RstStream { stream_id, error_code, final_offset } => {
                self.streams.on_rst_stream(stream_id, error_code, final_offset)?;
                self.pump_stream_events();
                Ok(())
            }
            Frame::PathChallenge(data) => {
                let epoch = self.best_epoch();
                self.pending[epoch.index()].push(Frame::PathResponse(data));
                Ok(())
            }
            Frame::PathResponse(_) => {
                // We never migrate, so we never issued a challenge.
                trace!("unsolicited PATH_RESPONSE ignored");
                Ok(())
            }
            Frame::ConnectionClose { error_code, reason }
            | Frame::ApplicationClose { error_code, reason } => {
                debug!(error_code, "peer closed the connection");
                self.enter_draining(now);
                self.events
                    .push_back(ConnectionEvent::Closed { error_code, reason });
                Ok(())
            }
        }
    }

    fn handle_ack(&mut self, epoch: Epoch, ack: AckFrame, now: Instant) -> Result<()> {
        let space = epoch.space();
        let outcome =
            self.recovery
                .on_ack_received(space, &ack, self.peer_ack_delay_exponent, now)?;
        self.spaces[space.index()].on_largest_acked(ack.largest);

        for packet in &outcome.acked {
            if packet.in_flight {
                self.congestion.on_packet_acked(packet.pn, packet.size);
            }
            for frame in &packet.frames {
                self.streams.on_frame_acked(frame);
            }
        }
        self.on_packets_lost(outcome.lost);
        Ok(())
    }

    fn on_packets_lost(&mut self, lost: Vec<SentPacket>) {
        if lost.is_empty() {
            return;
        }
        let largest_lost = lost.iter().map(|p| p.pn).max().unwrap_or(0);
        let lost_bytes: u64 = lost.iter().filter(|p| p.in_flight).map(|p| p.size as u64).sum();
        self.congestion.on_packets_lost(largest_lost, lost_bytes);
        for packet in lost {
            self.requeue_frames(packet.epoch, packet.frames);
        }
    }

    fn requeue_frames(&mut self, epoch: Epoch, frames: Vec<Frame>) {
        for frame in frames {
            match frame {
                Frame::Stream { .. } | Frame::MaxData { .. } | Frame::MaxStreamData { .. } => {
                    self.streams.on_frame_lost(frame);
                }
                other if other.is_retransmittable() => {
                    self.pending[epoch.index()].push(other);
                }
                _ => {}
            }
        }
    }

    /// Feed reassembled handshake-stream bytes to the TLS engine and act
    /// on its progress.
    fn pump_tls(&mut self, now: Instant) -> Result<()> {
        while let Some(chunk) = self.streams.next_handshake_data() {
            let reply = self.tls.read_handshake(&chunk)?;
            if !reply.is_empty() {
                self.streams
                    .write(StreamId::HANDSHAKE, Bytes::from(reply), false)?;
            }
        }

        for epoch in [Epoch::Handshake, Epoch::ZeroRtt, Epoch::OneRtt] {
            if self.keys[epoch.index()].is_none() {
                self.install_keys(epoch)?;
            }
        }

        if self.params_remote.is_none() {
            if let Some(blob) = self.tls.peer_transport_parameters() {
                let params = TransportParameters::decode(&blob)?;
                self.peer_ack_delay_exponent = params.ack_delay_exponent;
                self.streams.apply_peer_params(
                    params.initial_max_data as u64,
                    params.initial_max_stream_data as u64,
                    params.initial_max_stream_id_bidi as u64,
                    params.initial_max_stream_id_uni as u64,
                );
                if params.idle_timeout > 0 {
                    let peer_idle = Duration::from_secs(params.idle_timeout as u64);
                    if self.idle_timeout.is_zero() || peer_idle < self.idle_timeout {
                        self.idle_timeout = peer_idle;
                    }
                }
                self.params_remote = Some(params);
                self.touch(now);
            }
        }

        if self.tls.is_complete()
            && self.keys[Epoch::OneRtt.index()].is_some()
            && self.state < ConnectionState::Established
        {
            debug!("handshake complete");
            self.state = ConnectionState::Established;
            self.events.push_back(ConnectionEvent::Connected);
        }
        Ok(())
    }

    fn install_keys(&mut self, epoch: Epoch) -> Result<()> {
        let pair = match epoch {
            Epoch::Initial => return Ok(()),
            Epoch::ZeroRtt => {
                // Single direction: the client writes, the server reads.
                match self.tls.epoch_secret(Epoch::ZeroRtt, Side::Client) {
                    Some(secret) => KeyPair::from_secrets(&secret, &secret)?,
                    None => return Ok(()),
                }
            }
            _ => {
                let local = self.tls.epoch_secret(epoch, self.side);
                let remote = self.tls.epoch_secret(epoch, self.side.peer());
                match (local, remote) {
                    (Some(local), Some(remote)) => KeyPair::from_secrets(&local, &remote)?,
                    _ => return Ok(()),
                }
            }
        };
        trace!(?epoch, "keys installed");
        self.keys[epoch.index()] = Some(pair);
        Ok(())
    }

    fn pump_stream_events(&mut self) {
        while let Some(id) = self.streams.next_opened() {
            self.events.push_back(ConnectionEvent::NewStream { stream_id: id });
        }
        while let Some((id, data, fin)) = self.streams.next_readable() {
            if fin {
                self.events.push_back(ConnectionEvent::StreamEnd { stream_id: id });
            } else {
                self.events.push_back(ConnectionEvent::StreamData { stream_id: id, data });
            }
        }
        while let Some((id, error_code)) = self.streams.next_reset() {
            self.events
                .push_back(ConnectionEvent::StreamReset { stream_id: id, error_code });
        }
    }

    fn touch(&mut self, now: Instant) {
        if !self.idle_timeout.is_zero() {
            self.idle_deadline = Some(now + self.idle_timeout);
        }
    }

    // ------------------------------------------------------------------
    // Close handling
    // ------------------------------------------------------------------

    fn start_close(&mut self, frame: Frame, now: Instant) {
        if self.state >= ConnectionState::Draining {
            return;
        }
        if let Frame::ConnectionClose { error_code, reason }
        | Frame::ApplicationClose { error_code, reason } = &frame
        {
            self.events.push_back(ConnectionEvent::Closed {
                error_code: *error_code,
                reason: reason.clone(),
            });
        }
        self.close_pending = Some(frame);
        self.enter_draining(now);
    }

    fn enter_draining(&mut self, now: Instant) {
        if self.state >= ConnectionState::Draining {
            return;
        }
        self.state = ConnectionState::Draining;
        self.drain_deadline = Some(now + 3 * self.recovery.pto());
        self.recovery.cancel();
        self.idle_deadline = None;
        self.events.push_back(ConnectionEvent::Draining);
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Current most-protected epoch with keys installed.
    fn best_epoch(&self) -> Epoch {
        if self.state == ConnectionState::Established {
            return Epoch::OneRtt;
        }
        if self.keys[Epoch::Handshake.index()].is_some()
            && self.handshake_send_epoch() == Epoch::Handshake
        {
            Epoch::Handshake
        } else {
            Epoch::Initial
        }
    }

    /// Where outbound handshake-stream data travels. Never 1-RTT: the
    /// peer must be able to read the flight that completes its handshake.
    fn handshake_send_epoch(&self) -> Epoch {
        match self.side {
            // The first flight must be readable under initial keys; once
            // the server's flight arrives the handshake epoch takes over.
            Side::Client if self.state < ConnectionState::Handshake => Epoch::Initial,
            _ => Epoch::Handshake,
        }
    }

    /// Epoch for application stream frames, if any is usable yet.
    fn app_epoch(&self) -> Option<Epoch> {
        if self.state == ConnectionState::Established {
            Some(Epoch::OneRtt)
        } else if self.side == Side::Client && self.keys[Epoch::ZeroRtt.index()].is_some() {
            Some(Epoch::ZeroRtt)
        } else {
            None
        }
    }

    /// Build the next outgoing datagram.
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Vec<u8>> {
        if self.state == ConnectionState::Closed {
            return None;
        }
        if let Some(frame) = self.close_pending.take() {
            let epoch = self.best_epoch();
            return match self.build_datagram(vec![(epoch, vec![frame])], false, now) {
                Ok(datagram) => datagram,
                Err(err) => {
                    warn!(?err, "failed to build close datagram");
                    None
                }
            };
        }
        if self.state >= ConnectionState::Draining {
            return None;
        }
        if self.retry_pending {
            self.retry_pending = false;
            return match self.build_retry(now) {
                Ok(datagram) => Some(datagram),
                Err(err) => {
                    warn!(?err, "failed to build Retry");
                    None
                }
            };
        }

        let mut plan: Vec<(Epoch, Vec<Frame>)> = Vec::new();
        let mut used = 0usize;
        let mut pad_initial = false;

        for epoch in Epoch::ALL {
            if self.keys[epoch.index()].is_none() {
                continue;
            }
            let overhead = self.packet_overhead(epoch);
            if used + overhead + TAG_LEN >= MAX_DATAGRAM_SIZE {
                break;
            }
            let budget = MAX_DATAGRAM_SIZE - used - overhead - TAG_LEN;
            let frames = self.gather_frames(epoch, budget, now);
            if frames.is_empty() {
                continue;
            }
            let size: usize = frames.iter().map(|f| f.encoded_len()).sum();
            used += overhead + size + TAG_LEN;

            // The client's Initial flight pads its datagram.
            if self.side == Side::Client && epoch == Epoch::Initial {
                pad_initial = true;
            }
            plan.push((epoch, frames));
            if pad_initial {
                break;
            }
        }

        if plan.is_empty() {
            return None;
        }
        if self.state == ConnectionState::Initial && self.side == Side::Client {
            self.state = ConnectionState::WaitingHandshake;
        }
        match self.build_datagram(plan, pad_initial, now) {
            Ok(datagram) => datagram,
            Err(err) => {
                warn!(?err, "failed to build datagram");
                let code = match err {
                    Error::Quic(code) => code,
                    Error::Local(_) => QuicError::InternalError,
                };
                self.start_close(
                    Frame::ConnectionClose { error_code: code.to_wire(), reason: Bytes::new() },
                    now,
                );
                None
            }
        }
    }

    /// Upper bound on header size for a packet of this epoch.
    fn packet_overhead(&self, epoch: Epoch) -> usize {
        match epoch {
            Epoch::OneRtt => 1 + self.remote_cid.len() + 4,
            _ => 1 + 4 + 1 + self.remote_cid.len() + self.local_cid.len() + 2 + 4,
        }
    }

    fn gather_frames(&mut self, epoch: Epoch, budget: usize, now: Instant) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut remaining = budget;
        let space = epoch.space();

        // Acknowledgments ride their space's canonical epoch.
        let ack_epoch = match space {
            SpaceId::Handshake => Epoch::Handshake,
            SpaceId::Application => Epoch::OneRtt,
        };
        let ack_epoch = if self.keys[ack_epoch.index()].is_some() {
            ack_epoch
        } else {
            self.handshake_send_epoch()
        };
        if epoch == ack_epoch && self.spaces[space.index()].wants_ack() {
            if let Some(ack) = self.spaces[space.index()]
                .take_ack(now, self.config.local_params.ack_delay_exponent)
            {
                let frame = Frame::Ack(ack);
                if frame.encoded_len() <= remaining {
                    remaining -= frame.encoded_len();
                    frames.push(frame);
                }
            }
        }

        let congestion_open = self.congestion.can_send();

        // Queued control frames for this epoch.
        if congestion_open {
            let queued = std::mem::take(&mut self.pending[epoch.index()]);
            for frame in queued {
                if frame.encoded_len() <= remaining {
                    remaining -= frame.encoded_len();
                    frames.push(frame);
                } else {
                    self.pending[epoch.index()].push(frame);
                }
            }
        }

        // Worst-case STREAM frame framing overhead (type + varints).
        const STREAM_OVERHEAD: usize = 24;

        // Handshake-stream data.
        if congestion_open && epoch == self.handshake_send_epoch() {
            while remaining > STREAM_OVERHEAD {
                match self.streams.poll_handshake_frame(remaining - STREAM_OVERHEAD) {
                    Some(frame) => {
                        remaining -= frame.encoded_len();
                        frames.push(frame);
                    }
                    None => break,
                }
            }
        }

        // Application data, then stream-level control (window updates
        // and blocked signals raised while polling ride along).
        if congestion_open && Some(epoch) == self.app_epoch() {
            while remaining > STREAM_OVERHEAD {
                match self.streams.poll_app_frame(remaining - STREAM_OVERHEAD) {
                    Some(frame) => {
                        remaining -= frame.encoded_len();
                        frames.push(frame);
                    }
                    None => break,
                }
            }
            for frame in self.streams.take_control_frames() {
                if frame.encoded_len() <= remaining {
                    remaining -= frame.encoded_len();
                    frames.push(frame);
                } else {
                    self.pending[epoch.index()].push(frame);
                }
            }
        }

        frames
    }

    fn build_datagram(
        &mut self,
        plan: Vec<(Epoch, Vec<Frame>)>,
        pad_initial: bool,
        now: Instant,
    ) -> Result<Option<Vec<u8>>> {
        let mut datagram = Vec::with_capacity(MAX_DATAGRAM_SIZE);
        let total = plan.len();
        for (index, (epoch, mut frames)) in plan.into_iter().enumerate() {
            // Pad the final packet of a client-initial datagram.
            let pad_target = if pad_initial && index == total - 1 && epoch == Epoch::Initial {
                Some(MIN_INITIAL_SIZE)
            } else {
                None
            };
            if let Some(target) = pad_target {
                let overhead = self.packet_overhead(epoch);
                let payload: usize = frames.iter().map(|f| f.encoded_len()).sum();
                let current = datagram.len() + overhead + payload + TAG_LEN;
                if current < target {
                    frames.push(Frame::Padding { len: target - current });
                }
            }
            self.seal_packet(epoch, frames, &mut datagram, now)?;
        }
        Ok(if datagram.is_empty() { None } else { Some(datagram) })
    }

    fn seal_packet(
        &mut self,
        epoch: Epoch,
        frames: Vec<Frame>,
        datagram: &mut Vec<u8>,
        now: Instant,
    ) -> Result<()> {
        let space = epoch.space();
        let pn = self.spaces[space.index()].next_packet_number();

        let mut payload = Vec::new();
        for frame in &frames {
            frame.encode(&mut payload)?;
        }

        let header = match epoch {
            Epoch::OneRtt => {
                let width = number::minimal_width(pn, self.spaces[space.index()].largest_acked());
                Header::short(self.remote_cid.clone(), pn, width, false)
            }
            _ => {
                let ty = match epoch {
                    Epoch::Initial => PacketType::Initial,
                    Epoch::ZeroRtt => PacketType::ZeroRtt,
                    Epoch::Handshake => PacketType::Handshake,
                    Epoch::OneRtt => unreachable!(),
                };
                let mut header = Header::long(
                    ty,
                    self.version,
                    self.remote_cid.clone(),
                    self.local_cid.clone(),
                    pn,
                );
                header.payload_len =
                    Some((PnWidth::Four.len() + payload.len() + TAG_LEN) as u64);
                header
            }
        };

        let mut head = Vec::new();
        header.encode(&mut head)?;

        let keys = self.keys[epoch.index()]
            .as_ref()
            .ok_or(Error::Quic(QuicError::InternalError))?;
        keys.seal.seal(pn, &head, &mut payload)?;

        let size = head.len() + payload.len();
        datagram.extend_from_slice(&head);
        datagram.extend_from_slice(&payload);

        let ack_eliciting = frames.iter().any(|f| f.is_ack_eliciting());
        let in_flight =
            ack_eliciting || frames.iter().any(|f| matches!(f, Frame::Padding { .. }));
        trace!(pn, ?epoch, size, ack_eliciting, "packet sent");

        self.recovery.on_packet_sent(
            SentPacket { pn, epoch, size, time: now, ack_eliciting, in_flight, frames },
            now,
        );
        if in_flight {
            self.congestion.on_packet_sent(size);
        }
        self.touch(now);
        Ok(())
    }
}
