//! Loss detection (draft-12 QUIC-RECOVERY).
//!
//! Tracks sent packets per number space, consumes ACK frames, declares
//! losses by packet and time thresholds, and drives a single-shot alarm
//! covering handshake retransmission, early retransmit, tail-loss probes
//! and RTO. Outcomes are returned as typed values; the connection feeds
//! them to the congestion controller and the retransmission path.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::crypto::Epoch;
use crate::error::{Error, QuicError, Result};
use crate::frames::{AckFrame, Frame};
use crate::packet::{SpaceId, SPACE_COUNT};
use crate::recovery::rtt::RttEstimator;

/// Packets reordered by more than this are lost.
pub const REORDERING_THRESHOLD: u64 = 3;

/// Time-threshold numerator/denominator: 9/8 of the greater RTT estimate.
pub const TIME_THRESHOLD_NUM: u32 = 9;
pub const TIME_THRESHOLD_DEN: u32 = 8;

/// Maximum tail-loss probes before falling back to RTO.
pub const MAX_TLP_COUNT: u32 = 2;

/// Floors for the probe and retransmission timers.
pub const MIN_TLP_TIMEOUT: Duration = Duration::from_millis(10);
pub const MIN_RTO_TIMEOUT: Duration = Duration::from_millis(200);

/// Peer ack-delay ceiling credited in RTO computation.
pub const MAX_ACK_DELAY: Duration = Duration::from_millis(25);

/// A packet handed to the loss detector on send.
#[derive(Debug)]
pub struct SentPacket {
    pub pn: u64,
    pub epoch: Epoch,
    pub size: usize,
    pub time: Instant,
    pub ack_eliciting: bool,
    /// Counts toward the congestion window (ack-eliciting or padded).
    pub in_flight: bool,
    /// Frames to reschedule if the packet is lost.
    pub frames: Vec<Frame>,
}

/// Result of consuming one ACK frame.
#[derive(Debug, Default)]
pub struct AckOutcome {
    pub acked: Vec<SentPacket>,
    pub lost: Vec<SentPacket>,
}

/// Result of the loss-detection alarm firing.
#[derive(Debug, Default)]
pub struct AlarmOutcome {
    /// Handshake packets pulled for immediate retransmission.
    pub retransmit: Vec<SentPacket>,
    /// Packets declared lost by the time threshold.
    pub lost: Vec<SentPacket>,
    /// Probe packets the connection should emit.
    pub probes: u32,
    /// The second consecutive RTO fired.
    pub rto_verified: bool,
}

pub struct LossDetector {
    rtt: RttEstimator,
    sent: [BTreeMap<u64, SentPacket>; SPACE_COUNT],
    largest_acked: [Option<u64>; SPACE_COUNT],
    largest_sent: [Option<u64>; SPACE_COUNT],
    loss_time: [Option<Instant>; SPACE_COUNT],
    time_of_last_handshake: Option<Instant>,
    time_of_last_ack_eliciting: Option<Instant>,
    handshake_count: u32,
    tlp_count: u32,
    rto_count: u32,
    alarm: Option<Instant>,
}

impl LossDetector {
    pub fn new() -> Self {
        Self {
            rtt: RttEstimator::default(),
            sent: [BTreeMap::new(), BTreeMap::new()],
            largest_acked: [None; SPACE_COUNT],
            largest_sent: [None; SPACE_COUNT],
            loss_time: [None; SPACE_COUNT],
            time_of_last_handshake: None,
            time_of_last_ack_eliciting: None,
            handshake_count: 0,
            tlp_count: 0,
            rto_count: 0,
            alarm: None,
        }
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Probe timeout: the draining period is a multiple of this.
    pub fn pto(&self) -> Duration {
        (self.rtt.smoothed() + 4 * self.rtt.var() + MAX_ACK_DELAY).max(MIN_RTO_TIMEOUT)
    }

    /// The alarm deadline, if armed.
    pub fn next_alarm(&self) -> Option<Instant> {
        self.alarm
    }

    /// Cancel all timers; used when the connection closes.
    pub fn cancel(&mut self) {
        self.alarm = None;
    }

    pub fn has_ack_eliciting_outstanding(&self) -> bool {
        self.sent
            .iter()
            .any(|space| space.values().any(|p| p.ack_eliciting))
    }

    fn handshake_outstanding(&self) -> bool {
        self.sent[SpaceId::Handshake.index()]
            .values()
            .any(|p| p.ack_eliciting)
    }

    /// Record a sent packet and re-arm the alarm.
    pub fn on_packet_sent(&mut self, packet: SentPacket, now: Instant) {
        let space = packet.epoch.space();
        let idx = space.index();
        self.largest_sent[idx] = Some(match self.largest_sent[idx] {
            Some(largest) => largest.max(packet.pn),
            None => packet.pn,
        });
        if packet.ack_eliciting {
            self.time_of_last_ack_eliciting = Some(packet.time);
            if space == SpaceId::Handshake {
                self.time_of_last_handshake = Some(packet.time);
            }
        }
        self.sent[idx].insert(packet.pn, packet);
        self.set_alarm(now);
    }

    /// Consume an ACK frame received in `space`.
    pub fn on_ack_received(
        &mut self,
        space: SpaceId,
        ack: &AckFrame,
        ack_delay_exponent: u8,
        now: Instant,
    ) -> Result<AckOutcome> {
        let idx = space.index();
        // A peer cannot acknowledge what was never sent.
        if self.largest_sent[idx].map_or(true, |sent| ack.largest > sent) {
            return Err(Error::Quic(QuicError::ProtocolViolation));
        }

        let mut outcome = AckOutcome::default();

        // RTT from the largest newly acknowledged ack-eliciting packet.
        if let Some(packet) = self.sent[idx].get(&ack.largest) {
            if packet.ack_eliciting {
                let sample = now.saturating_duration_since(packet.time);
                let delay = Duration::from_micros(ack.delay_micros(ack_delay_exponent));
                self.rtt.update(sample, delay);
            }
        }

        for &(smallest, largest) in ack.ranges.iter() {
            let acked: Vec<u64> = self.sent[idx]
                .range(smallest..=largest)
                .map(|(&pn, _)| pn)
                .collect();
            for pn in acked {
                if let Some(packet) = self.sent[idx].remove(&pn) {
                    outcome.acked.push(packet);
                }
            }
        }

        if self.largest_acked[idx].map_or(true, |cur| ack.largest > cur) {
            self.largest_acked[idx] = Some(ack.largest);
        }

        if !outcome.acked.is_empty() {
            // Progress: timeout ladders start over.
            self.handshake_count = 0;
            self.tlp_count = 0;
            self.rto_count = 0;
        }

        outcome.lost = self.detect_lost_packets(space, now);
        self.set_alarm(now);
        trace!(
            space = ?space,
            acked = outcome.acked.len(),
            lost = outcome.lost.len(),
            "processed ack"
        );
        Ok(outcome)
    }

    /// Packet- and time-threshold loss detection for one space.
    fn detect_lost_packets(&mut self, space: SpaceId, now: Instant) -> Vec<SentPacket> {
        let idx = space.index();
        self.loss_time[idx] = None;
        let largest_acked = match self.largest_acked[idx] {
            Some(largest) => largest,
            None => return Vec::new(),
        };

        let max_rtt = self.rtt.latest().max(self.rtt.smoothed());
        let delay_until_lost = max_rtt * TIME_THRESHOLD_NUM / TIME_THRESHOLD_DEN;

        let mut lost_pns = Vec::new();
        let mut earliest_loss_time = None;
        for (&pn, packet) in self.sent[idx].range(..largest_acked) {
            let time_since_sent = now.saturating_duration_since(packet.time);
            if largest_acked - pn > REORDERING_THRESHOLD || time_since_sent > delay_until_lost {
                lost_pns.push(pn);
            } else {
                let when = packet.time + delay_until_lost;
                earliest_loss_time = Some(match earliest_loss_time {
                    Some(cur) if cur < when => cur,
                    _ => when,
                });
            }
        }
        self.loss_time[idx] = earliest_loss_time;

        let mut lost = Vec::new();
        for pn in lost_pns {
            if let Some(packet) = self.sent[idx].remove(&pn) {
                debug!(pn, space = ?space, "packet lost");
                lost.push(packet);
            }
        }
        lost
    }

    /// Pull every tracked packet of a space, without declaring loss.
    ///
    /// Used when a Retry or Version Negotiation restarts the first
    /// flight: the frames are rescheduled, the old numbers abandoned.
    pub fn take_space_packets(&mut self, space: SpaceId, now: Instant) -> Vec<SentPacket> {
        let packets: Vec<SentPacket> = std::mem::take(&mut self.sent[space.index()])
            .into_values()
            .collect();
        self.loss_time[space.index()] = None;
        self.set_alarm(now);
        packets
    }

    /// The loss-detection alarm fired.
    pub fn on_alarm(&mut self, now: Instant) -> AlarmOutcome {
        let mut outcome = AlarmOutcome::default();

        if self.handshake_outstanding() {
            // Handshake retransmission: pull every outstanding handshake
            // packet; the connection reschedules their frames under new
            // numbers.
            let idx = SpaceId::Handshake.index();
            let pns: Vec<u64> = self.sent[idx]
                .iter()
                .filter(|(_, p)| p.ack_eliciting)
                .map(|(&pn, _)| pn)
                .collect();
            for pn in pns {
                if let Some(packet) = self.sent[idx].remove(&pn) {
                    outcome.retransmit.push(packet);
                }
            }
            self.handshake_count += 1;
        } else if let Some((space, _)) = self.earliest_loss_time() {
            outcome.lost = self.detect_lost_packets(space, now);
        } else if self.tlp_count < MAX_TLP_COUNT {
            outcome.probes = 1;
            self.tlp_count += 1;
        } else {
            self.rto_count += 1;
            outcome.probes = 2;
            outcome.rto_verified = self.rto_count >= 2;
        }

        self.set_alarm(now);
        outcome
    }

    fn earliest_loss_time(&self) -> Option<(SpaceId, Instant)> {
        let mut earliest: Option<(SpaceId, Instant)> = None;
        for space in [SpaceId::Handshake, SpaceId::Application] {
            if let Some(when) = self.loss_time[space.index()] {
                match earliest {
                    Some((_, cur)) if cur <= when => {}
                    _ => earliest = Some((space, when)),
                }
            }
        }
        earliest
    }

    /// Recompute the alarm deadline. Single-shot; recomputing an unchanged
    /// deadline is a no-op, and without ack-eliciting packets outstanding
    /// the alarm is disarmed.
    fn set_alarm(&mut self, _now: Instant) {
        if !self.has_ack_eliciting_outstanding() {
            self.alarm = None;
            return;
        }

        let alarm = if self.handshake_outstanding() {
            let base = (2 * self.rtt.smoothed()).max(MIN_TLP_TIMEOUT);
            self.time_of_last_handshake
                .map(|t| t + base * (1u32 << self.handshake_count.min(16)))
        } else if let Some((_, when)) = self.earliest_loss_time() {
            Some(when)
        } else if self.tlp_count < MAX_TLP_COUNT {
            let timeout = (self.rtt.smoothed() * 3 / 2 + MAX_ACK_DELAY).max(MIN_TLP_TIMEOUT);
            self.time_of_last_ack_eliciting.map(|t| t + timeout)
        } else {
            let timeout = self.pto() * (1u32 << self.rto_count.min(16));
            self.time_of_last_ack_eliciting.map(|t| t + timeout)
        };
        self.alarm = alarm;
    }
}

impl Default for LossDetector {
    fn default() -> Self {
        Self::new()
    }
}
