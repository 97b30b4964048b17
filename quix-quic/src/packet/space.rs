//! Packet-number spaces (draft-12 Section 4.8).
//!
//! Four epochs map onto two spaces: Initial and Handshake packets share
//! the handshake space, 0-RTT and 1-RTT the application space. A space
//! owns the send-side counter (strictly monotonic) and the receive-side
//! range set that ACK frames are synthesized from.

use std::collections::BTreeMap;
use std::time::Instant;

use tinyvec::TinyVec;

use crate::frames::{AckFrame, AckRange};

/// Identifies a packet-number space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceId {
    Handshake = 0,
    Application = 1,
}

pub const SPACE_COUNT: usize = 2;

impl SpaceId {
    pub fn index(self) -> usize {
        self as usize
    }
}

/// State of one packet-number space.
#[derive(Debug, Default)]
pub struct PacketSpace {
    /// Next packet number to assign on send.
    next_pn: u64,

    /// Largest packet number received in this space.
    largest_recv: Option<u64>,

    /// Receive time of the largest packet, for ack-delay.
    largest_recv_time: Option<Instant>,

    /// Received ranges, start -> end inclusive, non-overlapping.
    recv_ranges: BTreeMap<u64, u64>,

    /// An ack-eliciting packet arrived since the last ACK we sent.
    ack_pending: bool,

    /// Largest of our packet numbers the peer has acknowledged.
    largest_acked: Option<u64>,
}

impl PacketSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next send-side packet number.
    pub fn next_packet_number(&mut self) -> u64 {
        let pn = self.next_pn;
        self.next_pn += 1;
        pn
    }

    pub fn peek_packet_number(&self) -> u64 {
        self.next_pn
    }

    pub fn largest_recv(&self) -> Option<u64> {
        self.largest_recv
    }

    pub fn largest_acked(&self) -> Option<u64> {
        self.largest_acked
    }

    pub fn on_largest_acked(&mut self, pn: u64) {
        if self.largest_acked.map_or(true, |cur| pn > cur) {
            self.largest_acked = Some(pn);
        }
    }

    /// Whether `pn` was already received.
    pub fn is_duplicate(&self, pn: u64) -> bool {
        self.recv_ranges
            .range(..=pn)
            .next_back()
            .map_or(false, |(_, &end)| end >= pn)
    }

    /// Record a received packet number, merging adjacent ranges.
    pub fn record_received(&mut self, pn: u64, ack_eliciting: bool, now: Instant) {
        if self.largest_recv.map_or(true, |cur| pn > cur) {
            self.largest_recv = Some(pn);
            self.largest_recv_time = Some(now);
        }
        if ack_eliciting {
            self.ack_pending = true;
        }

        let mut start = pn;
        let mut end = pn;
        // Merge with a preceding range that touches pn.
        if let Some((&s, &e)) = self.recv_ranges.range(..=pn).next_back() {
            if e >= pn {
                return; // duplicate
            }
            if e + 1 == pn {
                start = s;
                self.recv_ranges.remove(&s);
            }
        }
        // Merge with a following range starting at pn + 1.
        if let Some(&e) = self.recv_ranges.get(&(pn + 1)) {
            end = e;
            self.recv_ranges.remove(&(pn + 1));
        }
        self.recv_ranges.insert(start, end);
    }

    /// An ack-eliciting packet awaits acknowledgment.
    pub fn wants_ack(&self) -> bool {
        self.ack_pending
    }

    /// Synthesize an ACK frame covering everything received.
    ///
    /// Clears the ack-pending flag; returns `None` when nothing has been
    /// received in this space.
    pub fn take_ack(&mut self, now: Instant, ack_delay_exponent: u8) -> Option<AckFrame> {
        let largest = self.largest_recv?;
        let delay_micros = self
            .largest_recv_time
            .and_then(|t| now.checked_duration_since(t))
            .map_or(0, |d| d.as_micros() as u64);

        let mut ranges: TinyVec<[AckRange; 4]> = TinyVec::new();
        for (&start, &end) in self.recv_ranges.iter().rev() {
            ranges.push((start, end));
        }
        self.ack_pending = false;
        Some(AckFrame {
            largest,
            ack_delay: delay_micros >> ack_delay_exponent,
            ranges,
        })
    }
}
