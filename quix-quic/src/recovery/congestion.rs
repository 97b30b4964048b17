//! NewReno congestion control.
//!
//! Window accounting in bytes with slow start, congestion avoidance and
//! packet-number-keyed recovery epochs: a packet is "in recovery" iff its
//! number is at most `end_of_recovery`, and only a loss beyond that point
//! starts a new epoch.

use crate::DEFAULT_MSS;

/// Initial congestion window: 10 full-sized segments.
pub const INITIAL_WINDOW: u64 = 10 * DEFAULT_MSS;

/// Floor for the congestion window.
pub const MINIMUM_WINDOW: u64 = 2 * DEFAULT_MSS;

#[derive(Debug, Clone)]
pub struct NewReno {
    cwnd: u64,
    bytes_in_flight: u64,
    ssthresh: u64,
    /// Largest lost packet number of the current recovery epoch.
    end_of_recovery: Option<u64>,
}

impl NewReno {
    pub fn new() -> Self {
        Self {
            cwnd: INITIAL_WINDOW,
            bytes_in_flight: 0,
            ssthresh: u64::MAX,
            end_of_recovery: None,
        }
    }

    pub fn window(&self) -> u64 {
        self.cwnd
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    pub fn ssthresh(&self) -> u64 {
        self.ssthresh
    }

    fn in_recovery(&self, pn: u64) -> bool {
        self.end_of_recovery.map_or(false, |end| pn <= end)
    }

    /// Sending is permitted while bytes in flight stay under the window.
    pub fn can_send(&self) -> bool {
        self.bytes_in_flight < self.cwnd
    }

    pub fn available_window(&self) -> u64 {
        self.cwnd.saturating_sub(self.bytes_in_flight)
    }

    /// A packet that counts toward the window was sent.
    pub fn on_packet_sent(&mut self, size: usize) {
        self.bytes_in_flight += size as u64;
    }

    /// A counted packet was acknowledged.
    pub fn on_packet_acked(&mut self, pn: u64, size: usize) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(size as u64);

        // The window does not grow during recovery.
        if self.in_recovery(pn) {
            return;
        }
        if self.cwnd < self.ssthresh {
            // Slow start.
            self.cwnd += size as u64;
        } else {
            // Congestion avoidance: one MSS per window's worth of acks.
            self.cwnd += DEFAULT_MSS * size as u64 / self.cwnd;
        }
    }

    /// Counted packets were declared lost; `largest_lost` decides whether a
    /// new recovery epoch begins.
    pub fn on_packets_lost(&mut self, largest_lost: u64, lost_bytes: u64) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(lost_bytes);

        if !self.in_recovery(largest_lost) {
            self.end_of_recovery = Some(largest_lost);
            self.cwnd = (self.cwnd / 2).max(MINIMUM_WINDOW);
            self.ssthresh = self.cwnd;
        }
    }

    /// A counted packet was abandoned (retransmitted under a new number);
    /// it stops occupying the window without any congestion response.
    pub fn on_packet_abandoned(&mut self, size: usize) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(size as u64);
    }

    /// Two consecutive retransmission timeouts were confirmed.
    pub fn on_retransmission_timeout_verified(&mut self) {
        self.cwnd = MINIMUM_WINDOW;
    }
}

impl Default for NewReno {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSS: usize = DEFAULT_MSS as usize;

    #[test]
    fn test_initial_state() {
        let cc = NewReno::new();
        assert_eq!(cc.window(), 14_600);
        assert_eq!(cc.bytes_in_flight(), 0);
        assert_eq!(cc.ssthresh(), u64::MAX);
        assert!(cc.can_send());
    }

    #[test]
    fn test_slow_start_then_recovery_then_avoidance() {
        let mut cc = NewReno::new();

        // Send 20 full-sized packets.
        for _ in 0..20 {
            cc.on_packet_sent(MSS);
        }
        assert_eq!(cc.bytes_in_flight(), 20 * DEFAULT_MSS);

        // Ack the first 10 in slow start: the window grows by each acked
        // packet's size.
        for pn in 0..10u64 {
            cc.on_packet_acked(pn, MSS);
        }
        assert_eq!(cc.window(), INITIAL_WINDOW + 10 * DEFAULT_MSS);

        // Packet 15 lost: window halves and becomes the threshold.
        let before = cc.window();
        cc.on_packets_lost(15, DEFAULT_MSS);
        assert_eq!(cc.window(), before / 2);
        assert_eq!(cc.ssthresh(), cc.window());

        // Acks for packets in the recovery epoch do not grow the window.
        let during = cc.window();
        cc.on_packet_acked(14, MSS);
        assert_eq!(cc.window(), during);

        // An ack past end_of_recovery grows the window by the avoidance
        // formula.
        let cwnd = cc.window();
        cc.on_packet_acked(16, MSS);
        assert_eq!(cc.window(), cwnd + DEFAULT_MSS * DEFAULT_MSS / cwnd);
    }

    #[test]
    fn test_loss_within_recovery_does_not_halve_again() {
        let mut cc = NewReno::new();
        for _ in 0..10 {
            cc.on_packet_sent(MSS);
        }
        cc.on_packets_lost(8, DEFAULT_MSS);
        let after_first = cc.window();
        cc.on_packets_lost(5, DEFAULT_MSS);
        assert_eq!(cc.window(), after_first);

        // A loss beyond the epoch halves again.
        cc.on_packets_lost(9, DEFAULT_MSS);
        assert_eq!(cc.window(), (after_first / 2).max(MINIMUM_WINDOW));
    }

    #[test]
    fn test_window_floor() {
        let mut cc = NewReno::new();
        cc.on_packet_sent(MSS);
        let mut largest = 0;
        for round in 0..10 {
            cc.on_packets_lost(largest + 1, 0);
            largest += 10 * (round + 1);
        }
        assert_eq!(cc.window(), MINIMUM_WINDOW);
    }

    #[test]
    fn test_rto_verified_collapses_window() {
        let mut cc = NewReno::new();
        cc.on_retransmission_timeout_verified();
        assert_eq!(cc.window(), 2 * DEFAULT_MSS);
    }

    #[test]
    fn test_bytes_in_flight_never_negative() {
        let mut cc = NewReno::new();
        cc.on_packet_sent(MSS);
        cc.on_packet_acked(0, MSS);
        cc.on_packet_acked(1, MSS);
        assert_eq!(cc.bytes_in_flight(), 0);
        cc.on_packet_abandoned(MSS);
        assert_eq!(cc.bytes_in_flight(), 0);
    }

    #[test]
    fn test_gating() {
        let mut cc = NewReno::new();
        while cc.can_send() {
            cc.on_packet_sent(MSS);
        }
        assert!(cc.bytes_in_flight() >= cc.window());
        assert_eq!(cc.available_window(), 0);
        cc.on_packet_acked(0, MSS);
        assert!(cc.can_send());
    }
}
