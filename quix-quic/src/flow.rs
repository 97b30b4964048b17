//! Flow-control windows (draft-12 Section 11).
//!
//! One [`SendWindow`]/[`RecvWindow`] pair per stream and one per
//! connection. Senders never emit a byte at or beyond the peer's limit;
//! receivers enforce their advertised limit and refresh it once half the
//! window is consumed.

use crate::error::{Error, QuicError, Result};

/// Credit granted by the peer for data we send.
#[derive(Debug, Clone)]
pub struct SendWindow {
    limit: u64,
    used: u64,
}

impl SendWindow {
    pub fn new(initial_limit: u64) -> Self {
        Self { limit: initial_limit, used: 0 }
    }

    /// Bytes still permitted.
    pub fn available(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn is_blocked(&self) -> bool {
        self.available() == 0
    }

    /// Consume credit for bytes being sent.
    pub fn consume(&mut self, bytes: u64) {
        debug_assert!(bytes <= self.available());
        self.used += bytes;
    }

    /// MAX_DATA / MAX_STREAM_DATA from the peer. Limits never shrink.
    pub fn on_max(&mut self, maximum: u64) {
        if maximum > self.limit {
            self.limit = maximum;
        }
    }
}

/// Limit we advertise for data the peer sends.
#[derive(Debug, Clone)]
pub struct RecvWindow {
    /// Current advertised maximum offset.
    max: u64,
    /// Window size added on each refresh.
    window: u64,
    /// Highest offset seen from the peer.
    received: u64,
    /// Bytes delivered to the application.
    consumed: u64,
}

impl RecvWindow {
    pub fn new(window: u64) -> Self {
        Self { max: window, window, received: 0, consumed: 0 }
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    /// The peer advanced its highest offset. Exceeding the advertised
    /// limit is a fatal flow-control violation.
    pub fn on_received(&mut self, new_high: u64) -> Result<()> {
        if new_high > self.max {
            return Err(Error::Quic(QuicError::FlowControlError));
        }
        if new_high > self.received {
            self.received = new_high;
        }
        Ok(())
    }

    /// Bytes were handed to the application; returns a refreshed maximum
    /// to advertise once half the window is consumed.
    pub fn on_consumed(&mut self, bytes: u64) -> Option<u64> {
        self.consumed += bytes;
        if self.max.saturating_sub(self.consumed) < self.window / 2 {
            self.max = self.consumed + self.window;
            Some(self.max)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_window_consume_and_grow() {
        let mut window = SendWindow::new(100);
        assert_eq!(window.available(), 100);
        window.consume(100);
        assert!(window.is_blocked());

        window.on_max(300);
        assert_eq!(window.available(), 200);

        // Stale updates never shrink the limit.
        window.on_max(50);
        assert_eq!(window.available(), 200);
    }

    #[test]
    fn test_recv_window_violation() {
        let mut window = RecvWindow::new(100);
        assert!(window.on_received(100).is_ok());
        assert_eq!(
            window.on_received(101),
            Err(Error::Quic(QuicError::FlowControlError))
        );
    }

    #[test]
    fn test_recv_window_refresh_at_half() {
        let mut window = RecvWindow::new(100);
        window.on_received(60).unwrap();
        assert_eq!(window.on_consumed(40), None);
        // Crossing the half-way mark refreshes the advertisement.
        assert_eq!(window.on_consumed(20), Some(160));
        // And the next refresh happens one window later.
        assert_eq!(window.on_consumed(10), None);
    }

    #[test]
    fn test_recv_window_reordered_high_watermark() {
        let mut window = RecvWindow::new(100);
        window.on_received(80).unwrap();
        window.on_received(40).unwrap();
        assert!(window.on_received(90).is_ok());
    }
}
