//! Reliability: RTT estimation, loss detection, congestion control.

pub mod congestion;
pub mod loss;
pub mod rtt;

pub use congestion::NewReno;
pub use loss::{AckOutcome, AlarmOutcome, LossDetector, SentPacket};
pub use rtt::RttEstimator;
