//! Events surfaced to the application driver.

use bytes::Bytes;

use crate::stream::StreamId;

/// Notifications produced by [`super::Connection`] for its driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Handshake completed; 1-RTT keys are installed.
    Connected,

    /// The peer opened a stream.
    NewStream { stream_id: StreamId },

    /// Ordered stream data is available.
    StreamData { stream_id: StreamId, data: Bytes },

    /// The peer finished a stream; all data has been delivered.
    StreamEnd { stream_id: StreamId },

    /// The peer reset a stream.
    StreamReset { stream_id: StreamId, error_code: u16 },

    /// The connection entered the draining period.
    Draining,

    /// The connection is closed. `error_code` is the wire code from the
    /// closing frame, or NO_ERROR for quiet local shutdown.
    Closed { error_code: u16, reason: Bytes },
}
