//! Error types for QUIC transport operations.
//!
//! Two taxonomies: [`QuicError`] values are wire-visible and travel in
//! CONNECTION_CLOSE frames; [`LocalError`] values never leave the process
//! and describe per-packet outcomes (drop, decryption failure, timeout).

use thiserror::Error;

/// Wire-visible transport errors (draft-12 Section 12.3).
///
/// Encoded as 16-bit codes in CONNECTION_CLOSE. Codes 0x0100-0x01FF carry
/// TLS alert descriptions.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QuicError {
    /// No error (0x00).
    #[error("no error")]
    NoError,

    /// Internal error (0x01).
    #[error("internal error")]
    InternalError,

    /// Server busy (0x02).
    #[error("server busy")]
    ServerBusy,

    /// Flow control error (0x03).
    #[error("flow control error")]
    FlowControlError,

    /// Stream ID error (0x04).
    #[error("stream ID error")]
    StreamIdError,

    /// Stream state error (0x05).
    #[error("stream state error")]
    StreamStateError,

    /// Final offset error (0x06).
    #[error("final offset error")]
    FinalOffsetError,

    /// Frame encoding error (0x07).
    #[error("frame encoding error")]
    FrameEncodingError,

    /// Transport parameter error (0x08).
    #[error("transport parameter error")]
    TransportParameterError,

    /// Version negotiation error (0x09).
    #[error("version negotiation error")]
    VersionNegotiationError,

    /// Protocol violation (0x0A).
    #[error("protocol violation")]
    ProtocolViolation,

    /// TLS alert (0x0100 + alert description).
    #[error("TLS alert: {0:#x}")]
    Crypto(u8),
}

impl QuicError {
    /// Convert to the 16-bit wire code.
    pub fn to_wire(&self) -> u16 {
        match self {
            QuicError::NoError => 0x00,
            QuicError::InternalError => 0x01,
            QuicError::ServerBusy => 0x02,
            QuicError::FlowControlError => 0x03,
            QuicError::StreamIdError => 0x04,
            QuicError::StreamStateError => 0x05,
            QuicError::FinalOffsetError => 0x06,
            QuicError::FrameEncodingError => 0x07,
            QuicError::TransportParameterError => 0x08,
            QuicError::VersionNegotiationError => 0x09,
            QuicError::ProtocolViolation => 0x0A,
            QuicError::Crypto(alert) => 0x0100 | (*alert as u16),
        }
    }

    /// Convert a 16-bit wire code to an error.
    ///
    /// Unknown codes map to `InternalError` rather than failing; a peer
    /// sending a code we do not know still closed the connection.
    pub fn from_wire(code: u16) -> Self {
        match code {
            0x00 => QuicError::NoError,
            0x01 => QuicError::InternalError,
            0x02 => QuicError::ServerBusy,
            0x03 => QuicError::FlowControlError,
            0x04 => QuicError::StreamIdError,
            0x05 => QuicError::StreamStateError,
            0x06 => QuicError::FinalOffsetError,
            0x07 => QuicError::FrameEncodingError,
            0x08 => QuicError::TransportParameterError,
            0x09 => QuicError::VersionNegotiationError,
            0x0A => QuicError::ProtocolViolation,
            0x0100..=0x01FF => QuicError::Crypto((code & 0xFF) as u8),
            _ => QuicError::InternalError,
        }
    }
}

/// Process-local packet outcomes; never serialized.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LocalError {
    /// Drop this packet, keep the connection.
    #[error("packet ignored")]
    IgnorePacket,

    /// AEAD open failed; drop this packet.
    #[error("decryption failure")]
    DecryptionFailure,

    /// A deadline elapsed.
    #[error("timeout")]
    Timeout,
}

/// Unified error for transport operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Quic(#[from] QuicError),

    #[error(transparent)]
    Local(#[from] LocalError),
}

impl Error {
    /// Whether this error tears down the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Quic(_))
    }
}

pub type Result<T> = core::result::Result<T, Error>;
