//! QUIC frame types (draft-12 Section 5).
//!
//! Frames are a tagged variant with exhaustive matches in the parser, the
//! serializer and the connection's handler. Stream payloads are held as
//! [`Bytes`] so queued and retransmitted frames share the underlying
//! buffers.

pub mod parse;

use bytes::{BufMut, Bytes};
use tinyvec::TinyVec;

use crate::error::{Error, QuicError, Result};
use crate::stream::StreamId;
use crate::{varint, ConnectionId};

pub const FRAME_PADDING: u8 = 0x00;
pub const FRAME_RST_STREAM: u8 = 0x01;
pub const FRAME_CONNECTION_CLOSE: u8 = 0x02;
pub const FRAME_APPLICATION_CLOSE: u8 = 0x03;
pub const FRAME_MAX_DATA: u8 = 0x04;
pub const FRAME_MAX_STREAM_DATA: u8 = 0x05;
pub const FRAME_MAX_STREAM_ID: u8 = 0x06;
pub const FRAME_PING: u8 = 0x07;
pub const FRAME_BLOCKED: u8 = 0x08;
pub const FRAME_STREAM_BLOCKED: u8 = 0x09;
pub const FRAME_STREAM_ID_BLOCKED: u8 = 0x0A;
pub const FRAME_NEW_CONNECTION_ID: u8 = 0x0B;
pub const FRAME_STOP_SENDING: u8 = 0x0C;
pub const FRAME_ACK: u8 = 0x0D;
pub const FRAME_PATH_CHALLENGE: u8 = 0x0E;
pub const FRAME_PATH_RESPONSE: u8 = 0x0F;

/// STREAM frames occupy 0x10-0x17; the low three bits are flags.
pub const FRAME_STREAM_BASE: u8 = 0x10;
pub const STREAM_BIT_FIN: u8 = 0x01;
pub const STREAM_BIT_LEN: u8 = 0x02;
pub const STREAM_BIT_OFF: u8 = 0x04;

/// One acknowledged packet-number range, `(smallest, largest)` inclusive.
pub type AckRange = (u64, u64);

/// ACK frame: largest acknowledged, encoder ack delay, and acknowledged
/// ranges in descending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub largest: u64,
    /// Raw wire value; microseconds are `ack_delay << ack_delay_exponent`.
    pub ack_delay: u64,
    /// Descending, non-overlapping, non-adjacent ranges. The first range
    /// always contains `largest`.
    pub ranges: TinyVec<[AckRange; 4]>,
}

impl AckFrame {
    /// Ack delay in microseconds under the peer's exponent.
    pub fn delay_micros(&self, exponent: u8) -> u64 {
        self.ack_delay << exponent
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Padding {
        len: usize,
    },
    RstStream {
        stream_id: StreamId,
        error_code: u16,
        final_offset: u64,
    },
    ConnectionClose {
        error_code: u16,
        reason: Bytes,
    },
    ApplicationClose {
        error_code: u16,
        reason: Bytes,
    },
    MaxData {
        maximum: u64,
    },
    MaxStreamData {
        stream_id: StreamId,
        maximum: u64,
    },
    MaxStreamId {
        maximum: StreamId,
    },
    Ping,
    Blocked {
        offset: u64,
    },
    StreamBlocked {
        stream_id: StreamId,
        offset: u64,
    },
    StreamIdBlocked {
        stream_id: StreamId,
    },
    NewConnectionId {
        sequence: u64,
        cid: ConnectionId,
        reset_token: [u8; 16],
    },
    StopSending {
        stream_id: StreamId,
        error_code: u16,
    },
    Ack(AckFrame),
    PathChallenge([u8; 8]),
    PathResponse([u8; 8]),
    Stream {
        stream_id: StreamId,
        offset: u64,
        data: Bytes,
        fin: bool,
    },
}

impl Frame {
    /// Whether the frame requires acknowledgment by the peer.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Ack(_)
                | Frame::Padding { .. }
                | Frame::ConnectionClose { .. }
                | Frame::ApplicationClose { .. }
        )
    }

    /// Whether a lost packet carrying this frame schedules it again.
    pub fn is_retransmittable(&self) -> bool {
        !matches!(self, Frame::Ack(_) | Frame::Padding { .. })
    }

    /// Serialized size in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::Padding { len } => *len,
            Frame::RstStream { stream_id, final_offset, .. } => {
                1 + varint::size(stream_id.0) + 2 + varint::size(*final_offset)
            }
            Frame::ConnectionClose { reason, .. } | Frame::ApplicationClose { reason, .. } => {
                1 + 2 + varint::size(reason.len() as u64) + reason.len()
            }
            Frame::MaxData { maximum } => 1 + varint::size(*maximum),
            Frame::MaxStreamData { stream_id, maximum } => {
                1 + varint::size(stream_id.0) + varint::size(*maximum)
            }
            Frame::MaxStreamId { maximum } => 1 + varint::size(maximum.0),
            Frame::Ping => 1,
            Frame::Blocked { offset } => 1 + varint::size(*offset),
            Frame::StreamBlocked { stream_id, offset } => {
                1 + varint::size(stream_id.0) + varint::size(*offset)
            }
            Frame::StreamIdBlocked { stream_id } => 1 + varint::size(stream_id.0),
            Frame::NewConnectionId { sequence, cid, .. } => {
                1 + varint::size(*sequence) + 1 + cid.len() + 16
            }
            Frame::StopSending { stream_id, .. } => 1 + varint::size(stream_id.0) + 2,
            Frame::Ack(ack) => {
                let mut len = 1 + varint::size(ack.largest) + varint::size(ack.ack_delay);
                len += varint::size(ack.ranges.len().saturating_sub(1) as u64);
                let first = ack.ranges.first().copied().unwrap_or((ack.largest, ack.largest));
                len += varint::size(ack.largest - first.0);
                let mut prev_smallest = first.0;
                for &(smallest, largest) in ack.ranges.iter().skip(1) {
                    len += varint::size(prev_smallest - largest - 2);
                    len += varint::size(largest - smallest);
                    prev_smallest = smallest;
                }
                len
            }
            Frame::PathChallenge(_) | Frame::PathResponse(_) => 1 + 8,
            Frame::Stream { stream_id, offset, data, .. } => {
                let mut len = 1 + varint::size(stream_id.0);
                if *offset > 0 {
                    len += varint::size(*offset);
                }
                // LEN is always emitted so frames can be followed by others.
                len += varint::size(data.len() as u64);
                len + data.len()
            }
        }
    }

    /// Serialize into `out`.
    pub fn encode<B: BufMut>(&self, out: &mut B) -> Result<()> {
        match self {
            Frame::Padding { len } => {
                for _ in 0..*len {
                    out.put_u8(FRAME_PADDING);
                }
            }
            Frame::RstStream { stream_id, error_code, final_offset } => {
                out.put_u8(FRAME_RST_STREAM);
                varint::write(stream_id.0, out)?;
                out.put_u16(*error_code);
                varint::write(*final_offset, out)?;
            }
            Frame::ConnectionClose { error_code, reason } => {
                out.put_u8(FRAME_CONNECTION_CLOSE);
                out.put_u16(*error_code);
                varint::write(reason.len() as u64, out)?;
                out.put_slice(reason);
            }
            Frame::ApplicationClose { error_code, reason } => {
                out.put_u8(FRAME_APPLICATION_CLOSE);
                out.put_u16(*error_code);
                varint::write(reason.len() as u64, out)?;
                out.put_slice(reason);
            }
            Frame::MaxData { maximum } => {
                out.put_u8(FRAME_MAX_DATA);
                varint::write(*maximum, out)?;
            }
            Frame::MaxStreamData { stream_id, maximum } => {
                out.put_u8(FRAME_MAX_STREAM_DATA);
                varint::write(stream_id.0, out)?;
                varint::write(*maximum, out)?;
            }
            Frame::MaxStreamId { maximum } => {
                out.put_u8(FRAME_MAX_STREAM_ID);
                varint::write(maximum.0, out)?;
            }
            Frame::Ping => out.put_u8(FRAME_PING),
            Frame::Blocked { offset } => {
                out.put_u8(FRAME_BLOCKED);
                varint::write(*offset, out)?;
            }
            Frame::StreamBlocked { stream_id, offset } => {
                out.put_u8(FRAME_STREAM_BLOCKED);
                varint::write(stream_id.0, out)?;
                varint::write(*offset, out)?;
            }
            Frame::StreamIdBlocked { stream_id } => {
                out.put_u8(FRAME_STREAM_ID_BLOCKED);
                varint::write(stream_id.0, out)?;
            }
            Frame::NewConnectionId { sequence, cid, reset_token } => {
                out.put_u8(FRAME_NEW_CONNECTION_ID);
                varint::write(*sequence, out)?;
                out.put_u8(cid.len() as u8);
                out.put_slice(cid.as_bytes());
                out.put_slice(reset_token);
            }
            Frame::StopSending { stream_id, error_code } => {
                out.put_u8(FRAME_STOP_SENDING);
                varint::write(stream_id.0, out)?;
                out.put_u16(*error_code);
            }
            Frame::Ack(ack) => {
                out.put_u8(FRAME_ACK);
                varint::write(ack.largest, out)?;
                varint::write(ack.ack_delay, out)?;
                varint::write(ack.ranges.len().saturating_sub(1) as u64, out)?;
                let first = ack.ranges.first().copied().unwrap_or((ack.largest, ack.largest));
                varint::write(ack.largest - first.0, out)?;
                let mut prev_smallest = first.0;
                for &(smallest, largest) in ack.ranges.iter().skip(1) {
                    varint::write(prev_smallest - largest - 2, out)?;
                    varint::write(largest - smallest, out)?;
                    prev_smallest = smallest;
                }
            }
            Frame::PathChallenge(data) => {
                out.put_u8(FRAME_PATH_CHALLENGE);
                out.put_slice(data);
            }
            Frame::PathResponse(data) => {
                out.put_u8(FRAME_PATH_RESPONSE);
                out.put_slice(data);
            }
            Frame::Stream { stream_id, offset, data, fin } => {
                let mut ty = FRAME_STREAM_BASE | STREAM_BIT_LEN;
                if *offset > 0 {
                    ty |= STREAM_BIT_OFF;
                }
                if *fin {
                    ty |= STREAM_BIT_FIN;
                }
                out.put_u8(ty);
                varint::write(stream_id.0, out)?;
                if *offset > 0 {
                    varint::write(*offset, out)?;
                }
                varint::write(data.len() as u64, out)?;
                out.put_slice(data);
            }
        }
        Ok(())
    }
}

/// Validate ACK range structure before reassembling state from it.
pub(crate) fn check_ack_ranges(ack: &AckFrame) -> Result<()> {
    let mut prev_smallest = None;
    for &(smallest, largest) in ack.ranges.iter() {
        if smallest > largest {
            return Err(Error::Quic(QuicError::FrameEncodingError));
        }
        if let Some(prev) = prev_smallest {
            if largest + 2 > prev {
                return Err(Error::Quic(QuicError::FrameEncodingError));
            }
        } else if largest != ack.largest {
            return Err(Error::Quic(QuicError::FrameEncodingError));
        }
        prev_smallest = Some(smallest);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::parse::parse_frame;
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut out = Vec::new();
        frame.encode(&mut out).unwrap();
        assert_eq!(out.len(), frame.encoded_len(), "encoded_len for {frame:?}");
        let mut buf = Bytes::from(out);
        let parsed = parse_frame(&mut buf).unwrap();
        assert!(buf.is_empty(), "trailing bytes after {frame:?}");
        parsed
    }

    #[test]
    fn test_control_frame_roundtrips() {
        let frames = vec![
            Frame::Ping,
            Frame::MaxData { maximum: 1 << 20 },
            Frame::MaxStreamData { stream_id: StreamId(4), maximum: 300 },
            Frame::MaxStreamId { maximum: StreamId(128) },
            Frame::Blocked { offset: 77 },
            Frame::StreamBlocked { stream_id: StreamId(4), offset: 100 },
            Frame::StreamIdBlocked { stream_id: StreamId(9) },
            Frame::StopSending { stream_id: StreamId(8), error_code: 0x17 },
            Frame::RstStream { stream_id: StreamId(4), error_code: 1, final_offset: 5000 },
            Frame::ConnectionClose {
                error_code: QuicError::ProtocolViolation.to_wire(),
                reason: Bytes::from_static(b"bad frame"),
            },
            Frame::ApplicationClose { error_code: 0, reason: Bytes::new() },
            Frame::PathChallenge([1, 2, 3, 4, 5, 6, 7, 8]),
            Frame::PathResponse([8, 7, 6, 5, 4, 3, 2, 1]),
            Frame::NewConnectionId {
                sequence: 3,
                cid: ConnectionId::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap(),
                reset_token: [0xAB; 16],
            },
        ];
        for frame in frames {
            let parsed = roundtrip(frame.clone());
            assert_eq!(parsed, frame);
        }
    }

    #[test]
    fn test_stream_frame_roundtrip() {
        for (offset, fin) in [(0u64, false), (0, true), (1234, false), (1234, true)] {
            let frame = Frame::Stream {
                stream_id: StreamId(4),
                offset,
                data: Bytes::from_static(b"hello quic"),
                fin,
            };
            assert_eq!(roundtrip(frame.clone()), frame);
        }
    }

    #[test]
    fn test_empty_stream_frame_with_fin() {
        let frame = Frame::Stream {
            stream_id: StreamId(4),
            offset: 90,
            data: Bytes::new(),
            fin: true,
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_ack_frame_roundtrip() {
        let mut ranges: TinyVec<[AckRange; 4]> = TinyVec::new();
        ranges.push((17, 20));
        ranges.push((10, 14));
        ranges.push((2, 2));
        let frame = Frame::Ack(AckFrame { largest: 20, ack_delay: 64, ranges });
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_ack_single_range() {
        let mut ranges: TinyVec<[AckRange; 4]> = TinyVec::new();
        ranges.push((0, 9));
        let frame = Frame::Ack(AckFrame { largest: 9, ack_delay: 0, ranges });
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_padding_runs_coalesce() {
        let mut out = Vec::new();
        Frame::Padding { len: 7 }.encode(&mut out).unwrap();
        Frame::Ping.encode(&mut out).unwrap();
        let mut buf = Bytes::from(out);
        assert_eq!(parse_frame(&mut buf).unwrap(), Frame::Padding { len: 7 });
        assert_eq!(parse_frame(&mut buf).unwrap(), Frame::Ping);
    }

    #[test]
    fn test_ack_eliciting_classification() {
        assert!(!Frame::Ack(AckFrame { largest: 0, ack_delay: 0, ranges: TinyVec::new() })
            .is_ack_eliciting());
        assert!(!Frame::Padding { len: 1 }.is_ack_eliciting());
        assert!(!Frame::ConnectionClose { error_code: 0, reason: Bytes::new() }.is_ack_eliciting());
        assert!(Frame::Ping.is_ack_eliciting());
        assert!(Frame::Stream {
            stream_id: StreamId(0),
            offset: 0,
            data: Bytes::new(),
            fin: false
        }
        .is_ack_eliciting());
    }
}
