//! Frame parsing over decrypted packet payloads.
//!
//! The parser consumes a [`Bytes`] cursor so STREAM payloads are sliced
//! out of the packet buffer without copying. Unknown frame types and
//! malformed fields are fatal frame-encoding errors.

use bytes::{Buf, Bytes};
use tinyvec::TinyVec;

use super::*;
use crate::error::{Error, QuicError, Result};
use crate::stream::StreamId;
use crate::varint;

/// Parse a single frame from the front of `buf`, advancing it.
pub fn parse_frame(buf: &mut Bytes) -> Result<Frame> {
    if buf.is_empty() {
        return Err(Error::Quic(QuicError::FrameEncodingError));
    }
    let ty = buf[0];

    if ty >= FRAME_STREAM_BASE && ty < FRAME_STREAM_BASE + 8 {
        return parse_stream(buf, ty);
    }

    match ty {
        FRAME_PADDING => {
            let mut len = 0;
            while !buf.is_empty() && buf[0] == FRAME_PADDING {
                buf.advance(1);
                len += 1;
            }
            Ok(Frame::Padding { len })
        }
        FRAME_RST_STREAM => {
            buf.advance(1);
            let stream_id = StreamId(varint::read(buf)?);
            let error_code = read_u16(buf)?;
            let final_offset = varint::read(buf)?;
            Ok(Frame::RstStream { stream_id, error_code, final_offset })
        }
        FRAME_CONNECTION_CLOSE | FRAME_APPLICATION_CLOSE => {
            buf.advance(1);
            let error_code = read_u16(buf)?;
            let reason_len = varint::read(buf)? as usize;
            if buf.remaining() < reason_len {
                return Err(Error::Quic(QuicError::FrameEncodingError));
            }
            let reason = buf.split_to(reason_len);
            if ty == FRAME_CONNECTION_CLOSE {
                Ok(Frame::ConnectionClose { error_code, reason })
            } else {
                Ok(Frame::ApplicationClose { error_code, reason })
            }
        }
        FRAME_MAX_DATA => {
            buf.advance(1);
            Ok(Frame::MaxData { maximum: varint::read(buf)? })
        }
        FRAME_MAX_STREAM_DATA => {
            buf.advance(1);
            let stream_id = StreamId(varint::read(buf)?);
            let maximum = varint::read(buf)?;
            Ok(Frame::MaxStreamData { stream_id, maximum })
        }
        FRAME_MAX_STREAM_ID => {
            buf.advance(1);
            Ok(Frame::MaxStreamId { maximum: StreamId(varint::read(buf)?) })
        }
        FRAME_PING => {
            buf.advance(1);
            Ok(Frame::Ping)
        }
        FRAME_BLOCKED => {
            buf.advance(1);
            Ok(Frame::Blocked { offset: varint::read(buf)? })
        }
        FRAME_STREAM_BLOCKED => {
            buf.advance(1);
            let stream_id = StreamId(varint::read(buf)?);
            let offset = varint::read(buf)?;
            Ok(Frame::StreamBlocked { stream_id, offset })
        }
        FRAME_STREAM_ID_BLOCKED => {
            buf.advance(1);
            Ok(Frame::StreamIdBlocked { stream_id: StreamId(varint::read(buf)?) })
        }
        FRAME_NEW_CONNECTION_ID => {
            buf.advance(1);
            let sequence = varint::read(buf)?;
            if buf.remaining() < 1 {
                return Err(Error::Quic(QuicError::FrameEncodingError));
            }
            let cid_len = buf.get_u8() as usize;
            if !(crate::ConnectionId::MIN_LEN..=crate::ConnectionId::MAX_LEN).contains(&cid_len)
                || buf.remaining() < cid_len + 16
            {
                return Err(Error::Quic(QuicError::FrameEncodingError));
            }
            let cid = crate::ConnectionId::new(buf.split_to(cid_len))
                .ok_or(Error::Quic(QuicError::FrameEncodingError))?;
            let mut reset_token = [0u8; 16];
            buf.copy_to_slice(&mut reset_token);
            Ok(Frame::NewConnectionId { sequence, cid, reset_token })
        }
        FRAME_STOP_SENDING => {
            buf.advance(1);
            let stream_id = StreamId(varint::read(buf)?);
            let error_code = read_u16(buf)?;
            Ok(Frame::StopSending { stream_id, error_code })
        }
        FRAME_ACK => {
            buf.advance(1);
            parse_ack(buf)
        }
        FRAME_PATH_CHALLENGE | FRAME_PATH_RESPONSE => {
            buf.advance(1);
            if buf.remaining() < 8 {
                return Err(Error::Quic(QuicError::FrameEncodingError));
            }
            let mut data = [0u8; 8];
            buf.copy_to_slice(&mut data);
            if ty == FRAME_PATH_CHALLENGE {
                Ok(Frame::PathChallenge(data))
            } else {
                Ok(Frame::PathResponse(data))
            }
        }
        _ => Err(Error::Quic(QuicError::FrameEncodingError)),
    }
}

fn parse_stream(buf: &mut Bytes, ty: u8) -> Result<Frame> {
    buf.advance(1);
    let fin = ty & STREAM_BIT_FIN != 0;
    let has_len = ty & STREAM_BIT_LEN != 0;
    let has_off = ty & STREAM_BIT_OFF != 0;

    let stream_id = StreamId(varint::read(buf)?);
    let offset = if has_off { varint::read(buf)? } else { 0 };
    let len = if has_len {
        let len = varint::read(buf)? as usize;
        if buf.remaining() < len {
            return Err(Error::Quic(QuicError::FrameEncodingError));
        }
        len
    } else {
        // Without LEN the frame extends to the end of the packet.
        buf.remaining()
    };
    if offset + len as u64 > varint::MAX {
        return Err(Error::Quic(QuicError::FrameEncodingError));
    }
    let data = buf.split_to(len);
    Ok(Frame::Stream { stream_id, offset, data, fin })
}

fn parse_ack(buf: &mut Bytes) -> Result<Frame> {
    let largest = varint::read(buf)?;
    let ack_delay = varint::read(buf)?;
    let block_count = varint::read(buf)?;
    let first_block = varint::read(buf)?;

    if first_block > largest {
        return Err(Error::Quic(QuicError::FrameEncodingError));
    }
    let mut ranges: TinyVec<[AckRange; 4]> = TinyVec::new();
    let mut smallest = largest - first_block;
    ranges.push((smallest, largest));

    for _ in 0..block_count {
        let gap = varint::read(buf)?;
        let block_len = varint::read(buf)?;
        let block_largest = smallest
            .checked_sub(gap + 2)
            .ok_or(Error::Quic(QuicError::FrameEncodingError))?;
        let block_smallest = block_largest
            .checked_sub(block_len)
            .ok_or(Error::Quic(QuicError::FrameEncodingError))?;
        ranges.push((block_smallest, block_largest));
        smallest = block_smallest;
    }

    let ack = AckFrame { largest, ack_delay, ranges };
    check_ack_ranges(&ack)?;
    Ok(Frame::Ack(ack))
}

fn read_u16(buf: &mut Bytes) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(Error::Quic(QuicError::FrameEncodingError));
    }
    Ok(buf.get_u16())
}

/// Iterator over the frames of one decrypted payload.
pub struct FrameIter {
    buf: Bytes,
    failed: bool,
}

impl FrameIter {
    pub fn new(payload: Bytes) -> Self {
        Self { buf: payload, failed: false }
    }
}

impl Iterator for FrameIter {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.is_empty() {
            return None;
        }
        match parse_frame(&mut self.buf) {
            Ok(frame) => Some(Ok(frame)),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
