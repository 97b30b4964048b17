//! Stream data buffers: out-of-order reassembly and send-side queueing.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::error::{Error, QuicError, Result};

/// Receive-side reassembly.
///
/// Chunks are keyed by offset and trimmed on insert so the map always
/// holds non-overlapping gaps-only data. Reads deliver a strictly
/// contiguous byte sequence; FIN is reported once, when every byte below
/// the final offset has been read.
#[derive(Debug, Default)]
pub struct RecvBuffer {
    chunks: BTreeMap<u64, Bytes>,
    read_offset: u64,
    /// Highest offset seen, for flow-control accounting.
    high_watermark: u64,
    final_offset: Option<u64>,
    fin_delivered: bool,
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    pub fn high_watermark(&self) -> u64 {
        self.high_watermark
    }

    pub fn final_offset(&self) -> Option<u64> {
        self.final_offset
    }

    /// Insert a received chunk.
    ///
    /// Overlaps with already-buffered or already-read data are discarded;
    /// conflicting final offsets are fatal.
    pub fn insert(&mut self, offset: u64, data: Bytes, fin: bool) -> Result<()> {
        let end = offset + data.len() as u64;

        if let Some(final_offset) = self.final_offset {
            if end > final_offset || (fin && end != final_offset) {
                return Err(Error::Quic(QuicError::FinalOffsetError));
            }
        } else if fin {
            if end < self.high_watermark {
                return Err(Error::Quic(QuicError::FinalOffsetError));
            }
            self.final_offset = Some(end);
        }

        if end > self.high_watermark {
            self.high_watermark = end;
        }

        // Trim to the unread region.
        let mut start = offset.max(self.read_offset);
        if start >= end {
            return Ok(());
        }
        let mut data = data.slice((start - offset) as usize..);

        // Skip the tail of a preceding chunk that covers our head.
        if let Some((&s, existing)) = self.chunks.range(..=start).next_back() {
            let e = s + existing.len() as u64;
            if e >= end {
                return Ok(());
            }
            if e > start {
                data = data.slice((e - start) as usize..);
                start = e;
            }
        }

        // Insert around any following chunks, filling only the gaps.
        while !data.is_empty() {
            let cur_end = start + data.len() as u64;
            match self.chunks.range(start..cur_end).next() {
                Some((&s, existing)) => {
                    let e = s + existing.len() as u64;
                    if s > start {
                        self.chunks.insert(start, data.slice(..(s - start) as usize));
                    }
                    if e >= cur_end {
                        break;
                    }
                    data = data.slice((e - start) as usize..);
                    start = e;
                }
                None => {
                    self.chunks.insert(start, data);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Pop the next contiguous chunk, if any.
    pub fn read(&mut self) -> Option<Bytes> {
        let (&start, _) = self.chunks.iter().next()?;
        if start != self.read_offset {
            return None;
        }
        let chunk = self.chunks.remove(&start)?;
        self.read_offset += chunk.len() as u64;
        Some(chunk)
    }

    /// FIN is deliverable: the final offset is known and fully read.
    pub fn fin_ready(&mut self) -> bool {
        if self.fin_delivered {
            return false;
        }
        if self.final_offset == Some(self.read_offset) {
            self.fin_delivered = true;
            true
        } else {
            false
        }
    }

    pub fn is_finished(&self) -> bool {
        self.fin_delivered
    }
}

/// Send-side queue with retransmission support.
///
/// Unsent (and requeued-after-loss) data lives in an offset-keyed map;
/// bytes in flight are tracked only by the loss detector.
#[derive(Debug, Default)]
pub struct SendBuffer {
    unsent: BTreeMap<u64, Bytes>,
    /// Total bytes accepted from the application.
    write_offset: u64,
    /// Cumulative bytes acknowledged.
    acked_bytes: u64,
    fin_offset: Option<u64>,
    fin_sent: bool,
    fin_acked: bool,
}

impl SendBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    pub fn fin_offset(&self) -> Option<u64> {
        self.fin_offset
    }

    /// Queue application data; `fin` marks the end of the stream.
    pub fn write(&mut self, data: Bytes, fin: bool) -> Result<()> {
        if self.fin_offset.is_some() {
            return Err(Error::Quic(QuicError::StreamStateError));
        }
        if !data.is_empty() {
            self.unsent.insert(self.write_offset, data.clone());
            self.write_offset += data.len() as u64;
        }
        if fin {
            self.fin_offset = Some(self.write_offset);
        }
        Ok(())
    }

    /// Whether anything (data or a pending FIN) wants to go out below
    /// `max_offset`.
    pub fn wants_send(&self, max_offset: u64) -> bool {
        if let Some((&start, _)) = self.unsent.iter().next() {
            return start < max_offset;
        }
        self.fin_offset.is_some() && !self.fin_sent
    }

    /// Data queued beyond the permitted offset.
    pub fn is_blocked(&self, max_offset: u64) -> bool {
        match self.unsent.iter().next() {
            Some((&start, _)) => start >= max_offset,
            None => false,
        }
    }

    /// Take the next chunk to send: at most `max_len` bytes, never at or
    /// past `max_offset`. Returns `(offset, data, fin)`.
    pub fn pop_chunk(&mut self, max_len: usize, max_offset: u64) -> Option<(u64, Bytes, bool)> {
        match self.unsent.iter().next().map(|(&s, _)| s) {
            Some(start) if start < max_offset => {
                let data = self.unsent.remove(&start)?;
                let budget = (max_offset - start).min(max_len as u64) as usize;
                let (chunk, rest) = if data.len() > budget {
                    (data.slice(..budget), Some(data.slice(budget..)))
                } else {
                    (data, None)
                };
                if let Some(rest) = rest {
                    self.unsent.insert(start + chunk.len() as u64, rest);
                }
                let end = start + chunk.len() as u64;
                let fin = self.unsent.is_empty() && self.fin_offset == Some(end);
                if fin {
                    self.fin_sent = true;
                }
                Some((start, chunk, fin))
            }
            Some(_) => None,
            None => {
                // Data is flushed but the FIN still needs to travel.
                if let Some(fin_offset) = self.fin_offset {
                    if !self.fin_sent {
                        self.fin_sent = true;
                        return Some((fin_offset, Bytes::new(), true));
                    }
                }
                None
            }
        }
    }

    /// Requeue a lost chunk.
    pub fn on_lost(&mut self, offset: u64, data: Bytes, fin: bool) {
        if !data.is_empty() {
            self.unsent.insert(offset, data);
        }
        if fin {
            self.fin_sent = false;
        }
    }

    /// Account an acknowledged chunk.
    pub fn on_acked(&mut self, len: usize, fin: bool) {
        self.acked_bytes = (self.acked_bytes + len as u64).min(self.write_offset);
        if fin {
            self.fin_acked = true;
        }
    }

    /// Everything written (and the FIN, if any) has been acknowledged.
    pub fn all_acked(&self) -> bool {
        self.acked_bytes == self.write_offset
            && self.unsent.is_empty()
            && (self.fin_offset.is_none() || self.fin_acked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &[u8]) -> Bytes {
        Bytes::copy_from_slice(s)
    }

    #[test]
    fn test_in_order_delivery() {
        let mut buf = RecvBuffer::new();
        buf.insert(0, bytes(b"hello "), false).unwrap();
        buf.insert(6, bytes(b"world"), true).unwrap();

        assert_eq!(buf.read().unwrap(), bytes(b"hello "));
        assert_eq!(buf.read().unwrap(), bytes(b"world"));
        assert!(buf.read().is_none());
        assert!(buf.fin_ready());
        assert!(!buf.fin_ready(), "fin reported once");
    }

    #[test]
    fn test_out_of_order_held_back() {
        let mut buf = RecvBuffer::new();
        buf.insert(6, bytes(b"world"), false).unwrap();
        assert!(buf.read().is_none());
        buf.insert(0, bytes(b"hello "), false).unwrap();
        assert_eq!(buf.read().unwrap(), bytes(b"hello "));
        assert_eq!(buf.read().unwrap(), bytes(b"world"));
    }

    #[test]
    fn test_overlap_discarded() {
        let mut buf = RecvBuffer::new();
        buf.insert(0, bytes(b"abcd"), false).unwrap();
        // Overlaps the first chunk entirely, extends past it.
        buf.insert(2, bytes(b"cdEF"), false).unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = buf.read() {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"abcdEF");
    }

    #[test]
    fn test_overlap_filling_gap_between_chunks() {
        let mut buf = RecvBuffer::new();
        buf.insert(0, bytes(b"ab"), false).unwrap();
        buf.insert(4, bytes(b"ef"), false).unwrap();
        // Covers 1..6, only 2..4 is new.
        buf.insert(1, bytes(b"BCDE_"), false).unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = buf.read() {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"abCDef");
    }

    #[test]
    fn test_duplicate_after_read() {
        let mut buf = RecvBuffer::new();
        buf.insert(0, bytes(b"data"), false).unwrap();
        buf.read().unwrap();
        buf.insert(0, bytes(b"data"), false).unwrap();
        assert!(buf.read().is_none());
        assert_eq!(buf.read_offset(), 4);
    }

    #[test]
    fn test_final_offset_conflicts() {
        let mut buf = RecvBuffer::new();
        buf.insert(0, bytes(b"abcd"), true).unwrap();
        // Different FIN offset.
        assert!(buf.insert(0, bytes(b"ab"), true).is_err());
        // Data beyond the final offset.
        assert!(buf.insert(4, bytes(b"x"), false).is_err());
        // FIN below already-seen data.
        let mut buf = RecvBuffer::new();
        buf.insert(0, bytes(b"abcd"), false).unwrap();
        assert!(buf.insert(0, bytes(b"ab"), true).is_err());
    }

    #[test]
    fn test_fin_requires_all_bytes() {
        let mut buf = RecvBuffer::new();
        buf.insert(4, bytes(b"ef"), true).unwrap();
        assert!(!buf.fin_ready());
        buf.insert(0, bytes(b"abcd"), false).unwrap();
        while buf.read().is_some() {}
        assert!(buf.fin_ready());
    }

    #[test]
    fn test_send_chunking_respects_limits() {
        let mut buf = SendBuffer::new();
        buf.write(bytes(&[0x61; 150]), false).unwrap();

        // Stream window permits only 100 bytes.
        let (offset, chunk, fin) = buf.pop_chunk(1000, 100).unwrap();
        assert_eq!((offset, chunk.len(), fin), (0, 100, false));
        assert!(buf.is_blocked(100));
        assert!(buf.pop_chunk(1000, 100).is_none());

        // Raised window releases the rest.
        let (offset, chunk, fin) = buf.pop_chunk(1000, 300).unwrap();
        assert_eq!((offset, chunk.len(), fin), (100, 50, false));
        assert!(!buf.wants_send(300));
    }

    #[test]
    fn test_send_fin_piggybacks_on_last_chunk() {
        let mut buf = SendBuffer::new();
        buf.write(bytes(b"bye"), true).unwrap();
        let (_, chunk, fin) = buf.pop_chunk(1000, 1000).unwrap();
        assert_eq!(&chunk[..], b"bye");
        assert!(fin);
        assert!(buf.pop_chunk(1000, 1000).is_none());
    }

    #[test]
    fn test_send_bare_fin() {
        let mut buf = SendBuffer::new();
        buf.write(Bytes::new(), true).unwrap();
        let (offset, chunk, fin) = buf.pop_chunk(1000, 1000).unwrap();
        assert_eq!((offset, chunk.len(), fin), (0, 0, true));
    }

    #[test]
    fn test_write_after_fin_rejected() {
        let mut buf = SendBuffer::new();
        buf.write(bytes(b"x"), true).unwrap();
        assert!(buf.write(bytes(b"y"), false).is_err());
    }

    #[test]
    fn test_lost_chunk_requeued_and_acked_tracking() {
        let mut buf = SendBuffer::new();
        buf.write(bytes(b"abcdef"), true).unwrap();
        let (o1, c1, f1) = buf.pop_chunk(3, 1000).unwrap();
        let (o2, c2, f2) = buf.pop_chunk(100, 1000).unwrap();
        assert_eq!((o1, o2), (0, 3));
        assert!(!f1 && f2);

        buf.on_acked(c2.len(), f2);
        assert!(!buf.all_acked());

        buf.on_lost(o1, c1, f1);
        let (o3, c3, _) = buf.pop_chunk(100, 1000).unwrap();
        assert_eq!(o3, 0);
        buf.on_acked(c3.len(), false);
        assert!(buf.all_acked());
    }
}
