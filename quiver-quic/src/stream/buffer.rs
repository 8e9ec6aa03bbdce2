//! Stream data buffers: ordered inbound reassembly and the outbound
//! queue with retransmission tracking.

use crate::error::{Result, TransportError};
use crate::ranges::RangeSet;
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

/// Inbound side: in-order queue plus an out-of-order set keyed by offset.
///
/// Delivered offsets are contiguous from 0 up to `in_data_off`; every entry
/// in the out-of-order set starts at or beyond it, and entries never
/// overlap.
#[derive(Debug, Default)]
pub struct RecvBuffer {
    /// In-order data awaiting application reads.
    queue: VecDeque<Bytes>,
    /// Bytes currently queued (for the delivered-bytes invariant).
    queued_bytes: usize,
    /// Next expected offset; everything below it has been delivered.
    in_data_off: u64,
    /// Out-of-order chunks by stream offset.
    ooo: BTreeMap<u64, Bytes>,
    /// Stream length fixed by FIN, once seen.
    fin_off: Option<u64>,
    /// FIN handed to the application.
    fin_delivered: bool,
}

impl RecvBuffer {
    /// Next expected in-order offset.
    pub fn in_data_off(&self) -> u64 {
        self.in_data_off
    }

    /// Largest offset this buffer knows about (for connection-level flow
    /// accounting).
    pub fn max_seen_off(&self) -> u64 {
        let ooo_end = self
            .ooo
            .iter()
            .next_back()
            .map_or(0, |(&off, data)| off + data.len() as u64);
        self.in_data_off.max(ooo_end).max(self.fin_off.unwrap_or(0))
    }

    pub fn fin_off(&self) -> Option<u64> {
        self.fin_off
    }

    /// Accept one STREAM/CRYPTO frame's payload.
    ///
    /// Exact duplicates and fully-behind data are dropped; partial overlaps
    /// are dropped too (ranges are never copy-merged). Returns the number
    /// of newly buffered bytes.
    pub fn insert(&mut self, offset: u64, data: Bytes, fin: bool) -> Result<usize> {
        let end = offset + data.len() as u64;

        if fin {
            match self.fin_off {
                Some(fin_off) if fin_off != end => {
                    return Err(TransportError::StreamState);
                }
                _ => self.fin_off = Some(end),
            }
        } else if self.fin_off.is_some_and(|fin_off| end > fin_off) {
            return Err(TransportError::StreamState);
        }

        if data.is_empty() {
            // An empty frame without FIN carries nothing; accepted quietly.
            if !fin {
                warn!(offset, "empty stream frame without FIN");
            }
            return Ok(0);
        }

        if end <= self.in_data_off {
            debug!(offset, len = data.len(), "fully duplicated stream data");
            return Ok(0);
        }
        if offset < self.in_data_off {
            debug!(offset, in_data_off = self.in_data_off, "overlapping stream data dropped");
            return Ok(0);
        }

        // Reject overlap against out-of-order neighbors.
        if let Some((&prev_off, prev)) = self.ooo.range(..=offset).next_back() {
            if prev_off + prev.len() as u64 > offset {
                debug!(offset, "stream data overlaps prior out-of-order entry");
                return Ok(0);
            }
        }
        if let Some((&next_off, _)) = self.ooo.range(offset..).next() {
            if end > next_off {
                debug!(offset, "stream data overlaps later out-of-order entry");
                return Ok(0);
            }
        }

        let accepted = data.len();
        if offset == self.in_data_off {
            self.push_in_order(data);
            // Splice any now-contiguous out-of-order entries.
            while let Some(entry) = self.ooo.remove(&self.in_data_off) {
                self.push_in_order(entry);
            }
            // Entries strictly behind the new delivery edge are stale.
            let stale: Vec<u64> = self
                .ooo
                .range(..self.in_data_off)
                .map(|(&off, _)| off)
                .collect();
            for off in stale {
                self.ooo.remove(&off);
            }
        } else {
            self.ooo.insert(offset, data);
        }
        Ok(accepted)
    }

    fn push_in_order(&mut self, data: Bytes) {
        self.in_data_off += data.len() as u64;
        self.queued_bytes += data.len();
        self.queue.push_back(data);
    }

    /// Read up to `max_len` contiguous bytes.
    pub fn read(&mut self, max_len: usize) -> Option<Bytes> {
        let chunk = self.queue.pop_front()?;
        if chunk.len() <= max_len {
            self.queued_bytes -= chunk.len();
            return Some(chunk);
        }
        let head = chunk.slice(..max_len);
        self.queue.push_front(chunk.slice(max_len..));
        self.queued_bytes -= max_len;
        Some(head)
    }

    /// Bytes queued for the application.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Whether the FIN is now observable: all bytes up to the final size
    /// delivered and read.
    pub fn fin_reached(&mut self) -> bool {
        if self.fin_delivered {
            return false;
        }
        if self.queue.is_empty() && self.fin_off == Some(self.in_data_off) {
            self.fin_delivered = true;
            return true;
        }
        false
    }

    pub fn is_finished(&self) -> bool {
        self.fin_delivered
    }
}

/// Outbound side: enqueued chunks awaiting transmission or acknowledgement,
/// plus the retransmission set.
#[derive(Debug, Default)]
pub struct SendBuffer {
    /// Enqueued data by offset; contiguous, trimmed as acks land.
    chunks: BTreeMap<u64, Bytes>,
    /// Offset where the next app write lands.
    append_off: u64,
    /// Next fresh offset to transmit.
    out_data: u64,
    /// Acknowledged ranges.
    acked: RangeSet,
    /// Ranges declared lost, awaiting retransmission.
    rtx: RangeSet,
    fin: bool,
    fin_sent: bool,
    fin_acked: bool,
}

impl SendBuffer {
    /// Next offset a fresh transmission would use.
    pub fn out_data(&self) -> u64 {
        self.out_data
    }

    /// Total bytes enqueued by the application.
    pub fn append_off(&self) -> u64 {
        self.append_off
    }

    /// First offset not yet fully acknowledged.
    pub fn out_una(&self) -> u64 {
        if self.acked.min() == Some(0) {
            self.acked.next_gap(0)
        } else {
            0
        }
    }

    /// Queue application data; `fin` closes the stream for writing.
    pub fn write(&mut self, data: Bytes, fin: bool) {
        debug_assert!(!self.fin, "write after fin");
        if !data.is_empty() {
            self.chunks.insert(self.append_off, data.clone());
            self.append_off += data.len() as u64;
        }
        if fin {
            self.fin = true;
        }
    }

    /// Whether anything (data, retransmission or a bare FIN) wants TX.
    pub fn has_pending(&self) -> bool {
        !self.rtx.is_empty() || self.out_data < self.append_off || self.pending_fin()
    }

    /// Whether lost ranges await retransmission.
    pub fn has_rtx(&self) -> bool {
        !self.rtx.is_empty()
    }

    fn pending_fin(&self) -> bool {
        // A FIN rides on the last data frame, or alone once everything has
        // been sent at least once.
        self.fin && !self.fin_sent && !self.fin_acked && self.out_data >= self.append_off
    }

    /// Pick the next range to transmit, retransmissions first.
    ///
    /// Returns `(offset, data, fin)` bounded by `max_len`; the cursor and
    /// retransmission set advance accordingly.
    pub fn next_chunk(&mut self, max_len: usize) -> Option<(u64, Bytes, bool)> {
        if max_len == 0 {
            return None;
        }
        // Retransmissions first.
        while let Some(start) = self.rtx.min() {
            let start = self.acked.next_gap(start);
            let range_end = self
                .rtx
                .iter()
                .find(|&(s, e)| s <= start && start <= e)
                .map(|(_, e)| e);
            let Some(range_end) = range_end else {
                // The head of the rtx set was fully acked in the meantime.
                let head_end = self.rtx.iter().next().map(|(_, e)| e).unwrap();
                self.rtx.remove_range(self.rtx.min().unwrap()..=head_end);
                continue;
            };
            let data = self.slice(start, range_end - start + 1, max_len)?;
            let end = start + data.len() as u64 - 1;
            self.rtx.remove_range(start..=end);
            let fin = self.fin && end + 1 == self.append_off;
            self.fin_sent |= fin;
            return Some((start, data, fin));
        }

        // Fresh data.
        if self.out_data < self.append_off {
            let data = self.slice(self.out_data, self.append_off - self.out_data, max_len)?;
            let start = self.out_data;
            self.out_data += data.len() as u64;
            let fin = self.fin && self.out_data == self.append_off;
            self.fin_sent |= fin;
            return Some((start, data, fin));
        }

        if self.pending_fin() {
            self.fin_sent = true;
            return Some((self.append_off, Bytes::new(), true));
        }
        None
    }

    /// A contiguous slice starting at `offset`, bounded by `want` and
    /// `max_len` and the containing chunk's end.
    fn slice(&self, offset: u64, want: u64, max_len: usize) -> Option<Bytes> {
        let (&chunk_off, chunk) = self.chunks.range(..=offset).next_back()?;
        let chunk_end = chunk_off + chunk.len() as u64;
        if offset >= chunk_end {
            return None;
        }
        let begin = (offset - chunk_off) as usize;
        let len = (chunk_end - offset).min(want).min(max_len as u64) as usize;
        Some(chunk.slice(begin..begin + len))
    }

    /// Acknowledge a transmitted range.
    pub fn on_acked(&mut self, offset: u64, len: usize, fin: bool) {
        if len > 0 {
            self.acked.insert_range(offset..=offset + len as u64 - 1);
            self.rtx.remove_range(offset..=offset + len as u64 - 1);
        }
        if fin {
            self.fin_acked = true;
        }
        // Trim chunks that are fully acknowledged from the front.
        let una = self.out_una();
        let done: Vec<u64> = self
            .chunks
            .range(..una)
            .filter(|(&off, data)| off + data.len() as u64 <= una)
            .map(|(&off, _)| off)
            .collect();
        for off in done {
            self.chunks.remove(&off);
        }
    }

    /// A transmitted range was declared lost; schedule retransmission of
    /// whatever in it is still unacked.
    pub fn on_lost(&mut self, offset: u64, len: usize, fin: bool) {
        if len > 0 {
            self.rtx.insert_range(offset..=offset + len as u64 - 1);
            for (start, end) in self.acked.iter().collect::<Vec<_>>() {
                self.rtx.remove_range(start..=end);
            }
        }
        if fin && !self.fin_acked {
            // The FIN rides again with the retransmission (or alone).
            self.fin_sent = false;
        }
    }

    pub fn fin_sent_and_acked(&self) -> bool {
        self.fin && self.fin_acked
    }

    pub fn is_fin(&self) -> bool {
        self.fin
    }

    /// Everything enqueued has been transmitted at least once.
    pub fn fully_sent(&self) -> bool {
        self.out_data >= self.append_off && self.rtx.is_empty()
    }
}
