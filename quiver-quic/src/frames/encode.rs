//! Frame encoding. Writers append to a `BufMut`; the packet coder budgets
//! space before calling them.

use crate::frames::types::*;
use crate::ranges::RangeSet;
use crate::types::StreamId;
use crate::varint;
use bytes::BufMut;

pub fn padding<B: BufMut>(len: usize, buf: &mut B) {
    buf.put_bytes(FRAM_TYPE_PAD, len);
}

pub fn ping<B: BufMut>(buf: &mut B) {
    buf.put_u8(FRAM_TYPE_PING);
}

/// Write an ACK frame enumerating `recv` in descending order.
///
/// `recv` must be non-empty; `ack_delay` is the raw (already scaled) wire
/// value.
pub fn ack<B: BufMut>(recv: &RangeSet, ack_delay: u64, ecn: Option<EcnCounts>, buf: &mut B) {
    debug_assert!(!recv.is_empty());
    buf.put_u8(if ecn.is_some() {
        FRAM_TYPE_ACK_ECN
    } else {
        FRAM_TYPE_ACK
    });

    let mut ranges = recv.iter_descending();
    let (first_start, first_end) = ranges.next().expect("non-empty recv set");
    varint::encode(first_end, buf);
    varint::encode(ack_delay, buf);
    varint::encode(recv.range_count() as u64 - 1, buf);
    varint::encode(first_end - first_start, buf);

    let mut prev_start = first_start;
    for (start, end) in ranges {
        varint::encode(prev_start - end - 2, buf); // gap
        varint::encode(end - start, buf); // length
        prev_start = start;
    }

    if let Some(counts) = ecn {
        varint::encode(counts.ect0, buf);
        varint::encode(counts.ect1, buf);
        varint::encode(counts.ce, buf);
    }
}

/// Worst-case encoded size of an ACK over `recv`, for TX budgeting.
pub fn ack_size(recv: &RangeSet, ack_delay: u64, ecn: bool) -> usize {
    let Some(largest) = recv.max() else { return 0 };
    let mut size = 1 + varint::size(largest) + varint::size(ack_delay)
        + varint::size(recv.range_count() as u64 - 1);
    let mut prev_start = None;
    for (start, end) in recv.iter_descending() {
        match prev_start {
            None => size += varint::size(end - start),
            Some(prev) => {
                size += varint::size(prev - end - 2) + varint::size(end - start);
            }
        }
        prev_start = Some(start);
    }
    if ecn {
        size += 3 * 8;
    }
    size
}

pub fn reset_stream<B: BufMut>(frame: &ResetStreamFrame, buf: &mut B) {
    buf.put_u8(FRAM_TYPE_RST_STRM);
    varint::encode(frame.stream_id.as_u64(), buf);
    varint::encode(frame.error_code, buf);
    varint::encode(frame.final_size, buf);
}

pub fn stop_sending<B: BufMut>(frame: &StopSendingFrame, buf: &mut B) {
    buf.put_u8(FRAM_TYPE_STOP_SEND);
    varint::encode(frame.stream_id.as_u64(), buf);
    varint::encode(frame.error_code, buf);
}

/// CRYPTO frame header; the caller appends `len` bytes of data.
pub fn crypto_header<B: BufMut>(offset: u64, len: usize, buf: &mut B) {
    buf.put_u8(FRAM_TYPE_CRPT);
    varint::encode(offset, buf);
    varint::encode(len as u64, buf);
}

pub fn crypto<B: BufMut>(offset: u64, data: &[u8], buf: &mut B) {
    crypto_header(offset, data.len(), buf);
    buf.put_slice(data);
}

pub fn new_token<B: BufMut>(token: &[u8], buf: &mut B) {
    buf.put_u8(FRAM_TYPE_NEW_TOK);
    varint::encode(token.len() as u64, buf);
    buf.put_slice(token);
}

/// STREAM frame header with an explicit length field; the caller appends
/// `len` bytes of data. OFF is set only for non-zero offsets.
pub fn stream_header<B: BufMut>(id: StreamId, offset: u64, len: usize, fin: bool, buf: &mut B) {
    let mut type_byte = FRAM_TYPE_STRM | F_STREAM_LEN;
    if offset > 0 {
        type_byte |= F_STREAM_OFF;
    }
    if fin {
        type_byte |= F_STREAM_FIN;
    }
    buf.put_u8(type_byte);
    varint::encode(id.as_u64(), buf);
    if offset > 0 {
        varint::encode(offset, buf);
    }
    varint::encode(len as u64, buf);
}

/// Size of the header [`stream_header`] would write.
pub fn stream_header_size(id: StreamId, offset: u64, len: usize) -> usize {
    let mut size = 1 + varint::size(id.as_u64()) + varint::size(len as u64);
    if offset > 0 {
        size += varint::size(offset);
    }
    size
}

pub fn stream<B: BufMut>(id: StreamId, offset: u64, data: &[u8], fin: bool, buf: &mut B) {
    stream_header(id, offset, data.len(), fin, buf);
    buf.put_slice(data);
}

pub fn max_data<B: BufMut>(max: u64, buf: &mut B) {
    buf.put_u8(FRAM_TYPE_MAX_DATA);
    varint::encode(max, buf);
}

pub fn max_stream_data<B: BufMut>(id: StreamId, max: u64, buf: &mut B) {
    buf.put_u8(FRAM_TYPE_MAX_STRM_DATA);
    varint::encode(id.as_u64(), buf);
    varint::encode(max, buf);
}

pub fn max_streams<B: BufMut>(bidi: bool, max: u64, buf: &mut B) {
    buf.put_u8(if bidi {
        FRAM_TYPE_MAX_SID_BIDI
    } else {
        FRAM_TYPE_MAX_SID_UNI
    });
    varint::encode(max, buf);
}

pub fn data_blocked<B: BufMut>(limit: u64, buf: &mut B) {
    buf.put_u8(FRAM_TYPE_DATA_BLCK);
    varint::encode(limit, buf);
}

pub fn stream_data_blocked<B: BufMut>(id: StreamId, limit: u64, buf: &mut B) {
    buf.put_u8(FRAM_TYPE_STRM_DATA_BLCK);
    varint::encode(id.as_u64(), buf);
    varint::encode(limit, buf);
}

pub fn streams_blocked<B: BufMut>(bidi: bool, limit: u64, buf: &mut B) {
    buf.put_u8(if bidi {
        FRAM_TYPE_SID_BLCK_BIDI
    } else {
        FRAM_TYPE_SID_BLCK_UNI
    });
    varint::encode(limit, buf);
}

pub fn new_connection_id<B: BufMut>(frame: &NewConnectionIdFrame, buf: &mut B) {
    buf.put_u8(FRAM_TYPE_NEW_CID);
    varint::encode(frame.seq, buf);
    varint::encode(frame.retire_prior_to, buf);
    buf.put_u8(frame.cid.len() as u8);
    buf.put_slice(frame.cid.as_bytes());
    buf.put_slice(&frame.srt);
}

pub fn retire_connection_id<B: BufMut>(seq: u64, buf: &mut B) {
    buf.put_u8(FRAM_TYPE_RTIR_CID);
    varint::encode(seq, buf);
}

pub fn path_challenge<B: BufMut>(data: &[u8; 8], buf: &mut B) {
    buf.put_u8(FRAM_TYPE_PATH_CHLG);
    buf.put_slice(data);
}

pub fn path_response<B: BufMut>(data: &[u8; 8], buf: &mut B) {
    buf.put_u8(FRAM_TYPE_PATH_RESP);
    buf.put_slice(data);
}

pub fn connection_close<B: BufMut>(
    error_code: u64,
    frame_type: Option<u64>,
    reason: &[u8],
    application: bool,
    buf: &mut B,
) {
    buf.put_u8(if application {
        FRAM_TYPE_CNCL_APP
    } else {
        FRAM_TYPE_CNCL_QUIC
    });
    varint::encode(error_code, buf);
    if !application {
        varint::encode(frame_type.unwrap_or(0), buf);
    }
    varint::encode(reason.len() as u64, buf);
    buf.put_slice(reason);
}
