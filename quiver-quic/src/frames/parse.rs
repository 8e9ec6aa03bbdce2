//! Frame decoding.
//!
//! All parsing borrows from the decrypted payload; malformed frames are
//! fatal `FRAME_ENCODING` errors at the connection level.

use crate::error::{Result, TransportError};
use crate::frames::types::*;
use crate::types::{ConnectionId, StreamId, SRT_LEN};
use crate::varint;
use tinyvec::TinyVec;

/// Decodes the frames of one packet payload in order.
pub struct FrameParser<'a> {
    buf: &'a [u8],
    consumed: usize,
}

impl<'a> FrameParser<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            buf: payload,
            consumed: 0,
        }
    }

    /// Offset of the next frame within the payload.
    pub fn offset(&self) -> usize {
        self.consumed
    }

    /// Parse the next frame, or `None` at the end of the payload.
    pub fn next_frame(&mut self) -> Result<Option<Frame<'a>>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let before = self.buf.len();
        let frame = parse_one(&mut self.buf)?;
        self.consumed += before - self.buf.len();
        Ok(Some(frame))
    }
}

fn err<T>() -> Result<T> {
    Err(TransportError::FrameEncoding)
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if buf.len() < n {
        return err();
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn take_u8(buf: &mut &[u8]) -> Result<u8> {
    Ok(take(buf, 1)?[0])
}

fn take_varint(buf: &mut &[u8]) -> Result<u64> {
    varint::decode(buf).ok_or(TransportError::FrameEncoding)
}

fn take_stream_id(buf: &mut &[u8]) -> Result<StreamId> {
    Ok(StreamId(take_varint(buf)? as i64))
}

fn parse_one<'a>(buf: &mut &'a [u8]) -> Result<Frame<'a>> {
    let type_byte = take_u8(buf)?;
    let frame = match type_byte {
        FRAM_TYPE_PAD => {
            // Collapse the whole run; padding is never interesting alone.
            let mut len = 1;
            while let [FRAM_TYPE_PAD, rest @ ..] = *buf {
                *buf = rest;
                len += 1;
            }
            Frame::Padding { len }
        }
        FRAM_TYPE_PING => Frame::Ping,
        FRAM_TYPE_ACK | FRAM_TYPE_ACK_ECN => {
            let largest_acked = take_varint(buf)?;
            let ack_delay = take_varint(buf)?;
            let block_count = take_varint(buf)?;
            let first_range = take_varint(buf)?;
            if first_range > largest_acked {
                return err();
            }
            let mut blocks = TinyVec::new();
            for _ in 0..block_count {
                let gap = take_varint(buf)?;
                let length = take_varint(buf)?;
                blocks.push(AckBlock { gap, length });
            }
            let ecn = if type_byte == FRAM_TYPE_ACK_ECN {
                Some(EcnCounts {
                    ect0: take_varint(buf)?,
                    ect1: take_varint(buf)?,
                    ce: take_varint(buf)?,
                })
            } else {
                None
            };
            let ack = AckFrame {
                largest_acked,
                ack_delay,
                first_range,
                blocks,
                ecn,
            };
            if ack.ranges().any(|r| r.is_none()) {
                return err();
            }
            Frame::Ack(ack)
        }
        FRAM_TYPE_RST_STRM => Frame::ResetStream(ResetStreamFrame {
            stream_id: take_stream_id(buf)?,
            error_code: take_varint(buf)?,
            final_size: take_varint(buf)?,
        }),
        FRAM_TYPE_STOP_SEND => Frame::StopSending(StopSendingFrame {
            stream_id: take_stream_id(buf)?,
            error_code: take_varint(buf)?,
        }),
        FRAM_TYPE_CRPT => {
            let offset = take_varint(buf)?;
            let len = take_varint(buf)?;
            let data = take(buf, len as usize)?;
            Frame::Crypto(CryptoFrame { offset, data })
        }
        FRAM_TYPE_NEW_TOK => {
            let len = take_varint(buf)?;
            if len == 0 {
                return err();
            }
            Frame::NewToken {
                token: take(buf, len as usize)?,
            }
        }
        t if t & !0x07 == FRAM_TYPE_STRM => {
            let stream_id = take_stream_id(buf)?;
            let offset = if t & F_STREAM_OFF != 0 {
                take_varint(buf)?
            } else {
                0
            };
            let explicit_len = t & F_STREAM_LEN != 0;
            let data = if explicit_len {
                let len = take_varint(buf)?;
                take(buf, len as usize)?
            } else {
                std::mem::take(buf)
            };
            if offset + data.len() as u64 > varint::VARINT_MAX {
                return err();
            }
            Frame::Stream(StreamFrame {
                stream_id,
                offset,
                fin: t & F_STREAM_FIN != 0,
                explicit_len,
                data,
            })
        }
        FRAM_TYPE_MAX_DATA => Frame::MaxData {
            max: take_varint(buf)?,
        },
        FRAM_TYPE_MAX_STRM_DATA => Frame::MaxStreamData {
            stream_id: take_stream_id(buf)?,
            max: take_varint(buf)?,
        },
        FRAM_TYPE_MAX_SID_BIDI | FRAM_TYPE_MAX_SID_UNI => Frame::MaxStreams {
            bidi: type_byte == FRAM_TYPE_MAX_SID_BIDI,
            max: take_varint(buf)?,
        },
        FRAM_TYPE_DATA_BLCK => Frame::DataBlocked {
            limit: take_varint(buf)?,
        },
        FRAM_TYPE_STRM_DATA_BLCK => Frame::StreamDataBlocked {
            stream_id: take_stream_id(buf)?,
            limit: take_varint(buf)?,
        },
        FRAM_TYPE_SID_BLCK_BIDI | FRAM_TYPE_SID_BLCK_UNI => Frame::StreamsBlocked {
            bidi: type_byte == FRAM_TYPE_SID_BLCK_BIDI,
            limit: take_varint(buf)?,
        },
        FRAM_TYPE_NEW_CID => {
            let seq = take_varint(buf)?;
            let retire_prior_to = take_varint(buf)?;
            if retire_prior_to > seq {
                return err();
            }
            let cid_len = take_u8(buf)? as usize;
            if cid_len < 1 || cid_len > crate::types::MAX_CID_LEN {
                return err();
            }
            let cid = ConnectionId::from_slice(take(buf, cid_len)?).ok_or(
                TransportError::FrameEncoding,
            )?;
            let mut srt = [0u8; SRT_LEN];
            srt.copy_from_slice(take(buf, SRT_LEN)?);
            Frame::NewConnectionId(NewConnectionIdFrame {
                seq,
                retire_prior_to,
                cid,
                srt,
            })
        }
        FRAM_TYPE_RTIR_CID => Frame::RetireConnectionId {
            seq: take_varint(buf)?,
        },
        FRAM_TYPE_PATH_CHLG | FRAM_TYPE_PATH_RESP => {
            let mut data = [0u8; 8];
            data.copy_from_slice(take(buf, 8)?);
            if type_byte == FRAM_TYPE_PATH_CHLG {
                Frame::PathChallenge { data }
            } else {
                Frame::PathResponse { data }
            }
        }
        FRAM_TYPE_CNCL_QUIC | FRAM_TYPE_CNCL_APP => {
            let application = type_byte == FRAM_TYPE_CNCL_APP;
            let error_code = take_varint(buf)?;
            let frame_type = if application {
                None
            } else {
                Some(take_varint(buf)?)
            };
            let reason_len = take_varint(buf)?;
            let reason = take(buf, reason_len as usize)?;
            Frame::ConnectionClose(ConnectionCloseFrame {
                application,
                error_code,
                frame_type,
                reason,
            })
        }
        _ => return err(),
    };
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::encode;
    use bytes::BytesMut;

    fn parse_all(payload: &[u8]) -> Result<Vec<Frame<'_>>> {
        let mut parser = FrameParser::new(payload);
        let mut out = Vec::new();
        while let Some(frame) = parser.next_frame()? {
            out.push(frame);
        }
        Ok(out)
    }

    #[test]
    fn padding_run_collapses() {
        let frames = parse_all(&[0, 0, 0, 0, 1]).unwrap();
        assert_eq!(frames, vec![Frame::Padding { len: 4 }, Frame::Ping]);
    }

    #[test]
    fn truncated_frames_are_encoding_errors() {
        // CRYPTO claiming more data than present
        let mut buf = BytesMut::new();
        encode::crypto_header(0, 100, &mut buf);
        buf.extend_from_slice(&[0u8; 10]);
        assert_eq!(parse_all(&buf), Err(TransportError::FrameEncoding));
        // Unknown frame type
        assert_eq!(parse_all(&[0x2f]), Err(TransportError::FrameEncoding));
    }

    #[test]
    fn stream_without_len_runs_to_payload_end() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[FRAM_TYPE_STRM | F_STREAM_OFF]);
        crate::varint::encode(4, &mut buf); // stream id
        crate::varint::encode(32, &mut buf); // offset
        buf.extend_from_slice(b"tail data");
        let frames = parse_all(&buf).unwrap();
        match &frames[0] {
            Frame::Stream(s) => {
                assert_eq!(s.stream_id, StreamId(4));
                assert_eq!(s.offset, 32);
                assert!(!s.explicit_len);
                assert_eq!(s.data, b"tail data");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn ack_with_bogus_first_range_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[FRAM_TYPE_ACK]);
        crate::varint::encode(3, &mut buf); // largest
        crate::varint::encode(0, &mut buf); // delay
        crate::varint::encode(0, &mut buf); // block count
        crate::varint::encode(9, &mut buf); // first range > largest
        assert_eq!(parse_all(&buf), Err(TransportError::FrameEncoding));
    }

    #[test]
    fn new_connection_id_round_trip() {
        let frame = NewConnectionIdFrame {
            seq: 7,
            retire_prior_to: 2,
            cid: ConnectionId::from_slice(&[9, 8, 7, 6, 5]).unwrap(),
            srt: [0xaa; SRT_LEN],
        };
        let mut buf = BytesMut::new();
        encode::new_connection_id(&frame, &mut buf);
        let frames = parse_all(&buf).unwrap();
        assert_eq!(frames, vec![Frame::NewConnectionId(frame)]);
    }

    #[test]
    fn connection_close_variants_round_trip() {
        let mut buf = BytesMut::new();
        encode::connection_close(
            TransportError::ProtocolViolation.to_wire(),
            Some(0x06),
            b"bad crypto",
            false,
            &mut buf,
        );
        encode::connection_close(42, None, b"", true, &mut buf);
        let frames = parse_all(&buf).unwrap();
        assert_eq!(
            frames[0],
            Frame::ConnectionClose(ConnectionCloseFrame {
                application: false,
                error_code: 0xa,
                frame_type: Some(0x06),
                reason: b"bad crypto",
            })
        );
        assert_eq!(
            frames[1],
            Frame::ConnectionClose(ConnectionCloseFrame {
                application: true,
                error_code: 42,
                frame_type: None,
                reason: b"",
            })
        );
    }
}
