//! Long/short header parse and encode.
//!
//! Parsing is split the way the RX pipeline needs it: the beginning of the
//! header (everything before the packet-number field) is readable without
//! keys; the remainder (packet number, reserved bits, key phase) only after
//! header protection has been undone.

use crate::types::{ConnectionId, Epoch, MAX_CID_LEN};
use crate::varint;
use bytes::{BufMut, Bytes};
use thiserror::Error;

/// Form bit: set for long headers.
pub const F_LONG_HDR: u8 = 0x80;
/// Fixed bit: always set in non-VN packets.
pub const F_FIXED: u8 = 0x40;
/// Spin bit (short header only, not covered by header protection).
pub const F_SPIN: u8 = 0x20;
/// Key-phase bit (short header, under header protection).
pub const F_KEY_PHASE: u8 = 0x04;
/// Reserved bits that must be zero after header protection removal.
pub const F_LONG_RESERVED: u8 = 0x0c;
pub const F_SHORT_RESERVED: u8 = 0x18;

/// Long-header packet type bits (byte 0, bits 4-5).
const LT_INITIAL: u8 = 0x0;
const LT_ZERO_RTT: u8 = 0x1;
const LT_HANDSHAKE: u8 = 0x2;
const LT_RETRY: u8 = 0x3;

/// Longest address-validation token we accept before declaring the header
/// hostile.
pub const MAX_TOKEN_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
    VersionNegotiation,
    Short,
}

impl PacketType {
    pub fn is_long(self) -> bool {
        !matches!(self, PacketType::Short)
    }

    /// The epoch whose keys protect this packet; `None` for unprotected
    /// packets (Retry, Version Negotiation).
    pub fn epoch(self) -> Option<Epoch> {
        match self {
            PacketType::Initial => Some(Epoch::Initial),
            PacketType::ZeroRtt => Some(Epoch::ZeroRtt),
            PacketType::Handshake => Some(Epoch::Handshake),
            PacketType::Short => Some(Epoch::Data),
            PacketType::Retry | PacketType::VersionNegotiation => None,
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    #[error("buffer too short")]
    BufferTooShort,
    #[error("connection id exceeds 20 bytes")]
    OversizeCid,
    #[error("token exceeds {MAX_TOKEN_LEN} bytes")]
    OversizeToken,
    #[error("length field inconsistent with datagram")]
    InvalidLength,
}

/// A parsed header. Packet number fields are valid only after
/// [`Header::decode_remainder`] ran on the unprotected bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub packet_type: PacketType,
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: Option<ConnectionId>,
    /// Address-validation token (Initial and Retry only).
    pub token: Bytes,
    /// Original dcid echoed by a Retry.
    pub odcid: Option<ConnectionId>,
    /// Versions listed by a Version Negotiation packet.
    pub supported_versions: Vec<u32>,
    /// Value of the Length field: packet number plus protected payload.
    pub pay_len: usize,
    /// Offset of the packet-number field within the packet.
    pub pn_offset: usize,
    pub pn: u64,
    pub pn_len: usize,
    pub key_phase: bool,
    pub spin: bool,
}

impl Header {
    /// Parse everything readable before header-protection removal.
    ///
    /// `local_cid_len` is the length of CIDs this endpoint issues, needed to
    /// delimit the dcid of short headers.
    pub fn decode_beginning(buf: &[u8], local_cid_len: usize) -> Result<Self, HeaderError> {
        let mut rd = buf;
        let first = take_u8(&mut rd)?;
        if first & F_LONG_HDR == 0 {
            return Self::decode_short_beginning(first, rd, buf.len(), local_cid_len);
        }

        let version = take_u32(&mut rd)?;
        let dcid = take_cid(&mut rd)?;
        let scid = take_cid(&mut rd)?;

        if version == 0 {
            // Version negotiation: remainder is a list of u32 versions.
            let mut supported_versions = Vec::new();
            while rd.len() >= 4 {
                supported_versions.push(take_u32(&mut rd)?);
            }
            return Ok(Header {
                packet_type: PacketType::VersionNegotiation,
                version,
                dcid,
                scid: Some(scid),
                token: Bytes::new(),
                odcid: None,
                supported_versions,
                pay_len: 0,
                pn_offset: 0,
                pn: 0,
                pn_len: 0,
                key_phase: false,
                spin: false,
            });
        }

        let packet_type = match (first >> 4) & 0x3 {
            LT_INITIAL => PacketType::Initial,
            LT_ZERO_RTT => PacketType::ZeroRtt,
            LT_HANDSHAKE => PacketType::Handshake,
            LT_RETRY => PacketType::Retry,
            _ => unreachable!(),
        };

        let mut token = Bytes::new();
        let mut odcid = None;

        match packet_type {
            PacketType::Initial => {
                let token_len =
                    varint::decode(&mut rd).ok_or(HeaderError::BufferTooShort)? as usize;
                if token_len > MAX_TOKEN_LEN {
                    return Err(HeaderError::OversizeToken);
                }
                token = Bytes::copy_from_slice(take(&mut rd, token_len)?);
            }
            PacketType::Retry => {
                // odcid with a one-byte length, then the token to the end.
                odcid = Some(take_cid(&mut rd)?);
                if rd.len() > MAX_TOKEN_LEN {
                    return Err(HeaderError::OversizeToken);
                }
                token = Bytes::copy_from_slice(rd);
                return Ok(Header {
                    packet_type,
                    version,
                    dcid,
                    scid: Some(scid),
                    token,
                    odcid,
                    supported_versions: Vec::new(),
                    pay_len: 0,
                    pn_offset: 0,
                    pn: 0,
                    pn_len: 0,
                    key_phase: false,
                    spin: false,
                });
            }
            _ => {}
        }

        let pay_len = varint::decode(&mut rd).ok_or(HeaderError::BufferTooShort)? as usize;
        let pn_offset = buf.len() - rd.len();
        if pay_len < 4 || pn_offset + pay_len > buf.len() {
            return Err(HeaderError::InvalidLength);
        }

        Ok(Header {
            packet_type,
            version,
            dcid,
            scid: Some(scid),
            token,
            odcid,
            supported_versions: Vec::new(),
            pay_len,
            pn_offset,
            pn: 0,
            pn_len: 0,
            key_phase: false,
            spin: false,
        })
    }

    fn decode_short_beginning(
        first: u8,
        mut rd: &[u8],
        total: usize,
        local_cid_len: usize,
    ) -> Result<Self, HeaderError> {
        let dcid = ConnectionId::from_slice(take(&mut rd, local_cid_len)?)
            .ok_or(HeaderError::OversizeCid)?;
        Ok(Header {
            packet_type: PacketType::Short,
            version: 0,
            dcid,
            scid: None,
            token: Bytes::new(),
            odcid: None,
            supported_versions: Vec::new(),
            pay_len: total - (1 + local_cid_len),
            pn_offset: 1 + local_cid_len,
            pn: 0,
            pn_len: 0,
            key_phase: false,
            spin: first & F_SPIN != 0,
        })
    }

    /// Fill in packet-number length, key phase and spin from the
    /// now-unprotected first byte, and record the truncated packet number.
    /// Reserved bits are validated by the packet coder (fatal on nonzero).
    pub fn decode_remainder(&mut self, first: u8, pn_bytes: &[u8]) {
        self.pn_len = (first & 0x03) as usize + 1;
        if self.packet_type == PacketType::Short {
            self.key_phase = first & F_KEY_PHASE != 0;
        }
        let mut pn = 0u64;
        for &byte in &pn_bytes[..self.pn_len] {
            pn = pn << 8 | u64::from(byte);
        }
        self.pn = pn;
    }

    /// Write the header through the packet-number field.
    ///
    /// Returns `(pn_offset, len_offset)`; `len_offset` locates the 2-byte
    /// Length field of long headers so the coder can patch it once the
    /// payload size is known.
    pub fn write<B: BufMut>(&self, buf: &mut B, base: usize) -> (usize, Option<usize>) {
        debug_assert!(self.pn_len >= 1 && self.pn_len <= 4);
        let mut written = 0usize;

        let mut len_offset = None;
        if self.packet_type.is_long() {
            let type_bits = match self.packet_type {
                PacketType::Initial => LT_INITIAL,
                PacketType::ZeroRtt => LT_ZERO_RTT,
                PacketType::Handshake => LT_HANDSHAKE,
                _ => unreachable!("retry and VN headers are written elsewhere"),
            };
            buf.put_u8(F_LONG_HDR | F_FIXED | type_bits << 4 | (self.pn_len as u8 - 1));
            buf.put_u32(self.version);
            buf.put_u8(self.dcid.len() as u8);
            buf.put_slice(self.dcid.as_bytes());
            let scid = self.scid.as_ref().expect("long header has an scid");
            buf.put_u8(scid.len() as u8);
            buf.put_slice(scid.as_bytes());
            written += 1 + 4 + 1 + self.dcid.len() + 1 + scid.len();
            if self.packet_type == PacketType::Initial {
                varint::encode(self.token.len() as u64, buf);
                buf.put_slice(&self.token);
                written += varint::size(self.token.len() as u64) + self.token.len();
            }
            len_offset = Some(base + written);
            varint::encode_fixed(0, 2, buf); // patched after the payload
            written += 2;
        } else {
            let mut first = F_FIXED | (self.pn_len as u8 - 1);
            if self.spin {
                first |= F_SPIN;
            }
            if self.key_phase {
                first |= F_KEY_PHASE;
            }
            buf.put_u8(first);
            buf.put_slice(self.dcid.as_bytes());
            written += 1 + self.dcid.len();
        }

        let pn_offset = base + written;
        for i in (0..self.pn_len).rev() {
            buf.put_u8((self.pn >> (8 * i)) as u8);
        }
        (pn_offset, len_offset)
    }
}

/// Write a Retry packet: header, echoed odcid, token.
pub fn write_retry<B: BufMut>(
    version: u32,
    dcid: &ConnectionId,
    scid: &ConnectionId,
    odcid: &ConnectionId,
    token: &[u8],
    buf: &mut B,
) {
    buf.put_u8(F_LONG_HDR | F_FIXED | LT_RETRY << 4);
    buf.put_u32(version);
    buf.put_u8(dcid.len() as u8);
    buf.put_slice(dcid.as_bytes());
    buf.put_u8(scid.len() as u8);
    buf.put_slice(scid.as_bytes());
    buf.put_u8(odcid.len() as u8);
    buf.put_slice(odcid.as_bytes());
    buf.put_slice(token);
}

/// Write a Version Negotiation packet listing `versions`.
pub fn write_version_negotiation<B: BufMut>(
    dcid: &ConnectionId,
    scid: &ConnectionId,
    versions: &[u32],
    buf: &mut B,
) {
    // The form bit is all a VN packet promises; the rest of byte 0 is
    // unused, and we leave it zero.
    buf.put_u8(F_LONG_HDR);
    buf.put_u32(0);
    buf.put_u8(dcid.len() as u8);
    buf.put_slice(dcid.as_bytes());
    buf.put_u8(scid.len() as u8);
    buf.put_slice(scid.as_bytes());
    for &version in versions {
        buf.put_u32(version);
    }
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], HeaderError> {
    if buf.len() < n {
        return Err(HeaderError::BufferTooShort);
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, HeaderError> {
    Ok(take(buf, 1)?[0])
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, HeaderError> {
    let bytes = take(buf, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn take_cid(buf: &mut &[u8]) -> Result<ConnectionId, HeaderError> {
    let len = take_u8(buf)? as usize;
    if len > MAX_CID_LEN {
        return Err(HeaderError::OversizeCid);
    }
    ConnectionId::from_slice(take(buf, len)?).ok_or(HeaderError::OversizeCid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn cid(bytes: &[u8]) -> ConnectionId {
        ConnectionId::from_slice(bytes).unwrap()
    }

    #[test]
    fn long_header_round_trip() {
        let hdr = Header {
            packet_type: PacketType::Initial,
            version: 0xff00_0014,
            dcid: cid(&[1, 2, 3, 4, 5, 6, 7, 8]),
            scid: Some(cid(&[9, 9, 9, 9])),
            token: Bytes::from_static(b"tok"),
            odcid: None,
            supported_versions: Vec::new(),
            pay_len: 0,
            pn_offset: 0,
            pn: 0x1234,
            pn_len: 2,
            key_phase: false,
            spin: false,
        };
        let mut buf = BytesMut::new();
        let (pn_offset, len_offset) = hdr.write(&mut buf, 0);
        // Patch the length: pn + a pretend 20-byte payload.
        let pay_len = hdr.pn_len + 20;
        let len_offset = len_offset.unwrap();
        let mut patch = &mut buf[len_offset..len_offset + 2];
        varint::encode_fixed(pay_len as u64, 2, &mut patch);
        buf.extend_from_slice(&[0u8; 20]);

        let parsed = Header::decode_beginning(&buf, 8).unwrap();
        assert_eq!(parsed.packet_type, PacketType::Initial);
        assert_eq!(parsed.version, 0xff00_0014);
        assert_eq!(parsed.dcid, hdr.dcid);
        assert_eq!(parsed.scid, hdr.scid);
        assert_eq!(parsed.token[..], b"tok"[..]);
        assert_eq!(parsed.pn_offset, pn_offset);
        assert_eq!(parsed.pay_len, pay_len);
    }

    #[test]
    fn short_header_round_trip() {
        let hdr = Header {
            packet_type: PacketType::Short,
            version: 0,
            dcid: cid(&[7; 8]),
            scid: None,
            token: Bytes::new(),
            odcid: None,
            supported_versions: Vec::new(),
            pay_len: 0,
            pn_offset: 0,
            pn: 3,
            pn_len: 1,
            key_phase: true,
            spin: true,
        };
        let mut buf = BytesMut::new();
        let (pn_offset, len_offset) = hdr.write(&mut buf, 0);
        assert_eq!(len_offset, None);
        assert_eq!(pn_offset, 1 + 8);
        buf.extend_from_slice(&[0u8; 24]);

        let mut parsed = Header::decode_beginning(&buf, 8).unwrap();
        assert_eq!(parsed.packet_type, PacketType::Short);
        assert_eq!(parsed.dcid, hdr.dcid);
        assert!(parsed.spin);
        parsed.decode_remainder(buf[0], &buf[pn_offset..]);
        assert_eq!(parsed.pn_len, 1);
        assert_eq!(parsed.pn, 3);
        assert!(parsed.key_phase);
    }

    #[test]
    fn version_negotiation_lists_versions() {
        let mut buf = BytesMut::new();
        write_version_negotiation(&cid(&[1; 4]), &cid(&[2; 4]), &[0xff00_0014, 0x0a1a_2a3a], &mut buf);
        let parsed = Header::decode_beginning(&buf, 4).unwrap();
        assert_eq!(parsed.packet_type, PacketType::VersionNegotiation);
        assert_eq!(parsed.supported_versions, vec![0xff00_0014, 0x0a1a_2a3a]);
    }

    #[test]
    fn retry_carries_odcid_and_token() {
        let mut buf = BytesMut::new();
        write_retry(
            0xff00_0014,
            &cid(&[1; 4]),
            &cid(&[2; 8]),
            &cid(&[3; 8]),
            b"retry-token",
            &mut buf,
        );
        let parsed = Header::decode_beginning(&buf, 4).unwrap();
        assert_eq!(parsed.packet_type, PacketType::Retry);
        assert_eq!(parsed.odcid, Some(cid(&[3; 8])));
        assert_eq!(parsed.token[..], b"retry-token"[..]);
    }

    #[test]
    fn oversize_cid_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(F_LONG_HDR | F_FIXED);
        buf.put_u32(1);
        buf.put_u8(21); // dcid length over the cap
        buf.extend_from_slice(&[0u8; 21]);
        assert_eq!(
            Header::decode_beginning(&buf, 8),
            Err(HeaderError::OversizeCid)
        );
    }

    #[test]
    fn length_beyond_datagram_is_rejected() {
        let hdr = Header {
            packet_type: PacketType::Handshake,
            version: 1,
            dcid: cid(&[1; 4]),
            scid: Some(cid(&[2; 4])),
            token: Bytes::new(),
            odcid: None,
            supported_versions: Vec::new(),
            pay_len: 0,
            pn_offset: 0,
            pn: 0,
            pn_len: 1,
            key_phase: false,
            spin: false,
        };
        let mut buf = BytesMut::new();
        let (_, len_offset) = hdr.write(&mut buf, 0);
        let len_offset = len_offset.unwrap();
        let mut patch = &mut buf[len_offset..len_offset + 2];
        varint::encode_fixed(5000, 2, &mut patch); // claims more than present
        buf.extend_from_slice(&[0u8; 30]);
        assert_eq!(
            Header::decode_beginning(&buf, 4),
            Err(HeaderError::InvalidLength)
        );
    }
}
