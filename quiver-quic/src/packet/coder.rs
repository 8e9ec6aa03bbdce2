//! Packet protection: AEAD application and header protection, plus the
//! coalescing rules.
//!
//! A packet is assembled in plaintext first (header through frame payload),
//! then [`protect`] patches the long-header length field, encrypts the
//! payload in place and masks the header. [`unprotect`] is the inverse,
//! driven by the RX pipeline after [`Header::decode_beginning`].

use crate::crypto::{CipherCtx, AEAD_TAG_LEN, SAMPLE_LEN};
use crate::packet::header::{Header, PacketType, F_LONG_HDR, F_LONG_RESERVED, F_SHORT_RESERVED};
use crate::packet::number;
use crate::varint;
use bytes::BytesMut;
use std::ops::Range;

/// The frame payload must start at least 4 bytes of packet number + payload
/// before the sample offset; the packet builder pads to guarantee it.
pub const MIN_PN_AND_PAYLOAD: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnprotectError {
    /// Authentication failed or the packet is too short to sample; drop it
    /// silently (possibly retrying with other keys).
    Drop,
    /// Reserved header bits were set; fatal PROTOCOL_VIOLATION.
    ReservedBitsSet,
}

/// Apply AEAD and header protection to the packet occupying
/// `datagram[pkt_start..]`.
///
/// `pn_offset`/`len_offset` come from [`Header::write`]; the plaintext frame
/// payload must already follow the packet-number field.
pub fn protect(
    datagram: &mut BytesMut,
    pkt_start: usize,
    pn_offset: usize,
    pn_len: usize,
    len_offset: Option<usize>,
    pn: u64,
    ctx: &CipherCtx,
) -> crate::error::Result<()> {
    let payload_start = pn_offset + pn_len;
    debug_assert!(payload_start + (MIN_PN_AND_PAYLOAD - pn_len) <= datagram.len());

    // Patch the long-header length: packet number + payload + tag.
    if let Some(len_offset) = len_offset {
        let pay_len = pn_len + (datagram.len() - payload_start) + AEAD_TAG_LEN;
        let mut field = &mut datagram[len_offset..len_offset + 2];
        varint::encode_fixed(pay_len as u64, 2, &mut field);
    }

    // AEAD over the payload with the final header as associated data.
    let mut payload = datagram.split_off(payload_start).to_vec();
    ctx.seal(pn, &datagram[pkt_start..], &mut payload)?;
    datagram.extend_from_slice(&payload);

    // Header protection: sample 16 bytes of ciphertext 4 bytes past the
    // start of the packet-number field.
    let sample_offset = pn_offset + 4;
    let mut sample = [0u8; SAMPLE_LEN];
    sample.copy_from_slice(&datagram[sample_offset..sample_offset + SAMPLE_LEN]);
    let mask = ctx.hp_mask(&sample)?;

    let first = &mut datagram[pkt_start];
    if *first & F_LONG_HDR != 0 {
        *first ^= mask[0] & 0x0f;
    } else {
        *first ^= mask[0] & 0x1f;
    }
    for i in 0..pn_len {
        datagram[pn_offset + i] ^= mask[1 + i];
    }
    Ok(())
}

/// Undo header protection and AEAD on `packet` (one decoalesced packet,
/// starting at its first byte). On success the header's packet-number
/// fields are filled in and the plaintext payload occupies the returned
/// range of `packet`.
///
/// `lg_rxed` is the largest packet number already decrypted in the packet's
/// space, for packet-number recovery.
pub fn unprotect(
    packet: &mut [u8],
    hdr: &mut Header,
    ctx: &CipherCtx,
    lg_rxed: Option<u64>,
) -> Result<Range<usize>, UnprotectError> {
    let sample_offset = hdr.pn_offset + 4;
    if sample_offset + SAMPLE_LEN > packet.len() {
        return Err(UnprotectError::Drop);
    }
    let mut sample = [0u8; SAMPLE_LEN];
    sample.copy_from_slice(&packet[sample_offset..sample_offset + SAMPLE_LEN]);
    let mask = ctx.hp_mask(&sample).map_err(|_| UnprotectError::Drop)?;

    let is_long = packet[0] & F_LONG_HDR != 0;
    let masked_first = packet[0];
    let first = masked_first ^ (mask[0] & if is_long { 0x0f } else { 0x1f });
    let pn_len = (first & 0x03) as usize + 1;
    if hdr.pn_offset + pn_len > packet.len() {
        return Err(UnprotectError::Drop);
    }

    let mut pn_bytes = [0u8; 4];
    for i in 0..pn_len {
        pn_bytes[i] = packet[hdr.pn_offset + i] ^ mask[1 + i];
    }
    hdr.decode_remainder(first, &pn_bytes);
    let pn = number::decode(hdr.pn, pn_len, lg_rxed);

    let payload_start = hdr.pn_offset + pn_len;
    let payload_end = hdr.pn_offset + hdr.pay_len;
    if payload_end > packet.len() || payload_start + AEAD_TAG_LEN > payload_end {
        return Err(UnprotectError::Drop);
    }

    // Commit the unmasked bytes so the AEAD sees the true header.
    packet[0] = first;
    for i in 0..pn_len {
        packet[hdr.pn_offset + i] = pn_bytes[i];
    }

    let (header_bytes, rest) = packet.split_at_mut(payload_start);
    let ciphertext = &mut rest[..payload_end - payload_start];
    let plain_len = match ctx.open(pn, header_bytes, ciphertext) {
        Some(len) => len,
        None => {
            // Restore the masked form so another key (phase or epoch) can
            // retry cleanly.
            packet[0] = masked_first;
            for i in 0..pn_len {
                packet[hdr.pn_offset + i] ^= mask[1 + i];
            }
            return Err(UnprotectError::Drop);
        }
    };

    // Only a successfully authenticated packet may fault the connection.
    let reserved = if is_long { F_LONG_RESERVED } else { F_SHORT_RESERVED };
    if first & reserved != 0 {
        return Err(UnprotectError::ReservedBitsSet);
    }

    hdr.pn = pn;
    Ok(payload_start..payload_start + plain_len)
}

/// Total on-wire length of a parsed long-header packet, for decoalescing.
pub fn coalesced_len(hdr: &Header) -> usize {
    hdr.pn_offset + hdr.pay_len
}

/// Whether a packet of type `next` may follow one of type `prev` in the
/// same datagram.
pub fn can_coalesce(prev: PacketType, next: PacketType) -> bool {
    matches!(
        (prev, next),
        (PacketType::Initial, PacketType::ZeroRtt)
            | (PacketType::Initial, PacketType::Handshake)
            | (PacketType::Handshake, PacketType::Short)
            | (PacketType::ZeroRtt, PacketType::Handshake)
    )
}
