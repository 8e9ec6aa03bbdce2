//! Transport parameters, carried in a TLS extension during the handshake.
//!
//! Encoding is a sequence of `type (varint) || length (varint) || value`
//! entries. Duplicates of a known type are fatal; unknown types are
//! skipped. One grease entry with a `0xff00 | r` type and random payload is
//! emitted on every encode.

use crate::error::{Result, TransportError};
use crate::types::{ConnectionId, Side, MAX_CID_LEN, SRT_LEN};
use crate::varint;
use bytes::{BufMut, BytesMut};
use rand::{Rng, RngCore};

/// The TLS extension number the parameters travel in.
pub const TP_EXTENSION: u16 = 0xffa5;

const TP_OCID: u64 = 0x00;
const TP_IDTO: u64 = 0x01;
const TP_SRT: u64 = 0x02;
const TP_MPS: u64 = 0x03;
const TP_IMD: u64 = 0x04;
const TP_IMSD_BL: u64 = 0x05;
const TP_IMSD_BR: u64 = 0x06;
const TP_IMSD_U: u64 = 0x07;
const TP_IMSB: u64 = 0x08;
const TP_IMSU: u64 = 0x09;
const TP_ADE: u64 = 0x0a;
const TP_MAD: u64 = 0x0b;
const TP_DMIG: u64 = 0x0c;
const TP_PRFA: u64 = 0x0d;
const TP_ACIL: u64 = 0x0e;
const TP_MAX: u64 = TP_ACIL + 1;

/// One endpoint's advertised parameters (`tp_in` for local, `tp_out` for
/// the peer's).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParams {
    /// Echo of the client's original dcid after a Retry (server only).
    pub odcid: Option<ConnectionId>,
    /// Idle timeout in milliseconds; zero disables.
    pub idle_to: u64,
    /// Stateless reset token for the handshake CID (server only).
    pub srt: Option<[u8; SRT_LEN]>,
    pub max_pkt_size: u64,
    pub max_data: u64,
    pub max_strm_data_bidi_local: u64,
    pub max_strm_data_bidi_remote: u64,
    pub max_strm_data_uni: u64,
    pub max_strms_bidi: u64,
    pub max_strms_uni: u64,
    pub ack_delay_exp: u64,
    /// In milliseconds.
    pub max_ack_delay: u64,
    pub disable_migration: bool,
    /// A preferred-address entry was present (contents unused).
    pub has_pref_addr: bool,
    pub act_cid_lim: u64,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            odcid: None,
            idle_to: 10_000,
            srt: None,
            max_pkt_size: 1452,
            max_data: 0,
            max_strm_data_bidi_local: 0,
            max_strm_data_bidi_remote: 0,
            max_strm_data_uni: 0,
            max_strms_bidi: 0,
            max_strms_uni: 0,
            ack_delay_exp: 3,
            max_ack_delay: 25,
            disable_migration: false,
            has_pref_addr: false,
            act_cid_lim: 2,
        }
    }
}

fn put_entry<B: BufMut>(buf: &mut B, id: u64, value: &[u8]) {
    varint::encode(id, buf);
    varint::encode(value.len() as u64, buf);
    buf.put_slice(value);
}

fn put_varint_entry<B: BufMut>(buf: &mut B, id: u64, value: u64) {
    let mut tmp = BytesMut::with_capacity(8);
    varint::encode(value, &mut tmp);
    put_entry(buf, id, &tmp);
}

impl TransportParams {
    pub fn encode(&self, side: Side, buf: &mut BytesMut) {
        if side.is_server() {
            if let Some(odcid) = &self.odcid {
                put_entry(buf, TP_OCID, odcid.as_bytes());
            }
            if let Some(srt) = &self.srt {
                put_entry(buf, TP_SRT, srt);
            }
        }
        put_varint_entry(buf, TP_IDTO, self.idle_to);
        put_varint_entry(buf, TP_MPS, self.max_pkt_size);
        put_varint_entry(buf, TP_IMD, self.max_data);
        put_varint_entry(buf, TP_IMSD_BL, self.max_strm_data_bidi_local);
        put_varint_entry(buf, TP_IMSD_BR, self.max_strm_data_bidi_remote);
        put_varint_entry(buf, TP_IMSD_U, self.max_strm_data_uni);
        put_varint_entry(buf, TP_IMSB, self.max_strms_bidi);
        put_varint_entry(buf, TP_IMSU, self.max_strms_uni);
        put_varint_entry(buf, TP_ADE, self.ack_delay_exp);
        put_varint_entry(buf, TP_MAD, self.max_ack_delay);
        if self.disable_migration {
            put_entry(buf, TP_DMIG, &[]);
        }
        put_varint_entry(buf, TP_ACIL, self.act_cid_lim);

        // Grease: one unknown-type entry the peer must skip.
        let mut rng = rand::thread_rng();
        let grease_id = 0xff00 | u64::from(rng.gen::<u8>());
        let mut payload = vec![0u8; rng.gen_range(0..16)];
        rng.fill_bytes(&mut payload);
        put_entry(buf, grease_id, &payload);
    }

    /// Decode a peer's parameter block. Duplicates of known types and
    /// malformed values are fatal `TRANSPORT_PARAMETER` errors.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let err = TransportError::TransportParameter;
        let mut params = Self {
            // Wire absence means zero/false for these.
            idle_to: 0,
            max_pkt_size: 65527,
            ..Self::default()
        };
        let mut seen = [false; TP_MAX as usize];

        while !buf.is_empty() {
            let id = varint::decode(&mut buf).ok_or(err)?;
            let len = varint::decode(&mut buf).ok_or(err)? as usize;
            if buf.len() < len {
                return Err(err);
            }
            let (value, rest) = buf.split_at(len);
            buf = rest;

            if id < TP_MAX {
                if seen[id as usize] {
                    return Err(err);
                }
                seen[id as usize] = true;
            }

            let mut value_rd = value;
            let mut take_varint = || varint::decode(&mut value_rd).ok_or(err);
            match id {
                TP_OCID => {
                    if value.len() > MAX_CID_LEN {
                        return Err(err);
                    }
                    params.odcid = Some(ConnectionId::from_slice(value).ok_or(err)?);
                }
                TP_IDTO => params.idle_to = take_varint()?,
                TP_SRT => {
                    let token: [u8; SRT_LEN] = value.try_into().map_err(|_| err)?;
                    params.srt = Some(token);
                }
                TP_MPS => {
                    params.max_pkt_size = take_varint()?;
                    if params.max_pkt_size < 1200 || params.max_pkt_size > 65527 {
                        return Err(err);
                    }
                }
                TP_IMD => params.max_data = take_varint()?,
                TP_IMSD_BL => params.max_strm_data_bidi_local = take_varint()?,
                TP_IMSD_BR => params.max_strm_data_bidi_remote = take_varint()?,
                TP_IMSD_U => params.max_strm_data_uni = take_varint()?,
                TP_IMSB => params.max_strms_bidi = take_varint()?,
                TP_IMSU => params.max_strms_uni = take_varint()?,
                TP_ADE => {
                    params.ack_delay_exp = take_varint()?;
                    if params.ack_delay_exp > 20 {
                        return Err(err);
                    }
                }
                TP_MAD => {
                    params.max_ack_delay = take_varint()?;
                    if params.max_ack_delay >= 1 << 14 {
                        return Err(err);
                    }
                }
                TP_DMIG => {
                    if !value.is_empty() {
                        return Err(err);
                    }
                    params.disable_migration = true;
                }
                TP_PRFA => params.has_pref_addr = true,
                TP_ACIL => params.act_cid_lim = take_varint()?,
                _ => {
                    // Unknown (including grease): skipped.
                }
            }
        }
        Ok(params)
    }
}
