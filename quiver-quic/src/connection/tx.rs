//! The TX path: decide what needs sending, write frames in order, apply
//! packet protection, coalesce packets into datagrams.

use super::{ConnState, Connection, Transmit};
use crate::crypto::AEAD_TAG_LEN;
use crate::frames::types as ft;
use crate::frames::{encode, NewConnectionIdFrame};
use crate::packet::{coder, number, Header, PacketType, SentMeta, StreamDataRef};
use crate::types::{Epoch, PnSpaceId, Side, MAX_DATAGRAM_SIZE};
use bytes::{Bytes, BytesMut};
use std::time::Instant;
use tracing::{debug, trace};

/// Room below which another coalesced packet is not worth starting.
const MIN_COALESCE_ROOM: usize = 64;

impl Connection {
    /// Assemble the next outgoing datagram, if anything needs sending.
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Transmit> {
        match self.state {
            ConnState::Closed | ConnState::Draining => return None,
            ConnState::Closing if !self.needs_tx => return None,
            ConnState::Closing => {
                // Peer datagrams during closing are answered with another
                // CONNECTION_CLOSE.
                self.close_sent = false;
            }
            _ => {}
        }

        let budget = MAX_DATAGRAM_SIZE.min(self.tp_out.max_pkt_size as usize);
        // The path-validation window caps what may flow toward an
        // unvalidated migration target.
        let dest = self.tx_dest();
        if self.migr_peer == Some(dest) && self.path_val_sent >= self.path_val_win {
            trace!("path validation window exhausted");
            self.needs_tx = false;
            return None;
        }

        let mut datagram = BytesMut::with_capacity(budget);
        let mut prev_type: Option<PacketType> = None;
        for epoch in [Epoch::Initial, Epoch::Handshake, Epoch::Data] {
            if budget - datagram.len() < MIN_COALESCE_ROOM {
                break;
            }
            let packet_type = match epoch {
                Epoch::Initial => PacketType::Initial,
                Epoch::Handshake => PacketType::Handshake,
                _ => PacketType::Short,
            };
            if let Some(prev) = prev_type {
                if !coder::can_coalesce(prev, packet_type) {
                    break;
                }
            }
            if self.build_packet(now, epoch, packet_type, &mut datagram, budget) {
                prev_type = Some(packet_type);
            }
        }

        if datagram.is_empty() {
            self.needs_tx = false;
            return None;
        }

        if self.state == ConnState::Idle && self.role == Side::Client {
            self.transition(ConnState::Opening);
        }
        if self.state == ConnState::QueueClose && self.close_sent {
            self.transition(ConnState::Closing);
            self.closing_t = Some(now + self.closing_period());
        }
        if self.state == ConnState::Closing {
            // One close per RX burst.
            self.needs_tx = false;
        }
        if self.migr_peer == Some(dest) {
            self.path_val_sent += datagram.len() as u64;
        }
        Some(Transmit {
            dest,
            payload: datagram,
        })
    }

    /// PATH_CHALLENGEs go to the unvalidated address; everything else to
    /// the established peer.
    fn tx_dest(&self) -> std::net::SocketAddr {
        match (self.path_chlg_out.is_some() || self.path_chlg_pending.is_some(), self.migr_peer) {
            (true, Some(target)) => target,
            _ => self.peer,
        }
    }

    /// Append one packet of `epoch` to the datagram. Returns whether a
    /// packet was written.
    fn build_packet(
        &mut self,
        now: Instant,
        epoch: Epoch,
        packet_type: PacketType,
        datagram: &mut BytesMut,
        budget: usize,
    ) -> bool {
        if self.keys[epoch as usize].tx.is_none() {
            return false;
        }
        let space_idx = epoch.pn_space().index();
        if self.spaces[space_idx].abandoned {
            return false;
        }

        // Plan the packet before allocating a number.
        let in_data_epoch = epoch == Epoch::Data;
        let established = self.state == ConnState::Established;
        let closing = matches!(self.state, ConnState::QueueClose | ConnState::Closing);
        let send_close = closing && !self.close_sent && epoch == self.close_epoch();
        let send_crypto =
            !closing && self.crypto_streams[space_idx].send.has_pending();
        let controls = in_data_epoch && established && !closing && self.controls_pending();
        let stream_data = in_data_epoch && established && !closing && self.stream_tx_candidate().is_some();
        let probe = self.probes_pending > 0 && epoch == self.probe_epoch();
        let ack_wanted = self.spaces[space_idx].needs_ack_tx(now)
            || (self.spaces[space_idx].has_ack_ranges()
                && (send_crypto || controls || stream_data || send_close || probe));
        if !(ack_wanted || send_close || send_crypto || controls || stream_data || probe) {
            return false;
        }

        // Congestion: ack-only and close packets always go; the rest needs
        // window.
        let cwnd_avail = self.rec.cc.available();
        if (send_crypto || stream_data || probe) && cwnd_avail == 0 && !send_close {
            trace!("congestion window exhausted");
            return false;
        }

        let pkt_start = datagram.len();
        let nr = self.spaces[space_idx].next_pn();
        let pn_len = number::len(nr, self.spaces[space_idx].lg_acked);
        let hdr = Header {
            packet_type,
            version: self.vers,
            dcid: self
                .cids
                .active_dcid()
                .cloned()
                .unwrap_or_else(crate::types::ConnectionId::empty),
            scid: packet_type
                .is_long()
                .then(|| self.cids.active_scid().cloned())
                .flatten(),
            token: if packet_type == PacketType::Initial && self.role == Side::Client {
                Bytes::copy_from_slice(&self.tok)
            } else {
                Bytes::new()
            },
            odcid: None,
            supported_versions: Vec::new(),
            pay_len: 0,
            pn_offset: 0,
            pn: number::truncate(nr, pn_len),
            pn_len,
            key_phase: self.key_phase,
            spin: self.spin_enabled && self.spin,
        };
        let (pn_offset, len_offset) = hdr.write(datagram, pkt_start);

        let Some(max_payload) = budget.checked_sub(datagram.len() + AEAD_TAG_LEN) else {
            datagram.truncate(pkt_start);
            return false;
        };
        let payload_start = datagram.len();
        let mut frames: u32 = 0;
        let mut strm: Option<StreamDataRef> = None;
        let mut largest_acked_in_ack = None;
        let mut rtx = Vec::new();

        // Frame order: ACK, CONNECTION_CLOSE, connection/stream control,
        // stream data, PING, PAD.
        if ack_wanted {
            let space = &self.spaces[space_idx];
            if encode::ack_size(&space.recv, 0, false) <= max_payload {
                encode::ack(&space.recv, 0, None, datagram);
                largest_acked_in_ack = space.recv.max();
                frames |= ft::frame_bit(ft::FRAM_TYPE_ACK);
                self.spaces[space_idx].on_ack_tx();
            }
        }

        if send_close {
            if let Some(err) = &self.err {
                let remaining = max_payload - (datagram.len() - payload_start);
                let reason = err.reason.as_bytes();
                let reason = &reason[..reason.len().min(remaining.saturating_sub(24))];
                if err.application && epoch == Epoch::Data {
                    encode::connection_close(err.app_code, None, reason, true, datagram);
                    frames |= ft::frame_bit(ft::FRAM_TYPE_CNCL_APP);
                } else {
                    encode::connection_close(
                        err.code.to_wire(),
                        err.frame_type,
                        reason,
                        false,
                        datagram,
                    );
                    frames |= ft::frame_bit(ft::FRAM_TYPE_CNCL_QUIC);
                }
                self.close_sent = true;
            }
        }

        if controls {
            frames |= self.write_control_frames(datagram, payload_start, max_payload);
        }

        // Stream data: the crypto stream of this epoch first, else one app
        // stream's chunk.
        if send_crypto {
            let remaining = max_payload - (datagram.len() - payload_start);
            let stream_id = self.crypto_streams[space_idx].id;
            let overhead = 1 + 8 + 4; // worst-case crypto header
            if remaining > overhead {
                if let Some((offset, data, _)) = self.crypto_streams[space_idx]
                    .send
                    .next_chunk(remaining - overhead)
                {
                    encode::crypto(offset, &data, datagram);
                    frames |= ft::frame_bit(ft::FRAM_TYPE_CRPT);
                    if let Some(origins) = self.rtx_origins.remove(&(stream_id.0, offset)) {
                        rtx = origins;
                    }
                    strm = Some(StreamDataRef {
                        id: stream_id,
                        offset,
                        len: data.len(),
                        fin: false,
                    });
                }
            }
        } else if stream_data {
            let remaining = max_payload - (datagram.len() - payload_start);
            if let Some(frame_ref) = self.write_stream_frame(datagram, remaining, cwnd_avail) {
                frames |= ft::frame_bit(ft::FRAM_TYPE_STRM);
                if let Some(origins) = self.rtx_origins.remove(&(frame_ref.id.0, frame_ref.offset))
                {
                    rtx = origins;
                }
                strm = Some(frame_ref);
            }
        }

        let eliciting_bits = frames
            & !(ft::frame_bit(ft::FRAM_TYPE_ACK)
                | ft::frame_bit(ft::FRAM_TYPE_CNCL_QUIC)
                | ft::frame_bit(ft::FRAM_TYPE_CNCL_APP));
        if probe {
            // Any ack-eliciting content satisfies the probe; a bare PING
            // stands in otherwise.
            if eliciting_bits == 0 {
                encode::ping(datagram);
                frames |= ft::frame_bit(ft::FRAM_TYPE_PING);
            }
            self.probes_pending = self.probes_pending.saturating_sub(1);
        }

        let mut payload_len = datagram.len() - payload_start;
        if payload_len == 0 && frames == 0 {
            // Planning promised content but budgets said otherwise; drop
            // the header again. The packet number is burned, which is fine.
            datagram.truncate(pkt_start);
            return false;
        }

        // The header-protection sample needs four bytes of pn+payload; the
        // client's connection-opening Initial pads the whole datagram out
        // to 1200.
        let mut pad = (coder::MIN_PN_AND_PAYLOAD - pn_len).saturating_sub(payload_len);
        if packet_type == PacketType::Initial && self.role == Side::Client {
            pad = max_payload.saturating_sub(payload_len);
        }
        if pad > 0 {
            encode::padding(pad, datagram);
            frames |= ft::frame_bit(ft::FRAM_TYPE_PAD);
            payload_len += pad;
        }

        let ctx = self.keys[epoch as usize].tx.as_ref().expect("checked above");
        if let Err(code) =
            coder::protect(datagram, pkt_start, pn_offset, pn_len, len_offset, nr, ctx)
        {
            debug!(?code, "packet protection failed, dropping datagram tail");
            datagram.truncate(pkt_start);
            return false;
        }

        let ack_eliciting = frames
            & !(ft::frame_bit(ft::FRAM_TYPE_ACK)
                | ft::frame_bit(ft::FRAM_TYPE_PAD)
                | ft::frame_bit(ft::FRAM_TYPE_CNCL_QUIC)
                | ft::frame_bit(ft::FRAM_TYPE_CNCL_APP))
            != 0;
        let udp_len = datagram.len() - pkt_start;
        let meta = SentMeta {
            nr,
            epoch,
            t_sent: now,
            udp_len,
            in_flight: ack_eliciting || pad > 0,
            ack_eliciting,
            frames,
            strm,
            largest_acked_in_ack,
            acked: false,
            lost: false,
            rtx,
        };
        let carries_crypto = strm_is_crypto(&meta);
        self.spaces[space_idx].on_pkt_sent(meta.clone());
        self.rec.on_pkt_sent(&meta, carries_crypto);
        trace!(
            ?epoch,
            nr,
            udp_len,
            frames = format_args!("{frames:#x}"),
            "packet sent"
        );
        true
    }

    /// The close travels in the current epoch: the highest one with TX
    /// keys.
    fn close_epoch(&self) -> Epoch {
        for epoch in [Epoch::Data, Epoch::Handshake, Epoch::Initial] {
            if self.keys[epoch as usize].tx.is_some()
                && !self.spaces[epoch.pn_space().index()].abandoned
            {
                return epoch;
            }
        }
        Epoch::Initial
    }

    fn probe_epoch(&self) -> Epoch {
        if self.state == ConnState::Established {
            return Epoch::Data;
        }
        if self.keys[Epoch::Handshake as usize].tx.is_some() {
            Epoch::Handshake
        } else {
            Epoch::Initial
        }
    }

    fn controls_pending(&self) -> bool {
        self.tx_max_data
            || self.tx_max_sid_bidi
            || self.tx_max_sid_uni
            || self.blocked
            || self.sid_blocked_bidi
            || self.sid_blocked_uni
            || self.cids.tx_ncid
            || !self.cids.tx_retire.is_empty()
            || self.path_resp_out.is_some()
            || self.path_chlg_out.is_some()
            || self.do_migration
            || self
                .streams
                .values()
                .any(|stream| stream.tx_max_stream_data || stream.blocked)
    }

    /// Connection- and stream-control frames, in a stable order. Returns
    /// the frame bits written.
    fn write_control_frames(
        &mut self,
        datagram: &mut BytesMut,
        payload_start: usize,
        max_payload: usize,
    ) -> u32 {
        let mut frames = 0u32;
        let room = |datagram: &BytesMut| max_payload.saturating_sub(datagram.len() - payload_start);

        // A voluntary migration switches the dcid before anything else is
        // written with it.
        if self.do_migration {
            self.do_migration = false;
            if self.cids.switch_dcid() {
                debug!("voluntary dcid switch");
            }
        }

        if self.tx_max_data && room(datagram) > 9 {
            encode::max_data(self.in_data_max, datagram);
            self.tx_max_data = false;
            frames |= ft::frame_bit(ft::FRAM_TYPE_MAX_DATA);
        }
        if self.tx_max_sid_bidi && room(datagram) > 9 {
            encode::max_streams(true, self.local_max_strms_bidi, datagram);
            self.tx_max_sid_bidi = false;
            frames |= ft::frame_bit(ft::FRAM_TYPE_MAX_SID_BIDI);
        }
        if self.tx_max_sid_uni && room(datagram) > 9 {
            encode::max_streams(false, self.local_max_strms_uni, datagram);
            self.tx_max_sid_uni = false;
            frames |= ft::frame_bit(ft::FRAM_TYPE_MAX_SID_UNI);
        }
        if self.blocked && room(datagram) > 9 {
            encode::data_blocked(self.out_data_max, datagram);
            self.blocked = false;
            frames |= ft::frame_bit(ft::FRAM_TYPE_DATA_BLCK);
        }
        if self.sid_blocked_bidi && room(datagram) > 9 {
            encode::streams_blocked(true, self.peer_max_strms_bidi, datagram);
            self.sid_blocked_bidi = false;
            frames |= ft::frame_bit(ft::FRAM_TYPE_SID_BLCK_BIDI);
        }
        if self.sid_blocked_uni && room(datagram) > 9 {
            encode::streams_blocked(false, self.peer_max_strms_uni, datagram);
            self.sid_blocked_uni = false;
            frames |= ft::frame_bit(ft::FRAM_TYPE_SID_BLCK_UNI);
        }

        // Per-stream window updates and blocked signals.
        let pending: Vec<(i64, bool, bool, u64, u64)> = self
            .streams
            .values()
            .filter(|s| s.tx_max_stream_data || s.blocked)
            .map(|s| (s.id.0, s.tx_max_stream_data, s.blocked, s.in_data_max, s.out_data_max))
            .collect();
        for (id, tx_max, blocked, in_max, out_max) in pending {
            let stream_id = crate::types::StreamId(id);
            if tx_max && room(datagram) > 17 {
                encode::max_stream_data(stream_id, in_max, datagram);
                self.streams.get_mut(&id).expect("collected above").tx_max_stream_data = false;
                frames |= ft::frame_bit(ft::FRAM_TYPE_MAX_STRM_DATA);
            }
            if blocked && room(datagram) > 17 {
                encode::stream_data_blocked(stream_id, out_max, datagram);
                self.streams.get_mut(&id).expect("collected above").blocked = false;
                frames |= ft::frame_bit(ft::FRAM_TYPE_STRM_DATA_BLCK);
            }
        }

        // Worst case: type + two 8-byte varints + length byte + cid + srt.
        if self.cids.tx_ncid && room(datagram) > 1 + 8 + 8 + 1 + crate::types::MAX_CID_LEN + 16 {
            let reset_key = self.cfg.reset_key;
            let fresh = self.cids.new_scid(&reset_key);
            let frame = NewConnectionIdFrame {
                seq: fresh.seq,
                retire_prior_to: 0,
                cid: fresh.id,
                srt: fresh.srt.expect("scids always carry a token"),
            };
            encode::new_connection_id(&frame, datagram);
            self.cids.tx_ncid = false;
            frames |= ft::frame_bit(ft::FRAM_TYPE_NEW_CID);
        }
        while let Some(seq) = self.cids.tx_retire.first().copied() {
            if room(datagram) < 10 {
                break;
            }
            encode::retire_connection_id(seq, datagram);
            self.cids.tx_retire.remove(0);
            frames |= ft::frame_bit(ft::FRAM_TYPE_RTIR_CID);
        }

        if room(datagram) > 9 {
            if let Some(data) = self.path_resp_out.take() {
                encode::path_response(&data, datagram);
                frames |= ft::frame_bit(ft::FRAM_TYPE_PATH_RESP);
            }
        }
        if room(datagram) > 9 {
            if let Some(data) = self.path_chlg_out.take() {
                encode::path_challenge(&data, datagram);
                frames |= ft::frame_bit(ft::FRAM_TYPE_PATH_CHLG);
            }
        }
        frames
    }

    /// First stream with transmittable data under all windows.
    fn stream_tx_candidate(&self) -> Option<i64> {
        let conn_window = self.conn_out_window();
        self.streams
            .values()
            .find(|stream| {
                if !stream.send.has_pending() {
                    return false;
                }
                // Retransmissions and bare FINs are already inside every
                // window; fresh data needs room in both.
                stream.send.has_rtx()
                    || stream.send.out_data() >= stream.send.append_off()
                    || (stream.out_window() > 0 && conn_window > 0)
            })
            .map(|stream| stream.id.0)
    }

    /// Write one STREAM frame, bounded by the stream window, the connection
    /// window, the congestion window and the packet budget.
    fn write_stream_frame(
        &mut self,
        datagram: &mut BytesMut,
        remaining: usize,
        cwnd_avail: usize,
    ) -> Option<StreamDataRef> {
        let id = self.stream_tx_candidate()?;
        let conn_window = self.conn_out_window();
        let stream = self.streams.get_mut(&id)?;
        let header_room =
            encode::stream_header_size(stream.id, stream.send.out_data().max(1), remaining) + 2;
        if remaining <= header_room {
            return None;
        }
        let room = remaining - header_room;
        let fresh_budget = stream
            .out_window()
            .min(conn_window)
            .min(cwnd_avail as u64) as usize;
        let has_fresh = stream.send.out_data() < stream.send.append_off();
        let max_len = if stream.send.has_rtx() {
            room
        } else if has_fresh {
            if fresh_budget == 0 {
                // About to exceed a window: raise the matching signal.
                if stream.out_window() == 0 {
                    stream.blocked = true;
                } else if conn_window == 0 {
                    self.blocked = true;
                }
                self.needs_tx = true;
                return None;
            }
            room.min(fresh_budget)
        } else {
            room // bare FIN
        };

        let before_out = stream.send.out_data();
        let (offset, data, fin) = stream.send.next_chunk(max_len)?;
        let fresh = stream.send.out_data().saturating_sub(before_out);
        encode::stream(stream.id, offset, &data, fin, datagram);
        let frame_ref = StreamDataRef {
            id: stream.id,
            offset,
            len: data.len(),
            fin,
        };
        self.out_data += fresh;
        Some(frame_ref)
    }
}

fn strm_is_crypto(meta: &SentMeta) -> bool {
    meta.strm.is_some_and(|s| s.id.is_crypto())
}
