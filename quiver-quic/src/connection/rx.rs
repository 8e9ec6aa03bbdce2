//! The RX pipeline: decoalesce, select cipher context, undo header
//! protection, decrypt, decode frames, dispatch.

use super::{ConnState, Connection, Event};
use crate::error::{CloseReason, Result, TransportError};
use crate::frames::types as ft;
use crate::frames::{Frame, FrameParser};
use crate::packet::{coder, Header, PacketType, UnprotectError};
use crate::types::{Epoch, PnSpaceId, Side, StreamId, MIN_SRT_PKT_LEN, SRT_LEN};
use bytes::Bytes;
use rand::Rng;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

impl Connection {
    /// Feed one received UDP datagram. The buffer is mutated in place
    /// (header protection removal, decryption) and returns to the caller's
    /// pool afterwards. `ecn_ce` reflects a CE mark on the IP header, when
    /// the socket reports it.
    pub fn on_datagram(
        &mut self,
        now: Instant,
        from: SocketAddr,
        datagram: &mut [u8],
        ecn_ce: bool,
    ) {
        match self.state {
            ConnState::Closed | ConnState::Draining => return,
            ConnState::Closing | ConnState::QueueClose => {
                // Anything from the peer while closing earns another
                // CONNECTION_CLOSE, nothing more.
                self.needs_tx = true;
                return;
            }
            _ => {}
        }

        if self.is_stateless_reset(datagram) {
            info!("stateless reset received");
            self.err = Some(CloseReason::transport(
                TransportError::NoError,
                None,
                "stateless reset",
            ));
            self.events.push_back(Event::Closed {
                error: self.err.clone(),
                peer_initiated: true,
            });
            self.transition(ConnState::Draining);
            self.closing_t = Some(now);
            return;
        }

        let total = datagram.len();
        let mut offset = 0usize;
        let mut outer_dcid = None;
        while offset < total {
            let slice = &datagram[offset..];
            let hdr = match Header::decode_beginning(slice, self.cids.local_cid_len()) {
                Ok(hdr) => hdr,
                Err(err) => {
                    debug!(%err, offset, "dropping undecodable packet");
                    return;
                }
            };

            // Decoalescing: a long-header Length field delimits the packet;
            // anything else consumes the rest of the datagram.
            let pkt_len = match hdr.packet_type {
                PacketType::Initial | PacketType::ZeroRtt | PacketType::Handshake => {
                    coder::coalesced_len(&hdr)
                }
                _ => slice.len(),
            };

            // All coalesced fragments must share the outer dcid.
            match &outer_dcid {
                None => outer_dcid = Some(hdr.dcid.clone()),
                Some(outer) if *outer != hdr.dcid => {
                    debug!("coalesced packet with mismatched dcid, dropping remainder");
                    return;
                }
                _ => {}
            }

            match hdr.packet_type {
                PacketType::VersionNegotiation => {
                    self.rx_vneg(&hdr);
                    return;
                }
                PacketType::Retry => {
                    self.rx_retry(&hdr);
                    return;
                }
                _ => {
                    let pkt = &mut datagram[offset..offset + pkt_len];
                    self.rx_protected(now, from, pkt, hdr, total, ecn_ce);
                }
            }
            if !matches!(
                self.state,
                ConnState::Idle | ConnState::Opening | ConnState::Established
            ) {
                return;
            }
            offset += pkt_len;
        }
    }

    /// Trailing-16-bytes SRT match on a plausible short-header datagram.
    fn is_stateless_reset(&self, datagram: &[u8]) -> bool {
        if datagram.len() < MIN_SRT_PKT_LEN || datagram[0] & 0x80 != 0 {
            return false;
        }
        let tail: &[u8; SRT_LEN] = datagram[datagram.len() - SRT_LEN..]
            .try_into()
            .expect("length checked");
        self.cids.peer_srts().any(|srt| srt == tail)
    }

    // -----------------------------------------------------------------
    // Unprotected long-header packets
    // -----------------------------------------------------------------

    fn rx_vneg(&mut self, hdr: &Header) {
        if self.role != Side::Client
            || self.state != ConnState::Opening
            || self.vers != self.vers_initial
        {
            debug!("spurious version negotiation, dropping");
            return;
        }
        if hdr.supported_versions.contains(&self.vers) {
            // A VN listing the version we offered is an attack or a bug.
            debug!("version negotiation lists our version, dropping");
            return;
        }
        let Some(&pick) = super::SUPPORTED_VERSIONS
            .iter()
            .find(|&&vers| hdr.supported_versions.contains(&vers))
        else {
            self.err_close(
                TransportError::ProtocolViolation,
                0,
                "no common version with peer",
            );
            return;
        };
        info!(from = self.vers, to = pick, "version negotiation, restarting handshake");
        self.vers = pick;

        // Packet numbers reset only on version negotiation.
        for space in &mut self.spaces {
            space.reset_for_vneg();
        }
        self.rec = crate::recovery::Recovery::default();
        for space_id in PnSpaceId::ALL {
            self.crypto_streams[space_id.index()] =
                crate::stream::Stream::new_crypto(StreamId::crypto(space_id));
        }
        if let Err(code) = self.start_handshake() {
            self.err_close(code, 0, "handshake restart failed");
        }
        self.needs_tx = true;
    }

    fn rx_retry(&mut self, hdr: &Header) {
        if self.role != Side::Client || self.state != ConnState::Opening || self.did_retry {
            debug!("unexpected retry, dropping");
            return;
        }
        let Some(odcid) = &hdr.odcid else {
            debug!("retry without odcid, dropping");
            return;
        };
        if Some(odcid) != self.cids.active_dcid() {
            debug!("retry odcid mismatch, dropping");
            return;
        }
        if hdr.token.is_empty() {
            debug!("retry without token, dropping");
            return;
        }
        let Some(new_dcid) = hdr.scid.clone() else {
            return;
        };
        info!(token_len = hdr.token.len(), "handling retry");
        self.did_retry = true;
        self.tok = hdr.token.to_vec();
        self.cids.replace_initial_dcid(new_dcid.clone());
        if let Err(code) = self.install_initial_keys(&new_dcid) {
            self.err_close(code, 0, "initial key re-derivation failed");
            return;
        }

        // The pre-retry Initial will never be acked; rewind its payload.
        let space = &mut self.spaces[PnSpaceId::Initial.index()];
        for meta in space.sent.values() {
            if meta.in_flight {
                self.rec.cc.on_packet_lost(meta.udp_len);
            }
        }
        space.sent.clear();
        let sent = self.crypto_streams[PnSpaceId::Initial.index()].send.out_data();
        if sent > 0 {
            self.crypto_streams[PnSpaceId::Initial.index()]
                .send
                .on_lost(0, sent as usize, false);
        }
        self.needs_tx = true;
    }

    // -----------------------------------------------------------------
    // Protected packets
    // -----------------------------------------------------------------

    fn rx_protected(
        &mut self,
        now: Instant,
        from: SocketAddr,
        pkt: &mut [u8],
        mut hdr: Header,
        datagram_len: usize,
        ecn_ce: bool,
    ) {
        let Some(epoch) = hdr.packet_type.epoch() else {
            return;
        };
        if hdr.packet_type.is_long() && hdr.version != self.vers {
            debug!(version = hdr.version, "version mismatch, dropping");
            return;
        }
        if self.role == Side::Server && epoch == Epoch::ZeroRtt {
            // No 0-RTT acceptance in this build; the client falls back.
            trace!("dropping 0-RTT packet");
            return;
        }
        let space_idx = epoch.pn_space().index();
        if self.spaces[space_idx].abandoned {
            trace!(?epoch, "packet for abandoned space");
            return;
        }
        let lg_rxed = self.spaces[space_idx].lg_rxed;

        let attempt = {
            let Some(ctx) = self.keys[epoch as usize].rx.as_ref() else {
                trace!(?epoch, "no keys yet, dropping");
                return;
            };
            coder::unprotect(pkt, &mut hdr, ctx, lg_rxed)
        };
        let payload_range = match attempt {
            Ok(range) => range,
            Err(UnprotectError::ReservedBitsSet) => {
                self.err_close(TransportError::ProtocolViolation, 0, "reserved bits set");
                return;
            }
            Err(UnprotectError::Drop) if epoch == Epoch::Data => {
                match self.retry_other_phase(pkt, &mut hdr, lg_rxed) {
                    Some(range) => range,
                    None => return,
                }
            }
            Err(UnprotectError::Drop) => {
                trace!(?epoch, "undecryptable packet dropped");
                return;
            }
        };

        let pn = hdr.pn;
        if self.spaces[space_idx].recv_all.contains(pn) {
            trace!(pn, "duplicate packet dropped");
            return;
        }
        let highest_seen = self.spaces[space_idx]
            .recv_all
            .max()
            .map_or(true, |max| pn > max);

        // Client: the server's first response pins the real dcid.
        if self.role == Side::Client && !self.dcid_confirmed && hdr.packet_type.is_long() {
            if let Some(scid) = hdr.scid.clone() {
                self.cids.replace_initial_dcid(scid);
                self.dcid_confirmed = true;
            }
        }
        if hdr.packet_type == PacketType::Short {
            // Spin: servers echo what they saw, clients invert.
            self.spin = if self.role == Side::Server {
                hdr.spin
            } else {
                !hdr.spin
            };
        }

        let payload = &pkt[payload_range];
        let mut parser = FrameParser::new(payload);
        let mut eliciting = false;
        loop {
            let frame = match parser.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(code) => {
                    self.err_close(code, 0, "malformed frame");
                    return;
                }
            };
            let type_byte = frame.type_byte();
            if !ft::permitted_in_epoch(type_byte, epoch) {
                self.err_close(
                    TransportError::ProtocolViolation,
                    u64::from(type_byte),
                    "frame not permitted in this epoch",
                );
                return;
            }
            eliciting |= frame.is_ack_eliciting();
            if let Err(code) = self.handle_frame(now, epoch, pn, &frame, datagram_len) {
                self.err_close(code, u64::from(type_byte), "frame processing failed");
                return;
            }
            if !matches!(
                self.state,
                ConnState::Idle | ConnState::Opening | ConnState::Established
            ) {
                return;
            }
        }

        let max_ack_delay = Duration::from_millis(self.tp_in.max_ack_delay);
        let space = &mut self.spaces[space_idx];
        space.on_pkt_rxed(pn, eliciting, ecn_ce, now, max_ack_delay);
        if ecn_ce {
            space.ecn_rxed[2] += 1;
        }
        if space.imm_ack {
            self.needs_tx = true;
        }

        // A server processing a Handshake packet is done with Initial.
        if self.role == Side::Server
            && epoch == Epoch::Handshake
            && !self.spaces[PnSpaceId::Initial.index()].abandoned
        {
            self.spaces[PnSpaceId::Initial.index()].abandon();
            self.keys[Epoch::Initial as usize] = super::EpochKeys::default();
        }

        // Path migration: new source address plus a higher packet number
        // than anything seen starts validation of the new path.
        if self.role == Side::Server
            && self.state == ConnState::Established
            && epoch == Epoch::Data
            && from != self.peer
            && self.migr_peer != Some(from)
            && highest_seen
            && !self.tp_out.disable_migration
        {
            info!(%from, "possible peer migration, validating path");
            self.migr_peer = Some(from);
            let mut chlg = [0u8; 8];
            rand::thread_rng().fill(&mut chlg);
            self.path_chlg_out = Some(chlg);
            self.path_chlg_pending = Some(chlg);
            self.path_val_win = 3 * datagram_len as u64;
            self.path_val_sent = 0;
            self.needs_tx = true;
        }

        self.arm_idle(now);
    }

    /// A short-header packet that the current-phase keys reject may belong
    /// to the previous phase (reordering) or the next (peer key update).
    fn retry_other_phase(
        &mut self,
        pkt: &mut [u8],
        hdr: &mut Header,
        lg_rxed: Option<u64>,
    ) -> Option<std::ops::Range<usize>> {
        if let Some(prev) = self.prev_rx.as_ref() {
            if let Ok(range) = coder::unprotect(pkt, hdr, prev, lg_rxed) {
                trace!("decrypted with previous key phase");
                return Some(range);
            }
        }
        let next = {
            let current = self.keys[Epoch::Data as usize].rx.as_ref()?;
            current.next_phase().ok()?
        };
        match coder::unprotect(pkt, hdr, &next, lg_rxed) {
            Ok(range) => {
                debug!("peer initiated key update");
                let slot = &mut self.keys[Epoch::Data as usize];
                self.prev_rx = slot.rx.replace(next);
                if let Some(new_tx) = slot.tx.as_ref().and_then(|tx| tx.next_phase().ok()) {
                    slot.tx = Some(new_tx);
                }
                self.key_phase = !self.key_phase;
                Some(range)
            }
            Err(_) => {
                trace!("undecryptable short-header packet dropped");
                None
            }
        }
    }

    // -----------------------------------------------------------------
    // Frame dispatch
    // -----------------------------------------------------------------

    fn handle_frame(
        &mut self,
        now: Instant,
        epoch: Epoch,
        _pn: u64,
        frame: &Frame<'_>,
        datagram_len: usize,
    ) -> Result<()> {
        let space_id = epoch.pn_space();
        match frame {
            Frame::Padding { .. } | Frame::Ping => Ok(()),

            Frame::Ack(ack) => self.on_ack_frame(space_id, epoch, ack, now),

            Frame::ResetStream(reset) => {
                let id = reset.stream_id;
                self.check_peer_stream_id(id)?;
                if let Some(stream) = self.streams.get_mut(&id.0) {
                    if !stream.is_closed() {
                        stream.on_reset();
                        self.events
                            .push_back(Event::StreamReset(id, reset.error_code));
                    }
                }
                Ok(())
            }

            Frame::StopSending(stop) => {
                self.check_peer_stream_id(stop.stream_id)?;
                self.events
                    .push_back(Event::StopSending(stop.stream_id, stop.error_code));
                Ok(())
            }

            Frame::Crypto(crypto) => {
                let stream = &mut self.crypto_streams[space_id.index()];
                stream
                    .recv
                    .insert(crypto.offset, Bytes::copy_from_slice(crypto.data), false)?;
                self.drive_crypto(space_id)
            }

            Frame::NewToken { token } => {
                if self.role == Side::Server {
                    return Err(TransportError::ProtocolViolation);
                }
                self.events.push_back(Event::NewToken(token.to_vec()));
                Ok(())
            }

            Frame::Stream(stream_frame) => self.on_stream_frame(stream_frame),

            Frame::MaxData { max } => {
                if *max > self.out_data_max {
                    self.out_data_max = *max;
                    self.blocked = false;
                    self.needs_tx = true;
                }
                Ok(())
            }

            Frame::MaxStreamData { stream_id, max } => {
                if let Some(stream) = self.streams.get_mut(&stream_id.0) {
                    if *max > stream.out_data_max {
                        stream.out_data_max = *max;
                        stream.blocked = false;
                        self.needs_tx = true;
                    }
                }
                Ok(())
            }

            Frame::MaxStreams { bidi, max } => {
                if *bidi {
                    if *max > self.peer_max_strms_bidi {
                        self.peer_max_strms_bidi = *max;
                        self.sid_blocked_bidi = false;
                    }
                } else if *max > self.peer_max_strms_uni {
                    self.peer_max_strms_uni = *max;
                    self.sid_blocked_uni = false;
                }
                Ok(())
            }

            Frame::DataBlocked { limit } => {
                trace!(limit, "peer is data-blocked, granting");
                self.in_data_max = self.in_data_max.saturating_mul(2);
                self.tx_max_data = true;
                self.needs_tx = true;
                Ok(())
            }

            Frame::StreamDataBlocked { stream_id, limit } => {
                trace!(stream = %stream_id, limit, "peer is stream-data-blocked, granting");
                self.check_peer_stream_id(*stream_id)?;
                if let Some(stream) = self.streams.get_mut(&stream_id.0) {
                    stream.in_data_max = stream.in_data_max.saturating_mul(2);
                    stream.tx_max_stream_data = true;
                    self.needs_tx = true;
                }
                Ok(())
            }

            Frame::StreamsBlocked { bidi, limit } => {
                let local = if *bidi {
                    self.local_max_strms_bidi
                } else {
                    self.local_max_strms_uni
                };
                if *limit < local {
                    // Their view is stale; re-announce.
                    if *bidi {
                        self.tx_max_sid_bidi = true;
                    } else {
                        self.tx_max_sid_uni = true;
                    }
                    self.needs_tx = true;
                }
                Ok(())
            }

            Frame::NewConnectionId(ncid) => {
                let limit =
                    self.tp_in.act_cid_lim + u64::from(self.tp_out.has_pref_addr);
                self.cids.on_new_cid_frame(ncid, limit)?;
                Ok(())
            }

            Frame::RetireConnectionId { seq } => {
                let reset_key = self.cfg.reset_key;
                self.cids.on_retire_cid_frame(*seq, &reset_key)?;
                if self.cids.tx_ncid {
                    self.needs_tx = true;
                }
                Ok(())
            }

            Frame::PathChallenge { data } => {
                self.path_resp_out = Some(*data);
                self.needs_tx = true;
                Ok(())
            }

            Frame::PathResponse { data } => {
                if self.path_chlg_pending == Some(*data) {
                    self.path_chlg_pending = None;
                    self.path_chlg_out = None;
                    if let Some(new_peer) = self.migr_peer.take() {
                        info!(%new_peer, "path validated, migration complete");
                        self.peer = new_peer;
                        self.path_val_win = u64::MAX;
                        self.events.push_back(Event::PathValidated(new_peer));
                    }
                } else {
                    debug!("unmatched PATH_RESPONSE ignored");
                }
                Ok(())
            }

            Frame::ConnectionClose(close) => {
                info!(
                    code = close.error_code,
                    application = close.application,
                    reason = %String::from_utf8_lossy(close.reason),
                    "peer closed connection"
                );
                let reason = String::from_utf8_lossy(close.reason).into_owned();
                let record = if close.application {
                    CloseReason::application(close.error_code, &reason)
                } else {
                    CloseReason {
                        code: TransportError::from_wire(close.error_code),
                        frame_type: close.frame_type,
                        reason,
                        application: false,
                        app_code: 0,
                    }
                };
                self.events.push_back(Event::Closed {
                    error: Some(record.clone()),
                    peer_initiated: true,
                });
                if self.err.is_none() {
                    self.err = Some(record);
                }
                self.transition(ConnState::Draining);
                self.closing_t = Some(now + self.closing_period());
                Ok(())
            }
        }
    }

    fn on_ack_frame(
        &mut self,
        space_id: PnSpaceId,
        epoch: Epoch,
        ack: &ft::AckFrame,
        now: Instant,
    ) -> Result<()> {
        // Handshake ACKs use the fixed exponent; data ACKs the negotiated.
        let exponent = if epoch == Epoch::Data {
            self.tp_out.ack_delay_exp
        } else {
            3
        };
        let delay_us = ack.ack_delay << exponent;
        let delay = Duration::from_micros(delay_us).min(self.peer_max_ack_delay());

        let space = &mut self.spaces[space_id.index()];
        let outcome = self.rec.on_ack_rxed(space, ack, delay, now);

        let mut largest_acked_sent_t = None;
        for meta in &outcome.newly_acked {
            if Some(meta.nr) == self.spaces[space_id.index()].lg_acked {
                largest_acked_sent_t = Some(meta.t_sent);
            }
            if let Some(strm) = meta.strm {
                self.rtx_origins.remove(&(strm.id.0, strm.offset));
                if strm.id.is_crypto() {
                    self.crypto_streams[space_id.index()]
                        .send
                        .on_acked(strm.offset, strm.len, strm.fin);
                } else if let Some(stream) = self.streams.get_mut(&strm.id.0) {
                    stream.send.on_acked(strm.offset, strm.len, strm.fin);
                    if stream.send.fin_sent_and_acked() {
                        stream.on_fin_acked();
                        self.on_stream_closed_maybe(strm.id);
                    }
                }
            }
        }

        if let Some(counts) = &ack.ecn {
            let idx = space_id.index();
            if counts.ce > self.ce_seen[idx] {
                self.ce_seen[idx] = counts.ce;
                let t_sent = largest_acked_sent_t.unwrap_or(now);
                self.rec.on_ecn_ce(t_sent, now);
            }
        }

        if !outcome.newly_lost.is_empty() {
            self.requeue_lost(space_id, outcome.newly_lost);
        }
        if !outcome.newly_acked.is_empty() {
            self.needs_tx = true;
        }
        Ok(())
    }

    fn on_stream_frame(&mut self, frame: &ft::StreamFrame<'_>) -> Result<()> {
        let id = frame.stream_id;
        if frame.data.is_empty() && !frame.fin && !frame.explicit_len {
            // Accepted silently; nothing to do.
            warn!(stream = %id, "empty stream frame without LEN or FIN");
            return Ok(());
        }
        self.check_peer_stream_id(id)?;
        if id.is_uni() && id.initiated_by() == self.role {
            return Err(TransportError::StreamState);
        }

        if !self.streams.contains_key(&id.0) {
            if id.initiated_by() == self.role {
                // Data for a stream we never opened.
                return Err(TransportError::StreamState);
            }
            let stream = self.make_stream(id);
            self.streams.insert(id.0, stream);
            self.events.push_back(Event::StreamOpened(id));
        }

        let end = frame.offset + frame.data.len() as u64;
        let stream = self.streams.get_mut(&id.0).expect("inserted above");
        if stream.is_closed() {
            trace!(stream = %id, "data for closed stream dropped");
            return Ok(());
        }

        // Stream-level flow control, then connection-level on the newly
        // seen span.
        if end > stream.in_data_max {
            warn!(stream = %id, end, max = stream.in_data_max, "stream flow control overrun");
            return Err(TransportError::FlowControl);
        }
        let prev_seen = stream.recv.max_seen_off();
        stream
            .recv
            .insert(frame.offset, Bytes::copy_from_slice(frame.data), frame.fin)?;
        let newly_seen = stream.recv.max_seen_off().saturating_sub(prev_seen);
        let readable = stream.recv.queued_bytes() > 0;
        let stream_raise = stream.maybe_raise_in_max().is_some();

        self.in_data += newly_seen;
        if self.in_data > self.in_data_max {
            warn!(
                in_data = self.in_data,
                max = self.in_data_max,
                "connection flow control overrun"
            );
            return Err(TransportError::FlowControl);
        }
        self.maybe_raise_conn_window();
        if stream_raise {
            self.needs_tx = true;
        }
        if readable {
            self.events.push_back(Event::StreamReadable(id));
        }
        Ok(())
    }

    /// Fatal when a peer uses a stream id beyond the advertised ceiling.
    fn check_peer_stream_id(&self, id: StreamId) -> Result<()> {
        if id.initiated_by() == self.role {
            return Ok(());
        }
        let limit = if id.is_bidi() {
            self.local_max_strms_bidi
        } else {
            self.local_max_strms_uni
        };
        if id.ordinal() >= limit {
            warn!(stream = %id, limit, "stream id above advertised ceiling");
            return Err(TransportError::StreamId);
        }
        Ok(())
    }

    /// Pump in-order crypto bytes into the TLS adapter.
    fn drive_crypto(&mut self, space_id: PnSpaceId) -> Result<()> {
        loop {
            let Some(bytes) = self.crypto_streams[space_id.index()].recv.read(usize::MAX)
            else {
                return Ok(());
            };
            let progress = self.tls.on_crypto(space_id.crypto_epoch(), &bytes)?;
            self.absorb_tls(progress)?;
        }
    }

    /// Whether RX keys for an epoch are installed yet.
    pub fn has_rx_keys(&self, epoch: Epoch) -> bool {
        self.keys[epoch as usize].rx.is_some()
    }
}
