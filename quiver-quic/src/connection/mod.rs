//! The connection state machine.
//!
//! A connection is a pure state machine: datagrams and time go in
//! ([`Connection::on_datagram`], [`Connection::on_timeout`]), datagrams and
//! events come out ([`Connection::poll_transmit`],
//! [`Connection::poll_event`]). The run loop owns sockets and clocks.

mod rx;
mod tx;

#[cfg(test)]
mod tests;

use crate::cid::CidManager;
use crate::crypto::{initial_ctxs, CipherCtx, TlsProgress, TlsSession};
use crate::error::{CloseReason, Result, TransportError};
use crate::packet::space::PnSpace;
use crate::ranges::RangeSet;
use crate::recovery::{LdAction, Recovery};
use crate::stream::{Stream, StreamState};
use crate::transport::TransportParams;
use crate::types::{ConnectionId, Epoch, PnSpaceId, Side, StreamId, SRT_LEN};
use bytes::{Bytes, BytesMut};
use rand::Rng;
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Closed,
    Idle,
    /// First Initial sent, handshake under way.
    Opening,
    Established,
    /// A local error is recorded but CONNECTION_CLOSE has not gone out.
    QueueClose,
    /// CONNECTION_CLOSE enqueued/sent; waiting out the closing timer.
    Closing,
    /// Peer closed; waiting out the drain timer.
    Draining,
}

/// Application-visible happenings, drained via [`Connection::poll_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    HandshakeComplete,
    /// A peer-initiated stream came into existence.
    StreamOpened(StreamId),
    StreamReadable(StreamId),
    /// Peer's FIN became observable after all data was read.
    StreamFinished(StreamId),
    StreamReset(StreamId, u64),
    /// Peer asks us to stop sending on a stream.
    StopSending(StreamId, u64),
    /// Token for future Initials to this server.
    NewToken(Vec<u8>),
    /// Path validation of a migrated peer completed.
    PathValidated(SocketAddr),
    Closed {
        error: Option<CloseReason>,
        peer_initiated: bool,
    },
}

/// One outbound datagram.
#[derive(Debug)]
pub struct Transmit {
    pub dest: SocketAddr,
    pub payload: BytesMut,
}

/// Per-connection tunables supplied by the endpoint.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    pub tp: TransportParams,
    pub local_cid_len: usize,
    /// Endpoint secret the stateless-reset tokens of our CIDs derive from.
    pub reset_key: [u8; 32],
    /// Proactive key updates; `None` disables the key-flip timer.
    pub key_update_interval: Option<Duration>,
    /// ALPN identifiers (client: offers; server: the closed supported set).
    pub alpn: Vec<Vec<u8>>,
    /// Token from a previous connection, sent in Initials (client).
    pub token: Vec<u8>,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            tp: TransportParams::default(),
            local_cid_len: 8,
            reset_key: [0; 32],
            key_update_interval: None,
            alpn: Vec::new(),
            token: Vec::new(),
        }
    }
}

/// Keys for one epoch, one per direction.
#[derive(Default)]
pub(crate) struct EpochKeys {
    pub tx: Option<CipherCtx>,
    pub rx: Option<CipherCtx>,
}

/// The versions this endpoint speaks, preference-ordered. The first entry
/// is offered by default; a reserved grease version is appended on the
/// wire.
pub const SUPPORTED_VERSIONS: [u32; 2] = [0xff00_0016, 0xff00_0014];

/// Grease version advertised in Version Negotiation packets.
pub const GREASE_VERSION: u32 = 0x0a0a_0a0a;

pub struct Connection {
    pub(crate) role: Side,
    state: ConnState,
    pub(crate) vers: u32,
    /// The version the very first flight used; vneg resets to a new pick.
    pub(crate) vers_initial: u32,
    pub(crate) peer: SocketAddr,
    /// Migration target while path validation runs.
    pub(crate) migr_peer: Option<SocketAddr>,

    pub(crate) spaces: [PnSpace; PnSpaceId::COUNT],
    pub(crate) crypto_streams: [Stream; PnSpaceId::COUNT],
    pub(crate) streams: BTreeMap<i64, Stream>,
    pub(crate) cids: CidManager,
    /// Client-chosen original dcid (server keeps accepting it).
    pub(crate) odcid: Option<ConnectionId>,

    pub(crate) tp_in: TransportParams,
    pub(crate) tp_out: TransportParams,
    pub(crate) tp_out_ready: bool,

    pub(crate) rec: Recovery,
    pub(crate) tls: Box<dyn TlsSession>,
    pub(crate) keys: [EpochKeys; Epoch::COUNT],
    /// Data-epoch key phase currently in TX use.
    pub(crate) key_phase: bool,
    /// Previous-phase RX context kept for reordered packets.
    pub(crate) prev_rx: Option<CipherCtx>,

    // Timers.
    pub(crate) idle_t: Option<Instant>,
    pub(crate) closing_t: Option<Instant>,
    pub(crate) key_flip_t: Option<Instant>,

    // Connection-level flow control.
    /// Sum over streams of the highest offset seen inbound.
    pub(crate) in_data: u64,
    /// Sum over streams of bytes sent outbound.
    pub(crate) out_data: u64,
    pub(crate) in_data_max: u64,
    pub(crate) out_data_max: u64,
    pub(crate) tx_max_data: bool,
    pub(crate) blocked: bool,

    // Stream-id ceilings, in stream counts per direction kind.
    pub(crate) local_max_strms_bidi: u64,
    pub(crate) local_max_strms_uni: u64,
    pub(crate) peer_max_strms_bidi: u64,
    pub(crate) peer_max_strms_uni: u64,
    pub(crate) next_strm_ord_bidi: u64,
    pub(crate) next_strm_ord_uni: u64,
    pub(crate) tx_max_sid_bidi: bool,
    pub(crate) tx_max_sid_uni: bool,
    pub(crate) sid_blocked_bidi: bool,
    pub(crate) sid_blocked_uni: bool,

    // Path validation.
    pub(crate) path_chlg_out: Option<[u8; 8]>,
    pub(crate) path_chlg_pending: Option<[u8; 8]>,
    pub(crate) path_resp_out: Option<[u8; 8]>,
    /// Byte budget toward an unvalidated peer address.
    pub(crate) path_val_win: u64,
    pub(crate) path_val_sent: u64,

    pub(crate) err: Option<CloseReason>,
    pub(crate) close_sent: bool,
    /// ECN-CE counts already accounted per space.
    pub(crate) ce_seen: [u64; PnSpaceId::COUNT],
    /// Retransmission provenance: (stream, offset) -> packet numbers of
    /// prior transmissions, consumed when the range goes out again.
    pub(crate) rtx_origins: BTreeMap<(i64, u64), Vec<u64>>,

    pub(crate) tok: Vec<u8>,
    /// Client: a Retry was already honored; further Retries are dropped.
    pub(crate) did_retry: bool,
    /// Client: the server-chosen scid replaced the provisional dcid.
    pub(crate) dcid_confirmed: bool,
    pub(crate) probes_pending: u32,
    pub(crate) needs_tx: bool,
    pub(crate) try_0rtt: bool,
    pub(crate) did_0rtt: bool,
    pub(crate) spin_enabled: bool,
    pub(crate) spin: bool,
    pub(crate) do_migration: bool,
    pub(crate) alpn: Option<Vec<u8>>,
    pub(crate) cfg: ConnConfig,

    pub(crate) events: VecDeque<Event>,
}

impl Connection {
    /// Create a client connection toward `peer`. The first flight is
    /// queued; [`Connection::poll_transmit`] produces the padded Initial.
    ///
    /// `make_tls` receives the encoded local transport parameters, which
    /// the TLS library carries in its extension.
    pub fn new_client<F>(
        peer: SocketAddr,
        cfg: ConnConfig,
        make_tls: F,
        now: Instant,
    ) -> Result<Self>
    where
        F: FnOnce(Vec<u8>) -> Box<dyn TlsSession>,
    {
        let vers = SUPPORTED_VERSIONS[0];
        let mut cids = CidManager::new(cfg.local_cid_len);
        cids.new_scid(&cfg.reset_key);

        // The provisional dcid the Initial keys derive from.
        let mut dcid_bytes = [0u8; 8];
        rand::thread_rng().fill(&mut dcid_bytes);
        let dcid = ConnectionId::from_slice(&dcid_bytes).expect("within bounds");
        cids.seed_dcid(dcid.clone(), None);

        let mut tp_buf = BytesMut::new();
        cfg.tp.encode(Side::Client, &mut tp_buf);
        let tls = make_tls(tp_buf.to_vec());

        let mut conn = Self::new_common(Side::Client, peer, vers, cids, cfg, tls, now)?;
        conn.install_initial_keys(&dcid)?;
        conn.start_handshake()?;
        Ok(conn)
    }

    /// Create a server connection from a client Initial's addressing.
    ///
    /// `odcid` is the client-chosen dcid (Initial keys derive from it and
    /// the endpoint keeps routing it here); `client_scid` becomes our dcid.
    /// Any Retry/token verification happened at the endpoint already.
    pub fn new_server<F>(
        peer: SocketAddr,
        odcid: ConnectionId,
        client_scid: ConnectionId,
        vers: u32,
        cfg: ConnConfig,
        make_tls: F,
        now: Instant,
    ) -> Result<Self>
    where
        F: FnOnce(Vec<u8>) -> Box<dyn TlsSession>,
    {
        let mut cids = CidManager::new(cfg.local_cid_len);
        let mut cfg = cfg;
        // Fresh random scid; the client's odcid stays acceptable alongside.
        let fresh = cids.new_scid(&cfg.reset_key);
        cfg.tp.srt = fresh.srt;
        cfg.tp.odcid = Some(odcid.clone());
        cids.seed_dcid(client_scid, None);

        let mut tp_buf = BytesMut::new();
        cfg.tp.encode(Side::Server, &mut tp_buf);
        let tls = make_tls(tp_buf.to_vec());

        let mut conn = Self::new_common(Side::Server, peer, vers, cids, cfg, tls, now)?;
        conn.odcid = Some(odcid.clone());
        conn.install_initial_keys(&odcid)?;
        Ok(conn)
    }

    fn new_common(
        role: Side,
        peer: SocketAddr,
        vers: u32,
        cids: CidManager,
        cfg: ConnConfig,
        tls: Box<dyn TlsSession>,
        now: Instant,
    ) -> Result<Self> {
        let tp_in = cfg.tp.clone();
        let spaces = [
            PnSpace::new(PnSpaceId::Initial),
            PnSpace::new(PnSpaceId::Handshake),
            PnSpace::new(PnSpaceId::Data),
        ];
        let crypto_streams = [
            Stream::new_crypto(StreamId::crypto(PnSpaceId::Initial)),
            Stream::new_crypto(StreamId::crypto(PnSpaceId::Handshake)),
            Stream::new_crypto(StreamId::crypto(PnSpaceId::Data)),
        ];
        let mut rng = rand::thread_rng();
        let mut conn = Self {
            role,
            state: ConnState::Idle,
            vers,
            vers_initial: vers,
            peer,
            migr_peer: None,
            spaces,
            crypto_streams,
            streams: BTreeMap::new(),
            cids,
            odcid: None,
            in_data_max: tp_in.max_data,
            local_max_strms_bidi: tp_in.max_strms_bidi,
            local_max_strms_uni: tp_in.max_strms_uni,
            tp_in,
            tp_out: TransportParams::default(),
            tp_out_ready: false,
            rec: Recovery::default(),
            tls,
            keys: Default::default(),
            key_phase: false,
            prev_rx: None,
            idle_t: None,
            closing_t: None,
            key_flip_t: None,
            in_data: 0,
            out_data: 0,
            out_data_max: 0,
            tx_max_data: false,
            blocked: false,
            peer_max_strms_bidi: 0,
            peer_max_strms_uni: 0,
            next_strm_ord_bidi: 0,
            next_strm_ord_uni: 0,
            tx_max_sid_bidi: false,
            tx_max_sid_uni: false,
            sid_blocked_bidi: false,
            sid_blocked_uni: false,
            path_chlg_out: None,
            path_chlg_pending: None,
            path_resp_out: None,
            path_val_win: u64::MAX,
            path_val_sent: 0,
            err: None,
            close_sent: false,
            ce_seen: [0; PnSpaceId::COUNT],
            rtx_origins: BTreeMap::new(),
            tok: cfg.token.clone(),
            did_retry: false,
            dcid_confirmed: false,
            probes_pending: 0,
            needs_tx: false,
            try_0rtt: false,
            did_0rtt: false,
            // One connection in eight keeps the spin bit dark.
            spin_enabled: rng.gen_range(0u8..8) != 0,
            spin: false,
            do_migration: false,
            alpn: None,
            cfg,
            events: VecDeque::new(),
        };
        conn.arm_idle(now);
        if let Some(interval) = conn.cfg.key_update_interval {
            conn.key_flip_t = Some(now + interval);
        }
        Ok(conn)
    }

    // -----------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnState::Established
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    pub fn side(&self) -> Side {
        self.role
    }

    pub fn alpn(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// The single place the state field mutates. A transition into the
    /// current state is a bug.
    pub(crate) fn transition(&mut self, next: ConnState) {
        if self.state == next {
            error!(state = ?next, "bug: connection transition to same state");
            return;
        }
        info!(from = ?self.state, to = ?next, role = ?self.role, "connection transition");
        self.state = next;
        if next == ConnState::Closed {
            // All alarms die with the connection.
            self.idle_t = None;
            self.closing_t = None;
            self.key_flip_t = None;
            for space in &mut self.spaces {
                space.ack_t = None;
                space.loss_t = None;
            }
        }
    }

    /// Record a fatal condition and head for CONNECTION_CLOSE. First error
    /// wins.
    pub(crate) fn err_close(&mut self, code: TransportError, frame_type: u64, reason: &str) {
        if self.err.is_some() {
            return;
        }
        debug!(?code, frame_type, reason, "connection error");
        self.err = Some(CloseReason::transport(code, Some(frame_type), reason));
        match self.state {
            ConnState::Closing | ConnState::Draining | ConnState::Closed => {}
            _ => self.transition(ConnState::QueueClose),
        }
        self.needs_tx = true;
    }

    /// Application-requested close.
    pub fn close(&mut self, app_code: u64, reason: &str) {
        if self.err.is_some() || matches!(self.state, ConnState::Closing | ConnState::Draining) {
            return;
        }
        self.err = Some(CloseReason::application(app_code, reason));
        match self.state {
            // Nothing on the wire yet: no point in a close exchange.
            ConnState::Idle => {
                self.events.push_back(Event::Closed {
                    error: None,
                    peer_initiated: false,
                });
                self.transition(ConnState::Closed);
            }
            _ => {
                self.transition(ConnState::QueueClose);
                self.needs_tx = true;
            }
        }
    }

    // -----------------------------------------------------------------
    // Keys and handshake plumbing
    // -----------------------------------------------------------------

    pub(crate) fn install_initial_keys(&mut self, client_dcid: &ConnectionId) -> Result<()> {
        let (tx, rx) = initial_ctxs(client_dcid.as_bytes(), self.role)?;
        self.keys[Epoch::Initial as usize] = EpochKeys {
            tx: Some(tx),
            rx: Some(rx),
        };
        Ok(())
    }

    pub(crate) fn start_handshake(&mut self) -> Result<()> {
        let progress = self.tls.start()?;
        self.absorb_tls(progress)
    }

    /// Fold one TLS step's outputs into the connection: queue handshake
    /// bytes on the crypto streams, install keys, surface completion.
    pub(crate) fn absorb_tls(&mut self, progress: TlsProgress) -> Result<()> {
        for (idx, bytes) in progress.outputs.iter().enumerate() {
            if bytes.is_empty() {
                continue;
            }
            let epoch = [Epoch::Initial, Epoch::ZeroRtt, Epoch::Handshake, Epoch::Data][idx];
            let space = epoch.pn_space();
            self.crypto_streams[space.index()]
                .write(Bytes::copy_from_slice(bytes), false);
            self.needs_tx = true;
        }
        for install in progress.key_installs {
            let ctx = CipherCtx::from_secret(&install.secret)?;
            let slot = &mut self.keys[install.epoch as usize];
            if install.is_enc {
                slot.tx = Some(ctx);
            } else {
                slot.rx = Some(ctx);
            }
            trace!(epoch = ?install.epoch, enc = install.is_enc, "installed traffic keys");
        }
        if let Some(raw) = progress.peer_transport_params {
            let params = TransportParams::decode(&raw).map_err(|_| {
                TransportError::TransportParameter
            })?;
            self.apply_peer_params(params);
        }
        if let Some(alpn) = progress.alpn {
            self.alpn = Some(alpn);
        }
        if progress.handshake_complete && self.state != ConnState::Established {
            self.on_handshake_complete();
        }
        Ok(())
    }

    fn apply_peer_params(&mut self, params: TransportParams) {
        if let Some(srt) = params.srt {
            // The handshake dcid's reset token arrives in the parameters.
            self.cids.set_dcid_srt(0, srt);
        }
        self.out_data_max = params.max_data;
        self.peer_max_strms_bidi = params.max_strms_bidi;
        self.peer_max_strms_uni = params.max_strms_uni;
        for stream in self.streams.values_mut() {
            stream.out_data_max = stream
                .out_data_max
                .max(self.role.stream_out_limit(&params, stream.id));
        }
        self.tp_out = params;
        self.tp_out_ready = true;
        debug!(
            max_data = self.out_data_max,
            strms_bidi = self.peer_max_strms_bidi,
            "peer transport parameters applied"
        );
    }

    fn on_handshake_complete(&mut self) {
        match self.state {
            ConnState::Idle | ConnState::Opening => self.transition(ConnState::Established),
            _ => return,
        }
        self.events.push_back(Event::HandshakeComplete);
        // Initial space has served its purpose.
        self.spaces[PnSpaceId::Initial.index()].abandon();
        self.keys[Epoch::Initial as usize] = EpochKeys::default();
        self.needs_tx = true;
    }

    // -----------------------------------------------------------------
    // Streams
    // -----------------------------------------------------------------

    /// Open a locally initiated stream.
    pub fn open_stream(&mut self, bidi: bool) -> Result<StreamId> {
        let (ord, limit, blocked_flag) = if bidi {
            (
                &mut self.next_strm_ord_bidi,
                self.peer_max_strms_bidi,
                &mut self.sid_blocked_bidi,
            )
        } else {
            (
                &mut self.next_strm_ord_uni,
                self.peer_max_strms_uni,
                &mut self.sid_blocked_uni,
            )
        };
        if *ord >= limit {
            *blocked_flag = true;
            self.needs_tx = true;
            return Err(TransportError::StreamId);
        }
        let id = StreamId::from_parts(self.role, bidi, *ord);
        *ord += 1;
        let stream = self.make_stream(id);
        self.streams.insert(id.0, stream);
        Ok(id)
    }

    pub(crate) fn make_stream(&self, id: StreamId) -> Stream {
        let in_max = if id.is_bidi() {
            if id.initiated_by() == self.role {
                self.tp_in.max_strm_data_bidi_local
            } else {
                self.tp_in.max_strm_data_bidi_remote
            }
        } else {
            self.tp_in.max_strm_data_uni
        };
        let out_max = self.role.stream_out_limit(&self.tp_out, id);
        Stream::new(id, in_max, out_max)
    }

    /// Queue application data on a stream.
    pub fn stream_write(&mut self, id: StreamId, data: Bytes, fin: bool) -> Result<()> {
        let stream = self
            .streams
            .get_mut(&id.0)
            .ok_or(TransportError::StreamState)?;
        if matches!(
            stream.state(),
            StreamState::HalfClosedLocal | StreamState::Closed
        ) {
            return Err(TransportError::StreamState);
        }
        stream.write(data, fin);
        self.needs_tx = true;
        Ok(())
    }

    /// Read in-order data from a stream. Returns `(bytes, fin_reached)`.
    pub fn stream_read(&mut self, id: StreamId, max_len: usize) -> Option<(Bytes, bool)> {
        let stream = self.streams.get_mut(&id.0)?;
        let data = stream.recv.read(max_len);
        let fin = stream.recv.fin_reached();
        if fin {
            stream.on_fin_rxed();
            self.events.push_back(Event::StreamFinished(id));
            self.on_stream_closed_maybe(id);
        }
        match data {
            Some(data) => Some((data, fin)),
            None if fin => Some((Bytes::new(), true)),
            None => None,
        }
    }

    /// Closing a stream frees a slot under MAX_STREAMS; advertise more once
    /// half the window is used up.
    pub(crate) fn on_stream_closed_maybe(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get(&id.0) else {
            return;
        };
        if !stream.is_closed() && stream.state() != StreamState::HalfClosedRemote {
            return;
        }
        if id.initiated_by() != self.role {
            let (limit, tx_flag) = if id.is_bidi() {
                (&mut self.local_max_strms_bidi, &mut self.tx_max_sid_bidi)
            } else {
                (&mut self.local_max_strms_uni, &mut self.tx_max_sid_uni)
            };
            if 2 * (id.ordinal() + 1) > *limit {
                *limit *= 2;
                *tx_flag = true;
                self.needs_tx = true;
            }
        }
    }

    // -----------------------------------------------------------------
    // Flow control
    // -----------------------------------------------------------------

    /// Raise the connection-level receive window once the peer used more
    /// than half of it.
    pub(crate) fn maybe_raise_conn_window(&mut self) {
        if self.in_data_max != 0 && 2 * self.in_data > self.in_data_max {
            self.in_data_max *= 2;
            self.tx_max_data = true;
            self.needs_tx = true;
            trace!(max = self.in_data_max, "raising connection receive window");
        }
    }

    /// Bytes still sendable under the peer's connection window.
    pub(crate) fn conn_out_window(&self) -> u64 {
        self.out_data_max.saturating_sub(self.out_data)
    }

    // -----------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------

    pub(crate) fn arm_idle(&mut self, now: Instant) {
        let configured = Duration::from_millis(self.tp_in.idle_to);
        if configured.is_zero() {
            return;
        }
        let floor = 3 * self.rec.pto(self.peer_max_ack_delay());
        self.idle_t = Some(now + configured.max(floor));
    }

    pub(crate) fn peer_max_ack_delay(&self) -> Duration {
        Duration::from_millis(self.tp_out.max_ack_delay)
    }

    /// The closing/draining period: `3 * srtt + 4 * rttvar`.
    pub(crate) fn closing_period(&self) -> Duration {
        3 * self.rec.rtt.smoothed() + 4 * self.rec.rtt.var()
    }

    /// Earliest pending deadline across all timers.
    pub fn next_timeout(&self) -> Option<Instant> {
        let mut deadline: Option<Instant> = None;
        let mut fold = |t: Option<Instant>| {
            if let Some(t) = t {
                deadline = Some(deadline.map_or(t, |d| d.min(t)));
            }
        };
        fold(self.idle_t);
        fold(self.closing_t);
        fold(self.key_flip_t);
        for space in &self.spaces {
            if !space.abandoned {
                fold(space.ack_t);
            }
        }
        fold(
            self.rec
                .ld_alarm(&self.spaces, self.peer_max_ack_delay())
                .map(|(t, _)| t),
        );
        deadline
    }

    /// Fire whatever timers have expired at `now`.
    pub fn on_timeout(&mut self, now: Instant) {
        if self.state == ConnState::Closed {
            return;
        }

        if self.closing_t.is_some_and(|t| t <= now) {
            self.closing_t = None;
            // Draining entry already surfaced the peer's close.
            if self.state == ConnState::Closing {
                self.events.push_back(Event::Closed {
                    error: self.err.clone(),
                    peer_initiated: false,
                });
            }
            self.transition(ConnState::Closed);
            return;
        }

        if self.idle_t.is_some_and(|t| t <= now) {
            self.idle_t = None;
            info!("idle timeout");
            // The simple no-error case drops straight to closed.
            self.events.push_back(Event::Closed {
                error: None,
                peer_initiated: false,
            });
            self.transition(ConnState::Closed);
            return;
        }

        if self.key_flip_t.is_some_and(|t| t <= now) {
            self.key_flip_t = self
                .cfg
                .key_update_interval
                .map(|interval| now + interval);
            if self.state == ConnState::Established {
                if let Err(code) = self.flip_keys() {
                    self.err_close(code, 0, "key update failed");
                }
                // A key flip is also the voluntary-migration moment.
                self.do_migration = true;
                self.needs_tx = true;
            }
        }

        for space in &mut self.spaces {
            if space.ack_t.is_some_and(|t| t <= now) {
                space.imm_ack = true;
                self.needs_tx = true;
            }
        }

        if let Some((deadline, action)) = self.rec.ld_alarm(&self.spaces, self.peer_max_ack_delay())
        {
            if deadline <= now {
                self.rec.on_ld_timeout(action);
                match action {
                    LdAction::DetectLoss(space_id) => {
                        let space = &mut self.spaces[space_id.index()];
                        let lost = self.rec.detect_lost(space, now);
                        self.requeue_lost(space_id, lost);
                    }
                    LdAction::RetransmitCrypto => {
                        self.retransmit_unacked_crypto();
                    }
                    LdAction::SendProbe => {
                        self.probes_pending = 1;
                        self.needs_tx = true;
                    }
                }
            }
        }
    }

    /// Proactive key update: ratchet both directions one phase forward.
    pub(crate) fn flip_keys(&mut self) -> Result<()> {
        let slot = &mut self.keys[Epoch::Data as usize];
        let (Some(tx), Some(rx)) = (slot.tx.as_ref(), slot.rx.as_ref()) else {
            return Ok(());
        };
        let next_tx = tx.next_phase()?;
        let next_rx = rx.next_phase()?;
        self.prev_rx = slot.rx.replace(next_rx);
        slot.tx = Some(next_tx);
        self.key_phase = !self.key_phase;
        debug!(phase = self.key_phase, "key update");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Loss plumbing
    // -----------------------------------------------------------------

    /// Requeue the stream/crypto payloads of lost packets and remember the
    /// retransmission chain.
    pub(crate) fn requeue_lost(
        &mut self,
        space_id: PnSpaceId,
        lost: Vec<crate::packet::SentMeta>,
    ) {
        for meta in lost {
            if let Some(strm) = meta.strm {
                self.rtx_origins
                    .entry((strm.id.0, strm.offset))
                    .or_default()
                    .push(meta.nr);
                if strm.id.is_crypto() {
                    self.crypto_streams[space_id.index()]
                        .send
                        .on_lost(strm.offset, strm.len, strm.fin);
                } else if let Some(stream) = self.streams.get_mut(&strm.id.0) {
                    stream.send.on_lost(strm.offset, strm.len, strm.fin);
                }
                self.needs_tx = true;
            }
            // Control frames re-arm their owing flags.
            if meta.carries(crate::frames::types::FRAM_TYPE_MAX_DATA) {
                self.tx_max_data = true;
                self.needs_tx = true;
            }
            if meta.carries(crate::frames::types::FRAM_TYPE_NEW_CID) {
                self.cids.tx_ncid = true;
                self.needs_tx = true;
            }
            if meta.carries(crate::frames::types::FRAM_TYPE_PATH_CHLG) {
                if let Some(chlg) = self.path_chlg_pending {
                    self.path_chlg_out = Some(chlg);
                    self.needs_tx = true;
                }
            }
        }
    }

    /// Crypto retransmission timer fired: every unacked crypto-bearing
    /// packet is treated as lost.
    pub(crate) fn retransmit_unacked_crypto(&mut self) {
        for space_id in PnSpaceId::ALL {
            let space = &mut self.spaces[space_id.index()];
            if space.abandoned {
                continue;
            }
            let mut lost = Vec::new();
            for meta in space.sent.values_mut() {
                if meta.acked || meta.lost {
                    continue;
                }
                if meta.strm.is_some_and(|s| s.id.is_crypto()) {
                    meta.lost = true;
                    lost.push(meta.clone());
                }
            }
            for meta in &lost {
                if meta.in_flight {
                    self.rec.cc.on_packet_lost(meta.udp_len);
                }
            }
            self.requeue_lost(space_id, lost);
        }
    }

    // -----------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Whether the TX watcher should run for this connection.
    pub fn wants_tx(&self) -> bool {
        self.needs_tx
    }

    /// All scids the endpoint should route to this connection.
    pub fn local_cids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> =
            self.cids.scids.iter().map(|cid| cid.id.clone()).collect();
        if let Some(odcid) = &self.odcid {
            ids.push(odcid.clone());
        }
        ids
    }

    /// Peer-issued SRTs, for the endpoint's reset lookup table.
    pub fn peer_srts(&self) -> Vec<[u8; SRT_LEN]> {
        self.cids.peer_srts().copied().collect()
    }

    /// The pending-ACK ranges of a space (test and introspection hook).
    pub fn ack_ranges(&self, space: PnSpaceId) -> &RangeSet {
        &self.spaces[space.index()].recv
    }

    /// Whether a stream has readable bytes or an undelivered FIN.
    pub fn stream_has_data(&self, id: StreamId) -> bool {
        self.streams.get(&id.0).is_some_and(|stream| {
            stream.recv.queued_bytes() > 0
                || (stream.recv.fin_off() == Some(stream.recv.in_data_off())
                    && !stream.recv.is_finished())
        })
    }
}

impl Side {
    /// The peer-imposed initial send limit for one of our streams.
    fn stream_out_limit(self, peer: &TransportParams, id: StreamId) -> u64 {
        if id.is_bidi() {
            if id.initiated_by() == self {
                // Our bidi stream is "remote" from the peer's viewpoint.
                peer.max_strm_data_bidi_remote
            } else {
                peer.max_strm_data_bidi_local
            }
        } else {
            peer.max_strm_data_uni
        }
    }
}
