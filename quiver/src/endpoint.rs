//! The endpoint: UDP run loop, connection lookup, timer dispatch and the
//! blocking API surface (`connect`, `accept`, `read_stream`, `ready`).
//!
//! Single-threaded cooperative scheduling: everything runs on one
//! current-thread tokio runtime. The only suspension points are the socket
//! receive and the timer sleep; each blocking API call enters the run loop
//! until its completion condition holds or its deadline passes.

use crate::config::Config;
use crate::pool::BufferPool;
use crate::timer::TimerWheel;
use anyhow::{anyhow, bail, Context, Result};
use bytes::{Bytes, BytesMut};
use quiver_quic::crypto::{StubTls, TlsSession};
use quiver_quic::packet::header::{write_retry, write_version_negotiation};
use quiver_quic::packet::{Header, PacketType};
use quiver_quic::token::{make_retry_token, stateless_reset_token, verify_retry_token};
use quiver_quic::types::{MIN_SRT_PKT_LEN, SRT_LEN};
use quiver_quic::{
    ConnConfig, Connection, ConnectionId, Event, Side, StreamId, MAX_DATAGRAM_SIZE,
    GREASE_VERSION, SUPPORTED_VERSIONS,
};
use rand::RngCore;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

/// Builds a TLS session for a new connection:
/// `(side, alpn, encoded transport params) -> session`.
pub type TlsFactory =
    Arc<dyn Fn(Side, Vec<Vec<u8>>, Vec<u8>) -> Box<dyn TlsSession> + Send + Sync>;

/// Generation-counted connection handle; never a raw alias, so a handle
/// held across a close cannot reach a recycled slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnHandle {
    pub(crate) idx: u32,
    pub(crate) gen: u32,
}

struct Slot {
    conn: Connection,
    gen: u32,
}

pub struct Endpoint {
    rt: tokio::runtime::Runtime,
    inner: Inner,
}

struct Inner {
    socket: UdpSocket,
    cfg: Config,
    side: Side,
    reset_key: [u8; 32],
    token_secret: [u8; 32],
    tls_factory: TlsFactory,
    conns: Vec<Option<Slot>>,
    next_gen: u32,
    by_cid: HashMap<Vec<u8>, ConnHandle>,
    by_addr: HashMap<SocketAddr, ConnHandle>,
    by_srt: HashMap<[u8; SRT_LEN], ConnHandle>,
    pool: BufferPool,
    wheel: TimerWheel,
    accept_queue: VecDeque<ConnHandle>,
    ready: VecDeque<(ConnHandle, Event)>,
}

impl Endpoint {
    /// A client endpoint bound to an ephemeral local port.
    pub fn client(cfg: Config) -> Result<Self> {
        Self::bind(cfg, Side::Client, "0.0.0.0:0".parse().unwrap())
    }

    /// A server endpoint listening on `addr`.
    pub fn server(cfg: Config, addr: SocketAddr) -> Result<Self> {
        Self::bind(cfg, Side::Server, addr)
    }

    fn bind(cfg: Config, side: Side, addr: SocketAddr) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("building runtime")?;
        let socket = rt
            .block_on(UdpSocket::bind(addr))
            .with_context(|| format!("binding {addr}"))?;
        info!(local = %socket.local_addr()?, ?side, "endpoint up");

        let mut reset_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut reset_key);
        let mut token_secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token_secret);

        let pool = BufferPool::new(cfg.num_bufs, cfg.buf_len);
        Ok(Self {
            rt,
            inner: Inner {
                socket,
                cfg,
                side,
                reset_key,
                token_secret,
                tls_factory: Arc::new(|side, alpn, tp| {
                    Box::new(StubTls::new(side, tp, alpn)) as Box<dyn TlsSession>
                }),
                conns: Vec::new(),
                next_gen: 1,
                by_cid: HashMap::new(),
                by_addr: HashMap::new(),
                by_srt: HashMap::new(),
                pool,
                wheel: TimerWheel::new(),
                accept_queue: VecDeque::new(),
                ready: VecDeque::new(),
            },
        })
    }

    /// Replace the TLS provider (the default is the loopback stub).
    pub fn set_tls_factory(&mut self, factory: TlsFactory) {
        self.inner.tls_factory = factory;
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    // -----------------------------------------------------------------
    // Blocking API
    // -----------------------------------------------------------------

    /// Open a connection and run the loop until the handshake completes.
    pub fn connect(&mut self, server: SocketAddr, timeout: Duration) -> Result<ConnHandle> {
        let now = Instant::now();
        let conn_cfg = self.inner.conn_config();
        let factory = self.inner.tls_factory.clone();
        let alpn = self.inner.cfg.alpn_bytes();
        let conn = Connection::new_client(
            server,
            conn_cfg,
            move |tp| factory(Side::Client, alpn, tp),
            now,
        )
        .map_err(|code| anyhow!("connection setup: {code}"))?;
        let handle = self.inner.install(conn);
        self.inner.post_process(handle);

        let deadline = now + timeout;
        let done = self.rt.block_on(self.inner.drive_until(Some(deadline), |inner| {
            inner
                .conn(handle)
                .map_or(true, |conn| conn.is_established() || conn.is_closed())
        }))?;
        match self.inner.conn(handle) {
            Some(conn) if conn.is_established() => Ok(handle),
            _ if !done => bail!("connect timed out"),
            _ => bail!("connection failed during handshake"),
        }
    }

    /// Wait for an inbound connection to finish its handshake.
    pub fn accept(&mut self, timeout: Option<Duration>) -> Result<Option<ConnHandle>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.rt.block_on(
            self.inner
                .drive_until(deadline, |inner| !inner.accept_queue.is_empty()),
        )?;
        Ok(self.inner.accept_queue.pop_front())
    }

    /// Wait for the next event on any connection.
    pub fn ready(&mut self, timeout: Option<Duration>) -> Result<Option<(ConnHandle, Event)>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.rt.block_on(
            self.inner
                .drive_until(deadline, |inner| !inner.ready.is_empty()),
        )?;
        Ok(self.inner.ready.pop_front())
    }

    /// Read from a stream, entering the loop until data (or the FIN)
    /// arrives or the deadline passes.
    pub fn read_stream(
        &mut self,
        handle: ConnHandle,
        stream: StreamId,
        max_len: usize,
        timeout: Option<Duration>,
    ) -> Result<Option<(Bytes, bool)>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(conn) = self.inner.conn_mut(handle) {
                if let Some(result) = conn.stream_read(stream, max_len) {
                    self.inner.post_process(handle);
                    return Ok(Some(result));
                }
                if conn.is_closed() {
                    return Ok(None);
                }
            } else {
                return Ok(None);
            }
            let progressed = self.rt.block_on(self.inner.drive_until(deadline, |inner| {
                inner.conn(handle).map_or(true, |conn| {
                    conn.is_closed() || conn.stream_has_data(stream)
                })
            }))?;
            if !progressed {
                return Ok(None); // timed out, empty result
            }
        }
    }

    /// Open a stream on an established connection.
    pub fn open_stream(&mut self, handle: ConnHandle, bidi: bool) -> Result<StreamId> {
        let conn = self
            .inner
            .conn_mut(handle)
            .ok_or_else(|| anyhow!("connection gone"))?;
        let id = conn
            .open_stream(bidi)
            .map_err(|code| anyhow!("open stream: {code}"))?;
        Ok(id)
    }

    /// Write to a stream and flush whatever becomes sendable.
    pub fn stream_write(
        &mut self,
        handle: ConnHandle,
        stream: StreamId,
        data: Bytes,
        fin: bool,
    ) -> Result<()> {
        let conn = self
            .inner
            .conn_mut(handle)
            .ok_or_else(|| anyhow!("connection gone"))?;
        conn.stream_write(stream, data, fin)
            .map_err(|code| anyhow!("stream write: {code}"))?;
        self.rt.block_on(self.inner.flush_tx())?;
        Ok(())
    }

    /// Close a connection (application code + reason) and flush the close.
    pub fn close(&mut self, handle: ConnHandle, app_code: u64, reason: &str) -> Result<()> {
        if let Some(conn) = self.inner.conn_mut(handle) {
            conn.close(app_code, reason);
            self.rt.block_on(self.inner.flush_tx())?;
            self.inner.post_process(handle);
        }
        Ok(())
    }

    /// Drive the loop once without waiting (test and shutdown hook).
    pub fn poll(&mut self) -> Result<()> {
        let deadline = Instant::now();
        self.rt
            .block_on(self.inner.drive_until(Some(deadline), |_| false))?;
        Ok(())
    }
}

impl Inner {
    fn conn_config(&self) -> ConnConfig {
        ConnConfig {
            tp: self.cfg.transport_params(),
            local_cid_len: self.cfg.cid_len,
            reset_key: self.reset_key,
            key_update_interval: (self.cfg.key_update_interval_ms > 0)
                .then(|| Duration::from_millis(self.cfg.key_update_interval_ms)),
            alpn: self.cfg.alpn_bytes(),
            token: Vec::new(),
        }
    }

    fn conn(&self, handle: ConnHandle) -> Option<&Connection> {
        self.conns
            .get(handle.idx as usize)?
            .as_ref()
            .filter(|slot| slot.gen == handle.gen)
            .map(|slot| &slot.conn)
    }

    fn conn_mut(&mut self, handle: ConnHandle) -> Option<&mut Connection> {
        self.conns
            .get_mut(handle.idx as usize)?
            .as_mut()
            .filter(|slot| slot.gen == handle.gen)
            .map(|slot| &mut slot.conn)
    }

    fn install(&mut self, conn: Connection) -> ConnHandle {
        let gen = self.next_gen;
        self.next_gen += 1;
        let idx = self
            .conns
            .iter()
            .position(Option::is_none)
            .unwrap_or_else(|| {
                self.conns.push(None);
                self.conns.len() - 1
            });
        self.conns[idx] = Some(Slot { conn, gen });
        ConnHandle {
            idx: idx as u32,
            gen,
        }
    }

    /// One pass of the run loop body: fire timers, receive a batch,
    /// dispatch, transmit.
    async fn drive_until<F>(&mut self, deadline: Option<Instant>, mut done: F) -> Result<bool>
    where
        F: FnMut(&Inner) -> bool,
    {
        loop {
            self.flush_tx().await?;
            if done(self) {
                return Ok(true);
            }
            let now = Instant::now();
            if deadline.is_some_and(|d| d <= now) {
                return Ok(false);
            }

            // Earliest wakeup: the timer wheel or the caller's deadline.
            let mut wake = self.wheel.next_deadline();
            if let Some(d) = deadline {
                wake = Some(wake.map_or(d, |w| w.min(d)));
            }

            let Some(mut buf) = self.pool.get() else {
                // Out of buffers: let timers run, then retry.
                tokio::time::sleep(Duration::from_millis(1)).await;
                self.fire_timers(Instant::now());
                continue;
            };

            let received = match wake {
                Some(wake_at) => {
                    tokio::select! {
                        res = self.socket.recv_from(&mut buf) => Some(res),
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake_at)) => None,
                    }
                }
                None => Some(self.socket.recv_from(&mut buf).await),
            };

            let now = Instant::now();
            match received {
                Some(Ok((len, from))) => {
                    buf.truncate(len);
                    self.dispatch(now, from, &mut buf).await?;
                    buf.clear();
                    self.pool.put(buf);
                }
                Some(Err(err)) => {
                    self.pool.put(buf);
                    warn!(%err, "socket receive error");
                }
                None => {
                    self.pool.put(buf);
                }
            }
            self.fire_timers(now);
        }
    }

    fn fire_timers(&mut self, now: Instant) {
        for handle in self.wheel.expired(now) {
            if let Some(conn) = self.conn_mut(handle) {
                conn.on_timeout(now);
            }
            self.post_process(handle);
        }
    }

    /// Route one datagram to its connection, creating or answering as the
    /// header demands.
    async fn dispatch(
        &mut self,
        now: Instant,
        from: SocketAddr,
        datagram: &mut BytesMut,
    ) -> Result<()> {
        if datagram.is_empty() {
            return Ok(());
        }
        let hdr = match Header::decode_beginning(datagram, self.cfg.cid_len) {
            Ok(hdr) => hdr,
            Err(err) => {
                trace!(%err, "undecodable datagram");
                return Ok(());
            }
        };

        // Lookup order: dcid, then source address, then reset token.
        let handle = self
            .by_cid
            .get(hdr.dcid.as_bytes())
            .or_else(|| self.by_addr.get(&from))
            .or_else(|| {
                (datagram.len() >= MIN_SRT_PKT_LEN)
                    .then(|| {
                        let tail: &[u8; SRT_LEN] =
                            datagram[datagram.len() - SRT_LEN..].try_into().ok()?;
                        self.by_srt.get(tail)
                    })
                    .flatten()
            })
            .copied();

        if let Some(handle) = handle {
            if let Some(conn) = self.conn_mut(handle) {
                conn.on_datagram(now, from, &mut datagram[..], false);
            }
            self.post_process(handle);
            return Ok(());
        }

        // No connection. Servers may mint one, negotiate versions, retry,
        // or fire a stateless reset.
        if self.side == Side::Server && hdr.packet_type == PacketType::Initial {
            self.on_unknown_initial(now, from, hdr, datagram).await
        } else if hdr.packet_type == PacketType::Short
            && datagram.len() >= MIN_SRT_PKT_LEN
        {
            self.send_stateless_reset(from, &hdr.dcid, datagram.len()).await
        } else {
            trace!(%from, "datagram for unknown connection dropped");
            Ok(())
        }
    }

    async fn on_unknown_initial(
        &mut self,
        now: Instant,
        from: SocketAddr,
        hdr: Header,
        datagram: &mut BytesMut,
    ) -> Result<()> {
        if datagram.len() < MAX_DATAGRAM_SIZE {
            debug!(datagram_len = datagram.len(), "underfilled client initial dropped");
            return Ok(());
        }
        if !SUPPORTED_VERSIONS.contains(&hdr.version) {
            return self.send_version_negotiation(from, &hdr).await;
        }

        if self.cfg.force_retry {
            if hdr.token.is_empty() {
                return self.send_retry(from, &hdr).await;
            }
            // The token must verify AND name the dcid the client adopted.
            match verify_retry_token(&self.token_secret, &from, &hdr.token) {
                Some(bound) if bound == hdr.dcid => {}
                _ => {
                    warn!(%from, "retry token verification failed");
                    return Ok(());
                }
            }
        }

        let scid = hdr.scid.clone().ok_or_else(|| anyhow!("initial without scid"))?;
        let conn_cfg = self.conn_config();
        let factory = self.tls_factory.clone();
        let alpn = self.cfg.alpn_bytes();
        let conn = match Connection::new_server(
            from,
            hdr.dcid.clone(),
            scid,
            hdr.version,
            conn_cfg,
            move |tp| factory(Side::Server, alpn, tp),
            now,
        ) {
            Ok(conn) => conn,
            Err(code) => {
                warn!(?code, "server connection setup failed");
                return Ok(());
            }
        };
        info!(%from, odcid = %hdr.dcid, "new inbound connection");
        let handle = self.install(conn);
        // The triggering Initial is the connection's first input.
        if let Some(conn) = self.conn_mut(handle) {
            conn.on_datagram(now, from, &mut datagram[..], false);
        }
        self.post_process(handle);
        Ok(())
    }

    async fn send_version_negotiation(&mut self, to: SocketAddr, hdr: &Header) -> Result<()> {
        let mut out = BytesMut::new();
        let scid = hdr.scid.clone().unwrap_or_else(ConnectionId::empty);
        let mut versions = SUPPORTED_VERSIONS.to_vec();
        versions.push(GREASE_VERSION);
        // Swap the CIDs back at the sender.
        write_version_negotiation(&scid, &hdr.dcid, &versions, &mut out);
        debug!(%to, offered = hdr.version, "sending version negotiation");
        self.socket.send_to(&out, to).await?;
        Ok(())
    }

    async fn send_retry(&mut self, to: SocketAddr, hdr: &Header) -> Result<()> {
        // The token binds the fresh scid the client must switch to.
        let mut scid_bytes = vec![0u8; self.cfg.cid_len.max(8)];
        rand::thread_rng().fill_bytes(&mut scid_bytes);
        let scid = ConnectionId::from_slice(&scid_bytes).expect("within bounds");
        let token = make_retry_token(&self.token_secret, &to, &scid);

        let mut out = BytesMut::new();
        let client_scid = hdr.scid.clone().unwrap_or_else(ConnectionId::empty);
        write_retry(hdr.version, &client_scid, &scid, &hdr.dcid, &token, &mut out);
        debug!(%to, "sending retry");
        self.socket.send_to(&out, to).await?;
        Ok(())
    }

    async fn send_stateless_reset(
        &mut self,
        to: SocketAddr,
        dcid: &ConnectionId,
        rx_len: usize,
    ) -> Result<()> {
        let srt = stateless_reset_token(&self.reset_key, dcid);
        let mut out = BytesMut::new();
        out.resize(MIN_SRT_PKT_LEN + 7, 0);
        if out.len() >= rx_len {
            // Never reset a reset; keep responses strictly smaller than
            // what provoked them so two endpoints cannot ping-pong.
            return Ok(());
        }
        rand::thread_rng().fill_bytes(&mut out);
        out[0] = (out[0] & 0x3f) | 0x40; // plausible short header
        let tail = out.len() - SRT_LEN;
        out[tail..].copy_from_slice(&srt);
        debug!(%to, "sending stateless reset");
        self.socket.send_to(&out, to).await?;
        Ok(())
    }

    /// Send everything every connection wants to send.
    async fn flush_tx(&mut self) -> Result<()> {
        let handles: Vec<ConnHandle> = self
            .conns
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| {
                let slot = slot.as_ref()?;
                slot.conn.wants_tx().then_some(ConnHandle {
                    idx: idx as u32,
                    gen: slot.gen,
                })
            })
            .collect();
        for handle in handles {
            loop {
                let Some(out) = self
                    .conn_mut(handle)
                    .and_then(|conn| conn.poll_transmit(Instant::now()))
                else {
                    break;
                };
                trace!(dest = %out.dest, len = out.payload.len(), "tx datagram");
                self.socket.send_to(&out.payload, out.dest).await?;
            }
            self.post_process(handle);
        }
        Ok(())
    }

    /// After any activity on a connection: drain events, refresh lookup
    /// maps, re-arm its timer, and reap it once closed.
    fn post_process(&mut self, handle: ConnHandle) {
        let Some(slot) = self
            .conns
            .get_mut(handle.idx as usize)
            .and_then(Option::as_mut)
        else {
            return;
        };
        if slot.gen != handle.gen {
            return;
        }
        let conn = &mut slot.conn;

        while let Some(event) = conn.poll_event() {
            if matches!(event, Event::HandshakeComplete) && conn.side().is_server() {
                self.accept_queue.push_back(handle);
            }
            self.ready.push_back((handle, event));
        }

        for cid in conn.local_cids() {
            if !cid.is_empty() {
                self.by_cid.entry(cid.as_bytes().to_vec()).or_insert(handle);
            }
        }
        for srt in conn.peer_srts() {
            self.by_srt.entry(srt).or_insert(handle);
        }
        self.by_addr.insert(conn.peer_addr(), handle);
        if let Some(deadline) = conn.next_timeout() {
            self.wheel.arm(deadline, handle);
        }

        if conn.is_closed() {
            debug!(?handle, "reaping closed connection");
            let cids: Vec<Vec<u8>> = conn
                .local_cids()
                .iter()
                .map(|cid| cid.as_bytes().to_vec())
                .collect();
            let srts = conn.peer_srts();
            let peer = conn.peer_addr();
            for cid in cids {
                self.by_cid.remove(&cid);
            }
            for srt in srts {
                self.by_srt.remove(&srt);
            }
            if self.by_addr.get(&peer) == Some(&handle) {
                self.by_addr.remove(&peer);
            }
            self.conns[handle.idx as usize] = None;
        }
    }
}
