//! End-to-end connection tests: a client/server pair wired back to back
//! through the loopback TLS stub, exchanging real protected datagrams.

#![cfg(test)]

use super::*;
use crate::crypto::StubTls;
use crate::packet::header::{write_retry, write_version_negotiation};
use crate::packet::{Header, PacketType};
use crate::token::make_retry_token;
use crate::types::MIN_SRT_PKT_LEN;
use bytes::BytesMut;
use std::net::SocketAddr;

const ALPN: &[u8] = b"hq-29";

fn client_addr() -> SocketAddr {
    "10.0.0.1:5000".parse().unwrap()
}

fn server_addr() -> SocketAddr {
    "10.0.0.2:4433".parse().unwrap()
}

fn test_params(max_data: u64) -> TransportParams {
    TransportParams {
        idle_to: 30_000,
        max_data,
        max_strm_data_bidi_local: 1 << 16,
        max_strm_data_bidi_remote: 1 << 16,
        max_strm_data_uni: 1 << 15,
        max_strms_bidi: 8,
        max_strms_uni: 4,
        ..TransportParams::default()
    }
}

fn config(max_data: u64) -> ConnConfig {
    ConnConfig {
        tp: test_params(max_data),
        local_cid_len: 8,
        reset_key: [7; 32],
        key_update_interval: None,
        alpn: vec![ALPN.to_vec()],
        token: Vec::new(),
    }
}

fn stub(side: Side, alpn: Vec<Vec<u8>>) -> impl FnOnce(Vec<u8>) -> Box<dyn crate::crypto::TlsSession> {
    move |tp| Box::new(StubTls::new(side, tp, alpn)) as Box<dyn crate::crypto::TlsSession>
}

struct Pair {
    client: Connection,
    server: Connection,
    now: Instant,
}

impl Pair {
    /// A client plus the server its first Initial would reach.
    fn new(client_max_data: u64, server_max_data: u64) -> (Self, BytesMut) {
        let now = Instant::now();
        let client_cfg = config(client_max_data);
        let mut client = Connection::new_client(
            server_addr(),
            client_cfg,
            stub(Side::Client, vec![ALPN.to_vec()]),
            now,
        )
        .unwrap();

        let first = client.poll_transmit(now).expect("client first flight");
        assert_eq!(client.state(), ConnState::Opening);

        let hdr = Header::decode_beginning(&first.payload, 8).unwrap();
        assert_eq!(hdr.packet_type, PacketType::Initial);
        let server = Connection::new_server(
            client_addr(),
            hdr.dcid.clone(),
            hdr.scid.clone().unwrap(),
            hdr.version,
            config(server_max_data),
            stub(Side::Server, vec![ALPN.to_vec()]),
            now,
        )
        .unwrap();

        (
            Self {
                client,
                server,
                now,
            },
            first.payload,
        )
    }

    /// Ferry datagrams both ways until the pair quiesces. Time advances
    /// past the ACK delay every round so delayed ACKs drain too.
    fn drive(&mut self) {
        for _ in 0..32 {
            let mut progressed = false;
            for _ in 0..16 {
                let Some(out) = self.client.poll_transmit(self.now) else {
                    break;
                };
                let mut payload = out.payload;
                self.server
                    .on_datagram(self.now, client_addr(), &mut payload[..], false);
                progressed = true;
            }
            for _ in 0..16 {
                let Some(out) = self.server.poll_transmit(self.now) else {
                    break;
                };
                let mut payload = out.payload;
                self.client
                    .on_datagram(self.now, server_addr(), &mut payload[..], false);
                progressed = true;
            }
            self.now += Duration::from_millis(30);
            self.client.on_timeout(self.now);
            self.server.on_timeout(self.now);
            if !progressed
                && self.client.next_timeout().map_or(true, |t| t > self.now)
                && self.server.next_timeout().map_or(true, |t| t > self.now)
                && !self.client.wants_tx()
                && !self.server.wants_tx()
            {
                break;
            }
        }
    }

    fn handshake(client_max_data: u64, server_max_data: u64) -> Self {
        let (mut pair, mut first) = Self::new(client_max_data, server_max_data);
        pair.server
            .on_datagram(pair.now, client_addr(), &mut first[..], false);
        pair.drive();
        assert_eq!(pair.client.state(), ConnState::Established);
        assert_eq!(pair.server.state(), ConnState::Established);
        pair
    }

    fn drain_events(conn: &mut Connection) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = conn.poll_event() {
            events.push(event);
        }
        events
    }
}

/// Scenario: handshake with no application data. The opening Initial is
/// padded to exactly 1200 bytes; both endpoints reach Established with no
/// application streams.
#[test]
fn handshake_no_data() {
    let (mut pair, mut first) = Pair::new(1 << 20, 1 << 20);
    assert_eq!(first.len(), crate::types::MAX_DATAGRAM_SIZE);

    pair.server.on_datagram(pair.now, client_addr(), &mut first[..], false);
    pair.drive();

    assert_eq!(pair.client.state(), ConnState::Established);
    assert_eq!(pair.server.state(), ConnState::Established);
    assert_eq!(pair.client.alpn(), Some(ALPN));
    assert_eq!(pair.server.alpn(), Some(ALPN));
    assert!(pair.client.streams.is_empty());
    assert!(pair.server.streams.is_empty());
    let client_events = Pair::drain_events(&mut pair.client);
    assert!(client_events.contains(&Event::HandshakeComplete));
}

/// A bidirectional request/response across the pair, FIN both ways.
#[test]
fn request_response_round_trip() {
    let mut pair = Pair::handshake(1 << 20, 1 << 20);
    Pair::drain_events(&mut pair.client);
    Pair::drain_events(&mut pair.server);

    let id = pair.client.open_stream(true).unwrap();
    pair.client
        .stream_write(id, Bytes::from_static(b"GET /index.html\r\n"), true)
        .unwrap();
    pair.drive();

    let server_events = Pair::drain_events(&mut pair.server);
    assert!(server_events.contains(&Event::StreamOpened(id)));
    let (request, fin) = pair.server.stream_read(id, 4096).unwrap();
    assert_eq!(&request[..], b"GET /index.html\r\n");
    assert!(fin);

    pair.server
        .stream_write(id, Bytes::from_static(b"hello world\r\n"), true)
        .unwrap();
    pair.drive();

    let (response, fin) = pair.client.stream_read(id, 4096).unwrap();
    assert_eq!(&response[..], b"hello world\r\n");
    assert!(fin);
    pair.drive();
    // Both FINs acked: the stream is fully closed on both sides.
    assert!(pair.client.streams[&id.0].is_closed());
}

/// Scenario: connection-level flow control. 512 bytes fit a 1024-byte
/// window; 600 more are a FLOW_CONTROL_ERROR (0x3) close.
#[test]
fn flow_control_overrun_closes_connection() {
    let mut pair = Pair::handshake(1 << 20, 1024);
    let id = pair.client.open_stream(true).unwrap();
    pair.client
        .stream_write(id, Bytes::from(vec![0x61; 512]), false)
        .unwrap();
    pair.drive();
    let (data, _) = pair.server.stream_read(id, 4096).unwrap();
    assert_eq!(data.len(), 512);
    assert_eq!(pair.server.state(), ConnState::Established);

    // Ignore the peer's window and push 600 more bytes.
    pair.client.out_data_max = 1 << 20;
    if let Some(stream) = pair.client.streams.get_mut(&id.0) {
        stream.out_data_max = 1 << 20;
    }
    pair.client
        .stream_write(id, Bytes::from(vec![0x62; 600]), false)
        .unwrap();
    pair.drive();

    assert!(matches!(
        pair.server.state(),
        ConnState::Closing | ConnState::Closed
    ));
    let closed = Pair::drain_events(&mut pair.client)
        .into_iter()
        .find_map(|event| match event {
            Event::Closed { error: Some(err), peer_initiated: true } => Some(err),
            _ => None,
        })
        .expect("client saw the close");
    assert_eq!(closed.code, TransportError::FlowControl);
}

/// Scenario: the stream-level window is enforced independently.
#[test]
fn stream_flow_control_overrun() {
    let mut pair = Pair::handshake(1 << 20, 1 << 20);
    let id = pair.client.open_stream(true).unwrap();
    // Misbehave past the peer's 64 KiB stream window.
    pair.client.streams.get_mut(&id.0).unwrap().out_data_max = 1 << 20;
    pair.client
        .stream_write(id, Bytes::from(vec![0; (1 << 16) + 1]), false)
        .unwrap();
    pair.drive();
    assert!(matches!(
        pair.server.state(),
        ConnState::Closing | ConnState::Closed
    ));
}

/// Scenario: path migration. Data from a new client address triggers a
/// PATH_CHALLENGE toward it; the matching PATH_RESPONSE commits the peer.
#[test]
fn migration_validates_new_path() {
    let mut pair = Pair::handshake(1 << 20, 1 << 20);
    let new_addr: SocketAddr = "10.0.9.9:7777".parse().unwrap();

    let id = pair.client.open_stream(true).unwrap();
    pair.client
        .stream_write(id, Bytes::from_static(b"after rebind"), false)
        .unwrap();
    let out = pair.client.poll_transmit(pair.now).expect("data packet");
    let mut payload = out.payload;
    pair.server.on_datagram(pair.now, new_addr, &mut payload[..], false);

    assert_eq!(pair.server.migr_peer, Some(new_addr));
    let challenge = pair.server.poll_transmit(pair.now).expect("challenge");
    assert_eq!(challenge.dest, new_addr);

    let mut challenge_payload = challenge.payload;
    pair.client
        .on_datagram(pair.now, server_addr(), &mut challenge_payload[..], false);
    let response = pair.client.poll_transmit(pair.now).expect("response");
    let mut response_payload = response.payload;
    pair.server.on_datagram(pair.now, new_addr, &mut response_payload[..], false);

    assert_eq!(pair.server.peer_addr(), new_addr);
    assert!(Pair::drain_events(&mut pair.server)
        .contains(&Event::PathValidated(new_addr)));
}

/// Scenario: version negotiation resets the packet-number spaces and
/// restarts the handshake with the first mutually supported version.
#[test]
fn version_negotiation_restarts_handshake() {
    let (mut pair, first) = Pair::new(1 << 20, 1 << 20);
    drop(first); // the server never sees the original Initial
    assert!(
        pair.client.poll_transmit(pair.now).is_none(),
        "nothing new before any response"
    );

    let mut vn = BytesMut::new();
    write_version_negotiation(
        &ConnectionId::from_slice(&[1; 8]).unwrap(),
        &ConnectionId::from_slice(&[2; 8]).unwrap(),
        &[GREASE_VERSION, SUPPORTED_VERSIONS[1]],
        &mut vn,
    );
    pair.client.on_datagram(pair.now, server_addr(), &mut vn[..], false);

    assert_eq!(pair.client.vers, SUPPORTED_VERSIONS[1]);
    assert_eq!(pair.client.spaces[0].lg_sent, None);

    let restart = pair.client.poll_transmit(pair.now).expect("new initial");
    assert_eq!(restart.payload.len(), crate::types::MAX_DATAGRAM_SIZE);
    let hdr = Header::decode_beginning(&restart.payload, 8).unwrap();
    assert_eq!(hdr.version, SUPPORTED_VERSIONS[1]);
    assert_eq!(hdr.packet_type, PacketType::Initial);
}

/// A spurious VN after the version already changed is dropped.
#[test]
fn spurious_version_negotiation_is_dropped() {
    let mut pair = Pair::handshake(1 << 20, 1 << 20);
    let mut vn = BytesMut::new();
    write_version_negotiation(
        &ConnectionId::from_slice(&[1; 8]).unwrap(),
        &ConnectionId::from_slice(&[2; 8]).unwrap(),
        &[SUPPORTED_VERSIONS[1]],
        &mut vn,
    );
    pair.client.on_datagram(pair.now, server_addr(), &mut vn[..], false);
    assert_eq!(pair.client.state(), ConnState::Established);
    assert_eq!(pair.client.vers, SUPPORTED_VERSIONS[0]);
}

/// Scenario: Retry. The client adopts the token and the new server CID and
/// re-sends its Initial; the token verifies against the issuing secret.
#[test]
fn retry_token_round_trip() {
    let (mut pair, _first) = Pair::new(1 << 20, 1 << 20);
    let secret = b"server-retry-secret";
    let new_scid = ConnectionId::from_slice(&[0xab; 8]).unwrap();
    let token = make_retry_token(secret, &client_addr(), &new_scid);

    let mut retry = BytesMut::new();
    write_retry(
        pair.client.vers,
        &ConnectionId::from_slice(&[3; 8]).unwrap(),
        &new_scid,
        pair.client.cids.active_dcid().unwrap(),
        &token,
        &mut retry,
    );
    pair.client.on_datagram(pair.now, server_addr(), &mut retry[..], false);
    assert!(pair.client.did_retry);
    assert_eq!(pair.client.tok, token);

    let second = pair.client.poll_transmit(pair.now).expect("retried initial");
    let hdr = Header::decode_beginning(&second.payload, 8).unwrap();
    assert_eq!(hdr.packet_type, PacketType::Initial);
    assert_eq!(&hdr.token[..], &token[..]);
    assert_eq!(hdr.dcid, new_scid);
    assert_eq!(
        crate::token::verify_retry_token(secret, &client_addr(), &hdr.token),
        Some(new_scid)
    );

    // A second Retry is ignored.
    let mut again = BytesMut::new();
    write_retry(
        pair.client.vers,
        &ConnectionId::from_slice(&[4; 8]).unwrap(),
        &ConnectionId::from_slice(&[5; 8]).unwrap(),
        pair.client.cids.active_dcid().unwrap(),
        b"other",
        &mut again,
    );
    pair.client.on_datagram(pair.now, server_addr(), &mut again[..], false);
    assert_eq!(pair.client.tok, token);
}

/// A short datagram whose trailing 16 bytes match a known SRT drains the
/// connection without keys.
#[test]
fn stateless_reset_detection() {
    let mut pair = Pair::handshake(1 << 20, 1 << 20);
    let srt = *pair
        .client
        .peer_srts()
        .first()
        .expect("server advertised an SRT in its parameters");

    let mut reset = BytesMut::new();
    reset.extend_from_slice(&[0x40]);
    reset.extend_from_slice(&vec![0u8; MIN_SRT_PKT_LEN + 8]);
    let tail = reset.len() - srt.len();
    reset[tail..].copy_from_slice(&srt);

    pair.client.on_datagram(pair.now, server_addr(), &mut reset[..], false);
    assert_eq!(pair.client.state(), ConnState::Draining);
    pair.client.on_timeout(pair.now);
    assert_eq!(pair.client.state(), ConnState::Closed);
}

/// Local application close reaches the peer as an application
/// CONNECTION_CLOSE; the closer passes through Closing into Closed on the
/// 3-PTO timer.
#[test]
fn clean_close_exchange() {
    let mut pair = Pair::handshake(1 << 20, 1 << 20);
    Pair::drain_events(&mut pair.client);
    Pair::drain_events(&mut pair.server);

    pair.client.close(42, "done");
    assert_eq!(pair.client.state(), ConnState::QueueClose);
    let out = pair.client.poll_transmit(pair.now).expect("close packet");
    assert_eq!(pair.client.state(), ConnState::Closing);
    let mut close_payload = out.payload;
    pair.server.on_datagram(pair.now, client_addr(), &mut close_payload[..], false);
    assert_eq!(pair.server.state(), ConnState::Draining);
    let closed = Pair::drain_events(&mut pair.server)
        .into_iter()
        .find_map(|event| match event {
            Event::Closed { error: Some(err), peer_initiated: true } => Some(err),
            _ => None,
        })
        .expect("server saw the close");
    assert!(closed.application);
    assert_eq!(closed.app_code, 42);

    // Timers run both sides down to Closed.
    pair.now += Duration::from_secs(10);
    pair.client.on_timeout(pair.now);
    pair.server.on_timeout(pair.now);
    assert_eq!(pair.client.state(), ConnState::Closed);
    assert_eq!(pair.server.state(), ConnState::Closed);
}

/// Proactive key update: the phase flips and the peer follows along
/// without losing data.
#[test]
fn key_update_keeps_the_pipe_alive() {
    let mut pair = Pair::handshake(1 << 20, 1 << 20);
    let phase_before = pair.server.key_phase;

    pair.client.flip_keys().unwrap();
    assert_ne!(pair.client.key_phase, phase_before);

    let id = pair.client.open_stream(true).unwrap();
    pair.client
        .stream_write(id, Bytes::from_static(b"post-flip data"), true)
        .unwrap();
    pair.drive();

    let (data, fin) = pair.server.stream_read(id, 4096).unwrap();
    assert_eq!(&data[..], b"post-flip data");
    assert!(fin);
    assert_eq!(pair.server.key_phase, pair.client.key_phase);
}

/// Idle timeout closes the connection outright.
#[test]
fn idle_timeout_closes() {
    let mut pair = Pair::handshake(1 << 20, 1 << 20);
    pair.now += Duration::from_secs(60);
    pair.client.on_timeout(pair.now);
    assert_eq!(pair.client.state(), ConnState::Closed);
    assert!(Pair::drain_events(&mut pair.client)
        .iter()
        .any(|event| matches!(event, Event::Closed { .. })));
}

/// Stream-id ceilings are fatal when crossed by the peer.
#[test]
fn stream_id_above_ceiling_is_fatal() {
    let mut pair = Pair::handshake(1 << 20, 1 << 20);
    // Stream ordinal 8 is one past the advertised limit of 8.
    pair.client.next_strm_ord_bidi = 8;
    pair.client.peer_max_strms_bidi = 64; // client believes it may
    let id = pair.client.open_stream(true).unwrap();
    pair.client
        .stream_write(id, Bytes::from_static(b"x"), false)
        .unwrap();
    pair.drive();
    assert!(matches!(
        pair.server.state(),
        ConnState::Closing | ConnState::Closed
    ));
}

/// Exhausting the stream-id allowance raises STREAMS_BLOCKED and the peer
/// answers with a wider MAX_STREAMS.
#[test]
fn streams_blocked_triggers_grant() {
    let mut pair = Pair::handshake(1 << 20, 1 << 20);
    for _ in 0..8 {
        pair.client.open_stream(true).unwrap();
    }
    assert!(pair.client.open_stream(true).is_err());
    assert!(pair.client.sid_blocked_bidi);
    // The server re-announces only when its limit is actually higher.
    pair.server.local_max_strms_bidi = 16;
    pair.drive();
    assert!(pair.client.peer_max_strms_bidi >= 16);
    assert!(pair.client.open_stream(true).is_ok());
}
