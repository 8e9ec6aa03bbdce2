//! The TLS adapter contract.
//!
//! The connection hands the TLS library opaque CRYPTO-stream bytes per
//! epoch and receives per-step progress: handshake bytes to transmit per
//! epoch, traffic-secret installs, the negotiated ALPN, the peer's
//! transport parameters, and completion or an alert.
//!
//! The crate does not implement TLS 1.3. [`StubTls`] is a deterministic
//! loopback handshake with the same shape, used by tests and in-process
//! demos; a real deployment plugs an external library in behind
//! [`TlsSession`].

use crate::error::{Result, TransportError};
use crate::types::{Epoch, Side};
use ring::digest;

/// A traffic-secret install instruction emitted by the TLS library.
#[derive(Debug, Clone)]
pub struct KeyInstall {
    /// True for the encryption (TX) direction.
    pub is_enc: bool,
    pub epoch: Epoch,
    pub secret: Vec<u8>,
}

/// Output of one handshake step.
#[derive(Debug, Default)]
pub struct TlsProgress {
    /// Handshake bytes to transmit, per epoch.
    pub outputs: [Vec<u8>; Epoch::COUNT],
    pub key_installs: Vec<KeyInstall>,
    /// Set once the handshake has fully completed on this side.
    pub handshake_complete: bool,
    /// The peer's raw transport-parameter extension, once seen.
    pub peer_transport_params: Option<Vec<u8>>,
    /// The negotiated ALPN identifier, once chosen.
    pub alpn: Option<Vec<u8>>,
}

impl TlsProgress {
    pub fn merge(&mut self, other: TlsProgress) {
        for (mine, theirs) in self.outputs.iter_mut().zip(other.outputs) {
            mine.extend(theirs);
        }
        self.key_installs.extend(other.key_installs);
        self.handshake_complete |= other.handshake_complete;
        if other.peer_transport_params.is_some() {
            self.peer_transport_params = other.peer_transport_params;
        }
        if other.alpn.is_some() {
            self.alpn = other.alpn;
        }
    }
}

/// The handshake interface the connection drives.
///
/// Errors map to CONNECTION_CLOSE with code `0x100 | alert`.
pub trait TlsSession: Send {
    /// Produce the client's first flight. No-op for servers.
    fn start(&mut self) -> Result<TlsProgress>;

    /// Feed ordered CRYPTO bytes received at `epoch`.
    fn on_crypto(&mut self, epoch: Epoch, data: &[u8]) -> Result<TlsProgress>;
}

// ---------------------------------------------------------------------------
// Stub handshake
// ---------------------------------------------------------------------------

const MSG_CLIENT_HELLO: u8 = 1;
const MSG_SERVER_HELLO: u8 = 2;
const MSG_SERVER_FINISHED: u8 = 3;
const MSG_CLIENT_FINISHED: u8 = 4;

/// TLS alert no_application_protocol.
const ALERT_NO_ALPN: u8 = 120;
/// TLS alert decode_error.
const ALERT_DECODE: u8 = 50;
/// TLS alert unexpected_message.
const ALERT_UNEXPECTED: u8 = 10;

/// A deterministic four-flight loopback handshake.
///
/// Messages are `tag(1) || len(2) || body`. Traffic secrets are digests of
/// the transcript, so two [`StubTls`] instances converge on identical keys
/// without any cryptography worth the name. Not a security boundary.
pub struct StubTls {
    side: Side,
    /// Local transport parameters, carried in the hello body.
    transport_params: Vec<u8>,
    /// Client: offered ALPN list. Server: supported set (the ALPN list is
    /// closed; offers outside it fail the handshake).
    alpn: Vec<Vec<u8>>,
    /// Per-epoch reassembly of incoming messages.
    inbox: [Vec<u8>; Epoch::COUNT],
    client_hello: Vec<u8>,
    server_hello: Vec<u8>,
}

impl StubTls {
    pub fn new(side: Side, transport_params: Vec<u8>, alpn: Vec<Vec<u8>>) -> Self {
        Self {
            side,
            transport_params,
            alpn,
            inbox: Default::default(),
            client_hello: Vec::new(),
            server_hello: Vec::new(),
        }
    }

    fn hello_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(self.transport_params.len() as u16).to_be_bytes());
        body.extend_from_slice(&self.transport_params);
        body.push(self.alpn.len() as u8);
        for proto in &self.alpn {
            body.push(proto.len() as u8);
            body.extend_from_slice(proto);
        }
        body
    }

    fn msg(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + body.len());
        out.push(tag);
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    fn secret(&self, label: &str, include_server_hello: bool) -> Vec<u8> {
        let mut ctx = digest::Context::new(&digest::SHA256);
        ctx.update(label.as_bytes());
        ctx.update(&self.client_hello);
        if include_server_hello {
            ctx.update(&self.server_hello);
        }
        ctx.finish().as_ref().to_vec()
    }

    fn installs(&self, epoch: Epoch, with_server_hello: bool) -> Vec<KeyInstall> {
        let (enc_label, dec_label) = match (self.side, epoch) {
            (Side::Client, Epoch::Handshake) => ("hs client", "hs server"),
            (Side::Server, Epoch::Handshake) => ("hs server", "hs client"),
            (Side::Client, Epoch::Data) => ("ap client", "ap server"),
            (Side::Server, Epoch::Data) => ("ap server", "ap client"),
            _ => unreachable!("stub installs only handshake and data keys"),
        };
        vec![
            KeyInstall {
                is_enc: true,
                epoch,
                secret: self.secret(enc_label, with_server_hello),
            },
            KeyInstall {
                is_enc: false,
                epoch,
                secret: self.secret(dec_label, with_server_hello),
            },
        ]
    }

    /// Parse a hello body into (transport_params, alpn list).
    fn parse_hello(body: &[u8]) -> Result<(Vec<u8>, Vec<Vec<u8>>)> {
        let decode_err = TransportError::Tls(ALERT_DECODE);
        if body.len() < 2 {
            return Err(decode_err);
        }
        let tp_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        let mut rest = body.get(2..).ok_or(decode_err)?;
        let tp = rest.get(..tp_len).ok_or(decode_err)?.to_vec();
        rest = &rest[tp_len..];
        let (&count, mut rest) = rest.split_first().ok_or(decode_err)?;
        let mut alpn = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (&len, tail) = rest.split_first().ok_or(decode_err)?;
            alpn.push(tail.get(..len as usize).ok_or(decode_err)?.to_vec());
            rest = &tail[len as usize..];
        }
        Ok((tp, alpn))
    }

    fn handle_msg(&mut self, epoch: Epoch, tag: u8, body: &[u8]) -> Result<TlsProgress> {
        let mut progress = TlsProgress::default();
        match (self.side, epoch, tag) {
            (Side::Server, Epoch::Initial, MSG_CLIENT_HELLO) => {
                self.client_hello = body.to_vec();
                let (peer_tp, offered) = Self::parse_hello(body)?;
                let chosen = offered
                    .iter()
                    .find(|proto| self.alpn.contains(proto))
                    .cloned()
                    .ok_or(TransportError::Tls(ALERT_NO_ALPN))?;

                let mut hello = Vec::new();
                hello.extend_from_slice(&(self.transport_params.len() as u16).to_be_bytes());
                hello.extend_from_slice(&self.transport_params);
                hello.push(1);
                hello.push(chosen.len() as u8);
                hello.extend_from_slice(&chosen);
                self.server_hello = hello.clone();

                progress.outputs[Epoch::Initial as usize] = Self::msg(MSG_SERVER_HELLO, &hello);
                progress.key_installs = self.installs(Epoch::Handshake, true);
                progress.outputs[Epoch::Handshake as usize] = Self::msg(MSG_SERVER_FINISHED, &[]);
                progress.key_installs.extend(self.installs(Epoch::Data, true));
                progress.peer_transport_params = Some(peer_tp);
                progress.alpn = Some(chosen);
            }
            (Side::Client, Epoch::Initial, MSG_SERVER_HELLO) => {
                self.server_hello = body.to_vec();
                let (peer_tp, mut alpn) = Self::parse_hello(body)?;
                progress.key_installs = self.installs(Epoch::Handshake, true);
                progress.peer_transport_params = Some(peer_tp);
                progress.alpn = alpn.pop();
            }
            (Side::Client, Epoch::Handshake, MSG_SERVER_FINISHED) => {
                progress.key_installs = self.installs(Epoch::Data, true);
                progress.outputs[Epoch::Handshake as usize] = Self::msg(MSG_CLIENT_FINISHED, &[]);
                progress.handshake_complete = true;
            }
            (Side::Server, Epoch::Handshake, MSG_CLIENT_FINISHED) => {
                progress.handshake_complete = true;
            }
            _ => return Err(TransportError::Tls(ALERT_UNEXPECTED)),
        }
        Ok(progress)
    }
}

impl TlsSession for StubTls {
    fn start(&mut self) -> Result<TlsProgress> {
        let mut progress = TlsProgress::default();
        if self.side.is_client() {
            let body = self.hello_body();
            self.client_hello = body.clone();
            progress.outputs[Epoch::Initial as usize] = Self::msg(MSG_CLIENT_HELLO, &body);
        }
        Ok(progress)
    }

    fn on_crypto(&mut self, epoch: Epoch, data: &[u8]) -> Result<TlsProgress> {
        let inbox = &mut self.inbox[epoch as usize];
        inbox.extend_from_slice(data);

        let mut progress = TlsProgress::default();
        loop {
            let buffered = &self.inbox[epoch as usize];
            if buffered.len() < 3 {
                break;
            }
            let tag = buffered[0];
            let len = u16::from_be_bytes([buffered[1], buffered[2]]) as usize;
            if buffered.len() < 3 + len {
                break;
            }
            let body = buffered[3..3 + len].to_vec();
            self.inbox[epoch as usize].drain(..3 + len);
            progress.merge(self.handle_msg(epoch, tag, &body)?);
        }
        Ok(progress)
    }
}
