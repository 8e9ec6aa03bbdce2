//! Stream state machines: ordered inbound reassembly, outbound
//! retransmission queues and per-stream flow control.

pub mod buffer;

pub use buffer::{RecvBuffer, SendBuffer};

use crate::types::StreamId;
use bytes::Bytes;
use tracing::{error, trace};

/// Stream lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    /// We sent our FIN; still receiving.
    HalfClosedLocal,
    /// Peer's FIN arrived; still sending.
    HalfClosedRemote,
    Closed,
}

/// One stream: both directions plus its flow-control accounting.
///
/// The internal crypto streams (negative ids) use the same machinery with
/// flow control effectively unlimited.
#[derive(Debug)]
pub struct Stream {
    pub id: StreamId,
    state: StreamState,
    pub recv: RecvBuffer,
    pub send: SendBuffer,
    /// Receive window we advertised for this stream.
    pub in_data_max: u64,
    /// Peer's limit on what we may send.
    pub out_data_max: u64,
    /// We ran into `out_data_max` and owe a STREAM_DATA_BLOCKED.
    pub blocked: bool,
    /// A MAX_STREAM_DATA announcing the raised window is owed.
    pub tx_max_stream_data: bool,
}

impl Stream {
    pub fn new(id: StreamId, in_data_max: u64, out_data_max: u64) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            recv: RecvBuffer::default(),
            send: SendBuffer::default(),
            in_data_max,
            out_data_max,
            blocked: false,
            tx_max_stream_data: false,
        }
    }

    /// A crypto stream for handshake data; no flow-control limits apply.
    pub fn new_crypto(id: StreamId) -> Self {
        Self::new(id, u64::MAX, u64::MAX)
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// The single place the state field mutates. A transition to the
    /// current state is a bug.
    pub fn transition(&mut self, next: StreamState) {
        if self.state == next {
            error!(stream = %self.id, state = ?next, "bug: stream transition to same state");
            return;
        }
        trace!(stream = %self.id, from = ?self.state, to = ?next, "stream transition");
        self.state = next;
    }

    /// Next in-order offset expected from the peer.
    pub fn in_data_off(&self) -> u64 {
        self.recv.in_data_off()
    }

    /// Next fresh outbound offset.
    pub fn out_data(&self) -> u64 {
        self.send.out_data()
    }

    /// Bytes still sendable under the peer's stream window.
    pub fn out_window(&self) -> u64 {
        self.out_data_max.saturating_sub(self.send.out_data())
    }

    /// Raise the advertised window once the peer has used more than half of
    /// it; returns the new maximum when a MAX_STREAM_DATA is owed.
    pub fn maybe_raise_in_max(&mut self) -> Option<u64> {
        if self.id.is_crypto() || self.in_data_max == u64::MAX {
            return None;
        }
        if 2 * self.recv.in_data_off() > self.in_data_max {
            self.in_data_max *= 2;
            self.tx_max_stream_data = true;
            trace!(stream = %self.id, max = self.in_data_max, "raising stream receive window");
            return Some(self.in_data_max);
        }
        None
    }

    /// Whether anything on this stream wants TX (data, FIN, window
    /// updates, blocked signals).
    pub fn needs_tx(&self) -> bool {
        let can_send = self.out_window() > 0 || self.send_is_rtx_only();
        self.send.has_pending() && can_send || self.tx_max_stream_data || self.blocked
    }

    fn send_is_rtx_only(&self) -> bool {
        // Retransmissions are of data already inside the peer's window.
        self.send.out_data() >= self.send.append_off()
    }

    /// Application write; `fin` half-closes our direction once acked.
    pub fn write(&mut self, data: Bytes, fin: bool) {
        self.send.write(data, fin);
        if self.state == StreamState::Idle {
            self.transition(StreamState::Open);
        }
    }

    /// Our FIN was acknowledged; fold the state machine forward.
    pub fn on_fin_acked(&mut self) {
        match self.state {
            StreamState::Open => self.transition(StreamState::HalfClosedLocal),
            StreamState::HalfClosedRemote => self.transition(StreamState::Closed),
            _ => {}
        }
    }

    /// The peer's FIN became observable.
    pub fn on_fin_rxed(&mut self) {
        match self.state {
            StreamState::Idle | StreamState::Open => {
                self.transition(StreamState::HalfClosedRemote)
            }
            StreamState::HalfClosedLocal => self.transition(StreamState::Closed),
            _ => {}
        }
    }

    /// RESET_STREAM from the peer kills the stream outright.
    pub fn on_reset(&mut self) {
        if self.state != StreamState::Closed {
            self.transition(StreamState::Closed);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_stream() -> Stream {
        Stream::new(StreamId(0), 1024, 1024)
    }

    #[test]
    fn write_opens_idle_stream() {
        let mut stream = data_stream();
        assert_eq!(stream.state(), StreamState::Idle);
        stream.write(Bytes::from_static(b"x"), false);
        assert_eq!(stream.state(), StreamState::Open);
    }

    #[test]
    fn fin_ack_then_peer_fin_closes() {
        let mut stream = data_stream();
        stream.write(Bytes::from_static(b"req"), true);
        stream.on_fin_acked();
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);
        stream.on_fin_rxed();
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[test]
    fn peer_fin_first_then_local() {
        let mut stream = data_stream();
        stream.write(Bytes::from_static(b"req"), false);
        stream.on_fin_rxed();
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);
        stream.on_fin_acked();
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[test]
    fn window_raises_past_half_consumption() {
        let mut stream = data_stream();
        stream
            .recv
            .insert(0, Bytes::from(vec![0u8; 500]), false)
            .unwrap();
        assert_eq!(stream.maybe_raise_in_max(), None);
        stream
            .recv
            .insert(500, Bytes::from(vec![0u8; 100]), false)
            .unwrap();
        assert_eq!(stream.maybe_raise_in_max(), Some(2048));
        assert!(stream.tx_max_stream_data);
    }

    #[test]
    fn crypto_streams_skip_flow_control() {
        let mut stream = Stream::new_crypto(StreamId::crypto(crate::types::PnSpaceId::Initial));
        stream
            .recv
            .insert(0, Bytes::from(vec![0u8; 4096]), false)
            .unwrap();
        assert_eq!(stream.maybe_raise_in_max(), None);
        assert!(stream.out_window() > 1 << 40);
    }

    #[test]
    fn out_window_tracks_peer_limit() {
        let mut stream = data_stream();
        stream.write(Bytes::from(vec![0u8; 2000]), false);
        assert_eq!(stream.out_window(), 1024);
        let (_, chunk, _) = stream.send.next_chunk(4096).unwrap();
        assert_eq!(chunk.len(), 2000); // caller must bound by out_window
    }
}
