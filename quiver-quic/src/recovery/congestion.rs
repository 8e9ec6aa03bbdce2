//! NewReno congestion control.

use std::time::Instant;
use tracing::debug;

use super::{K_MAX_DATAGRAM_SIZE, K_MINIMUM_WINDOW};

/// Initial window: `min(10 * kMaxDatagramSize, max(2 * kMaxDatagramSize,
/// 14720))`.
pub const K_INITIAL_WINDOW: usize = {
    let upper = 10 * K_MAX_DATAGRAM_SIZE;
    let lower = if 2 * K_MAX_DATAGRAM_SIZE > 14720 {
        2 * K_MAX_DATAGRAM_SIZE
    } else {
        14720
    };
    if upper < lower {
        upper
    } else {
        lower
    }
};

#[derive(Debug)]
pub struct NewReno {
    cwnd: usize,
    ssthresh: usize,
    bytes_in_flight: usize,
    /// Start of the current recovery period; packets sent before it do not
    /// trigger another window reduction.
    rec_start_t: Option<Instant>,
}

impl Default for NewReno {
    fn default() -> Self {
        Self {
            cwnd: K_INITIAL_WINDOW,
            ssthresh: usize::MAX,
            bytes_in_flight: 0,
            rec_start_t: None,
        }
    }
}

impl NewReno {
    pub fn cwnd(&self) -> usize {
        self.cwnd
    }

    pub fn ssthresh(&self) -> usize {
        self.ssthresh
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }

    /// Congestion budget still available for new in-flight bytes.
    pub fn available(&self) -> usize {
        self.cwnd.saturating_sub(self.bytes_in_flight)
    }

    pub fn on_packet_sent(&mut self, bytes: usize) {
        self.bytes_in_flight += bytes;
    }

    /// An in-flight packet was acknowledged.
    pub fn on_packet_acked(&mut self, udp_len: usize, t_sent: Instant) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(udp_len);
        if self.in_recovery(t_sent) {
            return;
        }
        if self.cwnd < self.ssthresh {
            // Slow start.
            self.cwnd += udp_len;
        } else {
            // Congestion avoidance.
            self.cwnd += K_MAX_DATAGRAM_SIZE * udp_len / self.cwnd;
        }
    }

    /// An in-flight packet was declared lost; only the accounting, the
    /// window reduction goes through [`NewReno::on_congestion_event`].
    pub fn on_packet_lost(&mut self, udp_len: usize) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(udp_len);
    }

    /// Loss or ECN-CE at `t_sent`. Halves the window once per recovery
    /// period.
    pub fn on_congestion_event(&mut self, t_sent: Instant, now: Instant) {
        if self.in_recovery(t_sent) {
            return;
        }
        self.rec_start_t = Some(now);
        self.cwnd = (self.cwnd / 2).max(K_MINIMUM_WINDOW);
        self.ssthresh = self.cwnd;
        debug!(cwnd = self.cwnd, "congestion event");
    }

    fn in_recovery(&self, t_sent: Instant) -> bool {
        self.rec_start_t.is_some_and(|start| t_sent <= start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn initial_window_is_twelve_kilobytes() {
        // min(12000, max(2400, 14720)) = 12000 at a 1200-byte datagram size
        assert_eq!(K_INITIAL_WINDOW, 12_000);
        assert_eq!(NewReno::default().cwnd(), K_INITIAL_WINDOW);
    }

    #[test]
    fn slow_start_grows_by_acked_bytes() {
        let mut cc = NewReno::default();
        let t = Instant::now();
        cc.on_packet_sent(1200);
        cc.on_packet_acked(1200, t);
        assert_eq!(cc.cwnd(), K_INITIAL_WINDOW + 1200);
        assert_eq!(cc.bytes_in_flight(), 0);
    }

    #[test]
    fn congestion_event_halves_and_sets_ssthresh() {
        let mut cc = NewReno::default();
        let t0 = Instant::now();
        cc.on_congestion_event(t0, t0);
        assert_eq!(cc.cwnd(), K_INITIAL_WINDOW / 2);
        assert_eq!(cc.ssthresh(), K_INITIAL_WINDOW / 2);
    }

    #[test]
    fn one_reduction_per_recovery_period() {
        let mut cc = NewReno::default();
        let t0 = Instant::now();
        cc.on_congestion_event(t0, t0);
        let after_first = cc.cwnd();
        // A loss of a packet sent before recovery started is absorbed.
        cc.on_congestion_event(t0, t0 + Duration::from_millis(10));
        assert_eq!(cc.cwnd(), after_first);
        // One sent after recovery began is a fresh event.
        cc.on_congestion_event(t0 + Duration::from_millis(20), t0 + Duration::from_millis(30));
        assert_eq!(cc.cwnd(), (after_first / 2).max(K_MINIMUM_WINDOW));
    }

    #[test]
    fn window_never_drops_below_minimum() {
        let mut cc = NewReno::default();
        let mut t = Instant::now();
        for _ in 0..8 {
            t += Duration::from_millis(10);
            cc.on_congestion_event(t, t + Duration::from_millis(1));
            t += Duration::from_millis(10);
        }
        assert_eq!(cc.cwnd(), K_MINIMUM_WINDOW);
    }

    #[test]
    fn avoidance_grows_sublinearly_after_ssthresh() {
        let mut cc = NewReno::default();
        let t0 = Instant::now();
        cc.on_congestion_event(t0, t0);
        let base = cc.cwnd();
        // Ack a packet sent after recovery start: avoidance growth.
        let t1 = t0 + Duration::from_millis(50);
        cc.on_packet_sent(1200);
        cc.on_packet_acked(1200, t1);
        assert_eq!(cc.cwnd(), base + K_MAX_DATAGRAM_SIZE * 1200 / base);
    }
}
