//! Loss detection, ACK processing and congestion control.
//!
//! One [`Recovery`] instance per connection works over the connection's
//! packet-number spaces: it owns the RTT estimator, the NewReno window and
//! the loss-detection/PTO timers, while sent-packet metadata stays in the
//! spaces themselves.

pub mod congestion;
pub mod rtt;

use crate::frames::AckFrame;
use crate::packet::space::{PnSpace, SentMeta};
use crate::types::PnSpaceId;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

pub use congestion::{NewReno, K_INITIAL_WINDOW};
pub use rtt::RttEstimator;

/// Packets this far below the largest acked are lost regardless of time.
pub const K_PACKET_THRESHOLD: u64 = 3;
/// Timer granularity.
pub const K_GRANULARITY: Duration = Duration::from_millis(1);
/// Assumed RTT before the first sample.
pub const K_INITIAL_RTT: Duration = Duration::from_millis(500);
/// Assumed UDP payload budget per datagram.
pub const K_MAX_DATAGRAM_SIZE: usize = 1200;
/// Floor for the congestion window.
pub const K_MINIMUM_WINDOW: usize = 2 * K_MAX_DATAGRAM_SIZE;
/// PTO escalations after which we assume persistent congestion and stop
/// trusting ECN.
pub const K_PERSISTENT_CONGESTION_THRESHOLD: u32 = 3;

/// What the loss-detection alarm wants done when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LdAction {
    /// Re-run loss detection in this space.
    DetectLoss(PnSpaceId),
    /// Retransmit unacked crypto data.
    RetransmitCrypto,
    /// Send a PTO probe (ack-eliciting packet) in the data space.
    SendProbe,
}

/// Outcome of processing one ACK frame.
#[derive(Debug, Default)]
pub struct AckOutcome {
    /// Metadata of packets newly acknowledged, for stream/CID bookkeeping.
    pub newly_acked: Vec<SentMeta>,
    /// Metadata of packets newly declared lost, for retransmission.
    pub newly_lost: Vec<SentMeta>,
}

#[derive(Debug, Default)]
pub struct Recovery {
    pub rtt: RttEstimator,
    pub cc: NewReno,
    pub pto_cnt: u32,
    pub crypto_cnt: u32,
    last_sent_ack_elicit_t: Option<Instant>,
    last_sent_crypto_t: Option<Instant>,
    /// ECN reporting disabled after persistent PTO escalation.
    pub ecn_disabled: bool,
}

impl Recovery {
    /// Account for a sent packet (metadata already registered with the
    /// space).
    pub fn on_pkt_sent(&mut self, meta: &SentMeta, carries_crypto: bool) {
        if meta.in_flight {
            self.cc.on_packet_sent(meta.udp_len);
        }
        if meta.ack_eliciting {
            self.last_sent_ack_elicit_t = Some(meta.t_sent);
        }
        if carries_crypto {
            self.last_sent_crypto_t = Some(meta.t_sent);
        }
    }

    /// Process an ACK frame for `space`.
    ///
    /// `ack_delay` must already be scaled by the peer's exponent and capped
    /// at its `max_ack_delay`.
    pub fn on_ack_rxed(
        &mut self,
        space: &mut PnSpace,
        ack: &AckFrame,
        ack_delay: Duration,
        now: Instant,
    ) -> AckOutcome {
        let mut outcome = AckOutcome::default();

        // Collect the sent packets the frame covers. Ranges were validated
        // at parse time.
        let ranges: Vec<(u64, u64)> = ack.ranges().flatten().collect();
        let mut acked_pns: Vec<u64> = space
            .sent
            .keys()
            .copied()
            .filter(|&pn| ranges.iter().any(|&(start, end)| pn >= start && pn <= end))
            .collect();
        acked_pns.sort_unstable();

        let mut largest_newly_acked: Option<(u64, Instant, bool)> = None;
        for pn in acked_pns {
            let meta = space.sent.get_mut(&pn).expect("collected above");
            if meta.acked {
                continue;
            }
            let was_lost = meta.lost;
            meta.acked = true;
            let meta = meta.clone();
            space.sent.remove(&pn);
            space.acked_or_lost.insert(pn);
            if was_lost {
                // Already resolved as lost; the late ACK is a no-op beyond
                // dropping the metadata.
                trace!(space = ?space.id, pn, "ack for packet already declared lost");
                continue;
            }
            if meta.in_flight {
                self.cc.on_packet_acked(meta.udp_len, meta.t_sent);
            }
            if let Some(largest) = meta.largest_acked_in_ack {
                space.on_ack_acked(largest);
            }
            largest_newly_acked = Some((pn, meta.t_sent, meta.ack_eliciting));
            outcome.newly_acked.push(meta);
        }

        if let Some((pn, t_sent, ack_eliciting)) = largest_newly_acked {
            if space.lg_acked.map_or(true, |lg| pn > lg) {
                space.lg_acked = Some(pn);
            }
            // Only the largest acked packet produces an RTT sample, and
            // only when it elicited this ACK.
            if pn == ack.largest_acked && ack_eliciting {
                self.rtt.update(now - t_sent, ack_delay);
            }
            self.pto_cnt = 0;
            self.crypto_cnt = 0;
        }

        outcome.newly_lost = self.detect_lost(space, now);
        outcome
    }

    /// Declare packets lost by packet threshold or time threshold, and
    /// re-arm the space's loss timer for the earliest still-pending
    /// candidate.
    pub fn detect_lost(&mut self, space: &mut PnSpace, now: Instant) -> Vec<SentMeta> {
        let Some(lg_acked) = space.lg_acked else {
            return Vec::new();
        };
        let loss_delay = self.rtt.loss_delay();
        let mut lost = Vec::new();
        let mut earliest_loss_t: Option<Instant> = None;
        let mut latest_lost_sent: Option<Instant> = None;

        for meta in space.sent.values_mut() {
            if meta.lost || meta.acked || meta.nr > lg_acked {
                continue;
            }
            let by_pkt_threshold = lg_acked >= meta.nr + K_PACKET_THRESHOLD;
            let deadline = meta.t_sent + loss_delay;
            if by_pkt_threshold || deadline <= now {
                meta.lost = true;
                if meta.in_flight {
                    self.cc.on_packet_lost(meta.udp_len);
                    latest_lost_sent = Some(
                        latest_lost_sent.map_or(meta.t_sent, |t: Instant| t.max(meta.t_sent)),
                    );
                }
                lost.push(meta.clone());
            } else {
                earliest_loss_t =
                    Some(earliest_loss_t.map_or(deadline, |t: Instant| t.min(deadline)));
            }
        }

        lost.sort_unstable_by_key(|meta| meta.nr);
        space.loss_t = earliest_loss_t;
        if let Some(t_sent) = latest_lost_sent {
            debug!(space = ?space.id, lost = lost.len(), "packets declared lost");
            self.cc.on_congestion_event(t_sent, now);
        }
        lost
    }

    /// ECN-CE count increased: treat as a congestion event at the send time
    /// of the largest acked packet.
    pub fn on_ecn_ce(&mut self, t_sent: Instant, now: Instant) {
        if !self.ecn_disabled {
            self.cc.on_congestion_event(t_sent, now);
        }
    }

    /// When the loss-detection alarm should fire, and what for.
    ///
    /// Earliest per-space loss time wins; otherwise the crypto
    /// retransmission timer, otherwise a PTO armed off the last
    /// ack-eliciting send.
    pub fn ld_alarm(
        &self,
        spaces: &[PnSpace],
        peer_max_ack_delay: Duration,
    ) -> Option<(Instant, LdAction)> {
        let min_loss = spaces
            .iter()
            .filter_map(|space| space.loss_t.map(|t| (t, LdAction::DetectLoss(space.id))))
            .min_by_key(|&(t, _)| t);
        if min_loss.is_some() {
            return min_loss;
        }

        let crypto_outstanding = spaces.iter().any(|space| {
            !space.abandoned
                && space
                    .sent
                    .values()
                    .any(|meta| !meta.acked && !meta.lost && meta.strm.is_some_and(|s| s.id.is_crypto()))
        });
        if crypto_outstanding {
            if let Some(last) = self.last_sent_crypto_t {
                let base = 2 * self.rtt.smoothed().max(K_INITIAL_RTT);
                return Some((
                    last + base * (1u32 << self.crypto_cnt),
                    LdAction::RetransmitCrypto,
                ));
            }
        }

        let in_flight = spaces.iter().any(PnSpace::in_flight_ack_eliciting);
        if in_flight {
            if let Some(last) = self.last_sent_ack_elicit_t {
                let pto = self.rtt.pto_base(peer_max_ack_delay) * (1u32 << self.pto_cnt);
                return Some((last + pto, LdAction::SendProbe));
            }
        }
        None
    }

    /// The loss-detection alarm fired; escalate the matching counter.
    pub fn on_ld_timeout(&mut self, action: LdAction) {
        match action {
            LdAction::DetectLoss(_) => {}
            LdAction::RetransmitCrypto => {
                self.crypto_cnt += 1;
            }
            LdAction::SendProbe => {
                self.pto_cnt += 1;
                if self.pto_cnt >= K_PERSISTENT_CONGESTION_THRESHOLD {
                    self.ecn_disabled = true;
                }
            }
        }
    }

    /// Current PTO with backoff, used for idle/closing timers.
    pub fn pto(&self, peer_max_ack_delay: Duration) -> Duration {
        self.rtt.pto_base(peer_max_ack_delay) * (1u32 << self.pto_cnt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::types::{frame_bit, FRAM_TYPE_PING, FRAM_TYPE_STRM};
    use crate::packet::space::StreamDataRef;
    use crate::types::{Epoch, StreamId};
    use tinyvec::TinyVec;

    fn ack_frame(largest: u64, first_range: u64) -> AckFrame {
        AckFrame {
            largest_acked: largest,
            ack_delay: 0,
            first_range,
            blocks: TinyVec::new(),
            ecn: None,
        }
    }

    fn send_pkt(space: &mut PnSpace, rec: &mut Recovery, t: Instant, stream: bool) -> u64 {
        let nr = space.next_pn();
        let meta = SentMeta {
            nr,
            epoch: Epoch::Data,
            t_sent: t,
            udp_len: 1200,
            in_flight: true,
            ack_eliciting: true,
            frames: frame_bit(if stream { FRAM_TYPE_STRM } else { FRAM_TYPE_PING }),
            strm: stream.then_some(StreamDataRef {
                id: StreamId(0),
                offset: 0,
                len: 100,
                fin: false,
            }),
            largest_acked_in_ack: None,
            acked: false,
            lost: false,
            rtx: Vec::new(),
        };
        space.on_pkt_sent(meta.clone());
        rec.on_pkt_sent(&meta, false);
        nr
    }

    /// Send 0..4, ack {0..2, 4}; after the loss delay nr 3
    /// is lost, the window halves, and its metadata stays flagged.
    #[test]
    fn gap_becomes_loss_after_delay() {
        let mut space = PnSpace::new(PnSpaceId::Data);
        let mut rec = Recovery::default();
        let t0 = Instant::now();
        for i in 0..5u64 {
            send_pkt(&mut space, &mut rec, t0 + Duration::from_millis(i as u64), true);
        }
        let cwnd_before = rec.cc.cwnd();

        let mut ack = ack_frame(4, 0);
        ack.blocks.push(crate::frames::AckBlock { gap: 0, length: 2 });
        let outcome = rec.on_ack_rxed(&mut space, &ack, Duration::ZERO, t0 + Duration::from_millis(40));
        assert_eq!(
            outcome.newly_acked.iter().map(|m| m.nr).collect::<Vec<_>>(),
            vec![0, 1, 2, 4]
        );
        // Packet threshold: 4 >= 3 + 3 is false, so nr 3 survives on time.
        assert!(outcome.newly_lost.is_empty());
        assert!(space.loss_t.is_some());

        // After the loss delay it goes.
        let late = t0 + Duration::from_secs(2);
        let lost = rec.detect_lost(&mut space, late);
        assert_eq!(lost.iter().map(|m| m.nr).collect::<Vec<_>>(), vec![3]);
        assert!(space.sent[&3].lost);
        assert!(rec.cc.cwnd() < cwnd_before);
    }

    #[test]
    fn packet_threshold_loss_is_immediate() {
        let mut space = PnSpace::new(PnSpaceId::Data);
        let mut rec = Recovery::default();
        let t0 = Instant::now();
        for _ in 0..5u64 {
            send_pkt(&mut space, &mut rec, t0, true);
        }
        // Ack only nr 4: nrs 0 and 1 fall more than kPacketThreshold behind.
        let outcome = rec.on_ack_rxed(
            &mut space,
            &ack_frame(4, 0),
            Duration::ZERO,
            t0 + Duration::from_millis(1),
        );
        assert_eq!(
            outcome.newly_lost.iter().map(|m| m.nr).collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    /// Loss then ACK of the same packet number is a no-op after the first
    /// resolution.
    #[test]
    fn late_ack_of_lost_packet_is_noop() {
        let mut space = PnSpace::new(PnSpaceId::Data);
        let mut rec = Recovery::default();
        let t0 = Instant::now();
        for _ in 0..5u64 {
            send_pkt(&mut space, &mut rec, t0, true);
        }
        rec.on_ack_rxed(&mut space, &ack_frame(4, 0), Duration::ZERO, t0 + Duration::from_millis(1));
        let cwnd_after_loss = rec.cc.cwnd();

        // Now the peer acks nr 0 (already lost) late: no window growth, no
        // second congestion event, metadata dropped.
        let outcome = rec.on_ack_rxed(
            &mut space,
            &ack_frame(0, 0),
            Duration::ZERO,
            t0 + Duration::from_millis(2),
        );
        assert!(outcome.newly_acked.is_empty());
        assert_eq!(rec.cc.cwnd(), cwnd_after_loss);
        assert!(!space.sent.contains_key(&0));
    }

    #[test]
    fn rtt_sample_only_from_largest_eliciting() {
        let mut space = PnSpace::new(PnSpaceId::Data);
        let mut rec = Recovery::default();
        let t0 = Instant::now();
        send_pkt(&mut space, &mut rec, t0, false);
        rec.on_ack_rxed(
            &mut space,
            &ack_frame(0, 0),
            Duration::from_millis(5),
            t0 + Duration::from_millis(100),
        );
        assert!(rec.rtt.has_sample());
        assert_eq!(rec.rtt.latest(), Duration::from_millis(100));
    }

    #[test]
    fn pto_alarm_arms_and_escalates() {
        let mut space = PnSpace::new(PnSpaceId::Data);
        let mut rec = Recovery::default();
        let t0 = Instant::now();
        send_pkt(&mut space, &mut rec, t0, false);
        let spaces = [
            PnSpace::new(PnSpaceId::Initial),
            PnSpace::new(PnSpaceId::Handshake),
            space,
        ];
        let mad = Duration::from_millis(25);
        let (when, action) = rec.ld_alarm(&spaces, mad).unwrap();
        assert_eq!(action, LdAction::SendProbe);
        assert_eq!(when, t0 + rec.rtt.pto_base(mad));

        rec.on_ld_timeout(LdAction::SendProbe);
        let (when2, _) = rec.ld_alarm(&spaces, mad).unwrap();
        assert_eq!(when2, t0 + rec.rtt.pto_base(mad) * 2);

        rec.on_ld_timeout(LdAction::SendProbe);
        rec.on_ld_timeout(LdAction::SendProbe);
        assert!(rec.ecn_disabled);
    }

    #[test]
    fn crypto_timer_takes_precedence_over_pto() {
        let mut space = PnSpace::new(PnSpaceId::Initial);
        let mut rec = Recovery::default();
        let t0 = Instant::now();
        let nr = space.next_pn();
        let meta = SentMeta {
            nr,
            epoch: Epoch::Initial,
            t_sent: t0,
            udp_len: 1200,
            in_flight: true,
            ack_eliciting: true,
            frames: frame_bit(crate::frames::types::FRAM_TYPE_CRPT),
            strm: Some(StreamDataRef {
                id: StreamId::crypto(PnSpaceId::Initial),
                offset: 0,
                len: 300,
                fin: false,
            }),
            largest_acked_in_ack: None,
            acked: false,
            lost: false,
            rtx: Vec::new(),
        };
        space.on_pkt_sent(meta.clone());
        rec.on_pkt_sent(&meta, true);

        let spaces = [space, PnSpace::new(PnSpaceId::Handshake), PnSpace::new(PnSpaceId::Data)];
        let (when, action) = rec.ld_alarm(&spaces, Duration::ZERO).unwrap();
        assert_eq!(action, LdAction::RetransmitCrypto);
        assert_eq!(when, t0 + 2 * K_INITIAL_RTT);
    }
}
