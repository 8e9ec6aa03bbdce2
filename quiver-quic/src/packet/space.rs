//! Per-epoch packet-number space state: TX numbering, sent-packet metadata,
//! RX acknowledgement bookkeeping, ECN counters and the ACK alarm.

use crate::frames::types::{frame_bit, FRAM_TYPE_CRPT, FRAM_TYPE_STRM};
use crate::ranges::RangeSet;
use crate::types::{Epoch, PnSpaceId, StreamId};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::trace;

/// Reference to the stream bytes a packet carried, for retransmission on
/// loss. Crypto-stream data uses the negative crypto stream ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDataRef {
    pub id: StreamId,
    pub offset: u64,
    pub len: usize,
    pub fin: bool,
}

/// Metadata of one sent packet, kept until acked or lost.
#[derive(Debug, Clone)]
pub struct SentMeta {
    pub nr: u64,
    pub epoch: Epoch,
    pub t_sent: Instant,
    /// UDP bytes attributed to this packet (its share of the datagram).
    pub udp_len: usize,
    pub in_flight: bool,
    pub ack_eliciting: bool,
    /// Bitmap over frame type bytes carried.
    pub frames: u32,
    /// Stream data carried, if any.
    pub strm: Option<StreamDataRef>,
    /// Largest packet number covered by an ACK frame in this packet; when
    /// this packet is acked, the pending-ACK set can be pruned up to it.
    pub largest_acked_in_ack: Option<u64>,
    pub acked: bool,
    pub lost: bool,
    /// Packet numbers of earlier transmissions this packet retransmits.
    pub rtx: Vec<u64>,
}

impl SentMeta {
    pub fn carries(&self, type_byte: u8) -> bool {
        self.frames & frame_bit(type_byte) != 0
    }
}

/// One packet-number space (`init`, `hshk`, `data`).
#[derive(Debug)]
pub struct PnSpace {
    pub id: PnSpaceId,
    /// Largest packet number sent, `None` before the first send.
    pub lg_sent: Option<u64>,
    /// Largest packet number the peer acknowledged.
    pub lg_acked: Option<u64>,
    /// Largest packet number successfully decrypted, for pn recovery.
    pub lg_rxed: Option<u64>,
    /// Sent packets awaiting acknowledgement, by packet number.
    pub sent: HashMap<u64, SentMeta>,
    /// Received numbers not yet covered by an acknowledged ACK of ours.
    pub recv: RangeSet,
    /// Every number ever received, for dedupe.
    pub recv_all: RangeSet,
    /// Numbers whose fate is settled (acked or declared lost by the peer's
    /// view of our ACKs).
    pub acked_or_lost: RangeSet,
    /// ECN counts observed on RX: ECT(0), ECT(1), CE.
    pub ecn_rxed: [u64; 3],
    /// Space abandoned (keys dropped); no further TX or RX.
    pub abandoned: bool,
    /// Ack-eliciting packets received since the last ACK we sent.
    pub pkts_rxed_since_last_ack_tx: u32,
    /// Deadline for sending an ACK, if one is owed.
    pub ack_t: Option<Instant>,
    /// An out-of-order or CE-marked arrival wants an ACK now.
    pub imm_ack: bool,
    /// Earliest loss time among sent packets, maintained by recovery.
    pub loss_t: Option<Instant>,
}

impl PnSpace {
    pub fn new(id: PnSpaceId) -> Self {
        Self {
            id,
            lg_sent: None,
            lg_acked: None,
            lg_rxed: None,
            sent: HashMap::new(),
            recv: RangeSet::new(),
            recv_all: RangeSet::new(),
            acked_or_lost: RangeSet::new(),
            ecn_rxed: [0; 3],
            abandoned: false,
            pkts_rxed_since_last_ack_tx: 0,
            ack_t: None,
            imm_ack: false,
            loss_t: None,
        }
    }

    /// Allocate the next packet number. Strictly increasing per space.
    pub fn next_pn(&mut self) -> u64 {
        let nr = self.lg_sent.map_or(0, |lg| lg + 1);
        self.lg_sent = Some(nr);
        nr
    }

    /// Record a sent packet's metadata.
    pub fn on_pkt_sent(&mut self, meta: SentMeta) {
        debug_assert_eq!(Some(meta.nr), self.lg_sent);
        self.sent.insert(meta.nr, meta);
    }

    /// Register a received packet number.
    ///
    /// Returns `false` for duplicates (the packet must be dropped without
    /// processing). Arms the ACK alarm for ack-eliciting packets: delayed by
    /// `max_ack_delay` in the common case, immediate when the number is out
    /// of order or the datagram was CE-marked.
    pub fn on_pkt_rxed(
        &mut self,
        nr: u64,
        ack_eliciting: bool,
        ce_marked: bool,
        now: Instant,
        max_ack_delay: Duration,
    ) -> bool {
        if self.recv_all.contains(nr) {
            trace!(space = ?self.id, nr, "duplicate packet number");
            return false;
        }
        let out_of_order = self.recv_all.max().is_some_and(|max| nr != max + 1);
        self.recv_all.insert(nr);
        self.recv.insert(nr);
        if nr > self.lg_rxed.unwrap_or(0) || self.lg_rxed.is_none() {
            self.lg_rxed = Some(nr);
        }
        if ack_eliciting {
            self.pkts_rxed_since_last_ack_tx += 1;
            if out_of_order || ce_marked {
                self.imm_ack = true;
                self.ack_t = Some(now);
            } else if self.ack_t.is_none() {
                self.ack_t = Some(now + max_ack_delay);
            }
        }
        true
    }

    /// Whether an ACK frame should be bundled into the next packet.
    pub fn needs_ack_tx(&self, now: Instant) -> bool {
        !self.recv.is_empty()
            && (self.imm_ack
                || self.pkts_rxed_since_last_ack_tx > 0
                    && self.ack_t.is_some_and(|t| t <= now))
    }

    /// Whether any received numbers are eligible for an ACK frame at all.
    pub fn has_ack_ranges(&self) -> bool {
        !self.recv.is_empty()
    }

    /// Note that an ACK covering everything in `recv` was just transmitted.
    /// The ranges stay for tracking; the counters reset.
    pub fn on_ack_tx(&mut self) {
        self.pkts_rxed_since_last_ack_tx = 0;
        self.imm_ack = false;
        self.ack_t = None;
    }

    /// Our ACK up to `largest` was itself acknowledged; stop re-announcing
    /// those ranges.
    pub fn on_ack_acked(&mut self, largest: u64) {
        self.recv.remove_up_to(largest);
    }

    /// Frame kinds currently outstanding (sent, not yet acked or lost).
    pub fn out_frames(&self) -> u32 {
        self.sent
            .values()
            .filter(|meta| !meta.acked && !meta.lost)
            .fold(0, |acc, meta| acc | meta.frames)
    }

    /// Whether unacked crypto or stream data is outstanding.
    pub fn has_unacked_data(&self) -> bool {
        let bits = frame_bit(FRAM_TYPE_CRPT) | frame_bit(FRAM_TYPE_STRM);
        self.out_frames() & bits != 0
    }

    /// Whether any in-flight ack-eliciting packets remain.
    pub fn in_flight_ack_eliciting(&self) -> bool {
        self.sent
            .values()
            .any(|meta| meta.ack_eliciting && !meta.acked && !meta.lost)
    }

    /// Abandon the space: keys are gone, nothing in it counts any more.
    pub fn abandon(&mut self) {
        trace!(space = ?self.id, "abandoning packet-number space");
        self.abandoned = true;
        self.sent.clear();
        self.recv.clear();
        self.ack_t = None;
        self.imm_ack = false;
        self.loss_t = None;
        self.pkts_rxed_since_last_ack_tx = 0;
    }

    /// Reset all numbering after version negotiation; the handshake starts
    /// over in the same space.
    pub fn reset_for_vneg(&mut self) {
        *self = PnSpace::new(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> PnSpace {
        PnSpace::new(PnSpaceId::Data)
    }

    const MAD: Duration = Duration::from_millis(25);

    #[test]
    fn packet_numbers_start_at_zero_and_increase() {
        let mut space = space();
        assert_eq!(space.next_pn(), 0);
        assert_eq!(space.next_pn(), 1);
        assert_eq!(space.next_pn(), 2);
        assert_eq!(space.lg_sent, Some(2));
    }

    #[test]
    fn duplicate_rx_is_rejected() {
        let mut space = space();
        let now = Instant::now();
        assert!(space.on_pkt_rxed(5, true, false, now, MAD));
        assert!(!space.on_pkt_rxed(5, true, false, now, MAD));
        assert_eq!(space.recv_all.value_count(), 1);
    }

    #[test]
    fn in_order_rx_delays_ack() {
        let mut space = space();
        let now = Instant::now();
        space.on_pkt_rxed(0, true, false, now, MAD);
        assert_eq!(space.ack_t, Some(now + MAD));
        assert!(!space.imm_ack);
        assert!(!space.needs_ack_tx(now));
        assert!(space.needs_ack_tx(now + MAD));
    }

    #[test]
    fn out_of_order_rx_wants_immediate_ack() {
        let mut space = space();
        let now = Instant::now();
        space.on_pkt_rxed(0, true, false, now, MAD);
        space.on_pkt_rxed(2, true, false, now, MAD);
        assert!(space.imm_ack);
        assert!(space.needs_ack_tx(now));
    }

    #[test]
    fn ce_mark_wants_immediate_ack() {
        let mut space = space();
        let now = Instant::now();
        space.on_pkt_rxed(0, true, true, now, MAD);
        assert!(space.imm_ack);
    }

    #[test]
    fn ack_tx_keeps_ranges_but_resets_counters() {
        let mut space = space();
        let now = Instant::now();
        space.on_pkt_rxed(0, true, false, now, MAD);
        space.on_pkt_rxed(1, true, false, now, MAD);
        space.on_ack_tx();
        assert_eq!(space.pkts_rxed_since_last_ack_tx, 0);
        assert!(space.has_ack_ranges());
        space.on_ack_acked(1);
        assert!(!space.has_ack_ranges());
        // dedupe survives the pruning
        assert!(!space.on_pkt_rxed(1, true, false, now, MAD));
    }

    #[test]
    fn out_frames_reflects_unresolved_packets_only(){
        let mut space = space();
        let nr = space.next_pn();
        space.on_pkt_sent(SentMeta {
            nr,
            epoch: Epoch::Data,
            t_sent: Instant::now(),
            udp_len: 100,
            in_flight: true,
            ack_eliciting: true,
            frames: frame_bit(FRAM_TYPE_STRM),
            strm: Some(StreamDataRef {
                id: StreamId(0),
                offset: 0,
                len: 50,
                fin: false,
            }),
            largest_acked_in_ack: None,
            acked: false,
            lost: false,
            rtx: Vec::new(),
        });
        assert!(space.has_unacked_data());
        space.sent.get_mut(&nr).unwrap().acked = true;
        assert!(!space.has_unacked_data());
    }
}
