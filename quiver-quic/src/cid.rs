//! Connection-ID management: the issued set of local scids, the peer's
//! advertised dcids, the active pair, retirement and voluntary switching.

use crate::error::{Result, TransportError};
use crate::frames::NewConnectionIdFrame;
use crate::types::{ConnectionId, SRT_LEN};
use rand::RngCore;
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

/// One connection ID with its sequence number and reset token.
#[derive(Debug, Clone)]
pub struct Cid {
    pub seq: u64,
    pub id: ConnectionId,
    pub srt: Option<[u8; SRT_LEN]>,
    pub retired: bool,
}

/// An ordered set of CIDs indexed by sequence number with one active entry.
#[derive(Debug, Default)]
pub struct CidSet {
    by_seq: BTreeMap<u64, Cid>,
    active_seq: Option<u64>,
}

impl CidSet {
    /// Insert a CID. Re-announcements of a known sequence number are
    /// accepted silently; a sequence-number reuse with different contents
    /// is a protocol violation.
    pub fn insert(&mut self, cid: Cid) -> Result<bool> {
        if let Some(existing) = self.by_seq.get(&cid.seq) {
            if existing.id != cid.id {
                return Err(TransportError::ProtocolViolation);
            }
            return Ok(false);
        }
        if self.active_seq.is_none() {
            self.active_seq = Some(cid.seq);
        }
        self.by_seq.insert(cid.seq, cid);
        Ok(true)
    }

    pub fn active(&self) -> Option<&Cid> {
        self.active_seq.and_then(|seq| self.by_seq.get(&seq))
    }

    pub fn active_seq(&self) -> Option<u64> {
        self.active_seq
    }

    pub fn get(&self, seq: u64) -> Option<&Cid> {
        self.by_seq.get(&seq)
    }

    pub fn by_id(&self, id: &ConnectionId) -> Option<&Cid> {
        self.by_seq.values().find(|cid| &cid.id == id)
    }

    /// Highest sequence number ever inserted.
    pub fn max_seq(&self) -> Option<u64> {
        self.by_seq.keys().next_back().copied()
    }

    pub fn next_seq(&self) -> u64 {
        self.max_seq().map_or(0, |seq| seq + 1)
    }

    /// Non-retired entries.
    pub fn active_count(&self) -> usize {
        self.by_seq.values().filter(|cid| !cid.retired).count()
    }

    /// Mark a sequence number retired. A retired CID never reactivates.
    pub fn retire(&mut self, seq: u64) -> Option<&Cid> {
        let cid = self.by_seq.get_mut(&seq)?;
        cid.retired = true;
        Some(cid)
    }

    /// Make `seq` the active entry; refuses retired entries.
    pub fn set_active(&mut self, seq: u64) -> bool {
        match self.by_seq.get(&seq) {
            Some(cid) if !cid.retired => {
                self.active_seq = Some(seq);
                true
            }
            _ => false,
        }
    }

    /// Smallest non-retired sequence number other than `not`, for picking a
    /// replacement after retirement.
    fn pick_replacement(&self, not: u64) -> Option<u64> {
        self.by_seq
            .values()
            .filter(|cid| !cid.retired && cid.seq != not)
            .map(|cid| cid.seq)
            .next()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cid> {
        self.by_seq.values()
    }
}

/// Both directions' CID sets plus the pending TX signals.
#[derive(Debug, Default)]
pub struct CidManager {
    /// CIDs we issued (the peer addresses us by these).
    pub scids: CidSet,
    /// CIDs the peer issued (we address the peer by these).
    pub dcids: CidSet,
    local_cid_len: usize,
    /// A NEW_CONNECTION_ID announcing a fresh scid is owed.
    pub tx_ncid: bool,
    /// RETIRE_CONNECTION_ID sequence numbers owed to the peer.
    pub tx_retire: Vec<u64>,
}

impl CidManager {
    pub fn new(local_cid_len: usize) -> Self {
        Self {
            local_cid_len,
            ..Self::default()
        }
    }

    pub fn local_cid_len(&self) -> usize {
        self.local_cid_len
    }

    /// Generate and register a fresh local scid; its stateless reset token
    /// derives from `reset_key`, so it can be regenerated statelessly.
    /// Zero-length configurations register an empty scid (the peer then
    /// routes to us by address).
    pub fn new_scid(&mut self, reset_key: &[u8]) -> Cid {
        let mut bytes = vec![0u8; self.local_cid_len];
        rand::thread_rng().fill_bytes(&mut bytes);
        let id = ConnectionId::new(bytes.into()).expect("generated within bounds");
        let cid = Cid {
            seq: self.scids.next_seq(),
            srt: Some(crate::token::stateless_reset_token(reset_key, &id)),
            id,
            retired: false,
        };
        self.scids
            .insert(cid.clone())
            .expect("fresh sequence number");
        cid
    }

    /// Register the peer's very first dcid (from the handshake packets
    /// rather than a NEW_CONNECTION_ID frame).
    pub fn seed_dcid(&mut self, id: ConnectionId, srt: Option<[u8; SRT_LEN]>) {
        let _ = self.dcids.insert(Cid {
            seq: 0,
            id,
            srt,
            retired: false,
        });
    }

    /// Attach an SRT learned later (e.g. from transport parameters) to a
    /// known dcid.
    pub fn set_dcid_srt(&mut self, seq: u64, srt: [u8; SRT_LEN]) {
        if let Some(cid) = self.dcids.by_seq.get_mut(&seq) {
            cid.srt = Some(srt);
        }
    }

    /// The client's provisional Initial dcid is replaced in place by the
    /// server-chosen scid on the first response.
    pub fn replace_initial_dcid(&mut self, id: ConnectionId) {
        if let Some(seq) = self.dcids.active_seq() {
            if let Some(active) = self.dcids.by_seq.get_mut(&seq) {
                debug!(old = %active.id, new = %id, "switching to server-chosen dcid");
                active.id = id;
            }
        }
    }

    /// Handle NEW_CONNECTION_ID.
    ///
    /// Duplicates are accepted silently; exceeding the advertised active
    /// CID limit is fatal.
    pub fn on_new_cid_frame(
        &mut self,
        frame: &NewConnectionIdFrame,
        act_cid_lim: u64,
    ) -> Result<()> {
        let inserted = self.dcids.insert(Cid {
            seq: frame.seq,
            id: frame.cid.clone(),
            srt: Some(frame.srt),
            retired: false,
        })?;
        if !inserted {
            trace!(seq = frame.seq, "duplicate NEW_CONNECTION_ID");
            return Ok(());
        }

        // retire-prior-to: drop everything below, and answer with
        // RETIRE_CONNECTION_ID for each.
        let below: Vec<u64> = self
            .dcids
            .by_seq
            .range(..frame.retire_prior_to)
            .filter(|(_, cid)| !cid.retired)
            .map(|(&seq, _)| seq)
            .collect();
        for seq in below {
            self.dcids.retire(seq);
            self.tx_retire.push(seq);
        }
        if self
            .dcids
            .active()
            .map_or(true, |active| active.retired)
        {
            if let Some(replacement) = self.dcids.pick_replacement(u64::MAX) {
                self.dcids.set_active(replacement);
            }
        }

        if self.dcids.active_count() as u64 > act_cid_lim {
            warn!(
                count = self.dcids.active_count(),
                limit = act_cid_lim,
                "peer exceeded active CID limit"
            );
            return Err(TransportError::ProtocolViolation);
        }
        Ok(())
    }

    /// Handle RETIRE_CONNECTION_ID: the peer stops using one of our scids.
    ///
    /// Returns the retired CID (so the endpoint can unmap it). If the
    /// active scid was retired, a replacement becomes active or a fresh one
    /// is owed (`tx_ncid`).
    pub fn on_retire_cid_frame(&mut self, seq: u64, reset_key: &[u8]) -> Result<Option<Cid>> {
        if self.scids.max_seq().map_or(true, |max| seq > max) {
            // Retiring a sequence number we never issued.
            return Err(TransportError::ProtocolViolation);
        }
        if self.scids.get(seq).is_none() {
            // Known range but already dropped; quietly ignore.
            debug!(seq, "RETIRE_CONNECTION_ID for unknown scid");
            return Ok(None);
        }
        let retired = self.scids.retire(seq).cloned();
        if self.scids.active_seq() == Some(seq) {
            match self.scids.pick_replacement(seq) {
                Some(replacement) => {
                    self.scids.set_active(replacement);
                }
                None => {
                    let fresh = self.new_scid(reset_key);
                    self.scids.set_active(fresh.seq);
                }
            }
            self.tx_ncid = true;
        }
        Ok(retired)
    }

    /// Voluntary migration: switch to the next-higher dcid if one exists,
    /// retiring the current one.
    pub fn switch_dcid(&mut self) -> bool {
        let Some(active) = self.dcids.active_seq() else {
            return false;
        };
        let next = self
            .dcids
            .by_seq
            .range(active + 1..)
            .find(|(_, cid)| !cid.retired)
            .map(|(&seq, _)| seq);
        let Some(next) = next else {
            return false;
        };
        self.dcids.retire(active);
        self.tx_retire.push(active);
        self.dcids.set_active(next);
        debug!(from = active, to = next, "switched active dcid");
        true
    }

    /// The active pair, as the packet coder needs them.
    pub fn active_scid(&self) -> Option<&ConnectionId> {
        self.scids.active().map(|cid| &cid.id)
    }

    pub fn active_dcid(&self) -> Option<&ConnectionId> {
        self.dcids.active().map(|cid| &cid.id)
    }

    /// All SRTs the peer gave us, for stateless-reset detection.
    pub fn peer_srts(&self) -> impl Iterator<Item = &[u8; SRT_LEN]> {
        self.dcids.iter().filter_map(|cid| cid.srt.as_ref())
    }
}
