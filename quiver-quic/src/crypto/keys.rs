//! Packet-protection key schedule.
//!
//! Per-epoch AEAD and header-protection contexts derived via
//! HKDF-Expand-Label. Initial keys come from a fixed draft-era salt and the
//! client-chosen destination CID; later epochs install TLS-exported
//! secrets. The data epoch can roll its secret forward for key updates.

use crate::error::{Result, TransportError};
use crate::types::Side;
use ring::aead::{self, quic, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::hkdf;

/// Draft-era initial salt.
const INITIAL_SALT: [u8; 20] = [
    0x7f, 0xbc, 0xdb, 0x0e, 0x7c, 0x66, 0xbb, 0xe9, 0x19, 0x3a, 0x96, 0xcd, 0x21, 0x51, 0x9e,
    0xbd, 0x7a, 0x02, 0x64, 0x4a,
];

/// AEAD overhead appended to every protected payload.
pub const AEAD_TAG_LEN: usize = 16;

/// Bytes of ciphertext sampled for the header-protection mask.
pub const SAMPLE_LEN: usize = 16;

const KEY_LEN: usize = 16;
const IV_LEN: usize = 12;

struct OutLen(usize);

impl hkdf::KeyType for OutLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// HKDF-Expand-Label with the TLS 1.3 "tls13 " prefix applied here, so
/// callers pass the bare label (`quic key`, `quic hp`, ...).
fn hkdf_expand_label(prk: &hkdf::Prk, label: &str, out: &mut [u8]) -> Result<()> {
    const PREFIX: &[u8] = b"tls13 ";
    let out_len = (out.len() as u16).to_be_bytes();
    let label_len = [(PREFIX.len() + label.len()) as u8];
    let info: [&[u8]; 5] = [&out_len, &label_len, PREFIX, label.as_bytes(), &[0u8]];
    prk.expand(&info, OutLen(out.len()))
        .and_then(|okm| okm.fill(out))
        .map_err(|_| TransportError::Internal)
}

/// One direction's packet-protection context for one epoch.
pub struct CipherCtx {
    aead: LessSafeKey,
    iv: [u8; IV_LEN],
    hp: quic::HeaderProtectionKey,
    /// Retained for the key-update ratchet.
    secret: [u8; 32],
}

impl CipherCtx {
    /// Derive key, IV and header-protection key from a traffic secret.
    pub fn from_secret(secret: &[u8]) -> Result<Self> {
        if secret.len() != 32 {
            return Err(TransportError::Internal);
        }
        let prk = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, secret);

        let mut key = [0u8; KEY_LEN];
        hkdf_expand_label(&prk, "quic key", &mut key)?;
        let mut iv = [0u8; IV_LEN];
        hkdf_expand_label(&prk, "quic iv", &mut iv)?;
        let mut hp_key = [0u8; KEY_LEN];
        hkdf_expand_label(&prk, "quic hp", &mut hp_key)?;

        let aead = LessSafeKey::new(
            UnboundKey::new(&aead::AES_128_GCM, &key).map_err(|_| TransportError::Internal)?,
        );
        let hp = quic::HeaderProtectionKey::new(&quic::AES_128, &hp_key)
            .map_err(|_| TransportError::Internal)?;

        let mut retained = [0u8; 32];
        retained.copy_from_slice(secret);
        Ok(Self {
            aead,
            iv,
            hp,
            secret: retained,
        })
    }

    /// The ratcheted context for the next key phase.
    pub fn next_phase(&self) -> Result<Self> {
        let prk = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, &self.secret);
        let mut next = [0u8; 32];
        hkdf_expand_label(&prk, "quic ku", &mut next)?;
        Self::from_secret(&next)
    }

    fn nonce(&self, pn: u64) -> Nonce {
        let mut nonce = self.iv;
        for (i, byte) in pn.to_be_bytes().iter().enumerate() {
            nonce[IV_LEN - 8 + i] ^= byte;
        }
        Nonce::assume_unique_for_key(nonce)
    }

    /// Encrypt `payload` in place (the tag is appended), with the header as
    /// associated data.
    pub fn seal(&self, pn: u64, header: &[u8], payload: &mut Vec<u8>) -> Result<()> {
        self.aead
            .seal_in_place_append_tag(self.nonce(pn), Aad::from(header), payload)
            .map_err(|_| TransportError::Internal)
    }

    /// Decrypt `ciphertext` in place. Returns the plaintext length, or
    /// `None` when authentication fails (the packet is dropped, never an
    /// error signal).
    pub fn open(&self, pn: u64, header: &[u8], ciphertext: &mut [u8]) -> Option<usize> {
        self.aead
            .open_in_place(self.nonce(pn), Aad::from(header), ciphertext)
            .ok()
            .map(|plain| plain.len())
    }

    /// Header-protection mask from a ciphertext sample.
    pub fn hp_mask(&self, sample: &[u8]) -> Result<[u8; 5]> {
        self.hp
            .new_mask(sample)
            .map_err(|_| TransportError::Internal)
    }
}

/// Derive both directions' Initial contexts from the client-chosen dcid.
///
/// Returns `(tx, rx)` for the given side.
pub fn initial_ctxs(client_dcid: &[u8], side: Side) -> Result<(CipherCtx, CipherCtx)> {
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT).extract(client_dcid);
    let mut client_secret = [0u8; 32];
    hkdf_expand_label(&prk, "client in", &mut client_secret)?;
    let mut server_secret = [0u8; 32];
    hkdf_expand_label(&prk, "server in", &mut server_secret)?;

    let client = CipherCtx::from_secret(&client_secret)?;
    let server = CipherCtx::from_secret(&server_secret)?;
    Ok(match side {
        Side::Client => (client, server),
        Side::Server => (server, client),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DCID: &[u8] = &[0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08];

    /// The two sides derive mirrored Initial contexts.
    #[test]
    fn initial_ctxs_are_mirrored() {
        let (client_tx, client_rx) = initial_ctxs(DCID, Side::Client).unwrap();
        let (server_tx, server_rx) = initial_ctxs(DCID, Side::Server).unwrap();

        let header = b"fake header";
        let mut payload = b"client initial payload".to_vec();
        client_tx.seal(0, header, &mut payload).unwrap();
        let len = server_rx.open(0, header, &mut payload).expect("decrypt");
        assert_eq!(&payload[..len], b"client initial payload");

        let mut payload = b"server reply".to_vec();
        server_tx.seal(1, header, &mut payload).unwrap();
        let len = client_rx.open(1, header, &mut payload).expect("decrypt");
        assert_eq!(&payload[..len], b"server reply");
    }

    #[test]
    fn tampered_ciphertext_fails_open() {
        let (tx, _) = initial_ctxs(DCID, Side::Client).unwrap();
        let (_, rx) = initial_ctxs(DCID, Side::Server).unwrap();
        let mut payload = b"payload".to_vec();
        tx.seal(7, b"hdr", &mut payload).unwrap();
        payload[0] ^= 0xff;
        assert!(rx.open(7, b"hdr", &mut payload).is_none());
    }

    #[test]
    fn wrong_pn_fails_open() {
        let (tx, _) = initial_ctxs(DCID, Side::Client).unwrap();
        let (_, rx) = initial_ctxs(DCID, Side::Server).unwrap();
        let mut payload = b"payload".to_vec();
        tx.seal(7, b"hdr", &mut payload).unwrap();
        assert!(rx.open(8, b"hdr", &mut payload).is_none());
    }

    /// Mask derivation is deterministic per sample; pair (apply, undo) is
    /// the identity because masking is XOR.
    #[test]
    fn hp_mask_is_deterministic() {
        let (tx, _) = initial_ctxs(DCID, Side::Client).unwrap();
        let sample = [0x5a; SAMPLE_LEN];
        let m1 = tx.hp_mask(&sample).unwrap();
        let m2 = tx.hp_mask(&sample).unwrap();
        assert_eq!(m1, m2);
        let other = tx.hp_mask(&[0x11; SAMPLE_LEN]).unwrap();
        assert_ne!(m1, other);
    }

    #[test]
    fn key_update_ratchet_changes_keys_in_lockstep() {
        let (client_tx, _) = initial_ctxs(DCID, Side::Client).unwrap();
        let (_, server_rx) = initial_ctxs(DCID, Side::Server).unwrap();
        let client_next = client_tx.next_phase().unwrap();
        let server_next = server_rx.next_phase().unwrap();

        let mut payload = b"post-update".to_vec();
        client_next.seal(0, b"h", &mut payload).unwrap();
        // Old keys no longer open it; ratcheted keys do.
        let mut copy = payload.clone();
        assert!(server_rx.open(0, b"h", &mut copy).is_none());
        let len = server_next.open(0, b"h", &mut payload).unwrap();
        assert_eq!(&payload[..len], b"post-update");
    }
}
