use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::crypto::cipher::{CipherSuiteProfile, KeyMaterial};
use crate::crypto::prf;
use crate::error::{Error, Result};
use crate::wire::cipher_suite::CipherSuiteId;
use crate::wire::content::ContentType;
use crate::wire::record::ProtocolVersion;

/// RFC 6347 §4.1.2.6: a 64-entry sliding bitmap tracking which sequence
/// numbers within the window have already been seen for the current epoch.
/// Grounded on the `SlidingWindowDetector::new(window, max_seq).check(seq)`
/// shape the teacher's `conn.rs` drives, rewritten locally since no source
/// for the crate backing that type was retrieved in this pack.
pub struct ReplayWindow {
    window_size: u64,
    upper_bound: u64,
    bitmap: u64,
}

impl ReplayWindow {
    pub fn new(window_size: u64) -> Self {
        ReplayWindow { window_size, upper_bound: 0, bitmap: 0 }
    }

    /// Returns `true` if `seq` is new and falls inside (or ahead of) the
    /// current window; `false` if it is a duplicate or too old to track.
    pub fn check(&self, seq: u64) -> bool {
        if seq > self.upper_bound {
            return true;
        }
        let diff = self.upper_bound - seq;
        if diff >= self.window_size {
            return false;
        }
        self.bitmap & (1 << diff) == 0
    }

    /// Marks `seq` as seen. Callers must call `check` first; `accept` does
    /// not re-validate.
    pub fn accept(&mut self, seq: u64) {
        if seq > self.upper_bound {
            let shift = seq - self.upper_bound;
            self.bitmap = if shift >= self.window_size { 0 } else { self.bitmap << shift };
            self.bitmap |= 1;
            self.upper_bound = seq;
        } else {
            let diff = self.upper_bound - seq;
            self.bitmap |= 1 << diff;
        }
    }
}

use crate::credential::PeerIdentity;

/// Per-epoch read/write key material and sequencing state. A freshly
/// negotiated epoch replaces this wholesale; epoch 0 (pre-handshake) has no
/// `Session` at all, matching spec.md §4.C.
pub struct Session {
    pub cipher_suite: CipherSuiteId,
    profile: CipherSuiteProfile,
    local_epoch: AtomicU16,
    local_sequence_number: AtomicU64,
    remote_epoch: u16,
    replay_window: ReplayWindow,
    local_keys: KeyMaterial,
    remote_keys: KeyMaterial,
    pub peer_identity: Option<PeerIdentity>,
    pub master_secret: Vec<u8>,
}

impl Session {
    pub fn new(
        cipher_suite: CipherSuiteId,
        epoch: u16,
        local_keys: KeyMaterial,
        remote_keys: KeyMaterial,
        master_secret: Vec<u8>,
        replay_window_size: u64,
        peer_identity: Option<PeerIdentity>,
    ) -> Self {
        Session {
            cipher_suite,
            profile: crate::crypto::cipher::profile_for(cipher_suite),
            local_epoch: AtomicU16::new(epoch),
            local_sequence_number: AtomicU64::new(0),
            remote_epoch: epoch,
            replay_window: ReplayWindow::new(replay_window_size),
            local_keys,
            remote_keys,
            peer_identity,
            master_secret,
        }
    }

    pub fn epoch(&self) -> u16 {
        self.local_epoch.load(Ordering::SeqCst)
    }

    fn next_sequence_number(&self) -> Result<u64> {
        let seq = self.local_sequence_number.fetch_add(1, Ordering::SeqCst);
        if seq > crate::wire::record::MAX_SEQUENCE_NUMBER {
            return Err(Error::SeqExhausted);
        }
        Ok(seq)
    }

    /// Hands out the next write sequence number for this epoch without
    /// encrypting anything — used for plaintext records (Alerts) that still
    /// need to advance the same counter application data does.
    pub fn reserve_sequence_number(&self) -> Result<u64> {
        self.next_sequence_number()
    }

    /// Advances the epoch this session expects inbound records at, once a
    /// ChangeCipherSpec confirms the peer has moved to it.
    pub fn advance_remote_epoch(&mut self) {
        self.remote_epoch += 1;
    }

    pub fn check_replay(&self, seq: u64) -> bool {
        self.replay_window.check(seq)
    }

    pub fn accept_replay(&mut self, seq: u64) {
        self.replay_window.accept(seq)
    }

    /// Encrypts `plaintext` for sending, assigning the next local sequence
    /// number and building the 13-byte AEAD/CBC additional data exactly as
    /// the teacher's `generate_aead_additional_data` does: seq(8) ||
    /// type(1) || version(2) || length(2), with `length` filled in by the
    /// caller after the ciphertext length is known.
    pub fn encrypt_outbound(
        &self,
        content_type: ContentType,
        version: ProtocolVersion,
        plaintext: &[u8],
    ) -> Result<(u64, Vec<u8>)> {
        let seq = self.next_sequence_number()?;
        let aad = additional_data(self.epoch(), seq, content_type, version, plaintext.len() as u16);
        let explicit_nonce = seq.to_be_bytes();
        let ciphertext = self.profile.seal(&self.local_keys, &explicit_nonce[2..], &aad, plaintext)?;
        Ok((seq, ciphertext))
    }

    pub fn decrypt_inbound(
        &self,
        epoch: u16,
        seq: u64,
        content_type: ContentType,
        version: ProtocolVersion,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        if epoch != self.remote_epoch {
            return Err(Error::BadRecordMac);
        }
        // additional_data's length field covers the plaintext length, which
        // CBC/AEAD implementations recompute internally after removing
        // nonce/tag/padding overhead; pass 0 here and let `profile.open`
        // authenticate against the ciphertext framing instead.
        let aad = additional_data(epoch, seq, content_type, version, 0);
        self.profile.open(&self.remote_keys, &aad, ciphertext)
    }
}

fn additional_data(
    epoch: u16,
    seq: u64,
    content_type: ContentType,
    version: ProtocolVersion,
    length: u16,
) -> [u8; 13] {
    let mut aad = [0u8; 13];
    aad[0..2].copy_from_slice(&epoch.to_be_bytes());
    aad[2..8].copy_from_slice(&seq.to_be_bytes()[2..8]);
    aad[8] = content_type as u8;
    aad[9] = version.major;
    aad[10] = version.minor;
    aad[11..13].copy_from_slice(&length.to_be_bytes());
    aad
}

/// RFC 5246 §6.3: derives the key_block from the master secret and splits it
/// into per-direction `KeyMaterial` for the negotiated cipher suite.
pub fn derive_keys(
    cipher_suite: CipherSuiteId,
    master_secret: &[u8],
    server_random: &[u8],
    client_random: &[u8],
) -> (KeyMaterial, KeyMaterial) {
    let profile = crate::crypto::cipher::profile_for(cipher_suite);
    let key_block = prf::key_expansion(master_secret, server_random, client_random, profile.key_block_len());
    profile.split_key_block(&key_block)
}

/// What an abbreviated handshake needs to skip straight to Finished:
/// RFC 5246 §7.3's resumed-session inputs, keyed by `session_id`.
#[derive(Clone)]
pub struct ResumableSession {
    pub cipher_suite: CipherSuiteId,
    pub master_secret: Vec<u8>,
    pub peer_identity: Option<crate::credential::PeerIdentity>,
}

/// Shared across every connection off one `Connector` (and handed to a
/// `Handshaker` explicitly when a caller wants to offer a prior session),
/// since resumption must outlive any single `Connection`'s lifetime.
pub type ResumptionCache = Arc<Mutex<HashMap<Vec<u8>, ResumableSession>>>;

pub fn new_resumption_cache() -> ResumptionCache {
    Arc::new(Mutex::new(HashMap::new()))
}

#[cfg(test)]
mod session_test {
    use super::*;

    #[test]
    fn replay_window_rejects_duplicate() {
        let mut w = ReplayWindow::new(64);
        assert!(w.check(5));
        w.accept(5);
        assert!(!w.check(5));
    }

    #[test]
    fn replay_window_rejects_too_old() {
        let mut w = ReplayWindow::new(64);
        w.accept(1000);
        assert!(!w.check(10));
    }

    #[test]
    fn replay_window_accepts_future_and_fills_gap() {
        let mut w = ReplayWindow::new(64);
        w.accept(10);
        assert!(w.check(15));
        w.accept(15);
        assert!(w.check(12));
        w.accept(12);
        assert!(!w.check(12));
    }
}
