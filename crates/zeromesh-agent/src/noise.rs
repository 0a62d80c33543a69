//! Session keying and transport encryption.
//!
//! The running protocol is a deterministic PSK-derived static-key session:
//! both sides compute the same pair of directional ChaCha20-Poly1305 keys
//! from the network PSK and the two static public keys, so a single
//! plaintext hello in each direction is enough to bring a link up. There is
//! no forward secrecy; the PSK rotates at the network level.

use crate::error::CipherError;
use blake2::digest::Mac;
use blake2::{Blake2s256, Blake2sMac256, Digest};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub const KEY_SIZE: usize = 32;
pub const PSK_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce size.
pub const NONCE_SIZE: usize = 12;

/// Poly1305 authentication tag size.
pub const TAG_SIZE: usize = 16;

/// Length of the counter prefix on every data payload.
pub const COUNTER_SIZE: usize = 8;

/// Per-frame overhead added by the transport cipher.
pub const CIPHER_OVERHEAD: usize = COUNTER_SIZE + TAG_SIZE;

/// Depth of the receive-side replay window.
pub const REPLAY_WINDOW: u64 = 64;

const KEY_LABEL_1: &[u8] = b"zerogo-psk-key-1";
const KEY_LABEL_2: &[u8] = b"zerogo-psk-key-2";

/// Keyed BLAKE2s, the derivation MAC used throughout session keying.
fn keyed_blake2s(key: &[u8; KEY_SIZE], data: &[u8]) -> [u8; KEY_SIZE] {
    let mut mac =
        <Blake2sMac256 as KeyInit>::new_from_slice(key).expect("BLAKE2s accepts 32-byte keys");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Derives deterministic directional keys from a PSK and two public keys.
/// Both sides sort the public keys before hashing so they agree on the
/// master; the side whose key sorts lower sends with k1 and receives with
/// k2, the other side the reverse.
pub fn derive_keys_from_psk(
    psk: &[u8; PSK_SIZE],
    local_pub: &[u8; KEY_SIZE],
    remote_pub: &[u8; KEY_SIZE],
) -> ([u8; KEY_SIZE], [u8; KEY_SIZE]) {
    let local_is_smaller = local_pub < remote_pub;
    let (small, large) = if local_is_smaller {
        (local_pub, remote_pub)
    } else {
        (remote_pub, local_pub)
    };

    let mut hasher = Blake2s256::new();
    hasher.update(psk);
    hasher.update(small);
    hasher.update(large);
    let master: [u8; KEY_SIZE] = hasher.finalize().into();

    let k1 = keyed_blake2s(&master, KEY_LABEL_1);
    let k2 = keyed_blake2s(&master, KEY_LABEL_2);

    debug!(
        "derived session keys (fingerprint {:02x}{:02x}{:02x}{:02x})",
        master[0], master[1], master[2], master[3]
    );

    if local_is_smaller {
        (k1, k2)
    } else {
        (k2, k1)
    }
}

/// Sliding-window replay tracker: highest counter seen plus a bitmap of the
/// 64 counters below it. Anything older than the window or already marked
/// is rejected; reordering inside the window is fine.
struct ReplayWindow {
    greatest: u64,
    bitmap: u64,
    initialized: bool,
}

impl ReplayWindow {
    fn new() -> Self {
        ReplayWindow {
            greatest: 0,
            bitmap: 0,
            initialized: false,
        }
    }

    /// Returns true if the counter is fresh, marking it seen.
    fn check_and_update(&mut self, counter: u64) -> bool {
        if !self.initialized {
            self.greatest = counter;
            self.bitmap = 1;
            self.initialized = true;
            return true;
        }
        if counter > self.greatest {
            let shift = counter - self.greatest;
            self.bitmap = if shift >= 64 { 0 } else { self.bitmap << shift };
            self.bitmap |= 1;
            self.greatest = counter;
            return true;
        }
        let diff = self.greatest - counter;
        if diff >= REPLAY_WINDOW {
            return false;
        }
        let bit = 1u64 << diff;
        if self.bitmap & bit != 0 {
            return false;
        }
        self.bitmap |= bit;
        true
    }
}

/// Authenticated transport encryption for one peer link.
///
/// Wire format of a data payload: 8-byte little-endian send counter,
/// followed by the AEAD ciphertext (tag included). The nonce is four zero
/// bytes then the little-endian counter; associated data is empty. The
/// send counter is strictly increasing and never reused with the same key.
pub struct TransportCipher {
    send_cipher: ChaCha20Poly1305,
    recv_cipher: ChaCha20Poly1305,
    send_counter: AtomicU64,
    replay: Mutex<ReplayWindow>,
}

impl TransportCipher {
    pub fn new(send_key: &[u8; KEY_SIZE], recv_key: &[u8; KEY_SIZE]) -> Self {
        TransportCipher {
            send_cipher: ChaCha20Poly1305::new(Key::from_slice(send_key)),
            recv_cipher: ChaCha20Poly1305::new(Key::from_slice(recv_key)),
            send_counter: AtomicU64::new(0),
            replay: Mutex::new(ReplayWindow::new()),
        }
    }

    fn nonce_for(counter: u64) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[4..].copy_from_slice(&counter.to_le_bytes());
        nonce
    }

    /// Encrypts a frame, prepending the 8-byte counter.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let counter = self.send_counter.fetch_add(1, Ordering::SeqCst);
        let nonce = Self::nonce_for(counter);
        let ciphertext = self
            .send_cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CipherError::Encryption)?;

        let mut out = Vec::with_capacity(COUNTER_SIZE + ciphertext.len());
        out.extend_from_slice(&counter.to_le_bytes());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypts a data payload (counter prefix + ciphertext + tag) and
    /// enforces the replay window after the tag verifies.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        if data.len() < COUNTER_SIZE + TAG_SIZE {
            return Err(CipherError::TooShort);
        }
        let counter = u64::from_le_bytes(
            data[..COUNTER_SIZE]
                .try_into()
                .map_err(|_| CipherError::TooShort)?,
        );
        let nonce = Self::nonce_for(counter);
        let plaintext = self
            .recv_cipher
            .decrypt(Nonce::from_slice(&nonce), &data[COUNTER_SIZE..])
            .map_err(|_| CipherError::Authentication)?;

        let mut replay = self.replay.lock().expect("replay window lock poisoned");
        if !replay.check_and_update(counter) {
            return Err(CipherError::Replay(counter));
        }
        Ok(plaintext)
    }

    /// Counter that the next encrypt call will use.
    pub fn send_counter(&self) -> u64 {
        self.send_counter.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher_pair() -> (TransportCipher, TransportCipher) {
        let psk = [0u8; PSK_SIZE];
        let pub_a = [1u8; KEY_SIZE];
        let pub_b = [2u8; KEY_SIZE];
        let (a_send, a_recv) = derive_keys_from_psk(&psk, &pub_a, &pub_b);
        let (b_send, b_recv) = derive_keys_from_psk(&psk, &pub_b, &pub_a);
        (
            TransportCipher::new(&a_send, &a_recv),
            TransportCipher::new(&b_send, &b_recv),
        )
    }

    #[test]
    fn test_key_derivation_symmetry() {
        let psk = [7u8; PSK_SIZE];
        let pub_a = [1u8; KEY_SIZE];
        let pub_b = [9u8; KEY_SIZE];
        let (a_send, a_recv) = derive_keys_from_psk(&psk, &pub_a, &pub_b);
        let (b_send, b_recv) = derive_keys_from_psk(&psk, &pub_b, &pub_a);
        assert_eq!(a_send, b_recv);
        assert_eq!(a_recv, b_send);
        assert_ne!(a_send, a_recv);
    }

    #[test]
    fn test_different_psk_different_keys() {
        let pub_a = [1u8; KEY_SIZE];
        let pub_b = [2u8; KEY_SIZE];
        let (k1, _) = derive_keys_from_psk(&[0u8; PSK_SIZE], &pub_a, &pub_b);
        let (k2, _) = derive_keys_from_psk(&[1u8; PSK_SIZE], &pub_a, &pub_b);
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let (a, b) = cipher_pair();
        let frame = b"an ethernet frame".to_vec();
        let wire = a.encrypt(&frame).unwrap();
        assert_eq!(wire.len(), frame.len() + CIPHER_OVERHEAD);
        assert_eq!(b.decrypt(&wire).unwrap(), frame);

        // and the reverse direction
        let wire = b.encrypt(&frame).unwrap();
        assert_eq!(a.decrypt(&wire).unwrap(), frame);
    }

    #[test]
    fn test_counter_embedded_and_monotonic() {
        let (a, _) = cipher_pair();
        for expected in 0..1_000_000u64 {
            let wire = a.encrypt(b"").unwrap();
            let counter = u64::from_le_bytes(wire[..8].try_into().unwrap());
            assert_eq!(counter, expected);
        }
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let (a, b) = cipher_pair();
        let mut wire = a.encrypt(b"payload").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xff;
        assert!(matches!(b.decrypt(&wire), Err(CipherError::Authentication)));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let (a, b) = cipher_pair();
        let wire = a.encrypt(b"payload").unwrap();
        assert!(matches!(
            b.decrypt(&wire[..COUNTER_SIZE + TAG_SIZE - 1]),
            Err(CipherError::TooShort)
        ));
    }

    #[test]
    fn test_reordered_delivery_accepted_duplicate_rejected() {
        let (a, b) = cipher_pair();
        let mut messages = Vec::new();
        for i in 0..10u8 {
            messages.push(a.encrypt(&[i]).unwrap());
        }
        // out-of-order delivery within the window
        for &idx in &[3usize, 1, 0, 5, 2, 4, 6, 7, 8, 9] {
            assert_eq!(b.decrypt(&messages[idx]).unwrap(), vec![idx as u8]);
        }
        // a second copy of counter 5 must be rejected
        assert!(matches!(
            b.decrypt(&messages[5]),
            Err(CipherError::Replay(5))
        ));
    }

    #[test]
    fn test_counter_below_window_rejected() {
        let (a, b) = cipher_pair();
        let old = a.encrypt(b"old").unwrap();
        for _ in 0..100 {
            let wire = a.encrypt(b"x").unwrap();
            b.decrypt(&wire).unwrap();
        }
        assert!(matches!(b.decrypt(&old), Err(CipherError::Replay(0))));
    }

    #[test]
    fn test_no_cipher_state_shared_between_links() {
        let (a1, b1) = cipher_pair();
        let (_a2, b2) = cipher_pair();
        let wire = a1.encrypt(b"frame").unwrap();
        assert!(b1.decrypt(&wire).is_ok());
        // same keys (same inputs) but an independent replay window
        assert!(b2.decrypt(&wire).is_ok());
    }
}
