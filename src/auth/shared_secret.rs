//! Shared-secret challenge-response authenticator.
//!
//! Both peers derive a frame key from a common secret with HKDF-SHA256. A
//! token is the hex BLAKE2s-256 digest of the key, an optional challenge
//! nonce and the frame's operation, channel, message id and payload.
//!
//! ```text
//! plain token:     hex(BLAKE2s(key || op || channel || id || payload))
//! after challenge: nonce ":" hex(BLAKE2s(key || nonce || op || channel || id || payload))
//! ```
//!
//! Nonces are single use. With `require_challenge` set, plain tokens are
//! never accepted and every frame goes through a challenge round trip.

use std::collections::{HashSet, VecDeque};

use blake2::{Blake2s256, Digest};
use hkdf::Hkdf;
use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{AuthContext, AuthError, Authenticator, ContextKey};
use crate::wire::Frame;

/// HKDF info label for the frame key.
const KEY_INFO: &[u8] = b"relaywire v1 frame auth";

/// Frame key size.
const KEY_SIZE: usize = 32;

/// Random bytes per challenge nonce, before hex encoding.
const NONCE_SIZE: usize = 16;

/// Unanswered challenges remembered before the oldest is forgotten.
pub const MAX_OUTSTANDING_CHALLENGES: usize = 256;

#[derive(Zeroize, ZeroizeOnDrop)]
struct FrameKey([u8; KEY_SIZE]);

/// Authenticator keyed by a secret both peers know.
pub struct SharedSecretAuthentication {
    key: FrameKey,
    issued: Mutex<VecDeque<String>>,
    require_challenge: bool,
}

impl SharedSecretAuthentication {
    /// Derive the frame key from `secret`.
    pub fn new(secret: &[u8]) -> Result<Self, AuthError> {
        let hk = Hkdf::<Sha256>::new(None, secret);
        let mut key = [0u8; KEY_SIZE];
        hk.expand(KEY_INFO, &mut key)
            .map_err(|_| AuthError::Crypto("frame key derivation failed".into()))?;
        let frame_key = FrameKey(key);
        key.zeroize();

        Ok(Self {
            key: frame_key,
            issued: Mutex::new(VecDeque::new()),
            require_challenge: false,
        })
    }

    /// Refuse plain tokens so every frame must answer a fresh challenge.
    pub fn require_challenge(mut self, required: bool) -> Self {
        self.require_challenge = required;
        self
    }

    fn digest(&self, nonce: &str, frame: &Frame) -> String {
        let mut hasher = Blake2s256::new();
        hasher.update(&self.key.0);
        hasher.update(nonce.as_bytes());
        hasher.update([frame.operation().as_byte(), frame.channel()]);
        hasher.update(frame.message_id().to_be_bytes());
        hasher.update(frame.payload());
        hex::encode(hasher.finalize())
    }

    fn take_nonce(&self, nonce: &str) -> bool {
        let mut issued = self.issued.lock();
        match issued.iter().position(|n| n == nonce) {
            Some(pos) => {
                issued.remove(pos);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for SharedSecretAuthentication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecretAuthentication")
            .field("outstanding", &self.issued.lock().len())
            .field("require_challenge", &self.require_challenge)
            .finish_non_exhaustive()
    }
}

impl Authenticator for SharedSecretAuthentication {
    fn negotiate_context_keys(
        &self,
        _offered: &HashSet<ContextKey>,
    ) -> Result<HashSet<ContextKey>, AuthError> {
        Ok(HashSet::new())
    }

    fn verify(&self, frame: &Frame, _context: &AuthContext) -> Result<bool, AuthError> {
        let Some(token) = frame.auth() else {
            return Ok(false);
        };
        match token.split_once(':') {
            Some((nonce, mac)) => {
                if !self.take_nonce(nonce) {
                    return Ok(false);
                }
                Ok(constant_time_eq(mac, &self.digest(nonce, frame)))
            }
            None if self.require_challenge => Ok(false),
            None => Ok(constant_time_eq(token, &self.digest("", frame))),
        }
    }

    fn create_challenge(&self, _frame: &Frame, _context: &AuthContext) -> String {
        let mut raw = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut raw);
        let nonce = hex::encode(raw);

        let mut issued = self.issued.lock();
        if issued.len() >= MAX_OUTSTANDING_CHALLENGES {
            issued.pop_front();
        }
        issued.push_back(nonce.clone());
        nonce
    }

    fn create_response(
        &self,
        challenge: Option<&Frame>,
        outgoing: &Frame,
        _context: &AuthContext,
    ) -> String {
        match challenge.and_then(Frame::auth) {
            Some(nonce) => format!("{nonce}:{}", self.digest(nonce, outgoing)),
            None => self.digest("", outgoing),
        }
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a
            .bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Operation;

    fn frame() -> Frame {
        Frame::message(2, 77, b"payload".to_vec()).unwrap()
    }

    #[test]
    fn test_plain_token_accepted() {
        let a = SharedSecretAuthentication::new(b"secret").unwrap();
        let b = SharedSecretAuthentication::new(b"secret").unwrap();
        let ctx = AuthContext::new();

        let mut f = frame();
        f.set_auth(Some(a.create_response(None, &f, &ctx))).unwrap();
        assert!(b.verify(&f, &ctx).unwrap());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let a = SharedSecretAuthentication::new(b"secret").unwrap();
        let b = SharedSecretAuthentication::new(b"other").unwrap();
        let ctx = AuthContext::new();

        let mut f = frame();
        f.set_auth(Some(a.create_response(None, &f, &ctx))).unwrap();
        assert!(!b.verify(&f, &ctx).unwrap());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let a = SharedSecretAuthentication::new(b"secret").unwrap();
        let ctx = AuthContext::new();

        let f = frame();
        let token = a.create_response(None, &f, &ctx);
        let tampered = f.with_payload(b"other".to_vec()).with_auth(Some(token)).unwrap();
        assert!(!a.verify(&tampered, &ctx).unwrap());
    }

    #[test]
    fn test_challenge_roundtrip_single_use() {
        let sender = SharedSecretAuthentication::new(b"secret").unwrap();
        let receiver = SharedSecretAuthentication::new(b"secret")
            .unwrap()
            .require_challenge(true);
        let ctx = AuthContext::new();

        let mut f = frame();
        f.set_auth(Some(sender.create_response(None, &f, &ctx))).unwrap();
        assert!(!receiver.verify(&f, &ctx).unwrap());

        let nonce = receiver.create_challenge(&f, &ctx);
        let challenge = Frame::new(Operation::Challenge)
            .with_auth(Some(nonce))
            .unwrap();
        f.set_auth(Some(sender.create_response(Some(&challenge), &f, &ctx)))
            .unwrap();
        assert!(receiver.verify(&f, &ctx).unwrap());
        // Replaying the same answer fails: the nonce was consumed.
        assert!(!receiver.verify(&f, &ctx).unwrap());
    }

    #[test]
    fn test_outstanding_challenges_bounded() {
        let auth = SharedSecretAuthentication::new(b"secret").unwrap();
        let ctx = AuthContext::new();
        let f = frame();
        for _ in 0..MAX_OUTSTANDING_CHALLENGES + 10 {
            auth.create_challenge(&f, &ctx);
        }
        assert_eq!(auth.issued.lock().len(), MAX_OUTSTANDING_CHALLENGES);
    }
}
