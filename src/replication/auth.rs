//! Node authentication tokens.
//!
//! A token is the JSON `NodeAuth` sealed with AES-256-GCM under the node key
//! shared by the primary and its replicas, hex encoded as
//! `nonce || ciphertext || tag`. The primary accepts a token only when its
//! timestamp is within [`MAX_CLOCK_SKEW_SECS`] of its own clock.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

use crate::replication::types::NodeAuth;

/// Accepted distance between the token timestamp and the verifier's clock.
pub const MAX_CLOCK_SKEW_SECS: u64 = 180;

const KEY_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("node key must be {KEY_LEN} bytes of hex")]
    InvalidKey,

    #[error("token is not valid hex or too short")]
    Malformed,

    #[error("token failed authentication")]
    Decrypt,

    #[error("token timestamp is {skew} seconds away from local time")]
    Expired { skew: u64 },

    #[error("system random source failed")]
    Random,
}

pub struct NodeKey {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl NodeKey {
    pub fn from_hex(hex_key: &str) -> Result<Self, AuthError> {
        let bytes = hex::decode(hex_key.trim()).map_err(|_| AuthError::InvalidKey)?;
        if bytes.len() != KEY_LEN {
            return Err(AuthError::InvalidKey);
        }
        let unbound = UnboundKey::new(&AES_256_GCM, &bytes).map_err(|_| AuthError::InvalidKey)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// A fresh random key, hex encoded.
    pub fn generate_hex() -> Result<String, AuthError> {
        let mut bytes = [0u8; KEY_LEN];
        SystemRandom::new().fill(&mut bytes).map_err(|_| AuthError::Random)?;
        Ok(hex::encode(bytes))
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, AuthError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce_bytes).map_err(|_| AuthError::Random)?;

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce_bytes), Aad::empty(), &mut in_out)
            .map_err(|_| AuthError::Decrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, AuthError> {
        if sealed.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(AuthError::Malformed);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| AuthError::Malformed)?;
        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| AuthError::Decrypt)?;
        Ok(plaintext.to_vec())
    }

    /// Token asserting `now` as the caller's time.
    pub fn issue_token(&self, now: i64) -> Result<String, AuthError> {
        let plaintext = serde_json::to_vec(&NodeAuth { cur_time: now }).map_err(|_| AuthError::Malformed)?;
        Ok(hex::encode(self.seal(&plaintext)?))
    }

    /// Check a token against the local clock `now`.
    pub fn verify_token(&self, token: &str, now: i64) -> Result<NodeAuth, AuthError> {
        let sealed = hex::decode(token).map_err(|_| AuthError::Malformed)?;
        let plaintext = self.open(&sealed)?;
        let auth: NodeAuth = serde_json::from_slice(&plaintext).map_err(|_| AuthError::Malformed)?;

        let skew = now.abs_diff(auth.cur_time);
        if skew > MAX_CLOCK_SKEW_SECS {
            return Err(AuthError::Expired { skew });
        }
        Ok(auth)
    }
}

impl std::fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("NodeKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_token_accepted_within_window() {
        let key = NodeKey::from_hex(KEY).unwrap();
        let token = key.issue_token(1_000_000).unwrap();

        assert_eq!(key.verify_token(&token, 1_000_000).unwrap().cur_time, 1_000_000);
        assert!(key.verify_token(&token, 1_000_179).is_ok());
        assert!(key.verify_token(&token, 999_821).is_ok());
        assert!(key.verify_token(&token, 1_000_180).is_ok());
    }

    #[test]
    fn test_token_rejected_outside_window() {
        let key = NodeKey::from_hex(KEY).unwrap();
        let token = key.issue_token(1_000_000).unwrap();

        assert_eq!(key.verify_token(&token, 1_000_181), Err(AuthError::Expired { skew: 181 }));
        assert_eq!(key.verify_token(&token, 999_819), Err(AuthError::Expired { skew: 181 }));
    }

    #[test]
    fn test_extreme_timestamps_rejected() {
        let key = NodeKey::from_hex(KEY).unwrap();
        for forged in [i64::MIN, i64::MAX] {
            let token = key.issue_token(forged).unwrap();
            assert!(matches!(key.verify_token(&token, 1_000_000), Err(AuthError::Expired { .. })));
        }
    }

    #[test]
    fn test_wrong_key_and_tampering_rejected() {
        let key = NodeKey::from_hex(KEY).unwrap();
        let other = NodeKey::from_hex(&NodeKey::generate_hex().unwrap()).unwrap();
        let token = key.issue_token(42).unwrap();

        assert_eq!(other.verify_token(&token, 42), Err(AuthError::Decrypt));

        let mut bytes = hex::decode(&token).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert_eq!(key.verify_token(&hex::encode(bytes), 42), Err(AuthError::Decrypt));

        assert_eq!(key.verify_token("zz", 42), Err(AuthError::Malformed));
        assert_eq!(key.verify_token("00ff", 42), Err(AuthError::Malformed));
    }

    #[test]
    fn test_nonces_differ() {
        let key = NodeKey::from_hex(KEY).unwrap();
        assert_ne!(key.issue_token(1).unwrap(), key.issue_token(1).unwrap());
    }

    #[test]
    fn test_key_length_checked() {
        assert_eq!(NodeKey::from_hex("abcd").unwrap_err(), AuthError::InvalidKey);
        assert_eq!(NodeKey::from_hex("not hex").unwrap_err(), AuthError::InvalidKey);
        assert_eq!(NodeKey::generate_hex().unwrap().len(), 64);
    }
}
