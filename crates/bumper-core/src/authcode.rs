//! HMAC auth codes handed to companion apps by the login API.
//!
//! Apps present the code as their password on both protocols. Format (hex):
//! `[8-byte expiry][32-byte HMAC-SHA256 over expiry || user id]`

use crate::error::{BumperError, BumperResult};
use ring::hmac;
use std::time::{SystemTime, UNIX_EPOCH};

const EXPIRY_LEN: usize = 8;
const TAG_LEN: usize = 32;

/// Checks an app's auth code against its user id.
pub trait AuthCodeVerifier: Send + Sync {
    fn verify_auth_code(&self, user_id: &str, code: &str) -> bool;
}

/// Issues and verifies auth codes signed with a server secret.
pub struct HmacAuthCodes {
    key: hmac::Key,
}

impl HmacAuthCodes {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        }
    }

    /// Issue a code for `user_id` valid for `ttl_secs`.
    pub fn issue(&self, user_id: &str, ttl_secs: u64) -> String {
        let expiry = unix_now().saturating_add(ttl_secs);
        let tag = hmac::sign(&self.key, &signed_data(expiry, user_id));

        let mut code = Vec::with_capacity(EXPIRY_LEN + TAG_LEN);
        code.extend_from_slice(&expiry.to_be_bytes());
        code.extend_from_slice(tag.as_ref());
        hex::encode(code)
    }

    /// Verify signature and expiry of a code.
    pub fn verify(&self, user_id: &str, code: &str) -> BumperResult<()> {
        let raw = hex::decode(code).map_err(|e| BumperError::AuthCode(format!("not hex: {e}")))?;
        if raw.len() != EXPIRY_LEN + TAG_LEN {
            return Err(BumperError::AuthCode(format!(
                "invalid code length: expected {}, got {}",
                EXPIRY_LEN + TAG_LEN,
                raw.len()
            )));
        }

        let (expiry_bytes, tag) = raw.split_at(EXPIRY_LEN);
        let mut buf = [0u8; EXPIRY_LEN];
        buf.copy_from_slice(expiry_bytes);
        let expiry = u64::from_be_bytes(buf);

        if unix_now() > expiry {
            return Err(BumperError::AuthCode("code expired".into()));
        }

        hmac::verify(&self.key, &signed_data(expiry, user_id), tag)
            .map_err(|_| BumperError::AuthCode("invalid code signature".into()))
    }
}

impl AuthCodeVerifier for HmacAuthCodes {
    fn verify_auth_code(&self, user_id: &str, code: &str) -> bool {
        self.verify(user_id, code).is_ok()
    }
}

fn signed_data(expiry: u64, user_id: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(EXPIRY_LEN + user_id.len());
    data.extend_from_slice(&expiry.to_be_bytes());
    data.extend_from_slice(user_id.as_bytes());
    data
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Generate a random server secret (32 bytes).
pub fn generate_secret() -> Vec<u8> {
    use rand::RngCore;
    let mut secret = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}
