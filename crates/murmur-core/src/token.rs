//! HMAC access keys for murmur.
//!
//! An access key lets a client sign in again without its password.
//! Format (hex-encoded): `[8-byte expiry][32-byte HMAC-SHA256]`, where the
//! MAC covers `expiry || user_id`.

use ring::hmac;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{MurmurError, MurmurResult};

const KEY_BYTES: usize = 8 + 32;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn signed_data(expiry: u64, user_id: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(8 + user_id.len());
    data.extend_from_slice(&expiry.to_be_bytes());
    data.extend_from_slice(user_id.as_bytes());
    data
}

/// Issue an access key bound to `user_id`, valid for `ttl_secs`.
pub fn create_access_key(secret: &[u8], user_id: &str, ttl_secs: u64) -> String {
    let expiry = unix_now().saturating_add(ttl_secs);
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, &signed_data(expiry, user_id));

    let mut token = Vec::with_capacity(KEY_BYTES);
    token.extend_from_slice(&expiry.to_be_bytes());
    token.extend_from_slice(tag.as_ref());
    hex::encode(token)
}

/// Verify an access key for `user_id`: signature first, then expiry.
///
/// Every failure maps to `InvalidCredential` so callers cannot tell a
/// forged key from an expired one.
pub fn verify_access_key(secret: &[u8], user_id: &str, access_key: &str) -> MurmurResult<()> {
    let token = hex::decode(access_key).map_err(|_| MurmurError::InvalidCredential)?;
    if token.len() != KEY_BYTES {
        return Err(MurmurError::InvalidCredential);
    }

    let mut expiry_bytes = [0u8; 8];
    expiry_bytes.copy_from_slice(&token[..8]);
    let expiry = u64::from_be_bytes(expiry_bytes);

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, &signed_data(expiry, user_id), &token[8..])
        .map_err(|_| MurmurError::InvalidCredential)?;

    if unix_now() > expiry {
        return Err(MurmurError::InvalidCredential);
    }
    Ok(())
}

/// Generate a random signing secret (32 bytes).
pub fn generate_secret() -> MurmurResult<Vec<u8>> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut secret = vec![0u8; 32];
    rng.fill(&mut secret)
        .map_err(|_| MurmurError::Other("system RNG failure".into()))?;
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_verify() {
        let secret = generate_secret().unwrap();
        let key = create_access_key(&secret, "user-1", 3600);
        assert_eq!(key.len(), KEY_BYTES * 2);
        assert!(verify_access_key(&secret, "user-1", &key).is_ok());
    }

    #[test]
    fn wrong_user() {
        let secret = generate_secret().unwrap();
        let key = create_access_key(&secret, "user-1", 3600);
        assert!(matches!(
            verify_access_key(&secret, "user-2", &key),
            Err(MurmurError::InvalidCredential)
        ));
    }

    #[test]
    fn wrong_secret() {
        let key = create_access_key(&generate_secret().unwrap(), "user-1", 3600);
        assert!(verify_access_key(&generate_secret().unwrap(), "user-1", &key).is_err());
    }

    #[test]
    fn expired_key() {
        let secret = generate_secret().unwrap();
        // Forge an already-expired key with a valid MAC.
        let expiry = unix_now() - 10;
        let mac_key = hmac::Key::new(hmac::HMAC_SHA256, &secret);
        let tag = hmac::sign(&mac_key, &signed_data(expiry, "user-1"));
        let mut token = expiry.to_be_bytes().to_vec();
        token.extend_from_slice(tag.as_ref());

        assert!(verify_access_key(&secret, "user-1", &hex::encode(token)).is_err());
    }

    #[test]
    fn garbage_rejected() {
        let secret = generate_secret().unwrap();
        assert!(verify_access_key(&secret, "user-1", "zz").is_err());
        assert!(verify_access_key(&secret, "user-1", &hex::encode([0u8; 10])).is_err());
    }
}
