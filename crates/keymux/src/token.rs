//! Sealed client tokens.
//!
//! A sealed token wraps a raw client credential in an AES-256-GCM envelope
//! keyed by the day: `base64url(nonce || ciphertext)` where the key is
//! `SHA-256(secret || "YYYYMMDD")`. The envelope carries its own expiry
//! deadline so a leaked URL stops working within a minute, independent of
//! the authorization service's verdict.
//!
//! Opening tries today's key first and falls back to yesterday's so tokens
//! minted just before UTC midnight stay valid across the boundary.

use crate::error::{ProxyError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Default envelope lifetime in seconds.
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 60;

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// Seals and opens short-lived credential envelopes.
pub struct TokenCodec {
    secret: Zeroizing<Vec<u8>>,
}

impl TokenCodec {
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            secret: Zeroizing::new(secret.as_bytes().to_vec()),
        }
    }

    /// Seal a raw credential with the default 60 second lifetime.
    pub fn seal(&self, raw: &str) -> Result<String> {
        self.seal_at(raw, DEFAULT_TOKEN_TTL_SECS, Utc::now())
    }

    /// Seal a raw credential, expiring `ttl_secs` after `now`.
    pub fn seal_at(&self, raw: &str, ttl_secs: i64, now: DateTime<Utc>) -> Result<String> {
        let deadline = (now + Duration::seconds(ttl_secs)).timestamp();
        let plaintext = Zeroizing::new(format!("{}|{}", raw, deadline));

        let key = self.day_key(now);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));

        let mut nonce = [0u8; NONCE_LEN];
        getrandom::fill(&mut nonce)
            .map_err(|e| ProxyError::Config(format!("RNG failure: {}", e)))?;

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| ProxyError::InvalidToken)?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);
        Ok(URL_SAFE.encode(envelope))
    }

    /// Recover the raw credential from a sealed envelope.
    ///
    /// Returns [`ProxyError::InvalidToken`] when the value is not an
    /// envelope at all (callers then treat it as a raw credential), or when
    /// the envelope is expired or tampered with.
    pub fn open(&self, sealed: &str) -> Result<Zeroizing<String>> {
        self.open_at(sealed, Utc::now())
    }

    /// Recover the raw credential, evaluating expiry against `now`.
    pub fn open_at(&self, sealed: &str, now: DateTime<Utc>) -> Result<Zeroizing<String>> {
        let envelope = URL_SAFE
            .decode(sealed)
            .map_err(|_| ProxyError::InvalidToken)?;
        if envelope.len() <= NONCE_LEN {
            return Err(ProxyError::InvalidToken);
        }
        let (nonce, ciphertext) = envelope.split_at(NONCE_LEN);

        // Today's key, then yesterday's for the UTC midnight boundary.
        let plaintext = self
            .try_decrypt(nonce, ciphertext, now)
            .or_else(|_| self.try_decrypt(nonce, ciphertext, now - Duration::days(1)))?;

        let text = std::str::from_utf8(&plaintext).map_err(|_| ProxyError::InvalidToken)?;
        let (raw, deadline) = text.rsplit_once('|').ok_or(ProxyError::InvalidToken)?;
        let deadline: i64 = deadline.parse().map_err(|_| ProxyError::InvalidToken)?;

        if now.timestamp() > deadline {
            return Err(ProxyError::InvalidToken);
        }
        Ok(Zeroizing::new(raw.to_string()))
    }

    fn try_decrypt(
        &self,
        nonce: &[u8],
        ciphertext: &[u8],
        day: DateTime<Utc>,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let key = self.day_key(day);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| ProxyError::InvalidToken)
    }

    /// `SHA-256(secret || "YYYYMMDD")` for the UTC day of `at`.
    fn day_key(&self, at: DateTime<Utc>) -> Zeroizing<[u8; 32]> {
        let mut hasher = Sha256::new();
        hasher.update(&*self.secret);
        hasher.update(at.format("%Y%m%d").to_string().as_bytes());
        Zeroizing::new(hasher.finalize().into())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn codec() -> TokenCodec {
        TokenCodec::new("test-secret")
    }

    #[test]
    fn test_round_trip_within_ttl() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let sealed = codec().seal_at("AIza-raw-credential", 60, now).unwrap();
        let opened = codec()
            .open_at(&sealed, now + Duration::seconds(30))
            .unwrap();
        assert_eq!(&*opened, "AIza-raw-credential");
    }

    #[test]
    fn test_expired_token_rejected() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let sealed = codec().seal_at("RAW", 60, now).unwrap();
        let result = codec().open_at(&sealed, now + Duration::seconds(61));
        assert!(matches!(result, Err(ProxyError::InvalidToken)));
    }

    #[test]
    fn test_survives_utc_midnight() {
        let before = Utc.with_ymd_and_hms(2024, 6, 1, 23, 59, 50).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 10).unwrap();
        let sealed = codec().seal_at("RAW", 60, before).unwrap();
        let opened = codec().open_at(&sealed, after).unwrap();
        assert_eq!(&*opened, "RAW");
    }

    #[test]
    fn test_two_day_old_token_rejected() {
        let sealed_at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let opened_at = Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap();
        // Generous TTL so only the day-key fallback is being tested.
        let sealed = codec().seal_at("RAW", 1_000_000, sealed_at).unwrap();
        assert!(codec().open_at(&sealed, opened_at).is_err());
    }

    #[test]
    fn test_garbage_is_opaque() {
        let now = Utc::now();
        assert!(codec().open_at("not-base64!!!", now).is_err());
        assert!(codec().open_at("", now).is_err());
        // Valid base64 but not an envelope.
        assert!(codec().open_at(&URL_SAFE.encode("hello"), now).is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let sealed = codec().seal_at("RAW", 60, now).unwrap();
        let other = TokenCodec::new("different-secret");
        assert!(other.open_at(&sealed, now).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let sealed = codec().seal_at("RAW", 60, now).unwrap();
        let mut bytes = URL_SAFE.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = URL_SAFE.encode(bytes);
        assert!(codec().open_at(&tampered, now).is_err());
    }

    #[test]
    fn test_credential_with_pipe_survives() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let sealed = codec().seal_at("weird|key", 60, now).unwrap();
        let opened = codec().open_at(&sealed, now).unwrap();
        assert_eq!(&*opened, "weird|key");
    }
}
