//! Stream access tokens.
//!
//! A token is an opaque 32-character alphanumeric string drawn from the OS
//! CSPRNG, valid for one hour from issuance. The store is a mutex-guarded
//! map from token to expiry; every accept-loop iteration runs the janitor
//! sweep so expired entries never pile up.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;

/// Token length in characters.
pub const TOKEN_LEN: usize = 32;

/// Token lifetime.
pub const TOKEN_TTL: Duration = Duration::from_secs(3600);

struct TokenEntry {
    expires_at: Instant,
}

/// In-memory token store with TTL expiration.
#[derive(Default)]
pub struct TokenStore {
    entries: Mutex<HashMap<String, TokenEntry>>,
}

pub(crate) fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl TokenStore {
    pub fn new() -> Self {
        TokenStore::default()
    }

    /// Issues a fresh token. Returns the token and its absolute expiry as
    /// epoch seconds, as announced on the token topic.
    pub fn issue(&self) -> (String, u64) {
        let token: String = OsRng
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();
        let expires_epoch = epoch_seconds() + TOKEN_TTL.as_secs();

        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                token.clone(),
                TokenEntry {
                    expires_at: Instant::now() + TOKEN_TTL,
                },
            );
        (token, expires_epoch)
    }

    /// True iff the token exists and has not expired.
    pub fn validate(&self, token: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(token)
            .map(|e| Instant::now() < e.expires_at)
            .unwrap_or(false)
    }

    /// Janitor sweep: removes expired entries, returns how many were culled.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, e| now < e.expires_at);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Test hook: inserts a token with an arbitrary remaining lifetime.
    #[cfg(test)]
    pub(crate) fn insert_with_ttl(&self, token: &str, ttl: Duration) {
        self.entries.lock().unwrap().insert(
            token.to_string(),
            TokenEntry {
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_are_well_formed_and_valid() {
        let store = TokenStore::new();
        let (token, expires) = store.issue();

        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(expires >= epoch_seconds() + TOKEN_TTL.as_secs() - 1);
        assert!(store.validate(&token));
    }

    #[test]
    fn issued_tokens_are_unique() {
        let store = TokenStore::new();
        let (a, _) = store.issue();
        let (b, _) = store.issue();
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn unknown_token_is_invalid() {
        let store = TokenStore::new();
        assert!(!store.validate("deadbeef"));
    }

    #[test]
    fn expired_token_fails_validation() {
        let store = TokenStore::new();
        store.insert_with_ttl("stale0000000000000000000000000000", Duration::ZERO);
        assert!(!store.validate("stale0000000000000000000000000000"));
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let store = TokenStore::new();
        store.insert_with_ttl("stale0000000000000000000000000000", Duration::ZERO);
        let (fresh, _) = store.issue();

        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.validate(&fresh));
    }
}
