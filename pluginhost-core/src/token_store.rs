//! Generic expiring-token store shared by the handshake server and the
//! capability broker: `id -> (token, expires_at)` under a reader-preferred
//! lock, with lazy deletion of expired entries on the validation path.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

struct Entry {
    token: String,
    expires_at: Instant,
}

/// Maps an opaque id (a `runtime_id` or a `grant_id`) to its current bearer
/// token and expiry. Validation is constant-time; expired entries are
/// removed the first time they are observed as expired.
pub struct TokenStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl TokenStore {
    pub fn new() -> Self {
        TokenStore {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Record a freshly minted token for `id`, valid for `ttl` from now.
    pub async fn issue(&self, id: &str, token: String, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries.write().await.insert(
            id.to_string(),
            Entry { token, expires_at },
        );
    }

    /// Validate `candidate` for `id`:
    /// 1. read-lock, look up; absent -> false.
    /// 2. expired -> upgrade to write lock, re-check, delete, false.
    /// 3. else constant-time compare stored vs candidate.
    pub async fn validate(&self, id: &str, candidate: &str) -> bool {
        let now = Instant::now();
        {
            let guard = self.entries.read().await;
            match guard.get(id) {
                None => return false,
                Some(entry) => {
                    if now < entry.expires_at {
                        return pluginhost_crypto::constant_time_eq(
                            entry.token.as_bytes(),
                            candidate.as_bytes(),
                        );
                    }
                }
            }
        }
        let mut guard = self.entries.write().await;
        if let Some(entry) = guard.get(id) {
            if now >= entry.expires_at {
                guard.remove(id);
            }
        }
        false
    }

    /// Remove `id`'s entry outright (plugin removal, explicit revocation).
    pub async fn revoke(&self, id: &str) {
        self.entries.write().await.remove(id);
    }

    /// Current entry count, for tests and diagnostics.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn validate_rejects_unknown_id() {
        let store = TokenStore::new();
        assert!(!store.validate("ghost", "whatever").await);
    }

    #[tokio::test(start_paused = true)]
    async fn validate_accepts_matching_live_token() {
        let store = TokenStore::new();
        store.issue("r1", "secret".into(), Duration::from_secs(60)).await;
        assert!(store.validate("r1", "secret").await);
        assert!(!store.validate("r1", "wrong").await);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_token_is_rejected_and_evicted() {
        let store = TokenStore::new();
        store.issue("r1", "secret".into(), Duration::from_millis(50)).await;
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(!store.validate("r1", "secret").await);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn revoke_removes_entry() {
        let store = TokenStore::new();
        store.issue("r1", "secret".into(), Duration::from_secs(60)).await;
        store.revoke("r1").await;
        assert!(!store.validate("r1", "secret").await);
    }
}
