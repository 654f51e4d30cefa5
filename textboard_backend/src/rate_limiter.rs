use crate::kv::{canonical_key, KvResult, SharedStore};

const RATE_LIMIT_NAMESPACE: &str = "services.rate_limiter";

/// Cool-down markers keyed by arbitrary named dimensions, typically
/// `ip_address` and `board`.
#[derive(Clone)]
pub struct RateLimiter {
    store: SharedStore,
}

impl RateLimiter {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Unconditionally (re)arms the marker for `seconds`.
    pub async fn limit_for(&self, seconds: u64, key: &[(&str, &str)]) -> KvResult<()> {
        if seconds == 0 {
            return Ok(());
        }
        let key = canonical_key(RATE_LIMIT_NAMESPACE, key);
        self.store.set_ex(&key, "1", seconds).await
    }

    /// Arms the marker only if none is present. Returns `false` when another
    /// submission already holds the slot. A zero delay never limits.
    pub async fn try_limit_for(&self, seconds: u64, key: &[(&str, &str)]) -> KvResult<bool> {
        if seconds == 0 {
            return Ok(true);
        }
        let key = canonical_key(RATE_LIMIT_NAMESPACE, key);
        self.store.setnx_ex(&key, "1", seconds).await
    }

    pub async fn is_limited(&self, key: &[(&str, &str)]) -> KvResult<bool> {
        let key = canonical_key(RATE_LIMIT_NAMESPACE, key);
        Ok(self.store.get(&key).await?.is_some())
    }

    pub async fn time_left(&self, key: &[(&str, &str)]) -> KvResult<u64> {
        let key = canonical_key(RATE_LIMIT_NAMESPACE, key);
        self.store.ttl(&key).await
    }
}
