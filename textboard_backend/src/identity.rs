use crate::kv::{canonical_key, KvError, KvResult, SharedStore};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono_tz::Tz;
use rand::RngCore;

const IDENT_NAMESPACE: &str = "services.identity";

/// Lifetime of a stored ident.
pub const IDENT_TTL_SECS: u64 = 86_400;

pub const DEFAULT_IDENT_SIZE: usize = 10;

/// Hands out short per-poster idents that stay stable for a given set of
/// inputs while the stored value lives.
#[derive(Clone)]
pub struct IdentityService {
    store: SharedStore,
    ident_size: usize,
}

impl IdentityService {
    pub fn new(store: SharedStore, ident_size: usize) -> Self {
        Self { store, ident_size }
    }

    pub fn ident_size(&self) -> usize {
        self.ident_size
    }

    pub async fn identity_for(&self, inputs: &[(&str, &str)]) -> KvResult<String> {
        let key = canonical_key(IDENT_NAMESPACE, inputs);
        if let Some(existing) = self.store.get(&key).await? {
            if !existing.is_empty() {
                return Ok(existing);
            }
        }

        let candidate = generate_ident(self.ident_size);
        if self.store.setnx_ex(&key, &candidate, IDENT_TTL_SECS).await? {
            return Ok(candidate);
        }

        // Another writer stored its ident between our get and setnx.
        match self.store.get(&key).await? {
            Some(winner) if !winner.is_empty() => Ok(winner),
            _ => Err(KvError::Unavailable(format!(
                "ident for {key} vanished after a lost setnx"
            ))),
        }
    }

    /// Same as [`identity_for`](Self::identity_for) with an extra `timestamp`
    /// input holding the current date in `tz`, so idents roll over at local
    /// midnight.
    pub async fn identity_with_tz_for(&self, tz: Tz, inputs: &[(&str, &str)]) -> KvResult<String> {
        let now = self.store.time().await?;
        let stamp = now.with_timezone(&tz).format("%Y%m%d").to_string();
        let mut inputs = inputs.to_vec();
        inputs.push(("timestamp", stamp.as_str()));
        self.identity_for(&inputs).await
    }
}

/// `size` characters of the URL-safe base64 alphabet drawn from the thread
/// CSPRNG.
pub fn generate_ident(size: usize) -> String {
    let mut bytes = vec![0u8; (size * 6).div_ceil(8)];
    rand::rng().fill_bytes(&mut bytes);
    let mut ident = URL_SAFE_NO_PAD.encode(&bytes);
    ident.truncate(size);
    ident
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kv::{KeyValueStore, MemoryStore};
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Arc;

    fn service() -> (IdentityService, ManualClock, Arc<MemoryStore>) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap());
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        (
            IdentityService::new(store.clone(), DEFAULT_IDENT_SIZE),
            clock,
            store,
        )
    }

    #[test]
    fn generated_idents_use_url_safe_alphabet() {
        for size in [1, 6, 10, 32] {
            let ident = generate_ident(size);
            assert_eq!(ident.len(), size);
            assert!(ident
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_'));
        }
        assert_ne!(generate_ident(10), generate_ident(10));
    }

    #[tokio::test]
    async fn same_inputs_share_an_ident_until_expiry() {
        let (service, clock, _) = service();
        let inputs = [("board", "foo"), ("ip_address", "10.0.0.1")];
        let first = service.identity_for(&inputs).await.unwrap();
        let reordered = service
            .identity_for(&[("ip_address", "10.0.0.1"), ("board", "foo")])
            .await
            .unwrap();
        assert_eq!(first, reordered);
        assert_eq!(first.len(), DEFAULT_IDENT_SIZE);

        let other_board = service
            .identity_for(&[("board", "bar"), ("ip_address", "10.0.0.1")])
            .await
            .unwrap();
        assert_ne!(first, other_board);

        clock.advance(Duration::seconds(IDENT_TTL_SECS as i64));
        let rolled = service.identity_for(&inputs).await.unwrap();
        assert_ne!(first, rolled);
    }

    #[tokio::test]
    async fn evicted_key_yields_a_new_ident() {
        let (service, _, store) = service();
        let inputs = [("board", "foo"), ("ip_address", "10.0.0.1")];
        let first = service.identity_for(&inputs).await.unwrap();
        let key = canonical_key(IDENT_NAMESPACE, &inputs);
        store.expire(&key, 0).await.unwrap();
        let second = service.identity_for(&inputs).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn day_bucket_follows_the_time_zone() {
        let (service, clock, _) = service();
        let tz: Tz = "Asia/Bangkok".parse().unwrap();
        let inputs = [("board", "foo"), ("ip_address", "10.0.0.1")];

        // 16:59 UTC is 23:59 in Bangkok; two minutes later is the next local day.
        clock.set(Utc.with_ymd_and_hms(2026, 1, 1, 16, 59, 0).unwrap());
        let before_midnight = service.identity_with_tz_for(tz, &inputs).await.unwrap();
        clock.set(Utc.with_ymd_and_hms(2026, 1, 1, 17, 1, 0).unwrap());
        let after_midnight = service.identity_with_tz_for(tz, &inputs).await.unwrap();
        assert_ne!(before_midnight, after_midnight);

        let utc_before = service.identity_with_tz_for(Tz::UTC, &inputs).await.unwrap();
        clock.advance(Duration::minutes(30));
        let utc_after = service.identity_with_tz_for(Tz::UTC, &inputs).await.unwrap();
        assert_eq!(utc_before, utc_after);
    }
}
