//! Short-lived key-value state used for idents, rate limits, task records and
//! cached filter answers.

use crate::clock::SharedClock;
use crate::database::models::KvEntryRecord;
use crate::database::repositories::{KvRepository, SqliteRepositories};
use crate::database::Database;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),
}

pub type KvResult<T> = std::result::Result<T, KvError>;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    /// Overwrites the value and clears any expiry on the key.
    async fn set(&self, key: &str, value: &str) -> KvResult<()>;

    /// Returns `true` only when the key was absent and has now been written.
    async fn setnx(&self, key: &str, value: &str) -> KvResult<bool>;

    async fn expire(&self, key: &str, seconds: u64) -> KvResult<()>;

    /// `set` and `expire` as one write.
    async fn set_ex(&self, key: &str, value: &str, seconds: u64) -> KvResult<()>;

    /// `setnx` and `expire` as one write: a key is never left without its
    /// expiry.
    async fn setnx_ex(&self, key: &str, value: &str, seconds: u64) -> KvResult<bool>;

    /// Remaining lifetime in whole seconds, rounded up. 0 when the key is
    /// absent or has no expiry.
    async fn ttl(&self, key: &str) -> KvResult<u64>;

    /// The store's notion of the current time.
    async fn time(&self) -> KvResult<DateTime<Utc>>;
}

pub type SharedStore = Arc<dyn KeyValueStore>;

/// Builds `"{namespace}:{sha256(k1=v1,k2=v2,...)}"` with pairs sorted by name
/// and value so argument order never changes the key.
pub fn canonical_key(namespace: &str, pairs: &[(&str, &str)]) -> String {
    let mut sorted = pairs.to_vec();
    sorted.sort();
    let joined = sorted
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(",");
    let digest = Sha256::digest(joined.as_bytes());
    format!("{namespace}:{digest:x}")
}

/// Longest expiry honoured by the stores; larger values are clamped.
const MAX_EXPIRY_SECS: u64 = 10 * 365 * 86_400;

fn clamp_expiry(seconds: u64) -> Duration {
    Duration::seconds(seconds.min(MAX_EXPIRY_SECS) as i64)
}

/// Whole seconds until `at`, rounded up.
fn seconds_until(at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (at - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000)
}

struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Process-local store. Expired entries are dropped when touched, and the
/// whole map is swept at most once per [`SWEEP_INTERVAL_SECS`].
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    clock: SharedClock,
}

const SWEEP_INTERVAL_SECS: i64 = 60;

struct MemoryInner {
    entries: HashMap<String, Entry>,
    last_sweep: Option<DateTime<Utc>>,
}

impl MemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                entries: HashMap::new(),
                last_sweep: None,
            }),
            clock,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().map_or(0, |inner| inner.entries.len())
    }

    fn with_entry<T, F>(&self, key: &str, f: F) -> KvResult<T>
    where
        F: FnOnce(&mut HashMap<String, Entry>, DateTime<Utc>) -> T,
    {
        let now = self.clock.now();
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| KvError::Unavailable("memory store mutex poisoned".into()))?;
        let inner = &mut *guard;
        let sweep_due = inner
            .last_sweep
            .map_or(true, |at| now - at >= Duration::seconds(SWEEP_INTERVAL_SECS));
        if sweep_due {
            inner.entries.retain(|_, entry| entry.is_live(now));
            inner.last_sweep = Some(now);
        } else if inner.entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            inner.entries.remove(key);
        }
        Ok(f(&mut inner.entries, now))
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.with_entry(key, |entries, _| entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> KvResult<()> {
        self.with_entry(key, |entries, _| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: None,
                },
            );
        })
    }

    async fn setnx(&self, key: &str, value: &str) -> KvResult<bool> {
        self.with_entry(key, |entries, _| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: None,
                },
            );
            true
        })
    }

    async fn expire(&self, key: &str, seconds: u64) -> KvResult<()> {
        self.with_entry(key, |entries, now| {
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = Some(now + clamp_expiry(seconds));
            }
        })
    }

    async fn set_ex(&self, key: &str, value: &str, seconds: u64) -> KvResult<()> {
        self.with_entry(key, |entries, now| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Some(now + clamp_expiry(seconds)),
                },
            );
        })
    }

    async fn setnx_ex(&self, key: &str, value: &str, seconds: u64) -> KvResult<bool> {
        self.with_entry(key, |entries, now| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Some(now + clamp_expiry(seconds)),
                },
            );
            true
        })
    }

    async fn ttl(&self, key: &str) -> KvResult<u64> {
        self.with_entry(key, |entries, now| {
            entries
                .get(key)
                .and_then(|entry| entry.expires_at)
                .map(|at| seconds_until(at, now))
                .unwrap_or(0)
        })
    }

    async fn time(&self) -> KvResult<DateTime<Utc>> {
        Ok(self.clock.now())
    }
}

/// Store backed by the `kv_entries` table of the main database, so idents,
/// cool-downs and task results survive restarts and are shared by every
/// process that opens the same file.
pub struct SqliteStore {
    database: Database,
    clock: SharedClock,
    last_sweep: Mutex<Option<DateTime<Utc>>>,
}

impl SqliteStore {
    pub fn new(database: Database, clock: SharedClock) -> Self {
        Self {
            database,
            clock,
            last_sweep: Mutex::new(None),
        }
    }

    fn sweep_due(&self, now: DateTime<Utc>) -> bool {
        let mut last = self
            .last_sweep
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let due = last.map_or(true, |at| now - at >= Duration::seconds(SWEEP_INTERVAL_SECS));
        if due {
            *last = Some(now);
        }
        due
    }

    fn run<T, F>(&self, f: F) -> KvResult<T>
    where
        F: FnOnce(&SqliteRepositories<'_>, DateTime<Utc>) -> anyhow::Result<T>,
    {
        let now = self.clock.now();
        let sweep = self.sweep_due(now);
        self.database
            .with_repositories(|repos| {
                if sweep {
                    let purged = repos.kv().purge_expired(now.timestamp_millis())?;
                    if purged > 0 {
                        tracing::debug!(purged, "expired kv entries purged");
                    }
                }
                f(&repos, now)
            })
            .map_err(|err| KvError::Unavailable(format!("{err:#}")))
    }

    fn entry(key: &str, value: &str, expires_at: Option<DateTime<Utc>>) -> KvEntryRecord {
        KvEntryRecord {
            key: key.to_string(),
            value: value.to_string(),
            expires_at_ms: expires_at.map(|at| at.timestamp_millis()),
        }
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.run(|repos, now| {
            Ok(repos
                .kv()
                .get_live(key, now.timestamp_millis())?
                .map(|entry| entry.value))
        })
    }

    async fn set(&self, key: &str, value: &str) -> KvResult<()> {
        self.run(|repos, _| repos.kv().put(&Self::entry(key, value, None)))
    }

    async fn setnx(&self, key: &str, value: &str) -> KvResult<bool> {
        self.run(|repos, now| {
            repos
                .kv()
                .put_if_absent(&Self::entry(key, value, None), now.timestamp_millis())
        })
    }

    async fn expire(&self, key: &str, seconds: u64) -> KvResult<()> {
        self.run(|repos, now| {
            let at = now + clamp_expiry(seconds);
            repos
                .kv()
                .set_expiry(key, at.timestamp_millis(), now.timestamp_millis())
        })
    }

    async fn set_ex(&self, key: &str, value: &str, seconds: u64) -> KvResult<()> {
        self.run(|repos, now| {
            let at = now + clamp_expiry(seconds);
            repos.kv().put(&Self::entry(key, value, Some(at)))
        })
    }

    async fn setnx_ex(&self, key: &str, value: &str, seconds: u64) -> KvResult<bool> {
        self.run(|repos, now| {
            let at = now + clamp_expiry(seconds);
            repos
                .kv()
                .put_if_absent(&Self::entry(key, value, Some(at)), now.timestamp_millis())
        })
    }

    async fn ttl(&self, key: &str) -> KvResult<u64> {
        self.run(|repos, now| {
            let entry = repos.kv().get_live(key, now.timestamp_millis())?;
            Ok(entry
                .and_then(|entry| entry.expires_at_ms)
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .map(|at| seconds_until(at, now))
                .unwrap_or(0))
        })
    }

    async fn time(&self) -> KvResult<DateTime<Utc>> {
        Ok(self.clock.now())
    }
}
