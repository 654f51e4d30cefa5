pub mod akismet;
pub mod dnsbl;
pub mod proxy;

use crate::clock::SharedClock;
use crate::config::FilterConfig;
use crate::database::repositories::PostRepository;
use crate::database::Database;
use crate::error::Rejection;
use crate::kv::SharedStore;
use crate::utils;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

pub use akismet::Akismet;
pub use dnsbl::Dnsbl;
pub use proxy::{ProxyDetector, ProxyProvider};

/// Opaque request metadata (application URL, referrer, user agent) handed
/// through to the external checks.
pub type Payload = BTreeMap<String, String>;

/// Addresses that posted within this many days skip the external checks.
pub const RECENTLY_SEEN_DAYS: i64 = 3;

#[derive(Debug, Clone, Copy)]
pub struct CheckRequest<'a> {
    pub ip_address: IpAddr,
    pub body: &'a str,
    pub payload: &'a Payload,
}

#[async_trait]
pub trait ExternalCheck: Send + Sync {
    fn name(&self) -> &'static str;

    /// Failure reported when `should_reject` says yes.
    fn rejection(&self) -> Rejection;

    async fn should_reject(&self, request: &CheckRequest<'_>) -> Result<bool>;
}

#[derive(Clone)]
pub struct FilterChain {
    checks: Vec<Arc<dyn ExternalCheck>>,
    database: Database,
    clock: SharedClock,
    timeout: Duration,
}

impl FilterChain {
    pub fn new(database: Database, clock: SharedClock, timeout: Duration) -> Self {
        Self {
            checks: Vec::new(),
            database,
            clock,
            timeout,
        }
    }

    /// Builds the configured checks in evaluation order: Akismet, DNSBL,
    /// then proxy detection.
    pub fn from_config(
        config: &FilterConfig,
        store: SharedStore,
        database: Database,
        clock: SharedClock,
    ) -> Result<Self> {
        let mut chain = Self::new(database, clock, config.timeout);
        if !config.any_enabled() {
            return Ok(chain);
        }

        let client = reqwest::Client::builder()
            .user_agent(utils::user_agent())
            .timeout(config.timeout)
            .build()
            .context("failed to build HTTP client for external checks")?;

        if let Some(key) = &config.akismet_key {
            chain = chain.with_check(Arc::new(Akismet::new(client.clone(), key)));
        }
        if !config.dnsbl_providers.is_empty() {
            chain = chain.with_check(Arc::new(Dnsbl::new(config.dnsbl_providers.clone())));
        }
        let providers = ProxyProvider::from_config(&config.proxy);
        if !providers.is_empty() {
            chain = chain.with_check(Arc::new(ProxyDetector::new(client, store, providers)));
        }
        tracing::info!(
            checks = ?chain.names(),
            "external checks enabled"
        );
        Ok(chain)
    }

    pub fn with_check(mut self, check: Arc<dyn ExternalCheck>) -> Self {
        self.checks.push(check);
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|check| check.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Runs the checks in order and returns the first rejection. A check that
    /// errors or times out counts as a pass.
    pub async fn evaluate(&self, request: &CheckRequest<'_>) -> Result<Option<Rejection>> {
        if self.checks.is_empty() {
            return Ok(None);
        }

        let since = self.clock.now() - chrono::Duration::days(RECENTLY_SEEN_DAYS);
        let ip_address = request.ip_address.to_string();
        let recently_seen = self
            .database
            .with_repositories(|repos| repos.posts().was_recently_seen(&ip_address, since))?;
        if recently_seen {
            tracing::debug!(%ip_address, "recently seen address, skipping external checks");
            return Ok(None);
        }

        for check in &self.checks {
            match tokio::time::timeout(self.timeout, check.should_reject(request)).await {
                Ok(Ok(true)) => {
                    tracing::info!(check = check.name(), %ip_address, "external check rejected submission");
                    return Ok(Some(check.rejection()));
                }
                Ok(Ok(false)) => {}
                Ok(Err(err)) => {
                    tracing::warn!(error = ?err, check = check.name(), "external check failed");
                }
                Err(_) => {
                    tracing::warn!(check = check.name(), timeout = ?self.timeout, "external check timed out");
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::database::models::{
        BoardSettings, BoardStatus, IdentType, NewBoard, NewPost, NewTopic, TopicStatus,
    };
    use crate::database::repositories::{BoardRepository, TopicRepository};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Stub {
        name: &'static str,
        answer: Option<bool>,
        calls: AtomicUsize,
    }

    impl Stub {
        fn new(name: &'static str, answer: Option<bool>) -> Arc<Self> {
            Arc::new(Self {
                name,
                answer,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ExternalCheck for Stub {
        fn name(&self) -> &'static str {
            self.name
        }

        fn rejection(&self) -> Rejection {
            Rejection::DnsblRejected
        }

        async fn should_reject(&self, _request: &CheckRequest<'_>) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.ok_or_else(|| anyhow::anyhow!("provider unreachable"))
        }
    }

    fn chain(db: &Database, clock: &ManualClock) -> FilterChain {
        FilterChain::new(db.clone(), Arc::new(clock.clone()), Duration::from_secs(1))
    }

    fn request<'a>(ip: &str, payload: &'a Payload) -> CheckRequest<'a> {
        CheckRequest {
            ip_address: ip.parse().unwrap(),
            body: "hello",
            payload,
        }
    }

    #[tokio::test]
    async fn first_rejecting_check_wins_and_errors_pass() {
        let db = Database::open_in_memory().expect("db");
        let clock = ManualClock::new(Utc::now());
        let failing = Stub::new("failing", None);
        let rejecting = Stub::new("rejecting", Some(true));
        let never_reached = Stub::new("later", Some(true));
        let chain = chain(&db, &clock)
            .with_check(failing.clone())
            .with_check(rejecting.clone())
            .with_check(never_reached.clone());

        let payload = Payload::new();
        let outcome = chain.evaluate(&request("10.0.0.1", &payload)).await.unwrap();
        assert_eq!(outcome, Some(Rejection::DnsblRejected));
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(never_reached.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn recently_seen_address_skips_checks() {
        let db = Database::open_in_memory().expect("db");
        let clock = ManualClock::new(Utc::now());
        let rejecting = Stub::new("rejecting", Some(true));
        let chain = chain(&db, &clock).with_check(rejecting.clone());

        db.with_repositories(|repos| {
            let board_id = repos.boards().create(&NewBoard {
                slug: "foo".into(),
                title: "Foo".into(),
                description: None,
                status: BoardStatus::Open,
                settings: BoardSettings::default(),
                created_at: clock.now(),
            })?;
            let topic_id = repos.topics().create(&NewTopic {
                board_id,
                title: "t".into(),
                status: TopicStatus::Open,
                created_at: clock.now(),
            })?;
            repos.posts().create(&NewPost {
                topic_id,
                number: 1,
                name: "n".into(),
                body: "b".into(),
                bumped: true,
                ident: None,
                ident_type: IdentType::None,
                ip_address: "10.0.0.1".into(),
                created_at: clock.now(),
            })
        })
        .unwrap();

        let payload = Payload::new();
        assert_eq!(chain.evaluate(&request("10.0.0.1", &payload)).await.unwrap(), None);
        assert_eq!(rejecting.calls.load(Ordering::SeqCst), 0);

        clock.advance(chrono::Duration::days(RECENTLY_SEEN_DAYS) + chrono::Duration::seconds(1));
        assert_eq!(
            chain.evaluate(&request("10.0.0.1", &payload)).await.unwrap(),
            Some(Rejection::DnsblRejected)
        );
    }

    #[test]
    fn nothing_configured_means_no_checks() {
        let db = Database::open_in_memory().expect("db");
        let clock: SharedClock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(crate::kv::MemoryStore::new(clock.clone()));
        let chain = FilterChain::from_config(&FilterConfig::default(), store, db, clock).unwrap();
        assert!(chain.is_empty());
    }
}
