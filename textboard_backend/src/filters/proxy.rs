use super::{CheckRequest, ExternalCheck};
use crate::config::ProxyConfig;
use crate::error::Rejection;
use crate::kv::{canonical_key, SharedStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};

pub const PROXY_CACHE_NAMESPACE: &str = "filters.proxy";
pub const PROXY_CACHE_TTL_SECS: u64 = 21_600;

#[derive(Debug, Clone)]
pub enum ProxyProvider {
    /// IP BlackBox: answers `Y` for proxies, `N` otherwise and `X` on error.
    BlackBox { url: String },
    /// GetIPIntel: answers a probability in `[0, 1]`, negative on error.
    GetIpIntel {
        url: String,
        email: String,
        flags: Option<String>,
        threshold: f64,
    },
}

impl ProxyProvider {
    pub fn from_config(config: &ProxyConfig) -> Vec<Self> {
        let mut providers = Vec::new();
        if config.blackbox_enabled {
            providers.push(ProxyProvider::BlackBox {
                url: config.blackbox_url.clone(),
            });
        }
        if let Some(email) = &config.getipintel_email {
            providers.push(ProxyProvider::GetIpIntel {
                url: config.getipintel_url.clone(),
                email: email.clone(),
                flags: config.getipintel_flags.clone(),
                threshold: config.getipintel_threshold,
            });
        }
        providers
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProxyProvider::BlackBox { .. } => "blackbox",
            ProxyProvider::GetIpIntel { .. } => "getipintel",
        }
    }

    /// Raw provider answer worth caching, or `None` when the provider could
    /// not evaluate the address.
    async fn check(&self, client: &reqwest::Client, addr: Ipv4Addr) -> Result<Option<String>> {
        let ip = addr.to_string();
        let request = match self {
            ProxyProvider::BlackBox { url } => client.get(url).query(&[("ip", ip.as_str())]),
            ProxyProvider::GetIpIntel {
                url, email, flags, ..
            } => {
                let mut query = vec![("contact", email.as_str()), ("ip", ip.as_str())];
                if let Some(flags) = flags {
                    query.push(("flags", flags.as_str()));
                }
                client.get(url).query(&query)
            }
        };
        let response = request
            .send()
            .await
            .with_context(|| format!("{} request failed", self.name()))?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let body = response.text().await?.trim().to_string();
        let usable = match self {
            ProxyProvider::BlackBox { .. } => body != "X",
            ProxyProvider::GetIpIntel { .. } => body.parse::<f64>().is_ok_and(|score| score >= 0.0),
        };
        Ok(usable.then_some(body))
    }

    pub fn evaluate(&self, raw: &str) -> bool {
        match self {
            ProxyProvider::BlackBox { .. } => raw == "Y",
            ProxyProvider::GetIpIntel { threshold, .. } => raw
                .parse::<f64>()
                .is_ok_and(|score| score > *threshold),
        }
    }
}

/// Asks each configured provider whether the source is an open proxy.
/// Answers are cached per provider and address.
pub struct ProxyDetector {
    client: reqwest::Client,
    store: SharedStore,
    providers: Vec<ProxyProvider>,
}

impl ProxyDetector {
    pub fn new(client: reqwest::Client, store: SharedStore, providers: Vec<ProxyProvider>) -> Self {
        Self {
            client,
            store,
            providers,
        }
    }

    pub fn cache_key(provider: &ProxyProvider, addr: Ipv4Addr) -> String {
        let ip = addr.to_string();
        canonical_key(
            PROXY_CACHE_NAMESPACE,
            &[("provider", provider.name()), ("ip_address", ip.as_str())],
        )
    }

    async fn answer(&self, provider: &ProxyProvider, addr: Ipv4Addr) -> Result<Option<String>> {
        let key = Self::cache_key(provider, addr);
        if let Some(cached) = self.store.get(&key).await? {
            return Ok(Some(cached));
        }
        let fresh = provider.check(&self.client, addr).await?;
        if let Some(raw) = &fresh {
            self.store.set_ex(&key, raw, PROXY_CACHE_TTL_SECS).await?;
        }
        Ok(fresh)
    }
}

#[async_trait]
impl ExternalCheck for ProxyDetector {
    fn name(&self) -> &'static str {
        "proxy"
    }

    fn rejection(&self) -> Rejection {
        Rejection::ProxyRejected
    }

    async fn should_reject(&self, request: &CheckRequest<'_>) -> Result<bool> {
        let IpAddr::V4(addr) = request.ip_address else {
            return Ok(false);
        };
        for provider in &self.providers {
            match self.answer(provider, addr).await {
                Ok(Some(raw)) if provider.evaluate(&raw) => return Ok(true),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = ?err, provider = provider.name(), "proxy provider failed");
                }
            }
        }
        Ok(false)
    }
}
