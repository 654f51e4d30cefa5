use super::{CheckRequest, ExternalCheck};
use crate::error::Rejection;
use anyhow::Result;
use async_trait::async_trait;
use std::net::IpAddr;

/// Looks the source address up in DNS blocklist zones.
pub struct Dnsbl {
    providers: Vec<String>,
}

impl Dnsbl {
    pub fn new(providers: Vec<String>) -> Self {
        let providers = providers
            .into_iter()
            .map(|zone| zone.trim().trim_matches('.').to_string())
            .filter(|zone| !zone.is_empty())
            .collect();
        Self { providers }
    }

    pub fn query_name(addr: IpAddr, zone: &str) -> String {
        format!("{}.{}.", reverse_labels(addr), zone)
    }
}

/// Address labels in reverse order: dotted octets for IPv4, hex nibbles for
/// IPv6.
pub fn reverse_labels(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => v4
            .octets()
            .iter()
            .rev()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join("."),
        IpAddr::V6(v6) => v6
            .octets()
            .iter()
            .rev()
            .flat_map(|byte| [byte & 0x0f, byte >> 4])
            .map(|nibble| format!("{nibble:x}"))
            .collect::<Vec<_>>()
            .join("."),
    }
}

fn is_listing(answer: IpAddr) -> bool {
    matches!(answer, IpAddr::V4(v4) if v4.octets()[0] == 127)
}

#[async_trait]
impl ExternalCheck for Dnsbl {
    fn name(&self) -> &'static str {
        "dnsbl"
    }

    fn rejection(&self) -> Rejection {
        Rejection::DnsblRejected
    }

    async fn should_reject(&self, request: &CheckRequest<'_>) -> Result<bool> {
        for zone in &self.providers {
            let name = Self::query_name(request.ip_address, zone);
            let lookup = tokio::net::lookup_host((name.as_str(), 0)).await;
            match lookup {
                Ok(mut answers) => {
                    if answers.any(|answer| is_listing(answer.ip())) {
                        tracing::debug!(%zone, ip_address = %request.ip_address, "address listed");
                        return Ok(true);
                    }
                }
                // NXDOMAIN is how a zone says "not listed".
                Err(err) => {
                    tracing::trace!(error = %err, %zone, "dnsbl lookup returned no listing");
                }
            }
        }
        Ok(false)
    }
}
