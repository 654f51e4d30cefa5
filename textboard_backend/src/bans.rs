use crate::clock::SharedClock;
use crate::database::models::BanRecord;
use crate::database::repositories::BanRepository;
use crate::database::Database;
use crate::scope::{Scope, ScopeContext};
use anyhow::Result;
use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// Matches source addresses against the active ban list.
#[derive(Clone)]
pub struct BanMatcher {
    database: Database,
    clock: SharedClock,
}

impl BanMatcher {
    pub fn new(database: Database, clock: SharedClock) -> Self {
        Self { database, clock }
    }

    pub fn is_banned(&self, addr: IpAddr, scopes: &ScopeContext) -> Result<bool> {
        Ok(self.find_ban(addr, scopes)?.is_some())
    }

    /// First ban in effect whose network contains `addr` and whose scope
    /// applies to `scopes`.
    pub fn find_ban(&self, addr: IpAddr, scopes: &ScopeContext) -> Result<Option<BanRecord>> {
        let now = self.clock.now();
        let bans = self
            .database
            .with_repositories(|repos| repos.bans().list_active())?;

        for ban in bans {
            if !ban.is_in_effect(now) {
                continue;
            }
            let network = match ban.ip_address.parse::<IpNetwork>() {
                Ok(network) => network,
                Err(err) => {
                    tracing::warn!(
                        error = ?err,
                        ban_id = ban.id,
                        network = %ban.ip_address,
                        "invalid network in ban"
                    );
                    continue;
                }
            };
            if !network.contains(addr) {
                continue;
            }
            match Scope::parse_optional(ban.scope.as_deref()) {
                Ok(scope) if scope.applies_to(scopes) => return Ok(Some(ban)),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        ban_id = ban.id,
                        "invalid scope in ban"
                    );
                }
            }
        }
        Ok(None)
    }
}
