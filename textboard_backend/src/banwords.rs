use crate::database::models::BanwordRecord;
use crate::database::repositories::BanwordRepository;
use crate::database::Database;
use crate::scope::{Scope, ScopeContext};
use anyhow::{anyhow, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Matches post bodies against the active banword list. Each expression is
/// compiled once and reused until its row changes.
#[derive(Clone)]
pub struct BanwordMatcher {
    database: Database,
    cache: Arc<RwLock<HashMap<i64, CompiledBanword>>>,
}

struct CompiledBanword {
    expr: String,
    scope_source: Option<String>,
    /// `None` for rows that failed to compile; they are skipped until edited.
    rule: Option<(Regex, Scope)>,
}

impl CompiledBanword {
    fn is_current(&self, record: &BanwordRecord) -> bool {
        self.expr == record.expr && self.scope_source == record.scope
    }
}

impl BanwordMatcher {
    pub fn new(database: Database) -> Self {
        Self {
            database,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn is_banned(&self, body: &str, scopes: &ScopeContext) -> Result<bool> {
        Ok(self.find_banword(body, scopes)?.is_some())
    }

    /// Id of the first active banword whose scope applies and whose
    /// expression finds a match in `body`.
    pub fn find_banword(&self, body: &str, scopes: &ScopeContext) -> Result<Option<i64>> {
        let banwords = self
            .database
            .with_repositories(|repos| repos.banwords().list_active())?;
        self.refresh(&banwords)?;

        let cache = self
            .cache
            .read()
            .map_err(|_| anyhow!("banword cache poisoned"))?;
        for banword in &banwords {
            let rule = cache
                .get(&banword.id)
                .and_then(|compiled| compiled.rule.as_ref());
            if let Some((pattern, scope)) = rule {
                if scope.applies_to(scopes) && pattern.is_match(body) {
                    return Ok(Some(banword.id));
                }
            }
        }
        Ok(None)
    }

    /// Compiles rows that are new or changed and forgets rows that are gone.
    fn refresh(&self, banwords: &[BanwordRecord]) -> Result<()> {
        {
            let cache = self
                .cache
                .read()
                .map_err(|_| anyhow!("banword cache poisoned"))?;
            let up_to_date = cache.len() == banwords.len()
                && banwords.iter().all(|banword| {
                    cache
                        .get(&banword.id)
                        .is_some_and(|compiled| compiled.is_current(banword))
                });
            if up_to_date {
                return Ok(());
            }
        }

        let mut cache = self
            .cache
            .write()
            .map_err(|_| anyhow!("banword cache poisoned"))?;
        cache.retain(|id, _| banwords.iter().any(|banword| banword.id == *id));
        for banword in banwords {
            if cache
                .get(&banword.id)
                .is_some_and(|compiled| compiled.is_current(banword))
            {
                continue;
            }
            cache.insert(
                banword.id,
                CompiledBanword {
                    expr: banword.expr.clone(),
                    scope_source: banword.scope.clone(),
                    rule: compile(banword),
                },
            );
        }
        Ok(())
    }
}

fn compile(banword: &BanwordRecord) -> Option<(Regex, Scope)> {
    let pattern = match Regex::new(&banword.expr) {
        Ok(pattern) => pattern,
        Err(err) => {
            tracing::warn!(
                error = %err,
                banword_id = banword.id,
                "banword expression does not compile"
            );
            return None;
        }
    };
    match Scope::parse_optional(banword.scope.as_deref()) {
        Ok(scope) => Some((pattern, scope)),
        Err(err) => {
            tracing::warn!(
                error = %err,
                banword_id = banword.id,
                "invalid scope in banword"
            );
            None
        }
    }
}
