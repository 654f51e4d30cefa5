use crate::clock::SharedClock;
use crate::database::models::{
    BoardRecord, BoardSettings, BoardStatus, NewBan, NewBanword, NewBoard, TopicRecord,
    TopicStatus,
};
use crate::database::repositories::{
    BanRepository, BanwordRepository, BoardRepository, TopicRepository,
};
use crate::database::Database;
use crate::scope::Scope;
use anyhow::{anyhow, bail, Context, Result};
use ipnetwork::IpNetwork;
use regex::Regex;

#[derive(Debug, Clone)]
pub struct CreateBoardInput {
    pub slug: String,
    pub title: String,
    pub description: Option<String>,
    pub status: BoardStatus,
    pub settings: BoardSettings,
}

#[derive(Debug, Clone, Default)]
pub struct AddBanInput {
    /// CIDR network or a bare address.
    pub ip_address: String,
    pub scope: Option<String>,
    pub description: Option<String>,
    /// Days until the ban lapses; `None` bans indefinitely.
    pub duration_days: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct AddBanwordInput {
    pub expr: String,
    pub scope: Option<String>,
    pub description: Option<String>,
}

/// Administrative writes: boards, statuses, bans and banwords. Rules are
/// validated here so the matchers only ever see well-formed rows.
#[derive(Clone)]
pub struct ModerationService {
    database: Database,
    clock: SharedClock,
}

impl ModerationService {
    pub fn new(database: Database, clock: SharedClock) -> Self {
        Self { database, clock }
    }

    pub fn create_board(&self, input: CreateBoardInput) -> Result<BoardRecord> {
        let slug = input.slug.trim().to_string();
        if slug.is_empty()
            || !slug
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            bail!("invalid board slug {slug:?}");
        }
        let now = self.clock.now();
        let board = self.database.with_repositories(|repos| {
            if repos.boards().get_by_slug(&slug)?.is_some() {
                bail!("board {slug} already exists");
            }
            let id = repos.boards().create(&NewBoard {
                slug: slug.clone(),
                title: input.title.clone(),
                description: input.description.clone(),
                status: input.status,
                settings: input.settings.clone(),
                created_at: now,
            })?;
            repos
                .boards()
                .get(id)?
                .ok_or_else(|| anyhow!("board {id} vanished after insert"))
        })?;
        tracing::info!(board_id = board.id, slug = %board.slug, status = %board.status, "board created");
        Ok(board)
    }

    pub fn set_board_status(&self, slug: &str, status: BoardStatus) -> Result<BoardRecord> {
        let board = self.database.with_repositories(|repos| {
            let board = repos
                .boards()
                .get_by_slug(slug)?
                .ok_or_else(|| anyhow!("board {slug} not found"))?;
            repos.boards().set_status(board.id, status)?;
            Ok(BoardRecord { status, ..board })
        })?;
        tracing::info!(slug = %board.slug, %status, "board status changed");
        Ok(board)
    }

    pub fn set_topic_status(&self, topic_id: i64, status: TopicStatus) -> Result<TopicRecord> {
        let now = self.clock.now();
        let topic = self.database.with_repositories(|repos| {
            if repos.topics().get(topic_id)?.is_none() {
                bail!("topic {topic_id} not found");
            }
            repos.topics().set_status(topic_id, status, now)?;
            repos
                .topics()
                .get(topic_id)?
                .ok_or_else(|| anyhow!("topic {topic_id} not found"))
        })?;
        tracing::info!(topic_id, %status, "topic status changed");
        Ok(topic)
    }

    pub fn add_ban(&self, input: AddBanInput) -> Result<i64> {
        let network: IpNetwork = input
            .ip_address
            .trim()
            .parse()
            .with_context(|| format!("invalid ban network {:?}", input.ip_address))?;
        let scope = normalize_scope(input.scope)?;
        let now = self.clock.now();
        let active_until = input
            .duration_days
            .map(|days| now + chrono::Duration::days(i64::from(days)));
        let id = self.database.with_repositories(|repos| {
            repos.bans().create(&NewBan {
                ip_address: network.to_string(),
                scope: scope.clone(),
                description: input.description.clone(),
                active: true,
                active_until,
                created_at: now,
            })
        })?;
        tracing::info!(ban_id = id, %network, scope = ?scope, ?active_until, "ban added");
        Ok(id)
    }

    pub fn set_ban_active(&self, id: i64, active: bool) -> Result<()> {
        self.database.with_repositories(|repos| {
            if repos.bans().get(id)?.is_none() {
                bail!("ban {id} not found");
            }
            repos.bans().set_active(id, active)
        })?;
        tracing::info!(ban_id = id, active, "ban updated");
        Ok(())
    }

    pub fn add_banword(&self, input: AddBanwordInput) -> Result<i64> {
        Regex::new(&input.expr)
            .with_context(|| format!("banword expression {:?} does not compile", input.expr))?;
        let scope = normalize_scope(input.scope)?;
        let now = self.clock.now();
        let id = self.database.with_repositories(|repos| {
            repos.banwords().create(&NewBanword {
                expr: input.expr.clone(),
                scope: scope.clone(),
                description: input.description.clone(),
                active: true,
                created_at: now,
            })
        })?;
        tracing::info!(banword_id = id, scope = ?scope, "banword added");
        Ok(id)
    }

    pub fn set_banword_active(&self, id: i64, active: bool) -> Result<()> {
        self.database.with_repositories(|repos| {
            if repos.banwords().get(id)?.is_none() {
                bail!("banword {id} not found");
            }
            repos.banwords().set_active(id, active)
        })?;
        tracing::info!(banword_id = id, active, "banword updated");
        Ok(())
    }
}

/// Blank scopes are stored as NULL; anything else must parse.
fn normalize_scope(scope: Option<String>) -> Result<Option<String>> {
    let scope = scope
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty());
    if let Some(raw) = &scope {
        Scope::parse(raw).with_context(|| format!("invalid scope {raw:?}"))?;
    }
    Ok(scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    fn service() -> (ModerationService, Database, ManualClock) {
        let db = Database::open_in_memory().expect("db");
        let clock = ManualClock::new(Utc::now());
        (
            ModerationService::new(db.clone(), Arc::new(clock.clone())),
            db,
            clock,
        )
    }

    fn board(slug: &str) -> CreateBoardInput {
        CreateBoardInput {
            slug: slug.into(),
            title: "Foo".into(),
            description: None,
            status: BoardStatus::Open,
            settings: BoardSettings::default(),
        }
    }

    #[test]
    fn board_slugs_are_validated_and_unique() {
        let (service, _, _) = service();
        let created = service.create_board(board("foo")).unwrap();
        assert_eq!(created.settings, BoardSettings::default());
        assert!(service.create_board(board("foo")).is_err());
        assert!(service.create_board(board("Foo Bar")).is_err());
        assert!(service.create_board(board("")).is_err());

        let locked = service.set_board_status("foo", BoardStatus::Locked).unwrap();
        assert_eq!(locked.status, BoardStatus::Locked);
        assert!(service.set_board_status("nope", BoardStatus::Locked).is_err());
    }

    #[test]
    fn bans_are_validated_and_expire() {
        let (service, db, clock) = service();
        assert!(service
            .add_ban(AddBanInput {
                ip_address: "10.0.0.300/8".into(),
                ..AddBanInput::default()
            })
            .is_err());
        assert!(service
            .add_ban(AddBanInput {
                ip_address: "10.0.0.0/8".into(),
                scope: Some("board:/(/".into()),
                ..AddBanInput::default()
            })
            .is_err());

        let id = service
            .add_ban(AddBanInput {
                ip_address: "10.0.0.0/8".into(),
                scope: Some("  ".into()),
                duration_days: Some(2),
                ..AddBanInput::default()
            })
            .unwrap();
        let ban = db
            .with_repositories(|repos| repos.bans().get(id))
            .unwrap()
            .expect("ban");
        assert_eq!(ban.scope, None);
        assert_eq!(ban.active_until, Some(clock.now() + Duration::days(2)));

        service.set_ban_active(id, false).unwrap();
        assert!(service.set_ban_active(999, false).is_err());
    }

    #[test]
    fn banword_regex_must_compile() {
        let (service, _, _) = service();
        assert!(service
            .add_banword(AddBanwordInput {
                expr: "(".into(),
                ..AddBanwordInput::default()
            })
            .is_err());
        let id = service
            .add_banword(AddBanwordInput {
                expr: "spam".into(),
                scope: Some("board:foo".into()),
                ..AddBanwordInput::default()
            })
            .unwrap();
        service.set_banword_active(id, false).unwrap();
    }

    #[test]
    fn topic_status_updates_existing_topics_only() {
        let (service, _, _) = service();
        assert!(service.set_topic_status(1, TopicStatus::Locked).is_err());
    }
}
