use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stores a string-backed enum as TEXT and parses it back on read.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(raw: &str) -> Result<Self> {
                match raw {
                    $($text => Ok($name::$variant),)+
                    other => Err(anyhow!("unknown {} {other:?}", stringify!($name))),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|err: anyhow::Error| FromSqlError::Other(err.into()))
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardStatus {
    Open,
    Restricted,
    Locked,
    Archived,
}

text_enum!(BoardStatus {
    Open => "open",
    Restricted => "restricted",
    Locked => "locked",
    Archived => "archived",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicStatus {
    Open,
    Locked,
    Archived,
    Expired,
}

text_enum!(TopicStatus {
    Open => "open",
    Locked => "locked",
    Archived => "archived",
    Expired => "expired",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentType {
    None,
    Ident,
    IdentV6,
    IdentAdmin,
}

text_enum!(IdentType {
    None => "none",
    Ident => "ident",
    IdentV6 => "ident_v6",
    IdentAdmin => "ident_admin",
});

/// Per-board knobs. Missing keys in the stored JSON fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardSettings {
    pub name: String,
    pub use_ident: bool,
    pub max_posts: u32,
    pub post_delay: u64,
    pub expire_duration: u32,
}

impl Default for BoardSettings {
    fn default() -> Self {
        Self {
            name: "Nameless Fanboi".to_string(),
            use_ident: true,
            max_posts: 1000,
            post_delay: 10,
            expire_duration: 0,
        }
    }
}

impl ToSql for BoardSettings {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        serde_json::to_string(self)
            .map(ToSqlOutput::from)
            .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))
    }
}

impl FromSql for BoardSettings {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        serde_json::from_str(value.as_str()?).map_err(|err| FromSqlError::Other(Box::new(err)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardRecord {
    pub id: i64,
    pub slug: String,
    pub title: String,
    pub description: Option<String>,
    pub status: BoardStatus,
    pub settings: BoardSettings,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewBoard {
    pub slug: String,
    pub title: String,
    pub description: Option<String>,
    pub status: BoardStatus,
    pub settings: BoardSettings,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicRecord {
    pub id: i64,
    pub board_id: i64,
    pub title: String,
    pub status: TopicStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewTopic {
    pub board_id: i64,
    pub title: String,
    pub status: TopicStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMetaRecord {
    pub topic_id: i64,
    pub post_count: i64,
    pub posted_at: Option<DateTime<Utc>>,
    pub bumped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostRecord {
    pub id: i64,
    pub topic_id: i64,
    pub number: i64,
    pub name: String,
    pub body: String,
    pub bumped: bool,
    pub ident: Option<String>,
    pub ident_type: IdentType,
    pub ip_address: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPost {
    pub topic_id: i64,
    pub number: i64,
    pub name: String,
    pub body: String,
    pub bumped: bool,
    pub ident: Option<String>,
    pub ident_type: IdentType,
    pub ip_address: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanRecord {
    pub id: i64,
    /// CIDR network; a bare address is a single-host network.
    pub ip_address: String,
    pub scope: Option<String>,
    pub description: Option<String>,
    pub active: bool,
    pub active_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl BanRecord {
    pub fn is_in_effect(&self, now: DateTime<Utc>) -> bool {
        self.active && self.active_until.map_or(true, |until| until >= now)
    }
}

#[derive(Debug, Clone)]
pub struct NewBan {
    pub ip_address: String,
    pub scope: Option<String>,
    pub description: Option<String>,
    pub active: bool,
    pub active_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanwordRecord {
    pub id: i64,
    pub expr: String,
    pub scope: Option<String>,
    pub description: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewBanword {
    pub expr: String,
    pub scope: Option<String>,
    pub description: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Row of the `kv_entries` table. Expiry is kept in epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntryRecord {
    pub key: String,
    pub value: String,
    pub expires_at_ms: Option<i64>,
}

/// Number of posts shown by [`PostQuery::Recent`].
pub const RECENT_POSTS: i64 = 30;

/// Which posts of a topic to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostQuery {
    All,
    Single(i64),
    Range(i64, i64),
    Last(i64),
    Recent,
}

impl FromStr for PostQuery {
    type Err = anyhow::Error;

    /// Accepts `""`/`all`, `recent`, `5`, `2-10` and `l5`.
    fn from_str(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw == "all" {
            return Ok(PostQuery::All);
        }
        if raw == "recent" {
            return Ok(PostQuery::Recent);
        }
        if let Some(count) = raw.strip_prefix('l') {
            return Ok(PostQuery::Last(parse_post_number(count)?));
        }
        if let Some((start, end)) = raw.split_once('-') {
            let start = parse_post_number(start)?;
            let end = parse_post_number(end)?;
            if start > end {
                bail!("post range {raw:?} is reversed");
            }
            return Ok(PostQuery::Range(start, end));
        }
        Ok(PostQuery::Single(parse_post_number(raw)?))
    }
}

fn parse_post_number(raw: &str) -> Result<i64> {
    let number: i64 = raw
        .parse()
        .map_err(|_| anyhow!("invalid post number {raw:?}"))?;
    if number < 1 {
        bail!("post numbers start at 1, got {number}");
    }
    Ok(number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_fill_missing_keys_with_defaults() {
        let settings: BoardSettings = serde_json::from_str(r#"{"max_posts": 3}"#).unwrap();
        assert_eq!(settings.max_posts, 3);
        assert_eq!(settings.post_delay, 10);
        assert!(settings.use_ident);
        assert_eq!(settings.name, "Nameless Fanboi");
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            TopicStatus::Open,
            TopicStatus::Locked,
            TopicStatus::Archived,
            TopicStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<TopicStatus>().unwrap(), status);
        }
        assert!("closed".parse::<BoardStatus>().is_err());
        assert_eq!(IdentType::IdentV6.as_str(), "ident_v6");
    }

    #[test]
    fn post_query_parses_scoped_forms() {
        assert_eq!("".parse::<PostQuery>().unwrap(), PostQuery::All);
        assert_eq!("recent".parse::<PostQuery>().unwrap(), PostQuery::Recent);
        assert_eq!("5".parse::<PostQuery>().unwrap(), PostQuery::Single(5));
        assert_eq!("2-10".parse::<PostQuery>().unwrap(), PostQuery::Range(2, 10));
        assert_eq!("l30".parse::<PostQuery>().unwrap(), PostQuery::Last(30));
        assert!("10-2".parse::<PostQuery>().is_err());
        assert!("0".parse::<PostQuery>().is_err());
        assert!("abc".parse::<PostQuery>().is_err());
    }

    #[test]
    fn expired_ban_is_not_in_effect() {
        let now = Utc::now();
        let ban = BanRecord {
            id: 1,
            ip_address: "10.0.0.0/24".into(),
            scope: None,
            description: None,
            active: true,
            active_until: Some(now - chrono::Duration::seconds(1)),
            created_at: now,
        };
        assert!(!ban.is_in_effect(now));
        assert!(BanRecord { active_until: None, ..ban.clone() }.is_in_effect(now));
        assert!(!BanRecord { active: false, active_until: None, ..ban }.is_in_effect(now));
    }
}
