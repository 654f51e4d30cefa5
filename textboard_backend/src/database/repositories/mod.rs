mod bans;
mod banwords;
mod boards;
mod kv;
mod posts;
mod topics;

use super::models::{
    BanRecord, BanwordRecord, BoardRecord, BoardStatus, KvEntryRecord, NewBan, NewBanword,
    NewBoard, NewPost, NewTopic, PostQuery, PostRecord, TopicMetaRecord, TopicRecord,
    TopicStatus,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;

pub trait BoardRepository {
    fn create(&self, record: &NewBoard) -> Result<i64>;
    fn get(&self, id: i64) -> Result<Option<BoardRecord>>;
    fn get_by_slug(&self, slug: &str) -> Result<Option<BoardRecord>>;
    fn list(&self) -> Result<Vec<BoardRecord>>;
    fn set_status(&self, id: i64, status: BoardStatus) -> Result<()>;
}

pub trait TopicRepository {
    fn create(&self, record: &NewTopic) -> Result<i64>;
    fn get(&self, id: i64) -> Result<Option<TopicRecord>>;
    fn list_for_board(&self, board_id: i64, limit: usize) -> Result<Vec<TopicRecord>>;
    fn set_status(&self, id: i64, status: TopicStatus, updated_at: DateTime<Utc>) -> Result<()>;
    fn create_meta(&self, meta: &TopicMetaRecord) -> Result<()>;
    fn get_meta(&self, topic_id: i64) -> Result<Option<TopicMetaRecord>>;
    fn update_meta(&self, meta: &TopicMetaRecord) -> Result<()>;
}

pub trait PostRepository {
    fn create(&self, record: &NewPost) -> Result<i64>;
    fn get(&self, id: i64) -> Result<Option<PostRecord>>;
    /// Highest post number in the topic, 0 when it has no posts.
    fn max_number(&self, topic_id: i64) -> Result<i64>;
    fn count_for_topic(&self, topic_id: i64) -> Result<i64>;
    fn list_for_topic(&self, topic_id: i64, query: PostQuery) -> Result<Vec<PostRecord>>;
    fn was_recently_seen(&self, ip_address: &str, since: DateTime<Utc>) -> Result<bool>;
}

pub trait BanRepository {
    fn create(&self, record: &NewBan) -> Result<i64>;
    fn get(&self, id: i64) -> Result<Option<BanRecord>>;
    fn set_active(&self, id: i64, active: bool) -> Result<()>;
    /// Bans flagged active, newest expiry first. Expiry against a clock is
    /// left to the caller.
    fn list_active(&self) -> Result<Vec<BanRecord>>;
}

pub trait BanwordRepository {
    fn create(&self, record: &NewBanword) -> Result<i64>;
    fn get(&self, id: i64) -> Result<Option<BanwordRecord>>;
    fn set_active(&self, id: i64, active: bool) -> Result<()>;
    fn list_active(&self) -> Result<Vec<BanwordRecord>>;
}

/// Expiring string entries behind [`crate::kv::SqliteStore`]. Times are epoch
/// milliseconds; an entry whose expiry is at or before `now_ms` is gone.
pub trait KvRepository {
    fn get_live(&self, key: &str, now_ms: i64) -> Result<Option<KvEntryRecord>>;
    /// Inserts or replaces the entry.
    fn put(&self, entry: &KvEntryRecord) -> Result<()>;
    /// Writes the entry unless a live one holds the key. Returns whether it
    /// was written.
    fn put_if_absent(&self, entry: &KvEntryRecord, now_ms: i64) -> Result<bool>;
    fn set_expiry(&self, key: &str, expires_at_ms: i64, now_ms: i64) -> Result<()>;
    fn purge_expired(&self, now_ms: i64) -> Result<usize>;
}

pub struct SqliteRepositories<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteRepositories<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    pub fn boards(&self) -> impl BoardRepository + '_ {
        boards::SqliteBoardRepository { conn: self.conn }
    }

    pub fn topics(&self) -> impl TopicRepository + '_ {
        topics::SqliteTopicRepository { conn: self.conn }
    }

    pub fn posts(&self) -> impl PostRepository + '_ {
        posts::SqlitePostRepository { conn: self.conn }
    }

    pub fn bans(&self) -> impl BanRepository + '_ {
        bans::SqliteBanRepository { conn: self.conn }
    }

    pub fn banwords(&self) -> impl BanwordRepository + '_ {
        banwords::SqliteBanwordRepository { conn: self.conn }
    }

    pub fn kv(&self) -> impl KvRepository + '_ {
        kv::SqliteKvRepository { conn: self.conn }
    }
}
