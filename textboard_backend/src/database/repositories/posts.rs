use crate::database::models::{NewPost, PostQuery, PostRecord, RECENT_POSTS};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

pub(super) struct SqlitePostRepository<'conn> {
    pub(super) conn: &'conn Connection,
}

fn post_from_row(row: &Row<'_>) -> rusqlite::Result<PostRecord> {
    Ok(PostRecord {
        id: row.get(0)?,
        topic_id: row.get(1)?,
        number: row.get(2)?,
        name: row.get(3)?,
        body: row.get(4)?,
        bumped: row.get::<_, i64>(5)? != 0,
        ident: row.get(6)?,
        ident_type: row.get(7)?,
        ip_address: row.get(8)?,
        created_at: row.get(9)?,
    })
}

impl<'conn> SqlitePostRepository<'conn> {
    /// Inclusive number bounds selected by `query`.
    fn bounds(&self, topic_id: i64, query: PostQuery) -> Result<(i64, i64)> {
        use super::PostRepository;

        Ok(match query {
            PostQuery::All => (1, i64::MAX),
            PostQuery::Single(number) => (number, number),
            PostQuery::Range(start, end) => (start, end),
            PostQuery::Last(count) => {
                let last = self.max_number(topic_id)?;
                ((last - count + 1).max(1), last)
            }
            PostQuery::Recent => {
                let last = self.max_number(topic_id)?;
                ((last - RECENT_POSTS + 1).max(1), last)
            }
        })
    }
}

impl<'conn> super::PostRepository for SqlitePostRepository<'conn> {
    fn create(&self, record: &NewPost) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO posts (topic_id, number, name, body, bumped, ident, ident_type, ip_address, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                record.topic_id,
                record.number,
                record.name,
                record.body,
                if record.bumped { 1 } else { 0 },
                record.ident,
                record.ident_type,
                record.ip_address,
                record.created_at
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get(&self, id: i64) -> Result<Option<PostRecord>> {
        Ok(self
            .conn
            .query_row(
                r#"
                SELECT id, topic_id, number, name, body, bumped, ident, ident_type, ip_address, created_at
                FROM posts
                WHERE id = ?1
                "#,
                params![id],
                post_from_row,
            )
            .optional()?)
    }

    fn max_number(&self, topic_id: i64) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COALESCE(MAX(number), 0) FROM posts WHERE topic_id = ?1",
            params![topic_id],
            |row| row.get(0),
        )?)
    }

    fn count_for_topic(&self, topic_id: i64) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM posts WHERE topic_id = ?1",
            params![topic_id],
            |row| row.get(0),
        )?)
    }

    fn list_for_topic(&self, topic_id: i64, query: PostQuery) -> Result<Vec<PostRecord>> {
        let (first, last) = self.bounds(topic_id, query)?;
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, topic_id, number, name, body, bumped, ident, ident_type, ip_address, created_at
            FROM posts
            WHERE topic_id = ?1 AND number BETWEEN ?2 AND ?3
            ORDER BY number ASC
            "#,
        )?;
        let rows = stmt.query_map(params![topic_id, first, last], post_from_row)?;
        let mut posts = Vec::new();
        for row in rows {
            posts.push(row?);
        }
        Ok(posts)
    }

    fn was_recently_seen(&self, ip_address: &str, since: DateTime<Utc>) -> Result<bool> {
        Ok(self.conn.query_row(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM posts
                WHERE ip_address = ?1 AND julianday(created_at) >= julianday(?2)
            )
            "#,
            params![ip_address, since],
            |row| row.get(0),
        )?)
    }
}
