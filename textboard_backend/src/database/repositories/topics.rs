use crate::database::models::{NewTopic, TopicMetaRecord, TopicRecord, TopicStatus};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

pub(super) struct SqliteTopicRepository<'conn> {
    pub(super) conn: &'conn Connection,
}

const TOPIC_COLUMNS: &str = "id, board_id, title, status, created_at, updated_at";

fn topic_from_row(row: &Row<'_>) -> rusqlite::Result<TopicRecord> {
    Ok(TopicRecord {
        id: row.get(0)?,
        board_id: row.get(1)?,
        title: row.get(2)?,
        status: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

impl<'conn> super::TopicRepository for SqliteTopicRepository<'conn> {
    fn create(&self, record: &NewTopic) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO topics (board_id, title, status, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![record.board_id, record.title, record.status, record.created_at],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get(&self, id: i64) -> Result<Option<TopicRecord>> {
        let sql = format!("SELECT {TOPIC_COLUMNS} FROM topics WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], topic_from_row)
            .optional()?)
    }

    fn list_for_board(&self, board_id: i64, limit: usize) -> Result<Vec<TopicRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT t.id, t.board_id, t.title, t.status, t.created_at, t.updated_at
            FROM topics t
            LEFT JOIN topic_meta m ON m.topic_id = t.id
            WHERE t.board_id = ?1
            ORDER BY julianday(COALESCE(m.bumped_at, t.created_at)) DESC, t.id DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![board_id, limit as i64], topic_from_row)?;
        let mut topics = Vec::new();
        for row in rows {
            topics.push(row?);
        }
        Ok(topics)
    }

    fn set_status(&self, id: i64, status: TopicStatus, updated_at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE topics
            SET status = ?1, updated_at = ?2
            WHERE id = ?3
            "#,
            params![status, updated_at, id],
        )?;
        Ok(())
    }

    fn create_meta(&self, meta: &TopicMetaRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO topic_meta (topic_id, post_count, posted_at, bumped_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![meta.topic_id, meta.post_count, meta.posted_at, meta.bumped_at],
        )?;
        Ok(())
    }

    fn get_meta(&self, topic_id: i64) -> Result<Option<TopicMetaRecord>> {
        Ok(self
            .conn
            .query_row(
                r#"
                SELECT topic_id, post_count, posted_at, bumped_at
                FROM topic_meta
                WHERE topic_id = ?1
                "#,
                params![topic_id],
                |row| {
                    Ok(TopicMetaRecord {
                        topic_id: row.get(0)?,
                        post_count: row.get(1)?,
                        posted_at: row.get(2)?,
                        bumped_at: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    fn update_meta(&self, meta: &TopicMetaRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO topic_meta (topic_id, post_count, posted_at, bumped_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(topic_id) DO UPDATE SET
                post_count = excluded.post_count,
                posted_at = excluded.posted_at,
                bumped_at = excluded.bumped_at
            "#,
            params![meta.topic_id, meta.post_count, meta.posted_at, meta.bumped_at],
        )?;
        Ok(())
    }
}
