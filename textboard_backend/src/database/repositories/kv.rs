use crate::database::models::KvEntryRecord;
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

pub(super) struct SqliteKvRepository<'conn> {
    pub(super) conn: &'conn Connection,
}

impl<'conn> super::KvRepository for SqliteKvRepository<'conn> {
    fn get_live(&self, key: &str, now_ms: i64) -> Result<Option<KvEntryRecord>> {
        Ok(self
            .conn
            .query_row(
                r#"
                SELECT key, value, expires_at_ms
                FROM kv_entries
                WHERE key = ?1 AND (expires_at_ms IS NULL OR expires_at_ms > ?2)
                "#,
                params![key, now_ms],
                |row| {
                    Ok(KvEntryRecord {
                        key: row.get(0)?,
                        value: row.get(1)?,
                        expires_at_ms: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    fn put(&self, entry: &KvEntryRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO kv_entries (key, value, expires_at_ms)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at_ms = excluded.expires_at_ms
            "#,
            params![entry.key, entry.value, entry.expires_at_ms],
        )?;
        Ok(())
    }

    fn put_if_absent(&self, entry: &KvEntryRecord, now_ms: i64) -> Result<bool> {
        // An expired row still occupies the key, so the upsert takes it over.
        let changed = self.conn.execute(
            r#"
            INSERT INTO kv_entries (key, value, expires_at_ms)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at_ms = excluded.expires_at_ms
            WHERE kv_entries.expires_at_ms IS NOT NULL AND kv_entries.expires_at_ms <= ?4
            "#,
            params![entry.key, entry.value, entry.expires_at_ms, now_ms],
        )?;
        Ok(changed == 1)
    }

    fn set_expiry(&self, key: &str, expires_at_ms: i64, now_ms: i64) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE kv_entries
            SET expires_at_ms = ?2
            WHERE key = ?1 AND (expires_at_ms IS NULL OR expires_at_ms > ?3)
            "#,
            params![key, expires_at_ms, now_ms],
        )?;
        Ok(())
    }

    fn purge_expired(&self, now_ms: i64) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM kv_entries WHERE expires_at_ms IS NOT NULL AND expires_at_ms <= ?1",
            params![now_ms],
        )?)
    }
}
