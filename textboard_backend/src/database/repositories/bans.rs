use crate::database::models::{BanRecord, NewBan};
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};

pub(super) struct SqliteBanRepository<'conn> {
    pub(super) conn: &'conn Connection,
}

fn ban_from_row(row: &Row<'_>) -> rusqlite::Result<BanRecord> {
    Ok(BanRecord {
        id: row.get(0)?,
        ip_address: row.get(1)?,
        scope: row.get(2)?,
        description: row.get(3)?,
        active: row.get::<_, i64>(4)? != 0,
        active_until: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl<'conn> super::BanRepository for SqliteBanRepository<'conn> {
    fn create(&self, record: &NewBan) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO bans (ip_address, scope, description, active, active_until, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.ip_address,
                record.scope,
                record.description,
                if record.active { 1 } else { 0 },
                record.active_until,
                record.created_at
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get(&self, id: i64) -> Result<Option<BanRecord>> {
        Ok(self
            .conn
            .query_row(
                r#"
                SELECT id, ip_address, scope, description, active, active_until, created_at
                FROM bans
                WHERE id = ?1
                "#,
                params![id],
                ban_from_row,
            )
            .optional()?)
    }

    fn set_active(&self, id: i64, active: bool) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE bans
            SET active = ?1
            WHERE id = ?2
            "#,
            params![if active { 1 } else { 0 }, id],
        )?;
        Ok(())
    }

    fn list_active(&self) -> Result<Vec<BanRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, ip_address, scope, description, active, active_until, created_at
            FROM bans
            WHERE active = 1
            ORDER BY active_until IS NULL, julianday(active_until) DESC, julianday(created_at) DESC
            "#,
        )?;
        let rows = stmt.query_map([], ban_from_row)?;
        let mut bans = Vec::new();
        for row in rows {
            bans.push(row?);
        }
        Ok(bans)
    }
}
