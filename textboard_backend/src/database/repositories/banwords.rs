use crate::database::models::{BanwordRecord, NewBanword};
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};

pub(super) struct SqliteBanwordRepository<'conn> {
    pub(super) conn: &'conn Connection,
}

fn banword_from_row(row: &Row<'_>) -> rusqlite::Result<BanwordRecord> {
    Ok(BanwordRecord {
        id: row.get(0)?,
        expr: row.get(1)?,
        scope: row.get(2)?,
        description: row.get(3)?,
        active: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
    })
}

impl<'conn> super::BanwordRepository for SqliteBanwordRepository<'conn> {
    fn create(&self, record: &NewBanword) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO banwords (expr, scope, description, active, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                record.expr,
                record.scope,
                record.description,
                if record.active { 1 } else { 0 },
                record.created_at
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get(&self, id: i64) -> Result<Option<BanwordRecord>> {
        Ok(self
            .conn
            .query_row(
                r#"
                SELECT id, expr, scope, description, active, created_at
                FROM banwords
                WHERE id = ?1
                "#,
                params![id],
                banword_from_row,
            )
            .optional()?)
    }

    fn set_active(&self, id: i64, active: bool) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE banwords
            SET active = ?1
            WHERE id = ?2
            "#,
            params![if active { 1 } else { 0 }, id],
        )?;
        Ok(())
    }

    fn list_active(&self) -> Result<Vec<BanwordRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, expr, scope, description, active, created_at
            FROM banwords
            WHERE active = 1
            ORDER BY id ASC
            "#,
        )?;
        let rows = stmt.query_map([], banword_from_row)?;
        let mut banwords = Vec::new();
        for row in rows {
            banwords.push(row?);
        }
        Ok(banwords)
    }
}
