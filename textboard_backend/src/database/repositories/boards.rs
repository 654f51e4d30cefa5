use crate::database::models::{BoardRecord, BoardStatus, NewBoard};
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};

pub(super) struct SqliteBoardRepository<'conn> {
    pub(super) conn: &'conn Connection,
}

const BOARD_COLUMNS: &str = "id, slug, title, description, status, settings, created_at";

fn board_from_row(row: &Row<'_>) -> rusqlite::Result<BoardRecord> {
    Ok(BoardRecord {
        id: row.get(0)?,
        slug: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: row.get(4)?,
        settings: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl<'conn> super::BoardRepository for SqliteBoardRepository<'conn> {
    fn create(&self, record: &NewBoard) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO boards (slug, title, description, status, settings, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.slug,
                record.title,
                record.description,
                record.status,
                record.settings,
                record.created_at
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get(&self, id: i64) -> Result<Option<BoardRecord>> {
        let sql = format!("SELECT {BOARD_COLUMNS} FROM boards WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], board_from_row)
            .optional()?)
    }

    fn get_by_slug(&self, slug: &str) -> Result<Option<BoardRecord>> {
        let sql = format!("SELECT {BOARD_COLUMNS} FROM boards WHERE slug = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![slug], board_from_row)
            .optional()?)
    }

    fn list(&self) -> Result<Vec<BoardRecord>> {
        let sql = format!("SELECT {BOARD_COLUMNS} FROM boards ORDER BY slug ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], board_from_row)?;
        let mut boards = Vec::new();
        for row in rows {
            boards.push(row?);
        }
        Ok(boards)
    }

    fn set_status(&self, id: i64, status: BoardStatus) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE boards
            SET status = ?1
            WHERE id = ?2
            "#,
            params![status, id],
        )?;
        Ok(())
    }
}
