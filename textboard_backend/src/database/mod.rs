pub mod models;
pub mod repositories;

use crate::config::TextboardPaths;
use anyhow::{anyhow, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) const MIGRATIONS: &str = r#"
    PRAGMA journal_mode = WAL;
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS boards (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        slug TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        description TEXT,
        status TEXT NOT NULL DEFAULT 'open',
        settings TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS topics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        board_id INTEGER NOT NULL,
        title TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'open',
        created_at TEXT NOT NULL,
        updated_at TEXT,
        FOREIGN KEY (board_id) REFERENCES boards(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS topic_meta (
        topic_id INTEGER PRIMARY KEY,
        post_count INTEGER NOT NULL DEFAULT 0,
        posted_at TEXT,
        bumped_at TEXT,
        FOREIGN KEY (topic_id) REFERENCES topics(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS posts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        topic_id INTEGER NOT NULL,
        number INTEGER NOT NULL,
        name TEXT NOT NULL,
        body TEXT NOT NULL,
        bumped INTEGER NOT NULL DEFAULT 1,
        ident TEXT,
        ident_type TEXT NOT NULL DEFAULT 'none',
        ip_address TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (topic_id, number),
        FOREIGN KEY (topic_id) REFERENCES topics(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS bans (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ip_address TEXT NOT NULL,
        scope TEXT,
        description TEXT,
        active INTEGER NOT NULL DEFAULT 1,
        active_until TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS banwords (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        expr TEXT NOT NULL,
        scope TEXT,
        description TEXT,
        active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS kv_entries (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        expires_at_ms INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_topics_board ON topics(board_id);
    CREATE INDEX IF NOT EXISTS idx_posts_ip_created ON posts(ip_address, created_at);
    CREATE INDEX IF NOT EXISTS idx_bans_active ON bans(active);
    CREATE INDEX IF NOT EXISTS idx_banwords_active ON banwords(active);
    CREATE INDEX IF NOT EXISTS idx_kv_entries_expiry ON kv_entries(expires_at_ms);
"#;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    newly_created: bool,
}

impl Database {
    pub fn connect(paths: &TextboardPaths, busy_timeout: Duration) -> Result<Self> {
        let newly_created = !paths.db_path.exists();
        let conn = Connection::open(&paths.db_path)?;
        conn.busy_timeout(busy_timeout)?;
        Ok(Self::from_connection(conn, newly_created))
    }

    pub fn from_connection(conn: Connection, newly_created: bool) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            newly_created,
        }
    }

    /// Fresh migrated database that lives as long as the handle.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        let database = Self::from_connection(conn, true);
        database.ensure_migrations()?;
        Ok(database)
    }

    pub fn ensure_migrations(&self) -> Result<bool> {
        self.with_conn(|conn| {
            conn.execute_batch(MIGRATIONS)?;
            Ok(())
        })?;
        Ok(self.newly_created)
    }

    pub fn with_repositories<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(repositories::SqliteRepositories<'_>) -> Result<T>,
    {
        self.with_conn(|conn| {
            let repos = repositories::SqliteRepositories::new(conn);
            f(repos)
        })
    }

    /// Runs `f` inside a `BEGIN IMMEDIATE` transaction: commits on `Ok`, rolls
    /// back on `Err`. The connection mutex plus SQLite's reserved write lock
    /// make the closure the only writer until it returns, which is what
    /// serializes post numbering within a topic.
    pub fn with_transaction<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(repositories::SqliteRepositories<'_>) -> std::result::Result<T, E>,
        E: From<anyhow::Error>,
    {
        let guard = self
            .conn
            .lock()
            .map_err(|_| anyhow!("database mutex poisoned"))?;
        let tx = Transaction::new_unchecked(&guard, TransactionBehavior::Immediate)
            .map_err(anyhow::Error::from)?;
        let value = f(repositories::SqliteRepositories::new(&tx))?;
        tx.commit().map_err(anyhow::Error::from)?;
        Ok(value)
    }

    fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let guard = self
            .conn
            .lock()
            .map_err(|_| anyhow!("database mutex poisoned"))?;
        f(&guard)
    }
}
