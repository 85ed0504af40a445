//! The SQLite handle every CRUD helper hangs off.
//!
//! Opening a [`Database`] always leaves the schema at the latest migration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

const DB_FILE: &str = "kindred.db";

/// Writers from another handle (a second app instance) wait this long for
/// the lock before failing with `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open the database in the platform data directory, creating the
    /// directory on first run.
    pub fn new() -> Result<Self> {
        let path = Self::default_path()?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        tracing::info!(path = %path.display(), "opening Kindred database");
        Self::open_at(&path)
    }

    /// `<data dir>/kindred.db`, e.g. `~/.local/share/kindred/kindred.db` on Linux.
    pub fn default_path() -> Result<PathBuf> {
        ProjectDirs::from("app", "kindred", "kindred")
            .map(|dirs| dirs.data_dir().join(DB_FILE))
            .ok_or(StoreError::NoDataDir)
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::configure(conn)
    }

    /// Private in-memory database; nothing outlives the handle.
    pub fn open_in_memory() -> Result<Self> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(mut conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        migrations::run_migrations(&mut conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Mutable access, for helpers that open a transaction.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// File backing this handle; `None` for in-memory databases.
    pub fn path(&self) -> Option<PathBuf> {
        self.conn
            .path()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }
}
