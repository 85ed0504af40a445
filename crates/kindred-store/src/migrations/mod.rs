//! Schema migrations, keyed by `PRAGMA user_version`.
//!
//! Each step runs inside its own transaction together with the version bump,
//! so a crash mid-migration leaves the previous version intact.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> rusqlite::Result<()>;

/// Ordered migration steps. Append a new entry for every schema change.
const STEPS: &[(u32, &str, Step)] = &[(1, "v001_initial", v001_initial::up)];

pub fn latest_version() -> u32 {
    STEPS.last().map_or(0, |(version, _, _)| *version)
}

/// Bring the schema on `conn` up to [`latest_version`].
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if current > latest_version() {
        return Err(StoreError::Migration(format!(
            "database schema v{current} is newer than this build (v{})",
            latest_version()
        )));
    }

    for (version, name, step) in STEPS.iter().filter(|(v, _, _)| *v > current) {
        tracing::info!(version, name, "applying migration");
        let tx = conn.transaction()?;
        step(&tx).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
    }

    Ok(())
}
