//! Client-local key-value state.
//!
//! Backs durable client state that has no place in the relational tables,
//! chiefly the message retry queue. Values are opaque strings (JSON in
//! practice).

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::convert::fmt_ts;
use crate::database::Database;
use crate::error::Result;

impl Database {
    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn()
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    pub fn kv_put(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, fmt_ts(&Utc::now())],
        )?;
        Ok(())
    }

    pub fn kv_delete(&self, key: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(affected > 0)
    }

    /// All keys starting with `prefix`, in lexical order.
    pub fn kv_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare(
            "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key ASC",
        )?;
        let rows = stmt.query_map(params![prefix], |row| row.get::<_, String>(0))?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_put_get_delete() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.kv_get("missing").unwrap(), None);

        db.kv_put("a", "1").unwrap();
        db.kv_put("a", "2").unwrap();
        assert_eq!(db.kv_get("a").unwrap().as_deref(), Some("2"));

        assert!(db.kv_delete("a").unwrap());
        assert!(!db.kv_delete("a").unwrap());
    }

    #[test]
    fn test_prefix_scan_is_literal() {
        let db = Database::open_in_memory().unwrap();
        db.kv_put("retry_queue:x_y", "[]").unwrap();
        db.kv_put("retry_queue:a_b", "[]").unwrap();
        db.kv_put("retry%queue:z", "[]").unwrap();
        db.kv_put("other", "{}").unwrap();

        let keys = db.kv_keys_with_prefix("retry_queue:").unwrap();
        assert_eq!(keys, vec!["retry_queue:a_b", "retry_queue:x_y"]);
    }

    #[test]
    fn test_kv_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");
        Database::open_at(&path).unwrap().kv_put("k", "v").unwrap();

        let db = Database::open_at(&path).unwrap();
        assert_eq!(db.kv_get("k").unwrap().as_deref(), Some("v"));
    }
}
