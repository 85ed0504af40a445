use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use kindred_shared::{canonical_pair, UserId};

use crate::convert::{fmt_ts, json_col, ts_col, user_col, uuid_col};
use crate::database::Database;
use crate::error::Result;
use crate::models::{Match, MatchInsight};

const MATCH_COLUMNS: &str = "id, user1_id, user2_id, matched_at, is_active,
                             compatibility_score, match_reason, key_factors";

impl Database {
    /// Create the match row for an unordered pair unless one already exists.
    ///
    /// Runs as one transaction: `INSERT OR IGNORE` against the
    /// `(user1_id, user2_id)` unique constraint, then read back whichever row
    /// won. Returns the row and whether this call created it.
    pub fn create_match_if_not_exists(
        &mut self,
        a: &UserId,
        b: &UserId,
        insight: &MatchInsight,
    ) -> Result<(Match, bool)> {
        let candidate = Match::new(*a, *b, insight.clone());
        let tx = self.conn_mut().transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO matches
                (id, user1_id, user2_id, matched_at, is_active, compatibility_score, match_reason, key_factors)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7)",
            params![
                candidate.id.to_string(),
                candidate.user1_id.to_string(),
                candidate.user2_id.to_string(),
                fmt_ts(&candidate.matched_at),
                candidate.compatibility_score,
                candidate.match_reason,
                serde_json::to_string(&candidate.key_factors)?,
            ],
        )?;

        let sql = format!("SELECT {MATCH_COLUMNS} FROM matches WHERE user1_id = ?1 AND user2_id = ?2");
        let row = tx.query_row(
            &sql,
            params![candidate.user1_id.to_string(), candidate.user2_id.to_string()],
            row_to_match,
        )?;
        tx.commit()?;

        let created = inserted > 0;
        tracing::debug!(match_id = %row.id, created, "create_match_if_not_exists");
        Ok((row, created))
    }

    pub fn get_match(&self, id: Uuid) -> Result<Match> {
        let sql = format!("SELECT {MATCH_COLUMNS} FROM matches WHERE id = ?1");
        Ok(self
            .conn()
            .query_row(&sql, params![id.to_string()], row_to_match)?)
    }

    pub fn match_for_pair(&self, a: &UserId, b: &UserId) -> Result<Option<Match>> {
        let (user1, user2) = canonical_pair(a, b);
        let sql = format!("SELECT {MATCH_COLUMNS} FROM matches WHERE user1_id = ?1 AND user2_id = ?2");
        Ok(self
            .conn()
            .query_row(&sql, params![user1.to_string(), user2.to_string()], row_to_match)
            .optional()?)
    }

    /// Active matches naming `user` in either slot, newest first.
    pub fn active_matches_for(&self, user: &UserId) -> Result<Vec<Match>> {
        let sql = format!(
            "SELECT {MATCH_COLUMNS} FROM matches
             WHERE (user1_id = ?1 OR user2_id = ?1) AND is_active = 1
             ORDER BY matched_at DESC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![user.to_string()], row_to_match)?;

        let mut matches = Vec::new();
        for row in rows {
            matches.push(row?);
        }
        Ok(matches)
    }

    /// Set `is_active = false`. Calling it on an already inactive match is a
    /// no-op that still returns the row.
    pub fn deactivate_match(&self, id: Uuid) -> Result<Match> {
        self.conn().execute(
            "UPDATE matches SET is_active = 0 WHERE id = ?1",
            params![id.to_string()],
        )?;
        self.get_match(id)
    }
}

fn row_to_match(row: &rusqlite::Row<'_>) -> rusqlite::Result<Match> {
    Ok(Match {
        id: uuid_col(row, 0)?,
        user1_id: user_col(row, 1)?,
        user2_id: user_col(row, 2)?,
        matched_at: ts_col(row, 3)?,
        is_active: row.get(4)?,
        compatibility_score: row.get(5)?,
        match_reason: row.get(6)?,
        key_factors: json_col(row, 7)?,
    })
}
