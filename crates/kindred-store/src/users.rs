use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::params;

use kindred_shared::UserId;

use crate::convert::{fmt_date, fmt_ts, json_col, opt_date_col, opt_ts_col, ts_col, user_col};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{SwipeQuota, UserProfile};

impl Database {
    /// Insert or replace a user row.
    pub fn upsert_user(&self, user: &UserProfile) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, display_name, bio, interests, is_premium, daily_swipes,
                                last_swipe_reset, last_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                bio = excluded.bio,
                interests = excluded.interests,
                is_premium = excluded.is_premium,
                daily_swipes = excluded.daily_swipes,
                last_swipe_reset = excluded.last_swipe_reset,
                last_active = excluded.last_active",
            params![
                user.id.to_string(),
                user.display_name,
                user.bio,
                serde_json::to_string(&user.interests)?,
                user.is_premium,
                user.daily_swipes,
                user.last_swipe_reset.as_ref().map(fmt_date),
                user.last_active.as_ref().map(fmt_ts),
                fmt_ts(&user.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &UserId) -> Result<UserProfile> {
        Ok(self.conn().query_row(
            "SELECT id, display_name, bio, interests, is_premium, daily_swipes,
                    last_swipe_reset, last_active, created_at
             FROM users WHERE id = ?1",
            params![id.to_string()],
            |row| {
                Ok(UserProfile {
                    id: user_col(row, 0)?,
                    display_name: row.get(1)?,
                    bio: row.get(2)?,
                    interests: json_col(row, 3)?,
                    is_premium: row.get(4)?,
                    daily_swipes: row.get(5)?,
                    last_swipe_reset: opt_date_col(row, 6)?,
                    last_active: opt_ts_col(row, 7)?,
                    created_at: ts_col(row, 8)?,
                })
            },
        )?)
    }

    /// Heartbeat write used as the presence fallback signal.
    pub fn touch_last_active(&self, id: &UserId, at: DateTime<Utc>) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE users SET last_active = ?1 WHERE id = ?2",
            params![fmt_ts(&at), id.to_string()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn set_premium(&self, id: &UserId, is_premium: bool) -> Result<()> {
        self.conn().execute(
            "UPDATE users SET is_premium = ?1 WHERE id = ?2",
            params![is_premium, id.to_string()],
        )?;
        Ok(())
    }

    /// Read the user's swipe quota for `today`, refilling it to `daily_limit`
    /// first when the last refill happened on an earlier day.
    pub fn swipe_quota(
        &mut self,
        id: &UserId,
        today: NaiveDate,
        daily_limit: i64,
    ) -> Result<SwipeQuota> {
        let tx = self.conn_mut().transaction()?;

        let (is_premium, remaining, last_reset): (bool, i64, Option<String>) = tx.query_row(
            "SELECT is_premium, daily_swipes, last_swipe_reset FROM users WHERE id = ?1",
            params![id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let today_text = fmt_date(&today);
        let remaining = if last_reset.as_deref() != Some(today_text.as_str()) {
            tx.execute(
                "UPDATE users SET daily_swipes = ?1, last_swipe_reset = ?2 WHERE id = ?3",
                params![daily_limit, today_text, id.to_string()],
            )?;
            tracing::debug!(user = %id, limit = daily_limit, "daily swipe quota refilled");
            daily_limit
        } else {
            remaining
        };

        tx.commit()?;

        Ok(SwipeQuota {
            is_premium,
            remaining,
        })
    }

    /// Atomically take one swipe from the daily counter. Returns `false` when
    /// the counter was already at zero.
    pub fn decrement_daily_swipes(&self, id: &UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE users SET daily_swipes = daily_swipes - 1
             WHERE id = ?1 AND daily_swipes > 0",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }
}
