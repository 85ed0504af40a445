use rusqlite::{params, OptionalExtension};

use kindred_shared::UserId;

use crate::convert::{enum_col, fmt_ts, ts_col, user_col, uuid_col};
use crate::database::Database;
use crate::error::Result;
use crate::models::Swipe;

impl Database {
    /// Insert a swipe. The `(swiper_id, swiped_id)` unique constraint turns a
    /// second swipe on the same ordered pair into a conflict.
    pub fn insert_swipe(&self, swipe: &Swipe) -> Result<()> {
        self.conn().execute(
            "INSERT INTO swipes (id, swiper_id, swiped_id, action, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                swipe.id.to_string(),
                swipe.swiper_id.to_string(),
                swipe.swiped_id.to_string(),
                swipe.action.as_str(),
                fmt_ts(&swipe.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn find_swipe(&self, swiper: &UserId, swiped: &UserId) -> Result<Option<Swipe>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, swiper_id, swiped_id, action, created_at
                 FROM swipes WHERE swiper_id = ?1 AND swiped_id = ?2",
                params![swiper.to_string(), swiped.to_string()],
                |row| {
                    Ok(Swipe {
                        id: uuid_col(row, 0)?,
                        swiper_id: user_col(row, 1)?,
                        swiped_id: user_col(row, 2)?,
                        action: enum_col(row, 3)?,
                        created_at: ts_col(row, 4)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn count_swipes_by(&self, swiper: &UserId) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM swipes WHERE swiper_id = ?1",
            params![swiper.to_string()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}
