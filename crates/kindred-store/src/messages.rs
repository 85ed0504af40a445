use rusqlite::params;
use uuid::Uuid;

use kindred_shared::{DeliveryStatus, UserId};

use crate::convert::{enum_col, fmt_ts, json_col, ts_col, user_col, uuid_col};
use crate::database::Database;
use crate::error::Result;
use crate::models::Message;

const MESSAGE_COLUMNS: &str =
    "id, sender_id, recipient_id, content, message_type, metadata, is_read, created_at";

impl Database {
    /// Insert a message. A second insert with the same id fails with
    /// [`StoreError::Conflict`](crate::StoreError::Conflict), which is what
    /// makes client retries idempotent.
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.conn().execute(
            "INSERT INTO messages (id, sender_id, recipient_id, content, message_type, metadata, is_read, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.id.to_string(),
                message.sender_id.to_string(),
                message.recipient_id.to_string(),
                message.body,
                message.kind.as_str(),
                serde_json::to_string(&message.metadata)?,
                message.is_read,
                fmt_ts(&message.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_message_by_id(&self, id: Uuid) -> Result<Message> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
        Ok(self
            .conn()
            .query_row(&sql, params![id.to_string()], row_to_message)?)
    }

    /// Full history between two users, both directions, oldest first.
    pub fn conversation(&self, a: &UserId, b: &UserId) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE (sender_id = ?1 AND recipient_id = ?2)
                OR (sender_id = ?2 AND recipient_id = ?1)
             ORDER BY created_at ASC, id ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![a.to_string(), b.to_string()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Mark every unread message from `partner` to `reader` as read.
    /// Returns the number of rows flipped.
    pub fn mark_conversation_read(&self, reader: &UserId, partner: &UserId) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE messages SET is_read = 1
             WHERE recipient_id = ?1 AND sender_id = ?2 AND is_read = 0",
            params![reader.to_string(), partner.to_string()],
        )?;
        Ok(affected)
    }

    pub fn unread_count(&self, user: &UserId) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE recipient_id = ?1 AND is_read = 0",
            params![user.to_string()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: uuid_col(row, 0)?,
        sender_id: user_col(row, 1)?,
        recipient_id: user_col(row, 2)?,
        body: row.get(3)?,
        kind: enum_col(row, 4)?,
        metadata: json_col(row, 5)?,
        is_read: row.get(6)?,
        created_at: ts_col(row, 7)?,
        delivery_status: DeliveryStatus::Sent,
    })
}
