//! v001 -- Initial schema creation.
//!
//! Creates the relational tables the core depends on (`users`, `messages`,
//! `swipes`, `matches`) and the client-local `kv` table.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id               TEXT PRIMARY KEY NOT NULL,   -- UUID
    display_name     TEXT NOT NULL,
    bio              TEXT,
    interests        TEXT NOT NULL DEFAULT '[]',  -- JSON array of strings
    is_premium       INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    daily_swipes     INTEGER NOT NULL DEFAULT 0,  -- remaining swipes today
    last_swipe_reset TEXT,                        -- YYYY-MM-DD
    last_active      TEXT,                        -- RFC-3339
    created_at       TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id           TEXT PRIMARY KEY NOT NULL,   -- client-generated UUID v4
    sender_id    TEXT NOT NULL,
    recipient_id TEXT NOT NULL,
    content      TEXT NOT NULL DEFAULT '',
    message_type TEXT NOT NULL,               -- text | image | invite | ai_plan | photo_comment
    metadata     TEXT NOT NULL DEFAULT '{}',  -- JSON
    is_read      INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_pair
    ON messages(sender_id, recipient_id, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_unread
    ON messages(recipient_id, is_read);

-- ----------------------------------------------------------------
-- Swipes
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS swipes (
    id         TEXT PRIMARY KEY NOT NULL,
    swiper_id  TEXT NOT NULL,
    swiped_id  TEXT NOT NULL,
    action     TEXT NOT NULL,                 -- like | pass | superlike
    created_at TEXT NOT NULL,

    UNIQUE (swiper_id, swiped_id)
);

-- ----------------------------------------------------------------
-- Matches (user1_id < user2_id)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS matches (
    id                  TEXT PRIMARY KEY NOT NULL,
    user1_id            TEXT NOT NULL,
    user2_id            TEXT NOT NULL,
    matched_at          TEXT NOT NULL,
    is_active           INTEGER NOT NULL DEFAULT 1,
    compatibility_score INTEGER NOT NULL DEFAULT 0,
    match_reason        TEXT NOT NULL DEFAULT '',
    key_factors         TEXT NOT NULL DEFAULT '[]', -- JSON array of strings

    UNIQUE (user1_id, user2_id),
    CHECK (user1_id < user2_id)
);

CREATE INDEX IF NOT EXISTS idx_matches_user2 ON matches(user2_id);

-- ----------------------------------------------------------------
-- Client-local key-value state
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS kv (
    key        TEXT PRIMARY KEY NOT NULL,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
