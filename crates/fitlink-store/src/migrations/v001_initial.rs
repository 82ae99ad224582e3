//! v001 -- Initial schema creation.
//!
//! Creates `users`, `conversations` and `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (public profile summary of clients and trainers)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,   -- opaque id from the identity provider
    role         TEXT NOT NULL,               -- 'client' | 'trainer'
    display_name TEXT,
    avatar_url   TEXT,
    created_at   TEXT NOT NULL                -- RFC-3339, fixed width
);

-- ----------------------------------------------------------------
-- Conversations (exactly one per client/trainer pair)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id                   TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    client_id            TEXT NOT NULL,
    trainer_id           TEXT NOT NULL,
    status               TEXT NOT NULL DEFAULT 'active',
    last_message_preview TEXT,
    last_message_at      TEXT,
    total_message_count  INTEGER NOT NULL DEFAULT 0,
    client_unread_count  INTEGER NOT NULL DEFAULT 0,
    trainer_unread_count INTEGER NOT NULL DEFAULT 0,
    created_at           TEXT NOT NULL,

    CHECK (client_id <> trainer_id)
);

-- Unordered pair: (a, b) and (b, a) collide.
CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_pair
    ON conversations(min(client_id, trainer_id), max(client_id, trainer_id));

CREATE INDEX IF NOT EXISTS idx_conversations_client ON conversations(client_id);
CREATE INDEX IF NOT EXISTS idx_conversations_trainer ON conversations(trainer_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id                  TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_id     TEXT NOT NULL,              -- FK -> conversations(id)
    seq                 INTEGER NOT NULL,           -- per-conversation insertion order
    sender_id           TEXT NOT NULL,
    receiver_id         TEXT NOT NULL,
    message_type        TEXT NOT NULL,              -- text | image | file | system
    content             TEXT NOT NULL,
    metadata            TEXT NOT NULL DEFAULT '{}', -- JSON
    status              TEXT NOT NULL DEFAULT 'sent',
    created_at          TEXT NOT NULL,
    read_at             TEXT,
    reply_to_message_id TEXT,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id),
    UNIQUE (conversation_id, seq)
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_seq
    ON messages(conversation_id, seq DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
