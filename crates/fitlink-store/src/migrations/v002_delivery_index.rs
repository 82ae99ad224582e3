use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Receiver-side status lookups (mark delivered / mark read)
CREATE INDEX IF NOT EXISTS idx_messages_receiver_status
    ON messages(conversation_id, receiver_id, status);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
