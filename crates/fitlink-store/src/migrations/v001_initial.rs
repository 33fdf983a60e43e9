//! v001 -- Initial schema creation.
//!
//! Creates the `invitations` table holding the persisted queue snapshot.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Pending workout invitations (queue snapshot)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS invitations (
    invitation_id  TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    session_id     TEXT NOT NULL,              -- UUID v4
    group_id       INTEGER NOT NULL,
    initiator_id   INTEGER NOT NULL,
    initiator_name TEXT NOT NULL,
    workout_json   TEXT NOT NULL,              -- serialized WorkoutPayload
    expires_at     TEXT NOT NULL,              -- RFC-3339, absolute instant
    received_at    TEXT NOT NULL               -- RFC-3339
);

CREATE INDEX IF NOT EXISTS idx_invitations_received_at
    ON invitations(received_at);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
