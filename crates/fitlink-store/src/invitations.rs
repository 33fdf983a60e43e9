//! CRUD helpers for the persisted invitation-queue snapshot.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use fitlink_shared::invitation::{Invitation, WorkoutPayload};
use fitlink_shared::types::{GroupId, InvitationId, SessionId, UserId};

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Insert or replace an invitation.  The queue calls this on every
    /// enqueue so a crash between event receipt and resolution loses
    /// nothing.
    pub fn upsert_invitation(&self, invitation: &Invitation) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO invitations
             (invitation_id, session_id, group_id, initiator_id, initiator_name,
              workout_json, expires_at, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                invitation.invitation_id.0.to_string(),
                invitation.session_id.0.to_string(),
                invitation.group_id.0 as i64,
                invitation.initiator_id.0 as i64,
                invitation.initiator_name,
                serde_json::to_string(&invitation.workout)?,
                invitation.expires_at.to_rfc3339(),
                invitation.received_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Remove an invitation (accepted, declined, expired, or dropped
    /// during server reconciliation).
    pub fn delete_invitation(&self, id: InvitationId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM invitations WHERE invitation_id = ?1",
            params![id.0.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Load the full snapshot ordered by arrival.
    pub fn load_pending_invitations(&self) -> Result<Vec<Invitation>> {
        let mut stmt = self.conn().prepare(
            "SELECT invitation_id, session_id, group_id, initiator_id, initiator_name,
                    workout_json, expires_at, received_at
             FROM invitations
             ORDER BY received_at ASC",
        )?;

        let rows = stmt.query_map([], row_to_invitation)?;

        let mut invitations = Vec::new();
        for row in rows {
            invitations.push(row?);
        }
        Ok(invitations)
    }

    /// Delete rows whose expiry is at or before `now`.  Run by the periodic
    /// sweep; returns the number of purged rows.
    pub fn purge_expired_invitations(&self, now: DateTime<Utc>) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM invitations WHERE expires_at <= ?1",
            params![now.to_rfc3339()],
        )?;
        Ok(affected)
    }
}

fn row_to_invitation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Invitation> {
    let id_str: String = row.get(0)?;
    let session_str: String = row.get(1)?;
    let group_id: i64 = row.get(2)?;
    let initiator_id: i64 = row.get(3)?;
    let initiator_name: String = row.get(4)?;
    let workout_json: String = row.get(5)?;
    let expires_str: String = row.get(6)?;
    let received_str: String = row.get(7)?;

    let invitation_id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let session_id = Uuid::parse_str(&session_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let workout: WorkoutPayload = serde_json::from_str(&workout_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let expires_at = parse_rfc3339(&expires_str, 6)?;
    let received_at = parse_rfc3339(&received_str, 7)?;

    Ok(Invitation {
        invitation_id: InvitationId(invitation_id),
        session_id: SessionId(session_id),
        group_id: GroupId(group_id as u64),
        initiator_id: UserId(initiator_id as u64),
        initiator_name,
        workout,
        expires_at,
        received_at,
    })
}

fn parse_rfc3339(s: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_invitation(received_offset_secs: i64) -> Invitation {
        let now = Utc::now();
        Invitation {
            invitation_id: InvitationId::new(),
            session_id: SessionId::new(),
            group_id: GroupId(3),
            initiator_id: UserId(17),
            initiator_name: "casey".into(),
            workout: WorkoutPayload {
                title: "Spin class".into(),
                kind: "cycling".into(),
                duration_minutes: 40,
            },
            expires_at: now + Duration::seconds(received_offset_secs + 120),
            received_at: now + Duration::seconds(received_offset_secs),
        }
    }

    #[test]
    fn upsert_and_load_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let invitation = test_invitation(0);

        db.upsert_invitation(&invitation).unwrap();
        let loaded = db.load_pending_invitations().unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].invitation_id, invitation.invitation_id);
        assert_eq!(loaded[0].workout, invitation.workout);
        // RFC-3339 round trip keeps sub-second precision.
        assert_eq!(loaded[0].expires_at, invitation.expires_at);
    }

    #[test]
    fn upsert_same_id_does_not_duplicate() {
        let db = Database::open_in_memory().unwrap();
        let invitation = test_invitation(0);

        db.upsert_invitation(&invitation).unwrap();
        db.upsert_invitation(&invitation).unwrap();

        assert_eq!(db.load_pending_invitations().unwrap().len(), 1);
    }

    #[test]
    fn load_is_ordered_by_arrival() {
        let db = Database::open_in_memory().unwrap();
        let first = test_invitation(0);
        let second = test_invitation(5);

        // Insert out of order; the query must sort by received_at.
        db.upsert_invitation(&second).unwrap();
        db.upsert_invitation(&first).unwrap();

        let loaded = db.load_pending_invitations().unwrap();
        assert_eq!(loaded[0].invitation_id, first.invitation_id);
        assert_eq!(loaded[1].invitation_id, second.invitation_id);
    }

    #[test]
    fn delete_invitation_removes_row() {
        let db = Database::open_in_memory().unwrap();
        let invitation = test_invitation(0);

        db.upsert_invitation(&invitation).unwrap();
        assert!(db.delete_invitation(invitation.invitation_id).unwrap());
        assert!(!db.delete_invitation(invitation.invitation_id).unwrap());
        assert!(db.load_pending_invitations().unwrap().is_empty());
    }

    #[test]
    fn purge_expired_leaves_live_rows() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        let mut stale = test_invitation(0);
        stale.expires_at = now - Duration::seconds(10);
        let live = test_invitation(1);

        db.upsert_invitation(&stale).unwrap();
        db.upsert_invitation(&live).unwrap();

        assert_eq!(db.purge_expired_invitations(now).unwrap(), 1);
        let remaining = db.load_pending_invitations().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].invitation_id, live.invitation_id);
    }
}
