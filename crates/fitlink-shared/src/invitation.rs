use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{GroupId, InvitationId, SessionId, UserId};

/// Description of the workout the invitation is for.  Opaque to the
/// coordination layer; carried through to the UI and persisted as JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkoutPayload {
    pub title: String,
    pub kind: String,
    pub duration_minutes: u32,
}

/// A pending group-workout invitation.
///
/// `expires_at` is an absolute instant, never a countdown: remaining time is
/// always recomputed as `expires_at - now`, so a client that was
/// backgrounded shows the correct reduced time on resume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Invitation {
    pub invitation_id: InvitationId,
    pub session_id: SessionId,
    pub group_id: GroupId,
    pub initiator_id: UserId,
    pub initiator_name: String,
    pub workout: WorkoutPayload,
    pub expires_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl Invitation {
    /// Seconds until expiry as of `now`.  Negative once expired.
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.remaining_secs(now) <= 0
    }
}
