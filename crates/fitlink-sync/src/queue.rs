//! Durable, ordered queue of pending workout invitations.
//!
//! Invitations arrive by push event or backfill, live in arrival order
//! keyed by id, and leave by accept, decline, or expiry.  The earliest
//! non-terminal invitation is the one shown to the user; the rest wait.
//! Every mutation is mirrored to the local store so a restart recovers the
//! queue, and a server fetch reconciles it (the server list is
//! authoritative).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fitlink_shared::constants::{INVITATION_TICK_MS, QUEUE_SWEEP_SECS};
use fitlink_shared::error::ApiError;
use fitlink_shared::invitation::Invitation;
use fitlink_shared::types::InvitationId;
use fitlink_store::Database;

use crate::api::{FitnessApi, SessionHandle};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invitation {0} is not queued")]
    NotQueued(InvitationId),

    #[error(transparent)]
    Api(#[from] ApiError),
}

struct QueueInner {
    /// Pending invitations, ordered by `received_at`.
    pending: Vec<Invitation>,
    /// Ids that reached a terminal state (accepted, declined, expired).
    /// Guards against re-enqueue of resolved invitations and against an
    /// expiry timer firing twice producing two declines.
    resolved: HashSet<InvitationId>,
}

/// The per-user invitation queue.
///
/// Lock discipline: the inner mutex is only ever held for map surgery,
/// never across an API call or store write.
pub struct InvitationQueue {
    api: Arc<dyn FitnessApi>,
    store: Option<Arc<Mutex<Database>>>,
    inner: Mutex<QueueInner>,
}

impl InvitationQueue {
    pub fn new(api: Arc<dyn FitnessApi>, store: Option<Arc<Mutex<Database>>>) -> Self {
        Self {
            api,
            store,
            inner: Mutex::new(QueueInner {
                pending: Vec::new(),
                resolved: HashSet::new(),
            }),
        }
    }

    /// Insert an invitation unless it is already queued or already reached
    /// a terminal state.  Returns whether it was inserted.
    pub fn enqueue(&self, invitation: Invitation) -> bool {
        let inserted = {
            let mut inner = self.inner.lock().expect("queue lock");
            if inner.resolved.contains(&invitation.invitation_id)
                || inner
                    .pending
                    .iter()
                    .any(|i| i.invitation_id == invitation.invitation_id)
            {
                false
            } else {
                insert_by_arrival(&mut inner.pending, invitation.clone());
                true
            }
        };
        if inserted {
            debug!(invitation = %invitation.invitation_id, "invitation enqueued");
            self.persist_insert(&invitation);
        }
        inserted
    }

    /// The invitation currently shown to the user: earliest-received and
    /// not yet terminal.
    pub fn current(&self) -> Option<Invitation> {
        self.inner
            .lock()
            .expect("queue lock")
            .pending
            .first()
            .cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().expect("queue lock").pending.len()
    }

    pub fn contains(&self, id: InvitationId) -> bool {
        self.inner
            .lock()
            .expect("queue lock")
            .pending
            .iter()
            .any(|i| i.invitation_id == id)
    }

    /// Accept an invitation.  On API success the invitation leaves the
    /// queue and the session handle is returned for navigation.  On failure
    /// the invitation stays queued and the error is surfaced; accepting is
    /// never retried automatically.
    pub async fn accept(&self, id: InvitationId) -> Result<SessionHandle, QueueError> {
        if !self.contains(id) {
            return Err(QueueError::NotQueued(id));
        }

        let handle = self.api.accept_invitation(id).await?;

        self.remove_resolved(id);
        info!(invitation = %id, session = %handle.session_id, "invitation accepted");
        Ok(handle)
    }

    /// Decline an invitation.  The invitation is removed from the queue
    /// regardless of the API outcome; a failed decline call is only logged.
    pub async fn decline(&self, id: InvitationId) -> Result<(), QueueError> {
        let was_queued = self.remove_resolved(id);
        if !was_queued {
            return Err(QueueError::NotQueued(id));
        }

        if let Err(e) = self.api.decline_invitation(id).await {
            warn!(invitation = %id, error = %e, "decline call failed, invitation dropped anyway");
        } else {
            info!(invitation = %id, "invitation declined");
        }
        Ok(())
    }

    /// Auto-decline every invitation whose expiry has passed as of `now`.
    ///
    /// Remaining time is always `expires_at - now`, so a client that was
    /// backgrounded sees its invitations expire at the right instant on
    /// resume.  Ids are marked resolved before the decline call goes out,
    /// so a timer firing twice cannot produce two declines.  Returns the
    /// number of invitations expired.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<Invitation> = {
            let mut inner = self.inner.lock().expect("queue lock");
            let (expired, live): (Vec<_>, Vec<_>) = inner
                .pending
                .drain(..)
                .partition(|i| i.is_expired(now));
            inner.pending = live;
            for invitation in &expired {
                inner.resolved.insert(invitation.invitation_id);
            }
            expired
        };

        for invitation in &expired {
            self.persist_delete(invitation.invitation_id);
            info!(invitation = %invitation.invitation_id, "invitation expired, auto-declining");
            if let Err(e) = self.api.decline_invitation(invitation.invitation_id).await {
                warn!(
                    invitation = %invitation.invitation_id,
                    error = %e,
                    "auto-decline call failed"
                );
            }
        }
        expired.len()
    }

    /// Rebuild the queue on startup: local snapshot first, then reconcile
    /// against the server's pending list.
    pub async fn hydrate(&self) {
        if let Some(store) = &self.store {
            let loaded = {
                let store = store.lock().expect("store lock");
                store.load_pending_invitations()
            };
            match loaded {
                Ok(invitations) => {
                    let mut inner = self.inner.lock().expect("queue lock");
                    for invitation in invitations {
                        if !inner
                            .pending
                            .iter()
                            .any(|i| i.invitation_id == invitation.invitation_id)
                        {
                            insert_by_arrival(&mut inner.pending, invitation);
                        }
                    }
                    info!(count = inner.pending.len(), "invitation queue restored from store");
                }
                Err(e) => warn!(error = %e, "failed to load invitation snapshot"),
            }
        }

        self.refresh_from_server().await;
    }

    /// Reconcile against the authoritative server list: local entries the
    /// server no longer confirms are dropped, new server entries are
    /// enqueued.  Also called after a reconnect to pick up invitations
    /// missed while offline.
    pub async fn refresh_from_server(&self) {
        let server_pending = match self.api.fetch_pending_invitations().await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "failed to fetch pending invitations, keeping local queue");
                return;
            }
        };

        let server_ids: HashSet<InvitationId> = server_pending
            .iter()
            .map(|i| i.invitation_id)
            .collect();

        let dropped: Vec<InvitationId> = {
            let mut inner = self.inner.lock().expect("queue lock");
            let (confirmed, dropped): (Vec<_>, Vec<_>) = inner
                .pending
                .drain(..)
                .partition(|i| server_ids.contains(&i.invitation_id));
            inner.pending = confirmed;
            dropped.into_iter().map(|i| i.invitation_id).collect()
        };
        for id in &dropped {
            debug!(invitation = %id, "dropping invitation not confirmed by server");
            self.persist_delete(*id);
        }

        for invitation in server_pending {
            self.enqueue(invitation);
        }
    }

    /// Purge terminal and past-expiry entries whose own timer never fired,
    /// both in memory and at rest.
    pub async fn sweep(&self, now: DateTime<Utc>) {
        let expired = self.expire_due(now).await;
        if expired > 0 {
            debug!(count = expired, "sweep expired invitations");
        }
        if let Some(store) = &self.store {
            let purged = {
                let store = store.lock().expect("store lock");
                store.purge_expired_invitations(now)
            };
            match purged {
                Ok(0) => {}
                Ok(n) => debug!(count = n, "sweep purged persisted rows"),
                Err(e) => warn!(error = %e, "sweep failed to purge store"),
            }
        }
    }

    /// Spawn the expiry tick (1 s) and periodic sweep (30 s).  The caller
    /// owns the handle and must abort it on teardown; it is the single
    /// live timer for this queue.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(INVITATION_TICK_MS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let ticks_per_sweep = (QUEUE_SWEEP_SECS * 1000 / INVITATION_TICK_MS).max(1);
            let mut tick = 0u64;
            loop {
                interval.tick().await;
                tick += 1;
                if tick % ticks_per_sweep == 0 {
                    queue.sweep(Utc::now()).await;
                } else {
                    queue.expire_due(Utc::now()).await;
                }
            }
        })
    }

    /// Remove from pending and mark terminal.  Returns whether the id was
    /// actually queued.
    fn remove_resolved(&self, id: InvitationId) -> bool {
        let removed = {
            let mut inner = self.inner.lock().expect("queue lock");
            let before = inner.pending.len();
            inner.pending.retain(|i| i.invitation_id != id);
            let removed = inner.pending.len() != before;
            if removed {
                inner.resolved.insert(id);
            }
            removed
        };
        if removed {
            self.persist_delete(id);
        }
        removed
    }

    fn persist_insert(&self, invitation: &Invitation) {
        if let Some(store) = &self.store {
            let store = store.lock().expect("store lock");
            if let Err(e) = store.upsert_invitation(invitation) {
                warn!(invitation = %invitation.invitation_id, error = %e, "failed to persist invitation");
            }
        }
    }

    fn persist_delete(&self, id: InvitationId) {
        if let Some(store) = &self.store {
            let store = store.lock().expect("store lock");
            if let Err(e) = store.delete_invitation(id) {
                warn!(invitation = %id, error = %e, "failed to delete persisted invitation");
            }
        }
    }
}

/// Keep the pending list ordered by `received_at`.  A plain append is not
/// enough: a server backfill after a reconnect can deliver an invitation
/// that was received *before* ones already queued from live events, and it
/// must still become "current".
fn insert_by_arrival(pending: &mut Vec<Invitation>, invitation: Invitation) {
    let pos = pending
        .iter()
        .position(|i| i.received_at > invitation.received_at)
        .unwrap_or(pending.len());
    pending.insert(pos, invitation);
}
