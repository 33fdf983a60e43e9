//! Presence-set tracking.
//!
//! Maintains the set of currently-online user ids from presence-channel
//! membership events.  The set is owned exclusively by the tracker and is
//! mutated by exactly three event kinds: initial-members (full replace),
//! member-added (union), member-removed (difference).  Consumers only ever
//! read snapshots.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::debug;

use fitlink_shared::events::RealtimeEvent;
use fitlink_shared::types::UserId;

use crate::channels::EventHandler;

/// Optional notifications fired on membership changes.
#[derive(Default, Clone)]
pub struct PresenceCallbacks {
    pub on_joined: Option<Arc<dyn Fn(UserId) + Send + Sync>>,
    pub on_left: Option<Arc<dyn Fn(UserId) + Send + Sync>>,
}

/// Tracks who is online on one presence channel (global or per-lobby; the
/// event semantics are identical).
pub struct PresenceTracker {
    members: Mutex<HashSet<UserId>>,
    callbacks: Mutex<PresenceCallbacks>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            members: Mutex::new(HashSet::new()),
            callbacks: Mutex::new(PresenceCallbacks::default()),
        }
    }

    pub fn set_callbacks(&self, callbacks: PresenceCallbacks) {
        *self.callbacks.lock().expect("presence lock") = callbacks;
    }

    /// Apply one membership event.  Non-membership events are ignored so the
    /// tracker can be wired directly as a channel handler.
    ///
    /// The initial-members payload always replaces the entire set: after a
    /// reconnect the membership may have changed arbitrarily while we were
    /// away, so no continuity is assumed.
    pub fn apply_event(&self, event: &RealtimeEvent) {
        match event {
            RealtimeEvent::PresenceInitial { members } => {
                let mut set = self.members.lock().expect("presence lock");
                set.clear();
                set.extend(members.iter().copied());
                debug!(count = set.len(), "presence set replaced");
            }
            RealtimeEvent::PresenceJoined { user } => {
                let inserted = self.members.lock().expect("presence lock").insert(*user);
                if inserted {
                    debug!(user = %user, "presence member joined");
                    let callbacks = self.callbacks.lock().expect("presence lock").clone();
                    if let Some(cb) = callbacks.on_joined {
                        cb(*user);
                    }
                }
            }
            RealtimeEvent::PresenceLeft { user } => {
                let removed = self.members.lock().expect("presence lock").remove(user);
                if removed {
                    debug!(user = %user, "presence member left");
                    let callbacks = self.callbacks.lock().expect("presence lock").clone();
                    if let Some(cb) = callbacks.on_left {
                        cb(*user);
                    }
                }
            }
            _ => {}
        }
    }

    /// Channel handler that feeds membership events into this tracker.
    pub fn handler(self: &Arc<Self>) -> EventHandler {
        let tracker = Arc::clone(self);
        Arc::new(move |event| tracker.apply_event(&event))
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.members.lock().expect("presence lock").contains(&user)
    }

    pub fn count(&self) -> usize {
        self.members.lock().expect("presence lock").len()
    }

    /// Snapshot of the online set, sorted for stable iteration.
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .members
            .lock()
            .expect("presence lock")
            .iter()
            .copied()
            .collect();
        users.sort();
        users
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_initial_members_replaces_set() {
        let tracker = PresenceTracker::new();
        tracker.apply_event(&RealtimeEvent::PresenceInitial {
            members: vec![UserId(1), UserId(2)],
        });
        assert_eq!(tracker.online_users(), vec![UserId(1), UserId(2)]);

        // A fresh subscription after reconnect delivers a different roster;
        // the old one must not survive.
        tracker.apply_event(&RealtimeEvent::PresenceInitial {
            members: vec![UserId(3)],
        });
        assert_eq!(tracker.online_users(), vec![UserId(3)]);
        assert!(!tracker.is_online(UserId(1)));
    }

    #[test]
    fn test_join_and_leave() {
        let tracker = PresenceTracker::new();
        tracker.apply_event(&RealtimeEvent::PresenceInitial {
            members: vec![UserId(1)],
        });

        tracker.apply_event(&RealtimeEvent::PresenceJoined { user: UserId(2) });
        assert!(tracker.is_online(UserId(2)));
        assert_eq!(tracker.count(), 2);

        tracker.apply_event(&RealtimeEvent::PresenceLeft { user: UserId(1) });
        assert!(!tracker.is_online(UserId(1)));
        assert_eq!(tracker.online_users(), vec![UserId(2)]);
    }

    #[test]
    fn test_duplicate_join_is_idempotent() {
        let tracker = PresenceTracker::new();
        let joins = Arc::new(AtomicU32::new(0));
        let joins_clone = joins.clone();
        tracker.set_callbacks(PresenceCallbacks {
            on_joined: Some(Arc::new(move |_| {
                joins_clone.fetch_add(1, Ordering::SeqCst);
            })),
            on_left: None,
        });

        tracker.apply_event(&RealtimeEvent::PresenceJoined { user: UserId(5) });
        tracker.apply_event(&RealtimeEvent::PresenceJoined { user: UserId(5) });

        assert_eq!(tracker.count(), 1);
        assert_eq!(joins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_non_membership_events_ignored() {
        let tracker = PresenceTracker::new();
        tracker.apply_event(&RealtimeEvent::UnreadCountUpdated { count: 3 });
        assert_eq!(tracker.count(), 0);
    }
}
