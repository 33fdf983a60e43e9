//! Client-side lobby state.
//!
//! Chat arrives from two directions: live messages append at the tail,
//! history pages fetched on scroll-back prepend at the head.  Both paths
//! merge by message id, so replaying a reconnect backfill or re-fetching a
//! page never duplicates a message.  Snapshot versions are monotonic: a
//! stale poll result is dropped rather than rewinding members.

use std::collections::HashSet;
use std::sync::Mutex;

use tracing::debug;

use fitlink_shared::types::{LobbyChatMessage, LobbyState, SessionId, UserId};

struct LobbyInner {
    session_id: Option<SessionId>,
    version: u64,
    members: Vec<UserId>,
    messages: Vec<LobbyChatMessage>,
    seen: HashSet<u64>,
}

pub struct LobbyStateStore {
    inner: Mutex<LobbyInner>,
}

impl Default for LobbyStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LobbyStateStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LobbyInner {
                session_id: None,
                version: 0,
                members: Vec::new(),
                messages: Vec::new(),
                seen: HashSet::new(),
            }),
        }
    }

    /// Reset for a new session; all state from the previous lobby is gone.
    pub fn reset(&self, session_id: SessionId) {
        let mut inner = self.inner.lock().expect("lobby lock");
        *inner = LobbyInner {
            session_id: Some(session_id),
            version: 0,
            members: Vec::new(),
            messages: Vec::new(),
            seen: HashSet::new(),
        };
    }

    /// Merge a batch of chat messages.
    ///
    /// Messages already present (by id) are dropped.  Of the rest, those
    /// older than the current head are prepended as a block and the others
    /// appended, each preserving the batch's own order.  Returns how many
    /// messages were actually added.
    pub fn add_chat_messages(&self, batch: Vec<LobbyChatMessage>) -> usize {
        let mut inner = self.inner.lock().expect("lobby lock");
        merge_chat(&mut inner, batch)
    }

    /// Apply a full snapshot (initial fetch or poll result).  Versions are
    /// monotonic: anything not strictly newer is ignored.  Returns whether
    /// the snapshot was applied.
    ///
    /// Check and apply happen under one lock acquisition: the poll loop and
    /// a reconnect refetch can race, and neither may commit an older
    /// snapshot over a newer one.
    pub fn apply_snapshot(&self, state: LobbyState) -> bool {
        let mut inner = self.inner.lock().expect("lobby lock");
        if state.version <= inner.version {
            debug!(
                version = state.version,
                current = inner.version,
                "ignoring stale lobby snapshot"
            );
            return false;
        }
        merge_chat(&mut inner, state.chat);
        inner.version = state.version;
        inner.members = state.members;
        true
    }

    pub fn set_members(&self, members: Vec<UserId>) {
        self.inner.lock().expect("lobby lock").members = members;
    }

    pub fn current_session(&self) -> Option<SessionId> {
        self.inner.lock().expect("lobby lock").session_id
    }

    pub fn version(&self) -> u64 {
        self.inner.lock().expect("lobby lock").version
    }

    pub fn members(&self) -> Vec<UserId> {
        self.inner.lock().expect("lobby lock").members.clone()
    }

    pub fn chat_messages(&self) -> Vec<LobbyChatMessage> {
        self.inner.lock().expect("lobby lock").messages.clone()
    }
}

fn merge_chat(inner: &mut LobbyInner, batch: Vec<LobbyChatMessage>) -> usize {
    let fresh: Vec<LobbyChatMessage> = batch
        .into_iter()
        .filter(|m| inner.seen.insert(m.message_id))
        .collect();
    if fresh.is_empty() {
        return 0;
    }
    let added = fresh.len();

    let head_ts = inner.messages.first().map(|m| m.timestamp_seconds);
    let (older, newer): (Vec<_>, Vec<_>) = match head_ts {
        Some(head_ts) => fresh
            .into_iter()
            .partition(|m| m.timestamp_seconds < head_ts),
        None => (Vec::new(), fresh),
    };

    if !older.is_empty() {
        debug!(count = older.len(), "prepending older chat page");
        let mut merged = older;
        merged.append(&mut inner.messages);
        inner.messages = merged;
    }
    inner.messages.extend(newer);
    added
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: u64, ts: i64) -> LobbyChatMessage {
        LobbyChatMessage {
            message_id: id,
            user_id: UserId(id % 5),
            user_name: format!("user{}", id % 5),
            message: format!("message {id}"),
            timestamp_seconds: ts,
            is_system_message: false,
        }
    }

    #[test]
    fn test_older_page_prepends_without_reordering() {
        let store = LobbyStateStore::new();
        // Live page: ids 21..=40 at timestamps 2100..
        store.add_chat_messages((21..=40).map(|i| message(i, 2000 + i as i64)).collect());
        // Scroll-back page: ids 1..=20, all older than the head.
        store.add_chat_messages((1..=20).map(|i| message(i, 1000 + i as i64)).collect());

        let chat = store.chat_messages();
        assert_eq!(chat.len(), 40);
        let ids: Vec<u64> = chat.iter().map(|m| m.message_id).collect();
        let expected: Vec<u64> = (1..=20).chain(21..=40).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_duplicate_ids_dropped_across_batches() {
        let store = LobbyStateStore::new();
        assert_eq!(
            store.add_chat_messages(vec![message(1, 10), message(2, 11)]),
            2
        );
        // Reconnect backfill overlaps the live tail.
        assert_eq!(
            store.add_chat_messages(vec![message(2, 11), message(3, 12)]),
            1
        );

        let ids: Vec<u64> = store.chat_messages().iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_duplicates_within_one_batch_collapse() {
        let store = LobbyStateStore::new();
        assert_eq!(
            store.add_chat_messages(vec![message(7, 10), message(7, 10), message(8, 11)]),
            2
        );
    }

    #[test]
    fn test_stale_snapshot_ignored() {
        let store = LobbyStateStore::new();
        let session = SessionId::new();
        store.reset(session);

        assert!(store.apply_snapshot(LobbyState {
            session_id: session,
            version: 5,
            members: vec![UserId(1), UserId(2)],
            chat: vec![message(1, 10)],
        }));
        assert!(!store.apply_snapshot(LobbyState {
            session_id: session,
            version: 5,
            members: vec![UserId(1)],
            chat: vec![message(2, 11)],
        }));

        assert_eq!(store.version(), 5);
        assert_eq!(store.members(), vec![UserId(1), UserId(2)]);
        assert_eq!(store.chat_messages().len(), 1);
    }

    #[test]
    fn test_racing_snapshots_never_rewind_version() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(LobbyStateStore::new());
        let session = SessionId::new();
        store.reset(session);

        // Poll loop and reconnect refetch applying interleaved versions;
        // members are tagged with the version they belong to.
        let mut handles = Vec::new();
        for offset in 0..2u64 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for version in ((1 + offset)..=200).step_by(2) {
                    store.apply_snapshot(LobbyState {
                        session_id: session,
                        version,
                        members: vec![UserId(version)],
                        chat: Vec::new(),
                    });
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.version(), 200);
        assert_eq!(store.members(), vec![UserId(store.version())]);
    }

    #[test]
    fn test_reset_clears_previous_lobby() {
        let store = LobbyStateStore::new();
        store.add_chat_messages(vec![message(1, 10)]);
        store.set_members(vec![UserId(3)]);

        let session = SessionId::new();
        store.reset(session);

        assert_eq!(store.current_session(), Some(session));
        assert!(store.chat_messages().is_empty());
        assert!(store.members().is_empty());
        assert_eq!(store.version(), 0);
        // Ids from the old lobby are fresh again.
        assert_eq!(store.add_chat_messages(vec![message(1, 10)]), 1);
    }
}
