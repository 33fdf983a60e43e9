//! Top-level wiring of the coordination layer.
//!
//! The coordinator owns the managed connection, the channel registry, both
//! presence trackers (global online set and per-lobby roster), the
//! invitation queue, the lobby store and the polling fallback, and keeps
//! them consistent across connects, reconnects, and outages:
//!
//! * on start: hydrate the queue, connect, subscribe the base channel set
//!   (per-user channel, global presence, one channel per group);
//! * on reconnect: re-issue every subscribe and refetch pending
//!   invitations, since events delivered while offline are gone;
//! * on disconnect with an active lobby: fall back to HTTP polling until
//!   the socket is back.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fitlink_realtime::auth::{ChannelAuthorizer, CredentialProvider};
use fitlink_realtime::channels::{ChannelRegistry, EventHandler};
use fitlink_realtime::connection::{
    ConnectionConfig, ConnectionManager, ListenerGuard, StateListener,
};
use fitlink_realtime::presence::PresenceTracker;
use fitlink_shared::events::RealtimeEvent;
use fitlink_shared::types::{ChannelKind, ConnectionState, GroupId, InvitationId, SessionId, UserId};
use fitlink_store::Database;

use crate::api::{FitnessApi, SessionHandle};
use crate::lobby::LobbyStateStore;
use crate::polling::{ApiLobbyFetcher, ErrorHandler, PollConfig, PollingFallback, UpdateHandler};
use crate::queue::{InvitationQueue, QueueError};

/// Channel names as they appear before the kind prefix.
fn user_channel(user_id: UserId) -> String {
    format!("user.{user_id}")
}

fn group_channel(group_id: GroupId) -> String {
    format!("group.{group_id}")
}

fn lobby_channel(session_id: SessionId) -> String {
    format!("lobby.{session_id}")
}

const ONLINE_CHANNEL: &str = "online";

/// Everything the subscribe handlers close over.  Split out from the
/// coordinator so the reconnect callback can re-run subscription without
/// borrowing the coordinator itself.
struct ChannelWiring {
    registry: Arc<ChannelRegistry>,
    presence: Arc<PresenceTracker>,
    lobby_presence: Arc<PresenceTracker>,
    queue: Arc<InvitationQueue>,
    lobby: Arc<LobbyStateStore>,
    api: Arc<dyn FitnessApi>,
}

impl ChannelWiring {
    /// Subscribe the channels every signed-in user listens on.
    async fn subscribe_base(&self, user_id: UserId) {
        let user_handler = user_events_handler(Arc::clone(&self.queue));
        if let Err(e) = self
            .registry
            .subscribe(&user_channel(user_id), ChannelKind::Private, user_handler)
            .await
        {
            warn!(error = %e, "failed to subscribe user channel");
        }

        if let Err(e) = self
            .registry
            .subscribe(ONLINE_CHANNEL, ChannelKind::Presence, self.presence.handler())
            .await
        {
            warn!(error = %e, "failed to subscribe presence channel");
        }

        match self.api.fetch_user_groups().await {
            Ok(groups) => {
                for group_id in groups {
                    let handler = user_events_handler(Arc::clone(&self.queue));
                    if let Err(e) = self
                        .registry
                        .subscribe(&group_channel(group_id), ChannelKind::Private, handler)
                        .await
                    {
                        warn!(group = %group_id, error = %e, "failed to subscribe group channel");
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to fetch groups, skipping group channels"),
        }
    }

    async fn subscribe_lobby(&self, session_id: SessionId) {
        let handler = lobby_events_handler(Arc::clone(&self.lobby), Arc::clone(&self.lobby_presence));
        if let Err(e) = self
            .registry
            .subscribe(&lobby_channel(session_id), ChannelKind::Presence, handler)
            .await
        {
            warn!(session = %session_id, error = %e, "failed to subscribe lobby channel");
        }
    }

    /// Rebuild the full subscription set and refetch what the socket
    /// missed.  Runs after every successful reconnect.
    async fn resync(&self, user_id: UserId, active_lobby: Option<SessionId>) {
        info!("resyncing after reconnect");
        self.subscribe_base(user_id).await;
        if let Some(session_id) = active_lobby {
            self.subscribe_lobby(session_id).await;
            match self.api.fetch_lobby_state(session_id).await {
                Ok(state) => {
                    self.lobby.apply_snapshot(state);
                }
                Err(e) => warn!(session = %session_id, error = %e, "lobby refetch failed"),
            }
        }
        self.queue.refresh_from_server().await;
    }
}

/// Handler for the per-user and per-group channels: invitations feed the
/// queue, notification counters are informational.
fn user_events_handler(queue: Arc<InvitationQueue>) -> EventHandler {
    Arc::new(move |event| match event {
        RealtimeEvent::WorkoutInvitation(invitation) => {
            queue.enqueue(invitation);
        }
        RealtimeEvent::UnreadCountUpdated { count } => {
            debug!(count, "unread count updated");
        }
        RealtimeEvent::NotificationCreated { .. } => {
            debug!("notification created");
        }
        RealtimeEvent::GroupMembersUpdated { group_id, ref members } => {
            debug!(group = %group_id, count = members.len(), "group members updated");
        }
        RealtimeEvent::GroupStatsUpdated { group_id, .. } => {
            debug!(group = %group_id, "group stats updated");
        }
        _ => {}
    })
}

/// Handler for the per-lobby presence channel: chat goes to the lobby
/// store, membership events go to the lobby roster.
fn lobby_events_handler(
    lobby: Arc<LobbyStateStore>,
    lobby_presence: Arc<PresenceTracker>,
) -> EventHandler {
    Arc::new(move |event| match event {
        RealtimeEvent::LobbyChatMessage(message) => {
            lobby.add_chat_messages(vec![message]);
        }
        RealtimeEvent::PresenceInitial { .. }
        | RealtimeEvent::PresenceJoined { .. }
        | RealtimeEvent::PresenceLeft { .. } => {
            lobby_presence.apply_event(&event);
            lobby.set_members(lobby_presence.online_users());
        }
        _ => {}
    })
}

/// Connection-state listener that toggles the HTTP fallback: polling starts
/// the moment the socket is unavailable with a lobby active (lost and
/// backing off, parked after exhausting retries, or explicitly down), and
/// stops the moment the socket is live again.
fn fallback_listener(
    polling: Arc<PollingFallback>,
    active_lobby: Arc<Mutex<Option<SessionId>>>,
    poll_config: PollConfig,
    on_update: UpdateHandler,
    on_error: ErrorHandler,
) -> StateListener {
    Arc::new(move |state| {
        let session = *active_lobby.lock().expect("lobby lock");
        let Some(session_id) = session else {
            return;
        };
        match state {
            ConnectionState::Connected => {
                polling.stop_polling(session_id);
            }
            ConnectionState::Disconnected
            | ConnectionState::Reconnecting
            | ConnectionState::MaxRetriesReached => {
                polling.start_polling(
                    session_id,
                    poll_config.clone(),
                    Arc::clone(&on_update),
                    Arc::clone(&on_error),
                );
            }
            ConnectionState::Connecting => {}
        }
    })
}

pub struct RealtimeCoordinator {
    connection: ConnectionManager,
    wiring: Arc<ChannelWiring>,
    polling: Arc<PollingFallback>,
    poll_config: PollConfig,
    user_id: Mutex<Option<UserId>>,
    active_lobby: Arc<Mutex<Option<SessionId>>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    state_guard: Mutex<Option<ListenerGuard>>,
}

impl RealtimeCoordinator {
    pub fn new(
        config: ConnectionConfig,
        credentials: Arc<dyn CredentialProvider>,
        authorizer: Arc<dyn ChannelAuthorizer>,
        api: Arc<dyn FitnessApi>,
        store: Option<Arc<Mutex<Database>>>,
        poll_config: PollConfig,
    ) -> Self {
        let connection = ConnectionManager::new(config, credentials, authorizer);
        let wiring = Arc::new(ChannelWiring {
            registry: connection.registry(),
            presence: Arc::new(PresenceTracker::new()),
            lobby_presence: Arc::new(PresenceTracker::new()),
            queue: Arc::new(InvitationQueue::new(Arc::clone(&api), store)),
            lobby: Arc::new(LobbyStateStore::new()),
            api: Arc::clone(&api),
        });
        let polling = Arc::new(PollingFallback::new(Arc::new(ApiLobbyFetcher(api))));

        Self {
            connection,
            wiring,
            polling,
            poll_config,
            user_id: Mutex::new(None),
            active_lobby: Arc::new(Mutex::new(None)),
            maintenance: Mutex::new(None),
            state_guard: Mutex::new(None),
        }
    }

    /// Bring the whole layer up for `user_id`.
    pub async fn start(&self, user_id: UserId) {
        *self.user_id.lock().expect("user lock") = Some(user_id);

        self.wiring.queue.hydrate().await;
        let maintenance = self.wiring.queue.spawn_maintenance();
        if let Some(old) = self
            .maintenance
            .lock()
            .expect("maintenance lock")
            .replace(maintenance)
        {
            old.abort();
        }

        // Re-subscribe and refetch after every successful reconnect.
        let wiring = Arc::clone(&self.wiring);
        let active_lobby = Arc::clone(&self.active_lobby);
        self.connection.on_reconnect(Arc::new(move || {
            let wiring = Arc::clone(&wiring);
            let active = *active_lobby.lock().expect("lobby lock");
            tokio::spawn(async move {
                wiring.resync(user_id, active).await;
            });
        }));

        // Fall back to HTTP polling whenever the socket drops mid-lobby.
        let lobby = Arc::clone(&self.wiring.lobby);
        let on_update: UpdateHandler = Arc::new(move |state| {
            lobby.apply_snapshot(state);
        });
        let on_error: ErrorHandler = Arc::new(|e| {
            warn!(error = %e, "lobby polling gave up");
        });
        let guard = self.connection.on_state_change(fallback_listener(
            Arc::clone(&self.polling),
            Arc::clone(&self.active_lobby),
            self.poll_config.clone(),
            on_update,
            on_error,
        ));
        *self.state_guard.lock().expect("guard lock") = Some(guard);

        self.connection.connect(user_id).await;
        self.wiring.subscribe_base(user_id).await;
    }

    /// Enter a lobby: reset local state, take the initial snapshot over
    /// REST, then subscribe the lobby channel for live updates.
    pub async fn enter_lobby(&self, session_id: SessionId) {
        *self.active_lobby.lock().expect("lobby lock") = Some(session_id);
        self.wiring.lobby.reset(session_id);
        self.wiring
            .lobby_presence
            .apply_event(&RealtimeEvent::PresenceInitial { members: Vec::new() });

        match self.wiring.api.fetch_lobby_state(session_id).await {
            Ok(state) => {
                self.wiring.lobby.apply_snapshot(state);
            }
            Err(e) => warn!(session = %session_id, error = %e, "initial lobby fetch failed"),
        }

        self.wiring.subscribe_lobby(session_id).await;

        if self.connection.state() != ConnectionState::Connected {
            let lobby = Arc::clone(&self.wiring.lobby);
            self.polling.start_polling(
                session_id,
                self.poll_config.clone(),
                Arc::new(move |state| {
                    lobby.apply_snapshot(state);
                }),
                Arc::new(|e| warn!(error = %e, "lobby polling gave up")),
            );
        }
    }

    pub async fn leave_lobby(&self) {
        let session = self.active_lobby.lock().expect("lobby lock").take();
        if let Some(session_id) = session {
            self.polling.stop_polling(session_id);
            self.wiring
                .registry
                .unsubscribe(&lobby_channel(session_id), ChannelKind::Presence)
                .await;
            info!(session = %session_id, "left lobby");
        }
    }

    pub async fn accept_invitation(&self, id: InvitationId) -> Result<SessionHandle, QueueError> {
        self.wiring.queue.accept(id).await
    }

    pub async fn decline_invitation(&self, id: InvitationId) -> Result<(), QueueError> {
        self.wiring.queue.decline(id).await
    }

    pub async fn manual_reconnect(&self) -> bool {
        self.connection.manual_reconnect().await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn queue(&self) -> Arc<InvitationQueue> {
        Arc::clone(&self.wiring.queue)
    }

    pub fn lobby(&self) -> Arc<LobbyStateStore> {
        Arc::clone(&self.wiring.lobby)
    }

    pub fn online_presence(&self) -> Arc<PresenceTracker> {
        Arc::clone(&self.wiring.presence)
    }

    pub fn lobby_presence(&self) -> Arc<PresenceTracker> {
        Arc::clone(&self.wiring.lobby_presence)
    }

    /// Tear everything down.  Safe to call more than once.
    pub async fn stop(&self) {
        self.polling.stop_all();
        if let Some(task) = self.maintenance.lock().expect("maintenance lock").take() {
            task.abort();
        }
        self.state_guard.lock().expect("guard lock").take();
        self.connection.disconnect().await;
        self.connection.shutdown().await;
        info!("coordination layer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use fitlink_shared::error::ApiError;
    use fitlink_shared::types::{LobbyChatMessage, LobbyState};

    use crate::polling::LobbyFetcher;

    struct BlockingFetcher {
        script: Mutex<VecDeque<Result<LobbyState, ApiError>>>,
        calls: AtomicU32,
    }

    impl BlockingFetcher {
        fn new(script: Vec<Result<LobbyState, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl LobbyFetcher for BlockingFetcher {
        async fn fetch(&self, _session_id: SessionId) -> Result<LobbyState, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }
    }

    fn noop_handlers() -> (UpdateHandler, ErrorHandler) {
        (Arc::new(|_| {}), Arc::new(|_| {}))
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_starts_on_disconnect_and_stops_on_connect() {
        let session = SessionId::new();
        let fetcher = BlockingFetcher::new(vec![]);
        let polling = Arc::new(PollingFallback::new(fetcher.clone()));
        let active_lobby = Arc::new(Mutex::new(Some(session)));
        let (on_update, on_error) = noop_handlers();

        let listener = fallback_listener(
            Arc::clone(&polling),
            active_lobby,
            PollConfig::default(),
            on_update,
            on_error,
        );

        listener(ConnectionState::Disconnected);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(polling.is_active(session));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        listener(ConnectionState::Connected);
        assert!(!polling.is_active(session));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_engages_during_reconnect_backoff() {
        let session = SessionId::new();
        let fetcher = BlockingFetcher::new(vec![]);
        let polling = Arc::new(PollingFallback::new(fetcher.clone()));
        let active_lobby = Arc::new(Mutex::new(Some(session)));
        let (on_update, on_error) = noop_handlers();

        let listener = fallback_listener(
            Arc::clone(&polling),
            active_lobby,
            PollConfig::default(),
            on_update,
            on_error,
        );

        // A lost socket goes straight to Reconnecting, never through
        // Disconnected; polling must not wait out the backoff budget.
        listener(ConnectionState::Reconnecting);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(polling.is_active(session));

        listener(ConnectionState::Connected);
        assert!(!polling.is_active(session));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_ignored_without_active_lobby() {
        let session = SessionId::new();
        let fetcher = BlockingFetcher::new(vec![]);
        let polling = Arc::new(PollingFallback::new(fetcher.clone()));
        let active_lobby = Arc::new(Mutex::new(None));
        let (on_update, on_error) = noop_handlers();

        let listener = fallback_listener(
            Arc::clone(&polling),
            active_lobby,
            PollConfig::default(),
            on_update,
            on_error,
        );

        listener(ConnectionState::Disconnected);
        listener(ConnectionState::MaxRetriesReached);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!polling.is_active(session));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_also_starts_when_budget_exhausted() {
        let session = SessionId::new();
        let fetcher = BlockingFetcher::new(vec![]);
        let polling = Arc::new(PollingFallback::new(fetcher.clone()));
        let active_lobby = Arc::new(Mutex::new(Some(session)));
        let (on_update, on_error) = noop_handlers();

        let listener = fallback_listener(
            Arc::clone(&polling),
            active_lobby,
            PollConfig::default(),
            on_update,
            on_error,
        );

        listener(ConnectionState::MaxRetriesReached);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(polling.is_active(session));
    }

    #[test]
    fn test_lobby_handler_routes_chat_and_membership() {
        let lobby = Arc::new(LobbyStateStore::new());
        let roster = Arc::new(PresenceTracker::new());
        let handler = lobby_events_handler(Arc::clone(&lobby), Arc::clone(&roster));

        handler(RealtimeEvent::PresenceInitial {
            members: vec![UserId(1), UserId(2)],
        });
        handler(RealtimeEvent::LobbyChatMessage(LobbyChatMessage {
            message_id: 10,
            user_id: UserId(1),
            user_name: "alex".into(),
            message: "ready?".into(),
            timestamp_seconds: 100,
            is_system_message: false,
        }));
        handler(RealtimeEvent::PresenceLeft { user: UserId(2) });

        assert_eq!(lobby.members(), vec![UserId(1)]);
        assert_eq!(lobby.chat_messages().len(), 1);
        assert_eq!(roster.online_users(), vec![UserId(1)]);
    }

    #[tokio::test]
    async fn test_user_handler_enqueues_invitations_only() {
        use crate::queue::InvitationQueue;

        struct NullApi;
        #[async_trait]
        impl FitnessApi for NullApi {
            async fn fetch_pending_invitations(
                &self,
            ) -> Result<Vec<fitlink_shared::invitation::Invitation>, ApiError> {
                Ok(Vec::new())
            }
            async fn accept_invitation(
                &self,
                _id: fitlink_shared::types::InvitationId,
            ) -> Result<SessionHandle, ApiError> {
                Err(ApiError::Network("unused".into()))
            }
            async fn decline_invitation(
                &self,
                _id: fitlink_shared::types::InvitationId,
            ) -> Result<(), ApiError> {
                Ok(())
            }
            async fn fetch_lobby_state(
                &self,
                _session_id: SessionId,
            ) -> Result<LobbyState, ApiError> {
                Err(ApiError::Network("unused".into()))
            }
            async fn fetch_user_groups(
                &self,
            ) -> Result<Vec<fitlink_shared::types::GroupId>, ApiError> {
                Ok(Vec::new())
            }
        }

        let queue = Arc::new(InvitationQueue::new(Arc::new(NullApi), None));
        let handler = user_events_handler(Arc::clone(&queue));

        handler(RealtimeEvent::UnreadCountUpdated { count: 2 });
        assert_eq!(queue.pending_count(), 0);

        let now = chrono::Utc::now();
        handler(RealtimeEvent::WorkoutInvitation(
            fitlink_shared::invitation::Invitation {
                invitation_id: fitlink_shared::types::InvitationId::new(),
                session_id: SessionId::new(),
                group_id: fitlink_shared::types::GroupId(1),
                initiator_id: UserId(2),
                initiator_name: "sam".into(),
                workout: fitlink_shared::invitation::WorkoutPayload {
                    title: "Intervals".into(),
                    kind: "run".into(),
                    duration_minutes: 30,
                },
                expires_at: now + chrono::Duration::seconds(60),
                received_at: now,
            },
        ));
        assert_eq!(queue.pending_count(), 1);
    }
}
