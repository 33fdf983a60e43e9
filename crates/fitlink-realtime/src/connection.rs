//! Managed pub/sub connection.
//!
//! [`ConnectionManager`] owns exactly one live WebSocket to the broadcaster.
//! The event loop runs in a dedicated tokio task; the public handle talks to
//! it over a typed command channel.  Reconnection follows an exponential
//! backoff (`min(2^attempt, 60)` seconds, 10 scheduled attempts) after which
//! the connection parks in `MaxRetriesReached` until the user triggers a
//! manual reconnect.
//!
//! State transitions are broadcast to registered listeners synchronously, in
//! registration order.  A reconnect callback fires once per successful
//! reconnect (never on the first connection) so the owner can re-subscribe
//! channels and refetch missed invitations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use fitlink_shared::constants::MAX_RECONNECT_ATTEMPTS;
use fitlink_shared::error::TransportError;
use fitlink_shared::events::RealtimeEvent;
use fitlink_shared::protocol::{ClientFrame, ServerFrame};
use fitlink_shared::types::{ChannelKind, ConnectionState, UserId};

use crate::auth::{ChannelAuthorizer, CredentialProvider};
use crate::channels::ChannelRegistry;
use crate::policy::ReconnectPolicy;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub type StateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;
pub type ReconnectListener = Arc<dyn Fn() + Send + Sync>;

/// Configuration for the managed connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket endpoint of the broadcaster, e.g.
    /// `wss://broadcast.example.com/app/fitlink-key`.
    pub ws_url: String,
    /// Scheduled reconnect attempts before `MaxRetriesReached`.
    pub max_reconnect_attempts: u32,
}

impl ConnectionConfig {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// Commands sent *into* the connection task.
#[derive(Debug)]
pub(crate) enum ConnCmd {
    Connect {
        user_id: UserId,
    },
    Disconnect,
    ManualReconnect {
        reply: oneshot::Sender<bool>,
    },
    Subscribe {
        channel: String,
        kind: ChannelKind,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Unsubscribe {
        channel: String,
    },
    /// Fired by the backoff timer.  Carries the generation it was scheduled
    /// under; a stale generation means a disconnect or manual reconnect has
    /// superseded it.
    AttemptReconnect {
        generation: u64,
    },
    Shutdown,
}

/// Observer state shared between the handle and the task.
pub(crate) struct ConnectionShared {
    state: Mutex<ConnectionState>,
    listeners: Mutex<Vec<(u64, StateListener)>>,
    reconnect_listeners: Mutex<Vec<ReconnectListener>>,
    next_listener_id: AtomicU64,
}

impl ConnectionShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            listeners: Mutex::new(Vec::new()),
            reconnect_listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state lock")
    }

    /// Transition and broadcast.  Listeners run synchronously in
    /// registration order; the lock is released first so a listener may
    /// query the state without deadlocking.
    fn set_state(&self, next: ConnectionState) {
        {
            let mut state = self.state.lock().expect("state lock");
            if *state == next {
                return;
            }
            *state = next;
        }
        let listeners: Vec<StateListener> = self
            .listeners
            .lock()
            .expect("listener lock")
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in listeners {
            cb(next);
        }
    }

    fn notify_reconnect(&self) {
        let listeners: Vec<ReconnectListener> = self
            .reconnect_listeners
            .lock()
            .expect("listener lock")
            .to_vec();
        for cb in listeners {
            cb();
        }
    }

    fn add_listener(&self, cb: StateListener) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().expect("listener lock").push((id, cb));
        id
    }

    fn remove_listener(&self, id: u64) {
        self.listeners
            .lock()
            .expect("listener lock")
            .retain(|(lid, _)| *lid != id);
    }
}

/// Detaches its state-change listener when dropped (or explicitly).
pub struct ListenerGuard {
    id: u64,
    shared: Weak<ConnectionShared>,
}

impl ListenerGuard {
    pub fn unsubscribe(self) {}
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove_listener(self.id);
        }
    }
}

/// Public handle to the managed connection.
pub struct ConnectionManager {
    cmd_tx: mpsc::Sender<ConnCmd>,
    shared: Arc<ConnectionShared>,
    registry: Arc<ChannelRegistry>,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        credentials: Arc<dyn CredentialProvider>,
        authorizer: Arc<dyn ChannelAuthorizer>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel::<ConnCmd>(64);
        let shared = Arc::new(ConnectionShared::new());
        let registry = Arc::new(ChannelRegistry::new(cmd_tx.clone()));

        let task = tokio::spawn(connection_task(
            cmd_rx,
            cmd_tx.clone(),
            config,
            credentials,
            authorizer,
            registry.clone(),
            shared.clone(),
        ));

        Self {
            cmd_tx,
            shared,
            registry,
            task,
        }
    }

    /// The channel registry bound to this connection.
    pub fn registry(&self) -> Arc<ChannelRegistry> {
        self.registry.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Begin connecting as `user_id`.  Failures are not returned here; they
    /// surface as connection-state transitions and self-heal via backoff.
    pub async fn connect(&self, user_id: UserId) {
        let _ = self.cmd_tx.send(ConnCmd::Connect { user_id }).await;
    }

    /// Tear the connection down and cancel any pending reconnect timer.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(ConnCmd::Disconnect).await;
    }

    /// User-triggered reconnect.  Resets the attempt counter and clears the
    /// `MaxRetriesReached` flag, then retries immediately.  Returns whether
    /// the connection is live afterwards.
    pub async fn manual_reconnect(&self) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(ConnCmd::ManualReconnect { reply: reply_tx })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Register a state-change listener.  Keep the guard alive for as long
    /// as the listener should receive transitions.
    pub fn on_state_change(&self, cb: StateListener) -> ListenerGuard {
        let id = self.shared.add_listener(cb);
        ListenerGuard {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Register a callback fired once per successful *re*connect (not on
    /// the first connection).
    pub fn on_reconnect(&self, cb: ReconnectListener) {
        self.shared
            .reconnect_listeners
            .lock()
            .expect("listener lock")
            .push(cb);
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(ConnCmd::Shutdown).await;
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

/// Acquire a bearer credential and open the socket, waiting for the
/// `connection_established` handshake frame.
async fn establish(
    config: &ConnectionConfig,
    credentials: &dyn CredentialProvider,
    user_id: UserId,
) -> Result<(WsStream, String, String), TransportError> {
    let bearer = credentials.bearer_token(user_id).await?;

    let (mut ws, _response) = tokio_tungstenite::connect_async(&config.ws_url)
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;

    let socket_id = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        while let Some(msg) = ws.next().await {
            let msg = msg.map_err(|e| TransportError::Connect(e.to_string()))?;
            if let Message::Text(text) = msg {
                if let ServerFrame::ConnectionEstablished { socket_id, .. } =
                    ServerFrame::parse(&text)?
                {
                    return Ok(socket_id);
                }
            }
        }
        Err(TransportError::Closed)
    })
    .await
    .map_err(|_| TransportError::Connect("handshake timed out".into()))??;

    Ok((ws, socket_id, bearer))
}

/// Schedule the next automatic reconnect attempt, replacing any pending
/// timer.  Transitions to `MaxRetriesReached` when the budget is spent.
fn schedule_reconnect(
    policy: &mut ReconnectPolicy,
    generation: u64,
    timer: &mut Option<JoinHandle<()>>,
    cmd_tx: &mpsc::Sender<ConnCmd>,
    shared: &ConnectionShared,
) {
    if let Some(t) = timer.take() {
        t.abort();
    }
    match policy.next_delay() {
        Some(delay) => {
            shared.set_state(ConnectionState::Reconnecting);
            info!(
                attempt = policy.attempts_scheduled(),
                delay_secs = delay.as_secs(),
                "scheduling reconnect"
            );
            let tx = cmd_tx.clone();
            *timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(ConnCmd::AttemptReconnect { generation }).await;
            }));
        }
        None => {
            warn!("reconnect budget exhausted, manual reconnect required");
            shared.set_state(ConnectionState::MaxRetriesReached);
        }
    }
}

/// Transition to `Connected`, firing the reconnect callbacks only when a
/// previous connection existed.  The first successful connect is never a
/// reconnect, even when it took scheduled retries to get there.
fn mark_connected(shared: &ConnectionShared, ever_connected: &mut bool) {
    shared.set_state(ConnectionState::Connected);
    if *ever_connected {
        shared.notify_reconnect();
    }
    *ever_connected = true;
}

/// Decode and route one text frame from the broadcaster.
fn handle_text(registry: &ChannelRegistry, out_tx: &mpsc::Sender<Message>, text: &str) {
    match ServerFrame::parse(text) {
        Ok(ServerFrame::SubscriptionSucceeded { channel, data }) => {
            if ChannelKind::from_wire_name(&channel) == ChannelKind::Presence {
                registry.dispatch(&channel, RealtimeEvent::presence_initial(&data));
            } else {
                debug!(channel = %channel, "subscription succeeded");
            }
        }
        Ok(ServerFrame::MemberAdded { channel, member }) => {
            if let Some(event) = RealtimeEvent::presence_member(&member, true) {
                registry.dispatch(&channel, event);
            }
        }
        Ok(ServerFrame::MemberRemoved { channel, member }) => {
            if let Some(event) = RealtimeEvent::presence_member(&member, false) {
                registry.dispatch(&channel, event);
            }
        }
        Ok(ServerFrame::Event {
            channel,
            event,
            data,
        }) => {
            let decoded = RealtimeEvent::decode(&event, &data, Utc::now());
            if let RealtimeEvent::Unknown { ref event } = decoded {
                debug!(event = %event, "unhandled event");
            }
            match channel {
                Some(channel) => registry.dispatch(&channel, decoded),
                None => debug!(event = %event, "event without channel dropped"),
            }
        }
        Ok(ServerFrame::Ping) => {
            let _ = out_tx.try_send(Message::Text(ClientFrame::Pong.to_wire()));
        }
        Ok(ServerFrame::Error { code, message }) => {
            warn!(code = ?code, message = %message, "broadcaster error frame");
        }
        Ok(ServerFrame::Pong) => {}
        Ok(ServerFrame::ConnectionEstablished { .. }) => {
            debug!("unexpected connection_established mid-stream");
        }
        Err(e) => warn!(error = %e, "failed to parse frame"),
    }
}

async fn next_frame(
    socket: &mut Option<WsStream>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match socket.as_mut() {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}

async fn connection_task(
    mut cmd_rx: mpsc::Receiver<ConnCmd>,
    cmd_tx: mpsc::Sender<ConnCmd>,
    config: ConnectionConfig,
    credentials: Arc<dyn CredentialProvider>,
    authorizer: Arc<dyn ChannelAuthorizer>,
    registry: Arc<ChannelRegistry>,
    shared: Arc<ConnectionShared>,
) {
    let mut socket: Option<WsStream> = None;
    let mut socket_id: Option<String> = None;
    let mut bearer: Option<String> = None;
    let mut user: Option<UserId> = None;
    let mut policy = ReconnectPolicy::new(config.max_reconnect_attempts);
    let mut reconnect_timer: Option<JoinHandle<()>> = None;
    // Incremented on every user-initiated transition; a reconnect timer or
    // in-flight attempt from an older generation is ignored, so concurrent
    // reconnect paths can never both acquire a socket.
    let mut generation: u64 = 0;
    let mut ever_connected = false;

    // Outgoing frames from subscribe subtasks are funnelled through the
    // event loop so only it writes to the socket.
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ConnCmd::Connect { user_id }) => {
                        user = Some(user_id);
                        generation += 1;
                        if let Some(t) = reconnect_timer.take() {
                            t.abort();
                        }
                        if let Some(mut ws) = socket.take() {
                            let _ = ws.close(None).await;
                        }
                        shared.set_state(ConnectionState::Connecting);
                        match establish(&config, credentials.as_ref(), user_id).await {
                            Ok((ws, sid, token)) => {
                                info!(socket_id = %sid, user = %user_id, "connected to broadcaster");
                                socket = Some(ws);
                                socket_id = Some(sid);
                                bearer = Some(token);
                                policy.reset();
                                mark_connected(&shared, &mut ever_connected);
                            }
                            Err(e) => {
                                warn!(error = %e, "connect failed");
                                schedule_reconnect(
                                    &mut policy, generation, &mut reconnect_timer, &cmd_tx, &shared,
                                );
                            }
                        }
                    }
                    Some(ConnCmd::Disconnect) => {
                        generation += 1;
                        if let Some(t) = reconnect_timer.take() {
                            t.abort();
                        }
                        policy.reset();
                        if let Some(mut ws) = socket.take() {
                            let _ = ws.close(None).await;
                        }
                        socket_id = None;
                        bearer = None;
                        registry.clear();
                        shared.set_state(ConnectionState::Disconnected);
                        info!("disconnected");
                    }
                    Some(ConnCmd::ManualReconnect { reply }) => {
                        generation += 1;
                        if let Some(t) = reconnect_timer.take() {
                            t.abort();
                        }
                        policy.reset();
                        if socket.is_some() {
                            let _ = reply.send(true);
                        } else if let Some(user_id) = user {
                            shared.set_state(ConnectionState::Connecting);
                            match establish(&config, credentials.as_ref(), user_id).await {
                                Ok((ws, sid, token)) => {
                                    info!(socket_id = %sid, "manual reconnect succeeded");
                                    socket = Some(ws);
                                    socket_id = Some(sid);
                                    bearer = Some(token);
                                    mark_connected(&shared, &mut ever_connected);
                                    let _ = reply.send(true);
                                }
                                Err(e) => {
                                    warn!(error = %e, "manual reconnect failed");
                                    let _ = reply.send(false);
                                    schedule_reconnect(
                                        &mut policy, generation, &mut reconnect_timer, &cmd_tx, &shared,
                                    );
                                }
                            }
                        } else {
                            let _ = reply.send(false);
                        }
                    }
                    Some(ConnCmd::AttemptReconnect { generation: g }) => {
                        if g != generation || socket.is_some() {
                            debug!("stale reconnect attempt ignored");
                        } else if let Some(user_id) = user {
                            match establish(&config, credentials.as_ref(), user_id).await {
                                Ok((ws, sid, token)) => {
                                    info!(socket_id = %sid, "reconnected");
                                    socket = Some(ws);
                                    socket_id = Some(sid);
                                    bearer = Some(token);
                                    policy.reset();
                                    if let Some(t) = reconnect_timer.take() {
                                        t.abort();
                                    }
                                    mark_connected(&shared, &mut ever_connected);
                                }
                                Err(e) => {
                                    warn!(error = %e, "reconnect attempt failed");
                                    schedule_reconnect(
                                        &mut policy, generation, &mut reconnect_timer, &cmd_tx, &shared,
                                    );
                                }
                            }
                        }
                    }
                    Some(ConnCmd::Subscribe { channel, kind, reply }) => {
                        if socket.is_none() {
                            let _ = reply.send(Err(TransportError::NotConnected));
                        } else if kind.requires_auth() {
                            // The auth exchange must not block delivery on
                            // other channels; run it in a subtask and funnel
                            // the subscribe frame back through out_tx.
                            let authorizer = authorizer.clone();
                            let out_tx = out_tx.clone();
                            let sid = socket_id.clone().unwrap_or_default();
                            let token = bearer.clone().unwrap_or_default();
                            tokio::spawn(async move {
                                match authorizer.authorize(&sid, &channel, &token).await {
                                    Ok(auth) => {
                                        let frame = ClientFrame::Subscribe {
                                            channel,
                                            auth: Some(auth.auth),
                                            channel_data: auth.channel_data,
                                        };
                                        let _ = out_tx.send(Message::Text(frame.to_wire())).await;
                                        let _ = reply.send(Ok(()));
                                    }
                                    Err(e) => {
                                        let _ = reply.send(Err(e));
                                    }
                                }
                            });
                        } else {
                            let frame = ClientFrame::Subscribe {
                                channel,
                                auth: None,
                                channel_data: None,
                            };
                            let _ = out_tx.send(Message::Text(frame.to_wire())).await;
                            let _ = reply.send(Ok(()));
                        }
                    }
                    Some(ConnCmd::Unsubscribe { channel }) => {
                        if socket.is_some() {
                            let frame = ClientFrame::Unsubscribe { channel };
                            let _ = out_tx.send(Message::Text(frame.to_wire())).await;
                        }
                    }
                    Some(ConnCmd::Shutdown) | None => {
                        if let Some(t) = reconnect_timer.take() {
                            t.abort();
                        }
                        if let Some(mut ws) = socket.take() {
                            let _ = ws.close(None).await;
                        }
                        shared.set_state(ConnectionState::Disconnected);
                        info!("connection task shutting down");
                        break;
                    }
                }
            }

            Some(frame) = out_rx.recv() => {
                if let Some(ws) = socket.as_mut() {
                    if let Err(e) = ws.send(frame).await {
                        warn!(error = %e, "write failed, treating connection as lost");
                        socket = None;
                        socket_id = None;
                        registry.clear();
                        schedule_reconnect(
                            &mut policy, generation, &mut reconnect_timer, &cmd_tx, &shared,
                        );
                    }
                }
            }

            msg = next_frame(&mut socket), if socket.is_some() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&registry, &out_tx, &text);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = out_tx.try_send(Message::Pong(payload));
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("connection closed by broadcaster");
                        socket = None;
                        socket_id = None;
                        registry.clear();
                        schedule_reconnect(
                            &mut policy, generation, &mut reconnect_timer, &cmd_tx, &shared,
                        );
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "transport error");
                        socket = None;
                        socket_id = None;
                        registry.clear();
                        schedule_reconnect(
                            &mut policy, generation, &mut reconnect_timer, &cmd_tx, &shared,
                        );
                    }
                }
            }
        }
    }
}
