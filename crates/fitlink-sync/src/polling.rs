//! HTTP polling fallback for lobby state.
//!
//! When the socket is down, each active lobby is polled over REST.  The
//! poller is version-gated: a snapshot only reaches the consumer when its
//! version is strictly newer than the last one delivered, so redundant
//! re-renders never happen.  Consecutive failures stretch the interval
//! geometrically and a failure budget turns persistent outage into a
//! single terminal error instead of an endless hammering loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fitlink_shared::constants::{
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_POLL_MAX_RETRIES, POLL_BACKOFF_CAP_MS, POLL_BACKOFF_FACTOR,
};
use fitlink_shared::error::ApiError;
use fitlink_shared::types::{LobbyState, SessionId};

use crate::api::FitnessApi;

/// Source of lobby snapshots.  Production goes through [`FitnessApi`];
/// tests script the sequence of responses.
#[async_trait]
pub trait LobbyFetcher: Send + Sync {
    async fn fetch(&self, session_id: SessionId) -> Result<LobbyState, ApiError>;
}

/// Adapter from the REST client.
pub struct ApiLobbyFetcher(pub Arc<dyn FitnessApi>);

#[async_trait]
impl LobbyFetcher for ApiLobbyFetcher {
    async fn fetch(&self, session_id: SessionId) -> Result<LobbyState, ApiError> {
        self.0.fetch_lobby_state(session_id).await
    }
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub max_retries: u32,
    pub backoff_factor: f64,
    pub backoff_cap_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_retries: DEFAULT_POLL_MAX_RETRIES,
            backoff_factor: POLL_BACKOFF_FACTOR,
            backoff_cap_ms: POLL_BACKOFF_CAP_MS,
        }
    }
}

pub type UpdateHandler = Arc<dyn Fn(LobbyState) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(ApiError) + Send + Sync>;

struct PollHandle {
    task: JoinHandle<()>,
    active: Arc<AtomicBool>,
}

/// One poll loop per session, at most.  Starting an already-active session
/// is a no-op; a finished or stopped loop can be started again.
pub struct PollingFallback {
    fetcher: Arc<dyn LobbyFetcher>,
    sessions: Mutex<HashMap<SessionId, PollHandle>>,
}

impl PollingFallback {
    pub fn new(fetcher: Arc<dyn LobbyFetcher>) -> Self {
        Self {
            fetcher,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn start_polling(
        &self,
        session_id: SessionId,
        config: PollConfig,
        on_update: UpdateHandler,
        on_error: ErrorHandler,
    ) {
        let mut sessions = self.sessions.lock().expect("polling lock");
        if let Some(handle) = sessions.get(&session_id) {
            if handle.active.load(Ordering::SeqCst) {
                debug!(session = %session_id, "polling already active");
                return;
            }
            handle.task.abort();
        }

        info!(session = %session_id, interval_ms = config.interval_ms, "starting lobby polling");
        let active = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(poll_loop(
            Arc::clone(&self.fetcher),
            session_id,
            config,
            on_update,
            on_error,
            Arc::clone(&active),
        ));
        sessions.insert(session_id, PollHandle { task, active });
    }

    pub fn stop_polling(&self, session_id: SessionId) {
        let mut sessions = self.sessions.lock().expect("polling lock");
        if let Some(handle) = sessions.remove(&session_id) {
            handle.task.abort();
            handle.active.store(false, Ordering::SeqCst);
            info!(session = %session_id, "stopped lobby polling");
        }
    }

    pub fn is_active(&self, session_id: SessionId) -> bool {
        self.sessions
            .lock()
            .expect("polling lock")
            .get(&session_id)
            .is_some_and(|h| h.active.load(Ordering::SeqCst))
    }

    pub fn stop_all(&self) {
        let mut sessions = self.sessions.lock().expect("polling lock");
        for (session_id, handle) in sessions.drain() {
            handle.task.abort();
            handle.active.store(false, Ordering::SeqCst);
            debug!(session = %session_id, "stopped lobby polling");
        }
    }
}

impl Drop for PollingFallback {
    fn drop(&mut self) {
        self.stop_all();
    }
}

async fn poll_loop(
    fetcher: Arc<dyn LobbyFetcher>,
    session_id: SessionId,
    config: PollConfig,
    on_update: UpdateHandler,
    on_error: ErrorHandler,
    active: Arc<AtomicBool>,
) {
    let mut last_version: u64 = 0;
    let mut failed: u32 = 0;

    loop {
        match fetcher.fetch(session_id).await {
            Ok(state) => {
                failed = 0;
                if state.version > last_version {
                    last_version = state.version;
                    on_update(state);
                } else {
                    debug!(session = %session_id, version = state.version, "poll returned stale version");
                }
            }
            Err(e) => {
                failed += 1;
                warn!(session = %session_id, error = %e, failures = failed, "lobby poll failed");
                if failed >= config.max_retries {
                    warn!(session = %session_id, "poll failure budget exhausted, stopping");
                    on_error(e);
                    break;
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(next_delay_ms(&config, failed))).await;
    }

    active.store(false, Ordering::SeqCst);
}

/// Healthy loops poll at the base interval; each consecutive failure
/// stretches it geometrically up to the cap.
fn next_delay_ms(config: &PollConfig, failed: u32) -> u64 {
    if failed == 0 {
        return config.interval_ms;
    }
    let stretched = (config.interval_ms as f64) * config.backoff_factor.powi(failed as i32);
    stretched.min(config.backoff_cap_ms as f64) as u64
}
