//! # fitlink-sync
//!
//! The client-side coordination layer: keeps a user's group-fitness world
//! consistent in real time.  It ties together the managed pub/sub
//! connection from `fitlink-realtime`, the local persistence layer from
//! `fitlink-store`, and the REST backend into one
//! [`RealtimeCoordinator`](coordinator::RealtimeCoordinator):
//!
//! * workout invitations flow into a durable, ordered queue with countdown
//!   expiry and exactly-once auto-decline;
//! * lobby chat and membership merge from push events, history pages, and
//!   poll snapshots without duplication;
//! * when the socket drops mid-lobby, an HTTP polling fallback with
//!   version gating takes over until the connection heals.

use tracing_subscriber::{fmt, EnvFilter};

pub mod api;
pub mod config;
pub mod coordinator;
pub mod lobby;
pub mod polling;
pub mod queue;

pub use api::{FitnessApi, HttpFitnessApi, SessionHandle};
pub use config::SyncConfig;
pub use coordinator::RealtimeCoordinator;
pub use lobby::LobbyStateStore;
pub use polling::{LobbyFetcher, PollConfig, PollingFallback};
pub use queue::{InvitationQueue, QueueError};

/// Initialize tracing for embedding applications (respects `RUST_LOG`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("fitlink_sync=debug,fitlink_realtime=debug,fitlink_store=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
