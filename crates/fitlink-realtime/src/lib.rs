//! # fitlink-realtime
//!
//! The managed pub/sub side of the coordination layer: one live
//! Pusher-compatible WebSocket connection with a reconnect-with-backoff
//! state machine, a channel registry that routes decoded events to
//! per-channel handlers, presence tracking, and the HTTP auth exchange for
//! private/presence channels.
//!
//! The connection event loop runs in a dedicated tokio task.  External code
//! communicates with it through typed command channels, keeping the
//! networking layer fully asynchronous and decoupled.

pub mod auth;
pub mod channels;
pub mod connection;
pub mod policy;
pub mod presence;

pub use auth::{BroadcastAuthClient, ChannelAuth, ChannelAuthorizer, CredentialProvider};
pub use channels::{ChannelRegistry, EventHandler};
pub use connection::{ConnectionConfig, ConnectionManager, ListenerGuard};
pub use policy::ReconnectPolicy;
pub use presence::PresenceTracker;
