//! Channel subscription registry.
//!
//! Tracks which channels are subscribed and routes decoded events to the
//! per-channel handler.  At most one live subscription exists per
//! `(name, kind)` pair; re-subscribing replaces the handler, never
//! duplicates the entry.  The registry deliberately holds no cross-reconnect
//! memory: after a reconnect the owner re-issues every subscribe, so stale
//! handler closures are never silently resurrected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use fitlink_shared::constants::SUBSCRIBE_RETRY_DELAYS_SECS;
use fitlink_shared::error::TransportError;
use fitlink_shared::events::RealtimeEvent;
use fitlink_shared::types::ChannelKind;

use crate::connection::ConnCmd;

/// Handler invoked for every event delivered on one channel.  Within one
/// channel, invocations preserve arrival order.
pub type EventHandler = Arc<dyn Fn(RealtimeEvent) + Send + Sync>;

struct ChannelEntry {
    kind: ChannelKind,
    handler: EventHandler,
}

/// Registry of live channel subscriptions, keyed by full wire name.
pub struct ChannelRegistry {
    channels: Mutex<HashMap<String, ChannelEntry>>,
    cmd_tx: mpsc::Sender<ConnCmd>,
}

impl ChannelRegistry {
    pub(crate) fn new(cmd_tx: mpsc::Sender<ConnCmd>) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            cmd_tx,
        }
    }

    /// Subscribe to a channel, replacing any existing handler for the same
    /// `(name, kind)` pair.
    ///
    /// Attempts that fail with a transient backend condition are retried up
    /// to 3 times (1 s, 2 s, 4 s) before the error is surfaced.
    pub async fn subscribe(
        &self,
        name: &str,
        kind: ChannelKind,
        handler: EventHandler,
    ) -> Result<(), TransportError> {
        let wire_name = kind.wire_name(name);

        // Register the handler before the subscribe frame goes out so events
        // arriving immediately after the ack are routed.
        let mut previous = {
            let mut channels = self.channels.lock().expect("registry lock");
            channels.insert(wire_name.clone(), ChannelEntry { kind, handler })
        };
        if previous.is_some() {
            debug!(channel = %wire_name, "replacing existing subscription");
        }

        let mut attempt = 0usize;
        loop {
            match self.request_subscribe(&wire_name, kind).await {
                Ok(()) => {
                    debug!(channel = %wire_name, "subscribed");
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < SUBSCRIBE_RETRY_DELAYS_SECS.len() => {
                    let delay = Duration::from_secs(SUBSCRIBE_RETRY_DELAYS_SECS[attempt]);
                    attempt += 1;
                    warn!(
                        channel = %wire_name,
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "transient subscribe failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(channel = %wire_name, error = %e, "subscription failed");
                    let mut channels = self.channels.lock().expect("registry lock");
                    match previous.take() {
                        // The earlier subscription is still live on the
                        // broadcaster; keep routing to its handler.
                        Some(entry) => {
                            channels.insert(wire_name.clone(), entry);
                        }
                        None => {
                            channels.remove(&wire_name);
                        }
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Drop the subscription for `(name, kind)`.
    pub async fn unsubscribe(&self, name: &str, kind: ChannelKind) {
        let wire_name = kind.wire_name(name);
        let removed = self
            .channels
            .lock()
            .expect("registry lock")
            .remove(&wire_name)
            .is_some();
        if removed {
            let _ = self
                .cmd_tx
                .send(ConnCmd::Unsubscribe {
                    channel: wire_name.clone(),
                })
                .await;
            debug!(channel = %wire_name, "unsubscribed");
        }
    }

    async fn request_subscribe(
        &self,
        wire_name: &str,
        kind: ChannelKind,
    ) -> Result<(), TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ConnCmd::Subscribe {
                channel: wire_name.to_string(),
                kind,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TransportError::NotConnected)?;

        reply_rx.await.map_err(|_| TransportError::NotConnected)?
    }

    /// Deliver one decoded event to the handler for `channel`.  Events on
    /// channels with no registered handler are dropped with a log line.
    pub fn dispatch(&self, channel: &str, event: RealtimeEvent) {
        let handler = {
            let channels = self.channels.lock().expect("registry lock");
            channels.get(channel).map(|entry| entry.handler.clone())
        };
        match handler {
            Some(handler) => handler(event),
            None => debug!(channel, "event on unsubscribed channel dropped"),
        }
    }

    /// Snapshot of subscribed channels as `(wire_name, kind)` pairs.
    pub fn subscribed(&self) -> Vec<(String, ChannelKind)> {
        self.channels
            .lock()
            .expect("registry lock")
            .iter()
            .map(|(name, entry)| (name.clone(), entry.kind))
            .collect()
    }

    pub fn contains(&self, name: &str, kind: ChannelKind) -> bool {
        self.channels
            .lock()
            .expect("registry lock")
            .contains_key(&kind.wire_name(name))
    }

    /// Forget every entry.  Called when the live connection is lost; the
    /// owner re-issues subscribes on reconnect.
    pub fn clear(&self) {
        self.channels.lock().expect("registry lock").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Drive the command channel like the connection task would, failing the
    /// first `failures` subscribe attempts with the given error.
    fn stub_connection(
        mut cmd_rx: mpsc::Receiver<ConnCmd>,
        failures: u32,
        error: fn() -> TransportError,
    ) -> Arc<AtomicU32> {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                if let ConnCmd::Subscribe { reply, .. } = cmd {
                    let n = attempts_clone.fetch_add(1, Ordering::SeqCst);
                    if n < failures {
                        let _ = reply.send(Err(error()));
                    } else {
                        let _ = reply.send(Ok(()));
                    }
                }
            }
        });
        attempts
    }

    fn noop_handler() -> EventHandler {
        Arc::new(|_| {})
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_retries_transient_failures() {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let registry = ChannelRegistry::new(cmd_tx);
        let attempts = stub_connection(cmd_rx, 2, || {
            TransportError::Transient("lock contention".into())
        });

        registry
            .subscribe("group.1", ChannelKind::Private, noop_handler())
            .await
            .expect("should succeed on third attempt");

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(registry.contains("group.1", ChannelKind::Private));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_surfaces_error_after_three_retries() {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let registry = ChannelRegistry::new(cmd_tx);
        let attempts = stub_connection(cmd_rx, u32::MAX, || {
            TransportError::Transient("lock contention".into())
        });

        let result = registry
            .subscribe("group.1", ChannelKind::Private, noop_handler())
            .await;

        assert!(result.is_err());
        // Initial attempt plus three retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert!(!registry.contains("group.1", ChannelKind::Private));
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let registry = ChannelRegistry::new(cmd_tx);
        let attempts = stub_connection(cmd_rx, u32::MAX, || TransportError::AuthExchange {
            status: Some(403),
            message: "forbidden".into(),
        });

        let result = registry
            .subscribe("group.1", ChannelKind::Private, noop_handler())
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_not_duplicates() {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let registry = ChannelRegistry::new(cmd_tx);
        stub_connection(cmd_rx, 0, || TransportError::NotConnected);

        let first_hits = Arc::new(AtomicU32::new(0));
        let second_hits = Arc::new(AtomicU32::new(0));

        let hits = first_hits.clone();
        registry
            .subscribe(
                "online",
                ChannelKind::Presence,
                Arc::new(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        let hits = second_hits.clone();
        registry
            .subscribe(
                "online",
                ChannelKind::Presence,
                Arc::new(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        assert_eq!(registry.subscribed().len(), 1);

        registry.dispatch(
            "presence-online",
            RealtimeEvent::PresenceJoined {
                user: fitlink_shared::types::UserId(1),
            },
        );

        // Only the replacement handler sees the event.
        assert_eq!(first_hits.load(Ordering::SeqCst), 0);
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_resubscribe_keeps_previous_handler() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(16);
        let registry = ChannelRegistry::new(cmd_tx);
        // First subscribe is accepted, every later attempt rejected outright.
        tokio::spawn(async move {
            let mut first = true;
            while let Some(cmd) = cmd_rx.recv().await {
                if let ConnCmd::Subscribe { reply, .. } = cmd {
                    if first {
                        first = false;
                        let _ = reply.send(Ok(()));
                    } else {
                        let _ = reply.send(Err(TransportError::AuthExchange {
                            status: Some(403),
                            message: "forbidden".into(),
                        }));
                    }
                }
            }
        });

        let hits = Arc::new(AtomicU32::new(0));
        let hits_clone = hits.clone();
        registry
            .subscribe(
                "group.4",
                ChannelKind::Private,
                Arc::new(move |_| {
                    hits_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        let result = registry
            .subscribe("group.4", ChannelKind::Private, noop_handler())
            .await;
        assert!(result.is_err());

        // The original subscription is still live and still routed.
        assert!(registry.contains("group.4", ChannelKind::Private));
        registry.dispatch(
            "private-group.4",
            RealtimeEvent::UnreadCountUpdated { count: 1 },
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_entry() {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let registry = ChannelRegistry::new(cmd_tx);
        stub_connection(cmd_rx, 0, || TransportError::NotConnected);

        registry
            .subscribe("group.9", ChannelKind::Private, noop_handler())
            .await
            .unwrap();
        registry.unsubscribe("group.9", ChannelKind::Private).await;

        assert!(!registry.contains("group.9", ChannelKind::Private));
        assert!(registry.subscribed().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_to_unknown_channel_is_dropped() {
        let (cmd_tx, _cmd_rx) = mpsc::channel(16);
        let registry = ChannelRegistry::new(cmd_tx);
        // No panic, no handler call.
        registry.dispatch(
            "presence-online",
            RealtimeEvent::PresenceJoined {
                user: fitlink_shared::types::UserId(1),
            },
        );
    }
}
