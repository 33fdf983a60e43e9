//! Tunables for the coordination layer.  Components take these as defaults;
//! tests and callers can override per instance.

/// Maximum number of automatically scheduled reconnect attempts before the
/// connection enters `MaxRetriesReached`.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Upper bound on the exponential reconnect delay, in seconds.
pub const RECONNECT_DELAY_CAP_SECS: u64 = 60;

/// Backoff schedule for channel subscription retries, in seconds.
pub const SUBSCRIBE_RETRY_DELAYS_SECS: [u64; 3] = [1, 2, 4];

/// Base polling interval for the HTTP fallback, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 3000;

/// Multiplier applied to the poll interval per consecutive failure.
pub const POLL_BACKOFF_FACTOR: f64 = 1.5;

/// Upper bound on the backed-off poll interval, in milliseconds.
pub const POLL_BACKOFF_CAP_MS: u64 = 30_000;

/// Consecutive poll failures tolerated before the session's poll loop
/// reports a terminal error and stops.
pub const DEFAULT_POLL_MAX_RETRIES: u32 = 10;

/// How often the invitation queue re-evaluates expiry, in milliseconds.
pub const INVITATION_TICK_MS: u64 = 1000;

/// Period of the invitation-queue sweep that purges terminal and
/// past-expiry entries whose own timer never fired, in seconds.
pub const QUEUE_SWEEP_SECS: u64 = 30;
