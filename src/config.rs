//! Environment-driven configuration for replicas and the relay.
//!
//! Every knob has a `DEFAULT_*` constant. Unset variables fall back to it;
//! unparsable ones fall back with a warning. Binaries load `.env` with `dotenvy` before calling
//! `from_env`.

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_HISTORY_DEPTH: usize = crate::history::DEFAULT_HISTORY_DEPTH;
pub const DEFAULT_PRESENCE_TRACK_DELAY_MS: u64 = 500;
pub const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 10_000;
pub const DEFAULT_INBOUND_BUFFER: usize = 1024;
pub const DEFAULT_PERSIST_FLUSH_MS: u64 = 100;
pub const DEFAULT_CURSOR_THROTTLE_MS: u64 = 50;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_RELAY_CLIENT_BUFFER: usize = 256;

/// Replica-side tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Snapshots retained on each of the undo and redo stacks.
    pub history_depth: usize,
    /// Delay between a channel reaching `Subscribed` and the first presence track.
    pub presence_track_delay: Duration,
    /// How long a publish waits for the relay's acknowledgement.
    pub publish_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// Capacity of the per-subscription inbound channel.
    pub inbound_buffer: usize,
    pub persist_flush_interval: Duration,
    /// Minimum spacing between cursor presence updates.
    pub cursor_throttle: Duration,
    /// Durable offline queue location; in-memory when unset.
    pub queue_path: Option<PathBuf>,
}

impl SyncConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            history_depth: env_parse("SYNC_HISTORY_DEPTH", DEFAULT_HISTORY_DEPTH),
            presence_track_delay: env_millis("SYNC_PRESENCE_TRACK_DELAY_MS", DEFAULT_PRESENCE_TRACK_DELAY_MS),
            publish_timeout: env_millis("SYNC_PUBLISH_TIMEOUT_MS", DEFAULT_PUBLISH_TIMEOUT_MS),
            reconnect_base: env_millis("SYNC_RECONNECT_BASE_MS", DEFAULT_RECONNECT_BASE_MS),
            reconnect_max: env_millis("SYNC_RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX_MS),
            inbound_buffer: env_parse("SYNC_INBOUND_BUFFER", DEFAULT_INBOUND_BUFFER).max(1),
            persist_flush_interval: env_millis("SYNC_PERSIST_FLUSH_MS", DEFAULT_PERSIST_FLUSH_MS),
            cursor_throttle: env_millis("SYNC_CURSOR_THROTTLE_MS", DEFAULT_CURSOR_THROTTLE_MS),
            queue_path: std::env::var("SYNC_QUEUE_PATH")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            history_depth: DEFAULT_HISTORY_DEPTH,
            presence_track_delay: Duration::from_millis(DEFAULT_PRESENCE_TRACK_DELAY_MS),
            publish_timeout: Duration::from_millis(DEFAULT_PUBLISH_TIMEOUT_MS),
            reconnect_base: Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
            reconnect_max: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
            inbound_buffer: DEFAULT_INBOUND_BUFFER,
            persist_flush_interval: Duration::from_millis(DEFAULT_PERSIST_FLUSH_MS),
            cursor_throttle: Duration::from_millis(DEFAULT_CURSOR_THROTTLE_MS),
            queue_path: None,
        }
    }
}

/// Relay binary settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    pub port: u16,
    /// Outbound frames buffered per connection before drops begin.
    pub client_buffer: usize,
}

impl RelayConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            client_buffer: env_parse("RELAY_CLIENT_BUFFER", DEFAULT_RELAY_CLIENT_BUFFER).max(1),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { port: DEFAULT_PORT, client_buffer: DEFAULT_RELAY_CLIENT_BUFFER }
    }
}

/// Read `key` as a `T`, ignoring surrounding whitespace. Unset keys yield
/// `default`; unparsable values are logged and yield `default`.
pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy + std::fmt::Debug,
{
    let Ok(raw) = std::env::var(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, value = %raw, ?default, "config: unparsable value; using default");
            default
        }
    }
}

fn env_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parse(key, default_ms))
}
