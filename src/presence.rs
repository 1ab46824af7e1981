use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub heartbeat_timeout: Duration,
}

impl PresenceConfig {
    /// Reads `PRESENCE_TIMEOUT_SECS` from the environment.
    pub fn from_env() -> Self {
        let heartbeat_timeout = std::env::var("PRESENCE_TIMEOUT_SECS")
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT);
        Self { heartbeat_timeout }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}

/// Live set of connected viewers, keyed by ephemeral connection id so one
/// participant with two tabs counts twice. A connection is live from `join`
/// until `leave` or heartbeat silence past the configured timeout. The count
/// is eventually consistent: a lost `leave` is repaired by expiry.
#[derive(Debug)]
pub struct PresenceTracker {
    live: HashMap<String, Instant>,
    heartbeat_timeout: Duration,
}

impl PresenceTracker {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            live: HashMap::new(),
            heartbeat_timeout: config.heartbeat_timeout,
        }
    }

    pub fn join(&mut self, connection_id: &str) {
        self.mark(connection_id, Instant::now());
    }

    pub fn heartbeat(&mut self, connection_id: &str) {
        self.mark(connection_id, Instant::now());
    }

    pub fn leave(&mut self, connection_id: &str) {
        self.live.remove(connection_id);
    }

    pub fn current_count(&mut self) -> usize {
        self.count_at(Instant::now())
    }

    fn mark(&mut self, connection_id: &str, seen_at: Instant) {
        self.live.insert(connection_id.to_string(), seen_at);
    }

    fn count_at(&mut self, now: Instant) -> usize {
        let timeout = self.heartbeat_timeout;
        self.live
            .retain(|_, seen_at| now.duration_since(*seen_at) <= timeout);
        self.live.len()
    }
}
