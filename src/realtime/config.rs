use std::time::Duration;

pub const DEFAULT_REALTIME_URL: &str = "ws://localhost:8007/ws";
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(3000);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(30_000);
pub const DEFAULT_WARNING_DELAY: Duration = Duration::from_millis(3000);

/// What an unanswered heartbeat means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeartbeatPolicy {
    /// Pings only keep intermediaries from idling the channel out.
    #[default]
    KeepAlive,
    /// Drop and reconnect when no pong arrives within `timeout` of a ping.
    ReconnectOnMissedPong { timeout: Duration },
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Channel endpoint without credentials; `?token=` is appended per attempt.
    pub url: String,
    pub reconnect_interval: Duration,
    /// Reconnect attempts after a drop before settling in `Error`.
    pub max_reconnect_attempts: u32,
    /// Zero turns the heartbeat off.
    pub heartbeat_interval: Duration,
    pub heartbeat: HeartbeatPolicy,
    /// How long a disruption lasts before the reconnecting warning is raised.
    pub warning_delay: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REALTIME_URL.to_string(),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat: HeartbeatPolicy::KeepAlive,
            warning_delay: DEFAULT_WARNING_DELAY,
        }
    }
}

impl RealtimeConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_heartbeat_policy(mut self, policy: HeartbeatPolicy) -> Self {
        self.heartbeat = policy;
        self
    }

    pub fn with_warning_delay(mut self, delay: Duration) -> Self {
        self.warning_delay = delay;
        self
    }
}
