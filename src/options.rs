//! Per-server configuration and reconnect policy

use crate::connection::ConnectionSettings;
use crate::constants::{
    DEFAULT_COMMAND_TIMEOUT, DEFAULT_EVENT_SUBSCRIPTION, DEFAULT_IDLE_READ_WINDOW,
    MAX_EVENT_QUEUE_SIZE, RECONNECT_BACKOFF_BASE, RECONNECT_BACKOFF_CAP, RECONNECT_JITTER_FRACTION,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential reconnect backoff with jitter.
///
/// Delays double per attempt from `base_delay` up to `max_delay`, then get a
/// ±20% jitter so a fleet of clients does not reconnect in lockstep.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Deterministic delay for the given attempt (0-based), before jitter.
    fn raw_delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u64 << shift;
        let delay_ms = (self.base_delay.as_millis() as u64)
            .saturating_mul(multiplier)
            .min(self.max_delay.as_millis() as u64);
        Duration::from_millis(delay_ms)
    }

    /// Jittered delay for the given attempt (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.raw_delay_for_attempt(attempt).as_millis() as u64;
        let span_ms = (base_ms as f64 * RECONNECT_JITTER_FRACTION) as u64;
        if span_ms == 0 {
            return Duration::from_millis(base_ms);
        }
        let jitter = rand::random::<u64>() % (2 * span_ms + 1);
        Duration::from_millis(base_ms - span_ms + jitter)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(RECONNECT_BACKOFF_BASE, RECONNECT_BACKOFF_CAP)
    }
}

/// Identity and behavior of one remote ESL server.
///
/// `(host, port)` uniquely identifies an entry in the option set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOption {
    /// Server hostname or address.
    pub host: String,
    /// ESL port, usually 8021.
    pub port: u16,
    /// Password for inbound authentication.
    pub password: String,
    /// Event subscription expression forwarded verbatim after auth as
    /// `event <expression>` (e.g. `plain ALL`). Empty disables subscription.
    #[serde(default = "default_event_subscription")]
    pub event_subscription: String,
    /// Opaque key an embedding application can use to route events.
    #[serde(default)]
    pub routing_key: Option<String>,
    /// Deadline for each command reply.
    #[serde(default = "default_command_timeout")]
    pub command_timeout: Duration,
    /// Reader-idle window before a liveness probe. Zero disables probing.
    #[serde(default = "default_idle_read_window")]
    pub idle_read_window: Duration,
    /// Reconnect backoff bounds.
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

fn default_event_subscription() -> String {
    DEFAULT_EVENT_SUBSCRIPTION.to_string()
}

fn default_command_timeout() -> Duration {
    DEFAULT_COMMAND_TIMEOUT
}

fn default_idle_read_window() -> Duration {
    DEFAULT_IDLE_READ_WINDOW
}

impl ServerOption {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            password: password.into(),
            event_subscription: default_event_subscription(),
            routing_key: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            idle_read_window: DEFAULT_IDLE_READ_WINDOW,
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Override the event subscription expression.
    pub fn event_subscription(mut self, expression: impl Into<String>) -> Self {
        self.event_subscription = expression.into();
        self
    }

    /// Attach a routing key.
    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    /// Override the per-command deadline.
    pub fn command_timeout(mut self, deadline: Duration) -> Self {
        self.command_timeout = deadline;
        self
    }

    /// Override the reader-idle window.
    pub fn idle_read_window(mut self, window: Duration) -> Self {
        self.idle_read_window = window;
        self
    }

    /// Override the reconnect policy.
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Canonical `host:port` identity.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connection parameters derived from this option.
    pub(crate) fn settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            command_timeout: self.command_timeout,
            idle_read_window: self.idle_read_window,
            event_queue_size: MAX_EVENT_QUEUE_SIZE,
        }
    }

    /// `true` when replacing `other` with `self` requires a fresh session
    /// (credentials changed; `(host, port)` is the map key and cannot differ).
    pub(crate) fn auth_changed(&self, other: &ServerOption) -> bool {
        self.password != other.password
    }
}
