use std::str::FromStr;
use std::time::Duration;

use crate::gateway::HubSettings;

/// Realtime API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HMAC secret used to verify login access tokens.
    pub jwt_secret: String,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Bound on each connection's outbound queue.
    pub outbound_queue_capacity: usize,
    /// Bound on each hub's register/unregister signal queue.
    pub hub_command_capacity: usize,
    /// Read-inactivity timeout; pings go out at 9/10 of this.
    pub pong_wait_secs: u64,
    /// Deadline for a single socket write.
    pub write_wait_secs: u64,
    /// Period of the presence liveness sweep.
    pub sweep_interval_secs: u64,
    /// Deadline for a liveness probe issued by the sweep.
    pub probe_timeout_secs: u64,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            jwt_secret: required_var("JWT_SECRET"),
            port: parsed_var("PORT", 8080),
            outbound_queue_capacity: parsed_var("OUTBOUND_QUEUE_CAPACITY", 256),
            hub_command_capacity: parsed_var("HUB_COMMAND_CAPACITY", 1024),
            pong_wait_secs: parsed_var("PONG_WAIT_SECS", 60),
            write_wait_secs: parsed_var("WRITE_WAIT_SECS", 10),
            sweep_interval_secs: parsed_var("SWEEP_INTERVAL_SECS", 60),
            probe_timeout_secs: parsed_var("PROBE_TIMEOUT_SECS", 5),
            max_message_size: parsed_var("MAX_MESSAGE_SIZE", 512),
        }
    }

    /// The timing and sizing knobs handed to every hub at startup.
    pub fn hub_settings(&self) -> HubSettings {
        let pong_wait = Duration::from_secs(self.pong_wait_secs);
        HubSettings {
            queue_capacity: self.outbound_queue_capacity.max(1),
            command_capacity: self.hub_command_capacity.max(1),
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            write_wait: Duration::from_secs(self.write_wait_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            max_message_size: self.max_message_size,
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| panic!("{name} env var is required"))
}

fn parsed_var<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, "unparseable value, using default");
            default
        }),
        _ => default,
    }
}
