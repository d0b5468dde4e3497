//! Real-time presence and fan-out hubs.
//!
//! Three hubs run side by side: a chat hub and a typing hub, both instances of
//! [`scoped::ScopedHub`] keyed by conversation, and a [`presence::PresenceHub`]
//! keyed by user. Business logic reaches them only through
//! [`service::HubService`].

pub mod connection;
pub mod events;
pub mod presence;
pub mod scoped;
pub mod server;
pub mod service;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use match_common::id::{prefix, PrefixedId};
use tokio::sync::oneshot;
use uuid::Uuid;

use connection::Connection;

/// Identity of an authenticated user.
pub type UserId = Uuid;

/// Identity of a conversation between two connected users; the scope of the
/// chat and typing hubs.
pub type ConversationId = Uuid;

/// Opaque handle of a single live connection (`wsc_` prefixed ULID).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl PrefixedId for ConnectionId {
    const PREFIX: &'static str = prefix::CONNECTION;
}

impl ConnectionId {
    pub fn new() -> Self {
        Self(<Self as PrefixedId>::generate())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Signals consumed by a hub's event loop. Only the loop mutates hub
/// membership, so these are the sole way in.
pub enum HubCommand {
    Register(Arc<Connection>),
    Unregister(ConnectionId),
    /// Answered once every command queued ahead of it has been applied.
    Flush(oneshot::Sender<()>),
}

/// Timing and sizing knobs shared by all hubs.
#[derive(Debug, Clone, Copy)]
pub struct HubSettings {
    /// Bound on each connection's outbound queue.
    pub queue_capacity: usize,
    /// Bound on each hub's command queue.
    pub command_capacity: usize,
    /// Read-inactivity timeout and keepalive window.
    pub pong_wait: Duration,
    /// Interval between keepalive pings.
    pub ping_period: Duration,
    /// Deadline for one socket write.
    pub write_wait: Duration,
    /// Period of the presence liveness sweep.
    pub sweep_interval: Duration,
    /// Deadline for a single liveness probe.
    pub probe_timeout: Duration,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
}

impl HubSettings {
    /// Silence longer than this makes a connection a sweep candidate.
    pub fn stale_after(&self) -> Duration {
        self.pong_wait * 2
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            queue_capacity: 256,
            command_capacity: 1024,
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            write_wait: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
            max_message_size: 512,
        }
    }
}
