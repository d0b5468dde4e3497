//! User-keyed presence hub.
//!
//! Tracks every live status socket per user, announces online/offline
//! transitions to everyone else, delivers user-targeted notifications, and
//! periodically probes connections that have gone quiet.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use chrono::Utc;
use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::HubError;

use super::connection::{Connection, Outbox};
use super::events::{Envelope, EventType, PresenceStatus, UserStatusEvent};
use super::{ConnectionId, HubCommand, HubSettings, UserId};

#[derive(Default)]
struct Directory {
    by_user: HashMap<UserId, HashMap<ConnectionId, Arc<Connection>>>,
    all: HashMap<ConnectionId, Arc<Connection>>,
}

impl Directory {
    /// Every connection not belonging to `user`.
    fn others(&self, user: UserId) -> Vec<Arc<Connection>> {
        self.all
            .values()
            .filter(|c| c.user_id() != user)
            .cloned()
            .collect()
    }
}

struct PresenceInner {
    directory: RwLock<Directory>,
    commands: mpsc::Sender<HubCommand>,
    shutdown: CancellationToken,
    settings: HubSettings,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Outcome of one liveness sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub refreshed: usize,
    pub evicted: usize,
    /// Evictions that could not be queued this cycle.
    pub deferred: usize,
}

#[derive(Clone)]
pub struct PresenceHub {
    inner: Arc<PresenceInner>,
}

impl PresenceHub {
    /// Start the event loop and the liveness sweeper on the current runtime.
    pub fn spawn(settings: HubSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.command_capacity.max(1));
        let hub = Self {
            inner: Arc::new(PresenceInner {
                directory: RwLock::new(Directory::default()),
                commands: tx,
                shutdown: CancellationToken::new(),
                settings,
                tasks: Mutex::new(Vec::new()),
            }),
        };

        let event_loop = tokio::spawn(run(hub.inner.clone(), rx));
        let sweeper = tokio::spawn(sweeper(hub.clone()));
        hub.inner.tasks.lock().extend([event_loop, sweeper]);

        tracing::info!(
            sweep_interval_secs = settings.sweep_interval.as_secs(),
            stale_after_secs = settings.stale_after().as_secs(),
            "presence hub started"
        );
        hub
    }

    pub fn settings(&self) -> &HubSettings {
        &self.inner.settings
    }

    /// Build a connection owned by this hub. It still has to be registered.
    pub fn connect(&self, user_id: UserId) -> (Arc<Connection>, Outbox) {
        Connection::new(
            user_id,
            None,
            self.inner.settings.queue_capacity,
            self.inner.commands.clone(),
        )
    }

    pub async fn register(&self, conn: Arc<Connection>) -> Result<(), HubError> {
        self.inner
            .commands
            .send(HubCommand::Register(conn))
            .await
            .map_err(|_| HubError::HubClosed)
    }

    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubError> {
        self.inner
            .commands
            .send(HubCommand::Unregister(id))
            .await
            .map_err(|_| HubError::HubClosed)
    }

    /// Wait until every command queued before this call has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.commands.send(HubCommand::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Deliver one event to every live connection of `user`. Returns how
    /// many connections it was queued on; zero when the user is offline.
    pub fn broadcast_to_user<T: Serialize>(&self, user: UserId, event: EventType, data: &T) -> usize {
        let targets: Vec<Arc<Connection>> = match self.inner.directory.read().by_user.get(&user) {
            Some(conns) => conns.values().cloned().collect(),
            None => return 0,
        };
        match Envelope::new(event, data).to_frame() {
            Ok(frame) => send_all(&targets, &frame),
            Err(err) => {
                tracing::error!(%err, %user, "dropping user event");
                0
            }
        }
    }

    /// Announce `user` as away. Ignored when the user is offline.
    pub fn set_away(&self, user: UserId) -> bool {
        self.announce_if_online(user, PresenceStatus::Away)
    }

    /// Announce `user` as back online. Ignored when the user is offline.
    pub fn set_online(&self, user: UserId) -> bool {
        self.announce_if_online(user, PresenceStatus::Online)
    }

    fn announce_if_online(&self, user: UserId, status: PresenceStatus) -> bool {
        let recipients = {
            let dir = self.inner.directory.read();
            if !dir.by_user.contains_key(&user) {
                return false;
            }
            dir.others(user)
        };
        announce(&recipients, user, status);
        true
    }

    /// Users with at least one live status socket.
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.inner.directory.read().by_user.keys().copied().collect();
        users.sort_unstable();
        users
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.inner.directory.read().by_user.contains_key(&user)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.directory.read().all.len()
    }

    /// Probe every connection that has been silent for longer than the
    /// stale threshold and evict the ones that do not answer.
    pub async fn sweep(&self) -> SweepReport {
        let threshold = self.inner.settings.stale_after();
        let candidates: Vec<Arc<Connection>> = self
            .inner
            .directory
            .read()
            .all
            .values()
            .filter(|c| c.is_stale(threshold))
            .cloned()
            .collect();

        let mut report = SweepReport {
            probed: candidates.len(),
            ..SweepReport::default()
        };
        if candidates.is_empty() {
            return report;
        }

        let timeout = self.inner.settings.probe_timeout;
        let outcomes = join_all(candidates.iter().map(|c| c.probe(timeout))).await;

        for (conn, outcome) in candidates.iter().zip(outcomes) {
            if outcome.is_ok() {
                conn.touch();
                report.refreshed += 1;
                continue;
            }

            conn.close();
            match self.inner.commands.try_send(HubCommand::Unregister(conn.id().clone())) {
                Ok(()) => {
                    report.evicted += 1;
                    tracing::info!(
                        connection_id = %conn.id(),
                        user_id = %conn.user_id(),
                        idle_secs = conn.idle_for().as_secs(),
                        "evicting stale connection"
                    );
                }
                // Picked up again next cycle.
                Err(TrySendError::Full(_)) => report.deferred += 1,
                Err(TrySendError::Closed(_)) => {}
            }
        }

        tracing::debug!(?report, "presence sweep finished");
        report
    }

    /// Close every connection and stop the event loop and sweeper.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                tracing::error!(%err, "presence task ended abnormally");
            }
        }
    }
}

fn send_all(targets: &[Arc<Connection>], frame: &Utf8Bytes) -> usize {
    targets
        .iter()
        .filter(|conn| match conn.send_frame(frame.clone()) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(connection_id = %conn.id(), %err, "skipping recipient");
                false
            }
        })
        .count()
}

fn announce(recipients: &[Arc<Connection>], user: UserId, status: PresenceStatus) {
    let event = UserStatusEvent {
        user_id: user,
        status,
        last_activity: Utc::now(),
    };
    match Envelope::new(status.event_type(), &event).to_frame() {
        Ok(frame) => {
            let delivered = send_all(recipients, &frame);
            tracing::debug!(%user, ?status, delivered, "presence change announced");
        }
        Err(err) => tracing::error!(%err, %user, "dropping presence change"),
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

async fn run(inner: Arc<PresenceInner>, mut commands: mpsc::Receiver<HubCommand>) {
    loop {
        let cmd = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            cmd = commands.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
        };

        let applied = std::panic::catch_unwind(AssertUnwindSafe(|| apply(&inner, cmd)));
        if applied.is_err() {
            tracing::error!("panic while applying presence command");
        }
    }

    // Registrations that never reached the loop are still owned by the hub.
    commands.close();
    let mut pending = 0;
    while let Ok(cmd) = commands.try_recv() {
        match cmd {
            HubCommand::Register(conn) => {
                conn.close();
                pending += 1;
            }
            HubCommand::Flush(reply) => {
                let _ = reply.send(());
            }
            HubCommand::Unregister(_) => {}
        }
    }

    let dir = std::mem::take(&mut *inner.directory.write());
    for conn in dir.all.values() {
        conn.close();
    }
    tracing::info!(closed = dir.all.len(), pending, "presence hub stopped");
}

fn apply(inner: &PresenceInner, cmd: HubCommand) {
    match cmd {
        HubCommand::Register(conn) => register(inner, conn),
        HubCommand::Unregister(id) => unregister(inner, &id),
        HubCommand::Flush(reply) => {
            let _ = reply.send(());
        }
    }
}

fn register(inner: &PresenceInner, conn: Arc<Connection>) {
    if !conn.is_open() {
        tracing::debug!(connection_id = %conn.id(), "skipping closed connection");
        return;
    }
    let user = conn.user_id();

    let (came_online, snapshot, recipients) = {
        let mut dir = inner.directory.write();
        let came_online = !dir.by_user.contains_key(&user);
        dir.by_user
            .entry(user)
            .or_default()
            .insert(conn.id().clone(), conn.clone());
        dir.all.insert(conn.id().clone(), conn.clone());

        let snapshot: Vec<UserId> = dir.by_user.keys().copied().filter(|u| *u != user).collect();
        let recipients = if came_online { dir.others(user) } else { Vec::new() };
        (came_online, snapshot, recipients)
    };

    tracing::debug!(connection_id = %conn.id(), %user, came_online, "status connection registered");

    if let Err(err) = conn.send(EventType::UserStatusInitial, &snapshot) {
        tracing::debug!(connection_id = %conn.id(), %err, "initial snapshot not delivered");
    }
    if came_online {
        announce(&recipients, user, PresenceStatus::Online);
    }
}

fn unregister(inner: &PresenceInner, id: &ConnectionId) {
    let (conn, went_offline, recipients) = {
        let mut dir = inner.directory.write();
        let Some(conn) = dir.all.remove(id) else {
            return;
        };
        let user = conn.user_id();
        let went_offline = match dir.by_user.get_mut(&user) {
            Some(conns) => {
                conns.remove(id);
                conns.is_empty()
            }
            None => false,
        };
        let recipients = if went_offline {
            dir.by_user.remove(&user);
            dir.others(user)
        } else {
            Vec::new()
        };
        (conn, went_offline, recipients)
    };

    conn.close();
    tracing::debug!(connection_id = %id, user = %conn.user_id(), went_offline, "status connection unregistered");

    if went_offline {
        announce(&recipients, conn.user_id(), PresenceStatus::Offline);
    }
}

// ---------------------------------------------------------------------------
// Sweeper
// ---------------------------------------------------------------------------

async fn sweeper(hub: PresenceHub) {
    let period = hub.inner.settings.sweep_interval;
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = hub.inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if AssertUnwindSafe(hub.sweep()).catch_unwind().await.is_err() {
                    tracing::error!("panic during presence sweep");
                }
            }
        }
    }
}
