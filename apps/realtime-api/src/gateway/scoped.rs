//! Conversation-scoped fan-out.
//!
//! One generic hub serves both the chat and the typing sockets. Membership
//! changes flow through a bounded command queue into a single event loop;
//! broadcasts read the per-conversation groups directly and never wait on
//! that loop.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::HubError;

use super::connection::{Connection, Outbox};
use super::events::{Envelope, EventType, TypingEvent, TypingInput};
use super::{ConnectionId, ConversationId, HubCommand, HubSettings, UserId};

/// What a scoped hub is for. Only affects logging and which event types it
/// is expected to carry.
pub trait ScopeKind: Send + Sync + 'static {
    const NAME: &'static str;

    fn carries(event: EventType) -> bool;
}

/// New messages and read receipts.
pub struct Chat;

/// Typing indicators.
pub struct Typing;

impl ScopeKind for Chat {
    const NAME: &'static str = "chat";

    fn carries(event: EventType) -> bool {
        matches!(event, EventType::MessageNew | EventType::MessageRead)
    }
}

impl ScopeKind for Typing {
    const NAME: &'static str = "typing";

    fn carries(event: EventType) -> bool {
        event == EventType::MessageTyping
    }
}

pub type ChatHub = ScopedHub<Chat>;
pub type TypingHub = ScopedHub<Typing>;

/// Live connections subscribed to one conversation.
#[derive(Default)]
struct ScopedGroup {
    members: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

struct ScopedInner {
    groups: DashMap<ConversationId, Arc<ScopedGroup>>,
    commands: mpsc::Sender<HubCommand>,
    shutdown: CancellationToken,
    settings: HubSettings,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap, cloneable handle to a running scoped hub.
pub struct ScopedHub<K: ScopeKind> {
    inner: Arc<ScopedInner>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: ScopeKind> Clone for ScopedHub<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: ScopeKind> ScopedHub<K> {
    /// Start the hub's event loop on the current runtime.
    pub fn spawn(settings: HubSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.command_capacity.max(1));
        let inner = Arc::new(ScopedInner {
            groups: DashMap::new(),
            commands: tx,
            shutdown: CancellationToken::new(),
            settings,
            task: Mutex::new(None),
        });

        let handle = tokio::spawn(run::<K>(inner.clone(), rx));
        *inner.task.lock() = Some(handle);

        tracing::info!(hub = K::NAME, "scoped hub started");
        Self {
            inner,
            _kind: PhantomData,
        }
    }

    pub fn settings(&self) -> &HubSettings {
        &self.inner.settings
    }

    /// Build a connection owned by this hub. It still has to be registered.
    pub fn connect(&self, user_id: UserId, scope: ConversationId) -> (Arc<Connection>, Outbox) {
        Connection::new(
            user_id,
            Some(scope),
            self.inner.settings.queue_capacity,
            self.inner.commands.clone(),
        )
    }

    /// Queue `conn` for registration; it joins its conversation once the
    /// event loop gets to it.
    pub async fn register(&self, conn: Arc<Connection>) -> Result<(), HubError> {
        self.inner
            .commands
            .send(HubCommand::Register(conn))
            .await
            .map_err(|_| HubError::HubClosed)
    }

    /// Queue `id` for removal.
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

    /// Send `data` to every connection in `scope` except those of
    /// `exclude`. Returns how many connections the frame was queued on.
    ///
    /// The envelope is serialized once and shared by every recipient.
    pub fn broadcast<T: Serialize>(
        &self,
        scope: ConversationId,
        event: EventType,
        data: &T,
        exclude: UserId,
    ) -> usize {
        if !K::carries(event) {
            tracing::warn!(hub = K::NAME, event = event.as_str(), "event routed to unexpected hub");
        }

        let frame = match Envelope::new(event, data).to_frame() {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(hub = K::NAME, %err, "dropping broadcast");
                return 0;
            }
        };
        self.broadcast_frame(scope, frame, exclude)
    }

    fn broadcast_frame(&self, scope: ConversationId, frame: Utf8Bytes, exclude: UserId) -> usize {
        let Some(group) = self.inner.groups.get(&scope).map(|g| g.clone()) else {
            return 0;
        };

        // Collect under the lock, send outside it.
        let targets: Vec<Arc<Connection>> = group
            .members
            .read()
            .values()
            .filter(|c| c.user_id() != exclude)
            .cloned()
            .collect();

        let mut delivered = 0;
        for conn in targets {
            match conn.send_frame(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => tracing::debug!(
                    hub = K::NAME,
                    connection_id = %conn.id(),
                    %err,
                    "skipping recipient"
                ),
            }
        }
        delivered
    }

    /// Number of live connections in `scope`.
    pub fn member_count(&self, scope: ConversationId) -> usize {
        self.inner
            .groups
            .get(&scope)
            .map(|g| g.members.read().len())
            .unwrap_or(0)
    }

    /// Distinct users with a live connection in `scope`.
    pub fn members(&self, scope: ConversationId) -> Vec<UserId> {
        let Some(group) = self.inner.groups.get(&scope).map(|g| g.clone()) else {
            return Vec::new();
        };
        let mut users: Vec<UserId> = group.members.read().values().map(|c| c.user_id()).collect();
        users.sort_unstable();
        users.dedup();
        users
    }

    /// Number of conversations with at least one live connection.
    pub fn scope_count(&self) -> usize {
        self.inner.groups.len()
    }

    /// Close every connection and stop the event loop.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self.inner.task.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::error!(hub = K::NAME, %err, "hub loop ended abnormally");
            }
        }
    }
}

impl ScopedHub<Typing> {
    /// Relay a typing frame from `conn` to the other participants of its
    /// conversation.
    pub fn relay_typing(&self, conn: &Connection, input: &TypingInput) -> usize {
        let Some(scope) = conn.scope() else {
            tracing::warn!(connection_id = %conn.id(), "typing frame on an unscoped connection");
            return 0;
        };
        if let Some(claimed) = input.conversation_id {
            if claimed != scope {
                tracing::warn!(
                    connection_id = %conn.id(),
                    %claimed,
                    %scope,
                    "typing frame names another conversation, ignoring"
                );
                return 0;
            }
        }

        let event = TypingEvent {
            conversation_id: scope,
            user_id: conn.user_id(),
            is_typing: input.is_typing,
            updated_at: Utc::now(),
        };
        self.broadcast(scope, EventType::MessageTyping, &event, conn.user_id())
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

async fn run<K: ScopeKind>(inner: Arc<ScopedInner>, mut commands: mpsc::Receiver<HubCommand>) {
    let mut live: HashMap<ConnectionId, Arc<Connection>> = HashMap::new();

    loop {
        let cmd = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            cmd = commands.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
        };

        let applied = std::panic::catch_unwind(AssertUnwindSafe(|| {
            apply::<K>(&inner, &mut live, cmd);
        }));
        if applied.is_err() {
            tracing::error!(hub = K::NAME, "panic while applying hub command");
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

    for conn in live.values() {
        conn.close();
    }
    inner.groups.clear();
    tracing::info!(hub = K::NAME, closed = live.len(), pending, "scoped hub stopped");
}

fn apply<K: ScopeKind>(
    inner: &ScopedInner,
    live: &mut HashMap<ConnectionId, Arc<Connection>>,
    cmd: HubCommand,
) {
    match cmd {
        HubCommand::Register(conn) => {
            let Some(scope) = conn.scope() else {
                tracing::warn!(hub = K::NAME, connection_id = %conn.id(), err = %HubError::Unscoped, "rejecting registration");
                conn.close();
                return;
            };
            if !conn.is_open() {
                tracing::debug!(hub = K::NAME, connection_id = %conn.id(), "skipping closed connection");
                return;
            }

            inner
                .groups
                .entry(scope)
                .or_default()
                .members
                .write()
                .insert(conn.id().clone(), conn.clone());
            tracing::debug!(
                hub = K::NAME,
                connection_id = %conn.id(),
                user_id = %conn.user_id(),
                conversation_id = %scope,
                "connection registered"
            );
            live.insert(conn.id().clone(), conn);
        }
        HubCommand::Unregister(id) => {
            let Some(conn) = live.remove(&id) else {
                return;
            };
            if let Some(scope) = conn.scope() {
                let emptied = inner.groups.get(&scope).is_some_and(|group| {
                    let mut members = group.members.write();
                    members.remove(&id);
                    members.is_empty()
                });
                if emptied {
                    inner.groups.remove_if(&scope, |_, g| g.members.read().is_empty());
                }
            }
            conn.close();
            tracing::debug!(hub = K::NAME, connection_id = %id, "connection unregistered");
        }
        HubCommand::Flush(reply) => {
            let _ = reply.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::gateway::connection::ConnectionState;
    use crate::gateway::testing::{drain, next_event, types};

    async fn joined<K: ScopeKind>(
        hub: &ScopedHub<K>,
        user: UserId,
        scope: ConversationId,
    ) -> (Arc<Connection>, Outbox) {
        let (conn, outbox) = hub.connect(user, scope);
        hub.register(conn.clone()).await.unwrap();
        (conn, outbox)
    }

    #[tokio::test]
    async fn broadcast_skips_every_session_of_the_excluded_user() {
        let hub = ChatHub::spawn(HubSettings::default());
        let conversation = Uuid::new_v4();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        let (_a1, mut a1_out) = joined(&hub, alice, conversation).await;
        let (_a2, mut a2_out) = joined(&hub, alice, conversation).await;
        let (_b, mut b_out) = joined(&hub, bob, conversation).await;
        hub.flush().await;

        let sent = hub.broadcast(
            conversation,
            EventType::MessageNew,
            &serde_json::json!({ "text": "hi" }),
            alice,
        );

        assert_eq!(sent, 1);
        assert_eq!(types(&drain(&mut b_out)), vec!["message_new"]);
        assert!(drain(&mut a1_out).is_empty());
        assert!(drain(&mut a2_out).is_empty());
    }

    #[tokio::test]
    async fn broadcast_stays_inside_its_conversation() {
        let hub = ChatHub::spawn(HubSettings::default());
        let (here, elsewhere) = (Uuid::new_v4(), Uuid::new_v4());

        let (_a, _a_out) = joined(&hub, Uuid::new_v4(), here).await;
        let (_b, mut b_out) = joined(&hub, Uuid::new_v4(), elsewhere).await;
        hub.flush().await;

        hub.broadcast(here, EventType::MessageRead, &(), Uuid::new_v4());
        assert!(drain(&mut b_out).is_empty());
        assert_eq!(hub.broadcast(Uuid::new_v4(), EventType::MessageRead, &(), Uuid::new_v4()), 0);
    }

    #[tokio::test]
    async fn recipients_share_one_envelope() {
        let hub = ChatHub::spawn(HubSettings::default());
        let conversation = Uuid::new_v4();
        let (_a, mut a_out) = joined(&hub, Uuid::new_v4(), conversation).await;
        let (_b, mut b_out) = joined(&hub, Uuid::new_v4(), conversation).await;
        hub.flush().await;

        hub.broadcast(conversation, EventType::MessageNew, &(), Uuid::new_v4());
        let a = next_event(&mut a_out).await;
        let b = next_event(&mut b_out).await;
        assert_eq!(a["message_id"], b["message_id"]);
    }

    #[tokio::test]
    async fn empty_groups_are_removed() {
        let hub = ChatHub::spawn(HubSettings::default());
        let conversation = Uuid::new_v4();
        let (a, _a_out) = joined(&hub, Uuid::new_v4(), conversation).await;
        let (b, _b_out) = joined(&hub, Uuid::new_v4(), conversation).await;
        hub.flush().await;
        assert_eq!(hub.member_count(conversation), 2);
        assert_eq!(hub.members(conversation).len(), 2);

        hub.unregister(a.id().clone()).await.unwrap();
        hub.flush().await;
        assert_eq!(hub.member_count(conversation), 1);
        assert_eq!(a.state(), ConnectionState::Closing);

        hub.unregister(b.id().clone()).await.unwrap();
        hub.flush().await;
        assert_eq!(hub.member_count(conversation), 0);
        assert_eq!(hub.scope_count(), 0);
    }

    #[tokio::test]
    async fn unregistering_twice_is_harmless() {
        let hub = ChatHub::spawn(HubSettings::default());
        let (a, _a_out) = joined(&hub, Uuid::new_v4(), Uuid::new_v4()).await;
        hub.unregister(a.id().clone()).await.unwrap();
        hub.unregister(a.id().clone()).await.unwrap();
        hub.flush().await;
        assert_eq!(hub.scope_count(), 0);
    }

    #[tokio::test]
    async fn overflowing_member_is_closed_and_unregistered() {
        let hub = ChatHub::spawn(HubSettings {
            queue_capacity: 2,
            ..HubSettings::default()
        });
        let conversation = Uuid::new_v4();
        let (slow, _slow_out) = joined(&hub, Uuid::new_v4(), conversation).await;
        hub.flush().await;

        let sender = Uuid::new_v4();
        assert_eq!(hub.broadcast(conversation, EventType::MessageNew, &(), sender), 1);
        assert_eq!(hub.broadcast(conversation, EventType::MessageNew, &(), sender), 1);
        assert_eq!(hub.broadcast(conversation, EventType::MessageNew, &(), sender), 0);
        assert!(!slow.is_open());

        hub.flush().await;
        assert_eq!(hub.member_count(conversation), 0);
        assert_eq!(hub.scope_count(), 0);
    }

    #[tokio::test]
    async fn closed_connections_are_not_registered() {
        let hub = ChatHub::spawn(HubSettings::default());
        let conversation = Uuid::new_v4();
        let (conn, _out) = hub.connect(Uuid::new_v4(), conversation);
        conn.close();
        hub.register(conn).await.unwrap();
        hub.flush().await;
        assert_eq!(hub.member_count(conversation), 0);
    }

    #[tokio::test]
    async fn typing_is_relayed_to_peers_only() {
        let hub = TypingHub::spawn(HubSettings::default());
        let conversation = Uuid::new_v4();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let (a, mut a_out) = joined(&hub, alice, conversation).await;
        let (_b, mut b_out) = joined(&hub, bob, conversation).await;
        hub.flush().await;

        let input = TypingInput {
            conversation_id: Some(conversation),
            is_typing: true,
        };
        assert_eq!(hub.relay_typing(&a, &input), 1);

        let event = next_event(&mut b_out).await;
        assert_eq!(event["type"], "message_typing");
        assert_eq!(event["data"]["user_id"], alice.to_string());
        assert_eq!(event["data"]["is_typing"], true);
        assert!(drain(&mut a_out).is_empty());
    }

    #[tokio::test]
    async fn typing_for_another_conversation_is_ignored() {
        let hub = TypingHub::spawn(HubSettings::default());
        let conversation = Uuid::new_v4();
        let (a, _a_out) = joined(&hub, Uuid::new_v4(), conversation).await;
        let (_b, mut b_out) = joined(&hub, Uuid::new_v4(), conversation).await;
        hub.flush().await;

        let input = TypingInput {
            conversation_id: Some(Uuid::new_v4()),
            is_typing: true,
        };
        assert_eq!(hub.relay_typing(&a, &input), 0);
        assert!(drain(&mut b_out).is_empty());
    }

    #[tokio::test]
    async fn shutdown_closes_every_connection() {
        let hub = ChatHub::spawn(HubSettings::default());
        let (a, _a_out) = joined(&hub, Uuid::new_v4(), Uuid::new_v4()).await;
        let (b, _b_out) = joined(&hub, Uuid::new_v4(), Uuid::new_v4()).await;
        hub.flush().await;

        hub.shutdown().await;
        assert!(!a.is_open());
        assert!(!b.is_open());
        assert_eq!(hub.scope_count(), 0);
        assert!(matches!(hub.register(a).await, Err(HubError::HubClosed)));
    }

    #[tokio::test]
    async fn shutdown_closes_connections_still_queued() {
        let hub = ChatHub::spawn(HubSettings::default());
        let (conn, _out) = hub.connect(Uuid::new_v4(), Uuid::new_v4());
        hub.register(conn.clone()).await.unwrap();

        hub.shutdown().await;
        assert!(!conn.is_open());
        assert_eq!(hub.scope_count(), 0);
    }
}
