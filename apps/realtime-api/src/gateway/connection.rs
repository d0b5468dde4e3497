//! A single live socket: its outbound queue, its lifecycle, and the two
//! loops that move frames between the queue and the transport.
//!
//! A `Connection` never points back at the hub that owns it. It is built
//! with that hub's command sender and uses it for exactly one thing: asking
//! to be unregistered.

use std::fmt::Display;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::ws::{Message, Utf8Bytes};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::error::HubError;

use super::events::{Envelope, EventType, InboundEvent};
use super::scoped::TypingHub;
use super::{ConnectionId, ConversationId, HubCommand, UserId};

/// Lifecycle of a connection. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// Close requested; one or both loops may still be winding down.
    Closing,
    /// Both loops have exited.
    Closed,
}

/// An item on a connection's outbound queue.
#[derive(Debug)]
pub enum Outbound {
    /// A serialized envelope.
    Frame(Utf8Bytes),
    /// A liveness probe; the write loop answers with whether the ping was
    /// written.
    Probe(oneshot::Sender<bool>),
}

/// Receiving half of a connection's outbound queue, drained by its write
/// loop.
pub struct Outbox {
    rx: mpsc::Receiver<Outbound>,
}

impl Outbox {
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.rx.try_recv().ok()
    }
}

pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    scope: Option<ConversationId>,
    capacity: usize,
    /// `None` once closed; dropping the sender is what closes the queue.
    outbound: RwLock<Option<mpsc::Sender<Outbound>>>,
    last_activity: Mutex<Instant>,
    state: Mutex<ConnectionState>,
    live_loops: AtomicU8,
    cancel: CancellationToken,
    hub: mpsc::Sender<HubCommand>,
}

impl Connection {
    /// Build a connection owned by the hub behind `hub`.
    pub fn new(
        user_id: UserId,
        scope: Option<ConversationId>,
        capacity: usize,
        hub: mpsc::Sender<HubCommand>,
    ) -> (Arc<Self>, Outbox) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Arc::new(Self {
            id: ConnectionId::new(),
            user_id,
            scope,
            capacity,
            outbound: RwLock::new(Some(tx)),
            last_activity: Mutex::new(Instant::now()),
            state: Mutex::new(ConnectionState::Open),
            live_loops: AtomicU8::new(2),
            cancel: CancellationToken::new(),
            hub,
        });
        (conn, Outbox { rx })
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn scope(&self) -> Option<ConversationId> {
        self.scope
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Record inbound traffic (a frame or a pong).
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.idle_for() > threshold
    }

    /// Wrap `data` in a fresh envelope and queue it.
    pub fn send<T: Serialize>(&self, event: EventType, data: T) -> Result<(), HubError> {
        let frame = Envelope::new(event, data).to_frame()?;
        self.send_frame(frame)
    }

    /// Queue an already-serialized envelope without waiting.
    ///
    /// A full queue means the client cannot keep up: the connection is
    /// closed and handed back to its hub rather than blocking the caller or
    /// buffering without bound.
    pub fn send_frame(&self, frame: Utf8Bytes) -> Result<(), HubError> {
        let result = match self.outbound.read().as_ref() {
            Some(tx) => tx.try_send(Outbound::Frame(frame)),
            None => return Err(HubError::Closed),
        };

        match result {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    connection_id = %self.id,
                    user_id = %self.user_id,
                    capacity = self.capacity,
                    "outbound queue full, dropping slow client"
                );
                self.close();
                self.request_unregister();
                Err(HubError::Overflow {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Closed(_)) => {
                self.close();
                Err(HubError::Closed)
            }
        }
    }

    /// Ask the write loop to ping the peer and report whether the write
    /// went through within `timeout`.
    pub async fn probe(&self, timeout: Duration) -> Result<(), HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let queued = match self.outbound.read().as_ref() {
            Some(tx) => tx.try_send(Outbound::Probe(reply_tx)).is_ok(),
            None => false,
        };
        if !queued {
            return Err(HubError::Stale);
        }

        match time::timeout(timeout, reply_rx).await {
            Ok(Ok(true)) => Ok(()),
            _ => Err(HubError::Stale),
        }
    }

    /// Stop accepting sends and signal both loops to wind down. Calling it
    /// again does nothing.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Open {
                return;
            }
            *state = ConnectionState::Closing;
        }
        self.cancel.cancel();
        self.outbound.write().take();
        tracing::debug!(connection_id = %self.id, user_id = %self.user_id, "connection closing");
    }

    /// Non-blocking unregistration request. If the hub's queue is full the
    /// request is dropped; the read loop repeats it on exit.
    pub fn request_unregister(&self) {
        if let Err(err) = self.hub.try_send(HubCommand::Unregister(self.id.clone())) {
            tracing::debug!(connection_id = %self.id, %err, "unregister request not queued");
        }
    }

    async fn unregister(&self) {
        // A closed hub has already dropped every connection it held.
        let _ = self.hub.send(HubCommand::Unregister(self.id.clone())).await;
    }

    fn loop_exited(&self) {
        if self.live_loops.fetch_sub(1, Ordering::AcqRel) == 1 {
            *self.state.lock() = ConnectionState::Closed;
            tracing::debug!(connection_id = %self.id, "connection closed");
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_activity(&self, by: Duration) {
        let mut last = self.last_activity.lock();
        if let Some(earlier) = last.checked_sub(by) {
            *last = earlier;
        }
    }
}

// ---------------------------------------------------------------------------
// Read loop
// ---------------------------------------------------------------------------

/// Read frames until the transport fails, goes quiet for `read_timeout`, or
/// the connection is cancelled, then hand the connection back to its hub.
///
/// Only typing frames are acted on, and only when `typing` is given.
pub async fn read_loop<S, E>(
    conn: Arc<Connection>,
    mut stream: S,
    typing: Option<TypingHub>,
    read_timeout: Duration,
) where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let next = tokio::select! {
            _ = conn.cancel.cancelled() => break,
            next = time::timeout(read_timeout, stream.next()) => next,
        };

        let msg = match next {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                tracing::debug!(connection_id = %conn.id, error = %e, "ws read error");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::debug!(connection_id = %conn.id, "read timed out");
                break;
            }
        };

        conn.touch();
        match msg {
            Message::Text(text) => handle_text(&conn, text.as_str(), typing.as_ref()),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    conn.close();
    conn.unregister().await;
    conn.loop_exited();
}

fn handle_text(conn: &Connection, text: &str, typing: Option<&TypingHub>) {
    match InboundEvent::parse(text) {
        Ok(InboundEvent::Typing(input)) => match typing {
            Some(hub) => {
                hub.relay_typing(conn, &input);
            }
            None => tracing::debug!(
                connection_id = %conn.id,
                "typing frame on a connection without a typing hub"
            ),
        },
        Ok(InboundEvent::Unrecognized(kind)) => {
            tracing::info!(connection_id = %conn.id, %kind, "unhandled message type");
        }
        Err(err) => {
            tracing::warn!(connection_id = %conn.id, user_id = %conn.user_id, %err, "bad inbound frame");
        }
    }
}

// ---------------------------------------------------------------------------
// Write loop
// ---------------------------------------------------------------------------

/// Drain `outbox` to `sink` in queue order, pinging every `ping_period`.
/// Exits on cancellation, queue closure, or any failed write.
pub async fn write_loop<W>(
    conn: Arc<Connection>,
    mut sink: W,
    mut outbox: Outbox,
    ping_period: Duration,
    write_wait: Duration,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let mut ticker = time::interval_at(time::Instant::now() + ping_period, ping_period);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    let mut say_goodbye = true;

    loop {
        tokio::select! {
            biased;
            _ = conn.cancel.cancelled() => break,
            item = outbox.recv() => {
                let Some(first) = item else { break };
                if let Err(err) = write_batch(&mut sink, &mut outbox, first, write_wait).await {
                    tracing::debug!(connection_id = %conn.id, %err, "ws write failed");
                    say_goodbye = false;
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(err) = write_one(&mut sink, Message::Ping(Bytes::new()), write_wait).await {
                    tracing::debug!(connection_id = %conn.id, %err, "keepalive ping failed");
                    say_goodbye = false;
                    break;
                }
            }
        }
    }

    if say_goodbye {
        let _ = write_one(&mut sink, Message::Close(None), write_wait).await;
    }
    conn.close();
    conn.loop_exited();
}

/// Write `first` plus everything already queued behind it, then flush once.
async fn write_batch<W>(
    sink: &mut W,
    outbox: &mut Outbox,
    first: Outbound,
    write_wait: Duration,
) -> Result<(), HubError>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let mut probes = Vec::new();
    let result = time::timeout(write_wait, async {
        let mut next = Some(first);
        while let Some(item) = next.take().or_else(|| outbox.try_recv()) {
            let msg = match item {
                Outbound::Frame(text) => Message::Text(text),
                Outbound::Probe(reply) => {
                    probes.push(reply);
                    Message::Ping(Bytes::new())
                }
            };
            sink.feed(msg).await.map_err(transport)?;
        }
        sink.flush().await.map_err(transport)
    })
    .await
    .unwrap_or_else(|_| Err(HubError::Transport("write timed out".to_string())));

    for reply in probes {
        let _ = reply.send(result.is_ok());
    }
    result
}

async fn write_one<W>(sink: &mut W, msg: Message, write_wait: Duration) -> Result<(), HubError>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    time::timeout(write_wait, sink.send(msg))
        .await
        .map_err(|_| HubError::Transport("write timed out".to_string()))?
        .map_err(transport)
}

fn transport(err: impl Display) -> HubError {
    HubError::Transport(err.to_string())
}
