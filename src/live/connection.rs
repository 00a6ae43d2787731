//! Live Connection Manager: at most one stream per bound match.
//!
//! ```text
//!  bind(id) ──▶ spawn connection task (generation N)
//!                 │ decode frames, tag with N
//!                 ▼
//!              inbox (mpsc, FIFO per connection)
//!                 │
//!  pump() ◀───────┘ drop if tag != current generation, else call handler
//! ```
//!
//! Every connection carries a generation number and every inbound item is
//! tagged with it. Rebinding, even to the same match, bumps the generation,
//! so a frame from a superseded connection can never reach the handler
//! registered for its successor. Handlers only ever run inside `pump()`.

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

use super::event::{decode, LiveEvent};
use super::model::MatchId;
use super::transport::Connector;

pub type EventHandler = Box<dyn FnMut(LiveEvent) + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Unbound,
    Connecting(MatchId),
    Bound(MatchId),
    Closing(MatchId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `unbind()` or a rebind asked for it
    Requested,
    ServerClosed,
    StreamEnded,
    ConnectFailed(String),
    Transport(String),
}

/// Result of one `pump()` step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    Opened {
        match_id: MatchId,
        generation: u64,
    },
    /// Event handed to the registered handler
    Delivered { generation: u64 },
    /// Current event, but no handler registered
    Unhandled { generation: u64 },
    /// Item from a superseded connection, discarded
    Stale { generation: u64 },
    Closed {
        match_id: MatchId,
        generation: u64,
        reason: CloseReason,
        /// Whether this was the live connection (as opposed to one already
        /// replaced or unbound)
        current: bool,
    },
}

#[derive(Debug)]
enum Inbound {
    Opened {
        generation: u64,
    },
    Frame {
        generation: u64,
        event: LiveEvent,
    },
    Closed {
        generation: u64,
        match_id: MatchId,
        reason: CloseReason,
    },
}

struct ActiveConnection {
    generation: u64,
    match_id: MatchId,
    close_tx: oneshot::Sender<()>,
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    base_url: Url,
    ping_interval: Duration,
    generation: u64,
    state: ConnectionState,
    active: Option<ActiveConnection>,
    /// Generation of the connection we are waiting on in `Closing`
    closing: Option<u64>,
    handler: Option<EventHandler>,
    inbox_tx: mpsc::Sender<Inbound>,
    inbox_rx: mpsc::Receiver<Inbound>,
}

impl ConnectionManager {
    /// `base_url` is the stream root, e.g. `ws://localhost:8000/ws`; match
    /// streams live under `<base>/live/<id>`.
    pub fn new(
        connector: Arc<dyn Connector>,
        base_url: &str,
        ping_interval: Duration,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url)?;
        if !matches!(base_url.scheme(), "ws" | "wss") {
            anyhow::bail!("live stream URL must be ws:// or wss://, got {}", base_url);
        }
        if base_url.cannot_be_a_base() {
            anyhow::bail!("live stream URL {} cannot carry a path", base_url);
        }
        let (inbox_tx, inbox_rx) = mpsc::channel(1024);
        Ok(ConnectionManager {
            connector,
            base_url,
            ping_interval,
            generation: 0,
            state: ConnectionState::Unbound,
            active: None,
            closing: None,
            handler: None,
            inbox_tx,
            inbox_rx,
        })
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    #[cfg(test)]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    pub fn bound_match(&self) -> Option<&MatchId> {
        self.active.as_ref().map(|a| &a.match_id)
    }

    pub fn stream_url(&self, match_id: &MatchId) -> Url {
        let mut url = self.base_url.clone();
        // Cannot fail: `new` rejected cannot-be-a-base URLs.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("live").push(match_id.as_str());
        }
        url
    }

    /// Close whatever is open, then open a stream for `match_id`. `None`
    /// only closes. Registered handlers are released; register the next
    /// one after binding.
    pub fn bind(&mut self, match_id: Option<MatchId>) {
        self.unbind();
        let Some(match_id) = match_id else {
            return;
        };

        self.generation += 1;
        let generation = self.generation;
        let url = self.stream_url(&match_id);
        let (close_tx, close_rx) = oneshot::channel();

        info!("[live:{}#{}] Opening {}", match_id, generation, url);
        tokio::spawn(run_connection(ConnectionTask {
            connector: Arc::clone(&self.connector),
            url,
            match_id: match_id.clone(),
            generation,
            inbox: self.inbox_tx.clone(),
            close_rx,
            ping_interval: self.ping_interval,
        }));

        self.state = ConnectionState::Connecting(match_id.clone());
        self.active = Some(ActiveConnection {
            generation,
            match_id,
            close_tx,
        });
    }

    /// Register the callback for decoded events of the current binding.
    /// Replaces any previous handler.
    pub fn on_event<F>(&mut self, handler: F)
    where
        F: FnMut(LiveEvent) + Send + 'static,
    {
        self.handler = Some(Box::new(handler));
    }

    /// Request close of the active connection and drop the handler. The
    /// close is not awaited; nothing from that connection is applied after
    /// this returns.
    pub fn unbind(&mut self) {
        self.handler = None;
        match self.active.take() {
            Some(active) => {
                info!(
                    "[live:{}#{}] Close requested",
                    active.match_id, active.generation
                );
                // The task may already be gone; that's fine.
                let _ = active.close_tx.send(());
                self.closing = Some(active.generation);
                self.state = ConnectionState::Closing(active.match_id);
            }
            None => {
                if !matches!(self.state, ConnectionState::Closing(_)) {
                    self.state = ConnectionState::Unbound;
                }
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.active
            .as_ref()
            .map_or(false, |a| a.generation == generation)
    }

    /// Wait for the next inbound item and dispatch it on the caller's task.
    pub async fn pump(&mut self) -> Activity {
        // The manager owns a sender, so the inbox never closes.
        let Some(inbound) = self.inbox_rx.recv().await else {
            return std::future::pending().await;
        };
        self.dispatch(inbound)
    }

    fn dispatch(&mut self, inbound: Inbound) -> Activity {
        match inbound {
            Inbound::Frame { generation, event } => {
                if !self.is_current(generation) {
                    debug!(
                        "Discarding {} from superseded connection #{}",
                        event.kind(),
                        generation
                    );
                    return Activity::Stale { generation };
                }
                match self.handler.as_mut() {
                    Some(handler) => {
                        handler(event);
                        Activity::Delivered { generation }
                    }
                    None => Activity::Unhandled { generation },
                }
            }
            Inbound::Opened { generation } => match &self.active {
                Some(active) if active.generation == generation => {
                    let match_id = active.match_id.clone();
                    self.state = ConnectionState::Bound(match_id.clone());
                    Activity::Opened {
                        match_id,
                        generation,
                    }
                }
                _ => Activity::Stale { generation },
            },
            Inbound::Closed {
                generation,
                match_id,
                reason,
            } => {
                let current = self.is_current(generation);
                if current {
                    self.active = None;
                    self.handler = None;
                    self.state = ConnectionState::Unbound;
                } else if self.closing == Some(generation) {
                    self.closing = None;
                    if matches!(self.state, ConnectionState::Closing(_)) {
                        self.state = ConnectionState::Unbound;
                    }
                }
                Activity::Closed {
                    match_id,
                    generation,
                    reason,
                    current,
                }
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.close_tx.send(());
        }
    }
}

struct ConnectionTask {
    connector: Arc<dyn Connector>,
    url: Url,
    match_id: MatchId,
    generation: u64,
    inbox: mpsc::Sender<Inbound>,
    close_rx: oneshot::Receiver<()>,
    ping_interval: Duration,
}

/// One connection's lifetime: connect, forward decoded frames, report close.
/// A dropped close sender counts as a close request.
async fn run_connection(task: ConnectionTask) {
    let ConnectionTask {
        connector,
        url,
        match_id,
        generation,
        inbox,
        mut close_rx,
        ping_interval,
    } = task;
    let tag = format!("live:{}#{}", match_id, generation);

    let transport = tokio::select! {
        result = connector.connect(&url) => match result {
            Ok(transport) => transport,
            Err(e) => {
                error!("[{}] WebSocket connection failed: {:#}", tag, e);
                let _ = inbox
                    .send(Inbound::Closed {
                        generation,
                        match_id,
                        reason: CloseReason::ConnectFailed(format!("{:#}", e)),
                    })
                    .await;
                return;
            }
        },
        _ = &mut close_rx => {
            info!("[{}] Closed before the connection opened", tag);
            let _ = inbox
                .send(Inbound::Closed {
                    generation,
                    match_id,
                    reason: CloseReason::Requested,
                })
                .await;
            return;
        }
    };

    info!("[{}] WebSocket connected", tag);
    if inbox.send(Inbound::Opened { generation }).await.is_err() {
        return;
    }

    let mut write = transport.sink;
    let mut read = transport.stream;
    let mut ping_interval =
        tokio::time::interval_at(tokio::time::Instant::now() + ping_interval, ping_interval);

    let reason = loop {
        tokio::select! {
            _ = &mut close_rx => {
                let _ = write.send(Message::Close(None)).await;
                break CloseReason::Requested;
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        // Text-level keepalive some servers use instead of ping frames
                        if text.trim() == "ping" {
                            let _ = write.send(Message::Text("pong".to_string())).await;
                            continue;
                        }
                        match decode(&text) {
                            Ok(event) => {
                                if inbox.send(Inbound::Frame { generation, event }).await.is_err() {
                                    break CloseReason::Requested;
                                }
                            }
                            Err(e) => warn!("[{}] Dropping undecodable message: {}", tag, e),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        warn!("[{}] Server closed WebSocket", tag);
                        break CloseReason::ServerClosed;
                    }
                    Some(Err(e)) => {
                        error!("[{}] WebSocket error: {}", tag, e);
                        break CloseReason::Transport(e.to_string());
                    }
                    None => {
                        warn!("[{}] WebSocket stream ended", tag);
                        break CloseReason::StreamEnded;
                    }
                    _ => {}
                }
            }
            _ = ping_interval.tick() => {
                if let Err(e) = write.send(Message::Ping(vec![])).await {
                    error!("[{}] Ping failed: {}", tag, e);
                    break CloseReason::Transport(e.to_string());
                }
            }
        }
    };

    info!("[{}] Connection closed ({:?})", tag, reason);
    let _ = inbox
        .send(Inbound::Closed {
            generation,
            match_id,
            reason,
        })
        .await;
}
