//! Host view: decides which match is bound, owns the reconnect policy, and
//! publishes one [`LiveFrame`] per change for the renderer.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::live::{
    Activity, Applied, CloseReason, ConnectionManager, MatchId, MatchSnapshot, Reconciler,
    ReconcilerOptions,
};
use crate::registry::ActiveMatchClient;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No match selected
    Waiting,
    Connecting,
    Live,
    Closed { reason: String },
    Reconnecting { in_secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventLogEntry {
    pub at: DateTime<Utc>,
    pub kind: String,
    pub applied: Applied,
}

/// Everything the renderer sees.
#[derive(Debug, Clone, Serialize)]
pub struct LiveFrame {
    pub match_id: Option<MatchId>,
    pub connection: ConnectionStatus,
    pub snapshot: Option<Arc<MatchSnapshot>>,
    /// `match_end` received for the bound match
    pub ended: bool,
    /// Most recent events, oldest first
    pub events: VecDeque<EventLogEntry>,
    pub updated_at: DateTime<Utc>,
}

impl LiveFrame {
    pub fn waiting() -> Self {
        LiveFrame {
            match_id: None,
            connection: ConnectionStatus::Waiting,
            snapshot: None,
            ended: false,
            events: VecDeque::new(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ViewOptions {
    pub reconnect: bool,
    pub max_backoff: Duration,
    pub reconciler: ReconcilerOptions,
    pub deregister_on_teardown: bool,
    pub event_log_capacity: usize,
}

impl Default for ViewOptions {
    fn default() -> Self {
        ViewOptions {
            reconnect: false,
            max_backoff: Duration::from_secs(30),
            reconciler: ReconcilerOptions::default(),
            deregister_on_teardown: true,
            event_log_capacity: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewCommand {
    /// Select a match; `None` clears the selection.
    Watch(Option<MatchId>),
}

pub struct LiveView {
    manager: ConnectionManager,
    registry: Option<ActiveMatchClient>,
    options: ViewOptions,
    frames: Arc<watch::Sender<LiveFrame>>,
    reconnect_attempt: u32,
    retry_at: Option<Instant>,
}

impl LiveView {
    pub fn new(
        manager: ConnectionManager,
        registry: Option<ActiveMatchClient>,
        options: ViewOptions,
    ) -> (Self, watch::Receiver<LiveFrame>) {
        let (tx, rx) = watch::channel(LiveFrame::waiting());
        let view = LiveView {
            manager,
            registry,
            options,
            frames: Arc::new(tx),
            reconnect_attempt: 0,
            retry_at: None,
        };
        (view, rx)
    }

    /// Switch the selected match. Leaving a match deregisters it with the
    /// backend when configured to.
    pub fn bind(&mut self, match_id: Option<MatchId>) {
        let previous = self.frames.borrow().match_id.clone();
        if let Some(previous) = previous.filter(|p| Some(p) != match_id.as_ref()) {
            self.deregister(previous);
        }
        self.reconnect_attempt = 0;
        self.retry_at = None;
        self.open(match_id);
    }

    fn open(&mut self, match_id: Option<MatchId>) {
        let Some(match_id) = match_id else {
            self.manager.bind(None);
            self.frames.send_modify(|frame| *frame = LiveFrame::waiting());
            return;
        };

        // Reconnecting to the same match keeps what we already know.
        let carried = {
            let frame = self.frames.borrow();
            if frame.match_id.as_ref() == Some(&match_id) {
                frame.snapshot.clone()
            } else {
                None
            }
        };
        let mut reconciler =
            Reconciler::resume(match_id.clone(), carried.clone(), self.options.reconciler);

        self.manager.bind(Some(match_id.clone()));

        let frames = Arc::clone(&self.frames);
        let capacity = self.options.event_log_capacity;
        self.manager.on_event(move |event| {
            let entry_kind = event.kind().to_string();
            let at = event.timestamp.unwrap_or_else(Utc::now);
            let applied = reconciler.apply(event);
            let snapshot = reconciler.snapshot().cloned();
            let ended = reconciler.is_ended();
            frames.send_modify(|frame| {
                if applied.changed() {
                    frame.snapshot = snapshot;
                    frame.ended = ended;
                }
                frame.events.push_back(EventLogEntry {
                    at,
                    kind: entry_kind,
                    applied,
                });
                while frame.events.len() > capacity {
                    frame.events.pop_front();
                }
                frame.updated_at = Utc::now();
            });
        });

        self.frames.send_modify(|frame| {
            if frame.match_id.as_ref() != Some(&match_id) {
                frame.events.clear();
            }
            frame.match_id = Some(match_id);
            frame.connection = ConnectionStatus::Connecting;
            frame.snapshot = carried;
            frame.ended = false;
            frame.updated_at = Utc::now();
        });
    }

    fn deregister(&self, match_id: MatchId) {
        if !self.options.deregister_on_teardown {
            return;
        }
        let Some(registry) = self.registry.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = registry.deregister(&match_id).await {
                debug!("[{}] Deregister failed: {:#}", match_id, e);
            }
        });
    }

    fn on_activity(&mut self, activity: Activity) {
        match activity {
            Activity::Opened { match_id, .. } => {
                info!("[{}] Live", match_id);
                self.reconnect_attempt = 0;
                self.set_connection(ConnectionStatus::Live);
            }
            Activity::Delivered { .. } => {}
            Activity::Unhandled { generation } | Activity::Stale { generation } => {
                debug!("Event from connection #{} not applied", generation);
            }
            Activity::Closed {
                current: false,
                match_id,
                generation,
                ..
            } => {
                debug!("[{}] Superseded connection #{} closed", match_id, generation);
            }
            Activity::Closed {
                current: true,
                match_id,
                reason,
                ..
            } => self.on_closed(match_id, reason),
        }
    }

    fn on_closed(&mut self, match_id: MatchId, reason: CloseReason) {
        debug!(
            "[{}] Stream closed ({:?}), manager now {:?}",
            match_id,
            reason,
            self.manager.state()
        );
        let ended = self.frames.borrow().ended;
        if self.options.reconnect && !ended {
            let delay = reconnect_delay(self.reconnect_attempt, self.options.max_backoff);
            self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
            self.retry_at = Some(Instant::now() + delay);
            warn!(
                "[{}] Connection lost ({:?}), reconnecting in {:.1}s",
                match_id,
                reason,
                delay.as_secs_f64()
            );
            self.set_connection(ConnectionStatus::Reconnecting {
                in_secs: delay.as_secs(),
            });
        } else {
            self.set_connection(ConnectionStatus::Closed {
                reason: describe(&reason),
            });
        }
    }

    fn set_connection(&self, status: ConnectionStatus) {
        self.frames.send_modify(|frame| {
            frame.connection = status;
            frame.updated_at = Utc::now();
        });
    }

    /// Drive the view until the command channel closes. Leaving tears the
    /// binding down like any other deselection.
    pub async fn run(mut self, mut commands: mpsc::Receiver<ViewCommand>) {
        loop {
            let retry_at = self.retry_at;
            let retry = async move {
                match retry_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = commands.recv() => match command {
                    Some(ViewCommand::Watch(match_id)) => self.bind(match_id),
                    None => {
                        info!("View command channel closed, shutting down live view");
                        self.bind(None);
                        return;
                    }
                },
                activity = self.manager.pump() => self.on_activity(activity),
                _ = retry => {
                    self.retry_at = None;
                    let match_id = self.frames.borrow().match_id.clone();
                    if let Some(match_id) = match_id {
                        info!(
                            "[{}] Reconnecting (attempt {})",
                            match_id, self.reconnect_attempt
                        );
                        self.open(Some(match_id));
                    }
                }
            }
        }
    }
}

fn describe(reason: &CloseReason) -> String {
    match reason {
        CloseReason::Requested => "closed".to_string(),
        CloseReason::ServerClosed => "server closed the stream".to_string(),
        CloseReason::StreamEnded => "stream ended".to_string(),
        CloseReason::ConnectFailed(e) => format!("connect failed: {}", e),
        CloseReason::Transport(e) => format!("transport error: {}", e),
    }
}

/// 1s doubling per attempt up to `max`, plus up to 250ms of jitter.
pub fn reconnect_delay(attempt: u32, max: Duration) -> Duration {
    let cap = max.as_secs().max(1);
    let secs = 2u64.saturating_pow(attempt).min(cap);
    let jitter = rand::thread_rng().gen_range(0..=250);
    Duration::from_secs(secs) + Duration::from_millis(jitter)
}
