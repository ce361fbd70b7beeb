use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::api::SharedState;
use super::models::*;

// ── WebSocket message types ──────────────────────────────────────────

/// Frames pushed to clients: `{"type": "<kind>", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum WsMessage {
    ConnectionEstablished {
        client_id: String,
    },
    InitialData {
        company_id: i64,
        available_tabs: Vec<String>,
        tasks: Vec<TaskSummary>,
    },
    TaskCreated {
        task_id: i64,
        company_id: i64,
        task_type: TaskType,
        progress: u8,
        status: TaskStatus,
    },
    TaskUpdated {
        task_id: i64,
        company_id: i64,
        progress: u8,
        status: TaskStatus,
    },
    CompanyTabsUpdated {
        company_id: i64,
        available_tabs: Vec<String>,
    },
}

impl WsMessage {
    /// The wire name of this message's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection_established",
            Self::InitialData { .. } => "initial_data",
            Self::TaskCreated { .. } => "task_created",
            Self::TaskUpdated { .. } => "task_updated",
            Self::CompanyTabsUpdated { .. } => "company_tabs_updated",
        }
    }

    pub fn task_updated(task: &Task) -> Self {
        Self::TaskUpdated {
            task_id: task.id,
            company_id: task.company_id,
            progress: task.progress,
            status: task.status,
        }
    }

    pub fn task_created(task: &Task) -> Self {
        Self::TaskCreated {
            task_id: task.id,
            company_id: task.company_id,
            task_type: task.task_type,
            progress: task.progress,
            status: task.status,
        }
    }

    pub fn company_tabs_updated(company: &Company) -> Self {
        Self::CompanyTabsUpdated {
            company_id: company.id,
            available_tabs: company.available_tabs.clone(),
        }
    }
}

// ── Broadcaster ──────────────────────────────────────────────────────

/// Best-effort fan-out of serialized frames to every open socket.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<String>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Serialize and send a message to all current subscribers.
    /// Returns how many subscribers it was queued for; never fails.
    pub fn publish(&self, msg: &WsMessage) -> usize {
        match serde_json::to_string(msg) {
            Ok(json) => match self.tx.send(json) {
                Ok(n) => {
                    debug!(kind = msg.kind(), receivers = n, "broadcast message");
                    n
                }
                // No receivers connected
                Err(_) => 0,
            },
            Err(e) => {
                warn!(kind = msg.kind(), error = %e, "failed to serialize WsMessage");
                0
            }
        }
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub company_id: Option<i64>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.company_id))
}

async fn handle_socket(socket: WebSocket, state: SharedState, company_id: Option<i64>) {
    let (mut sender, receiver) = socket.split();
    // Subscribe before the greeting so nothing published in between is lost.
    let rx = state.service.broadcaster().subscribe();

    let client_id = uuid::Uuid::new_v4().to_string();
    debug!(%client_id, ?company_id, "websocket client connected");

    let hello = WsMessage::ConnectionEstablished {
        client_id: client_id.clone(),
    };
    if send_message(&mut sender, &hello).await.is_err() {
        return;
    }

    if let Some(company_id) = company_id {
        match state.service.initial_data(company_id).await {
            Ok(msg) => {
                if send_message(&mut sender, &msg).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!(%client_id, company_id, error = %e, "skipping initial_data"),
        }
    }

    let keepalive = Keepalive {
        ping_interval: state.websocket.ping_interval(),
        pong_timeout: state.websocket.pong_timeout(),
    };
    run_socket_loop(sender, receiver, rx, keepalive).await;
    debug!(%client_id, "websocket client disconnected");
}

async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    msg: &WsMessage,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(msg).map_err(axum::Error::new)?;
    sender.send(Message::Text(json.into())).await
}

#[derive(Debug, Clone, Copy)]
struct Keepalive {
    ping_interval: Duration,
    pong_timeout: Duration,
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines broadcast forwarding, client message receiving, and periodic
/// ping/pong health checking into a single select loop. If no Pong is
/// received within the pong timeout after a Ping is sent, the connection
/// is considered dead and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
    keepalive: Keepalive,
) {
    let mut ping_interval = tokio::time::interval(keepalive.ping_interval);
    // The first tick completes immediately; consume it so the first real
    // ping fires after one full interval.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > keepalive.pong_timeout {
                    debug!("pong timeout, closing websocket");
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "websocket subscriber lagged");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

// ── Tests ────────────────────────────────────────────────────────────
