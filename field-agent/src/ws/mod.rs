//! Event streaming for local clients.
//!
//! Supervisor callbacks are bridged into [`AgentEvent`]s on an [`EventBus`]
//! and streamed to every client connected to `GET /ws`. Clients may send
//! back a small set of [`WsCommand`]s to control the sync task.

pub mod bridge;
pub mod handler;

pub use bridge::{MountNotifier, SyncNotifier, SyncTotals};

use crate::api::status::StatusReport;
use crate::mount::MountReport;
use crate::supervisor::SupervisorState;
use crate::transfer::SyncResult;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Maximum number of queued messages per subscriber
const BROADCAST_CAPACITY: usize = 1000;

/// Events sent from the agent to connected clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum AgentEvent {
    #[serde(rename = "sync:started")]
    SyncStarted,

    #[serde(rename = "sync:completed")]
    SyncCompleted(SyncResult),

    #[serde(rename = "sync:failed")]
    SyncFailed { reason: String },

    /// A failed run will be retried after `delay_secs`
    #[serde(rename = "task:retry")]
    RetryScheduled {
        task: String,
        attempt: u32,
        max_attempts: u32,
        delay_secs: f64,
    },

    #[serde(rename = "task:state")]
    StateChanged { task: String, state: SupervisorState },

    #[serde(rename = "mount:lost")]
    MountLost,

    #[serde(rename = "mount:recovered")]
    MountRecovered,

    #[serde(rename = "mount:checked")]
    MountChecked(MountReport),

    #[serde(rename = "agent:status")]
    Status(StatusReport),
}

/// Commands received from clients
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WsCommand {
    #[serde(rename = "sync:trigger")]
    TriggerSync,

    #[serde(rename = "sync:pause")]
    PauseSync,

    #[serde(rename = "sync:resume")]
    ResumeSync,

    /// Restart a stopped sync task, including one halted in `error`.
    #[serde(rename = "sync:start")]
    StartSync,

    #[serde(rename = "agent:status")]
    GetStatus,
}

/// Broadcast channel shared by the event bridges and WebSocket clients.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Send an event to all subscribers. Having none is not an error.
    pub fn publish(&self, event: AgentEvent) {
        match self.tx.send(event) {
            Ok(count) => debug!("Published event to {} subscriber(s)", count),
            Err(_) => debug!("Event dropped, no subscribers"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<crate::api::AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state))
}

async fn handle_socket(socket: WebSocket, state: crate::api::AppState) {
    info!("New WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.events.subscribe();

    let mut send_task = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("WebSocket client lagged, {} event(s) dropped", missed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to serialize event: {:?}", e);
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                match serde_json::from_str::<WsCommand>(&text) {
                    Ok(command) => handler::handle_command(command, &state).await,
                    Err(e) => warn!("Failed to parse WebSocket command: {:?}", e),
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("WebSocket client disconnected");
}
