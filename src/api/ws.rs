use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::application::events::Event;
use crate::state::AppContext;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Only forward events of this repository.
    repository_id: Option<i64>,
}

/// `GET /ws?repository_id=` - notification stream as JSON text frames
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<AppContext>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let events = ctx.subscribe_events();
    ws.on_upgrade(move |socket| handle_socket(socket, events, query.repository_id))
}

fn wants(event: &Event, repository_id: Option<i64>) -> bool {
    repository_id.map_or(true, |id| event.repository_id() == id)
}

async fn handle_socket(socket: WebSocket, mut events: broadcast::Receiver<Event>, repository_id: Option<i64>) {
    let (mut sender, mut receiver) = socket.split();
    info!("WebSocket client connected (repository filter: {:?})", repository_id);

    // Forward bus events to the client
    let mut send_task = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("WebSocket client lagged, {} events dropped", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if !wants(&event, repository_id) {
                continue;
            }

            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to serialize event: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Drain client frames until it closes; the stream is one-way
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Close(_) => break,
                other => debug!("Ignoring client frame: {:?}", other),
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    info!("WebSocket client disconnected");
}
