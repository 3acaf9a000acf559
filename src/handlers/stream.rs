//! Telephony media-stream WebSocket handler
//!
//! Accepts the provider's duplex media stream, owns the per-call [`Session`],
//! and runs the connection event loop: telephony frames and backend events are
//! interleaved through a single `select!` so the session never needs locking.
//! Outgoing frames go through a dedicated sender task fed by a routing channel.

use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::BackendEvent;
use crate::session::Session;
use crate::state::AppState;
use crate::telephony::{TelephonyMessage, TelephonyRoute};

/// Channel buffer size sized for audio frame rates.
const CHANNEL_BUFFER_SIZE: usize = 1024;

/// How long to wait for the sender task to flush after shutdown.
const SENDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Media-stream WebSocket handler
///
/// Upgrades the HTTP connection to a WebSocket carrying the telephony
/// provider's media-stream protocol. One session is created per connection.
pub async fn stream_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    debug!("media stream connection upgrade requested");
    ws.on_upgrade(move |socket| handle_stream_socket(socket, state))
}

/// Run one media-stream connection to completion.
async fn handle_stream_socket(socket: WebSocket, state: Arc<AppState>) {
    let session_id = Uuid::new_v4();
    info!(%session_id, "media stream connection established");

    let (mut sender, mut receiver) = socket.split();
    let (telephony_tx, mut telephony_rx) = mpsc::channel::<TelephonyRoute>(CHANNEL_BUFFER_SIZE);

    // Sender task: the only writer to the telephony socket.
    let sender_task = tokio::spawn(async move {
        while let Some(route) = telephony_rx.recv().await {
            let result = match route {
                TelephonyRoute::Outgoing(message) => match serde_json::to_string(&message) {
                    Ok(json) => sender.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!("failed to serialize outgoing message: {e}");
                        continue;
                    }
                },
                TelephonyRoute::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            };

            if let Err(e) = result {
                error!("failed to send telephony message: {e}");
                break;
            }
        }
    });

    let (backend_tx, mut backend_rx) = mpsc::channel::<BackendEvent>(CHANNEL_BUFFER_SIZE);
    let mut session = Session::new(
        session_id,
        state.config.clone(),
        state.connector.clone(),
        state.metadata.clone(),
        telephony_tx,
        backend_tx.clone(),
    );

    loop {
        select! {
            msg_result = receiver.next() => {
                match msg_result {
                    Some(Ok(msg)) => {
                        if !process_telephony_frame(msg, &mut session).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(%session_id, "telephony websocket error: {e}");
                        break;
                    }
                    None => {
                        info!(%session_id, "telephony connection closed by peer");
                        break;
                    }
                }
            }
            Some(event) = backend_rx.recv() => {
                if !session.on_backend(event).await {
                    break;
                }
            }
        }
    }

    session.shutdown().await;

    // Let the sender flush the close frame, then abort if it is stuck.
    let abort = sender_task.abort_handle();
    if tokio::time::timeout(SENDER_DRAIN_TIMEOUT, sender_task)
        .await
        .is_err()
    {
        abort.abort();
    }

    info!(%session_id, "media stream connection terminated");
}

/// Dispatch one WebSocket frame into the session. Returns `false` when the
/// connection loop should stop.
async fn process_telephony_frame(msg: Message, session: &mut Session) -> bool {
    match msg {
        Message::Text(text) => {
            let message: TelephonyMessage = match serde_json::from_str(&text) {
                Ok(message) => message,
                Err(e) => {
                    warn!("discarding malformed telephony message: {e}");
                    return true;
                }
            };
            session.on_telephony(message).await
        }
        Message::Close(_) => {
            debug!("telephony close frame received");
            false
        }
        // The media-stream protocol is text-only; pings are answered by axum.
        _ => true,
    }
}
