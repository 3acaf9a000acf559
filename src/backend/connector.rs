//! Backend connection establishment
//!
//! A single HTTP call to the credential service exchanges the agent id and
//! API key for a short-lived signed WebSocket URL, then the socket is opened
//! and split into a writer task (client events out) and a reader task (server
//! events in). There is no retry and no reconnection: any failure is reported
//! once and the session decides what to do (it shuts down).

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, warn};

use super::messages::{ClientEvent, ServerEvent};
use super::{BackendEvent, BackendHandle};

/// Channel capacity for outbound client events.
const CLIENT_CHANNEL_CAPACITY: usize = 256;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Errors raised while establishing or using the backend leg.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("credential request failed: {0}")]
    CredentialRequest(#[from] reqwest::Error),

    #[error("credential service returned status {0}")]
    CredentialStatus(reqwest::StatusCode),

    #[error("signed url is not a websocket url: {0}")]
    InvalidSignedUrl(String),

    #[error("websocket connect failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("backend connection closed")]
    ChannelClosed,
}

/// Seam between the session state machine and the network.
///
/// `connect` delivers `BackendEvent::Connected` on the events channel before
/// any server event, so the session always learns about the handle first.
#[async_trait]
pub trait BackendConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        agent_id: &str,
        events: mpsc::Sender<BackendEvent>,
    ) -> Result<(), ConnectorError>;
}

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    signed_url: String,
}

/// Production connector: credential service over HTTP, backend over WSS.
pub struct SignedUrlConnector {
    http: reqwest::Client,
    credential_url: String,
    api_key: String,
}

impl SignedUrlConnector {
    pub fn new(http: reqwest::Client, credential_url: String, api_key: String) -> Self {
        Self {
            http,
            credential_url,
            api_key,
        }
    }

    /// Fetch a signed connection URL for `agent_id`.
    async fn fetch_signed_url(&self, agent_id: &str) -> Result<String, ConnectorError> {
        let response = self
            .http
            .get(&self.credential_url)
            .query(&[("agent_id", agent_id)])
            .header("xi-api-key", &self.api_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConnectorError::CredentialStatus(status));
        }

        let body: SignedUrlResponse = response.json().await?;

        // Reject anything that is not a websocket endpoint before dialing.
        let parsed = url::Url::parse(&body.signed_url)
            .map_err(|_| ConnectorError::InvalidSignedUrl(body.signed_url.clone()))?;
        if parsed.scheme() != "wss" && parsed.scheme() != "ws" {
            return Err(ConnectorError::InvalidSignedUrl(body.signed_url));
        }

        Ok(body.signed_url)
    }
}

#[async_trait]
impl BackendConnector for SignedUrlConnector {
    async fn connect(
        &self,
        agent_id: &str,
        events: mpsc::Sender<BackendEvent>,
    ) -> Result<(), ConnectorError> {
        let signed_url = self.fetch_signed_url(agent_id).await?;
        debug!(agent_id, "obtained signed backend url");

        let (ws, _response) = connect_async(&signed_url).await?;
        let (sink, stream) = ws.split();

        let (tx, rx) = mpsc::channel::<ClientEvent>(CLIENT_CHANNEL_CAPACITY);
        let writer = tokio::spawn(write_loop(rx, sink));

        // Handshake goes out ahead of anything the session queues.
        tx.send(ClientEvent::initiation())
            .await
            .map_err(|_| ConnectorError::ChannelClosed)?;

        let handle = BackendHandle::new(tx, Some(writer));
        if events.send(BackendEvent::Connected(handle)).await.is_err() {
            // Session is already gone; dropping the handle closed the socket.
            return Err(ConnectorError::ChannelClosed);
        }

        // Only start surfacing server events once Connected is delivered, so
        // the session never sees a ping before it holds the handle.
        tokio::spawn(read_loop(stream, events));
        Ok(())
    }
}

/// Serialize queued client events onto the socket; on channel close, attempt
/// a clean close handshake and swallow errors from an already-dead peer.
async fn write_loop(mut rx: mpsc::Receiver<ClientEvent>, mut sink: WsSink) {
    while let Some(event) = rx.recv().await {
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                error!("failed to serialize backend event: {e}");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(json.into())).await {
            error!("failed to send backend message: {e}");
            break;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

/// Parse incoming frames into server events for the session. Malformed JSON
/// is logged and discarded; the connection keeps running.
async fn read_loop(mut stream: WsStream, events: mpsc::Sender<BackendEvent>) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                Ok(event) => {
                    if events.send(BackendEvent::Server(event)).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!("discarding malformed backend message: {e}"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("backend websocket error: {e}");
                break;
            }
        }
    }
    let _ = events.send(BackendEvent::Closed).await;
}
