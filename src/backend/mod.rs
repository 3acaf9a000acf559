//! Conversational backend leg
//!
//! One backend connection per call: the connector trades the configured API
//! key for a signed WebSocket URL, opens the socket, and hands the session a
//! [`BackendHandle`] for outbound events while server events arrive on the
//! session's event channel.

pub mod connector;
pub mod messages;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use connector::{BackendConnector, ConnectorError, SignedUrlConnector};
pub use messages::{ClientEvent, ServerEvent, parse_output_sample_rate};

/// Events delivered to the session's event loop for the backend leg.
#[derive(Debug)]
pub enum BackendEvent {
    /// The backend socket is open and the handshake has been queued.
    Connected(BackendHandle),
    /// The credential fetch or socket open failed; the session shuts down.
    ConnectFailed(String),
    /// A parsed protocol event from the backend.
    Server(ServerEvent),
    /// The backend socket closed or errored. The session clears its handle
    /// but keeps running until the telephony side ends.
    Closed,
}

/// Write half of an open backend connection.
///
/// Dropping the handle closes the connection: the writer task observes the
/// channel closing, sends a close frame, and the reader drains to completion.
#[derive(Debug)]
pub struct BackendHandle {
    tx: mpsc::Sender<ClientEvent>,
    writer: Option<JoinHandle<()>>,
}

impl BackendHandle {
    pub fn new(tx: mpsc::Sender<ClientEvent>, writer: Option<JoinHandle<()>>) -> Self {
        Self { tx, writer }
    }

    /// Queue an event for the backend socket.
    pub async fn send(&self, event: ClientEvent) -> Result<(), ConnectorError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| ConnectorError::ChannelClosed)
    }

    /// Close the backend connection. Close errors on an already-dead socket
    /// are swallowed by the writer task.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        // The writer exits on its own once the sender side is gone; detach it.
        self.writer.take();
    }
}
