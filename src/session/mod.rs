//! Per-call session state machine
//!
//! One `Session` per telephony connection, owned by its connection task and
//! mutated only by its own event handlers: the connection loop feeds it
//! telephony messages and backend events one at a time, so no locking is
//! needed inside the session. It translates audio both directions, buffers
//! inbound chunks while the backend leg is still connecting (bounded,
//! drop-newest), answers backend keepalives, relays barge-in as a telephony
//! `clear`, and persists timing metadata once on shutdown.

pub mod latency;

use std::collections::VecDeque;
use std::sync::Arc;

use base64::prelude::*;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::audio;
use crate::backend::{
    BackendConnector, BackendEvent, BackendHandle, ClientEvent, ServerEvent,
    parse_output_sample_rate,
};
use crate::config::{BridgeConfig, TELEPHONY_SAMPLE_RATE};
use crate::persist::{CallRecord, MetadataSink};
use crate::telephony::{TelephonyMessage, TelephonyOutgoing, TelephonyRoute};

use latency::{LatencyMarkers, Marker};

/// Session lifecycle. `ShuttingDown`/`Closed` double as the idempotence guard
/// for [`Session::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no `start` event yet.
    Initializing,
    /// `start` received; backend connection in progress or established.
    Streaming,
    ShuttingDown,
    Closed,
}

/// The per-call state machine.
pub struct Session {
    id: Uuid,
    config: Arc<BridgeConfig>,
    connector: Arc<dyn BackendConnector>,
    metadata: Arc<dyn MetadataSink>,

    /// Writer channel for the telephony socket.
    telephony_tx: mpsc::Sender<TelephonyRoute>,
    /// Event channel handed to the connector; backend events come back on
    /// the receiving side owned by the connection loop.
    backend_tx: mpsc::Sender<BackendEvent>,

    state: SessionState,
    stream_sid: String,
    call_sid: String,
    agent_id: String,
    conversation_id: String,
    /// Backend output rate, parsed from the initiation metadata.
    output_sample_rate: u32,

    /// Transcoded base64 PCM chunks awaiting an open backend socket.
    /// FIFO; bounded by `config.max_pending_chunks`; never appended while
    /// a backend handle is held.
    pending: VecDeque<String>,
    markers: LatencyMarkers,
    backend: Option<BackendHandle>,
}

impl Session {
    pub fn new(
        id: Uuid,
        config: Arc<BridgeConfig>,
        connector: Arc<dyn BackendConnector>,
        metadata: Arc<dyn MetadataSink>,
        telephony_tx: mpsc::Sender<TelephonyRoute>,
        backend_tx: mpsc::Sender<BackendEvent>,
    ) -> Self {
        let output_sample_rate = config.backend_input_sample_rate;
        Self {
            id,
            config,
            connector,
            metadata,
            telephony_tx,
            backend_tx,
            state: SessionState::Initializing,
            stream_sid: String::new(),
            call_sid: String::new(),
            agent_id: String::new(),
            conversation_id: String::new(),
            output_sample_rate,
            pending: VecDeque::new(),
            markers: LatencyMarkers::default(),
            backend: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn markers(&self) -> &LatencyMarkers {
        &self.markers
    }

    /// Handle one telephony event. Returns `false` once the connection loop
    /// should stop.
    pub async fn on_telephony(&mut self, message: TelephonyMessage) -> bool {
        match message {
            TelephonyMessage::Connected => {
                debug!(session_id = %self.id, "telephony handshake acknowledged");
                true
            }
            TelephonyMessage::Start { start } => self.handle_start(start).await,
            TelephonyMessage::Media { media } => {
                self.handle_inbound_media(media).await;
                true
            }
            TelephonyMessage::Stop { .. } => {
                info!(session_id = %self.id, stream_sid = %self.stream_sid, "stream stopped");
                self.markers.mark(Marker::StreamEnded);
                self.shutdown().await;
                false
            }
            TelephonyMessage::Ignored => {
                trace!(session_id = %self.id, "ignoring unhandled telephony event");
                true
            }
        }
    }

    async fn handle_start(&mut self, start: crate::telephony::StartInfo) -> bool {
        self.stream_sid = start.stream_sid;
        self.call_sid = start.call_sid;
        self.markers.mark(Marker::StreamStarted);

        self.agent_id = start
            .custom_parameters
            .get("agentId")
            .cloned()
            .or_else(|| self.config.default_agent_id.clone())
            .unwrap_or_default();

        if let Some(expected) = &self.config.auth_token {
            let supplied = start
                .custom_parameters
                .get("token")
                .map(String::as_str)
                .unwrap_or("");
            if supplied != expected {
                warn!(
                    session_id = %self.id,
                    call_sid = %self.call_sid,
                    "rejecting stream with invalid auth token"
                );
                self.shutdown().await;
                return false;
            }
        }

        if self.config.backend_api_key.is_none() {
            error!(session_id = %self.id, "no backend API key configured, dropping call");
            self.shutdown().await;
            return false;
        }

        info!(
            session_id = %self.id,
            stream_sid = %self.stream_sid,
            call_sid = %self.call_sid,
            agent_id = %self.agent_id,
            "stream started, connecting backend"
        );
        self.state = SessionState::Streaming;

        // Connect without blocking the event loop; the result arrives as a
        // backend event. Inbound audio queues until then.
        let connector = self.connector.clone();
        let events = self.backend_tx.clone();
        let agent_id = self.agent_id.clone();
        tokio::spawn(async move {
            if let Err(e) = connector.connect(&agent_id, events.clone()).await {
                let _ = events.send(BackendEvent::ConnectFailed(e.to_string())).await;
            }
        });
        true
    }

    async fn handle_inbound_media(&mut self, media: crate::telephony::MediaInfo) {
        if media.track.as_deref().is_some_and(|track| track != "inbound") {
            return;
        }
        self.markers.mark(Marker::FirstInboundAudio);

        let mulaw = match BASE64_STANDARD.decode(&media.payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(session_id = %self.id, "discarding undecodable media payload: {e}");
                return;
            }
        };

        let samples = audio::decode_mulaw(&mulaw);
        let resampled = audio::resample_linear(
            samples,
            TELEPHONY_SAMPLE_RATE,
            self.config.backend_input_sample_rate,
        );
        let chunk = BASE64_STANDARD.encode(audio::pcm_to_le_bytes(&resampled));

        if let Some(backend) = &self.backend {
            if backend.send(ClientEvent::audio_chunk(chunk)).await.is_err() {
                warn!(session_id = %self.id, "backend send failed, clearing connection");
                self.backend = None;
            }
        } else if self.pending.len() < self.config.max_pending_chunks {
            self.pending.push_back(chunk);
        } else {
            // Queue full: favor bounded memory and freshness, drop the newest.
            trace!(session_id = %self.id, "pending audio queue full, dropping chunk");
        }
    }

    /// Handle one backend event. Returns `false` once the connection loop
    /// should stop.
    pub async fn on_backend(&mut self, event: BackendEvent) -> bool {
        match event {
            BackendEvent::Connected(handle) => {
                self.markers.mark(Marker::BackendConnected);
                info!(
                    session_id = %self.id,
                    queued_chunks = self.pending.len(),
                    "backend connected"
                );
                // Drain buffered audio in arrival order before storing the
                // handle; new inbound audio then goes direct.
                let mut failed = false;
                for chunk in self.pending.drain(..) {
                    if handle.send(ClientEvent::audio_chunk(chunk)).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    warn!(session_id = %self.id, "backend closed while flushing queued audio");
                    self.pending.clear();
                } else {
                    self.backend = Some(handle);
                }
                true
            }
            BackendEvent::ConnectFailed(reason) => {
                error!(session_id = %self.id, %reason, "backend connect failed");
                self.shutdown().await;
                false
            }
            BackendEvent::Server(event) => {
                self.handle_server_event(event).await;
                true
            }
            BackendEvent::Closed => {
                // Not fatal for the call: keep accepting telephony audio
                // (it queues, subject to the drop policy) until the
                // telephony side ends.
                warn!(session_id = %self.id, "backend socket closed");
                self.backend = None;
                true
            }
        }
    }

    async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::ConversationInitiationMetadata {
                conversation_initiation_metadata_event: meta,
            } => {
                self.conversation_id = meta.conversation_id;
                self.output_sample_rate = meta
                    .agent_output_audio_format
                    .as_deref()
                    .and_then(parse_output_sample_rate)
                    .unwrap_or(self.config.backend_input_sample_rate);
                info!(
                    session_id = %self.id,
                    conversation_id = %self.conversation_id,
                    output_sample_rate = self.output_sample_rate,
                    "conversation initiated"
                );
            }

            ServerEvent::Ping { ping_event } => {
                // Keepalive contract: reply immediately, never behind audio work.
                if let Some(backend) = &self.backend
                    && backend
                        .send(ClientEvent::pong(ping_event.event_id))
                        .await
                        .is_err()
                {
                    warn!(session_id = %self.id, "backend send failed, clearing connection");
                    self.backend = None;
                }
            }

            ServerEvent::Interruption => {
                debug!(session_id = %self.id, "barge-in, clearing telephony playback buffer");
                let _ = self
                    .telephony_tx
                    .send(TelephonyRoute::Outgoing(TelephonyOutgoing::Clear {
                        stream_sid: self.stream_sid.clone(),
                    }))
                    .await;
            }

            ServerEvent::Audio { audio_event } => {
                self.markers.mark(Marker::FirstBackendAudio);
                let pcm = match BASE64_STANDARD.decode(&audio_event.audio_base_64) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(session_id = %self.id, "discarding undecodable backend audio: {e}");
                        return;
                    }
                };
                let samples = audio::pcm_from_le_bytes(&pcm);
                let resampled = audio::resample_linear(
                    samples,
                    self.output_sample_rate,
                    TELEPHONY_SAMPLE_RATE,
                );
                let payload = BASE64_STANDARD.encode(audio::encode_mulaw(&resampled));
                let sent = self
                    .telephony_tx
                    .send(TelephonyRoute::Outgoing(TelephonyOutgoing::Media {
                        stream_sid: self.stream_sid.clone(),
                        media: crate::telephony::OutboundMedia { payload },
                    }))
                    .await;
                if sent.is_ok() {
                    self.markers.mark(Marker::FirstOutboundAudio);
                }
            }

            ServerEvent::Ignored => {
                trace!(session_id = %self.id, "ignoring unhandled backend event");
            }
        }
    }

    /// Tear down both legs and persist call metadata. Safe to call any number
    /// of times; only the first call does anything.
    pub async fn shutdown(&mut self) {
        if matches!(self.state, SessionState::ShuttingDown | SessionState::Closed) {
            return;
        }
        self.state = SessionState::ShuttingDown;
        info!(session_id = %self.id, call_sid = %self.call_sid, "shutting down session");

        if let Some(handle) = self.backend.take() {
            handle.close();
        }

        // Persist before closing the telephony socket so the record exists by
        // the time the peer observes the close. Best effort; a session that
        // never saw `start` has nothing to key on.
        if !self.call_sid.is_empty() {
            let record = CallRecord {
                stream_id: self.stream_sid.clone(),
                agent_id: self.agent_id.clone(),
                conversation_id: self.conversation_id.clone(),
                timing: self.markers.clone(),
            };
            if let Err(e) = self.metadata.persist(&self.call_sid, &record).await {
                error!(session_id = %self.id, "failed to persist call metadata: {e}");
            }
        }

        let _ = self.telephony_tx.send(TelephonyRoute::Close).await;
        self.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::backend::ConnectorError;
    use crate::persist::{MemoryMetadataSink, PersistError};
    use crate::telephony::{MediaInfo, StartInfo};

    /// Connector that hands out a detached handle feeding `client_tx`.
    struct MockConnector {
        calls: AtomicUsize,
        client_tx: mpsc::Sender<ClientEvent>,
    }

    #[async_trait]
    impl BackendConnector for MockConnector {
        async fn connect(
            &self,
            _agent_id: &str,
            events: mpsc::Sender<BackendEvent>,
        ) -> Result<(), ConnectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let handle = BackendHandle::new(self.client_tx.clone(), None);
            events
                .send(BackendEvent::Connected(handle))
                .await
                .map_err(|_| ConnectorError::ChannelClosed)
        }
    }

    /// Connector whose connect call never completes the backend leg.
    struct PendingConnector {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BackendConnector for PendingConnector {
        async fn connect(
            &self,
            _agent_id: &str,
            _events: mpsc::Sender<BackendEvent>,
        ) -> Result<(), ConnectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        session: Session,
        telephony_rx: mpsc::Receiver<TelephonyRoute>,
        backend_rx: mpsc::Receiver<BackendEvent>,
        client_rx: mpsc::Receiver<ClientEvent>,
        connector_calls: Arc<dyn Fn() -> usize + Send + Sync>,
        metadata: Arc<MemoryMetadataSink>,
    }

    fn harness_with(config: BridgeConfig, pending_connector: bool) -> Harness {
        let (telephony_tx, telephony_rx) = mpsc::channel(64);
        let (backend_tx, backend_rx) = mpsc::channel(64);
        let (client_tx, client_rx) = mpsc::channel(64);
        let metadata = Arc::new(MemoryMetadataSink::default());

        let (connector, connector_calls): (
            Arc<dyn BackendConnector>,
            Arc<dyn Fn() -> usize + Send + Sync>,
        ) = if pending_connector {
            let c = Arc::new(PendingConnector {
                calls: AtomicUsize::new(0),
            });
            let probe = c.clone();
            (c, Arc::new(move || probe.calls.load(Ordering::SeqCst)))
        } else {
            let c = Arc::new(MockConnector {
                calls: AtomicUsize::new(0),
                client_tx,
            });
            let probe = c.clone();
            (c, Arc::new(move || probe.calls.load(Ordering::SeqCst)))
        };

        let session = Session::new(
            Uuid::new_v4(),
            Arc::new(config),
            connector,
            metadata.clone(),
            telephony_tx,
            backend_tx,
        );
        Harness {
            session,
            telephony_rx,
            backend_rx,
            client_rx,
            connector_calls,
            metadata,
        }
    }

    fn harness() -> Harness {
        harness_with(test_config(), false)
    }

    fn test_config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.backend_api_key = Some("test-key".to_string());
        config.default_agent_id = Some("agent_default".to_string());
        config.max_pending_chunks = 4;
        config
    }

    fn start_message(params: &[(&str, &str)]) -> TelephonyMessage {
        TelephonyMessage::Start {
            start: StartInfo {
                stream_sid: "MZ123".to_string(),
                call_sid: "CA456".to_string(),
                custom_parameters: params
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        }
    }

    fn media_message(payload: &str) -> TelephonyMessage {
        TelephonyMessage::Media {
            media: MediaInfo {
                track: Some("inbound".to_string()),
                payload: payload.to_string(),
            },
        }
    }

    /// 160 bytes of mu-law silence, base64 encoded.
    fn silence_payload() -> String {
        BASE64_STANDARD.encode(vec![0xFFu8; 160])
    }

    async fn connect_backend(h: &mut Harness) {
        assert!(h.session.on_telephony(start_message(&[])).await);
        let event = h.backend_rx.recv().await.expect("connected event");
        assert!(matches!(event, BackendEvent::Connected(_)));
        assert!(h.session.on_backend(event).await);
    }

    #[tokio::test]
    async fn test_start_connects_backend() {
        let mut h = harness();
        connect_backend(&mut h).await;
        assert_eq!((h.connector_calls)(), 1);
        assert_eq!(h.session.state(), SessionState::Streaming);
        assert!(h.session.markers().get(Marker::StreamStarted).is_some());
        assert!(h.session.markers().get(Marker::BackendConnected).is_some());
    }

    #[tokio::test]
    async fn test_start_resolves_agent_from_parameters() {
        let mut h = harness();
        assert!(
            h.session
                .on_telephony(start_message(&[("agentId", "agent_custom")]))
                .await
        );
        assert_eq!(h.session.agent_id, "agent_custom");
    }

    #[tokio::test]
    async fn test_start_falls_back_to_default_agent() {
        let mut h = harness();
        assert!(h.session.on_telephony(start_message(&[])).await);
        assert_eq!(h.session.agent_id, "agent_default");
    }

    #[tokio::test]
    async fn test_wrong_token_shuts_down_without_connect() {
        let mut config = test_config();
        config.auth_token = Some("secret".to_string());
        let mut h = harness_with(config, false);
        assert!(
            !h.session
                .on_telephony(start_message(&[("token", "wrong")]))
                .await
        );
        assert_eq!((h.connector_calls)(), 0);
        assert_eq!(h.session.state(), SessionState::Closed);
        // Only stream-started was recorded before the rejection.
        assert!(h.session.markers().get(Marker::StreamStarted).is_some());
        assert!(h.session.markers().get(Marker::StreamEnded).is_none());
        assert_eq!(h.metadata.records().len(), 1);
    }

    #[tokio::test]
    async fn test_correct_token_connects() {
        let mut config = test_config();
        config.auth_token = Some("secret".to_string());
        let mut h = harness_with(config, false);
        assert!(
            h.session
                .on_telephony(start_message(&[("token", "secret")]))
                .await
        );
        let event = h.backend_rx.recv().await.expect("connected event");
        assert!(matches!(event, BackendEvent::Connected(_)));
        assert_eq!((h.connector_calls)(), 1);
    }

    #[tokio::test]
    async fn test_missing_api_key_shuts_down() {
        let mut config = test_config();
        config.backend_api_key = None;
        let mut h = harness_with(config, false);
        assert!(!h.session.on_telephony(start_message(&[])).await);
        assert_eq!((h.connector_calls)(), 0);
        assert_eq!(h.session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_media_queues_until_backend_connects() {
        let mut h = harness_with(test_config(), true);
        assert!(h.session.on_telephony(start_message(&[])).await);
        assert!(h.session.on_telephony(media_message(&silence_payload())).await);
        assert_eq!(h.session.pending.len(), 1);
        assert!(h.session.markers().get(Marker::FirstInboundAudio).is_some());
    }

    #[tokio::test]
    async fn test_pending_queue_is_bounded() {
        let mut h = harness_with(test_config(), true);
        assert!(h.session.on_telephony(start_message(&[])).await);
        for _ in 0..10 {
            assert!(h.session.on_telephony(media_message(&silence_payload())).await);
        }
        // max_pending_chunks is 4; overflow is a silent no-op.
        assert_eq!(h.session.pending.len(), 4);
    }

    #[tokio::test]
    async fn test_queued_audio_flushes_in_order_on_connect() {
        let mut h = harness_with(test_config(), true);
        assert!(h.session.on_telephony(start_message(&[])).await);

        let first = BASE64_STANDARD.encode(vec![0xFFu8; 2]);
        let second = BASE64_STANDARD.encode(vec![0x80u8; 2]);
        assert!(h.session.on_telephony(media_message(&first)).await);
        assert!(h.session.on_telephony(media_message(&second)).await);

        let (client_tx, mut client_rx) = mpsc::channel(16);
        let handle = BackendHandle::new(client_tx, None);
        assert!(h.session.on_backend(BackendEvent::Connected(handle)).await);

        assert!(h.session.pending.is_empty());
        let flushed_first = client_rx.recv().await.expect("first chunk");
        let flushed_second = client_rx.recv().await.expect("second chunk");
        assert!(matches!(flushed_first, ClientEvent::AudioChunk { .. }));
        assert_ne!(flushed_first, flushed_second);
        // Direct sends after connect skip the queue entirely.
        assert!(h.session.on_telephony(media_message(&first)).await);
        assert!(h.session.pending.is_empty());
        assert!(client_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_non_inbound_track_ignored() {
        let mut h = harness_with(test_config(), true);
        assert!(h.session.on_telephony(start_message(&[])).await);
        let message = TelephonyMessage::Media {
            media: MediaInfo {
                track: Some("outbound".to_string()),
                payload: silence_payload(),
            },
        };
        assert!(h.session.on_telephony(message).await);
        assert!(h.session.pending.is_empty());
        assert!(h.session.markers().get(Marker::FirstInboundAudio).is_none());
    }

    #[tokio::test]
    async fn test_inbound_media_is_transcoded_and_resampled() {
        let mut h = harness();
        connect_backend(&mut h).await;

        // 200 mu-law bytes at 8kHz resample to exactly 400 samples at 16kHz.
        let payload = BASE64_STANDARD.encode(vec![0xFFu8; 200]);
        assert!(h.session.on_telephony(media_message(&payload)).await);
        match h.client_rx.recv().await.expect("audio chunk") {
            ClientEvent::AudioChunk { user_audio_chunk } => {
                let pcm = BASE64_STANDARD.decode(user_audio_chunk).unwrap();
                assert_eq!(pcm.len(), 400 * 2);
            }
            other => panic!("expected audio chunk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ping_answered_with_matching_pong() {
        let mut h = harness();
        connect_backend(&mut h).await;

        let ping: ServerEvent =
            serde_json::from_str(r#"{"type":"ping","ping_event":{"event_id":42}}"#).unwrap();
        assert!(h.session.on_backend(BackendEvent::Server(ping)).await);
        let reply = h.client_rx.recv().await.expect("pong");
        assert_eq!(reply, ClientEvent::pong(42));
    }

    #[tokio::test]
    async fn test_interruption_sends_clear() {
        let mut h = harness();
        connect_backend(&mut h).await;

        assert!(
            h.session
                .on_backend(BackendEvent::Server(ServerEvent::Interruption))
                .await
        );
        match h.telephony_rx.recv().await.expect("clear event") {
            TelephonyRoute::Outgoing(TelephonyOutgoing::Clear { stream_sid }) => {
                assert_eq!(stream_sid, "MZ123");
            }
            other => panic!("expected clear, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_backend_audio_relayed_as_telephony_media() {
        let mut h = harness();
        connect_backend(&mut h).await;

        // Four 16kHz samples downsample to two mu-law bytes at 8kHz.
        let pcm = audio::pcm_to_le_bytes(&[1000i16, 1000, -1000, -1000]);
        let event: ServerEvent = serde_json::from_str(&format!(
            r#"{{"type":"audio","audio_event":{{"audio_base_64":"{}","event_id":1}}}}"#,
            BASE64_STANDARD.encode(pcm)
        ))
        .unwrap();
        assert!(h.session.on_backend(BackendEvent::Server(event)).await);

        match h.telephony_rx.recv().await.expect("media event") {
            TelephonyRoute::Outgoing(TelephonyOutgoing::Media { stream_sid, media }) => {
                assert_eq!(stream_sid, "MZ123");
                let mulaw = BASE64_STANDARD.decode(media.payload).unwrap();
                assert_eq!(mulaw.len(), 2);
            }
            other => panic!("expected media, got {other:?}"),
        }
        assert!(h.session.markers().get(Marker::FirstBackendAudio).is_some());
        assert!(h.session.markers().get(Marker::FirstOutboundAudio).is_some());
    }

    #[tokio::test]
    async fn test_initiation_metadata_sets_conversation_and_rate() {
        let mut h = harness();
        connect_backend(&mut h).await;

        let event: ServerEvent = serde_json::from_str(
            r#"{"type":"conversation_initiation_metadata",
                "conversation_initiation_metadata_event":{
                    "conversation_id":"conv_9",
                    "agent_output_audio_format":"pcm_22050"}}"#,
        )
        .unwrap();
        assert!(h.session.on_backend(BackendEvent::Server(event)).await);
        assert_eq!(h.session.conversation_id, "conv_9");
        assert_eq!(h.session.output_sample_rate, 22050);
    }

    #[tokio::test]
    async fn test_unparseable_output_format_falls_back() {
        let mut h = harness();
        connect_backend(&mut h).await;

        let event: ServerEvent = serde_json::from_str(
            r#"{"type":"conversation_initiation_metadata",
                "conversation_initiation_metadata_event":{
                    "conversation_id":"conv_9",
                    "agent_output_audio_format":"opus"}}"#,
        )
        .unwrap();
        assert!(h.session.on_backend(BackendEvent::Server(event)).await);
        assert_eq!(
            h.session.output_sample_rate,
            h.session.config.backend_input_sample_rate
        );
    }

    #[tokio::test]
    async fn test_backend_close_keeps_session_alive_and_requeues() {
        let mut h = harness();
        connect_backend(&mut h).await;

        assert!(h.session.on_backend(BackendEvent::Closed).await);
        assert_eq!(h.session.state(), SessionState::Streaming);
        // Audio buffers again now that the backend reference is gone.
        assert!(h.session.on_telephony(media_message(&silence_payload())).await);
        assert_eq!(h.session.pending.len(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_shuts_down() {
        let mut h = harness();
        assert!(h.session.on_telephony(start_message(&[])).await);
        assert!(
            !h.session
                .on_backend(BackendEvent::ConnectFailed("credential fetch failed".into()))
                .await
        );
        assert_eq!(h.session.state(), SessionState::Closed);
        assert_eq!(h.metadata.records().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_persists_metadata() {
        let mut h = harness();
        connect_backend(&mut h).await;

        let stop: TelephonyMessage =
            serde_json::from_str(r#"{"event":"stop","stop":{"callSid":"CA456"}}"#).unwrap();
        assert!(!h.session.on_telephony(stop).await);

        let records = h.metadata.records();
        assert_eq!(records.len(), 1);
        let (call_id, record) = &records[0];
        assert_eq!(call_id, "CA456");
        assert_eq!(record.stream_id, "MZ123");
        assert_eq!(record.agent_id, "agent_default");
        assert!(record.timing.stream_ended.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let mut h = harness();
        connect_backend(&mut h).await;

        h.session.shutdown().await;
        h.session.shutdown().await;
        assert_eq!(h.session.state(), SessionState::Closed);
        assert_eq!(h.metadata.records().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_skips_persistence() {
        let mut h = harness();
        h.session.shutdown().await;
        assert_eq!(h.session.state(), SessionState::Closed);
        assert!(h.metadata.records().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_discarded() {
        let mut h = harness_with(test_config(), true);
        assert!(h.session.on_telephony(start_message(&[])).await);
        assert!(h.session.on_telephony(media_message("not base64!!")).await);
        assert!(h.session.pending.is_empty());
    }

    #[tokio::test]
    async fn test_record_persisted_before_close_frame() {
        // Sink that notes whether the telephony close frame was already
        // queued when the write ran; it must not be.
        struct OrderCheckingSink {
            telephony_rx: parking_lot::Mutex<mpsc::Receiver<TelephonyRoute>>,
            close_queued_at_persist: AtomicBool,
        }

        #[async_trait]
        impl MetadataSink for OrderCheckingSink {
            async fn persist(
                &self,
                _call_id: &str,
                _record: &CallRecord,
            ) -> Result<(), PersistError> {
                let queued = self.telephony_rx.lock().try_recv().is_ok();
                self.close_queued_at_persist.store(queued, Ordering::SeqCst);
                Ok(())
            }
        }

        let (telephony_tx, telephony_rx) = mpsc::channel(8);
        let (backend_tx, _backend_rx) = mpsc::channel(8);
        let sink = Arc::new(OrderCheckingSink {
            telephony_rx: parking_lot::Mutex::new(telephony_rx),
            close_queued_at_persist: AtomicBool::new(true),
        });

        let mut session = Session::new(
            Uuid::new_v4(),
            Arc::new(test_config()),
            Arc::new(PendingConnector {
                calls: AtomicUsize::new(0),
            }),
            sink.clone(),
            telephony_tx,
            backend_tx,
        );
        assert!(session.on_telephony(start_message(&[])).await);
        session.shutdown().await;

        assert!(!sink.close_queued_at_persist.load(Ordering::SeqCst));
        assert!(matches!(
            sink.telephony_rx.lock().try_recv(),
            Ok(TelephonyRoute::Close)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_telephony_socket() {
        let mut h = harness();
        connect_backend(&mut h).await;
        h.session.shutdown().await;
        assert!(matches!(
            h.telephony_rx.recv().await,
            Some(TelephonyRoute::Close)
        ));
    }
}
