//! Call metadata persistence
//!
//! One best-effort write per call at shutdown: identifiers plus the latency
//! markers, keyed by call sid. Failures are logged by the caller and never
//! propagate; by the time this runs both sockets are already closing.

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::session::latency::LatencyMarkers;

/// The record written once per call.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub stream_id: String,
    pub agent_id: String,
    pub conversation_id: String,
    pub timing: LatencyMarkers,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("metadata request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("metadata store returned status {0}")]
    Status(reqwest::StatusCode),
}

/// Destination for call records. Implementations must be best-effort: the
/// session awaits the write but only ever logs a failure.
#[async_trait]
pub trait MetadataSink: Send + Sync {
    async fn persist(&self, call_id: &str, record: &CallRecord) -> Result<(), PersistError>;
}

/// HTTP metadata store: `PUT {base}/calls/{call_id}` with the record as JSON.
pub struct HttpMetadataSink {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMetadataSink {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl MetadataSink for HttpMetadataSink {
    async fn persist(&self, call_id: &str, record: &CallRecord) -> Result<(), PersistError> {
        let url = format!("{}/calls/{}", self.base_url, call_id);
        let response = self.client.put(&url).json(record).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PersistError::Status(status));
        }
        Ok(())
    }
}

/// Sink used when no metadata store is configured.
pub struct NoopMetadataSink;

#[async_trait]
impl MetadataSink for NoopMetadataSink {
    async fn persist(&self, call_id: &str, _record: &CallRecord) -> Result<(), PersistError> {
        debug!(call_id, "no metadata store configured, dropping call record");
        Ok(())
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemoryMetadataSink {
    records: parking_lot::Mutex<Vec<(String, CallRecord)>>,
}

impl MemoryMetadataSink {
    pub fn records(&self) -> Vec<(String, CallRecord)> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl MetadataSink for MemoryMetadataSink {
    async fn persist(&self, call_id: &str, record: &CallRecord) -> Result<(), PersistError> {
        self.records
            .lock()
            .push((call_id.to_string(), record.clone()));
        Ok(())
    }
}
