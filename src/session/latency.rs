//! Per-call latency markers
//!
//! Six wall-clock timestamps capturing the first occurrence of each milestone
//! in a call. Each marker is set at most once; later attempts are no-ops, so
//! the record always describes the first inbound frame, first backend audio,
//! and so on.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Call milestones, in the order they occur on a healthy call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    StreamStarted,
    FirstInboundAudio,
    BackendConnected,
    FirstBackendAudio,
    FirstOutboundAudio,
    StreamEnded,
}

/// Milestone timestamps in unix epoch milliseconds.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LatencyMarkers {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_started: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_inbound_audio: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_connected: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_backend_audio: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_outbound_audio: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_ended: Option<u64>,
}

impl LatencyMarkers {
    /// Record `marker` now unless it was already recorded.
    pub fn mark(&mut self, marker: Marker) {
        self.mark_at(marker, now_unix_ms());
    }

    /// Record `marker` at an explicit timestamp unless already recorded.
    pub fn mark_at(&mut self, marker: Marker, at_ms: u64) {
        let slot = self.slot(marker);
        if slot.is_none() {
            *slot = Some(at_ms);
        }
    }

    pub fn get(&self, marker: Marker) -> Option<u64> {
        *match marker {
            Marker::StreamStarted => &self.stream_started,
            Marker::FirstInboundAudio => &self.first_inbound_audio,
            Marker::BackendConnected => &self.backend_connected,
            Marker::FirstBackendAudio => &self.first_backend_audio,
            Marker::FirstOutboundAudio => &self.first_outbound_audio,
            Marker::StreamEnded => &self.stream_ended,
        }
    }

    fn slot(&mut self, marker: Marker) -> &mut Option<u64> {
        match marker {
            Marker::StreamStarted => &mut self.stream_started,
            Marker::FirstInboundAudio => &mut self.first_inbound_audio,
            Marker::BackendConnected => &mut self.backend_connected,
            Marker::FirstBackendAudio => &mut self.first_backend_audio,
            Marker::FirstOutboundAudio => &mut self.first_outbound_audio,
            Marker::StreamEnded => &mut self.stream_ended,
        }
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
