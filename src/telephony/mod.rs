//! Telephony media-stream protocol
//!
//! JSON events exchanged with the telephony provider over the inbound
//! WebSocket. The protocol is a closed set of variants; anything the bridge
//! does not handle (`mark`, `dtmf`, future additions) lands in the explicit
//! [`TelephonyMessage::Ignored`] arm instead of failing the session.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// =============================================================================
// Incoming Messages (telephony provider -> bridge)
// =============================================================================

/// Incoming media-stream events.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyMessage {
    /// Protocol handshake acknowledgment, no payload of interest.
    Connected,

    /// Stream start: identifiers and caller-supplied parameters.
    Start { start: StartInfo },

    /// One frame of base64 mu-law audio.
    Media { media: MediaInfo },

    /// Stream end.
    Stop {
        #[serde(default)]
        stop: Option<StopInfo>,
    },

    /// Any event the bridge does not act on.
    #[serde(other)]
    Ignored,
}

/// Payload of the `start` event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartInfo {
    pub stream_sid: String,
    pub call_sid: String,
    /// Caller-supplied key/value parameters configured on the telephony side.
    /// The bridge reads `agentId` and `token`.
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
}

/// Payload of the `media` event.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaInfo {
    /// Direction of this frame; anything other than "inbound" is ignored.
    #[serde(default)]
    pub track: Option<String>,
    /// Base64-encoded 8kHz mu-law audio.
    pub payload: String,
}

/// Payload of the `stop` event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopInfo {
    #[serde(default)]
    pub call_sid: String,
}

// =============================================================================
// Outgoing Messages (bridge -> telephony provider)
// =============================================================================

/// Outgoing media-stream events.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyOutgoing {
    /// One frame of base64 mu-law audio for playback to the caller.
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },

    /// Flush any audio the provider has buffered but not yet played
    /// (barge-in: the caller interrupted the assistant).
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

/// Audio payload of an outgoing `media` event.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OutboundMedia {
    pub payload: String,
}

// =============================================================================
// Message Routing
// =============================================================================

/// Routing wrapper for the per-connection writer task.
#[derive(Debug)]
pub enum TelephonyRoute {
    /// JSON event for the telephony socket.
    Outgoing(TelephonyOutgoing),
    /// Close the telephony socket.
    Close,
}
