//! Conversational backend protocol
//!
//! JSON events exchanged with the AI speech backend over its WebSocket.
//! Server events are a closed tagged union with an explicit ignore arm;
//! client events mirror the backend's slightly irregular wire shapes (audio
//! chunks carry no `type` tag), so the enum serializes untagged with each
//! variant supplying its own fields.

use serde::{Deserialize, Serialize};

// =============================================================================
// Server Events (backend -> bridge)
// =============================================================================

/// Events received from the backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// First event after the handshake; carries the conversation id and the
    /// backend's output audio format.
    ConversationInitiationMetadata {
        conversation_initiation_metadata_event: InitiationMetadata,
    },

    /// One chunk of base64 PCM audio from the assistant.
    Audio { audio_event: AudioEvent },

    /// The backend detected the caller speaking over assistant output.
    Interruption,

    /// Keepalive; must be answered with a pong carrying the same event id.
    Ping { ping_event: PingEvent },

    /// Any event the bridge does not act on.
    #[serde(other)]
    Ignored,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitiationMetadata {
    pub conversation_id: String,
    /// Format token such as "pcm_16000"; the embedded rate drives the
    /// backend->telephony resampler.
    #[serde(default)]
    pub agent_output_audio_format: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioEvent {
    pub audio_base_64: String,
    #[serde(default)]
    pub event_id: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PingEvent {
    pub event_id: u64,
}

/// Extract the sample rate embedded in an output format token
/// ("pcm_16000" -> 16000). Returns `None` when the token does not end in a
/// decimal rate.
pub fn parse_output_sample_rate(format: &str) -> Option<u32> {
    format.rsplit('_').next()?.parse().ok()
}

// =============================================================================
// Client Events (bridge -> backend)
// =============================================================================

/// Events sent to the backend.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ClientEvent {
    /// Conversation initiation handshake, sent once on socket open.
    Initiation {
        #[serde(rename = "type")]
        event_type: &'static str,
    },

    /// Keepalive reply, echoing the ping's event id.
    Pong {
        #[serde(rename = "type")]
        event_type: &'static str,
        event_id: u64,
    },

    /// One chunk of base64 PCM caller audio. No type tag on the wire.
    AudioChunk { user_audio_chunk: String },
}

impl ClientEvent {
    pub fn initiation() -> Self {
        ClientEvent::Initiation {
            event_type: "conversation_initiation_client_data",
        }
    }

    pub fn pong(event_id: u64) -> Self {
        ClientEvent::Pong {
            event_type: "pong",
            event_id,
        }
    }

    pub fn audio_chunk(user_audio_chunk: String) -> Self {
        ClientEvent::AudioChunk { user_audio_chunk }
    }
}
