//! Bridge configuration
//!
//! Configuration is loaded from environment variables (with `.env` support via
//! `dotenvy` in `main`), validated once at startup, and shared read-only through
//! [`crate::state::AppState`] for the lifetime of the process.

use std::env;

use thiserror::Error;

/// Sample rate of the telephony leg. Media-stream providers deliver
/// 8-bit mu-law at 8kHz; this is fixed by the protocol, not configurable.
pub const TELEPHONY_SAMPLE_RATE: u32 = 8000;

/// Configuration errors surfaced at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Bridge configuration
///
/// Contains everything needed to run the voice bridge:
/// - Listen address and WebSocket path for the telephony leg
/// - Optional stream auth token (empty/unset disables the check)
/// - AI backend credentials and default agent
/// - Audio rates and pending-queue bound
/// - Credential service and optional metadata store endpoints
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    // Server settings
    pub host: String,
    pub port: u16,
    /// Path the telephony media stream connects to (e.g. "/media-stream")
    pub stream_path: String,

    /// Shared token callers must supply in `start.customParameters.token`.
    /// `None` disables the check.
    pub auth_token: Option<String>,

    // Backend settings
    /// API key presented to the credential service. A session shuts down on
    /// `start` if this is missing.
    pub backend_api_key: Option<String>,
    /// Agent used when `start.customParameters.agentId` is absent.
    pub default_agent_id: Option<String>,
    /// Sample rate the backend expects for inbound audio, and the fallback
    /// for its output rate when the initiation metadata is unparseable.
    pub backend_input_sample_rate: u32,

    /// Maximum number of transcoded chunks buffered while the backend socket
    /// is not yet open. Chunks beyond this are dropped, newest first.
    pub max_pending_chunks: usize,

    /// Credential service endpoint returning a signed backend WebSocket URL.
    pub credential_service_url: String,
    /// Call metadata store base URL. `None` disables persistence.
    pub metadata_store_url: Option<String>,

    /// Timeout applied to outbound HTTP calls (credential fetch, metadata write).
    pub http_timeout_seconds: u64,
}

/// Zeroize secrets when the configuration is dropped.
impl Drop for BridgeConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut token) = self.auth_token {
            token.zeroize();
        }
        if let Some(ref mut key) = self.backend_api_key {
            key.zeroize();
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            stream_path: "/media-stream".to_string(),
            auth_token: None,
            backend_api_key: None,
            default_agent_id: None,
            backend_input_sample_rate: 16000,
            max_pending_chunks: 256,
            credential_service_url:
                "https://api.elevenlabs.io/v1/convai/conversation/get_signed_url".to_string(),
            metadata_store_url: None,
            http_timeout_seconds: 10,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// Empty strings are treated as unset so that `STREAM_AUTH_TOKEN=""`
    /// disables the auth check rather than requiring an empty token.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            host: env_string("HOST").unwrap_or(defaults.host.clone()),
            port: env_parse("PORT")?.unwrap_or(defaults.port),
            stream_path: env_string("STREAM_PATH").unwrap_or(defaults.stream_path.clone()),
            auth_token: env_string("STREAM_AUTH_TOKEN"),
            backend_api_key: env_string("BACKEND_API_KEY"),
            default_agent_id: env_string("DEFAULT_AGENT_ID"),
            backend_input_sample_rate: env_parse("BACKEND_INPUT_SAMPLE_RATE")?
                .unwrap_or(defaults.backend_input_sample_rate),
            max_pending_chunks: env_parse("MAX_PENDING_CHUNKS")?
                .unwrap_or(defaults.max_pending_chunks),
            credential_service_url: env_string("CREDENTIAL_SERVICE_URL")
                .unwrap_or(defaults.credential_service_url.clone()),
            metadata_store_url: env_string("METADATA_STORE_URL"),
            http_timeout_seconds: env_parse("HTTP_TIMEOUT_SECONDS")?
                .unwrap_or(defaults.http_timeout_seconds),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the final configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.stream_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "stream path must start with '/': {}",
                self.stream_path
            )));
        }
        if self.backend_input_sample_rate == 0 {
            return Err(ConfigError::Invalid(
                "backend input sample rate must be non-zero".to_string(),
            ));
        }
        if self.max_pending_chunks == 0 {
            return Err(ConfigError::Invalid(
                "max pending chunks must be non-zero".to_string(),
            ));
        }
        if self.http_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "http timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// The socket address string to bind to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read an environment variable, treating empty strings as unset.
fn env_string(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

/// Read and parse an environment variable, treating empty strings as unset.
fn env_parse<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env_string(key) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(None),
    }
}
