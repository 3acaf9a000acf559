//! Shared application state
//!
//! One `AppState` per process, built at startup and shared with every
//! connection handler through axum's `State` extractor. The connector and
//! metadata sink sit behind trait objects so tests can substitute in-process
//! implementations.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BackendConnector, SignedUrlConnector};
use crate::config::BridgeConfig;
use crate::persist::{HttpMetadataSink, MetadataSink, NoopMetadataSink};

pub struct AppState {
    pub config: Arc<BridgeConfig>,
    pub connector: Arc<dyn BackendConnector>,
    pub metadata: Arc<dyn MetadataSink>,
}

impl AppState {
    /// Build production state from configuration.
    pub fn new(config: BridgeConfig) -> Result<Arc<Self>, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_seconds))
            .build()?;

        let connector = Arc::new(SignedUrlConnector::new(
            http.clone(),
            config.credential_service_url.clone(),
            config.backend_api_key.clone().unwrap_or_default(),
        ));

        let metadata: Arc<dyn MetadataSink> = match &config.metadata_store_url {
            Some(url) => Arc::new(HttpMetadataSink::new(http, url.clone())),
            None => Arc::new(NoopMetadataSink),
        };

        Ok(Arc::new(Self {
            config: Arc::new(config),
            connector,
            metadata,
        }))
    }

    /// Assemble state from parts. Used by tests to inject mock legs.
    pub fn with_parts(
        config: BridgeConfig,
        connector: Arc<dyn BackendConnector>,
        metadata: Arc<dyn MetadataSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            connector,
            metadata,
        })
    }
}
