//! Route configuration
//!
//! A single WebSocket endpoint: the telephony provider connects its media
//! stream to the configured path and everything else happens inside that
//! connection.

use std::sync::Arc;

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::stream_handler;
use crate::state::AppState;

/// Create the media-stream router.
///
/// # Endpoint
///
/// `GET {path}` - WebSocket upgrade for the telephony media stream. The path
/// comes from configuration so deployments can match whatever URL their
/// telephony provider is configured to dial.
pub fn create_stream_router(path: &str) -> Router<Arc<AppState>> {
    Router::new()
        .route(path, get(stream_handler))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_builds_with_configured_path() {
        let _router = create_stream_router("/media-stream");
        let _router = create_stream_router("/voice/stream");
    }
}
