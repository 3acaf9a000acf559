pub mod audio;
pub mod backend;
pub mod config;
pub mod handlers;
pub mod persist;
pub mod routes;
pub mod session;
pub mod state;
pub mod telephony;

// Re-export commonly used items for convenience
pub use config::BridgeConfig;
pub use state::AppState;
