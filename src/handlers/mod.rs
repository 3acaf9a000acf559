//! WebSocket handlers for the telephony leg

pub mod stream;

pub use stream::stream_handler;
