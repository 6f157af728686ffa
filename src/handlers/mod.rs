//! Transport adapters driving the lifecycle supervisor

pub mod websocket;

// Re-export the websocket handler
pub use websocket::{handle_ws_client, ws_routes, WsContext};
