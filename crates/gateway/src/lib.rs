//! Session gateway for the auction platform.
//!
//! Accepts persistent bidirectional WebSocket connections, authenticates
//! subscribers against the auth collaborator's bearer credentials, routes
//! inbound commands to the engine, and delivers outbound events.

pub mod auth;
pub mod client;
pub mod error;
pub mod protocol;
pub mod ws_server;

pub use auth::{decode_token, issue_token, AuthError, AuthThrottle, Claims, Identity, Verifier};
pub use client::ClientSession;
pub use error::{GatewayError, Result};
pub use protocol::{ClientMessage, ServerMessage};
pub use ws_server::{create_router, AppState};
