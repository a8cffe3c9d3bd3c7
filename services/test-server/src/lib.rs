//! The Component D test server: terminates the frame protocol over
//! WebSocket, authenticates, heartbeats, broadcasts periodic business
//! pushes with strictly monotone sequence numbers, and exposes a
//! concurrently-readable stats snapshot.
//!
//! [`server::TestServer`] is the library entry point; `main.rs` is a thin
//! CLI wrapper over it.

pub mod config;
pub mod error;
pub mod handler;
pub mod server;
pub mod state;

pub use config::ServerConfig;
pub use error::ServerError;
pub use server::TestServer;
pub use state::{ActionHandler, ServerStats};
