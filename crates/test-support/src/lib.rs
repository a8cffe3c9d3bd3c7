//! Test-only helpers for driving the binary WebSocket game protocol from
//! both ends without a real deployment: a scriptable mock server that
//! client-engine tests connect to, and raw frame send/recv primitives a
//! test can use to simulate any server behavior (slow pong, dropped
//! connection, out-of-order push, ...).

pub mod mock_server;

pub use mock_server::{MockConnection, MockError, MockServer};
