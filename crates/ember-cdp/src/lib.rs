//! Chrome DevTools Protocol (CDP) client for the Ember debug adapter.
//!
//! This crate speaks the JSON-RPC flavored CDP over a DevTools WebSocket
//! endpoint. It is async (`tokio`) and cancellation-aware: every in-flight
//! command observes the client's shutdown token, and the read loop fails all
//! pending commands when the socket closes.
//!
//! Only the handful of domains the adapter needs are wrapped as typed
//! helpers (`Page`, `Runtime`, `Debugger`, `Network`, plus best-effort
//! `Console`/`Log`); everything else goes through [`CdpClient::send_command`].

mod client;

use thiserror::Error;

pub use client::{CdpClient, CdpClientConfig, CdpEvent};

pub type Result<T> = std::result::Result<T, CdpError>;

#[derive(Debug, Error)]
pub enum CdpError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("CDP message was not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CDP protocol error: {0}")]
    Protocol(String),
    #[error("CDP command {method} failed with code {code}: {message}")]
    CommandFailed {
        method: String,
        code: i64,
        message: String,
    },
    #[error("CDP operation timed out")]
    Timeout,
    #[error("CDP client was shut down")]
    Cancelled,
    #[error("CDP connection closed")]
    ConnectionClosed,
}

// The mock server is only needed for tests and downstream integration suites.
// Compile it for ember-cdp's own unit tests unconditionally (via `cfg(test)`),
// while keeping it behind the `ws-test-support` feature for normal builds and
// for downstream crates.
#[cfg(any(test, feature = "ws-test-support"))]
pub mod mock;
