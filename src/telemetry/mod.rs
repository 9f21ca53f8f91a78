//! Telemetry Channel
//!
//! One long-lived streaming connection that stays "live" across network
//! interruptions: automatic reconnection with backoff, and a synthetic
//! heartbeat whenever no live connection is up.
//!
//! # Architecture
//!
//! ```text
//! TelemetryChannel (handle, Clone)
//!        │ commands
//!        ▼
//!   event loop task ──owns──► ConnectionState, timers, listeners
//!        ▲ events (tagged with generation)
//!        │
//!   transport task (one per attempt) ◄──► Connector (WebSocket)
//! ```

pub mod backoff;
pub mod channel;
pub mod payload;
pub mod transport;

use thiserror::Error;

pub use backoff::ReconnectPolicy;
pub use channel::{AccessPolicy, ChannelConfig, ChannelSnapshot, ConnectionState, TelemetryChannel};
pub use payload::{decode_frame, PayloadSource, TelemetryPayload};
pub use transport::{Connector, FrameSink, FrameStream, TransportLink, WebSocketConnector};

/// Telemetry errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Undecodable payload: {0}")]
    Decode(String),

    #[error("Channel not connected")]
    NotConnected,

    #[error("Channel requires an authenticated session")]
    Unauthorized,

    #[error("Channel event loop has stopped")]
    ChannelClosed,
}
