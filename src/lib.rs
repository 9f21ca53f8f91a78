//! Sentinel Client
//!
//! Client-side session and connection layer for the Sentinel security console.
//!
//! # Features
//!
//! - **Session Manager**: credentials → one-time code → persisted session
//! - **Session Storage**: durable token + principal mirror, corrupt data discarded
//! - **Telemetry Channel**: long-lived WebSocket stream with automatic reconnection
//! - **Synthetic Fallback**: heartbeat payloads whenever no live connection is up
//!
//! # Architecture
//!
//! ```text
//! Presentation ──► SessionManager ──► AuthService (HTTP)
//!      │                 └──────────► SessionStore (file / memory)
//!      │
//!      └─────────► TelemetryChannel ──► Connector (WebSocket)
//!                        └── heartbeat while not connected
//! ```
//!
//! The two components share no state. Whether the channel needs a session is
//! a policy choice (`AccessPolicy`).

pub mod config;
pub mod session;
pub mod telemetry;

pub use config::{Config, ReconnectMode};
pub use session::{
    AuthService, AuthState, ChallengeView, FileStore, HttpAuthService, LoginOutcome, MemoryStore,
    Principal, ResendOutcome, Role, Session, SessionError, SessionManager, SessionStore, VerifyOutcome,
};
pub use telemetry::{
    AccessPolicy, ChannelConfig, ChannelSnapshot, ConnectionState, ReconnectPolicy, TelemetryChannel,
    TelemetryError, TelemetryPayload, WebSocketConnector,
};
