//! Session Layer
//!
//! Two-step authentication (credentials, then a one-time code) and the
//! persisted session every other screen depends on.
//!
//! ```text
//! Unauthenticated ──submit_credentials──► ChallengePending ──verify_challenge──► Authenticated
//!        ▲   │                                   │                                  │
//!        │   └──────── single-factor ok ─────────┼──────────────────────────────────┤
//!        └──────────── cancel / resubmit ────────┘                                  │
//!        └───────────────────────────────────── logout ─────────────────────────────┘
//! ```

pub mod challenge;
pub mod manager;
pub mod remote;
pub mod storage;
pub mod types;

use thiserror::Error;

pub use challenge::{ChallengeStatus, ChallengeView, PendingChallenge, CODE_LENGTH, RESEND_WINDOW};
pub use manager::{AuthState, InvalidReason, LoginOutcome, RejectReason, ResendOutcome, SessionManager, VerifyOutcome};
pub use remote::{
    AuthService, HttpAuthConfig, HttpAuthService, LoginResponse, RemoteError, VerifyResponse, REQUEST_ID_HEADER,
};
pub use storage::{FileStore, MemoryStore, SessionStore, StorageError};
pub use types::{validate_email, CredentialAttempt, Principal, Role, Session};

/// Input rejected locally, before any remote call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Email must contain a single @ between non-empty parts")]
    MalformedEmail,

    #[error("Code slot {index} out of range")]
    SlotOutOfRange { index: usize },

    #[error("Code digit must be a single decimal character")]
    MalformedDigit,

    #[error("Pasted code must be 1-6 decimal digits")]
    MalformedPaste,
}

/// Session manager errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("No challenge pending")]
    NoPendingChallenge,
}
