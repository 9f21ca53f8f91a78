//! Session Data Types
//!
//! Principal, session and the transient credential attempt.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::ValidationError;

/// Principal role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Analyst,
    Admin,
    /// Any role string this client does not know about
    #[serde(other)]
    Unknown,
}

impl Default for Role {
    fn default() -> Self {
        Self::Viewer
    }
}

/// Authenticated identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub email: String,
    pub display_name: String,
    #[serde(default)]
    pub role: Role,
}

impl Principal {
    /// A principal is well-formed when its email passes syntax validation
    pub fn is_well_formed(&self) -> bool {
        validate_email(&self.email).is_ok()
    }
}

/// Established session
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    /// Opaque bearer token
    pub access_token: String,
    pub principal: Principal,
}

impl Session {
    pub fn new(access_token: impl Into<String>, principal: Principal) -> Self {
        Self {
            access_token: access_token.into(),
            principal,
        }
    }
}

// Token stays out of logs
impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("principal", &self.principal)
            .finish()
    }
}

/// One credential submission. Never persisted; the password is wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CredentialAttempt {
    pub email: String,
    password: String,
}

impl CredentialAttempt {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl std::fmt::Debug for CredentialAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialAttempt")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Syntactic email check: exactly one `@` with non-empty local and domain parts
pub fn validate_email(email: &str) -> Result<(), ValidationError> {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !domain.contains('@') => {
            Ok(())
        }
        _ => Err(ValidationError::MalformedEmail),
    }
}
