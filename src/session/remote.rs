//! Remote Authentication Collaborator
//!
//! Wire contract for the credential and challenge endpoints, the
//! `AuthService` seam the session manager talks through, and the reqwest
//! implementation of it.
//!
//! # Endpoints
//!
//! - `POST /api/auth/login` - `{email, password}`
//! - `POST /api/auth/challenge/verify` - `{subject, code}`
//! - `POST /api/auth/challenge/resend` - `{subject}`

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::types::Principal;

/// Correlation header sent with every auth request
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Remote call failures (network, protocol). Rejections are responses, not errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            RemoteError::InvalidResponse(e.to_string())
        } else {
            RemoteError::Network(e.to_string())
        }
    }
}

// ============================================================================
// Wire types
// ============================================================================

/// Credential submission body
#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

/// Credential submission result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoginResponse {
    ChallengeRequired { subject: String },
    Ok { token: String, principal: Principal },
    Invalid,
}

/// Challenge verification body
#[derive(Debug, Serialize)]
pub struct VerifyRequest<'a> {
    pub subject: &'a str,
    pub code: &'a str,
}

/// Challenge verification result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerifyResponse {
    Ok { token: String, principal: Principal },
    Rejected,
}

/// Resend request body
#[derive(Debug, Serialize)]
pub struct ResendRequest<'a> {
    pub subject: &'a str,
}

/// Authentication backend as seen from the client
#[async_trait]
pub trait AuthService: Send + Sync {
    /// Step 1: email + password
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, RemoteError>;

    /// Step 2: one-time code for a challenge subject
    async fn verify(&self, subject: &str, code: &str) -> Result<VerifyResponse, RemoteError>;

    /// Re-issue the code for a challenge subject
    async fn resend(&self, subject: &str) -> Result<(), RemoteError>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// HTTP auth client configuration
#[derive(Debug, Clone)]
pub struct HttpAuthConfig {
    pub base_url: String,
    pub timeout_seconds: u64,
}

impl Default for HttpAuthConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            timeout_seconds: 30,
        }
    }
}

/// reqwest-backed `AuthService`
///
/// Clone is cheap - reqwest clients share the connection pool.
#[derive(Clone)]
pub struct HttpAuthService {
    client: Client,
    base_url: String,
}

impl HttpAuthService {
    pub fn new(config: HttpAuthConfig) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Create from the crate configuration
    pub fn from_config(config: &crate::config::Config) -> Result<Self, RemoteError> {
        Self::new(HttpAuthConfig {
            base_url: config.auth_url.clone(),
            timeout_seconds: config.auth_timeout_secs,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST a JSON body, tagged with a fresh request id for server-side correlation
    async fn send_json<B>(&self, path: &str, body: &B) -> Result<Response, RemoteError>
    where
        B: Serialize + ?Sized + Sync,
    {
        let url = format!("{}{}", self.base_url, path);
        let request_id = Uuid::new_v4().to_string();
        debug!("POST {} ({})", url, request_id);

        Ok(self
            .client
            .post(&url)
            .header(REQUEST_ID_HEADER, &request_id)
            .json(body)
            .send()
            .await?)
    }

    /// POST a JSON body and decode the tagged response.
    ///
    /// 401/403 bodies are still decoded since backends commonly send the
    /// rejection status with an error code; `fallback` is used when they are
    /// empty or not in the contract.
    async fn post<B, R>(&self, path: &str, body: &B, fallback: Option<R>) -> Result<R, RemoteError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let response = self.send_json(path, body).await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response.json::<R>().await?);
        }

        let text = response.text().await.unwrap_or_default();

        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            if let Ok(parsed) = serde_json::from_str::<R>(&text) {
                return Ok(parsed);
            }
            if let Some(fallback) = fallback {
                return Ok(fallback);
            }
        }

        warn!("Auth endpoint {} returned {}", path, status);
        Err(RemoteError::Status {
            status: status.as_u16(),
            body: text,
        })
    }
}

#[async_trait]
impl AuthService for HttpAuthService {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, RemoteError> {
        self.post(
            "/api/auth/login",
            &LoginRequest { email, password },
            Some(LoginResponse::Invalid),
        )
        .await
    }

    async fn verify(&self, subject: &str, code: &str) -> Result<VerifyResponse, RemoteError> {
        self.post(
            "/api/auth/challenge/verify",
            &VerifyRequest { subject, code },
            Some(VerifyResponse::Rejected),
        )
        .await
    }

    async fn resend(&self, subject: &str) -> Result<(), RemoteError> {
        let response = self
            .send_json("/api/auth/challenge/resend", &ResendRequest { subject })
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(RemoteError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::Role;

    #[test]
    fn test_login_response_wire_format() {
        let challenge: LoginResponse =
            serde_json::from_str(r#"{"status":"challenge_required","subject":"a@b.com"}"#).unwrap();
        assert_eq!(
            challenge,
            LoginResponse::ChallengeRequired {
                subject: "a@b.com".into()
            }
        );

        let ok: LoginResponse = serde_json::from_str(
            r#"{"status":"ok","token":"t","principal":{"email":"a@b.com","display_name":"A","role":"admin"}}"#,
        )
        .unwrap();
        match ok {
            LoginResponse::Ok { token, principal } => {
                assert_eq!(token, "t");
                assert_eq!(principal.role, Role::Admin);
            }
            other => panic!("unexpected {:?}", other),
        }

        let invalid: LoginResponse = serde_json::from_str(r#"{"status":"invalid"}"#).unwrap();
        assert_eq!(invalid, LoginResponse::Invalid);
    }

    #[test]
    fn test_verify_response_wire_format() {
        let rejected: VerifyResponse = serde_json::from_str(r#"{"status":"rejected"}"#).unwrap();
        assert_eq!(rejected, VerifyResponse::Rejected);
        assert!(serde_json::from_str::<VerifyResponse>(r#"{"status":"maybe"}"#).is_err());
    }

    #[test]
    fn test_request_serialization() {
        let json = serde_json::to_string(&VerifyRequest {
            subject: "a@b.com",
            code: "123456",
        })
        .unwrap();
        assert_eq!(json, r#"{"subject":"a@b.com","code":"123456"}"#);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let service = HttpAuthService::new(HttpAuthConfig {
            base_url: "http://auth.local/".into(),
            timeout_seconds: 5,
        })
        .unwrap();
        assert_eq!(service.base_url(), "http://auth.local");
    }
}
