//! Session Manager
//!
//! Drives the login → challenge → authenticated state machine.
//!
//! Remote calls run with the state lock released. Every call that can be
//! superseded is stamped with a request sequence number; when the response
//! lands and a newer call (or a cancel/logout) has advanced the sequence, the
//! response is discarded and `Superseded` is reported instead.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::challenge::{ChallengeView, PendingChallenge};
use super::remote::{AuthService, LoginResponse, RemoteError, VerifyResponse};
use super::storage::{self, SessionStore, StoredSession};
use super::types::{validate_email, CredentialAttempt, Session};
use super::{SessionError, ValidationError};

/// Where the state machine currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    ChallengePending,
    Authenticated,
}

/// Why credentials were refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    /// Rejected locally; the remote service was not contacted
    Malformed(ValidationError),
    /// Rejected by the remote service
    Rejected,
}

/// Result of `submit_credentials`
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    ChallengeRequired(ChallengeView),
    SessionEstablished(Session),
    InvalidCredentials(InvalidReason),
    /// Network or protocol failure; nothing was changed
    Unavailable(RemoteError),
    /// A newer call was made before this one settled
    Superseded,
}

/// Why a challenge was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Not all slots filled; the verifier was not contacted
    Incomplete,
    /// The verifier refused the code
    WrongCode,
}

/// Result of `verify_challenge`
#[derive(Debug, Clone)]
pub enum VerifyOutcome {
    SessionEstablished(Session),
    ChallengeRejected(RejectReason),
    Unavailable(RemoteError),
    Superseded,
}

/// Result of `request_resend`
#[derive(Debug, Clone)]
pub enum ResendOutcome {
    Resent(ChallengeView),
    Throttled { remaining_secs: u64 },
    Unavailable(RemoteError),
    /// The challenge was cancelled or replaced while the request was in flight
    Superseded,
}

#[derive(Default)]
struct Inner {
    session: Option<Session>,
    challenge: Option<PendingChallenge>,
    request_seq: u64,
    /// Bumped for every challenge issued; resends are matched against it
    challenge_epoch: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.request_seq += 1;
        self.request_seq
    }
}

/// Session manager
///
/// Owns the session and any pending challenge. Collaborators are injected so
/// tests can substitute fakes.
pub struct SessionManager {
    auth: Arc<dyn AuthService>,
    store: Arc<dyn SessionStore>,
    inner: Mutex<Inner>,
}

impl SessionManager {
    pub fn new(auth: Arc<dyn AuthService>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            auth,
            store,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Current state machine position
    pub fn state(&self) -> AuthState {
        let inner = self.inner.lock();
        if inner.challenge.is_some() {
            AuthState::ChallengePending
        } else if inner.session.is_some() {
            AuthState::Authenticated
        } else {
            AuthState::Unauthenticated
        }
    }

    pub fn current_session(&self) -> Option<Session> {
        self.inner.lock().session.clone()
    }

    pub fn pending_challenge(&self) -> Option<ChallengeView> {
        let now = Instant::now();
        self.inner.lock().challenge.as_ref().map(|c| c.view(now))
    }

    /// Restore a persisted session. Corrupt entries are cleared and reported as absent.
    pub fn restore_session(&self) -> Option<Session> {
        match storage::read_session(self.store.as_ref()) {
            StoredSession::Valid(session) => {
                info!("Restored session for {}", session.principal.email);
                self.inner.lock().session = Some(session.clone());
                Some(session)
            }
            StoredSession::Absent => None,
            StoredSession::Corrupt(reason) => {
                warn!("Discarding stored session: {}", reason);
                if let Err(e) = storage::clear_session(self.store.as_ref()) {
                    warn!("Failed to clear corrupt session entry: {}", e);
                }
                None
            }
        }
    }

    /// Step 1: submit email and password
    pub async fn submit_credentials(&self, email: &str, password: &str) -> LoginOutcome {
        if let Err(e) = validate_email(email) {
            debug!("Rejected malformed email locally");
            return LoginOutcome::InvalidCredentials(InvalidReason::Malformed(e));
        }

        let attempt = CredentialAttempt::new(email, password);

        // Resubmitting abandons any pending challenge
        let seq = {
            let mut inner = self.inner.lock();
            inner.challenge = None;
            inner.next_seq()
        };

        let result = self.auth.login(&attempt.email, attempt.password()).await;
        drop(attempt);

        let mut inner = self.inner.lock();
        if inner.request_seq != seq {
            debug!("Login response #{} superseded by #{}", seq, inner.request_seq);
            return LoginOutcome::Superseded;
        }

        match result {
            Ok(LoginResponse::ChallengeRequired { subject }) => {
                info!("Challenge required for {}", subject);
                let now = Instant::now();
                let challenge = PendingChallenge::new(subject, now);
                let view = challenge.view(now);
                if let Some(previous) = inner.session.take() {
                    info!("Dropping session for {} pending the new challenge", previous.principal.email);
                    self.forget_persisted();
                }
                inner.challenge_epoch += 1;
                inner.challenge = Some(challenge);
                LoginOutcome::ChallengeRequired(view)
            }
            Ok(LoginResponse::Ok { token, principal }) => {
                let session = Session::new(token, principal);
                self.establish(&mut inner, session.clone());
                LoginOutcome::SessionEstablished(session)
            }
            Ok(LoginResponse::Invalid) => {
                info!("Credentials rejected");
                LoginOutcome::InvalidCredentials(InvalidReason::Rejected)
            }
            Err(e) => {
                warn!("Login request failed: {}", e);
                LoginOutcome::Unavailable(e)
            }
        }
    }

    /// Write or clear (`""`) a single code slot
    pub fn submit_challenge_digit(&self, index: usize, digit: &str) -> Result<ChallengeView, SessionError> {
        let mut inner = self.inner.lock();
        let challenge = inner.challenge.as_mut().ok_or(SessionError::NoPendingChallenge)?;
        challenge.set_digit(index, digit)?;
        Ok(challenge.view(Instant::now()))
    }

    /// Paste 1-6 digits into the code slots starting at slot 0
    pub fn paste_challenge_code(&self, raw: &str) -> Result<ChallengeView, SessionError> {
        let mut inner = self.inner.lock();
        let challenge = inner.challenge.as_mut().ok_or(SessionError::NoPendingChallenge)?;
        challenge.paste(raw)?;
        Ok(challenge.view(Instant::now()))
    }

    /// Step 2: submit the assembled code
    pub async fn verify_challenge(&self) -> Result<VerifyOutcome, SessionError> {
        let (seq, subject, code) = {
            let mut inner = self.inner.lock();
            let challenge = inner.challenge.as_ref().ok_or(SessionError::NoPendingChallenge)?;
            let Some(code) = challenge.code() else {
                return Ok(VerifyOutcome::ChallengeRejected(RejectReason::Incomplete));
            };
            let subject = challenge.subject().to_string();
            (inner.next_seq(), subject, code)
        };

        let result = self.auth.verify(&subject, &code).await;

        let mut inner = self.inner.lock();
        if inner.request_seq != seq {
            debug!("Verify response #{} superseded by #{}", seq, inner.request_seq);
            return Ok(VerifyOutcome::Superseded);
        }

        Ok(match result {
            Ok(VerifyResponse::Ok { token, principal }) => {
                inner.challenge = None;
                let session = Session::new(token, principal);
                self.establish(&mut inner, session.clone());
                VerifyOutcome::SessionEstablished(session)
            }
            Ok(VerifyResponse::Rejected) => {
                info!("Challenge code rejected for {}", subject);
                if let Some(challenge) = inner.challenge.as_mut() {
                    challenge.mark_failed();
                }
                VerifyOutcome::ChallengeRejected(RejectReason::WrongCode)
            }
            Err(e) => {
                warn!("Verify request failed: {}", e);
                VerifyOutcome::Unavailable(e)
            }
        })
    }

    /// Ask for a new code once the countdown has expired
    pub async fn request_resend(&self) -> Result<ResendOutcome, SessionError> {
        let (epoch, subject) = {
            let mut inner = self.inner.lock();
            let epoch = inner.challenge_epoch;
            let challenge = inner.challenge.as_mut().ok_or(SessionError::NoPendingChallenge)?;
            let now = Instant::now();

            let view = challenge.view(now);
            if view.resend_in_secs > 0 {
                return Ok(ResendOutcome::Throttled {
                    remaining_secs: view.resend_in_secs,
                });
            }

            // Restart first so a second click while in flight is throttled
            challenge.restart_countdown(now);
            (epoch, challenge.subject().to_string())
        };

        let result = self.auth.resend(&subject).await;

        let mut inner = self.inner.lock();
        if inner.challenge_epoch != epoch {
            debug!("Resend for {} superseded by a newer challenge", subject);
            return Ok(ResendOutcome::Superseded);
        }
        let Some(challenge) = inner.challenge.as_mut() else {
            return Ok(ResendOutcome::Superseded);
        };

        Ok(match result {
            Ok(()) => {
                info!("Challenge code re-issued for {}", subject);
                ResendOutcome::Resent(challenge.view(Instant::now()))
            }
            Err(e) => {
                warn!("Resend request failed: {}", e);
                // Allow an immediate retry
                challenge.expire_countdown(Instant::now());
                ResendOutcome::Unavailable(e)
            }
        })
    }

    /// Abandon the pending challenge and return to Unauthenticated
    pub fn cancel_challenge(&self) {
        let mut inner = self.inner.lock();
        if inner.challenge.take().is_some() {
            inner.next_seq();
            debug!("Challenge cancelled");
        }
    }

    /// Clear the session and any pending challenge. Safe to call repeatedly.
    pub fn logout(&self) {
        {
            let mut inner = self.inner.lock();
            inner.next_seq();
            inner.challenge = None;
            if let Some(session) = inner.session.take() {
                info!("Logged out {}", session.principal.email);
            }
        }

        self.forget_persisted();
    }

    fn forget_persisted(&self) {
        if let Err(e) = storage::clear_session(self.store.as_ref()) {
            error!("Failed to remove persisted session: {}", e);
        }
    }

    fn establish(&self, inner: &mut Inner, session: Session) {
        info!(
            "Session established for {} ({:?})",
            session.principal.email, session.principal.role
        );
        // Storage is a mirror; a write failure only costs the next restore
        if let Err(e) = storage::write_session(self.store.as_ref(), &session) {
            error!("Failed to persist session: {}", e);
        }
        inner.session = Some(session);
    }
}
