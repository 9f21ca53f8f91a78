//! Session Flow Integration Tests
//!
//! Drives the session manager end to end against a scripted auth backend.

use async_trait::async_trait;
use sentinel_client::session::{
    AuthService, AuthState, FileStore, InvalidReason, LoginOutcome, LoginResponse, MemoryStore,
    Principal, RejectReason, RemoteError, ResendOutcome, Role, SessionManager, ValidationError,
    VerifyOutcome, VerifyResponse,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

/// Scripted backend
///
/// - password `"x"` → challenge for the email
/// - password `"slow"` → waits for `release`, then challenges `stale@b.com`
/// - anything else → invalid
/// - code `"123456"` accepted; code `"999999"` waits for `release` first
/// - resend waits for `release` while `hold_resend` is set
struct ScriptedAuth {
    entered: Notify,
    release: Notify,
    resends: AtomicUsize,
    fail_resend: AtomicBool,
    hold_resend: AtomicBool,
}

impl ScriptedAuth {
    fn new() -> Self {
        Self {
            entered: Notify::new(),
            release: Notify::new(),
            resends: AtomicUsize::new(0),
            fail_resend: AtomicBool::new(false),
            hold_resend: AtomicBool::new(false),
        }
    }

    async fn gate(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

fn principal(email: &str) -> Principal {
    Principal {
        email: email.to_string(),
        display_name: "Analyst One".into(),
        role: Role::Analyst,
    }
}

#[async_trait]
impl AuthService for ScriptedAuth {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, RemoteError> {
        match password {
            "x" => Ok(LoginResponse::ChallengeRequired {
                subject: email.to_string(),
            }),
            "slow" => {
                self.gate().await;
                Ok(LoginResponse::ChallengeRequired {
                    subject: "stale@b.com".into(),
                })
            }
            _ => Ok(LoginResponse::Invalid),
        }
    }

    async fn verify(&self, subject: &str, code: &str) -> Result<VerifyResponse, RemoteError> {
        if code == "999999" {
            self.gate().await;
        }
        if code == "123456" || code == "999999" {
            Ok(VerifyResponse::Ok {
                token: format!("tok-{}", subject),
                principal: principal(subject),
            })
        } else {
            Ok(VerifyResponse::Rejected)
        }
    }

    async fn resend(&self, _subject: &str) -> Result<(), RemoteError> {
        self.resends.fetch_add(1, Ordering::SeqCst);
        if self.hold_resend.load(Ordering::SeqCst) {
            self.gate().await;
        }
        if self.fail_resend.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("connection reset".into()));
        }
        Ok(())
    }
}

fn manager() -> (Arc<SessionManager>, Arc<ScriptedAuth>) {
    let auth = Arc::new(ScriptedAuth::new());
    let store = Arc::new(MemoryStore::new());
    (Arc::new(SessionManager::new(auth.clone(), store)), auth)
}

#[tokio::test]
async fn test_login_challenge_and_verify() {
    let (mgr, _) = manager();

    let outcome = mgr.submit_credentials("a@b.com", "x").await;
    let LoginOutcome::ChallengeRequired(view) = outcome else {
        panic!("expected challenge, got {:?}", outcome);
    };
    assert_eq!(view.subject, "a@b.com");
    assert_eq!(view.slot_strings(), vec![""; 6]);

    for (i, d) in "123456".chars().enumerate() {
        let view = mgr.submit_challenge_digit(i, &d.to_string()).unwrap();
        let expected = if i < 5 { Some(i + 1) } else { None };
        assert_eq!(view.next_index, expected);
    }

    let outcome = mgr.verify_challenge().await.unwrap();
    let VerifyOutcome::SessionEstablished(session) = outcome else {
        panic!("expected session, got {:?}", outcome);
    };
    assert_eq!(session.access_token, "tok-a@b.com");
    assert_eq!(session.principal.role, Role::Analyst);
    assert_eq!(mgr.state(), AuthState::Authenticated);
}

#[tokio::test]
async fn test_partial_paste_fills_leading_slots() {
    let (mgr, _) = manager();
    mgr.submit_credentials("a@b.com", "x").await;

    let view = mgr.paste_challenge_code("12").unwrap();
    assert_eq!(view.slot_strings(), vec!["1", "2", "", "", "", ""]);
    assert_eq!(view.next_index, Some(2));

    let outcome = mgr.verify_challenge().await.unwrap();
    assert!(matches!(
        outcome,
        VerifyOutcome::ChallengeRejected(RejectReason::Incomplete)
    ));
}

#[tokio::test]
async fn test_bad_digit_is_reported_and_cleared_by_next_edit() {
    let (mgr, _) = manager();
    mgr.submit_credentials("a@b.com", "x").await;

    let err = mgr.submit_challenge_digit(0, "a").unwrap_err();
    assert!(err.to_string().contains("single decimal"));
    let view = mgr.pending_challenge().unwrap();
    assert_eq!(view.input_error, Some(ValidationError::MalformedDigit));

    assert!(mgr.submit_challenge_digit(6, "1").is_err());
    assert!(mgr.paste_challenge_code("1234567").is_err());

    let view = mgr.submit_challenge_digit(0, "4").unwrap();
    assert_eq!(view.input_error, None);
    assert_eq!(view.slot_strings()[0], "4");
}

#[tokio::test]
async fn test_wrong_code_then_correct_code() {
    let (mgr, _) = manager();
    mgr.submit_credentials("a@b.com", "x").await;

    mgr.paste_challenge_code("000000").unwrap();
    let outcome = mgr.verify_challenge().await.unwrap();
    assert!(matches!(
        outcome,
        VerifyOutcome::ChallengeRejected(RejectReason::WrongCode)
    ));
    assert!(mgr.pending_challenge().unwrap().failed);

    let view = mgr.paste_challenge_code("123456").unwrap();
    assert!(!view.failed);
    assert!(matches!(
        mgr.verify_challenge().await.unwrap(),
        VerifyOutcome::SessionEstablished(_)
    ));
}

#[tokio::test]
async fn test_invalid_credentials_leave_state_untouched() {
    let (mgr, _) = manager();

    let outcome = mgr.submit_credentials("a@b.com", "nope").await;
    assert!(matches!(
        outcome,
        LoginOutcome::InvalidCredentials(InvalidReason::Rejected)
    ));
    assert_eq!(mgr.state(), AuthState::Unauthenticated);

    let outcome = mgr.submit_credentials("not-an-email", "x").await;
    assert!(matches!(
        outcome,
        LoginOutcome::InvalidCredentials(InvalidReason::Malformed(ValidationError::MalformedEmail))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_resend_countdown() {
    let (mgr, auth) = manager();
    mgr.submit_credentials("a@b.com", "x").await;

    assert!(matches!(
        mgr.request_resend().await.unwrap(),
        ResendOutcome::Throttled { remaining_secs: 300 }
    ));

    tokio::time::advance(Duration::from_secs(120)).await;
    assert_eq!(mgr.pending_challenge().unwrap().resend_in_secs, 180);
    assert!(matches!(
        mgr.request_resend().await.unwrap(),
        ResendOutcome::Throttled { remaining_secs: 180 }
    ));
    assert_eq!(auth.resends.load(Ordering::SeqCst), 0);

    tokio::time::advance(Duration::from_secs(180)).await;
    let outcome = mgr.request_resend().await.unwrap();
    let ResendOutcome::Resent(view) = outcome else {
        panic!("expected resend, got {:?}", outcome);
    };
    assert_eq!(view.resend_in_secs, 300);
    assert_eq!(auth.resends.load(Ordering::SeqCst), 1);

    // Countdown restarted
    assert!(matches!(
        mgr.request_resend().await.unwrap(),
        ResendOutcome::Throttled { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_failed_resend_can_be_retried() {
    let (mgr, auth) = manager();
    mgr.submit_credentials("a@b.com", "x").await;
    tokio::time::advance(Duration::from_secs(300)).await;

    auth.fail_resend.store(true, Ordering::SeqCst);
    assert!(matches!(
        mgr.request_resend().await.unwrap(),
        ResendOutcome::Unavailable(RemoteError::Network(_))
    ));
    assert_eq!(mgr.pending_challenge().unwrap().resend_in_secs, 0);

    auth.fail_resend.store(false, Ordering::SeqCst);
    assert!(matches!(
        mgr.request_resend().await.unwrap(),
        ResendOutcome::Resent(_)
    ));
    assert_eq!(auth.resends.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stale_resend_does_not_touch_reissued_challenge() {
    let (mgr, auth) = manager();
    mgr.submit_credentials("a@b.com", "x").await;
    tokio::time::advance(Duration::from_secs(300)).await;

    auth.hold_resend.store(true, Ordering::SeqCst);
    auth.fail_resend.store(true, Ordering::SeqCst);
    let resend = {
        let mgr = mgr.clone();
        tokio::spawn(async move { mgr.request_resend().await })
    };
    auth.entered.notified().await;

    // Back, then a fresh challenge for the same email
    mgr.cancel_challenge();
    let outcome = mgr.submit_credentials("a@b.com", "x").await;
    assert!(matches!(outcome, LoginOutcome::ChallengeRequired(_)));

    auth.release.notify_one();
    let stale = resend.await.unwrap().unwrap();
    assert!(matches!(stale, ResendOutcome::Superseded));

    // The failed stale resend did not expire the new countdown
    assert_eq!(mgr.pending_challenge().unwrap().resend_in_secs, 300);
}

#[tokio::test]
async fn test_newer_login_supersedes_older() {
    let (mgr, auth) = manager();

    let slow = {
        let mgr = mgr.clone();
        tokio::spawn(async move { mgr.submit_credentials("a@b.com", "slow").await })
    };
    auth.entered.notified().await;

    let outcome = mgr.submit_credentials("a@b.com", "x").await;
    assert!(matches!(outcome, LoginOutcome::ChallengeRequired(_)));

    auth.release.notify_one();
    let stale = slow.await.unwrap();
    assert!(matches!(stale, LoginOutcome::Superseded));

    // The stale response did not replace the live challenge
    assert_eq!(mgr.pending_challenge().unwrap().subject, "a@b.com");
}

#[tokio::test]
async fn test_logout_during_verify_discards_response() {
    let (mgr, auth) = manager();
    mgr.submit_credentials("a@b.com", "x").await;
    mgr.paste_challenge_code("999999").unwrap();

    let verify = {
        let mgr = mgr.clone();
        tokio::spawn(async move { mgr.verify_challenge().await })
    };
    auth.entered.notified().await;

    mgr.logout();
    auth.release.notify_one();

    let outcome = verify.await.unwrap().unwrap();
    assert!(matches!(outcome, VerifyOutcome::Superseded));
    assert_eq!(mgr.state(), AuthState::Unauthenticated);
    assert!(mgr.current_session().is_none());
    assert!(mgr.restore_session().is_none());
}

#[tokio::test]
async fn test_session_survives_restart_with_file_store() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let path = temp.path().join("session.json");
    let auth = Arc::new(ScriptedAuth::new());

    {
        let mgr = SessionManager::new(auth.clone(), Arc::new(FileStore::new(&path)));
        mgr.submit_credentials("a@b.com", "x").await;
        mgr.paste_challenge_code("123456").unwrap();
        mgr.verify_challenge().await.unwrap();
    }
    assert!(path.exists());

    let mgr = SessionManager::new(auth.clone(), Arc::new(FileStore::new(&path)));
    assert_eq!(mgr.state(), AuthState::Unauthenticated);
    let session = mgr.restore_session().expect("session should restore");
    assert_eq!(session.principal.email, "a@b.com");
    assert_eq!(mgr.state(), AuthState::Authenticated);

    mgr.logout();
    let mgr = SessionManager::new(auth, Arc::new(FileStore::new(&path)));
    assert!(mgr.restore_session().is_none());
}

#[tokio::test]
async fn test_corrupt_session_file_is_discarded() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let path = temp.path().join("session.json");
    std::fs::write(&path, "{not json").unwrap();

    let mgr = SessionManager::new(Arc::new(ScriptedAuth::new()), Arc::new(FileStore::new(&path)));
    assert!(mgr.restore_session().is_none());
    assert_eq!(mgr.state(), AuthState::Unauthenticated);

    // Next login still persists
    mgr.submit_credentials("a@b.com", "x").await;
    mgr.paste_challenge_code("123456").unwrap();
    mgr.verify_challenge().await.unwrap();
    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("sentinel.access_token"));
}
