//! One-Time Code Challenge
//!
//! Six-slot code buffer for the second authentication step, plus the resend
//! countdown. The countdown is a deadline owned by the challenge itself, so it
//! goes away together with the challenge.

use std::time::Duration;
use tokio::time::Instant;

use super::ValidationError;

/// Number of digits in a challenge code
pub const CODE_LENGTH: usize = 6;

/// Time before a new code may be requested (5 minutes)
pub const RESEND_WINDOW: Duration = Duration::from_secs(300);

/// Challenge status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStatus {
    /// Awaiting input or verification
    Open,
    /// Last verification attempt was rejected by the remote verifier
    Failed,
}

/// Pending second-factor challenge
#[derive(Debug, Clone)]
pub struct PendingChallenge {
    subject: String,
    slots: [Option<char>; CODE_LENGTH],
    resend_at: Instant,
    status: ChallengeStatus,
    input_error: Option<ValidationError>,
    next_index: Option<usize>,
}

impl PendingChallenge {
    /// Create a challenge for `subject`; the resend countdown starts now
    pub fn new(subject: impl Into<String>, now: Instant) -> Self {
        Self {
            subject: subject.into(),
            slots: [None; CODE_LENGTH],
            resend_at: now + RESEND_WINDOW,
            status: ChallengeStatus::Open,
            input_error: None,
            next_index: Some(0),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn slots(&self) -> &[Option<char>; CODE_LENGTH] {
        &self.slots
    }

    pub fn status(&self) -> ChallengeStatus {
        self.status
    }

    pub fn input_error(&self) -> Option<&ValidationError> {
        self.input_error.as_ref()
    }

    /// Write (or clear, with `""`) a single slot.
    ///
    /// Returns the suggested next index for UI auto-advance.
    pub fn set_digit(&mut self, index: usize, digit: &str) -> Result<Option<usize>, ValidationError> {
        if index >= CODE_LENGTH {
            return Err(self.reject(ValidationError::SlotOutOfRange { index }));
        }

        let mut chars = digit.chars();
        let value = match (chars.next(), chars.next()) {
            (None, _) => None,
            (Some(c), None) if c.is_ascii_digit() => Some(c),
            _ => return Err(self.reject(ValidationError::MalformedDigit)),
        };

        self.slots[index] = value;
        self.accept();

        self.next_index = match value {
            Some(_) if index + 1 < CODE_LENGTH => Some(index + 1),
            Some(_) => None,
            None => Some(index),
        };
        Ok(self.next_index)
    }

    /// Distribute 1-6 pasted digits left-to-right from slot 0.
    ///
    /// Slots past the pasted length are left untouched.
    pub fn paste(&mut self, raw: &str) -> Result<(), ValidationError> {
        let len = raw.chars().count();
        if len == 0 || len > CODE_LENGTH || !raw.chars().all(|c| c.is_ascii_digit()) {
            return Err(self.reject(ValidationError::MalformedPaste));
        }

        for (slot, c) in self.slots.iter_mut().zip(raw.chars()) {
            *slot = Some(c);
        }
        self.accept();
        self.next_index = if len < CODE_LENGTH { Some(len) } else { None };
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Assembled code, only when every slot is filled
    pub fn code(&self) -> Option<String> {
        self.slots.iter().copied().collect()
    }

    /// Time left before a resend is allowed
    pub fn resend_remaining(&self, now: Instant) -> Duration {
        self.resend_at.saturating_duration_since(now)
    }

    /// Restart the countdown after a successful resend
    pub fn restart_countdown(&mut self, now: Instant) {
        self.resend_at = now + RESEND_WINDOW;
    }

    /// Make a resend allowed immediately
    pub fn expire_countdown(&mut self, now: Instant) {
        self.resend_at = now;
    }

    pub fn mark_failed(&mut self) {
        self.status = ChallengeStatus::Failed;
    }

    /// Caller-facing snapshot
    pub fn view(&self, now: Instant) -> ChallengeView {
        let remaining = self.resend_remaining(now);
        // Round up so the UI never shows 0 while still throttled
        let resend_in_secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);

        ChallengeView {
            subject: self.subject.clone(),
            slots: self.slots,
            next_index: self.next_index,
            resend_in_secs,
            failed: self.status == ChallengeStatus::Failed,
            input_error: self.input_error.clone(),
        }
    }

    fn reject(&mut self, err: ValidationError) -> ValidationError {
        self.input_error = Some(err.clone());
        err
    }

    fn accept(&mut self) {
        self.input_error = None;
        self.status = ChallengeStatus::Open;
    }
}

/// Snapshot of a pending challenge handed to the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeView {
    pub subject: String,
    pub slots: [Option<char>; CODE_LENGTH],
    /// Slot the UI should focus next, if any
    pub next_index: Option<usize>,
    /// Seconds until `request_resend` is allowed
    pub resend_in_secs: u64,
    /// Last verification was rejected
    pub failed: bool,
    /// Last input that was refused
    pub input_error: Option<ValidationError>,
}

impl ChallengeView {
    /// Slots rendered as strings, empty for unfilled
    pub fn slot_strings(&self) -> Vec<String> {
        self.slots
            .iter()
            .map(|s| s.map(String::from).unwrap_or_default())
            .collect()
    }
}
