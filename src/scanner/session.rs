//! Per-session scan bookkeeping

use crate::scanner::{ScanMode, ScanState};
use serde::Serialize;
use uuid::Uuid;

/// Whether a polling tick may start detection work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    /// A detection is still in flight
    Skip,
    /// The session is now busy; the caller must finish the tick
    Run,
}

/// Result of offering a detected code to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeOutcome {
    /// First time this code is seen
    New,
    /// Same as the last detected code; suppressed
    Repeated,
}

/// State of one scan from start until stop, detection or failure
#[derive(Debug, Clone)]
pub struct ScanSession {
    id: Uuid,
    generation: u64,
    mode: ScanMode,
    busy: bool,
    attempt_count: u32,
    last_detected_code: Option<String>,
    hint_threshold: u32,
}

impl ScanSession {
    /// Start a session, carrying over the previously detected code for dedup
    pub fn new(
        mode: ScanMode,
        generation: u64,
        last_detected_code: Option<String>,
        hint_threshold: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            generation,
            mode,
            busy: false,
            attempt_count: 0,
            last_detected_code,
            hint_threshold,
        }
    }

    /// Session identifier for logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Generation token the session was created under
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Detection mode
    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    /// Whether a detection is in flight
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Consecutive empty attempts
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Most recently detected code, if any
    pub fn last_detected_code(&self) -> Option<&str> {
        self.last_detected_code.as_deref()
    }

    /// Claim the session for one tick unless work is already outstanding.
    pub fn begin_tick(&mut self) -> TickDecision {
        if self.busy {
            TickDecision::Skip
        } else {
            self.busy = true;
            TickDecision::Run
        }
    }

    /// Release a claimed tick that produced no frame.
    pub fn abandon_tick(&mut self) {
        self.busy = false;
    }

    /// Record an attempt that found nothing. Returns true when a hint is due.
    pub fn record_empty(&mut self) -> bool {
        self.busy = false;
        self.attempt_count = self.attempt_count.saturating_add(1);
        hint_due(self.attempt_count, self.hint_threshold)
    }

    /// Record a detected code keyed by `key`.
    pub fn record_code(&mut self, key: &str) -> CodeOutcome {
        self.busy = false;
        self.attempt_count = 0;
        if self.last_detected_code.as_deref() == Some(key) {
            CodeOutcome::Repeated
        } else {
            self.last_detected_code = Some(key.to_string());
            CodeOutcome::New
        }
    }

    /// Forget the last detected code
    pub fn clear_last_detected(&mut self) {
        self.last_detected_code = None;
    }

    /// Immutable view for callers outside the controller
    pub fn snapshot(&self, state: ScanState) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            generation: self.generation,
            mode: self.mode,
            state,
            busy: self.busy,
            attempt_count: self.attempt_count,
            last_detected_code: self.last_detected_code.clone(),
        }
    }
}

// First hint after `threshold` empty attempts, then every `threshold` more.
fn hint_due(count: u32, threshold: u32) -> bool {
    threshold > 0 && count > threshold && (count - threshold - 1) % threshold == 0
}

/// Point-in-time copy of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    /// Session identifier
    pub id: Uuid,
    /// Generation token
    pub generation: u64,
    /// Detection mode
    pub mode: ScanMode,
    /// Controller state when the snapshot was taken
    pub state: ScanState,
    /// Whether a detection is in flight
    pub busy: bool,
    /// Consecutive empty attempts
    pub attempt_count: u32,
    /// Most recently detected code
    pub last_detected_code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_session_skips_ticks() {
        let mut session = ScanSession::new(ScanMode::Ocr, 1, None, 5);
        assert_eq!(session.begin_tick(), TickDecision::Run);
        assert_eq!(session.begin_tick(), TickDecision::Skip);
        assert_eq!(session.begin_tick(), TickDecision::Skip);
        session.record_empty();
        assert_eq!(session.begin_tick(), TickDecision::Run);
    }

    #[test]
    fn abandoned_tick_is_not_an_attempt() {
        let mut session = ScanSession::new(ScanMode::Qr, 1, None, 5);
        session.begin_tick();
        session.abandon_tick();
        assert!(!session.is_busy());
        assert_eq!(session.attempt_count(), 0);
    }

    #[test]
    fn hint_fires_on_sixth_empty_attempt() {
        let mut session = ScanSession::new(ScanMode::Ocr, 1, None, 5);
        let hints: Vec<bool> = (0..11)
            .map(|_| {
                session.begin_tick();
                session.record_empty()
            })
            .collect();
        assert_eq!(
            hints,
            vec![false, false, false, false, false, true, false, false, false, false, true]
        );
    }

    #[test]
    fn zero_threshold_disables_hints() {
        let mut session = ScanSession::new(ScanMode::Ocr, 1, None, 0);
        assert!((0..20).all(|_| !session.record_empty()));
    }

    #[test]
    fn repeated_code_is_suppressed_until_cleared() {
        let mut session = ScanSession::new(ScanMode::Qr, 1, Some("1234567890".into()), 5);
        session.record_empty();
        assert_eq!(session.record_code("1234567890"), CodeOutcome::Repeated);
        assert_eq!(session.attempt_count(), 0);

        assert_eq!(session.record_code("5555555555"), CodeOutcome::New);
        assert_eq!(session.record_code("5555555555"), CodeOutcome::Repeated);

        session.clear_last_detected();
        assert_eq!(session.record_code("5555555555"), CodeOutcome::New);
    }
}
