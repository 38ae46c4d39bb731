//! Timed, cancellable admin verification.
//!
//! ```text
//! Idle ──start──▶ Capturing ──match────▶ Verified(person)
//!                     │      ──deadline─▶ TimedOut
//!                     └───────cancel────▶ Cancelled
//! ```
//!
//! Each iteration checks, in order: cancellation, deadline, then the next
//! frame's probes against the roster-filtered gallery. The three terminal
//! states are final; exactly one of them is reported.

use crate::capture::{CancelToken, ProbeSource, SourceError, SourceGuard};
use crate::clock::Clock;
use crate::gallery::GallerySnapshot;
use crate::types::MatchResult;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("no admins configured")]
    NoRoster,
    #[error("no privileged identities enrolled")]
    NoPrivilegedIdentities,
    #[error("session polled before start")]
    NotStarted,
    #[error("frame source ended before verification completed")]
    SourceEnded,
    #[error("{0}")]
    Source(#[from] SourceError),
}

/// Terminal result of a verification session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VerificationOutcome {
    Verified { person_id: String },
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Capturing,
    Verified(String),
    TimedOut,
    Cancelled,
}

impl SessionState {
    pub fn outcome(&self) -> Option<VerificationOutcome> {
        match self {
            SessionState::Idle | SessionState::Capturing => None,
            SessionState::Verified(person_id) => Some(VerificationOutcome::Verified {
                person_id: person_id.clone(),
            }),
            SessionState::TimedOut => Some(VerificationOutcome::TimedOut),
            SessionState::Cancelled => Some(VerificationOutcome::Cancelled),
        }
    }
}

pub struct VerificationSession {
    gallery: GallerySnapshot,
    roster: Vec<String>,
    tolerance: f32,
    deadline: Duration,
    clock: Arc<dyn Clock>,
    started_at: Option<Instant>,
    state: SessionState,
}

impl VerificationSession {
    /// Create an idle session. `roster` should be read fresh for every session.
    pub fn new(
        gallery: &GallerySnapshot,
        roster: Vec<String>,
        tolerance: f32,
        deadline: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            gallery: gallery.clone(),
            roster,
            tolerance,
            deadline,
            clock,
            started_at: None,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Idle → Capturing.
    ///
    /// Narrows the gallery to roster members. Fails without entering
    /// Capturing when the roster is empty or none of its members has an
    /// enrolled embedding.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Ok(());
        }
        if self.roster.is_empty() {
            return Err(SessionError::NoRoster);
        }
        let privileged = self.gallery.restricted_to(&self.roster);
        if privileged.is_empty() {
            return Err(SessionError::NoPrivilegedIdentities);
        }

        tracing::info!(
            roster = self.roster.len(),
            embeddings = privileged.size(),
            deadline_secs = self.deadline.as_secs_f32(),
            "verification session started"
        );
        self.gallery = privileged;
        self.started_at = Some(self.clock.now());
        self.state = SessionState::Capturing;
        Ok(())
    }

    /// Run one iteration. Returns the outcome once a terminal state is reached.
    pub fn poll<P: ProbeSource + ?Sized>(
        &mut self,
        source: &mut P,
        cancel: &CancelToken,
    ) -> Result<Option<VerificationOutcome>, SessionError> {
        let started_at = match (&self.state, self.started_at) {
            (SessionState::Capturing, Some(at)) => at,
            (SessionState::Idle, _) | (SessionState::Capturing, None) => {
                return Err(SessionError::NotStarted)
            }
            (terminal, _) => return Ok(terminal.outcome()),
        };

        if cancel.is_cancelled() {
            return Ok(Some(self.finish(SessionState::Cancelled)));
        }
        if self.clock.now().saturating_duration_since(started_at) > self.deadline {
            return Ok(Some(self.finish(SessionState::TimedOut)));
        }

        let probes = source.next_probes()?.ok_or(SessionError::SourceEnded)?;
        for probe in &probes {
            match self.gallery.classify(&probe.embedding, self.tolerance) {
                MatchResult::Identified {
                    person_id,
                    distance,
                } => {
                    tracing::debug!(person = %person_id, distance, "privileged face matched");
                    return Ok(Some(self.finish(SessionState::Verified(person_id))));
                }
                MatchResult::Unknown { best_distance } => {
                    tracing::debug!(best_distance = ?best_distance, "face not privileged");
                }
            }
        }
        Ok(None)
    }

    /// Start (if idle) and poll until a terminal outcome. The source is
    /// released on every exit path, including configuration errors.
    pub fn run<P: ProbeSource + ?Sized>(
        mut self,
        source: &mut P,
        cancel: &CancelToken,
    ) -> Result<VerificationOutcome, SessionError> {
        let mut source = SourceGuard::new(source);
        self.start()?;
        loop {
            if let Some(outcome) = self.poll(&mut *source, cancel)? {
                return Ok(outcome);
            }
        }
    }

    fn finish(&mut self, state: SessionState) -> VerificationOutcome {
        let elapsed_ms = self
            .started_at
            .map(|at| self.clock.now().saturating_duration_since(at).as_millis() as u64)
            .unwrap_or_default();
        let outcome = match &state {
            SessionState::Verified(person_id) => {
                tracing::info!(person = %person_id, elapsed_ms, "admin verified");
                VerificationOutcome::Verified {
                    person_id: person_id.clone(),
                }
            }
            SessionState::TimedOut => {
                tracing::info!(elapsed_ms, "admin verification timed out");
                VerificationOutcome::TimedOut
            }
            _ => {
                tracing::info!(elapsed_ms, "admin verification cancelled");
                VerificationOutcome::Cancelled
            }
        };
        self.state = state;
        outcome
    }
}

/// Run a complete verification session against `roster` with a fresh snapshot of `gallery`.
pub fn start_verification_session<P: ProbeSource + ?Sized>(
    gallery: &GallerySnapshot,
    roster: Vec<String>,
    tolerance: f32,
    deadline: Duration,
    source: &mut P,
    cancel: &CancelToken,
    clock: Arc<dyn Clock>,
) -> Result<VerificationOutcome, SessionError> {
    VerificationSession::new(gallery, roster, tolerance, deadline, clock).run(source, cancel)
}
