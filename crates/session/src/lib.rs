//! Vigil Session Core
//!
//! This crate contains the authoritative, deterministic model of one
//! candidate's contest session and the reducer that governs it. Every
//! component that wants to change a session (the synchronization protocol,
//! the admin router, the global tick, the client-side proctoring monitor)
//! submits an [`Intent`]; only [`reduce`] produces a new [`Session`].
//!
//! # Architecture Constraints
//!
//! The Session Core MUST NOT:
//! - Perform I/O operations (file, network, etc.)
//! - Read wall-clock time (`now` is always an explicit parameter)
//! - Hold process-wide mutable state
//!
//! Remaining round time is derived from a single persisted instant
//! (`round_started_at`), never from a ticking counter, so a session survives
//! reconnects, reloads and server restarts with nothing but its record.

#![deny(unsafe_code)]

pub mod oracle;
pub mod patch;
pub mod proctor;
pub mod reducer;
pub mod timer;

use std::collections::BTreeMap;

pub use oracle::{ScoringOracle, SnippetOracle, Verdict};
pub use patch::{IgnoredField, PatchPlan, admin_intents, candidate_intents};
pub use proctor::{ProctorMonitor, ProctorSignal};
pub use reducer::{Batch, Context, Intent, Reduction, Rejection, admit, reduce, reduce_all};
pub use timer::{RoundSchedule, ScheduleError, remaining_secs};

// ============================================================================
// Type Aliases
// ============================================================================

/// Stable business key of a candidate (roll number).
pub type Identity = String;

/// Transient connection identifier assigned by the coordinator.
///
/// Strictly increasing for the lifetime of a coordinator process.
pub type ConnectionId = u64;

/// Milliseconds since the Unix epoch.
pub type Millis = u64;

/// Identifier of a question within the question bank.
pub type QuestionId = String;

// ============================================================================
// Contest Constants
// ============================================================================

/// Number of rounds in a contest.
pub const MAX_ROUND: u32 = 3;

/// Strikes tolerated before a session is terminated (`count > MAX_STRIKES`).
pub const MAX_STRIKES: u32 = 3;

/// Violation count written by an admin disqualification.
///
/// Distinguishes admin termination from strike-based termination in views.
pub const DISQUALIFIED_SENTINEL: u32 = 99;

// ============================================================================
// Lifecycle
// ============================================================================

/// Phase of a candidate's contest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LifecycleState {
    Registering,
    Instructions,
    Active,
    Submitted,
    Terminated,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registering => "REGISTERING",
            Self::Instructions => "INSTRUCTIONS",
            Self::Active => "ACTIVE",
            Self::Submitted => "SUBMITTED",
            Self::Terminated => "TERMINATED",
        }
    }

    /// SUBMITTED and TERMINATED do not advance on timers.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Submitted | Self::Terminated)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contest track chosen at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    C,
    Java,
    Python,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::C => "c",
            Self::Java => "java",
            Self::Python => "python",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "c" => Some(Self::C),
            "java" => Some(Self::Java),
            "python" => Some(Self::Python),
            _ => None,
        }
    }
}

/// Candidate-supplied registration details.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub full_name: String,
    pub college: String,
    pub department: String,
    pub year: String,
    pub email: String,
}

// ============================================================================
// Session
// ============================================================================

/// Durable record of one candidate's contest progress.
///
/// `connection_id` and `last_seen_at` are server-derived: they are never
/// taken from a client snapshot and do not participate in content equality.
/// `revision` is assigned by the server whenever accepted content changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub identity: Identity,
    pub profile: Profile,
    pub language: Language,
    pub lifecycle: LifecycleState,
    /// In `[1, max_round]`.
    pub current_round: u32,
    /// `None` means the round timer arms on the next tick.
    pub round_started_at: Option<Millis>,
    pub violation_count: u32,
    pub scores: BTreeMap<QuestionId, i64>,
    pub code: BTreeMap<QuestionId, String>,
    /// Set iff `lifecycle == Submitted`.
    pub submitted_at: Option<Millis>,
    pub connection_id: Option<ConnectionId>,
    pub last_seen_at: Millis,
    pub revision: u64,
}

impl Session {
    /// Create a session that has not completed registration yet.
    pub fn new(identity: impl Into<Identity>, profile: Profile, language: Language) -> Self {
        Self {
            identity: identity.into(),
            profile,
            language,
            lifecycle: LifecycleState::Registering,
            current_round: 1,
            round_started_at: None,
            violation_count: 0,
            scores: BTreeMap::new(),
            code: BTreeMap::new(),
            submitted_at: None,
            connection_id: None,
            last_seen_at: 0,
            revision: 0,
        }
    }

    /// Sum of all question scores.
    pub fn total_score(&self) -> i64 {
        self.scores.values().sum()
    }

    /// Equality over everything a client or admin can influence.
    pub fn same_content(&self, other: &Session) -> bool {
        self.identity == other.identity
            && self.profile == other.profile
            && self.language == other.language
            && self.lifecycle == other.lifecycle
            && self.current_round == other.current_round
            && self.round_started_at == other.round_started_at
            && self.violation_count == other.violation_count
            && self.scores == other.scores
            && self.code == other.code
            && self.submitted_at == other.submitted_at
    }

    /// Fields of `newer` that differ from `self`, as a patch.
    ///
    /// Map entries are only ever added or overwritten, so removed keys are
    /// not represented.
    pub fn diff(&self, newer: &Session) -> SessionPatch {
        let mut patch = SessionPatch::default();
        if self.profile != newer.profile {
            patch.profile = Some(newer.profile.clone());
        }
        if self.lifecycle != newer.lifecycle {
            patch.lifecycle = Some(newer.lifecycle);
        }
        if self.current_round != newer.current_round {
            patch.current_round = Some(newer.current_round);
        }
        if self.round_started_at != newer.round_started_at {
            patch.round_started_at = Some(newer.round_started_at);
        }
        if self.violation_count != newer.violation_count {
            patch.violation_count = Some(newer.violation_count);
        }
        for (question, score) in &newer.scores {
            if self.scores.get(question) != Some(score) {
                patch.scores.insert(question.clone(), *score);
            }
        }
        for (question, code) in &newer.code {
            if self.code.get(question) != Some(code) {
                patch.code.insert(question.clone(), code.clone());
            }
        }
        patch
    }

    /// Like [`Session::diff`], but new strikes are stated as a count added
    /// on top of `self` instead of an absolute value, so the patch still
    /// means the same thing against a record the admin has since edited.
    pub fn candidate_diff(&self, newer: &Session) -> SessionPatch {
        let mut patch = self.diff(newer);
        if let Some(count) = patch.violation_count.take() {
            patch.violations_added = count.saturating_sub(self.violation_count);
        }
        patch
    }
}

/// Partial session fields proposed by a client or an admin.
///
/// `round_started_at` is tri-state: `None` leaves the field alone,
/// `Some(None)` clears it, `Some(Some(t))` sets it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    pub profile: Option<Profile>,
    pub lifecycle: Option<LifecycleState>,
    pub current_round: Option<u32>,
    pub round_started_at: Option<Option<Millis>>,
    pub violation_count: Option<u32>,
    /// Strikes observed since the patch's base; never an absolute count.
    pub violations_added: u32,
    pub scores: BTreeMap<QuestionId, i64>,
    pub code: BTreeMap<QuestionId, String>,
}

impl SessionPatch {
    pub fn is_empty(&self) -> bool {
        self.profile.is_none()
            && self.lifecycle.is_none()
            && self.current_round.is_none()
            && self.round_started_at.is_none()
            && self.violation_count.is_none()
            && self.violations_added == 0
            && self.scores.is_empty()
            && self.code.is_empty()
    }

    /// Fold a later patch into this one; the later patch wins per field.
    pub fn absorb(&mut self, later: SessionPatch) {
        if later.profile.is_some() {
            self.profile = later.profile;
        }
        if later.lifecycle.is_some() {
            self.lifecycle = later.lifecycle;
        }
        if later.current_round.is_some() {
            self.current_round = later.current_round;
        }
        if later.round_started_at.is_some() {
            self.round_started_at = later.round_started_at;
        }
        if later.violation_count.is_some() {
            self.violation_count = later.violation_count;
        }
        self.violations_added = self.violations_added.saturating_add(later.violations_added);
        self.scores.extend(later.scores);
        self.code.extend(later.code);
    }
}

// ============================================================================
// Contest Configuration
// ============================================================================

/// Process-wide contest status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlobalStatus {
    Active,
    Paused,
    Ended,
}

impl GlobalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Ended => "ended",
        }
    }
}

/// Result of changing the global status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub changed: bool,
    /// Suspension length to add back to every armed round timer.
    pub resume_shift_ms: Option<u64>,
}

/// Singleton contest configuration (durable).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContestConfig {
    pub status: GlobalStatus,
    /// Bumped by every full reset.
    pub epoch: u64,
    /// When timers were last suspended; `Some` iff `status != Active`.
    pub suspended_at: Option<Millis>,
    /// Round duration overrides in seconds, keyed by round.
    pub round_overrides_secs: BTreeMap<u32, u64>,
    pub updated_at: Millis,
}

impl Default for ContestConfig {
    fn default() -> Self {
        Self {
            status: GlobalStatus::Active,
            epoch: 1,
            suspended_at: None,
            round_overrides_secs: BTreeMap::new(),
            updated_at: 0,
        }
    }
}

impl ContestConfig {
    /// Whether round timers may arm and expire.
    pub fn timers_running(&self) -> bool {
        self.status == GlobalStatus::Active
    }

    /// Change the global status, recording suspension for pause correction.
    pub fn set_status(&mut self, status: GlobalStatus, now: Millis) -> StatusChange {
        if status == self.status {
            return StatusChange {
                changed: false,
                resume_shift_ms: None,
            };
        }

        let previous = self.status;
        self.status = status;
        self.updated_at = now;

        if previous == GlobalStatus::Active {
            self.suspended_at = Some(now);
            return StatusChange {
                changed: true,
                resume_shift_ms: None,
            };
        }

        if status == GlobalStatus::Active {
            let shift = self
                .suspended_at
                .take()
                .map(|since| now.saturating_sub(since));
            return StatusChange {
                changed: true,
                resume_shift_ms: shift,
            };
        }

        // Paused <-> Ended: still suspended since the original instant.
        StatusChange {
            changed: true,
            resume_shift_ms: None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
