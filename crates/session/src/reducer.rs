//! The session reducer: `(Session, Intent) -> Session`.
//!
//! Every state change goes through [`reduce`]. Callers never write session
//! fields directly; they propose intents and store whatever comes back.
//! Invariants are re-established after every intent by `normalize`, so no
//! sequence of intents can produce, for example, a violation count above
//! the strike limit on a non-terminated session.

use crate::timer::RoundSchedule;
use crate::{
    DISQUALIFIED_SENTINEL, LifecycleState, MAX_STRIKES, Millis, Profile, QuestionId, Session,
};

/// A proposed mutation of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    // Candidate
    /// REGISTERING -> INSTRUCTIONS.
    CompleteRegistration,
    /// INSTRUCTIONS -> ACTIVE.
    Start,
    /// Arm the current round at an explicit instant, if not yet armed.
    ArmRound { at: Millis },
    /// Periodic timer evaluation: arm if unarmed, expire if elapsed.
    Tick,
    /// Candidate finished the current round early.
    CompleteRound,
    /// Candidate submitted the whole contest.
    Finish,
    /// One proctoring violation.
    Violation,
    /// Latest code and/or score for a question.
    RecordSubmission {
        question: QuestionId,
        code: Option<String>,
        score: Option<i64>,
    },

    // Admin
    ForceSubmit,
    Disqualify,
    Unlock,
    /// Signed; positive values extend the round.
    AddTime { minutes: i64 },
    SetRound { round: u32 },
    SetRoundStart { at: Option<Millis> },
    SetViolations { count: u32 },
    EditProfile(Profile),
    OverwriteWork {
        question: QuestionId,
        code: Option<String>,
        score: Option<i64>,
    },

    // System
    /// Pause correction: move an armed round start forward.
    ShiftRoundStart { by_ms: u64 },
}

impl Intent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CompleteRegistration => "complete_registration",
            Self::Start => "start",
            Self::ArmRound { .. } => "arm_round",
            Self::Tick => "tick",
            Self::CompleteRound => "complete_round",
            Self::Finish => "finish",
            Self::Violation => "violation",
            Self::RecordSubmission { .. } => "record_submission",
            Self::ForceSubmit => "force_submit",
            Self::Disqualify => "disqualify",
            Self::Unlock => "unlock",
            Self::AddTime { .. } => "add_time",
            Self::SetRound { .. } => "set_round",
            Self::SetRoundStart { .. } => "set_round_start",
            Self::SetViolations { .. } => "set_violations",
            Self::EditProfile(_) => "edit_profile",
            Self::OverwriteWork { .. } => "overwrite_work",
            Self::ShiftRoundStart { .. } => "shift_round_start",
        }
    }

    /// Whether only the admin may issue this intent.
    pub fn is_admin(&self) -> bool {
        matches!(
            self,
            Self::ForceSubmit
                | Self::Disqualify
                | Self::Unlock
                | Self::AddTime { .. }
                | Self::SetRound { .. }
                | Self::SetRoundStart { .. }
                | Self::SetViolations { .. }
                | Self::EditProfile(_)
                | Self::OverwriteWork { .. }
        )
    }
}

/// Inputs the reducer needs besides the session itself.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    pub now: Millis,
    pub schedule: &'a RoundSchedule,
    pub max_strikes: u32,
    /// False while the contest is paused or ended.
    pub timers_running: bool,
}

impl<'a> Context<'a> {
    pub fn new(now: Millis, schedule: &'a RoundSchedule) -> Self {
        Self {
            now,
            schedule,
            max_strikes: MAX_STRIKES,
            timers_running: true,
        }
    }

    pub fn with_timers(mut self, running: bool) -> Self {
        self.timers_running = running;
        self
    }
}

/// Why an intent was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("{intent} not allowed in state {lifecycle}")]
    WrongState {
        intent: &'static str,
        lifecycle: LifecycleState,
    },
    #[error("round timer is not armed")]
    TimerNotArmed,
    #[error("round timers are suspended")]
    Suspended,
}

/// Outcome of one intent.
#[derive(Debug, Clone, PartialEq)]
pub enum Reduction {
    Changed(Session),
    Unchanged,
    Rejected(Rejection),
}

impl Reduction {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// Apply one intent.
pub fn reduce(session: &Session, intent: &Intent, ctx: &Context<'_>) -> Reduction {
    let mut next = session.clone();
    if let Err(rejection) = apply(&mut next, intent, ctx) {
        return Reduction::Rejected(rejection);
    }
    normalize(&mut next, ctx);
    if next.same_content(session) {
        Reduction::Unchanged
    } else {
        Reduction::Changed(next)
    }
}

/// Outcome of a sequence of intents.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub session: Session,
    pub changed: bool,
    pub rejected: Vec<(Intent, Rejection)>,
}

/// Apply intents in order; a rejected intent does not stop later ones.
pub fn reduce_all<'i>(
    session: &Session,
    intents: impl IntoIterator<Item = &'i Intent>,
    ctx: &Context<'_>,
) -> Batch {
    let mut current = session.clone();
    let mut changed = false;
    let mut rejected = Vec::new();
    for intent in intents {
        match reduce(&current, intent, ctx) {
            Reduction::Changed(next) => {
                current = next;
                changed = true;
            }
            Reduction::Unchanged => {}
            Reduction::Rejected(rejection) => rejected.push((intent.clone(), rejection)),
        }
    }
    Batch {
        session: current,
        changed,
        rejected,
    }
}

/// Adopt a client snapshot as the first stored record of its identity.
///
/// Server-derived fields are cleared and a snapshot still in REGISTERING
/// is completed to INSTRUCTIONS; invariants are then re-established.
pub fn admit(snapshot: &Session, ctx: &Context<'_>) -> Session {
    let mut admitted = snapshot.clone();
    admitted.connection_id = None;
    admitted.last_seen_at = 0;
    admitted.revision = 0;
    if admitted.lifecycle == LifecycleState::Registering {
        complete_registration(&mut admitted);
    }
    normalize(&mut admitted, ctx);
    admitted
}

// ============================================================================
// Transitions
// ============================================================================

fn wrong_state(intent: &Intent, session: &Session) -> Rejection {
    Rejection::WrongState {
        intent: intent.name(),
        lifecycle: session.lifecycle,
    }
}

fn require_active(intent: &Intent, session: &Session) -> Result<(), Rejection> {
    if session.lifecycle == LifecycleState::Active {
        Ok(())
    } else {
        Err(wrong_state(intent, session))
    }
}

fn apply(s: &mut Session, intent: &Intent, ctx: &Context<'_>) -> Result<(), Rejection> {
    use LifecycleState::*;

    match intent {
        Intent::CompleteRegistration => match s.lifecycle {
            Registering => complete_registration(s),
            Instructions => {}
            _ => return Err(wrong_state(intent, s)),
        },

        Intent::Start => match s.lifecycle {
            Instructions => s.lifecycle = Active,
            Active => {}
            _ => return Err(wrong_state(intent, s)),
        },

        Intent::ArmRound { at } => {
            require_active(intent, s)?;
            if !ctx.timers_running {
                return Err(Rejection::Suspended);
            }
            if s.round_started_at.is_none() {
                s.round_started_at = Some(*at);
            }
        }

        Intent::Tick => {
            if ctx.timers_running && s.lifecycle == Active {
                match s.round_started_at {
                    None => s.round_started_at = Some(ctx.now),
                    Some(started) => {
                        if ctx.schedule.remaining_secs(s.current_round, started, ctx.now) == 0 {
                            finish_round(s, ctx);
                        }
                    }
                }
            }
        }

        Intent::CompleteRound => {
            require_active(intent, s)?;
            finish_round(s, ctx);
        }

        Intent::Finish => match s.lifecycle {
            Active => submit(s, ctx.now),
            Submitted => {}
            _ => return Err(wrong_state(intent, s)),
        },

        Intent::Violation => {
            require_active(intent, s)?;
            s.violation_count = s.violation_count.saturating_add(1);
        }

        Intent::RecordSubmission {
            question,
            code,
            score,
        } => {
            require_active(intent, s)?;
            write_work(s, question, code, score);
        }

        Intent::ForceSubmit => {
            if s.lifecycle != Submitted {
                if s.violation_count > ctx.max_strikes {
                    s.violation_count = 0;
                }
                submit(s, ctx.now);
            }
        }

        Intent::Disqualify => {
            s.lifecycle = Terminated;
            s.violation_count = DISQUALIFIED_SENTINEL;
        }

        Intent::Unlock => {
            if s.lifecycle != Terminated {
                return Err(wrong_state(intent, s));
            }
            s.lifecycle = Active;
            s.violation_count = 0;
        }

        Intent::AddTime { minutes } => {
            let started = s.round_started_at.ok_or(Rejection::TimerNotArmed)?;
            let shifted = started as i128 + *minutes as i128 * 60_000;
            s.round_started_at = Some(shifted.clamp(0, u64::MAX as i128) as u64);
        }

        Intent::SetRound { round } => {
            s.current_round = (*round).clamp(1, ctx.schedule.max_round());
            s.round_started_at = if s.lifecycle == Active {
                Some(ctx.now)
            } else {
                None
            };
        }

        Intent::SetRoundStart { at } => s.round_started_at = *at,

        Intent::SetViolations { count } => s.violation_count = *count,

        Intent::EditProfile(profile) => s.profile = profile.clone(),

        Intent::OverwriteWork {
            question,
            code,
            score,
        } => write_work(s, question, code, score),

        Intent::ShiftRoundStart { by_ms } => {
            if let Some(started) = s.round_started_at {
                s.round_started_at = Some(started.saturating_add(*by_ms));
            }
        }
    }
    Ok(())
}

fn write_work(s: &mut Session, question: &QuestionId, code: &Option<String>, score: &Option<i64>) {
    if let Some(code) = code {
        s.code.insert(question.clone(), code.clone());
    }
    if let Some(score) = score {
        s.scores.insert(question.clone(), *score);
    }
}

/// REGISTERING to INSTRUCTIONS with no work carried over.
fn complete_registration(s: &mut Session) {
    s.lifecycle = LifecycleState::Instructions;
    s.current_round = 1;
    s.violation_count = 0;
    s.scores.clear();
    s.code.clear();
    s.round_started_at = None;
}

/// Advance to the next round, or submit after the last one.
fn finish_round(s: &mut Session, ctx: &Context<'_>) {
    if s.current_round < ctx.schedule.max_round() {
        s.current_round += 1;
        s.round_started_at = None;
    } else {
        submit(s, ctx.now);
    }
}

fn submit(s: &mut Session, now: Millis) {
    s.lifecycle = LifecycleState::Submitted;
    s.round_started_at = None;
    if s.submitted_at.is_none() {
        s.submitted_at = Some(now);
    }
}

/// Re-establish session invariants after a transition.
fn normalize(s: &mut Session, ctx: &Context<'_>) {
    s.current_round = s.current_round.clamp(1, ctx.schedule.max_round());

    if s.violation_count > ctx.max_strikes {
        s.lifecycle = LifecycleState::Terminated;
    }

    if s.lifecycle == LifecycleState::Submitted {
        if s.submitted_at.is_none() {
            s.submitted_at = Some(ctx.now);
        }
    } else {
        s.submitted_at = None;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Language, Profile};

    const NOW: Millis = 1_700_000_000_000;

    fn schedule() -> RoundSchedule {
        RoundSchedule::new(vec![1200, 1200, 1200]).unwrap()
    }

    fn active(schedule: &RoundSchedule) -> Session {
        let s = Session::new("R100", Profile::default(), Language::C);
        let ctx = Context::new(NOW, schedule);
        reduce_all(&s, &[Intent::CompleteRegistration, Intent::Start], &ctx).session
    }

    fn changed(reduction: Reduction) -> Session {
        match reduction {
            Reduction::Changed(s) => s,
            other => panic!("expected change, got {other:?}"),
        }
    }

    #[test]
    fn test_registration_and_start() {
        let sched = schedule();
        let s = active(&sched);
        assert_eq!(s.lifecycle, LifecycleState::Active);
        assert_eq!(s.current_round, 1);
        assert!(s.round_started_at.is_none());
    }

    #[test]
    fn test_first_tick_arms_timer() {
        let sched = schedule();
        let s = active(&sched);
        let s = changed(reduce(&s, &Intent::Tick, &Context::new(NOW + 5, &sched)));
        assert_eq!(s.round_started_at, Some(NOW + 5));

        // Second tick inside the round is a no-op.
        let later = Context::new(NOW + 60_000, &sched);
        assert_eq!(reduce(&s, &Intent::Tick, &later), Reduction::Unchanged);
    }

    #[test]
    fn test_tick_suspended_does_nothing() {
        let sched = schedule();
        let s = active(&sched);
        let ctx = Context::new(NOW, &sched).with_timers(false);
        assert_eq!(reduce(&s, &Intent::Tick, &ctx), Reduction::Unchanged);
        assert_eq!(
            reduce(&s, &Intent::ArmRound { at: NOW }, &ctx),
            Reduction::Rejected(Rejection::Suspended)
        );
    }

    #[test]
    fn test_expiry_advances_round() {
        let sched = schedule();
        let mut s = active(&sched);
        s.round_started_at = Some(NOW);
        let ctx = Context::new(NOW + 1_200_000, &sched);
        let s = changed(reduce(&s, &Intent::Tick, &ctx));
        assert_eq!(s.current_round, 2);
        assert!(s.round_started_at.is_none());
        assert_eq!(s.lifecycle, LifecycleState::Active);
    }

    /// Expiry of the last round submits once; later ticks change nothing.
    #[test]
    fn test_round_exhaustion_submits_once() {
        let sched = schedule();
        let mut s = active(&sched);
        s.current_round = 3;
        s.round_started_at = Some(NOW);
        let expiry = NOW + 1_200_000;
        let s = changed(reduce(&s, &Intent::Tick, &Context::new(expiry, &sched)));
        assert_eq!(s.lifecycle, LifecycleState::Submitted);
        assert_eq!(s.submitted_at, Some(expiry));
        assert_eq!(s.current_round, 3);

        for later in [expiry + 1_000, expiry + 5_000_000] {
            let ctx = Context::new(later, &sched);
            assert_eq!(reduce(&s, &Intent::Tick, &ctx), Reduction::Unchanged);
        }
    }

    #[test]
    fn test_violation_threshold() {
        let sched = schedule();
        let ctx = Context::new(NOW, &sched);
        let mut s = active(&sched);
        for expected in 1..=3 {
            s = changed(reduce(&s, &Intent::Violation, &ctx));
            assert_eq!(s.violation_count, expected);
            assert_eq!(s.lifecycle, LifecycleState::Active);
        }
        s = changed(reduce(&s, &Intent::Violation, &ctx));
        assert_eq!(s.violation_count, 4);
        assert_eq!(s.lifecycle, LifecycleState::Terminated);

        // Further violations are refused once terminated.
        assert!(reduce(&s, &Intent::Violation, &ctx).is_rejected());
    }

    #[test]
    fn test_disqualify_uses_sentinel() {
        let sched = schedule();
        let ctx = Context::new(NOW, &sched);
        let s = changed(reduce(&active(&sched), &Intent::Disqualify, &ctx));
        assert_eq!(s.lifecycle, LifecycleState::Terminated);
        assert_eq!(s.violation_count, DISQUALIFIED_SENTINEL);
    }

    #[test]
    fn test_unlock_resets_strikes() {
        let sched = schedule();
        let ctx = Context::new(NOW, &sched);
        let s = changed(reduce(&active(&sched), &Intent::Disqualify, &ctx));
        let s = changed(reduce(&s, &Intent::Unlock, &ctx));
        assert_eq!(s.lifecycle, LifecycleState::Active);
        assert_eq!(s.violation_count, 0);

        assert!(reduce(&s, &Intent::Unlock, &ctx).is_rejected());
    }

    #[test]
    fn test_force_submit_from_any_state() {
        let sched = schedule();
        let ctx = Context::new(NOW, &sched);

        let fresh = Session::new("R1", Profile::default(), Language::Java);
        let s = changed(reduce(&fresh, &Intent::ForceSubmit, &ctx));
        assert_eq!(s.lifecycle, LifecycleState::Submitted);
        assert_eq!(s.submitted_at, Some(NOW));

        let terminated = changed(reduce(&active(&sched), &Intent::Disqualify, &ctx));
        let s = changed(reduce(&terminated, &Intent::ForceSubmit, &ctx));
        assert_eq!(s.lifecycle, LifecycleState::Submitted);
        assert_eq!(s.violation_count, 0);

        // Already submitted: submittedAt is not rewritten.
        let later = Context::new(NOW + 10, &sched);
        assert_eq!(reduce(&s, &Intent::ForceSubmit, &later), Reduction::Unchanged);
    }

    /// +5 minutes with 600 s left leaves 900 s.
    #[test]
    fn test_add_time_moves_start_forward() {
        let sched = schedule();
        let ctx = Context::new(NOW, &sched);
        let mut s = active(&sched);
        s.round_started_at = Some(NOW - 600_000);
        assert_eq!(sched.remaining_secs(1, NOW - 600_000, NOW), 600);

        let s = changed(reduce(&s, &Intent::AddTime { minutes: 5 }, &ctx));
        assert_eq!(s.round_started_at, Some(NOW - 300_000));
        assert_eq!(sched.remaining_secs(1, NOW - 300_000, NOW), 900);

        let s = changed(reduce(&s, &Intent::AddTime { minutes: -5 }, &ctx));
        assert_eq!(s.round_started_at, Some(NOW - 600_000));
    }

    #[test]
    fn test_add_time_requires_armed_timer() {
        let sched = schedule();
        let ctx = Context::new(NOW, &sched);
        assert_eq!(
            reduce(&active(&sched), &Intent::AddTime { minutes: 5 }, &ctx),
            Reduction::Rejected(Rejection::TimerNotArmed)
        );
    }

    #[test]
    fn test_set_round_clamps_and_rearms() {
        let sched = schedule();
        let ctx = Context::new(NOW, &sched);
        let s = changed(reduce(&active(&sched), &Intent::SetRound { round: 9 }, &ctx));
        assert_eq!(s.current_round, 3);
        assert_eq!(s.round_started_at, Some(NOW));

        let s = changed(reduce(&s, &Intent::SetRound { round: 0 }, &ctx));
        assert_eq!(s.current_round, 1);
    }

    #[test]
    fn test_submission_only_while_active() {
        let sched = schedule();
        let ctx = Context::new(NOW, &sched);
        let submit = Intent::RecordSubmission {
            question: "q1".into(),
            code: Some("fix()".into()),
            score: Some(30),
        };
        let s = changed(reduce(&active(&sched), &submit, &ctx));
        assert_eq!(s.scores.get("q1"), Some(&30));
        assert_eq!(s.total_score(), 30);

        let fresh = Session::new("R2", Profile::default(), Language::C);
        assert!(reduce(&fresh, &submit, &ctx).is_rejected());

        // Admin overwrite ignores lifecycle.
        let overwrite = Intent::OverwriteWork {
            question: "q1".into(),
            code: None,
            score: Some(10),
        };
        let s = changed(reduce(&fresh, &overwrite, &ctx));
        assert_eq!(s.scores.get("q1"), Some(&10));
    }

    #[test]
    fn test_edit_profile_keeps_lifecycle() {
        let sched = schedule();
        let ctx = Context::new(NOW, &sched);
        let profile = Profile {
            full_name: "Ada".into(),
            ..Default::default()
        };
        let s = changed(reduce(&active(&sched), &Intent::EditProfile(profile.clone()), &ctx));
        assert_eq!(s.profile, profile);
        assert_eq!(s.lifecycle, LifecycleState::Active);
    }

    #[test]
    fn test_set_violations_over_limit_terminates() {
        let sched = schedule();
        let ctx = Context::new(NOW, &sched);
        let s = changed(reduce(&active(&sched), &Intent::SetViolations { count: 4 }, &ctx));
        assert_eq!(s.lifecycle, LifecycleState::Terminated);
    }

    #[test]
    fn test_shift_round_start_only_when_armed() {
        let sched = schedule();
        let ctx = Context::new(NOW, &sched);
        let s = active(&sched);
        assert_eq!(
            reduce(&s, &Intent::ShiftRoundStart { by_ms: 1_000 }, &ctx),
            Reduction::Unchanged
        );

        let mut armed = s;
        armed.round_started_at = Some(NOW);
        let shifted = changed(reduce(&armed, &Intent::ShiftRoundStart { by_ms: 1_000 }, &ctx));
        assert_eq!(shifted.round_started_at, Some(NOW + 1_000));
    }

    #[test]
    fn test_finish_and_complete_round() {
        let sched = schedule();
        let ctx = Context::new(NOW, &sched);
        let s = changed(reduce(&active(&sched), &Intent::CompleteRound, &ctx));
        assert_eq!(s.current_round, 2);

        let s = changed(reduce(&s, &Intent::Finish, &ctx));
        assert_eq!(s.lifecycle, LifecycleState::Submitted);
        assert!(reduce(&s, &Intent::CompleteRound, &ctx).is_rejected());
    }

    #[test]
    fn test_admit_normalizes_snapshot() {
        let sched = schedule();
        let ctx = Context::new(NOW, &sched);
        let mut snapshot = Session::new("R9", Profile::default(), Language::C);
        snapshot.connection_id = Some(77);
        snapshot.revision = 12;
        snapshot.scores.insert("q1".into(), 30);
        let admitted = admit(&snapshot, &ctx);
        assert_eq!(admitted.lifecycle, LifecycleState::Instructions);
        assert!(admitted.scores.is_empty());
        assert!(admitted.connection_id.is_none());
        assert_eq!(admitted.revision, 0);

        let mut cheating = active(&sched);
        cheating.violation_count = 7;
        cheating.current_round = 12;
        cheating.submitted_at = Some(NOW);
        let admitted = admit(&cheating, &ctx);
        assert_eq!(admitted.lifecycle, LifecycleState::Terminated);
        assert_eq!(admitted.current_round, 3);
        assert!(admitted.submitted_at.is_none());
    }

    #[test]
    fn test_reduce_all_collects_rejections() {
        let sched = schedule();
        let ctx = Context::new(NOW, &sched);
        let fresh = Session::new("R3", Profile::default(), Language::C);
        let batch = reduce_all(
            &fresh,
            &[Intent::Violation, Intent::CompleteRegistration],
            &ctx,
        );
        assert!(batch.changed);
        assert_eq!(batch.session.lifecycle, LifecycleState::Instructions);
        assert_eq!(batch.rejected.len(), 1);
        assert_eq!(batch.rejected[0].0, Intent::Violation);
    }
}
