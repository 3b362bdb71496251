//! Translation of proposed session patches into reducer intents.
//!
//! Clients and admins describe changes as partial field sets. Neither is
//! allowed to write those fields; each patch is decomposed into the
//! intents that would produce it, and the reducer decides what survives.

use crate::reducer::{Intent, Rejection};
use crate::{LifecycleState, MAX_STRIKES, Millis, QuestionId, Session, SessionPatch};

/// A patch field a candidate may not change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoredField {
    Profile,
    Lifecycle {
        from: LifecycleState,
        to: LifecycleState,
    },
    Round {
        from: u32,
        to: u32,
    },
    RoundStart {
        stored: Option<Millis>,
        proposed: Option<Millis>,
    },
    ViolationDecrease {
        from: u32,
        to: u32,
    },
}

/// Intents derived from a candidate patch, plus what was left out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchPlan {
    pub intents: Vec<Intent>,
    pub ignored: Vec<IgnoredField>,
}

impl PatchPlan {
    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }
}

/// Decompose a candidate-proposed patch against the stored session.
///
/// Order: lifecycle entry, submissions, violations, round completion,
/// round arming, finish.
pub fn candidate_intents(current: &Session, patch: &SessionPatch) -> PatchPlan {
    use LifecycleState::*;

    let mut plan = PatchPlan::default();

    if let Some(profile) = &patch.profile
        && profile != &current.profile
    {
        plan.ignored.push(IgnoredField::Profile);
    }

    // Lifecycle entry along the candidate path.
    let target = patch.lifecycle.unwrap_or(current.lifecycle);
    let mut finish = false;
    match (current.lifecycle, target) {
        (from, to) if from == to => {}
        // Strike termination is derived from the violation count.
        (_, Terminated) => {}
        (Registering, Instructions) => plan.intents.push(Intent::CompleteRegistration),
        (Registering, Active | Submitted) => {
            plan.intents.push(Intent::CompleteRegistration);
            plan.intents.push(Intent::Start);
            finish = target == Submitted;
        }
        (Instructions, Active | Submitted) => {
            plan.intents.push(Intent::Start);
            finish = target == Submitted;
        }
        (Active, Submitted) => finish = true,
        (from, to) => plan.ignored.push(IgnoredField::Lifecycle { from, to }),
    }

    let mut questions: Vec<&QuestionId> = patch.scores.keys().chain(patch.code.keys()).collect();
    questions.sort();
    questions.dedup();
    for question in questions {
        plan.intents.push(Intent::RecordSubmission {
            question: question.clone(),
            code: patch.code.get(question).cloned(),
            score: patch.scores.get(question).copied(),
        });
    }

    // An absolute count is only meaningful against the record it was
    // computed from; callers strip it from patches based on older revisions.
    let mut strikes = patch.violations_added;
    if let Some(proposed) = patch.violation_count {
        if proposed > current.violation_count {
            strikes = strikes.saturating_add(proposed - current.violation_count);
        } else if proposed < current.violation_count {
            plan.ignored.push(IgnoredField::ViolationDecrease {
                from: current.violation_count,
                to: proposed,
            });
        }
    }
    plan.intents.extend(std::iter::repeat_n(
        Intent::Violation,
        strikes.min(MAX_STRIKES + 1) as usize,
    ));

    let mut advanced = false;
    if let Some(round) = patch.current_round {
        if round == current.current_round + 1 {
            plan.intents.push(Intent::CompleteRound);
            advanced = true;
        } else if round != current.current_round {
            plan.ignored.push(IgnoredField::Round {
                from: current.current_round,
                to: round,
            });
        }
    }

    if let Some(proposed) = patch.round_started_at {
        let unarmed = advanced || current.round_started_at.is_none();
        match proposed {
            Some(at) if unarmed => plan.intents.push(Intent::ArmRound { at }),
            // Clearing accompanies a round change or a finish.
            None if advanced || finish => {}
            _ => plan.ignored.push(IgnoredField::RoundStart {
                stored: current.round_started_at,
                proposed,
            }),
        }
    }

    if finish {
        plan.intents.push(Intent::Finish);
    }

    plan
}

/// Decompose an admin force-update into admin intents.
///
/// Lifecycle comes first so explicit field values in the same patch win
/// over the side effects of the transition.
pub fn admin_intents(current: &Session, patch: &SessionPatch) -> Result<Vec<Intent>, Rejection> {
    use LifecycleState::*;

    let mut intents = Vec::new();

    if let Some(target) = patch.lifecycle {
        match (current.lifecycle, target) {
            (from, to) if from == to => {}
            (_, Submitted) => intents.push(Intent::ForceSubmit),
            (_, Terminated) => intents.push(Intent::Disqualify),
            (Terminated, Active) => intents.push(Intent::Unlock),
            (Registering, Instructions) => intents.push(Intent::CompleteRegistration),
            (Registering, Active) => {
                intents.push(Intent::CompleteRegistration);
                intents.push(Intent::Start);
            }
            (Instructions, Active) => intents.push(Intent::Start),
            (from, _) => {
                return Err(Rejection::WrongState {
                    intent: "force_update",
                    lifecycle: from,
                });
            }
        }
    }

    if let Some(profile) = &patch.profile {
        intents.push(Intent::EditProfile(profile.clone()));
    }

    let mut questions: Vec<&QuestionId> = patch.scores.keys().chain(patch.code.keys()).collect();
    questions.sort();
    questions.dedup();
    for question in questions {
        intents.push(Intent::OverwriteWork {
            question: question.clone(),
            code: patch.code.get(question).cloned(),
            score: patch.scores.get(question).copied(),
        });
    }

    if let Some(round) = patch.current_round {
        intents.push(Intent::SetRound { round });
    }
    if let Some(at) = patch.round_started_at {
        intents.push(Intent::SetRoundStart { at });
    }
    if let Some(count) = patch.violation_count {
        intents.push(Intent::SetViolations {
            count: count.saturating_add(patch.violations_added),
        });
    } else if patch.violations_added > 0 {
        intents.push(Intent::SetViolations {
            count: current.violation_count.saturating_add(patch.violations_added),
        });
    }

    Ok(intents)
}
