//! Derived round timer.
//!
//! Remaining time is always recomputed from `round_started_at` and `now`.
//! There is no countdown state to lose across reconnects or restarts.

use crate::{MAX_ROUND, Millis};

/// Default round durations in seconds (rounds 1, 2, 3).
pub const DEFAULT_ROUND_SECS: [i64; MAX_ROUND as usize] = [30 * 60, 45 * 60, 60 * 60];

/// Round-timer misconfiguration. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("round schedule is empty")]
    Empty,
    #[error("round {round} has non-positive duration {secs}s")]
    NonPositive { round: u32, secs: i64 },
}

/// Per-round durations. Round numbers are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundSchedule {
    durations_secs: Vec<u64>,
}

impl RoundSchedule {
    /// Validate a list of per-round durations in seconds.
    pub fn new(durations_secs: Vec<i64>) -> Result<Self, ScheduleError> {
        if durations_secs.is_empty() {
            return Err(ScheduleError::Empty);
        }
        let mut validated = Vec::with_capacity(durations_secs.len());
        for (index, secs) in durations_secs.into_iter().enumerate() {
            if secs <= 0 {
                return Err(ScheduleError::NonPositive {
                    round: index as u32 + 1,
                    secs,
                });
            }
            validated.push(secs as u64);
        }
        Ok(Self {
            durations_secs: validated,
        })
    }

    /// Build from whole minutes, as accepted on the command line.
    pub fn from_minutes(minutes: &[i64]) -> Result<Self, ScheduleError> {
        Self::new(minutes.iter().map(|m| m.saturating_mul(60)).collect())
    }

    /// Number of rounds; the highest valid `current_round`.
    pub fn max_round(&self) -> u32 {
        self.durations_secs.len() as u32
    }

    /// Duration of `round`. Out-of-range rounds fall back to round 1.
    pub fn duration_secs(&self, round: u32) -> u64 {
        round
            .checked_sub(1)
            .and_then(|index| self.durations_secs.get(index as usize))
            .copied()
            .unwrap_or(self.durations_secs[0])
    }

    /// Replace the duration of one round, keeping validation rules.
    pub fn with_override(mut self, round: u32, secs: u64) -> Self {
        if secs > 0 && round >= 1 && round <= self.max_round() {
            self.durations_secs[(round - 1) as usize] = secs;
        }
        self
    }

    /// Remaining whole seconds of `round` started at `started_at`.
    pub fn remaining_secs(&self, round: u32, started_at: Millis, now: Millis) -> u64 {
        remaining_secs(self.duration_secs(round), started_at, now)
    }
}

impl Default for RoundSchedule {
    fn default() -> Self {
        Self {
            durations_secs: DEFAULT_ROUND_SECS.iter().map(|s| *s as u64).collect(),
        }
    }
}

/// `max(0, duration - floor((now - started_at) / 1000))`.
///
/// A start instant in the future (after an admin adds time) yields more
/// than `duration` remaining.
pub fn remaining_secs(duration_secs: u64, started_at: Millis, now: Millis) -> u64 {
    let elapsed_ms = now as i128 - started_at as i128;
    let elapsed_secs = elapsed_ms.div_euclid(1000);
    let remaining = duration_secs as i128 - elapsed_secs;
    remaining.clamp(0, u64::MAX as i128) as u64
}
