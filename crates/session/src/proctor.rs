//! Proctoring monitor.
//!
//! Turns focus and fullscreen signals from the candidate's environment into
//! violation intents. Detection only: re-entering fullscreen is requested
//! but never assumed.

use crate::LifecycleState;
use crate::reducer::Intent;

/// Environment signal observed on the candidate side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProctorSignal {
    FullscreenExited,
    FullscreenEntered,
    VisibilityHidden,
    VisibilityVisible,
}

/// Tracks the viewing context and emits one violation per breach signal.
///
/// Repeated signals are not coalesced: two exits in a row are two
/// violations.
#[derive(Debug, Clone, Default)]
pub struct ProctorMonitor {
    fullscreen: bool,
    hidden: bool,
    violations_emitted: u64,
}

impl ProctorMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a signal; returns the intent to submit, if any.
    pub fn observe(&mut self, signal: ProctorSignal, lifecycle: LifecycleState) -> Option<Intent> {
        let breach = match signal {
            ProctorSignal::FullscreenExited => {
                self.fullscreen = false;
                true
            }
            ProctorSignal::VisibilityHidden => {
                self.hidden = true;
                true
            }
            ProctorSignal::FullscreenEntered => {
                self.fullscreen = true;
                false
            }
            ProctorSignal::VisibilityVisible => {
                self.hidden = false;
                false
            }
        };

        if breach && lifecycle == LifecycleState::Active {
            self.violations_emitted += 1;
            Some(Intent::Violation)
        } else {
            None
        }
    }

    /// Whether a fullscreen re-entry attempt should be made.
    pub fn wants_fullscreen(&self, lifecycle: LifecycleState) -> bool {
        lifecycle == LifecycleState::Active && !self.fullscreen
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn violations_emitted(&self) -> u64 {
        self.violations_emitted
    }
}
