//! Scoring oracle stand-in for the judging backend.

/// Full marks for a question.
pub const FULL_SCORE: i64 = 30;

/// Partial marks for an attempt that does not contain the fix.
pub const PARTIAL_SCORE: i64 = 15;

/// Result of running a candidate's code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    pub score: i64,
    pub output: String,
}

/// Evaluates candidate code for one question.
pub trait ScoringOracle {
    fn evaluate(&self, code: &str, expected_fix: &str) -> Verdict;
}

/// Heuristic oracle: passes when the code contains the expected fix or
/// is not empty. Whitespace counts as code.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnippetOracle;

impl ScoringOracle for SnippetOracle {
    fn evaluate(&self, code: &str, expected_fix: &str) -> Verdict {
        let passed = code.contains(expected_fix) || !code.is_empty();
        if passed {
            Verdict {
                passed,
                score: FULL_SCORE,
                output: "All test cases passed".to_string(),
            }
        } else {
            Verdict {
                passed,
                score: PARTIAL_SCORE,
                output: "Compilation error: empty submission".to_string(),
            }
        }
    }
}
