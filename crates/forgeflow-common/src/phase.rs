//! Pipeline phases and phase-result statuses.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A stage of the feature pipeline.
///
/// The five working phases run in a fixed order and end at `Completed`.
/// `Failed` is reachable from any non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeaturePhase {
    Analysis,
    Approaches,
    Judging,
    Implementation,
    Pr,
    Completed,
    Failed,
}

impl FeaturePhase {
    /// The fixed progression of a successful run.
    pub const ORDER: [FeaturePhase; 6] = [
        Self::Analysis,
        Self::Approaches,
        Self::Judging,
        Self::Implementation,
        Self::Pr,
        Self::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Approaches => "approaches",
            Self::Judging => "judging",
            Self::Implementation => "implementation",
            Self::Pr => "pr",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// The phase that follows this one on the success path.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Analysis => Some(Self::Approaches),
            Self::Approaches => Some(Self::Judging),
            Self::Judging => Some(Self::Implementation),
            Self::Implementation => Some(Self::Pr),
            Self::Pr => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    /// The phase immediately before this one on the success path.
    pub fn predecessor(&self) -> Option<Self> {
        match self {
            Self::Analysis | Self::Failed => None,
            Self::Approaches => Some(Self::Analysis),
            Self::Judging => Some(Self::Approaches),
            Self::Implementation => Some(Self::Judging),
            Self::Pr => Some(Self::Implementation),
            Self::Completed => Some(Self::Pr),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `to` respects the phase order.
    pub fn can_transition_to(&self, to: FeaturePhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == Self::Failed || self.next() == Some(to)
    }

    /// Check that a sequence of observed phases is a prefix of [`Self::ORDER`],
    /// optionally terminated by a single `Failed`.
    pub fn is_valid_history(history: &[FeaturePhase]) -> bool {
        let (body, tail_failed) = match history.split_last() {
            Some((Self::Failed, rest)) => (rest, true),
            _ => (history, false),
        };
        if body.len() > Self::ORDER.len() || (tail_failed && body.is_empty()) {
            return false;
        }
        if tail_failed && body.last() == Some(&Self::Completed) {
            return false;
        }
        body.iter().zip(Self::ORDER.iter()).all(|(a, b)| a == b)
    }
}

impl fmt::Display for FeaturePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeaturePhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analysis" => Ok(Self::Analysis),
            "approaches" => Ok(Self::Approaches),
            "judging" => Ok(Self::Judging),
            "implementation" => Ok(Self::Implementation),
            "pr" => Ok(Self::Pr),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid feature phase: {}", s)),
        }
    }
}

/// Status of a single phase result row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Running,
    Passed,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid phase status: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_roundtrip() {
        for phase in FeaturePhase::ORDER.iter().chain([FeaturePhase::Failed].iter()) {
            let parsed: FeaturePhase = phase.as_str().parse().unwrap();
            assert_eq!(parsed, *phase);
        }
        assert!("deploy".parse::<FeaturePhase>().is_err());
    }

    #[test]
    fn test_next_follows_order() {
        for pair in FeaturePhase::ORDER.windows(2) {
            assert_eq!(pair[0].next(), Some(pair[1]));
            assert_eq!(pair[1].predecessor(), Some(pair[0]));
        }
        assert_eq!(FeaturePhase::Completed.next(), None);
        assert_eq!(FeaturePhase::Failed.next(), None);
    }

    #[test]
    fn test_transitions() {
        assert!(FeaturePhase::Analysis.can_transition_to(FeaturePhase::Approaches));
        assert!(FeaturePhase::Judging.can_transition_to(FeaturePhase::Failed));
        assert!(!FeaturePhase::Judging.can_transition_to(FeaturePhase::Analysis));
        assert!(!FeaturePhase::Analysis.can_transition_to(FeaturePhase::Judging));
        assert!(!FeaturePhase::Completed.can_transition_to(FeaturePhase::Failed));
        assert!(!FeaturePhase::Failed.can_transition_to(FeaturePhase::Analysis));
    }

    #[test]
    fn test_valid_history() {
        use FeaturePhase::*;
        assert!(FeaturePhase::is_valid_history(&[Analysis]));
        assert!(FeaturePhase::is_valid_history(&[
            Analysis,
            Approaches,
            Judging,
            Implementation,
            Pr,
            Completed
        ]));
        assert!(FeaturePhase::is_valid_history(&[Analysis, Approaches, Judging, Failed]));
        assert!(!FeaturePhase::is_valid_history(&[Analysis, Judging]));
        assert!(!FeaturePhase::is_valid_history(&[Analysis, Approaches, Analysis]));
        assert!(!FeaturePhase::is_valid_history(&[Failed]));
        assert!(!FeaturePhase::is_valid_history(&[Analysis, Failed, Approaches]));
    }

    #[test]
    fn test_phase_status_terminal() {
        assert!(!PhaseStatus::Running.is_terminal());
        assert!(PhaseStatus::Passed.is_terminal());
        assert!(PhaseStatus::Failed.is_terminal());
        assert_eq!(serde_json::to_string(&PhaseStatus::Passed).unwrap(), "\"passed\"");
    }
}
