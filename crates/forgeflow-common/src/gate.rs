//! Quality gate identifiers and results.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    Typecheck,
    Lint,
    Test,
    Build,
}

impl Gate {
    /// Cheapest signal first.
    pub const ORDER: [Gate; 4] = [Self::Typecheck, Self::Lint, Self::Test, Self::Build];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Typecheck => "typecheck",
            Self::Lint => "lint",
            Self::Test => "test",
            Self::Build => "build",
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Gate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "typecheck" => Ok(Self::Typecheck),
            "lint" => Ok(Self::Lint),
            "test" => Ok(Self::Test),
            "build" => Ok(Self::Build),
            _ => Err(format!("Invalid gate: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Passed,
    Failed,
}

impl GateStatus {
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 { Self::Passed } else { Self::Failed }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: Gate,
    pub status: GateStatus,
    /// Tail of combined stdout and stderr.
    pub output: String,
    pub attempt: u32,
    #[serde(default)]
    pub exit_code: i32,
}

impl GateResult {
    pub fn passed(&self) -> bool {
        self.status == GateStatus::Passed
    }
}

pub fn all_passed(results: &[GateResult]) -> bool {
    results.len() == Gate::ORDER.len() && results.iter().all(GateResult::passed)
}

pub fn first_failure(results: &[GateResult]) -> Option<&GateResult> {
    results.iter().find(|r| !r.passed())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(gate: Gate, code: i32) -> GateResult {
        GateResult {
            gate,
            status: GateStatus::from_exit_code(code),
            output: String::new(),
            attempt: 1,
            exit_code: code,
        }
    }

    #[test]
    fn test_exit_code_maps_to_status() {
        assert_eq!(GateStatus::from_exit_code(0), GateStatus::Passed);
        assert_eq!(GateStatus::from_exit_code(2), GateStatus::Failed);
    }

    #[test]
    fn test_all_passed_needs_every_gate() {
        let partial = vec![result(Gate::Typecheck, 0), result(Gate::Lint, 0)];
        assert!(!all_passed(&partial));
        let full: Vec<_> = Gate::ORDER.iter().map(|g| result(*g, 0)).collect();
        assert!(all_passed(&full));
    }

    #[test]
    fn test_first_failure() {
        let results = vec![result(Gate::Typecheck, 0), result(Gate::Lint, 1)];
        assert_eq!(first_failure(&results).map(|r| r.gate), Some(Gate::Lint));
    }
}
