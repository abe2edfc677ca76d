//! Specialist judge verdicts and the synthesized overall verdict.
//!
//! ## Types
//!
//! - [`JudgeCriterion`]: The five fixed review criteria, one judge each
//! - [`Verdict`]: A single judge's pass/concern/fail call
//! - [`JudgeFinding`]: One issue raised by a judge
//! - [`JudgeVerdict`]: The complete output of one judge
//! - [`Synthesis`]: The merged outcome across all judges
//!
//! ## Example
//!
//! ```
//! use forgeflow_common::judge::{FindingSeverity, JudgeCriterion, JudgeFinding, JudgeVerdict, Verdict};
//!
//! let verdict = JudgeVerdict::new(JudgeCriterion::Security, Verdict::Concern)
//!     .with_assessment("One injection risk")
//!     .add_finding(JudgeFinding::new(
//!         FindingSeverity::Major,
//!         "query built by string concat",
//!         "use bound parameters",
//!     ));
//!
//! assert!(verdict.has_major_findings());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeCriterion {
    Security,
    DefectRisk,
    Compatibility,
    Performance,
    Conventions,
}

impl JudgeCriterion {
    pub const ALL: [JudgeCriterion; 5] = [
        Self::Security,
        Self::DefectRisk,
        Self::Compatibility,
        Self::Performance,
        Self::Conventions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Security => "security",
            Self::DefectRisk => "defect_risk",
            Self::Compatibility => "compatibility",
            Self::Performance => "performance",
            Self::Conventions => "conventions",
        }
    }

    /// The judge agent that owns this criterion.
    pub fn agent_name(&self) -> &'static str {
        match self {
            Self::Security => "security-sentinel",
            Self::DefectRisk => "bug-hunter",
            Self::Compatibility => "compat-guardian",
            Self::Performance => "performance-oracle",
            Self::Conventions => "convention-keeper",
        }
    }

    pub fn from_agent_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.agent_name() == name)
    }
}

impl fmt::Display for JudgeCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JudgeCriterion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "security" => Ok(Self::Security),
            "defect_risk" => Ok(Self::DefectRisk),
            "compatibility" => Ok(Self::Compatibility),
            "performance" => Ok(Self::Performance),
            "conventions" => Ok(Self::Conventions),
            _ => Err(format!("Invalid judge criterion: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Concern,
    Fail,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pass => "pass",
            Self::Concern => "concern",
            Self::Fail => "fail",
        };
        f.write_str(s)
    }
}

/// Severity of a single finding, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingSeverity {
    Critical,
    Major,
    Minor,
}

impl fmt::Display for FindingSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::Major => "major",
            Self::Minor => "minor",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeFinding {
    pub severity: FindingSeverity,
    pub description: String,
    #[serde(default)]
    pub recommendation: String,
}

impl JudgeFinding {
    pub fn new(
        severity: FindingSeverity,
        description: impl Into<String>,
        recommendation: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            description: description.into(),
            recommendation: recommendation.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub criterion: JudgeCriterion,
    pub verdict: Verdict,
    #[serde(default)]
    pub findings: Vec<JudgeFinding>,
    #[serde(default, alias = "overallAssessment")]
    pub overall_assessment: String,
}

impl JudgeVerdict {
    pub fn new(criterion: JudgeCriterion, verdict: Verdict) -> Self {
        Self {
            criterion,
            verdict,
            findings: Vec::new(),
            overall_assessment: String::new(),
        }
    }

    pub fn with_assessment(mut self, assessment: &str) -> Self {
        self.overall_assessment = assessment.to_string();
        self
    }

    pub fn add_finding(mut self, finding: JudgeFinding) -> Self {
        self.findings.push(finding);
        self
    }

    pub fn has_major_findings(&self) -> bool {
        self.findings
            .iter()
            .any(|f| f.severity == FindingSeverity::Major)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallVerdict {
    Approved,
    ApprovedWithConditions,
    Rejected,
}

impl OverallVerdict {
    pub fn allows_progression(&self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

impl fmt::Display for OverallVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Approved => "approved",
            Self::ApprovedWithConditions => "approved_with_conditions",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Merged outcome of all specialist judges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Synthesis {
    pub verdict: OverallVerdict,
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_names_roundtrip() {
        for c in JudgeCriterion::ALL {
            assert_eq!(JudgeCriterion::from_agent_name(c.agent_name()), Some(c));
            assert_eq!(c.as_str().parse::<JudgeCriterion>().unwrap(), c);
        }
        assert_eq!(JudgeCriterion::from_agent_name("nobody"), None);
    }

    #[test]
    fn test_verdict_parses_camel_case_assessment() {
        let json = r#"{
            "criterion": "defect_risk",
            "verdict": "fail",
            "findings": [{"severity": "critical", "description": "nil deref", "recommendation": "guard it"}],
            "overallAssessment": "broken"
        }"#;
        let v: JudgeVerdict = serde_json::from_str(json).unwrap();
        assert_eq!(v.criterion, JudgeCriterion::DefectRisk);
        assert_eq!(v.verdict, Verdict::Fail);
        assert_eq!(v.findings[0].severity, FindingSeverity::Critical);
        assert_eq!(v.overall_assessment, "broken");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(FindingSeverity::Critical < FindingSeverity::Major);
        assert!(FindingSeverity::Major < FindingSeverity::Minor);
    }

    #[test]
    fn test_overall_verdict_progression() {
        assert!(OverallVerdict::Approved.allows_progression());
        assert!(OverallVerdict::ApprovedWithConditions.allows_progression());
        assert!(!OverallVerdict::Rejected.allows_progression());
    }
}
