//! Meta-judge: merges specialist verdicts into one overall verdict.
//!
//! Precedence, applied in order:
//!
//! - **Rejected**: any judge returned `fail`
//! - **ApprovedWithConditions**: any finding of `major` severity; the
//!   conditions are the union of those findings' recommendations
//! - **Approved**: otherwise
//!
//! ## Usage
//!
//! ```
//! use forgeflow::review::arbiter::synthesize;
//! use forgeflow_common::{JudgeCriterion, JudgeVerdict, OverallVerdict, Verdict};
//!
//! let verdicts: Vec<JudgeVerdict> = JudgeCriterion::ALL
//!     .into_iter()
//!     .map(|c| JudgeVerdict::new(c, Verdict::Pass))
//!     .collect();
//! assert_eq!(synthesize(&verdicts).verdict, OverallVerdict::Approved);
//! ```

use forgeflow_common::{FindingSeverity, JudgeVerdict, OverallVerdict, Synthesis, Verdict};

/// Deterministic synthesis over the judges' verdicts.
pub fn synthesize(verdicts: &[JudgeVerdict]) -> Synthesis {
    let failures: Vec<&JudgeVerdict> = verdicts
        .iter()
        .filter(|v| v.verdict == Verdict::Fail)
        .collect();
    if !failures.is_empty() {
        let reason = failures
            .iter()
            .map(|v| format!("{}: {}", v.criterion.agent_name(), failure_summary(v)))
            .collect::<Vec<_>>()
            .join("; ");
        return Synthesis {
            verdict: OverallVerdict::Rejected,
            conditions: Vec::new(),
            rejection_reason: Some(reason),
        };
    }

    let conditions = major_conditions(verdicts);
    if !conditions.is_empty() {
        return Synthesis {
            verdict: OverallVerdict::ApprovedWithConditions,
            conditions,
            rejection_reason: None,
        };
    }

    Synthesis {
        verdict: OverallVerdict::Approved,
        conditions: Vec::new(),
        rejection_reason: None,
    }
}

fn failure_summary(verdict: &JudgeVerdict) -> String {
    if !verdict.overall_assessment.trim().is_empty() {
        return verdict.overall_assessment.trim().to_string();
    }
    verdict
        .findings
        .iter()
        .min_by_key(|f| f.severity)
        .map(|f| f.description.clone())
        .unwrap_or_else(|| "verdict fail".to_string())
}

/// Recommendations of every major finding, deduplicated in judge order.
/// A finding without a recommendation contributes its description.
fn major_conditions(verdicts: &[JudgeVerdict]) -> Vec<String> {
    let mut conditions: Vec<String> = Vec::new();
    for finding in verdicts
        .iter()
        .flat_map(|v| v.findings.iter())
        .filter(|f| f.severity == FindingSeverity::Major)
    {
        let text = if finding.recommendation.trim().is_empty() {
            finding.description.trim()
        } else {
            finding.recommendation.trim()
        };
        if !text.is_empty() && !conditions.iter().any(|c| c == text) {
            conditions.push(text.to_string());
        }
    }
    conditions
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgeflow_common::{JudgeCriterion, JudgeFinding};

    fn all_pass() -> Vec<JudgeVerdict> {
        JudgeCriterion::ALL
            .into_iter()
            .map(|c| JudgeVerdict::new(c, Verdict::Pass))
            .collect()
    }

    #[test]
    fn test_all_pass_is_approved() {
        let synthesis = synthesize(&all_pass());
        assert_eq!(synthesis.verdict, OverallVerdict::Approved);
        assert!(synthesis.conditions.is_empty());
        assert!(synthesis.rejection_reason.is_none());
    }

    #[test]
    fn test_any_fail_rejects() {
        let mut verdicts = all_pass();
        verdicts[2] = JudgeVerdict::new(JudgeCriterion::Compatibility, Verdict::Fail)
            .with_assessment("Drops support for the legacy theme API");
        // A major finding elsewhere does not soften a fail.
        verdicts[0] = JudgeVerdict::new(JudgeCriterion::Security, Verdict::Concern).add_finding(
            JudgeFinding::new(FindingSeverity::Major, "unsafe html", "escape it"),
        );

        let synthesis = synthesize(&verdicts);
        assert_eq!(synthesis.verdict, OverallVerdict::Rejected);
        let reason = synthesis.rejection_reason.unwrap_or_default();
        assert!(reason.starts_with("compat-guardian: Drops support"));
        assert!(synthesis.conditions.is_empty());
    }

    #[test]
    fn test_fail_without_assessment_uses_most_severe_finding() {
        let mut verdicts = all_pass();
        verdicts[1] = JudgeVerdict::new(JudgeCriterion::DefectRisk, Verdict::Fail)
            .add_finding(JudgeFinding::new(FindingSeverity::Minor, "typo", ""))
            .add_finding(JudgeFinding::new(
                FindingSeverity::Critical,
                "toggle state is lost on reload",
                "persist it",
            ));
        let synthesis = synthesize(&verdicts);
        assert_eq!(
            synthesis.rejection_reason.as_deref(),
            Some("bug-hunter: toggle state is lost on reload")
        );
    }

    #[test]
    fn test_major_concern_adds_conditions() {
        let mut verdicts = all_pass();
        verdicts[1] = JudgeVerdict::new(JudgeCriterion::DefectRisk, Verdict::Concern)
            .add_finding(JudgeFinding::new(
                FindingSeverity::Major,
                "preference not persisted",
                "Persist the preference in localStorage",
            ))
            .add_finding(JudgeFinding::new(FindingSeverity::Minor, "naming", "rename"));

        let synthesis = synthesize(&verdicts);
        assert_eq!(synthesis.verdict, OverallVerdict::ApprovedWithConditions);
        assert_eq!(
            synthesis.conditions,
            vec!["Persist the preference in localStorage"]
        );
    }

    #[test]
    fn test_conditions_are_deduplicated() {
        let finding = JudgeFinding::new(FindingSeverity::Major, "x", "Add tests for the toggle");
        let mut verdicts = all_pass();
        verdicts[1] = JudgeVerdict::new(JudgeCriterion::DefectRisk, Verdict::Concern)
            .add_finding(finding.clone());
        verdicts[4] = JudgeVerdict::new(JudgeCriterion::Conventions, Verdict::Pass)
            .add_finding(finding)
            .add_finding(JudgeFinding::new(FindingSeverity::Major, "no docs", ""));
        let synthesis = synthesize(&verdicts);
        assert_eq!(
            synthesis.conditions,
            vec!["Add tests for the toggle", "no docs"]
        );
    }

    #[test]
    fn test_minor_findings_do_not_add_conditions() {
        let mut verdicts = all_pass();
        verdicts[3] = JudgeVerdict::new(JudgeCriterion::Performance, Verdict::Concern)
            .add_finding(JudgeFinding::new(FindingSeverity::Minor, "extra render", "memo"));
        assert_eq!(synthesize(&verdicts).verdict, OverallVerdict::Approved);
    }
}
