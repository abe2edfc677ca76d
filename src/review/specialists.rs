//! Specialist judges.
//!
//! Each [`JudgeCriterion`] is owned by one named judge with its own focus
//! areas. Judges see the same candidate approach and codebase map and only
//! get read-only tools.
//!
//! | Criterion       | Agent                |
//! |-----------------|----------------------|
//! | `security`      | `security-sentinel`  |
//! | `defect_risk`   | `bug-hunter`         |
//! | `compatibility` | `compat-guardian`    |
//! | `performance`   | `performance-oracle` |
//! | `conventions`   | `convention-keeper`  |

use forgeflow_common::{Approach, JudgeCriterion, MemoryRecord};

use crate::phases::prompts::with_memories;

/// Human-readable name for a criterion.
pub fn display_name(criterion: JudgeCriterion) -> &'static str {
    match criterion {
        JudgeCriterion::Security => "Security Sentinel",
        JudgeCriterion::DefectRisk => "Bug Hunter",
        JudgeCriterion::Compatibility => "Compatibility Guardian",
        JudgeCriterion::Performance => "Performance Oracle",
        JudgeCriterion::Conventions => "Convention Keeper",
    }
}

/// What the judge for `criterion` looks for.
pub fn focus_areas(criterion: JudgeCriterion) -> &'static [&'static str] {
    match criterion {
        JudgeCriterion::Security => &[
            "SQL injection vulnerabilities",
            "Cross-site scripting (XSS)",
            "Authentication bypass risks",
            "Secrets exposure in code or logs",
            "Input validation gaps",
            "Command injection vectors",
            "Path traversal vulnerabilities",
        ],
        JudgeCriterion::DefectRisk => &[
            "Null or undefined dereferences",
            "Unhandled error paths",
            "Race conditions and ordering bugs",
            "Off-by-one and boundary errors",
            "State that can get out of sync",
            "Missing or weak tests for the new behavior",
        ],
        JudgeCriterion::Compatibility => &[
            "Breaking changes to public APIs",
            "Changes to persisted data formats",
            "Browser or runtime support gaps",
            "Dependency version conflicts",
            "Behavior changes existing users rely on",
        ],
        JudgeCriterion::Performance => &[
            "N+1 query patterns",
            "Memory leaks and unbounded growth",
            "Algorithmic complexity issues",
            "Blocking operations in async code",
            "Unnecessary re-renders or recomputation",
            "Cache misuse or missing caching",
        ],
        JudgeCriterion::Conventions => &[
            "Deviation from existing project structure",
            "Naming inconsistent with the codebase",
            "Reinventing utilities the codebase already has",
            "Over-engineering and premature abstraction",
            "Style and lint rule violations",
        ],
    }
}

/// System prompt for one specialist judge.
pub fn judge_system(criterion: JudgeCriterion) -> String {
    let focus = focus_areas(criterion)
        .iter()
        .map(|area| format!("- {}", area))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You are {agent}, the {name} judge for an automated feature pipeline. You review a \
proposed implementation approach before any code is written, strictly from the \
{criterion} perspective. You have read-only access to the repository; check the \
codebase before you raise a finding.

## Focus areas
{focus}

## Verdicts
- "pass": no issues worth blocking on
- "concern": issues that must be addressed during implementation
- "fail": the approach must not proceed

Every finding needs a severity ("critical", "major" or "minor"), a description and \
a concrete recommendation. Major findings become conditions the coder must satisfy.

Reply with a single JSON object in a ```json block:
{{
  "criterion": "{criterion}",
  "verdict": "pass",
  "findings": [
    {{"severity": "major", "description": "...", "recommendation": "..."}}
  ],
  "overallAssessment": "one paragraph"
}}"#,
        agent = criterion.agent_name(),
        name = display_name(criterion),
        criterion = criterion.as_str(),
        focus = focus,
    )
}

/// User prompt shared by all judges.
pub fn judge_prompt(
    feature: &str,
    codebase_map: &str,
    approach: &Approach,
    memories: &[MemoryRecord],
) -> String {
    let mut body = format!(
        "## Feature request\n{}\n\n## Codebase map\n{}\n\n## Candidate approach {}: {}\n{}\n\n### Plan\n{}",
        feature, codebase_map, approach.id, approach.title, approach.summary, approach.plan
    );
    if !approach.tradeoffs.is_empty() {
        body.push_str(&format!("\n\n### Tradeoffs\n{}", approach.tradeoffs));
    }
    with_memories(body, memories)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_judge_system_names_only_its_specialist() {
        for criterion in JudgeCriterion::ALL {
            let system = judge_system(criterion);
            assert!(system.starts_with(&format!("You are {}", criterion.agent_name())));
            for other in JudgeCriterion::ALL.iter().filter(|c| **c != criterion) {
                assert!(!system.contains(other.agent_name()));
            }
        }
    }

    #[test]
    fn test_every_criterion_has_focus_areas() {
        for criterion in JudgeCriterion::ALL {
            assert!(!focus_areas(criterion).is_empty());
        }
        assert!(judge_system(JudgeCriterion::Security).contains("Path traversal"));
    }

    #[test]
    fn test_judge_prompt_includes_approach() {
        let approach = Approach {
            id: "B".into(),
            title: "Context provider".into(),
            summary: "React context".into(),
            plan: "1. add ThemeContext".into(),
            tradeoffs: "more re-renders".into(),
        };
        let prompt = judge_prompt("Add dark mode toggle", "map", &approach, &[]);
        assert!(prompt.contains("Candidate approach B: Context provider"));
        assert!(prompt.contains("### Tradeoffs\nmore re-renders"));
    }
}
