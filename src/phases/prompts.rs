//! System prompts and prompt builders for every agent role.
//!
//! Each system prompt names its role in the first sentence; nothing else in
//! the pipeline depends on the wording.

use forgeflow_common::memory::render_memories;
use forgeflow_common::{Approach, GateResult, MemoryRecord};

pub const ANALYSIS_ORCHESTRATOR_SYSTEM: &str = "\
You are the analysis orchestrator for an automated feature pipeline. Your job is to \
produce a codebase map that later phases will use to design and implement a feature.

Break the exploration into focused tasks and delegate each one with `spawn_explorer`. \
Explorers run read-only and return a written report. You may also read files yourself. \
Record anything later phases must not forget with `record_memory`.

When you have enough, reply with the final codebase map as Markdown: relevant \
directories and files, conventions, test and build setup, and the integration points \
for the requested feature. Do not propose a solution.";

pub const EXPLORER_SYSTEM: &str = "\
You are a codebase explorer. You have read-only tools over a repository checkout. \
Investigate exactly the task you are given and reply with a concise written report: \
file paths, the relevant code, and any conventions you observed. Do not speculate \
beyond what you read.";

pub const APPROACHES_SYSTEM: &str = "\
You are the approaches architect for an automated feature pipeline. Given a feature \
request and a codebase map, propose between two and four distinct implementation \
approaches. You may read files to check your assumptions.

Reply with a single JSON object in a ```json block:
{
  \"approaches\": [
    {
      \"id\": \"A\",
      \"title\": \"short title\",
      \"summary\": \"one paragraph\",
      \"plan\": \"numbered, file-level implementation steps\",
      \"tradeoffs\": \"what this gives up\"
    }
  ]
}
Ids must be unique.";

pub const CODER_SYSTEM: &str = "\
You are the implementation coder for an automated feature pipeline. Implement the \
approved plan in the repository using the file tools. Keep changes minimal and \
consistent with the codebase conventions. Add or update tests.

The repository will be checked by typecheck, lint, test and build gates after you \
finish. You may run them yourself with `bash`. Reply with a short summary of the \
changes when you are done.";

pub(crate) fn with_memories(mut body: String, memories: &[MemoryRecord]) -> String {
    let rendered = render_memories(memories);
    if !rendered.is_empty() {
        body.push_str("\n\n");
        body.push_str(&rendered);
    }
    body
}

pub fn analysis_prompt(feature: &str, max_explorers: u32, memories: &[MemoryRecord]) -> String {
    with_memories(
        format!(
            "## Feature request\n{}\n\nMap the parts of the codebase this feature touches. \
             Use at most {} explorers.",
            feature, max_explorers
        ),
        memories,
    )
}

pub fn explorer_prompt(task: &str) -> String {
    format!("## Task\n{}", task)
}

pub fn approaches_prompt(feature: &str, codebase_map: &str, memories: &[MemoryRecord]) -> String {
    with_memories(
        format!(
            "## Feature request\n{}\n\n## Codebase map\n{}",
            feature, codebase_map
        ),
        memories,
    )
}

pub struct CoderPromptInput<'a> {
    pub feature: &'a str,
    pub codebase_map: &'a str,
    pub approach: &'a Approach,
    pub conditions: &'a [String],
    pub memories: &'a [MemoryRecord],
    /// The failing gate from the previous attempt, if any.
    pub previous_failure: Option<&'a GateResult>,
}

pub fn coder_prompt(input: &CoderPromptInput<'_>) -> String {
    let mut body = format!(
        "## Feature request\n{}\n\n## Codebase map\n{}\n\n## Approved approach: {}\n{}\n\n### Plan\n{}",
        input.feature,
        input.codebase_map,
        input.approach.title,
        input.approach.summary,
        input.approach.plan
    );
    if !input.conditions.is_empty() {
        body.push_str("\n\n## Conditions from review\nThe implementation must address:\n");
        for condition in input.conditions {
            body.push_str(&format!("- {}\n", condition));
        }
    }
    if let Some(failure) = input.previous_failure {
        body.push_str(&format!(
            "\n\n## Previous attempt failed\nThe previous attempt failed the {} gate \
             (exit code {}). Its output was:\n\n```\n{}\n```\n\n\
             Fix the cause of this failure. The working tree still contains the previous \
             attempt's changes.",
            failure.gate, failure.exit_code, failure.output
        ));
    }
    with_memories(body, input.memories)
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgeflow_common::{FeaturePhase, Gate, GateStatus, MemoryKind};

    fn approach() -> Approach {
        Approach {
            id: "A".into(),
            title: "CSS variables".into(),
            summary: "Theme via custom properties".into(),
            plan: "1. add toggle".into(),
            tradeoffs: String::new(),
        }
    }

    #[test]
    fn test_coder_prompt_quotes_previous_failure() {
        let failure = GateResult {
            gate: Gate::Typecheck,
            status: GateStatus::Failed,
            output: "src/theme.ts(3,1): error TS2304".into(),
            attempt: 1,
            exit_code: 2,
        };
        let conditions = vec!["Persist the choice".to_string()];
        let prompt = coder_prompt(&CoderPromptInput {
            feature: "Add dark mode toggle",
            codebase_map: "map",
            approach: &approach(),
            conditions: &conditions,
            memories: &[],
            previous_failure: Some(&failure),
        });
        assert!(prompt.contains("failed the typecheck gate"));
        assert!(prompt.contains("error TS2304"));
        assert!(prompt.contains("- Persist the choice"));
    }

    #[test]
    fn test_first_attempt_has_no_failure_section() {
        let prompt = coder_prompt(&CoderPromptInput {
            feature: "f",
            codebase_map: "m",
            approach: &approach(),
            conditions: &[],
            memories: &[MemoryRecord::new(
                FeaturePhase::Analysis,
                MemoryKind::Constraint,
                "No new deps",
            )],
            previous_failure: None,
        });
        assert!(!prompt.contains("Previous attempt"));
        assert!(prompt.contains("No new deps"));
    }
}
