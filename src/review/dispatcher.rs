//! Judging fan-out.
//!
//! One read-only judge invocation per [`JudgeCriterion`], all dispatched at
//! once against the same approach and awaited together. Each judge's reply
//! must contain a verdict object; a judge that never produces one fails the
//! phase.

use anyhow::Result;
use futures::future::join_all;
use forgeflow_common::{
    Approach, FeaturePhase, JudgeCriterion, JudgeFinding, JudgeVerdict, JudgingOutput, Verdict,
};
use serde::Deserialize;

use super::arbiter::synthesize;
use super::specialists::{judge_prompt, judge_system};
use crate::agent::tools::{MemoryTool, SandboxTools, Toolbox};
use crate::agent::{InvocationSpec, Message, run_invocation};
use crate::context::PhaseScope;
use crate::errors::PhaseError;
use crate::factory::models::AgentType;
use crate::phases::extract_json;

/// Shape judges are asked to reply with. `criterion` is informational; the
/// verdict is always attributed to the judge that produced it.
#[derive(Debug, Deserialize)]
struct JudgeReply {
    #[serde(default)]
    criterion: Option<String>,
    verdict: Verdict,
    #[serde(default)]
    findings: Vec<JudgeFinding>,
    #[serde(default, alias = "overallAssessment")]
    overall_assessment: String,
}

/// Parse one judge's final text into a verdict.
pub fn parse_judge_output(criterion: JudgeCriterion, output: &str) -> Result<JudgeVerdict> {
    let malformed = |detail: String| PhaseError::MalformedOutput {
        phase: FeaturePhase::Judging,
        detail: format!("{}: {}", criterion.agent_name(), detail),
    };
    let json = extract_json(output).ok_or_else(|| malformed("no JSON object in reply".into()))?;
    let reply: JudgeReply =
        serde_json::from_str(&json).map_err(|e| malformed(format!("invalid verdict: {}", e)))?;

    if let Some(claimed) = reply.criterion.as_deref()
        && claimed != criterion.as_str()
    {
        tracing::debug!(
            judge = criterion.agent_name(),
            claimed,
            "judge reported a different criterion"
        );
    }

    Ok(JudgeVerdict {
        criterion,
        verdict: reply.verdict,
        findings: reply.findings,
        overall_assessment: reply.overall_assessment,
    })
}

/// Run every judge concurrently. Verdicts come back in [`JudgeCriterion::ALL`]
/// order.
pub async fn run_judges(
    scope: &PhaseScope,
    approach: &Approach,
    codebase_map: &str,
) -> Result<Vec<JudgeVerdict>> {
    let prompt = judge_prompt(&scope.prompt, codebase_map, approach, &scope.memories);
    let futures = JudgeCriterion::ALL
        .into_iter()
        .map(|criterion| run_single_judge(scope, criterion, prompt.clone()));

    join_all(futures).await.into_iter().collect()
}

async fn run_single_judge(
    scope: &PhaseScope,
    criterion: JudgeCriterion,
    prompt: String,
) -> Result<JudgeVerdict> {
    let ctx = &scope.ctx;
    let spec = InvocationSpec {
        key: format!("judge-{}", criterion),
        agent_type: AgentType::Judge,
        model: ctx.config.models.judge.clone(),
        system: judge_system(criterion),
        messages: vec![Message::user(prompt)],
        max_steps: ctx.config.limits.judge_max_steps,
        parent_invocation_id: None,
    };
    let result = run_invocation(ctx, &scope.journal, &scope.phase_result_id, spec, |h| {
        Toolbox::new()
            .with(SandboxTools::read_only(scope.sandbox.clone()))
            .with(MemoryTool::new(
                ctx.clone(),
                h.journal.clone(),
                &scope.run_id,
                FeaturePhase::Judging,
            ))
    })
    .await?;

    let verdict = parse_judge_output(criterion, &result.outcome.text)?;
    tracing::info!(
        run_id = %scope.run_id,
        judge = criterion.agent_name(),
        verdict = %verdict.verdict,
        findings = verdict.findings.len(),
        "judge finished"
    );
    Ok(verdict)
}

/// The judging phase: fan out, then synthesize.
pub async fn run_judging(
    scope: &PhaseScope,
    approach: &Approach,
    codebase_map: &str,
) -> Result<JudgingOutput> {
    let verdicts = run_judges(scope, approach, codebase_map).await?;
    let synthesis = synthesize(&verdicts);
    tracing::info!(
        run_id = %scope.run_id,
        approach = %approach.id,
        verdict = %synthesis.verdict,
        conditions = synthesis.conditions.len(),
        "judging synthesized"
    );
    Ok(JudgingOutput {
        approach_id: approach.id.clone(),
        verdicts,
        synthesis,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ModelResponse;
    use crate::test_support::{
        FakeSandbox, ResponderPolicy, ScriptedModel, TestHarness, judge_reply, seed_phase,
        test_context,
    };
    use forgeflow_common::{FindingSeverity, MemoryKind, OverallVerdict};

    fn approach() -> Approach {
        Approach {
            id: "A".into(),
            title: "CSS variables".into(),
            summary: "Theme via custom properties".into(),
            plan: "1. add toggle".into(),
            tradeoffs: String::new(),
        }
    }

    fn judges(bug_hunter: ModelResponse) -> ScriptedModel {
        ScriptedModel::new()
            .on("security-sentinel", vec![judge_reply("pass", "")])
            .on("bug-hunter", vec![bug_hunter])
            .on("compat-guardian", vec![judge_reply("pass", "")])
            .on("performance-oracle", vec![judge_reply("pass", "")])
            .on("convention-keeper", vec![judge_reply("pass", "")])
    }

    async fn scope(h: &TestHarness) -> Result<PhaseScope> {
        let phase_result_id = seed_phase(&h.ctx.db, "run-1", FeaturePhase::Judging).await?;
        Ok(PhaseScope {
            ctx: h.ctx.clone(),
            run_id: "run-1".into(),
            prompt: "Add dark mode toggle".into(),
            phase: FeaturePhase::Judging,
            journal: h.ctx.journal("run-1").scope(FeaturePhase::Judging.as_str()),
            phase_result_id,
            sandbox: h.sandbox.clone(),
            memories: Vec::new(),
        })
    }

    #[test]
    fn test_parse_judge_output_forces_own_criterion() -> Result<()> {
        let text = r#"```json
{"criterion": "security", "verdict": "concern",
 "findings": [{"severity": "major", "description": "d", "recommendation": "r"}],
 "overallAssessment": "ok"}
```"#;
        let verdict = parse_judge_output(JudgeCriterion::Performance, text)?;
        assert_eq!(verdict.criterion, JudgeCriterion::Performance);
        assert_eq!(verdict.verdict, Verdict::Concern);
        assert_eq!(verdict.findings[0].severity, FindingSeverity::Major);
        assert_eq!(verdict.overall_assessment, "ok");
        Ok(())
    }

    #[test]
    fn test_parse_judge_output_rejects_garbage() {
        let err = parse_judge_output(JudgeCriterion::Security, "looks fine to me").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PhaseError>(),
            Some(PhaseError::MalformedOutput { .. })
        ));
        let err = parse_judge_output(JudgeCriterion::Security, "{\"verdict\": \"maybe\"}");
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_five_judges_all_pass() -> Result<()> {
        let h = test_context(judges(judge_reply("pass", "")), FakeSandbox::new(), ResponderPolicy::Approve)?;
        let scope = scope(&h).await?;
        let output = run_judging(&scope, &approach(), "map").await?;

        assert_eq!(output.verdicts.len(), 5);
        let order: Vec<JudgeCriterion> = output.verdicts.iter().map(|v| v.criterion).collect();
        assert_eq!(order, JudgeCriterion::ALL.to_vec());
        assert_eq!(output.synthesis.verdict, OverallVerdict::Approved);
        assert_eq!(output.approach_id, "A");

        let judges = h
            .ctx
            .db
            .lock_sync()?
            .list_agent_invocations("run-1")?
            .into_iter()
            .filter(|i| i.agent_type == AgentType::Judge)
            .count();
        assert_eq!(judges, 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_bug_hunter_fail_rejects() -> Result<()> {
        let failing = judge_reply(
            "fail",
            r#"{"severity": "critical", "description": "state lost on reload", "recommendation": "persist"}"#,
        );
        let h = test_context(judges(failing), FakeSandbox::new(), ResponderPolicy::Approve)?;
        let scope = scope(&h).await?;
        let output = run_judging(&scope, &approach(), "map").await?;
        assert_eq!(output.synthesis.verdict, OverallVerdict::Rejected);
        assert!(
            output
                .synthesis
                .rejection_reason
                .unwrap_or_default()
                .contains("bug-hunter")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_judges_get_no_mutating_tools() -> Result<()> {
        let h = test_context(judges(judge_reply("pass", "")), FakeSandbox::new(), ResponderPolicy::Approve)?;
        let scope = scope(&h).await?;
        run_judges(&scope, &approach(), "map").await?;

        for request in h.model.requests() {
            let names: Vec<&str> = request.tools.iter().map(|t| t.name.as_str()).collect();
            assert!(names.contains(&"read_file"));
            for forbidden in ["write_file", "edit_file", "bash"] {
                assert!(!names.contains(&forbidden));
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_judges_memories_all_survive() -> Result<()> {
        let memory_call = |id: &str, content: &str| {
            ModelResponse::tool_calls(vec![crate::agent::ToolCall {
                id: id.into(),
                name: "record_memory".into(),
                input: serde_json::json!({"kind": "insight", "content": content}),
            }])
        };
        let model = ScriptedModel::new()
            .on(
                "security-sentinel",
                vec![memory_call("m1", "auth untouched"), judge_reply("pass", "")],
            )
            .on(
                "bug-hunter",
                vec![memory_call("m2", "toggle needs a test"), judge_reply("pass", "")],
            )
            .on("compat-guardian", vec![judge_reply("pass", "")])
            .on("performance-oracle", vec![judge_reply("pass", "")])
            .on("convention-keeper", vec![judge_reply("pass", "")]);
        let h = test_context(model, FakeSandbox::new(), ResponderPolicy::Approve)?;
        let scope = scope(&h).await?;
        run_judges(&scope, &approach(), "map").await?;

        let memories = h.ctx.db.lock_sync()?.get_memories("run-1")?;
        let mut contents: Vec<&str> = memories.iter().map(|m| m.content.as_str()).collect();
        contents.sort();
        assert_eq!(contents, vec!["auth untouched", "toggle needs a test"]);
        assert!(memories.iter().all(|m| m.kind == MemoryKind::Insight));
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_judge_fails_phase() -> Result<()> {
        let h = test_context(
            judges(ModelResponse::text("I think it is fine.")),
            FakeSandbox::new(),
            ResponderPolicy::Approve,
        )?;
        let scope = scope(&h).await?;
        let err = run_judges(&scope, &approach(), "map").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PhaseError>(),
            Some(PhaseError::MalformedOutput { phase: FeaturePhase::Judging, .. })
        ));
        Ok(())
    }
}
