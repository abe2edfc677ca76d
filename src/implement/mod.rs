//! Implementation retry loop.
//!
//! Each attempt is a brand-new coder invocation with no conversation carried
//! over from earlier attempts. From attempt 2 the prompt quotes the previous
//! attempt's failing gate output. After every attempt the quality gates run;
//! the loop stops at the first attempt where all four pass, or after
//! `limits.max_coder_attempts`.

pub mod diff;

use anyhow::Result;
use forgeflow_common::gate::{all_passed, first_failure};
use forgeflow_common::{
    Approach, AttemptRecord, FeaturePhase, GateResult, ImplementationOutput,
};

use crate::agent::tools::{MemoryTool, SandboxTools, Toolbox};
use crate::agent::{InvocationSpec, Message, run_invocation};
use crate::context::PhaseScope;
use crate::factory::models::AgentType;
use crate::gates::run_all_gates;
use crate::phases::prompts::{CODER_SYSTEM, CoderPromptInput, coder_prompt};

pub use diff::{compute_diff, parse_name_status};

/// Upstream context for the coder.
#[derive(Debug, Clone)]
pub struct ImplementationInput {
    pub codebase_map: String,
    pub approach: Approach,
    /// Conditions attached by judging.
    pub conditions: Vec<String>,
    pub base_branch: String,
}

/// Run the bounded retry loop. The output's `passed` flag says whether any
/// attempt got through all gates; a failed output carries every attempt's
/// gate history.
pub async fn run_implementation(
    scope: &PhaseScope,
    input: &ImplementationInput,
) -> Result<ImplementationOutput> {
    let ctx = &scope.ctx;
    let max_attempts = ctx.config.limits.max_coder_attempts.max(1);
    let mut attempts: Vec<AttemptRecord> = Vec::new();
    let mut previous_failure: Option<GateResult> = None;

    for attempt in 1..=max_attempts {
        tracing::info!(run_id = %scope.run_id, attempt, max_attempts, "coder attempt");

        let prompt = coder_prompt(&CoderPromptInput {
            feature: &scope.prompt,
            codebase_map: &input.codebase_map,
            approach: &input.approach,
            conditions: &input.conditions,
            memories: &scope.memories,
            previous_failure: previous_failure.as_ref(),
        });
        let spec = InvocationSpec {
            key: format!("coder-{}", attempt),
            agent_type: AgentType::Coder,
            model: ctx.config.models.coder.clone(),
            system: CODER_SYSTEM.to_string(),
            messages: vec![Message::user(prompt)],
            max_steps: ctx.config.limits.coder_max_steps,
            parent_invocation_id: None,
        };
        let invocation = run_invocation(ctx, &scope.journal, &scope.phase_result_id, spec, |h| {
            Toolbox::new()
                .with(SandboxTools::read_write(scope.sandbox.clone()))
                .with(MemoryTool::new(
                    ctx.clone(),
                    h.journal.clone(),
                    &scope.run_id,
                    FeaturePhase::Implementation,
                ))
        })
        .await?;

        let gates: Vec<GateResult> = scope
            .journal
            .run(&format!("gates-{}", attempt), || {
                run_all_gates(scope.sandbox.as_ref(), &ctx.config.gates, attempt)
            })
            .await?;
        let passed = all_passed(&gates);
        previous_failure = first_failure(&gates).cloned();
        attempts.push(AttemptRecord {
            attempt,
            invocation_id: invocation.invocation_id,
            gates,
            passed,
        });

        if passed {
            let diff = scope
                .journal
                .run("diff", || compute_diff(scope.sandbox.as_ref(), &input.base_branch))
                .await?;
            tracing::info!(run_id = %scope.run_id, attempt, files = diff.total(), "all gates passed");
            return Ok(ImplementationOutput {
                passed: true,
                total_coder_attempts: attempt,
                attempts,
                diff: Some(diff),
                conditions_addressed: input.conditions.clone(),
            });
        }

        if let Some(failure) = &previous_failure {
            tracing::warn!(
                run_id = %scope.run_id,
                attempt,
                gate = %failure.gate,
                "attempt failed"
            );
        }
    }

    Ok(ImplementationOutput {
        passed: false,
        total_coder_attempts: max_attempts,
        attempts,
        diff: None,
        conditions_addressed: Vec::new(),
    })
}
