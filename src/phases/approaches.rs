//! Approaches phase: one architect invocation proposes candidate
//! implementation approaches as JSON.

use std::collections::HashSet;

use anyhow::Result;
use forgeflow_common::{ApproachesOutput, FeaturePhase};

use super::extract_json;
use super::prompts::{APPROACHES_SYSTEM, approaches_prompt};
use crate::agent::tools::{MemoryTool, SandboxTools, Toolbox};
use crate::agent::{InvocationSpec, Message, run_invocation};
use crate::context::PhaseScope;
use crate::errors::PhaseError;
use crate::factory::models::AgentType;

fn malformed(detail: impl Into<String>) -> anyhow::Error {
    PhaseError::MalformedOutput {
        phase: FeaturePhase::Approaches,
        detail: detail.into(),
    }
    .into()
}

/// Parse the architect's reply. At least one approach is required and ids
/// must be unique and non-empty.
pub fn parse_approaches(output: &str) -> Result<ApproachesOutput> {
    let json = extract_json(output).ok_or_else(|| malformed("no JSON object in reply"))?;
    let parsed: ApproachesOutput = serde_json::from_str(&json)
        .map_err(|e| malformed(format!("invalid approaches: {}", e)))?;

    if parsed.approaches.is_empty() {
        return Err(malformed("no approaches proposed"));
    }
    let mut seen = HashSet::new();
    for approach in &parsed.approaches {
        if approach.id.trim().is_empty() || approach.title.trim().is_empty() {
            return Err(malformed("approach with an empty id or title"));
        }
        if !seen.insert(approach.id.as_str()) {
            return Err(malformed(format!("duplicate approach id '{}'", approach.id)));
        }
    }
    Ok(parsed)
}

pub async fn run_approaches(scope: &PhaseScope, codebase_map: &str) -> Result<ApproachesOutput> {
    let ctx = &scope.ctx;
    let spec = InvocationSpec {
        key: "architect".to_string(),
        agent_type: AgentType::Orchestrator,
        model: ctx.config.models.orchestrator.clone(),
        system: APPROACHES_SYSTEM.to_string(),
        messages: vec![Message::user(approaches_prompt(
            &scope.prompt,
            codebase_map,
            &scope.memories,
        ))],
        max_steps: ctx.config.limits.orchestrator_max_steps,
        parent_invocation_id: None,
    };
    let result = run_invocation(ctx, &scope.journal, &scope.phase_result_id, spec, |h| {
        Toolbox::new()
            .with(SandboxTools::read_only(scope.sandbox.clone()))
            .with(MemoryTool::new(
                ctx.clone(),
                h.journal.clone(),
                &scope.run_id,
                FeaturePhase::Approaches,
            ))
    })
    .await?;

    let output = parse_approaches(&result.outcome.text)?;
    let ids: Vec<&str> = output.approaches.iter().map(|a| a.id.as_str()).collect();
    tracing::info!(run_id = %scope.run_id, ids = %ids.join(","), "approaches proposed");
    Ok(output)
}
