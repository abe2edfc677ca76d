//! Analysis phase.
//!
//! An orchestrator agent maps the codebase, delegating focused questions to
//! read-only explorer sub-agents through `spawn_explorer`. Explorers are
//! child invocations of the orchestrator, so the invocation forest for the
//! phase is one root with one leaf per explorer.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use forgeflow_common::{AnalysisOutput, FeaturePhase};
use serde::Deserialize;
use tokio::sync::Mutex;

use super::prompts::{ANALYSIS_ORCHESTRATOR_SYSTEM, EXPLORER_SYSTEM, analysis_prompt, explorer_prompt};
use crate::agent::loop_engine::ToolHandler;
use crate::agent::model::{ToolCall, ToolDefinition};
use crate::agent::tools::{
    FeedbackTool, MemoryTool, SandboxTools, Toolbox, parse_args, soften, tool, tool_error,
};
use crate::agent::{InvocationSpec, Message, run_invocation};
use crate::context::{PhaseScope, RunContext};
use crate::cta::CtaSite;
use crate::durable::StepJournal;
use crate::errors::PhaseError;
use crate::factory::models::AgentType;
use crate::factory::sandbox::Sandbox;

pub const SPAWN_EXPLORER: &str = "spawn_explorer";

/// Journal key prefix of the per-call admission decisions.
const ADMIT_KEY: &str = "explorer-admit-";

#[derive(Deserialize)]
struct ExplorerArgs {
    task: String,
}

/// Runs an explorer sub-agent as a child of the calling invocation and
/// returns its report.
///
/// Admission against `limits.max_explorers` is journaled per call id and
/// counted from the recorded admissions, so the cap holds across resumes.
pub struct ExplorerTool {
    ctx: RunContext,
    journal: StepJournal,
    phase_result_id: String,
    parent_invocation_id: String,
    sandbox: Arc<dyn Sandbox>,
    max_explorers: u32,
    admission: Mutex<()>,
}

impl ExplorerTool {
    pub fn new(
        ctx: RunContext,
        journal: StepJournal,
        phase_result_id: &str,
        parent_invocation_id: &str,
        sandbox: Arc<dyn Sandbox>,
    ) -> Self {
        let max_explorers = ctx.config.limits.max_explorers;
        Self {
            ctx,
            journal,
            phase_result_id: phase_result_id.to_string(),
            parent_invocation_id: parent_invocation_id.to_string(),
            sandbox,
            max_explorers,
            admission: Mutex::new(()),
        }
    }

    async fn admit(&self, call_id: &str) -> Result<bool> {
        let _guard = self.admission.lock().await;
        let prefix = self.journal.full_key(ADMIT_KEY);
        let run_id = self.journal.run_id().to_string();
        let max = self.max_explorers as usize;
        self.journal
            .run(&format!("{}{}", ADMIT_KEY, call_id), || {
                let (db, run_id, prefix) = (self.ctx.db.clone(), run_id.clone(), prefix.clone());
                async move {
                    let admitted = db
                        .call(move |db| db.count_steps_with_value(&run_id, &prefix, "true"))
                        .await?;
                    Ok(admitted < max)
                }
            })
            .await
    }
}

#[async_trait]
impl ToolHandler for ExplorerTool {
    fn definitions(&self) -> Vec<ToolDefinition> {
        vec![tool(
            SPAWN_EXPLORER,
            "Delegate one focused, read-only investigation of the repository. \
             Returns the explorer's written report.",
            serde_json::json!({
                "type": "object",
                "properties": { "task": { "type": "string" } },
                "required": ["task"]
            }),
        )]
    }

    async fn handle(&self, call: &ToolCall) -> Result<serde_json::Value> {
        let args: ExplorerArgs = match parse_args(call) {
            Ok(a) => a,
            Err(e) => return Ok(e),
        };
        if !self.admit(&call.id).await? {
            return Ok(tool_error(format!(
                "explorer limit of {} reached; write the codebase map from what you have",
                self.max_explorers
            )));
        }

        let spec = InvocationSpec {
            key: format!("explorer-{}", call.id),
            agent_type: AgentType::Explorer,
            model: self.ctx.config.models.explorer.clone(),
            system: EXPLORER_SYSTEM.to_string(),
            messages: vec![Message::user(explorer_prompt(&args.task))],
            max_steps: self.ctx.config.limits.explorer_max_steps,
            parent_invocation_id: Some(self.parent_invocation_id.clone()),
        };
        let sandbox = self.sandbox.clone();
        let result = run_invocation(
            &self.ctx,
            &self.journal,
            &self.phase_result_id,
            spec,
            |_| SandboxTools::read_only(sandbox),
        )
        .await;

        match result {
            Ok(r) => Ok(serde_json::json!({
                "report": r.outcome.text,
                "complete": r.outcome.completed(),
            })),
            Err(e) => soften(e),
        }
    }
}

/// Run the analysis orchestrator and return its codebase map.
pub async fn run_analysis(scope: &PhaseScope) -> Result<AnalysisOutput> {
    let ctx = &scope.ctx;
    let spec = InvocationSpec {
        key: "orchestrator".to_string(),
        agent_type: AgentType::Orchestrator,
        model: ctx.config.models.orchestrator.clone(),
        system: ANALYSIS_ORCHESTRATOR_SYSTEM.to_string(),
        messages: vec![Message::user(analysis_prompt(
            &scope.prompt,
            ctx.config.limits.max_explorers,
            &scope.memories,
        ))],
        max_steps: ctx.config.limits.orchestrator_max_steps,
        parent_invocation_id: None,
    };

    let result = run_invocation(ctx, &scope.journal, &scope.phase_result_id, spec, |h| {
        let site = CtaSite {
            run_id: scope.run_id.clone(),
            phase_result_id: scope.phase_result_id.clone(),
            invocation_id: Some(h.id.clone()),
            tool_call_id: None,
        };
        Toolbox::new()
            .with(ExplorerTool::new(
                ctx.clone(),
                h.journal.clone(),
                &scope.phase_result_id,
                &h.id,
                scope.sandbox.clone(),
            ))
            .with(SandboxTools::read_only(scope.sandbox.clone()))
            .with(MemoryTool::new(
                ctx.clone(),
                h.journal.clone(),
                &scope.run_id,
                FeaturePhase::Analysis,
            ))
            .with(FeedbackTool::new(ctx.clone(), h.journal.clone(), site))
    })
    .await?;

    let codebase_map = result.outcome.text.trim().to_string();
    if codebase_map.is_empty() {
        return Err(PhaseError::MalformedOutput {
            phase: FeaturePhase::Analysis,
            detail: "orchestrator returned an empty codebase map".to_string(),
        }
        .into());
    }
    if !result.outcome.completed() {
        tracing::warn!(
            run_id = %scope.run_id,
            steps = result.outcome.steps,
            "analysis orchestrator ran out of steps; using partial map"
        );
    }

    let explorer_count = result
        .outcome
        .tool_calls
        .iter()
        .filter(|c| c.name == SPAWN_EXPLORER && c.result.get("error").is_none())
        .count() as u32;
    tracing::info!(run_id = %scope.run_id, explorer_count, "analysis finished");

    Ok(AnalysisOutput {
        codebase_map,
        explorer_count,
        invocation_id: result.invocation_id,
    })
}
