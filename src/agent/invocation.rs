use anyhow::Result;

use super::loop_engine::{LoopConfig, LoopOutcome, ToolHandler, run_agent_loop};
use super::model::Message;
use crate::context::RunContext;
use crate::durable::StepJournal;
use crate::factory::models::{AgentType, InvocationCompletion, NewAgentInvocation};

/// What to run. `key` names the invocation inside the caller's journal and
/// must be stable across replays.
#[derive(Debug, Clone)]
pub struct InvocationSpec {
    pub key: String,
    pub agent_type: AgentType,
    pub model: String,
    pub system: String,
    pub messages: Vec<Message>,
    pub max_steps: u32,
    pub parent_invocation_id: Option<String>,
}

/// Identity of a running invocation, handed to the tool factory.
#[derive(Clone)]
pub struct InvocationHandle {
    pub id: String,
    pub journal: StepJournal,
}

pub struct InvocationResult {
    pub invocation_id: String,
    pub outcome: LoopOutcome,
}

/// Persist an `AgentInvocation`, run its loop, and record how it finished.
///
/// The invocation id is memoized, so a replay re-attaches to the same row and
/// the loop replays from the journal scope named after the id.
pub async fn run_invocation<F, H>(
    ctx: &RunContext,
    journal: &StepJournal,
    phase_result_id: &str,
    spec: InvocationSpec,
    make_tools: F,
) -> Result<InvocationResult>
where
    F: FnOnce(&InvocationHandle) -> H,
    H: ToolHandler,
{
    let id: String = journal
        .run(&format!("{}:id", spec.key), || async {
            Ok(uuid::Uuid::new_v4().to_string())
        })
        .await?;

    let new = NewAgentInvocation {
        id: id.clone(),
        phase_result_id: phase_result_id.to_string(),
        parent_invocation_id: spec.parent_invocation_id.clone(),
        agent_type: spec.agent_type,
        model: spec.model.clone(),
        system_prompt: spec.system.clone(),
        input_messages: serde_json::to_value(&spec.messages)?,
    };
    ctx.db.call(move |db| db.create_agent_invocation(&new)).await?;

    let handle = InvocationHandle {
        id: id.clone(),
        journal: journal.scope(&id),
    };
    let tools = make_tools(&handle);
    let config = LoopConfig {
        model: spec.model,
        system: spec.system,
        max_steps: spec.max_steps,
        max_tokens: ctx.config.models.max_tokens,
    };

    tracing::debug!(invocation_id = %id, agent_type = spec.agent_type.as_str(), "invocation started");
    let outcome = match run_agent_loop(
        &handle.journal,
        ctx.model.as_ref(),
        &config,
        spec.messages,
        &tools,
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            let completion = InvocationCompletion {
                finish_reason: "error".to_string(),
                output_text: format!("{:#}", e),
                ..InvocationCompletion::default()
            };
            let inv = id.clone();
            if let Err(db_err) = ctx
                .db
                .call(move |db| db.complete_agent_invocation(&inv, &completion))
                .await
            {
                tracing::warn!(invocation_id = %id, "Failed to record invocation error: {:#}", db_err);
            }
            return Err(e);
        }
    };

    let completion = InvocationCompletion {
        finish_reason: outcome.finish_reason.as_str().to_string(),
        output_text: outcome.text.clone(),
        input_tokens: outcome.usage.input_tokens,
        output_tokens: outcome.usage.output_tokens,
        steps: outcome.steps,
        tool_calls: serde_json::to_value(&outcome.tool_calls)?,
    };
    let inv = id.clone();
    ctx.db
        .call(move |db| db.complete_agent_invocation(&inv, &completion))
        .await?;
    tracing::debug!(
        invocation_id = %id,
        steps = outcome.steps,
        finish_reason = %outcome.finish_reason,
        "invocation finished"
    );

    Ok(InvocationResult {
        invocation_id: id,
        outcome,
    })
}
