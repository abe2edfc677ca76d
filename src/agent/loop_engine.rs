//! Think, dispatch, inject.
//!
//! [`run_agent_loop`] drives one model over a growing message history. Each
//! step is one memoized model call. Tool calls emitted in a step are
//! dispatched concurrently through the [`ToolHandler`], each memoized under
//! its own call id, and their results are injected back as a single message
//! in emission order, so a replay sees exactly the history the original run
//! saw. A transient failure retries only the call that failed.

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use super::model::{
    ContentBlock, FinishReason, Message, ModelClient, ModelRequest, ModelResponse, ToolCall,
    ToolDefinition, Usage,
};
use crate::durable::StepJournal;

/// The loop's only customization point.
///
/// `handle` returns `Ok` for anything the model should see, including tool
/// failures as `{"error": ...}`. An `Err` aborts the loop.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn definitions(&self) -> Vec<ToolDefinition>;

    async fn handle(&self, call: &ToolCall) -> Result<serde_json::Value>;
}

/// Handler with no tools.
pub struct NoTools;

#[async_trait]
impl ToolHandler for NoTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }

    async fn handle(&self, call: &ToolCall) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "error": format!("unknown tool '{}'", call.name) }))
    }
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub model: String,
    pub system: String,
    pub max_steps: u32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub step: u32,
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
    pub result: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    /// Text of the last model response. Partial when the budget ran out.
    pub text: String,
    pub steps: u32,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub tool_calls: Vec<ToolCallRecord>,
}

impl LoopOutcome {
    /// True when the model stopped on its own rather than running out of steps.
    pub fn completed(&self) -> bool {
        self.finish_reason == FinishReason::Stop
    }
}

fn is_error_result(value: &serde_json::Value) -> bool {
    value.get("error").is_some()
}

fn result_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub async fn run_agent_loop(
    journal: &StepJournal,
    model: &dyn ModelClient,
    config: &LoopConfig,
    initial_messages: Vec<Message>,
    tools: &dyn ToolHandler,
) -> Result<LoopOutcome> {
    let definitions = tools.definitions();
    let mut messages = initial_messages;
    let mut usage = Usage::default();
    let mut log = Vec::new();
    let mut text = String::new();
    let mut finish_reason = FinishReason::Other;

    for step in 1..=config.max_steps {
        let request = ModelRequest {
            model: config.model.clone(),
            system: config.system.clone(),
            messages: messages.clone(),
            tools: definitions.clone(),
            max_tokens: config.max_tokens,
        };
        let response: ModelResponse = journal
            .run(&format!("step-{}", step), || model.generate(&request))
            .await?;

        usage.input_tokens += response.usage.input_tokens;
        usage.output_tokens += response.usage.output_tokens;
        text = response.output_text();
        finish_reason = response.finish_reason;

        if finish_reason == FinishReason::Stop {
            return Ok(LoopOutcome {
                text,
                steps: step,
                finish_reason,
                usage,
                tool_calls: log,
            });
        }

        let calls = response.calls();
        messages.push(Message::assistant(response.content.clone()));
        if calls.is_empty() {
            messages.push(Message::user("Continue."));
            continue;
        }

        tracing::debug!(step, calls = calls.len(), "dispatching tool calls");
        let results = join_all(calls.iter().map(|call| async move {
            let key = format!("step-{}-tool-{}", step, call.id);
            journal.run(&key, move || tools.handle(call)).await
        }))
        .await
        .into_iter()
        .collect::<Result<Vec<serde_json::Value>>>()?;

        let blocks = calls
            .iter()
            .zip(&results)
            .map(|(call, result)| ContentBlock::ToolResult {
                tool_use_id: call.id.clone(),
                content: result_to_string(result),
                is_error: is_error_result(result),
            })
            .collect();
        messages.push(Message::tool_results(blocks));

        log.extend(calls.into_iter().zip(results).map(|(call, result)| ToolCallRecord {
            step,
            id: call.id,
            name: call.name,
            input: call.input,
            result,
        }));
    }

    tracing::warn!(max_steps = config.max_steps, "step budget exhausted");
    Ok(LoopOutcome {
        text,
        steps: config.max_steps,
        finish_reason,
        usage,
        tool_calls: log,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::EventBus;
    use crate::errors::StepError;
    use crate::factory::db::{DbHandle, FlowDb};
    use crate::test_support::ScriptedModel;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn journal() -> Result<StepJournal> {
        let db = DbHandle::new(FlowDb::new_in_memory()?);
        let bus = EventBus::new(db.clone());
        Ok(StepJournal::new(db, bus, "run"))
    }

    fn config(max_steps: u32) -> LoopConfig {
        LoopConfig {
            model: "m".into(),
            system: "You are a codebase explorer.".into(),
            max_steps,
            max_tokens: 1024,
        }
    }

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            input: serde_json::json!({}),
        }
    }

    /// Finishes calls in reverse emission order.
    struct SlowFirst;

    #[async_trait]
    impl ToolHandler for SlowFirst {
        fn definitions(&self) -> Vec<ToolDefinition> {
            Vec::new()
        }

        async fn handle(&self, call: &ToolCall) -> Result<serde_json::Value> {
            let delay = match call.name.as_str() {
                "a" => 60,
                "b" => 30,
                _ => 0,
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(serde_json::json!({ "from": call.name }))
        }
    }

    #[tokio::test]
    async fn test_stops_on_stop_reason() -> Result<()> {
        let model = ScriptedModel::new().on("explorer", vec![ModelResponse::text("done")]);
        let outcome = run_agent_loop(&journal()?, &model, &config(5), vec![Message::user("go")], &NoTools).await?;
        assert_eq!(outcome.text, "done");
        assert_eq!(outcome.steps, 1);
        assert!(outcome.completed());
        Ok(())
    }

    #[tokio::test]
    async fn test_budget_exhaustion_returns_partial_text() -> Result<()> {
        let mut looping = ModelResponse::tool_calls(vec![call("t", "x")]);
        looping.content.insert(0, ContentBlock::Text { text: "partial".into() });
        let model = ScriptedModel::new().on("explorer", vec![looping]);

        let outcome = run_agent_loop(&journal()?, &model, &config(3), vec![Message::user("go")], &NoTools).await?;
        assert_eq!(model.request_count(), 3);
        assert_eq!(outcome.steps, 3);
        assert_eq!(outcome.text, "partial");
        assert!(!outcome.completed());
        Ok(())
    }

    #[tokio::test]
    async fn test_tool_results_keep_emission_order() -> Result<()> {
        let model = ScriptedModel::new().on(
            "explorer",
            vec![
                ModelResponse::tool_calls(vec![call("1", "a"), call("2", "b"), call("3", "c")]),
                ModelResponse::text("ok"),
            ],
        );
        let outcome = run_agent_loop(&journal()?, &model, &config(5), vec![Message::user("go")], &SlowFirst).await?;

        let requests = model.requests();
        let injected = requests[1].messages.last().expect("tool result message");
        let ids: Vec<&str> = injected
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["1", "2", "3"]);

        let names: Vec<&str> = outcome.tool_calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_replay_does_not_call_model_again() -> Result<()> {
        let journal = journal()?;
        let model = ScriptedModel::new().on(
            "explorer",
            vec![
                ModelResponse::tool_calls(vec![call("1", "a")]),
                ModelResponse::text("ok"),
            ],
        );
        run_agent_loop(&journal, &model, &config(5), vec![Message::user("go")], &SlowFirst).await?;
        let replayed =
            run_agent_loop(&journal, &model, &config(5), vec![Message::user("go")], &SlowFirst).await?;
        assert_eq!(model.request_count(), 2);
        assert_eq!(replayed.text, "ok");
        assert_eq!(replayed.tool_calls.len(), 1);
        Ok(())
    }

    /// `bash` counts executions; `flaky` fails transiently on its first call.
    #[derive(Default)]
    struct SideEffects {
        bash_runs: AtomicU32,
        flaky_calls: AtomicU32,
    }

    #[async_trait]
    impl ToolHandler for SideEffects {
        fn definitions(&self) -> Vec<ToolDefinition> {
            Vec::new()
        }

        async fn handle(&self, call: &ToolCall) -> Result<serde_json::Value> {
            match call.name.as_str() {
                "bash" => {
                    self.bash_runs.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::json!({ "exit_code": 0 }))
                }
                _ => {
                    if self.flaky_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(StepError::Transient("529".into()).into());
                    }
                    Ok(serde_json::json!({ "ok": true }))
                }
            }
        }
    }

    #[tokio::test]
    async fn test_transient_tool_failure_retries_only_that_call() -> Result<()> {
        let journal = journal()?.with_max_retries(1);
        let model = ScriptedModel::new().on(
            "explorer",
            vec![
                ModelResponse::tool_calls(vec![call("1", "bash"), call("2", "flaky")]),
                ModelResponse::text("ok"),
            ],
        );
        let tools = SideEffects::default();

        let outcome = run_agent_loop(&journal, &model, &config(5), vec![Message::user("go")], &tools).await?;
        assert_eq!(tools.bash_runs.load(Ordering::SeqCst), 1);
        assert_eq!(tools.flaky_calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.tool_calls[1].result, serde_json::json!({ "ok": true }));

        // Replay executes neither call again.
        run_agent_loop(&journal, &model, &config(5), vec![Message::user("go")], &tools).await?;
        assert_eq!(tools.bash_runs.load(Ordering::SeqCst), 1);
        assert_eq!(tools.flaky_calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_finished_calls_survive_a_failed_sibling() -> Result<()> {
        let journal = journal()?.with_max_retries(0);
        let model = ScriptedModel::new().on(
            "explorer",
            vec![
                ModelResponse::tool_calls(vec![call("1", "bash"), call("2", "flaky")]),
                ModelResponse::text("ok"),
            ],
        );
        let tools = SideEffects::default();

        // No retries: the flaky call fails the loop, the bash call is recorded.
        assert!(run_agent_loop(&journal, &model, &config(5), vec![Message::user("go")], &tools).await.is_err());
        run_agent_loop(&journal, &model, &config(5), vec![Message::user("go")], &tools).await?;
        assert_eq!(tools.bash_runs.load(Ordering::SeqCst), 1);
        assert_eq!(tools.flaky_calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_error_results_are_flagged() -> Result<()> {
        let model = ScriptedModel::new().on(
            "explorer",
            vec![
                ModelResponse::tool_calls(vec![call("1", "nope")]),
                ModelResponse::text("ok"),
            ],
        );
        run_agent_loop(&journal()?, &model, &config(5), vec![Message::user("go")], &NoTools).await?;
        let requests = model.requests();
        match &requests[1].messages.last().expect("message").content[0] {
            ContentBlock::ToolResult { is_error, content, .. } => {
                assert!(is_error);
                assert!(content.contains("unknown tool"));
            }
            other => panic!("unexpected block {:?}", other),
        }
        Ok(())
    }
}
