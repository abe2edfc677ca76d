//! Tool definitions and handlers.
//!
//! Tool failures (missing file, ambiguous edit, bad pattern) are returned to
//! the model as `{"error": ...}`. Only transient infrastructure failures and
//! protocol violations escape as `Err`.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use forgeflow_common::{CtaRequest, FeaturePhase, MemoryKind, MemoryRecord};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::loop_engine::ToolHandler;
use super::model::{ToolCall, ToolDefinition};
use crate::context::RunContext;
use crate::cta::{self, CtaSite};
use crate::durable::StepJournal;
use crate::errors::{CtaError, is_transient};
use crate::factory::notify::tail;
use crate::factory::sandbox::Sandbox;

const BASH_OUTPUT_LIMIT: usize = 16_000;
const READ_LIMIT: usize = 64_000;

pub fn tool(name: &str, description: &str, input_schema: serde_json::Value) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    }
}

pub fn tool_error(message: impl std::fmt::Display) -> serde_json::Value {
    serde_json::json!({ "error": message.to_string() })
}

/// Turn a failed tool operation into a model-visible error, unless it is
/// transient and should be retried by the journal.
pub(crate) fn soften(err: anyhow::Error) -> Result<serde_json::Value> {
    if is_transient(&err) {
        Err(err)
    } else {
        Ok(tool_error(format!("{:#}", err)))
    }
}

pub(crate) fn parse_args<T: DeserializeOwned>(call: &ToolCall) -> Result<T, serde_json::Value> {
    serde_json::from_value(call.input.clone())
        .map_err(|e| tool_error(format!("invalid arguments for {}: {}", call.name, e)))
}

// ── Sandbox tools ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PathArgs {
    path: String,
}

#[derive(Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
}

#[derive(Deserialize)]
struct EditArgs {
    path: String,
    old_string: String,
    new_string: String,
}

#[derive(Deserialize)]
struct GlobArgs {
    pattern: String,
}

#[derive(Deserialize)]
struct GrepArgs {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Deserialize)]
struct BashArgs {
    command: String,
}

/// File and command tools over a sandbox. Judges and explorers get the
/// read-only set; only coders can mutate.
pub struct SandboxTools {
    sandbox: Arc<dyn Sandbox>,
    mutating: bool,
}

impl SandboxTools {
    pub fn read_only(sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            sandbox,
            mutating: false,
        }
    }

    pub fn read_write(sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            sandbox,
            mutating: true,
        }
    }

    fn read_only_definitions() -> Vec<ToolDefinition> {
        vec![
            tool(
                "read_file",
                "Read a file from the repository. Paths are relative to the repository root.",
                serde_json::json!({
                    "type": "object",
                    "properties": { "path": { "type": "string" } },
                    "required": ["path"]
                }),
            ),
            tool(
                "glob",
                "List files matching a glob pattern, e.g. `src/**/*.ts`.",
                serde_json::json!({
                    "type": "object",
                    "properties": { "pattern": { "type": "string" } },
                    "required": ["pattern"]
                }),
            ),
            tool(
                "grep",
                "Search file contents with a regular expression. Optionally restrict to a path.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "pattern": { "type": "string" },
                        "path": { "type": "string" }
                    },
                    "required": ["pattern"]
                }),
            ),
        ]
    }

    fn mutating_definitions() -> Vec<ToolDefinition> {
        vec![
            tool(
                "write_file",
                "Create or overwrite a file.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "content": { "type": "string" }
                    },
                    "required": ["path", "content"]
                }),
            ),
            tool(
                "edit_file",
                "Replace exactly one occurrence of old_string with new_string.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "old_string": { "type": "string" },
                        "new_string": { "type": "string" }
                    },
                    "required": ["path", "old_string", "new_string"]
                }),
            ),
            tool(
                "bash",
                "Run a shell command in the repository root.",
                serde_json::json!({
                    "type": "object",
                    "properties": { "command": { "type": "string" } },
                    "required": ["command"]
                }),
            ),
        ]
    }

    async fn dispatch(&self, call: &ToolCall) -> Result<serde_json::Value> {
        let sandbox = &self.sandbox;
        let value = match call.name.as_str() {
            "read_file" => {
                let args: PathArgs = match parse_args(call) {
                    Ok(a) => a,
                    Err(e) => return Ok(e),
                };
                let content = sandbox.read_file(&args.path).await?;
                serde_json::json!({ "path": args.path, "content": tail(&content, READ_LIMIT) })
            }
            "glob" => {
                let args: GlobArgs = match parse_args(call) {
                    Ok(a) => a,
                    Err(e) => return Ok(e),
                };
                serde_json::json!({ "files": sandbox.glob(&args.pattern).await? })
            }
            "grep" => {
                let args: GrepArgs = match parse_args(call) {
                    Ok(a) => a,
                    Err(e) => return Ok(e),
                };
                serde_json::json!({ "matches": sandbox.grep(&args.pattern, args.path.as_deref()).await? })
            }
            "write_file" if self.mutating => {
                let args: WriteArgs = match parse_args(call) {
                    Ok(a) => a,
                    Err(e) => return Ok(e),
                };
                sandbox.write_file(&args.path, &args.content).await?;
                serde_json::json!({ "written": args.path })
            }
            "edit_file" if self.mutating => {
                let args: EditArgs = match parse_args(call) {
                    Ok(a) => a,
                    Err(e) => return Ok(e),
                };
                sandbox
                    .edit_file(&args.path, &args.old_string, &args.new_string)
                    .await?;
                serde_json::json!({ "edited": args.path })
            }
            "bash" if self.mutating => {
                let args: BashArgs = match parse_args(call) {
                    Ok(a) => a,
                    Err(e) => return Ok(e),
                };
                let out = sandbox
                    .run_command("sh", &["-c".to_string(), args.command])
                    .await?;
                serde_json::json!({
                    "exit_code": out.exit_code,
                    "stdout": tail(&out.stdout, BASH_OUTPUT_LIMIT),
                    "stderr": tail(&out.stderr, BASH_OUTPUT_LIMIT),
                })
            }
            other => tool_error(format!("unknown tool '{}'", other)),
        };
        Ok(value)
    }
}

#[async_trait]
impl ToolHandler for SandboxTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = Self::read_only_definitions();
        if self.mutating {
            defs.extend(Self::mutating_definitions());
        }
        defs
    }

    async fn handle(&self, call: &ToolCall) -> Result<serde_json::Value> {
        match self.dispatch(call).await {
            Ok(value) => Ok(value),
            Err(e) => soften(e),
        }
    }
}

// ── record_memory ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct MemoryArgs {
    kind: String,
    content: String,
}

/// Appends to the run's memory list. Each call is memoized by tool call id so
/// a replayed step never appends twice.
pub struct MemoryTool {
    ctx: RunContext,
    journal: StepJournal,
    run_id: String,
    phase: FeaturePhase,
}

impl MemoryTool {
    pub fn new(ctx: RunContext, journal: StepJournal, run_id: &str, phase: FeaturePhase) -> Self {
        Self {
            ctx,
            journal,
            run_id: run_id.to_string(),
            phase,
        }
    }
}

#[async_trait]
impl ToolHandler for MemoryTool {
    fn definitions(&self) -> Vec<ToolDefinition> {
        vec![tool(
            "record_memory",
            "Record a note for later phases. kind is one of insight, failure, decision, constraint.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "kind": { "type": "string", "enum": ["insight", "failure", "decision", "constraint"] },
                    "content": { "type": "string" }
                },
                "required": ["kind", "content"]
            }),
        )]
    }

    async fn handle(&self, call: &ToolCall) -> Result<serde_json::Value> {
        let args: MemoryArgs = match parse_args(call) {
            Ok(a) => a,
            Err(e) => return Ok(e),
        };
        let kind: MemoryKind = match args.kind.parse() {
            Ok(k) => k,
            Err(e) => return Ok(tool_error(e)),
        };
        let record = MemoryRecord::new(self.phase, kind, args.content);
        let result = self
            .journal
            .scope(&call.id)
            .run("memory", || async {
                let (run_id, rec) = (self.run_id.clone(), record.clone());
                self.ctx
                    .db
                    .call(move |db| db.update_feature_run_memories(&run_id, &[rec]))
                    .await
            })
            .await;
        match result {
            Ok(()) => Ok(serde_json::json!({ "recorded": true })),
            Err(e) => soften(e),
        }
    }
}

// ── request_human_feedback ───────────────────────────────────────────

/// Lets an agent suspend on a human. A timeout comes back as
/// `{"error":"timeout"}`; a malformed answer aborts the invocation.
pub struct FeedbackTool {
    ctx: RunContext,
    journal: StepJournal,
    site: CtaSite,
}

impl FeedbackTool {
    pub fn new(ctx: RunContext, journal: StepJournal, site: CtaSite) -> Self {
        Self { ctx, journal, site }
    }
}

#[async_trait]
impl ToolHandler for FeedbackTool {
    fn definitions(&self) -> Vec<ToolDefinition> {
        vec![tool(
            "request_human_feedback",
            "Ask the human operator. kind=approval needs message; kind=text needs prompt \
             (optional placeholder); kind=choice needs prompt and at least two options [{id,label}].",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "kind": { "type": "string", "enum": ["approval", "text", "choice"] },
                    "message": { "type": "string" },
                    "prompt": { "type": "string" },
                    "placeholder": { "type": "string" },
                    "options": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": { "id": { "type": "string" }, "label": { "type": "string" } },
                            "required": ["id", "label"]
                        }
                    }
                },
                "required": ["kind"]
            }),
        )]
    }

    async fn handle(&self, call: &ToolCall) -> Result<serde_json::Value> {
        let request: CtaRequest = match parse_args(call) {
            Ok(r) => r,
            Err(e) => return Ok(e),
        };
        let site = CtaSite {
            tool_call_id: Some(call.id.clone()),
            ..self.site.clone()
        };
        let journal = self.journal.scope(&call.id);
        match cta::request_human_feedback(&self.ctx, &journal, &site, request).await {
            Ok(outcome) => Ok(outcome.to_tool_result()),
            Err(e) => match e.downcast_ref::<CtaError>() {
                Some(CtaError::InvalidRequest(msg)) => Ok(tool_error(msg)),
                _ => Err(e),
            },
        }
    }
}

// ── Composition ──────────────────────────────────────────────────────

/// Routes each call to the handler that defines the tool.
#[derive(Default)]
pub struct Toolbox {
    handlers: Vec<Box<dyn ToolHandler>>,
}

impl Toolbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: impl ToolHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }
}

#[async_trait]
impl ToolHandler for Toolbox {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.handlers.iter().flat_map(|h| h.definitions()).collect()
    }

    async fn handle(&self, call: &ToolCall) -> Result<serde_json::Value> {
        for handler in &self.handlers {
            if handler.definitions().iter().any(|d| d.name == call.name) {
                return handler.handle(call).await;
            }
        }
        Ok(tool_error(format!("unknown tool '{}'", call.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeSandbox;

    fn call(name: &str, input: serde_json::Value) -> ToolCall {
        ToolCall {
            id: format!("call-{}", name),
            name: name.into(),
            input,
        }
    }

    fn names(handler: &dyn ToolHandler) -> Vec<String> {
        handler.definitions().into_iter().map(|d| d.name).collect()
    }

    #[test]
    fn test_read_only_set_has_no_mutation() {
        let sb: Arc<dyn Sandbox> = Arc::new(FakeSandbox::new());
        assert_eq!(names(&SandboxTools::read_only(sb.clone())), vec!["read_file", "glob", "grep"]);
        assert_eq!(
            names(&SandboxTools::read_write(sb)),
            vec!["read_file", "glob", "grep", "write_file", "edit_file", "bash"]
        );
    }

    #[tokio::test]
    async fn test_read_only_tools_refuse_writes() -> Result<()> {
        let sb = Arc::new(FakeSandbox::new());
        let tools = SandboxTools::read_only(sb.clone());
        let result = tools
            .handle(&call("write_file", serde_json::json!({"path": "a", "content": "b"})))
            .await?;
        assert!(result["error"].as_str().unwrap().contains("unknown tool"));
        assert!(sb.file("a").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_tool_failures_become_error_results() -> Result<()> {
        let sb = Arc::new(FakeSandbox::new());
        sb.put_file("src/a.ts", "let x = 1; let x = 1;");
        let tools = SandboxTools::read_write(sb.clone());

        let missing = tools
            .handle(&call("read_file", serde_json::json!({"path": "nope.ts"})))
            .await?;
        assert!(missing.get("error").is_some());

        let ambiguous = tools
            .handle(&call(
                "edit_file",
                serde_json::json!({"path": "src/a.ts", "old_string": "let x", "new_string": "let y"}),
            ))
            .await?;
        assert!(ambiguous.get("error").is_some());

        let bad_args = tools.handle(&call("glob", serde_json::json!({}))).await?;
        assert!(bad_args["error"].as_str().unwrap().contains("invalid arguments"));
        Ok(())
    }

    #[tokio::test]
    async fn test_edit_and_read() -> Result<()> {
        let sb = Arc::new(FakeSandbox::new());
        sb.put_file("src/theme.ts", "dark = false");
        let tools = SandboxTools::read_write(sb.clone());
        tools
            .handle(&call(
                "edit_file",
                serde_json::json!({"path": "src/theme.ts", "old_string": "false", "new_string": "true"}),
            ))
            .await?;
        let read = tools
            .handle(&call("read_file", serde_json::json!({"path": "src/theme.ts"})))
            .await?;
        assert_eq!(read["content"], "dark = true");
        Ok(())
    }

    #[tokio::test]
    async fn test_toolbox_routes_by_name() -> Result<()> {
        let sb = Arc::new(FakeSandbox::new());
        sb.put_file("a.txt", "hi");
        let toolbox = Toolbox::new().with(SandboxTools::read_only(sb));
        let ok = toolbox
            .handle(&call("read_file", serde_json::json!({"path": "a.txt"})))
            .await?;
        assert_eq!(ok["content"], "hi");
        let unknown = toolbox.handle(&call("launch", serde_json::json!({}))).await?;
        assert!(unknown.get("error").is_some());
        Ok(())
    }
}
