//! Scripted collaborators for tests.
//!
//! Nothing here talks to a network or spawns a process: the model replays
//! queued responses, the sandbox keeps files in memory and answers commands
//! with scripted exit codes, and the responder answers CTAs through the event
//! bus the way a human would through the CLI.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use forgeflow_common::{CtaRequest, FeaturePhase, JudgeCriterion};

use crate::agent::model::{ModelClient, ModelRequest, ModelResponse};
use crate::config::ForgeflowConfig;
use crate::context::RunContext;
use crate::cta::CTA_RESPONSE_EVENT;
use crate::durable::EventBus;
use crate::factory::db::{DbHandle, FlowDb};
use crate::factory::github::{PullRequest, PullRequestCreator, RepoLocator};
use crate::factory::models::{FlowEvent, NewFeatureRun};
use crate::factory::notify::{Notification, Notifier};
use crate::factory::sandbox::{CommandOutput, GrepMatch, Sandbox, SandboxProvider, SandboxSpec};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Pop the next scripted value; the last one repeats forever.
fn next_sticky<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

// ── Model ────────────────────────────────────────────────────────────

/// Replays queued responses. A request is routed to the first registered
/// needle that occurs in its system prompt.
#[derive(Default)]
pub struct ScriptedModel {
    routes: Mutex<Vec<(String, VecDeque<ModelResponse>)>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, needle: &str, responses: Vec<ModelResponse>) -> Self {
        lock(&self.routes).push((needle.to_string(), responses.into()));
        self
    }

    /// Happy-path replies for every agent of the pipeline. Registered after
    /// any existing routes, so those take precedence.
    pub fn with_defaults(self) -> Self {
        let mut model = self
            .on(
                "analysis orchestrator",
                vec![ModelResponse::text("## Codebase map\nsrc/theme.ts defines the colors")],
            )
            .on("codebase explorer", vec![ModelResponse::text("nothing notable")])
            .on("approaches architect", vec![ModelResponse::text(TWO_APPROACHES)]);
        for criterion in JudgeCriterion::ALL {
            model = model.on(criterion.agent_name(), vec![judge_reply("pass", "")]);
        }
        model.on("implementation coder", vec![ModelResponse::text("done")])
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        lock(&self.requests).clone()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn requests_matching(&self, needle: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|r| r.system.contains(needle))
            .count()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse> {
        lock(&self.requests).push(request.clone());
        let mut routes = lock(&self.routes);
        for (needle, queue) in routes.iter_mut() {
            if request.system.contains(needle.as_str()) {
                return next_sticky(queue)
                    .with_context(|| format!("No scripted responses left for '{}'", needle));
            }
        }
        bail!("No scripted route for system prompt: {}", request.system)
    }
}

/// Architect reply proposing approaches `A` and `B`.
pub const TWO_APPROACHES: &str = r#"Two options:
```json
{"approaches": [
  {"id": "A", "title": "CSS variables", "summary": "Theme via custom properties", "plan": "1. add toggle", "tradeoffs": "needs a fallback"},
  {"id": "B", "title": "Theme context", "summary": "Theme via a provider", "plan": "1. add context"}
]}
```"#;

/// Judge reply with `verdict` and a raw JSON list body of `findings`.
pub fn judge_reply(verdict: &str, findings: &str) -> ModelResponse {
    ModelResponse::text(&format!(
        "Review done.\n```json\n{{\"verdict\": \"{}\", \"findings\": [{}], \"overallAssessment\": \"{} overall\"}}\n```",
        verdict, findings, verdict
    ))
}

// ── Sandbox ──────────────────────────────────────────────────────────

/// In-memory sandbox. Commands succeed unless an exit code is scripted for
/// the exact command line.
pub struct FakeSandbox {
    id: String,
    files: Mutex<BTreeMap<String, String>>,
    exit_codes: Mutex<HashMap<String, VecDeque<i32>>>,
    outputs: Mutex<HashMap<String, String>>,
    commands: Mutex<Vec<String>>,
    stopped: AtomicBool,
}

impl Default for FakeSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSandbox {
    pub fn new() -> Self {
        Self {
            id: "fake-sandbox".to_string(),
            files: Mutex::new(BTreeMap::new()),
            exit_codes: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Exit codes for successive runs of `command_line`; the last repeats.
    pub fn with_exit_codes(self, command_line: &str, codes: &[i32]) -> Self {
        lock(&self.exit_codes).insert(command_line.to_string(), codes.iter().copied().collect());
        self
    }

    pub fn with_output(self, command_line: &str, stdout: &str) -> Self {
        lock(&self.outputs).insert(command_line.to_string(), stdout.to_string());
        self
    }

    pub fn put_file(&self, path: &str, content: &str) {
        lock(&self.files).insert(path.to_string(), content.to_string());
    }

    pub fn file(&self, path: &str) -> Option<String> {
        lock(&self.files).get(path).cloned()
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    pub fn count_commands(&self, command_line: &str) -> usize {
        lock(&self.commands)
            .iter()
            .filter(|c| c.as_str() == command_line)
            .count()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            bail!("Sandbox {} is stopped", self.id);
        }
        Ok(())
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run_command(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        self.ensure_running()?;
        let line = std::iter::once(cmd.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        lock(&self.commands).push(line.clone());

        let exit_code = lock(&self.exit_codes)
            .get_mut(&line)
            .and_then(next_sticky)
            .unwrap_or(0);
        let stdout = match lock(&self.outputs).get(&line) {
            Some(out) => out.clone(),
            None if exit_code != 0 => format!("{} failed with exit code {}", line, exit_code),
            None => String::new(),
        };
        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
            exit_code,
        })
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        self.ensure_running()?;
        self.file(path)
            .with_context(|| format!("Failed to read {}: no such file", path))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.ensure_running()?;
        self.put_file(path, content);
        Ok(())
    }

    async fn edit_file(&self, path: &str, old: &str, new: &str) -> Result<()> {
        let content = self.read_file(path).await?;
        match content.matches(old).count() {
            0 => bail!("old_string not found in {}", path),
            1 => self.write_file(path, &content.replacen(old, new, 1)).await,
            n => bail!("old_string matches {} times in {}", n, path),
        }
    }

    async fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        self.ensure_running()?;
        let pattern = glob::Pattern::new(pattern).context("Invalid glob")?;
        Ok(lock(&self.files)
            .keys()
            .filter(|p| pattern.matches(p))
            .cloned()
            .collect())
    }

    async fn grep(&self, pattern: &str, path: Option<&str>) -> Result<Vec<GrepMatch>> {
        self.ensure_running()?;
        let re = regex::Regex::new(pattern).context("Invalid regex")?;
        let mut matches = Vec::new();
        for (file, content) in lock(&self.files).iter() {
            if path.is_some_and(|p| !file.starts_with(p)) {
                continue;
            }
            for (i, line) in content.lines().enumerate() {
                if re.is_match(line) {
                    matches.push(GrepMatch {
                        path: file.clone(),
                        line: i + 1,
                        text: line.to_string(),
                    });
                }
            }
        }
        Ok(matches)
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out the same [`FakeSandbox`] for every spec and remembers the specs.
pub struct FakeSandboxProvider {
    sandbox: Arc<FakeSandbox>,
    specs: Mutex<Vec<SandboxSpec>>,
}

impl FakeSandboxProvider {
    pub fn new(sandbox: Arc<FakeSandbox>) -> Self {
        Self {
            sandbox,
            specs: Mutex::new(Vec::new()),
        }
    }

    pub fn specs(&self) -> Vec<SandboxSpec> {
        lock(&self.specs).clone()
    }
}

#[async_trait]
impl SandboxProvider for FakeSandboxProvider {
    async fn create(&self, spec: &SandboxSpec) -> Result<Arc<dyn Sandbox>> {
        lock(&self.specs).push(spec.clone());
        Ok(self.sandbox.clone())
    }
}

// ── Human ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ResponderPolicy {
    /// Approve everything, pick the first option of a choice.
    Approve,
    /// Approve everything, pick this option id.
    Choose(String),
    /// Never answer.
    Silent,
    /// Answer with these raw payloads in order, then behave like `Approve`.
    Scripted(Vec<serde_json::Value>),
}

/// Notifier that plays the human: answers CTA requests through the bus.
pub struct AutoResponder {
    bus: EventBus,
    choice: Option<String>,
    silent: bool,
    scripted: Mutex<VecDeque<serde_json::Value>>,
    seen: Mutex<Vec<Notification>>,
}

impl AutoResponder {
    pub fn new(bus: EventBus, policy: ResponderPolicy) -> Self {
        let (choice, silent, scripted) = match policy {
            ResponderPolicy::Approve => (None, false, Vec::new()),
            ResponderPolicy::Choose(id) => (Some(id), false, Vec::new()),
            ResponderPolicy::Silent => (None, true, Vec::new()),
            ResponderPolicy::Scripted(payloads) => (None, false, payloads),
        };
        Self {
            bus,
            choice,
            silent,
            scripted: Mutex::new(scripted.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.seen).clone()
    }

    pub fn requests_seen(&self) -> usize {
        lock(&self.seen)
            .iter()
            .filter(|n| matches!(n, Notification::CtaRequested { .. }))
            .count()
    }

    fn answer(&self, request: &CtaRequest) -> Option<serde_json::Value> {
        if let Some(payload) = lock(&self.scripted).pop_front() {
            return Some(payload);
        }
        if self.silent {
            return None;
        }
        Some(match request {
            CtaRequest::Approval { .. } => serde_json::json!({ "kind": "approval", "approved": true }),
            CtaRequest::Text { .. } => serde_json::json!({ "kind": "text", "text": "ok" }),
            CtaRequest::Choice { options, .. } => {
                let id = self
                    .choice
                    .clone()
                    .or_else(|| options.first().map(|o| o.id.clone()))
                    .unwrap_or_default();
                serde_json::json!({ "kind": "choice", "selected_id": id })
            }
        })
    }
}

#[async_trait]
impl Notifier for AutoResponder {
    async fn publish(&self, notification: &Notification) -> Result<()> {
        lock(&self.seen).push(notification.clone());
        if let Notification::CtaRequested {
            run_id,
            cta_id,
            request,
        } = notification
            && let Some(payload) = self.answer(request)
        {
            self.bus
                .send_event(FlowEvent::new(run_id, CTA_RESPONSE_EVENT, cta_id, payload))
                .await?;
        }
        Ok(())
    }
}

// ── Source host ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrCall {
    pub repo: String,
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

#[derive(Default)]
pub struct FakePrCreator {
    calls: Mutex<Vec<PrCall>>,
}

impl FakePrCreator {
    pub fn calls(&self) -> Vec<PrCall> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl PullRequestCreator for FakePrCreator {
    async fn create_pull_request(
        &self,
        repo: &RepoLocator,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest> {
        let mut calls = lock(&self.calls);
        calls.push(PrCall {
            repo: repo.slug(),
            head: head.to_string(),
            base: base.to_string(),
            title: title.to_string(),
            body: body.to_string(),
        });
        let number = calls.len() as u64;
        Ok(PullRequest {
            url: format!("https://github.com/{}/pull/{}", repo.slug(), number),
            number,
        })
    }
}

// ── Wiring ───────────────────────────────────────────────────────────

/// Defaults tuned for tests: one-second CTA timeout, fast polling, no step
/// retries.
pub fn test_config() -> ForgeflowConfig {
    let mut config = ForgeflowConfig::default();
    config.cta.timeout_secs = 1;
    config.cta.poll_interval_ms = 10;
    config.limits.max_step_retries = 0;
    config
}

pub struct TestHarness {
    pub ctx: RunContext,
    pub model: Arc<ScriptedModel>,
    pub sandbox: Arc<FakeSandbox>,
    pub sandboxes: Arc<FakeSandboxProvider>,
    pub responder: Arc<AutoResponder>,
    pub prs: Arc<FakePrCreator>,
}

impl TestHarness {
    pub fn new(policy: ResponderPolicy) -> Result<Self> {
        test_context(ScriptedModel::new(), FakeSandbox::new(), policy)
    }

    pub fn with_model(model: ScriptedModel, policy: ResponderPolicy) -> Result<Self> {
        test_context(model, FakeSandbox::new(), policy)
    }
}

/// Wire scripted collaborators into a [`RunContext`] over an in-memory
/// database.
pub fn test_context(
    model: ScriptedModel,
    sandbox: FakeSandbox,
    policy: ResponderPolicy,
) -> Result<TestHarness> {
    let db = DbHandle::new(FlowDb::new_in_memory()?);
    let bus = EventBus::new(db.clone());
    let model = Arc::new(model);
    let sandbox = Arc::new(sandbox);
    let sandboxes = Arc::new(FakeSandboxProvider::new(sandbox.clone()));
    let responder = Arc::new(AutoResponder::new(bus.clone(), policy));
    let prs = Arc::new(FakePrCreator::default());
    let ctx = RunContext {
        db,
        bus,
        model: model.clone(),
        sandboxes: sandboxes.clone(),
        notifier: responder.clone(),
        pr_creator: prs.clone(),
        config: Arc::new(test_config()),
    };
    Ok(TestHarness {
        ctx,
        model,
        sandbox,
        sandboxes,
        responder,
        prs,
    })
}

/// Ensure a run exists and open a running result for `phase`. Returns the
/// phase result id.
pub async fn seed_phase(db: &DbHandle, run_id: &str, phase: FeaturePhase) -> Result<String> {
    let run_id = run_id.to_string();
    db.call(move |db| {
        db.create_feature_run(&NewFeatureRun {
            id: run_id.clone(),
            prompt: "Add dark mode toggle".to_string(),
            repo: "org/app".to_string(),
            base_branch: "main".to_string(),
        })?;
        let id = uuid::Uuid::new_v4().to_string();
        db.create_phase_result(&id, &run_id, phase)?;
        Ok(id)
    })
    .await
}
