use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{SecondsFormat, Utc};
use forgeflow_common::{
    CtaKind, CtaRequest, CtaResponse, FeaturePhase, MemoryRecord, PhaseOutput, PhaseStatus,
};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;
use crate::errors::OrchestratorError;

/// Async-safe handle to the flow database.
///
/// Wraps `FlowDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FlowDb>>,
}

impl DbHandle {
    pub fn new(db: FlowDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&FlowDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Used at startup, in the
    /// CLI's one-shot commands, and in tests. Never call it from a hot async
    /// path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, FlowDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct FlowDb {
    conn: Connection,
}

/// UTC timestamp with millisecond precision, sortable as text.
pub fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl FlowDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        // `respond` writes from a second process while a run is waiting.
        self.conn
            .busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS feature_runs (
                    id TEXT PRIMARY KEY,
                    prompt TEXT NOT NULL,
                    repo TEXT NOT NULL,
                    base_branch TEXT NOT NULL,
                    work_branch TEXT,
                    sandbox_id TEXT,
                    current_phase TEXT NOT NULL DEFAULT 'analysis',
                    memories TEXT NOT NULL DEFAULT '[]',
                    pr_url TEXT,
                    error TEXT,
                    created_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS sandboxes (
                    id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES feature_runs(id),
                    status TEXT NOT NULL DEFAULT 'pending',
                    memory TEXT NOT NULL,
                    cpus REAL NOT NULL,
                    timeout_secs INTEGER NOT NULL,
                    workdir TEXT,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    stopped_at TEXT
                );

                CREATE TABLE IF NOT EXISTS phase_results (
                    id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES feature_runs(id),
                    phase TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'running',
                    output TEXT,
                    error TEXT,
                    started_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS agent_invocations (
                    id TEXT PRIMARY KEY,
                    phase_result_id TEXT NOT NULL REFERENCES phase_results(id),
                    parent_invocation_id TEXT REFERENCES agent_invocations(id),
                    agent_type TEXT NOT NULL,
                    model TEXT NOT NULL,
                    system_prompt TEXT NOT NULL,
                    input_messages TEXT NOT NULL DEFAULT '[]',
                    finish_reason TEXT,
                    output_text TEXT,
                    input_tokens INTEGER NOT NULL DEFAULT 0,
                    output_tokens INTEGER NOT NULL DEFAULT 0,
                    steps INTEGER NOT NULL DEFAULT 0,
                    tool_calls TEXT NOT NULL DEFAULT '[]',
                    started_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS cta_events (
                    id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES feature_runs(id),
                    phase_result_id TEXT NOT NULL REFERENCES phase_results(id),
                    invocation_id TEXT REFERENCES agent_invocations(id),
                    tool_call_id TEXT,
                    kind TEXT NOT NULL,
                    request_message TEXT,
                    request_prompt TEXT,
                    request_placeholder TEXT,
                    request_options TEXT,
                    response_approved INTEGER,
                    response_reason TEXT,
                    response_text TEXT,
                    response_selected_id TEXT,
                    response_payload TEXT,
                    protocol_error TEXT,
                    requested_at TEXT NOT NULL,
                    responded_at TEXT,
                    timed_out INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS step_journal (
                    run_id TEXT NOT NULL,
                    step_key TEXT NOT NULL,
                    value TEXT NOT NULL,
                    recorded_at TEXT NOT NULL,
                    PRIMARY KEY (run_id, step_key)
                );

                CREATE TABLE IF NOT EXISTS flow_events (
                    id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    correlation_id TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_phase_results_one_running
                    ON phase_results(run_id, phase) WHERE status = 'running';
                CREATE INDEX IF NOT EXISTS idx_phase_results_run ON phase_results(run_id);
                CREATE INDEX IF NOT EXISTS idx_invocations_phase ON agent_invocations(phase_result_id);
                CREATE INDEX IF NOT EXISTS idx_cta_events_run ON cta_events(run_id);
                CREATE INDEX IF NOT EXISTS idx_flow_events_match ON flow_events(name, correlation_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Feature runs ──────────────────────────────────────────────────

    pub fn create_feature_run(&self, new: &NewFeatureRun) -> Result<FeatureRun> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO feature_runs (id, prompt, repo, base_branch, current_phase, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'analysis', ?5)",
                params![new.id, new.prompt, new.repo, new.base_branch, now_ts()],
            )
            .context("Failed to insert feature run")?;
        self.require_feature_run(&new.id)
    }

    pub fn get_feature_run(&self, id: &str) -> Result<Option<FeatureRun>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM feature_runs WHERE id = ?1", FeatureRunRow::COLUMNS),
                params![id],
                FeatureRunRow::from_row,
            )
            .optional()
            .context("Failed to query feature run")?
            .map(FeatureRunRow::into_feature_run)
            .transpose()
    }

    fn require_feature_run(&self, id: &str) -> Result<FeatureRun> {
        self.get_feature_run(id)?
            .ok_or_else(|| OrchestratorError::RunNotFound { id: id.to_string() }.into())
    }

    pub fn list_feature_runs(&self) -> Result<Vec<FeatureRun>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM feature_runs ORDER BY created_at DESC, rowid DESC",
                FeatureRunRow::COLUMNS
            ))
            .context("Failed to prepare list_feature_runs")?;
        let rows = stmt
            .query_map([], FeatureRunRow::from_row)
            .context("Failed to query feature runs")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read feature_run row")?;
        rows.into_iter().map(FeatureRunRow::into_feature_run).collect()
    }

    pub fn set_feature_run_sandbox(
        &self,
        id: &str,
        sandbox_id: &str,
        work_branch: &str,
    ) -> Result<FeatureRun> {
        self.conn
            .execute(
                "UPDATE feature_runs SET sandbox_id = ?2, work_branch = ?3 WHERE id = ?1",
                params![id, sandbox_id, work_branch],
            )
            .context("Failed to set feature run sandbox")?;
        self.require_feature_run(id)
    }

    /// Move the run to `to`. Only succeeds from the immediate predecessor of
    /// `to`; a run already at or past `to` is left untouched.
    pub fn advance_feature_run_phase(&self, id: &str, to: FeaturePhase) -> Result<FeatureRun> {
        let Some(from) = to.predecessor() else {
            bail!("Cannot advance a run to {}", to);
        };
        let changed = self
            .conn
            .execute(
                "UPDATE feature_runs
                 SET current_phase = ?2,
                     completed_at = CASE WHEN ?2 = 'completed' THEN ?4 ELSE completed_at END
                 WHERE id = ?1 AND current_phase = ?3",
                params![id, to.as_str(), from.as_str(), now_ts()],
            )
            .context("Failed to advance feature run")?;
        let run = self.require_feature_run(id)?;
        if changed == 0 && !phase_reached(run.current_phase, to) {
            bail!(
                "Cannot advance run {} from {} to {}",
                id,
                run.current_phase,
                to
            );
        }
        Ok(run)
    }

    /// Finish a run in the `pr` phase: record the PR URL and mark it completed.
    pub fn complete_feature_run(&self, id: &str, pr_url: &str) -> Result<FeatureRun> {
        let changed = self
            .conn
            .execute(
                "UPDATE feature_runs SET current_phase = 'completed', pr_url = ?2, completed_at = ?3
                 WHERE id = ?1 AND current_phase = 'pr'",
                params![id, pr_url, now_ts()],
            )
            .context("Failed to complete feature run")?;
        let run = self.require_feature_run(id)?;
        if changed == 0 && run.current_phase != FeaturePhase::Completed {
            bail!("Cannot complete run {} from {}", id, run.current_phase);
        }
        Ok(run)
    }

    /// Mark a run failed. A run that already finished keeps its outcome.
    pub fn fail_feature_run(&self, id: &str, error: &str) -> Result<FeatureRun> {
        self.conn
            .execute(
                "UPDATE feature_runs SET current_phase = 'failed', error = ?2, completed_at = ?3
                 WHERE id = ?1 AND current_phase NOT IN ('completed', 'failed')",
                params![id, error, now_ts()],
            )
            .context("Failed to fail feature run")?;
        self.require_feature_run(id)
    }

    /// Append memory records. Each append is a single `json_insert` on the
    /// stored array, so concurrent writers never overwrite each other.
    pub fn update_feature_run_memories(&self, id: &str, records: &[MemoryRecord]) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin memory transaction")?;
        for record in records {
            let json = serde_json::to_string(record).context("Failed to serialize memory")?;
            let changed = tx
                .execute(
                    "UPDATE feature_runs SET memories = json_insert(memories, '$[#]', json(?2))
                     WHERE id = ?1",
                    params![id, json],
                )
                .context("Failed to append memory")?;
            if changed == 0 {
                return Err(OrchestratorError::RunNotFound { id: id.to_string() }.into());
            }
        }
        tx.commit().context("Failed to commit memories")?;
        Ok(())
    }

    pub fn get_memories(&self, id: &str) -> Result<Vec<MemoryRecord>> {
        Ok(self.require_feature_run(id)?.memories)
    }

    // ── Sandboxes ─────────────────────────────────────────────────────

    pub fn create_sandbox_record(&self, new: &NewSandboxRecord) -> Result<SandboxRecord> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO sandboxes (id, run_id, status, memory, cpus, timeout_secs, workdir, created_at)
                 VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?7)",
                params![
                    new.id,
                    new.run_id,
                    new.memory,
                    new.cpus,
                    new.timeout_secs as i64,
                    new.workdir,
                    now_ts()
                ],
            )
            .context("Failed to insert sandbox record")?;
        self.get_sandbox_record(&new.id)?
            .context("Sandbox record missing after insert")
    }

    pub fn get_sandbox_record(&self, id: &str) -> Result<Option<SandboxRecord>> {
        self.conn
            .query_row(
                "SELECT id, run_id, status, memory, cpus, timeout_secs, workdir, created_at, started_at, stopped_at
                 FROM sandboxes WHERE id = ?1",
                params![id],
                |row| {
                    Ok(SandboxRow {
                        id: row.get(0)?,
                        run_id: row.get(1)?,
                        status: row.get(2)?,
                        memory: row.get(3)?,
                        cpus: row.get(4)?,
                        timeout_secs: row.get(5)?,
                        workdir: row.get(6)?,
                        created_at: row.get(7)?,
                        started_at: row.get(8)?,
                        stopped_at: row.get(9)?,
                    })
                },
            )
            .optional()
            .context("Failed to query sandbox")?
            .map(SandboxRow::into_sandbox_record)
            .transpose()
    }

    /// Returns false when the sandbox had already reached a terminal status.
    pub fn update_sandbox_status(&self, id: &str, status: SandboxStatus) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE sandboxes
                 SET status = ?2,
                     started_at = CASE WHEN ?2 = 'running' AND started_at IS NULL THEN ?3 ELSE started_at END,
                     stopped_at = CASE WHEN ?2 IN ('stopped', 'failed', 'aborted') THEN ?3 ELSE stopped_at END
                 WHERE id = ?1 AND status NOT IN ('stopped', 'failed', 'aborted')",
                params![id, status.as_str(), now_ts()],
            )
            .context("Failed to update sandbox status")?;
        Ok(changed > 0)
    }

    // ── Phase results ─────────────────────────────────────────────────

    pub fn create_phase_result(
        &self,
        id: &str,
        run_id: &str,
        phase: FeaturePhase,
    ) -> Result<PhaseResult> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO phase_results (id, run_id, phase, status, started_at)
                 VALUES (?1, ?2, ?3, 'running', ?4)",
                params![id, run_id, phase.as_str(), now_ts()],
            )
            .context("Failed to insert phase result")?;
        match self.get_phase_result(id)? {
            Some(result) => Ok(result),
            None => bail!(
                "Phase {} of run {} already has a running result",
                phase,
                run_id
            ),
        }
    }

    pub fn get_phase_result(&self, id: &str) -> Result<Option<PhaseResult>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM phase_results WHERE id = ?1", PhaseResultRow::COLUMNS),
                params![id],
                PhaseResultRow::from_row,
            )
            .optional()
            .context("Failed to query phase result")?
            .map(PhaseResultRow::into_phase_result)
            .transpose()
    }

    pub fn get_phase_results(&self, run_id: &str) -> Result<Vec<PhaseResult>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM phase_results WHERE run_id = ?1 ORDER BY started_at, rowid",
                PhaseResultRow::COLUMNS
            ))
            .context("Failed to prepare get_phase_results")?;
        let rows = stmt
            .query_map(params![run_id], PhaseResultRow::from_row)
            .context("Failed to query phase results")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read phase_result row")?;
        rows.into_iter().map(PhaseResultRow::into_phase_result).collect()
    }

    /// The output of the passed result for `phase`, if any.
    pub fn passed_output(&self, run_id: &str, phase: FeaturePhase) -> Result<Option<PhaseOutput>> {
        let raw: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT output FROM phase_results
                 WHERE run_id = ?1 AND phase = ?2 AND status = 'passed'
                 ORDER BY completed_at DESC LIMIT 1",
                params![run_id, phase.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query phase output")?;
        raw.flatten()
            .map(|s| serde_json::from_str(&s).context("Failed to parse phase output"))
            .transpose()
    }

    /// No-op (returns false) if the result is already terminal.
    pub fn pass_phase_result(&self, id: &str, output: &PhaseOutput) -> Result<bool> {
        let json = serde_json::to_string(output).context("Failed to serialize phase output")?;
        let changed = self
            .conn
            .execute(
                "UPDATE phase_results SET status = 'passed', output = ?2, completed_at = ?3
                 WHERE id = ?1 AND status = 'running'",
                params![id, json, now_ts()],
            )
            .context("Failed to pass phase result")?;
        Ok(changed > 0)
    }

    /// No-op (returns false) if the result is already terminal.
    pub fn fail_phase_result(
        &self,
        id: &str,
        error: &str,
        output: Option<&PhaseOutput>,
    ) -> Result<bool> {
        let json = output
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize phase output")?;
        let changed = self
            .conn
            .execute(
                "UPDATE phase_results SET status = 'failed', error = ?2, output = ?3, completed_at = ?4
                 WHERE id = ?1 AND status = 'running'",
                params![id, error, json, now_ts()],
            )
            .context("Failed to fail phase result")?;
        Ok(changed > 0)
    }

    // ── Agent invocations ─────────────────────────────────────────────

    pub fn create_agent_invocation(&self, new: &NewAgentInvocation) -> Result<AgentInvocation> {
        let messages =
            serde_json::to_string(&new.input_messages).context("Failed to serialize messages")?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO agent_invocations
                 (id, phase_result_id, parent_invocation_id, agent_type, model, system_prompt, input_messages, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    new.id,
                    new.phase_result_id,
                    new.parent_invocation_id,
                    new.agent_type.as_str(),
                    new.model,
                    new.system_prompt,
                    messages,
                    now_ts()
                ],
            )
            .context("Failed to insert agent invocation")?;
        self.get_agent_invocation(&new.id)?
            .context("Agent invocation missing after insert")
    }

    pub fn get_agent_invocation(&self, id: &str) -> Result<Option<AgentInvocation>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM agent_invocations a WHERE a.id = ?1",
                    InvocationRow::COLUMNS
                ),
                params![id],
                InvocationRow::from_row,
            )
            .optional()
            .context("Failed to query agent invocation")?
            .map(InvocationRow::into_invocation)
            .transpose()
    }

    /// No-op (returns false) if the invocation already completed.
    pub fn complete_agent_invocation(
        &self,
        id: &str,
        completion: &InvocationCompletion,
    ) -> Result<bool> {
        let tool_calls =
            serde_json::to_string(&completion.tool_calls).context("Failed to serialize tool calls")?;
        let changed = self
            .conn
            .execute(
                "UPDATE agent_invocations
                 SET finish_reason = ?2, output_text = ?3, input_tokens = ?4, output_tokens = ?5,
                     steps = ?6, tool_calls = ?7, completed_at = ?8
                 WHERE id = ?1 AND completed_at IS NULL",
                params![
                    id,
                    completion.finish_reason,
                    completion.output_text,
                    completion.input_tokens as i64,
                    completion.output_tokens as i64,
                    completion.steps,
                    tool_calls,
                    now_ts()
                ],
            )
            .context("Failed to complete agent invocation")?;
        Ok(changed > 0)
    }

    pub fn list_agent_invocations(&self, run_id: &str) -> Result<Vec<AgentInvocation>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM agent_invocations a
                 JOIN phase_results p ON p.id = a.phase_result_id
                 WHERE p.run_id = ?1 ORDER BY a.started_at, a.rowid",
                InvocationRow::COLUMNS
            ))
            .context("Failed to prepare list_agent_invocations")?;
        let rows = stmt
            .query_map(params![run_id], InvocationRow::from_row)
            .context("Failed to query agent invocations")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read agent_invocation row")?;
        rows.into_iter().map(InvocationRow::into_invocation).collect()
    }

    pub fn invocation_forest(&self, run_id: &str) -> Result<InvocationForest> {
        Ok(InvocationForest::build(self.list_agent_invocations(run_id)?))
    }

    // ── CTA events ────────────────────────────────────────────────────

    pub fn create_cta_event(&self, new: &NewCtaEvent) -> Result<CtaEvent> {
        let (message, prompt, placeholder, options) = match &new.request {
            CtaRequest::Approval { message } => (Some(message.as_str()), None, None, None),
            CtaRequest::Text {
                prompt,
                placeholder,
            } => (None, Some(prompt.as_str()), placeholder.as_deref(), None),
            CtaRequest::Choice { prompt, options } => (
                None,
                Some(prompt.as_str()),
                None,
                Some(serde_json::to_string(options).context("Failed to serialize options")?),
            ),
        };
        self.conn
            .execute(
                "INSERT OR IGNORE INTO cta_events
                 (id, run_id, phase_result_id, invocation_id, tool_call_id, kind,
                  request_message, request_prompt, request_placeholder, request_options, requested_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    new.id,
                    new.run_id,
                    new.phase_result_id,
                    new.invocation_id,
                    new.tool_call_id,
                    new.request.kind().as_str(),
                    message,
                    prompt,
                    placeholder,
                    options,
                    now_ts()
                ],
            )
            .context("Failed to insert CTA event")?;
        self.get_cta_event(&new.id)?
            .context("CTA event missing after insert")
    }

    pub fn get_cta_event(&self, id: &str) -> Result<Option<CtaEvent>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM cta_events WHERE id = ?1", CtaEventRow::COLUMNS),
                params![id],
                CtaEventRow::from_row,
            )
            .optional()
            .context("Failed to query CTA event")?
            .map(CtaEventRow::into_cta_event)
            .transpose()
    }

    pub fn list_cta_events(&self, run_id: &str) -> Result<Vec<CtaEvent>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM cta_events WHERE run_id = ?1 ORDER BY requested_at, rowid",
                CtaEventRow::COLUMNS
            ))
            .context("Failed to prepare list_cta_events")?;
        let rows = stmt
            .query_map(params![run_id], CtaEventRow::from_row)
            .context("Failed to query CTA events")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read cta_event row")?;
        rows.into_iter().map(CtaEventRow::into_cta_event).collect()
    }

    /// Record a valid response. No-op (returns false) once resolved.
    pub fn complete_cta_event(
        &self,
        id: &str,
        response: &CtaResponse,
        raw_payload: &str,
    ) -> Result<bool> {
        let (approved, reason, text, selected_id) = match response {
            CtaResponse::Approval { approved, reason } => {
                (Some(*approved), reason.as_deref(), None, None)
            }
            CtaResponse::Text { text } => (None, None, Some(text.as_str()), None),
            CtaResponse::Choice { selected_id } => (None, None, None, Some(selected_id.as_str())),
        };
        let changed = self
            .conn
            .execute(
                "UPDATE cta_events
                 SET response_approved = ?2, response_reason = ?3, response_text = ?4,
                     response_selected_id = ?5, response_payload = ?6, responded_at = ?7
                 WHERE id = ?1 AND responded_at IS NULL AND timed_out = 0",
                params![id, approved, reason, text, selected_id, raw_payload, now_ts()],
            )
            .context("Failed to complete CTA event")?;
        Ok(changed > 0)
    }

    /// Record a response that failed validation. The event becomes terminal
    /// with no typed response.
    pub fn record_cta_protocol_error(
        &self,
        id: &str,
        raw_payload: &str,
        error: &str,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE cta_events SET response_payload = ?2, protocol_error = ?3, responded_at = ?4
                 WHERE id = ?1 AND responded_at IS NULL AND timed_out = 0",
                params![id, raw_payload, error, now_ts()],
            )
            .context("Failed to record CTA protocol error")?;
        Ok(changed > 0)
    }

    /// No-op (returns false) once resolved.
    pub fn timeout_cta_event(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE cta_events SET timed_out = 1
                 WHERE id = ?1 AND responded_at IS NULL AND timed_out = 0",
                params![id],
            )
            .context("Failed to time out CTA event")?;
        Ok(changed > 0)
    }

    // ── Step journal ──────────────────────────────────────────────────

    pub fn get_step(&self, run_id: &str, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM step_journal WHERE run_id = ?1 AND step_key = ?2",
                params![run_id, key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query step journal")
    }

    /// Record a step value. The first writer wins; the stored value is
    /// returned either way.
    pub fn record_step(&self, run_id: &str, key: &str, value: &str) -> Result<String> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO step_journal (run_id, step_key, value, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![run_id, key, value, now_ts()],
            )
            .context("Failed to record step")?;
        self.get_step(run_id, key)?
            .context("Step missing after insert")
    }

    pub fn count_steps(&self, run_id: &str) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM step_journal WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .context("Failed to count steps")?;
        Ok(n as usize)
    }

    /// Count recorded steps whose key starts with `prefix` and whose value is
    /// exactly `value`.
    pub fn count_steps_with_value(&self, run_id: &str, prefix: &str, value: &str) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM step_journal
                 WHERE run_id = ?1 AND substr(step_key, 1, length(?2)) = ?2 AND value = ?3",
                params![run_id, prefix, value],
                |row| row.get(0),
            )
            .context("Failed to count steps")?;
        Ok(n as usize)
    }

    // ── Flow events ───────────────────────────────────────────────────

    /// Returns false when an event with this id was already stored.
    pub fn insert_flow_event(&self, event: &FlowEvent) -> Result<bool> {
        let payload = serde_json::to_string(&event.payload).context("Failed to serialize event")?;
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO flow_events (id, run_id, name, correlation_id, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.id,
                    event.run_id,
                    event.name,
                    event.correlation_id,
                    payload,
                    event.created_at
                ],
            )
            .context("Failed to insert flow event")?;
        Ok(changed > 0)
    }

    /// The earliest stored event matching `name` and `correlation_id`.
    pub fn find_flow_event(&self, name: &str, correlation_id: &str) -> Result<Option<FlowEvent>> {
        self.conn
            .query_row(
                "SELECT id, run_id, name, correlation_id, payload, created_at FROM flow_events
                 WHERE name = ?1 AND correlation_id = ?2 ORDER BY created_at, rowid LIMIT 1",
                params![name, correlation_id],
                flow_event_from_row,
            )
            .optional()
            .context("Failed to query flow event")?
            .transpose()
    }

    pub fn list_flow_events(&self, run_id: &str) -> Result<Vec<FlowEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, name, correlation_id, payload, created_at FROM flow_events
                 WHERE run_id = ?1 ORDER BY created_at, rowid",
            )
            .context("Failed to prepare list_flow_events")?;
        let rows = stmt
            .query_map(params![run_id], flow_event_from_row)
            .context("Failed to query flow events")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read flow_event row")?;
        rows.into_iter().collect()
    }

    // ── Reports ───────────────────────────────────────────────────────

    pub fn run_report(&self, run_id: &str) -> Result<Option<RunReport>> {
        let Some(run) = self.get_feature_run(run_id)? else {
            return Ok(None);
        };
        let sandbox = match &run.sandbox_id {
            Some(id) => self.get_sandbox_record(id)?,
            None => None,
        };
        Ok(Some(RunReport {
            phases: self.get_phase_results(run_id)?,
            cta_events: self.list_cta_events(run_id)?,
            invocation_count: self.list_agent_invocations(run_id)?.len(),
            sandbox,
            run,
        }))
    }
}

/// Whether a run sitting at `current` has already reached `target`.
fn phase_reached(current: FeaturePhase, target: FeaturePhase) -> bool {
    let pos = |p: FeaturePhase| FeaturePhase::ORDER.iter().position(|o| *o == p);
    match (pos(current), pos(target)) {
        (Some(c), Some(t)) => c >= t,
        _ => false,
    }
}

fn parse_enum<T: FromStr<Err = String>>(value: &str, what: &str) -> Result<T> {
    T::from_str(value)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to parse {}", what))
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Intermediate row struct for feature_runs before parsing the phase and
/// memories JSON.
struct FeatureRunRow {
    id: String,
    prompt: String,
    repo: String,
    base_branch: String,
    work_branch: Option<String>,
    sandbox_id: Option<String>,
    current_phase: String,
    memories: String,
    pr_url: Option<String>,
    error: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

impl FeatureRunRow {
    const COLUMNS: &'static str = "id, prompt, repo, base_branch, work_branch, sandbox_id, current_phase, memories, pr_url, error, created_at, completed_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            prompt: row.get(1)?,
            repo: row.get(2)?,
            base_branch: row.get(3)?,
            work_branch: row.get(4)?,
            sandbox_id: row.get(5)?,
            current_phase: row.get(6)?,
            memories: row.get(7)?,
            pr_url: row.get(8)?,
            error: row.get(9)?,
            created_at: row.get(10)?,
            completed_at: row.get(11)?,
        })
    }

    fn into_feature_run(self) -> Result<FeatureRun> {
        let current_phase = parse_enum(&self.current_phase, "feature run phase")?;
        let memories: Vec<MemoryRecord> =
            serde_json::from_str(&self.memories).context("Failed to parse memories JSON")?;
        Ok(FeatureRun {
            id: self.id,
            prompt: self.prompt,
            repo: self.repo,
            base_branch: self.base_branch,
            work_branch: self.work_branch,
            sandbox_id: self.sandbox_id,
            current_phase,
            memories,
            pr_url: self.pr_url,
            error: self.error,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

struct SandboxRow {
    id: String,
    run_id: String,
    status: String,
    memory: String,
    cpus: f64,
    timeout_secs: i64,
    workdir: Option<String>,
    created_at: String,
    started_at: Option<String>,
    stopped_at: Option<String>,
}

impl SandboxRow {
    fn into_sandbox_record(self) -> Result<SandboxRecord> {
        Ok(SandboxRecord {
            status: parse_enum(&self.status, "sandbox status")?,
            id: self.id,
            run_id: self.run_id,
            memory: self.memory,
            cpus: self.cpus,
            timeout_secs: self.timeout_secs.max(0) as u64,
            workdir: self.workdir,
            created_at: self.created_at,
            started_at: self.started_at,
            stopped_at: self.stopped_at,
        })
    }
}

struct PhaseResultRow {
    id: String,
    run_id: String,
    phase: String,
    status: String,
    output: Option<String>,
    error: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl PhaseResultRow {
    const COLUMNS: &'static str =
        "id, run_id, phase, status, output, error, started_at, completed_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            phase: row.get(2)?,
            status: row.get(3)?,
            output: row.get(4)?,
            error: row.get(5)?,
            started_at: row.get(6)?,
            completed_at: row.get(7)?,
        })
    }

    fn into_phase_result(self) -> Result<PhaseResult> {
        let phase: FeaturePhase = parse_enum(&self.phase, "phase")?;
        let status: PhaseStatus = parse_enum(&self.status, "phase status")?;
        let output = self
            .output
            .as_deref()
            .map(serde_json::from_str::<PhaseOutput>)
            .transpose()
            .context("Failed to parse phase output JSON")?;
        Ok(PhaseResult {
            id: self.id,
            run_id: self.run_id,
            phase,
            status,
            output,
            error: self.error,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

struct InvocationRow {
    id: String,
    phase_result_id: String,
    parent_invocation_id: Option<String>,
    agent_type: String,
    model: String,
    system_prompt: String,
    input_messages: String,
    finish_reason: Option<String>,
    output_text: Option<String>,
    input_tokens: i64,
    output_tokens: i64,
    steps: u32,
    tool_calls: String,
    started_at: String,
    completed_at: Option<String>,
}

impl InvocationRow {
    const COLUMNS: &'static str = "a.id, a.phase_result_id, a.parent_invocation_id, a.agent_type, a.model, a.system_prompt, a.input_messages, a.finish_reason, a.output_text, a.input_tokens, a.output_tokens, a.steps, a.tool_calls, a.started_at, a.completed_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            phase_result_id: row.get(1)?,
            parent_invocation_id: row.get(2)?,
            agent_type: row.get(3)?,
            model: row.get(4)?,
            system_prompt: row.get(5)?,
            input_messages: row.get(6)?,
            finish_reason: row.get(7)?,
            output_text: row.get(8)?,
            input_tokens: row.get(9)?,
            output_tokens: row.get(10)?,
            steps: row.get(11)?,
            tool_calls: row.get(12)?,
            started_at: row.get(13)?,
            completed_at: row.get(14)?,
        })
    }

    fn into_invocation(self) -> Result<AgentInvocation> {
        Ok(AgentInvocation {
            agent_type: parse_enum(&self.agent_type, "agent type")?,
            input_messages: serde_json::from_str(&self.input_messages)
                .context("Failed to parse input messages JSON")?,
            tool_calls: serde_json::from_str(&self.tool_calls)
                .context("Failed to parse tool calls JSON")?,
            id: self.id,
            phase_result_id: self.phase_result_id,
            parent_invocation_id: self.parent_invocation_id,
            model: self.model,
            system_prompt: self.system_prompt,
            finish_reason: self.finish_reason,
            output_text: self.output_text,
            input_tokens: self.input_tokens.max(0) as u64,
            output_tokens: self.output_tokens.max(0) as u64,
            steps: self.steps,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

/// Intermediate row struct for cta_events. Request and response fields are
/// stored per kind and reassembled into the tagged types here.
struct CtaEventRow {
    id: String,
    run_id: String,
    phase_result_id: String,
    invocation_id: Option<String>,
    tool_call_id: Option<String>,
    kind: String,
    request_message: Option<String>,
    request_prompt: Option<String>,
    request_placeholder: Option<String>,
    request_options: Option<String>,
    response_approved: Option<bool>,
    response_reason: Option<String>,
    response_text: Option<String>,
    response_selected_id: Option<String>,
    response_payload: Option<String>,
    protocol_error: Option<String>,
    requested_at: String,
    responded_at: Option<String>,
    timed_out: bool,
}

impl CtaEventRow {
    const COLUMNS: &'static str = "id, run_id, phase_result_id, invocation_id, tool_call_id, kind, request_message, request_prompt, request_placeholder, request_options, response_approved, response_reason, response_text, response_selected_id, response_payload, protocol_error, requested_at, responded_at, timed_out";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            phase_result_id: row.get(2)?,
            invocation_id: row.get(3)?,
            tool_call_id: row.get(4)?,
            kind: row.get(5)?,
            request_message: row.get(6)?,
            request_prompt: row.get(7)?,
            request_placeholder: row.get(8)?,
            request_options: row.get(9)?,
            response_approved: row.get(10)?,
            response_reason: row.get(11)?,
            response_text: row.get(12)?,
            response_selected_id: row.get(13)?,
            response_payload: row.get(14)?,
            protocol_error: row.get(15)?,
            requested_at: row.get(16)?,
            responded_at: row.get(17)?,
            timed_out: row.get(18)?,
        })
    }

    fn into_cta_event(self) -> Result<CtaEvent> {
        let kind: CtaKind = parse_enum(&self.kind, "CTA kind")?;
        let request = match kind {
            CtaKind::Approval => CtaRequest::Approval {
                message: self.request_message.unwrap_or_default(),
            },
            CtaKind::Text => CtaRequest::Text {
                prompt: self.request_prompt.unwrap_or_default(),
                placeholder: self.request_placeholder,
            },
            CtaKind::Choice => CtaRequest::Choice {
                prompt: self.request_prompt.unwrap_or_default(),
                options: serde_json::from_str(self.request_options.as_deref().unwrap_or("[]"))
                    .context("Failed to parse CTA options JSON")?,
            },
        };
        let response = match kind {
            CtaKind::Approval => self.response_approved.map(|approved| CtaResponse::Approval {
                approved,
                reason: self.response_reason,
            }),
            CtaKind::Text => self.response_text.map(|text| CtaResponse::Text { text }),
            CtaKind::Choice => self
                .response_selected_id
                .map(|selected_id| CtaResponse::Choice { selected_id }),
        };
        Ok(CtaEvent {
            id: self.id,
            run_id: self.run_id,
            phase_result_id: self.phase_result_id,
            invocation_id: self.invocation_id,
            tool_call_id: self.tool_call_id,
            kind,
            request,
            response,
            response_payload: self.response_payload,
            protocol_error: self.protocol_error,
            requested_at: self.requested_at,
            responded_at: self.responded_at,
            timed_out: self.timed_out,
        })
    }
}

fn flow_event_from_row(row: &Row<'_>) -> rusqlite::Result<Result<FlowEvent>> {
    let payload: String = row.get(4)?;
    let id: String = row.get(0)?;
    let run_id: String = row.get(1)?;
    let name: String = row.get(2)?;
    let correlation_id: String = row.get(3)?;
    let created_at: String = row.get(5)?;
    Ok(serde_json::from_str(&payload)
        .context("Failed to parse flow event payload")
        .map(|payload| FlowEvent {
            id,
            run_id,
            name,
            correlation_id,
            payload,
            created_at,
        }))
}

// ── Tests ─────────────────────────────────────────────────────────────
