//! Master phase orchestrator.
//!
//! Drives one feature run through `analysis → approaches → judging →
//! implementation → pr → completed`. Each phase opens a `running` phase
//! result, runs its own agents, and on success is marked `passed` before the
//! run advances and the human checkpoint for that phase fires. Any failure
//! marks the phase result and the run `failed` and stops there. The sandbox
//! is stopped on every exit path.
//!
//! Every side effect is keyed in the run's step journal, so [`Pipeline::resume`]
//! re-executes the same code and replays completed work without repeating it.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use forgeflow_common::gate::first_failure;
use forgeflow_common::{
    AnalysisOutput, Approach, ApproachesOutput, ChoiceOption, CtaOutcome, CtaRequest,
    CtaResponse, FeaturePhase, ImplementationOutput, JudgingOutput, MemoryKind, MemoryRecord,
    OverallVerdict, PhaseOutput, PrOutput,
};
use tracing::Instrument;

use super::github::{PullRequest, RepoLocator, parse_repo_locator};
use super::models::{FeatureRun, NewFeatureRun, NewSandboxRecord, SandboxStatus};
use super::notify::{Notification, tail};
use super::sandbox::{Sandbox, SandboxSpec};
use crate::context::{PhaseScope, RunContext};
use crate::cta::{self, CtaSite};
use crate::durable::StepJournal;
use crate::errors::{OrchestratorError, PhaseError};
use crate::implement::{ImplementationInput, run_implementation};
use crate::phases::{run_analysis, run_approaches};
use crate::review::run_judging;

const DETAIL_LIMIT: usize = 2_000;
const CHECKPOINT_PREVIEW: usize = 3_000;

/// Convert a title to a URL-safe slug, limited to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..slug.floor_char_boundary(max_len)]
            .trim_end_matches('-')
            .to_string()
    } else {
        slug
    }
}

/// Branch the run's changes are committed to: `forgeflow/<slug>-<id8>`.
pub fn work_branch_name(prompt: &str, run_id: &str) -> String {
    let short: String = run_id.chars().filter(|c| *c != '-').take(8).collect();
    let slug = slugify(prompt, 40);
    if slug.is_empty() {
        format!("forgeflow/{}", short)
    } else {
        format!("forgeflow/{}-{}", slug, short)
    }
}

/// A new run to launch.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub prompt: String,
    /// `owner/repo` or a GitHub URL.
    pub repo: String,
    pub base_branch: String,
    /// Caller-chosen id; a fresh uuid when absent.
    pub run_id: Option<String>,
}

/// Where a run ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub phase: FeaturePhase,
    pub pr_url: Option<String>,
    pub error: Option<String>,
}

impl RunSummary {
    fn from_run(run: &FeatureRun) -> Self {
        Self {
            run_id: run.id.clone(),
            phase: run.current_phase,
            pr_url: run.pr_url.clone(),
            error: run.error.clone(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.phase == FeaturePhase::Completed
    }
}

/// Why a run stopped early.
struct RunFailure {
    phase: FeaturePhase,
    /// Set when a phase result is still `running` and must be failed.
    phase_result_id: Option<String>,
    output: Option<PhaseOutput>,
    /// Operator-facing detail; the error chain when absent.
    detail: Option<String>,
    error: anyhow::Error,
}

impl RunFailure {
    fn new(phase: FeaturePhase, error: impl Into<anyhow::Error>) -> Self {
        Self {
            phase,
            phase_result_id: None,
            output: None,
            detail: None,
            error: error.into(),
        }
    }

    fn in_result(mut self, phase_result_id: &str) -> Self {
        self.phase_result_id = Some(phase_result_id.to_string());
        self
    }
}

/// Runs feature pipelines against a [`RunContext`].
pub struct Pipeline {
    ctx: RunContext,
}

impl Pipeline {
    pub fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }

    /// Create the run and drive it to a terminal phase.
    pub async fn start_run(&self, request: LaunchRequest) -> Result<RunSummary> {
        if parse_repo_locator(&request.repo).is_none() {
            return Err(OrchestratorError::InvalidRepo(request.repo).into());
        }
        let run_id = request
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let new = NewFeatureRun {
            id: run_id.clone(),
            prompt: request.prompt.clone(),
            repo: request.repo.clone(),
            base_branch: request.base_branch.clone(),
        };
        let run = self.ctx.db.call(move |db| db.create_feature_run(&new)).await?;
        if run.current_phase.is_terminal() {
            return Err(OrchestratorError::RunFinished {
                id: run.id,
                phase: run.current_phase,
            }
            .into());
        }
        tracing::info!(run_id = %run.id, repo = %run.repo, "feature run created");
        self.drive(run).await
    }

    /// Continue a suspended or crashed run from its journal.
    pub async fn resume(&self, run_id: &str) -> Result<RunSummary> {
        let id = run_id.to_string();
        let run = self
            .ctx
            .db
            .call(move |db| db.get_feature_run(&id))
            .await?
            .ok_or_else(|| OrchestratorError::RunNotFound {
                id: run_id.to_string(),
            })?;
        if run.current_phase.is_terminal() {
            return Err(OrchestratorError::RunFinished {
                id: run.id,
                phase: run.current_phase,
            }
            .into());
        }
        tracing::info!(run_id = %run.id, phase = %run.current_phase, "resuming feature run");
        self.drive(run).await
    }

    async fn drive(&self, run: FeatureRun) -> Result<RunSummary> {
        let span = tracing::info_span!("run", run_id = %run.id);
        async {
            let journal = self.ctx.journal(&run.id);
            journal
                .run("run-started", || async {
                    self.ctx
                        .notify(Notification::RunStarted {
                            run_id: run.id.clone(),
                            prompt: run.prompt.clone(),
                            repo: run.repo.clone(),
                        })
                        .await;
                    Ok(())
                })
                .await?;

            let (sandbox_id, sandbox) = match self.provision(&run, &journal).await {
                Ok(provisioned) => provisioned,
                Err(failure) => {
                    self.fail_run(&run.id, failure).await?;
                    return self.summary(&run.id).await;
                }
            };

            let outcome = self.run_phases(&run, &journal, &sandbox).await;
            self.stop_sandbox(&sandbox_id, sandbox.as_ref()).await;

            match outcome {
                Ok(pr_url) => {
                    tracing::info!(%pr_url, "feature run completed");
                    self.ctx
                        .notify(Notification::RunCompleted {
                            run_id: run.id.clone(),
                            pr_url,
                        })
                        .await;
                }
                Err(failure) => self.fail_run(&run.id, failure).await?,
            }
            self.summary(&run.id).await
        }
        .instrument(span)
        .await
    }

    async fn summary(&self, run_id: &str) -> Result<RunSummary> {
        let id = run_id.to_string();
        let run = self
            .ctx
            .db
            .call(move |db| db.get_feature_run(&id))
            .await?
            .ok_or_else(|| OrchestratorError::RunNotFound {
                id: run_id.to_string(),
            })?;
        Ok(RunSummary::from_run(&run))
    }

    // ── Sandbox lifecycle ─────────────────────────────────────────────

    async fn provision(
        &self,
        run: &FeatureRun,
        journal: &StepJournal,
    ) -> Result<(String, Arc<dyn Sandbox>), RunFailure> {
        let fail = |e: anyhow::Error| RunFailure::new(FeaturePhase::Analysis, e);
        let repo: RepoLocator = parse_repo_locator(&run.repo)
            .ok_or_else(|| fail(OrchestratorError::InvalidRepo(run.repo.clone()).into()))?;

        let sandbox_id: String = journal
            .run("sandbox-id", || async { Ok(uuid::Uuid::new_v4().to_string()) })
            .await
            .map_err(fail)?;
        let work_branch = work_branch_name(&run.prompt, &run.id);
        let config = self.ctx.config.sandbox.to_sandbox_config();

        let record = NewSandboxRecord {
            id: sandbox_id.clone(),
            run_id: run.id.clone(),
            memory: config.memory.clone(),
            cpus: config.cpus,
            timeout_secs: config.timeout,
            workdir: Some(
                self.ctx
                    .config
                    .sandbox
                    .root
                    .join(&sandbox_id)
                    .to_string_lossy()
                    .to_string(),
            ),
        };
        let (run_id, sid, branch) = (run.id.clone(), sandbox_id.clone(), work_branch.clone());
        self.ctx
            .db
            .call(move |db| {
                db.create_sandbox_record(&record)?;
                db.set_feature_run_sandbox(&run_id, &sid, &branch)?;
                Ok(())
            })
            .await
            .map_err(fail)?;

        let spec = SandboxSpec {
            id: sandbox_id.clone(),
            repo,
            base_branch: run.base_branch.clone(),
            work_branch,
            config,
        };
        match self.ctx.sandboxes.create(&spec).await {
            Ok(sandbox) => {
                self.set_sandbox_status(&sandbox_id, SandboxStatus::Running).await;
                tracing::info!(%sandbox_id, branch = %spec.work_branch, "sandbox ready");
                Ok((sandbox_id, sandbox))
            }
            Err(e) => {
                self.set_sandbox_status(&sandbox_id, SandboxStatus::Failed).await;
                Err(fail(
                    OrchestratorError::SandboxProvision {
                        sandbox_id,
                        message: format!("{:#}", e),
                    }
                    .into(),
                ))
            }
        }
    }

    async fn stop_sandbox(&self, sandbox_id: &str, sandbox: &dyn Sandbox) {
        match sandbox.stop().await {
            Ok(()) => self.set_sandbox_status(sandbox_id, SandboxStatus::Stopped).await,
            Err(e) => {
                tracing::warn!(%sandbox_id, "Failed to stop sandbox: {:#}", e);
                self.set_sandbox_status(sandbox_id, SandboxStatus::Failed).await;
            }
        }
    }

    async fn set_sandbox_status(&self, sandbox_id: &str, status: SandboxStatus) {
        let id = sandbox_id.to_string();
        if let Err(e) = self
            .ctx
            .db
            .call(move |db| db.update_sandbox_status(&id, status))
            .await
        {
            tracing::warn!(%sandbox_id, "Failed to record sandbox status {}: {:#}", status.as_str(), e);
        }
    }

    // ── Phases ────────────────────────────────────────────────────────

    async fn run_phases(
        &self,
        run: &FeatureRun,
        journal: &StepJournal,
        sandbox: &Arc<dyn Sandbox>,
    ) -> Result<String, RunFailure> {
        let analysis: AnalysisOutput = self
            .run_phase(run, journal, sandbox, FeaturePhase::Analysis, |scope| async move {
                run_analysis(&scope).await
            })
            .await?;
        self.approve(
            run,
            journal,
            FeaturePhase::Analysis,
            format!(
                "Analysis finished for \"{}\". Approve the codebase map to continue.\n\n{}",
                run.prompt,
                tail(&analysis.codebase_map, CHECKPOINT_PREVIEW)
            ),
        )
        .await?;

        let map = analysis.codebase_map.clone();
        let approaches: ApproachesOutput = self
            .run_phase(run, journal, sandbox, FeaturePhase::Approaches, |scope| async move {
                run_approaches(&scope, &map).await
            })
            .await?;
        let approach = self.select_approach(run, journal, &approaches).await?;

        let (map, chosen) = (analysis.codebase_map.clone(), approach.clone());
        let judging: JudgingOutput = self
            .run_phase(run, journal, sandbox, FeaturePhase::Judging, |scope| async move {
                run_judging(&scope, &chosen, &map).await
            })
            .await?;
        self.approve(run, journal, FeaturePhase::Judging, judging_message(&approach, &judging))
            .await?;

        let input = ImplementationInput {
            codebase_map: analysis.codebase_map.clone(),
            approach: approach.clone(),
            conditions: judging.synthesis.conditions.clone(),
            base_branch: run.base_branch.clone(),
        };
        let implementation: ImplementationOutput = self
            .run_phase(run, journal, sandbox, FeaturePhase::Implementation, |scope| async move {
                run_implementation(&scope, &input).await
            })
            .await?;
        self.approve(
            run,
            journal,
            FeaturePhase::Implementation,
            implementation_message(&implementation),
        )
        .await?;

        let pr: PrOutput = self
            .run_phase(run, journal, sandbox, FeaturePhase::Pr, |scope| {
                let body = pr_body(run, &approach, &judging, &implementation);
                async move { open_pull_request(&scope, &body).await }
            })
            .await?;

        let (run_id, url) = (run.id.clone(), pr.url.clone());
        self.ctx
            .db
            .call(move |db| db.complete_feature_run(&run_id, &url))
            .await
            .map_err(|e| RunFailure::new(FeaturePhase::Pr, e))?;
        Ok(pr.url)
    }

    /// Open a phase result, run `body`, and mark the result passed. The run
    /// advances to the next phase only after the result is persisted.
    async fn run_phase<T, F, Fut>(
        &self,
        run: &FeatureRun,
        journal: &StepJournal,
        sandbox: &Arc<dyn Sandbox>,
        phase: FeaturePhase,
        body: F,
    ) -> Result<T, RunFailure>
    where
        T: Clone + Into<PhaseOutput>,
        F: FnOnce(PhaseScope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let phase_journal = journal.scope(phase.as_str());
        let fail = |e: anyhow::Error| RunFailure::new(phase, e);

        let phase_result_id: String = phase_journal
            .run("result-id", || async { Ok(uuid::Uuid::new_v4().to_string()) })
            .await
            .map_err(fail)?;
        let (id, run_id) = (phase_result_id.clone(), run.id.clone());
        let memories = self
            .ctx
            .db
            .call(move |db| {
                db.create_phase_result(&id, &run_id, phase)?;
                db.get_memories(&run_id)
            })
            .await
            .map_err(fail)?;

        phase_journal
            .run("started", || async {
                tracing::info!(%phase, "phase started");
                self.ctx
                    .notify(Notification::PhaseStarted {
                        run_id: run.id.clone(),
                        phase,
                    })
                    .await;
                Ok(())
            })
            .await
            .map_err(fail)?;

        let scope = PhaseScope {
            ctx: self.ctx.clone(),
            run_id: run.id.clone(),
            prompt: run.prompt.clone(),
            phase,
            phase_result_id: phase_result_id.clone(),
            sandbox: sandbox.clone(),
            journal: phase_journal.clone(),
            memories,
        };
        let value = body(scope)
            .await
            .map_err(|e| fail(e).in_result(&phase_result_id))?;
        let output: PhaseOutput = value.clone().into();

        if let Some((error, detail)) = rejection(&output) {
            return Err(RunFailure {
                phase,
                phase_result_id: Some(phase_result_id),
                output: Some(output),
                detail: Some(detail),
                error,
            });
        }

        let (id, run_id) = (phase_result_id.clone(), run.id.clone());
        let stored = output.clone();
        let next = phase.next();
        self.ctx
            .db
            .call(move |db| {
                db.pass_phase_result(&id, &stored)?;
                match next {
                    Some(to) if to != FeaturePhase::Completed => {
                        db.advance_feature_run_phase(&run_id, to)?;
                    }
                    _ => {}
                }
                Ok(())
            })
            .await
            .map_err(fail)?;

        phase_journal
            .run("passed", || async {
                tracing::info!(%phase, "phase passed");
                self.ctx
                    .notify(Notification::PhasePassed {
                        run_id: run.id.clone(),
                        phase,
                    })
                    .await;
                Ok(())
            })
            .await
            .map_err(fail)?;
        Ok(value)
    }

    // ── Human checkpoints ─────────────────────────────────────────────

    async fn checkpoint(
        &self,
        run: &FeatureRun,
        journal: &StepJournal,
        phase: FeaturePhase,
        request: CtaRequest,
    ) -> Result<CtaResponse, RunFailure> {
        let fail = |e: anyhow::Error| RunFailure::new(phase, e);
        let phase_journal = journal.scope(phase.as_str());
        let phase_result_id: String = phase_journal
            .run("result-id", || async { Ok(uuid::Uuid::new_v4().to_string()) })
            .await
            .map_err(fail)?;
        let site = CtaSite {
            run_id: run.id.clone(),
            phase_result_id,
            invocation_id: None,
            tool_call_id: None,
        };

        let outcome = cta::request_human_feedback(
            &self.ctx,
            &phase_journal.scope("checkpoint"),
            &site,
            request,
        )
        .await
        .map_err(fail)?;

        match outcome {
            CtaOutcome::TimedOut => Err(fail(PhaseError::CtaTimedOut { phase }.into())),
            CtaOutcome::Responded {
                response: CtaResponse::Approval {
                    approved: false,
                    reason,
                },
            } => Err(fail(
                PhaseError::Declined {
                    phase,
                    reason: reason.unwrap_or_else(|| "no reason given".to_string()),
                }
                .into(),
            )),
            CtaOutcome::Responded { response } => Ok(response),
        }
    }

    async fn approve(
        &self,
        run: &FeatureRun,
        journal: &StepJournal,
        phase: FeaturePhase,
        message: String,
    ) -> Result<(), RunFailure> {
        self.checkpoint(run, journal, phase, CtaRequest::Approval { message })
            .await
            .map(|_| ())
    }

    /// Ask the human to pick an approach and record the pick as a decision
    /// memory. A single approach is confirmed with an approval instead.
    async fn select_approach(
        &self,
        run: &FeatureRun,
        journal: &StepJournal,
        approaches: &ApproachesOutput,
    ) -> Result<Approach, RunFailure> {
        let phase = FeaturePhase::Approaches;
        let fail = |e: anyhow::Error| RunFailure::new(phase, e);

        let selected = match approaches.approaches.as_slice() {
            [only] => {
                self.approve(
                    run,
                    journal,
                    phase,
                    format!("Proceed with approach {}: {}?\n\n{}", only.id, only.title, only.summary),
                )
                .await?;
                only.clone()
            }
            all => {
                let request = CtaRequest::Choice {
                    prompt: format!("Select an approach for \"{}\"", run.prompt),
                    options: all
                        .iter()
                        .map(|a| ChoiceOption::new(a.id.clone(), format!("{}: {}", a.id, a.title)))
                        .collect(),
                };
                let response = self.checkpoint(run, journal, phase, request).await?;
                let selected_id = match response {
                    CtaResponse::Choice { selected_id } => selected_id,
                    other => {
                        return Err(fail(anyhow::anyhow!(
                            "choice checkpoint returned {:?}",
                            other
                        )));
                    }
                };
                approaches
                    .find(&selected_id)
                    .cloned()
                    .with_context(|| format!("Selected approach {} not found", selected_id))
                    .map_err(fail)?
            }
        };

        let record = MemoryRecord::new(
            phase,
            MemoryKind::Decision,
            format!("Selected approach {}: {}", selected.id, selected.title),
        );
        journal
            .scope(phase.as_str())
            .run("selection-memory", || async {
                let (run_id, rec) = (run.id.clone(), record.clone());
                self.ctx
                    .db
                    .call(move |db| db.update_feature_run_memories(&run_id, &[rec]))
                    .await
            })
            .await
            .map_err(fail)?;
        tracing::info!(approach = %selected.id, "approach selected");
        Ok(selected)
    }

    // ── Failure ───────────────────────────────────────────────────────

    async fn fail_run(&self, run_id: &str, failure: RunFailure) -> Result<()> {
        let reason = format!("{:#}", failure.error);
        let detail = tail(failure.detail.as_deref().unwrap_or(&reason), DETAIL_LIMIT);
        tracing::error!(phase = %failure.phase, "phase failed: {}", reason);

        let (id, error) = (run_id.to_string(), reason.clone());
        let (result_id, output) = (failure.phase_result_id.clone(), failure.output.clone());
        self.ctx
            .db
            .call(move |db| {
                if let Some(result_id) = &result_id {
                    db.fail_phase_result(result_id, &error, output.as_ref())?;
                }
                db.fail_feature_run(&id, &error)?;
                Ok(())
            })
            .await?;

        self.ctx
            .notify(Notification::PhaseFailed {
                run_id: run_id.to_string(),
                phase: failure.phase,
                detail,
            })
            .await;
        self.ctx
            .notify(Notification::RunFailed {
                run_id: run_id.to_string(),
                reason,
            })
            .await;
        Ok(())
    }
}

/// Outputs that complete normally but must stop the run.
fn rejection(output: &PhaseOutput) -> Option<(anyhow::Error, String)> {
    match output {
        PhaseOutput::Judging(judging) if judging.synthesis.verdict == OverallVerdict::Rejected => {
            let reason = judging
                .synthesis
                .rejection_reason
                .clone()
                .unwrap_or_else(|| "rejected".to_string());
            let error = PhaseError::Rejected {
                approach_id: judging.approach_id.clone(),
                reason: reason.clone(),
            };
            Some((error.into(), reason))
        }
        PhaseOutput::Implementation(implementation) if !implementation.passed => {
            let error = PhaseError::RetriesExhausted {
                attempts: implementation.total_coder_attempts,
            };
            let detail = implementation
                .attempts
                .last()
                .and_then(|a| first_failure(&a.gates))
                .map(|g| format!("{} gate failed (exit {}):\n{}", g.gate, g.exit_code, g.output))
                .unwrap_or_else(|| error.to_string());
            Some((error.into(), detail))
        }
        _ => None,
    }
}

fn judging_message(approach: &Approach, judging: &JudgingOutput) -> String {
    let mut message = format!(
        "Judging verdict for approach {} ({}): {}",
        approach.id, approach.title, judging.synthesis.verdict
    );
    for verdict in &judging.verdicts {
        message.push_str(&format!("\n- {}: {}", verdict.criterion.agent_name(), verdict.verdict));
    }
    if !judging.synthesis.conditions.is_empty() {
        message.push_str("\n\nConditions:");
        for condition in &judging.synthesis.conditions {
            message.push_str(&format!("\n- {}", condition));
        }
    }
    message.push_str("\n\nApprove to start implementation.");
    message
}

fn implementation_message(implementation: &ImplementationOutput) -> String {
    let files = implementation.diff.as_ref().map(|d| d.total()).unwrap_or(0);
    format!(
        "Implementation passed all gates on attempt {} ({} files changed). \
         Approve to open a pull request.",
        implementation.total_coder_attempts, files
    )
}

fn pr_title(prompt: &str) -> String {
    let first_line = prompt.lines().next().unwrap_or_default().trim();
    let mut title: String = first_line.chars().take(72).collect();
    if first_line.chars().count() > 72 {
        title.push_str("...");
    }
    title
}

fn pr_body(
    run: &FeatureRun,
    approach: &Approach,
    judging: &JudgingOutput,
    implementation: &ImplementationOutput,
) -> String {
    let mut body = format!(
        "## Summary\n\nAutomated implementation for: **{}**\n\n## Approach {}: {}\n\n{}\n",
        run.prompt, approach.id, approach.title, approach.summary
    );

    body.push_str(&format!("\n## Review\n\nVerdict: `{}`\n", judging.synthesis.verdict));
    for condition in &implementation.conditions_addressed {
        body.push_str(&format!("- [x] {}\n", condition));
    }

    body.push_str(&format!(
        "\n## Quality gates\n\nPassed on attempt {}.\n",
        implementation.total_coder_attempts
    ));
    for attempt in &implementation.attempts {
        let gates: Vec<String> = attempt
            .gates
            .iter()
            .map(|g| format!("{} {}", g.gate, if g.passed() { "passed" } else { "failed" }))
            .collect();
        body.push_str(&format!("- attempt {}: {}\n", attempt.attempt, gates.join(", ")));
    }

    if let Some(diff) = &implementation.diff {
        body.push_str("\n## Files\n\n");
        for path in &diff.added {
            body.push_str(&format!("- added `{}`\n", path));
        }
        for path in &diff.modified {
            body.push_str(&format!("- modified `{}`\n", path));
        }
        for path in &diff.deleted {
            body.push_str(&format!("- deleted `{}`\n", path));
        }
    }

    body.push_str("\n---\n*Created by forgeflow*");
    body
}

/// Commit the sandbox's work, push the branch, and open the pull request.
async fn open_pull_request(scope: &PhaseScope, body: &str) -> Result<PrOutput> {
    let ctx = &scope.ctx;
    let run_id = scope.run_id.clone();
    let run = ctx
        .db
        .call(move |db| db.get_feature_run(&run_id))
        .await?
        .ok_or_else(|| OrchestratorError::RunNotFound {
            id: scope.run_id.clone(),
        })?;
    let repo = parse_repo_locator(&run.repo)
        .ok_or_else(|| OrchestratorError::InvalidRepo(run.repo.clone()))?;
    let Some(branch) = run.work_branch.clone() else {
        bail!("Run {} has no work branch", run.id);
    };
    let title = pr_title(&run.prompt);

    scope
        .journal
        .run("push", || async {
            let steps: [Vec<&str>; 3] = [
                vec!["add", "-A"],
                vec!["commit", "-m", title.as_str()],
                vec!["push", "-u", "origin", branch.as_str()],
            ];
            for args in steps {
                let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                let out = scope.sandbox.run_command("git", &args).await?;
                if !out.success() {
                    bail!("git {} failed: {}", args.join(" "), out.combined().trim());
                }
            }
            Ok(())
        })
        .await?;

    let pr: PullRequest = scope
        .journal
        .run("pull-request", || async {
            ctx.pr_creator
                .create_pull_request(&repo, &branch, &run.base_branch, &title, body)
                .await
        })
        .await?;
    tracing::info!(url = %pr.url, number = pr.number, "pull request opened");

    Ok(PrOutput {
        url: pr.url,
        number: pr.number,
        branch,
        base: run.base_branch,
    })
}
