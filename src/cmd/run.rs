//! Pipeline commands: `forgeflow run` and `forgeflow resume`.

use std::sync::Arc;

use anyhow::{Result, bail};
use forgeflow::agent::AnthropicClient;
use forgeflow::config::ForgeflowConfig;
use forgeflow::context::RunContext;
use forgeflow::durable::EventBus;
use forgeflow::factory::github::GitHubClient;
use forgeflow::factory::notify::LogNotifier;
use forgeflow::factory::pipeline::{LaunchRequest, Pipeline, RunSummary};
use forgeflow::factory::sandbox::LocalSandboxProvider;

use super::open_db;

/// Wire the live collaborators. Fails early when a required credential is
/// missing.
fn build_context(config: ForgeflowConfig) -> Result<RunContext> {
    let db = open_db(&config)?;
    let bus = EventBus::new(db.clone());
    let model = AnthropicClient::from_env(&config.models.api_base)?;
    let pr_creator = GitHubClient::from_env(&config.github.api_base)?;
    let sandboxes =
        LocalSandboxProvider::new(config.sandbox.root.clone(), &config.github.remote_base);

    Ok(RunContext {
        db,
        bus,
        model: Arc::new(model),
        sandboxes: Arc::new(sandboxes),
        notifier: Arc::new(LogNotifier),
        pr_creator: Arc::new(pr_creator),
        config: Arc::new(config),
    })
}

fn report(summary: &RunSummary) -> Result<()> {
    if summary.succeeded() {
        println!(
            "Run {} completed: {}",
            summary.run_id,
            summary.pr_url.as_deref().unwrap_or("(no PR URL)")
        );
        return Ok(());
    }
    bail!(
        "Run {} ended in {}: {}",
        summary.run_id,
        summary.phase,
        summary.error.as_deref().unwrap_or("unknown error")
    )
}

pub async fn cmd_run(
    config: ForgeflowConfig,
    prompt: &str,
    repo: &str,
    branch: &str,
    run_id: Option<String>,
) -> Result<()> {
    let ctx = build_context(config)?;
    let request = LaunchRequest {
        prompt: prompt.to_string(),
        repo: repo.to_string(),
        base_branch: branch.to_string(),
        run_id,
    };
    let summary = Pipeline::new(ctx).start_run(request).await?;
    report(&summary)
}

pub async fn cmd_resume(config: ForgeflowConfig, run_id: &str) -> Result<()> {
    let ctx = build_context(config)?;
    let summary = Pipeline::new(ctx).resume(run_id).await?;
    report(&summary)
}
