use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use std::path::PathBuf;

use forgeflow::config::ForgeflowConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "forgeflow")]
#[command(version, about = "Durable feature pipeline: analysis, approaches, judging, implementation and PR")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to forgeflow.toml. Defaults to .forgeflow/forgeflow.toml when present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database path. Overrides the config file and FORGEFLOW_DB_PATH.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a feature run and drive it to completion
    Run {
        /// Natural-language feature request
        #[arg(long)]
        prompt: String,

        /// Target repository (owner/repo or a GitHub URL)
        #[arg(long)]
        repo: String,

        /// Base branch the pull request targets
        #[arg(long, default_value = "main")]
        branch: String,

        /// Use this run id instead of a generated one
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Continue a suspended or interrupted run
    Resume {
        #[arg(long)]
        run_id: String,
    },
    /// Answer a pending human-feedback request
    #[command(group(
        ArgGroup::new("answer")
            .required(true)
            .args(["approve", "reject", "text", "choose"])
    ))]
    Respond {
        #[arg(long)]
        cta_id: String,

        #[arg(long)]
        approve: bool,

        #[arg(long)]
        reject: bool,

        /// Why the request was rejected
        #[arg(long, requires = "reject")]
        reason: Option<String>,

        /// Free-text answer
        #[arg(long)]
        text: Option<String>,

        /// Option id to select
        #[arg(long)]
        choose: Option<String>,
    },
    /// Print a run report (or every run) as JSON
    Status {
        #[arg(long)]
        run_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = std::env::current_dir().context("Failed to get current directory")?;

    let mut config = ForgeflowConfig::resolve(cli.config.as_deref(), &project_dir)?;
    if let Some(db_path) = &cli.db_path {
        config.storage.db_path = db_path.clone();
    }
    let _log_guard = forgeflow::logging::init(&config.logging, cli.verbose)?;
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    match &cli.command {
        Commands::Run {
            prompt,
            repo,
            branch,
            run_id,
        } => {
            cmd::cmd_run(config, prompt, repo, branch, run_id.clone()).await?;
        }
        Commands::Resume { run_id } => cmd::cmd_resume(config, run_id).await?,
        Commands::Respond {
            cta_id,
            approve,
            reject,
            reason,
            text,
            choose,
        } => {
            let answer = cmd::Answer::from_flags(
                *approve,
                *reject,
                reason.clone(),
                text.clone(),
                choose.clone(),
            )?;
            cmd::cmd_respond(&config, cta_id, answer).await?;
        }
        Commands::Status { run_id } => cmd::cmd_status(&config, run_id.as_deref())?,
    }

    Ok(())
}
