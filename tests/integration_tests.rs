//! Integration tests for forgeflow
//!
//! The CLI is exercised through the built binary; the end-to-end pipeline
//! scenarios run through the library API with scripted collaborators.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

use forgeflow::factory::notify::Notification;
use forgeflow::factory::pipeline::{LaunchRequest, Pipeline};
use forgeflow::test_support::{
    AutoResponder, FakeSandbox, ResponderPolicy, ScriptedModel, TestHarness, judge_reply,
    test_config, test_context,
};
use forgeflow_common::{
    FeaturePhase, Gate, OverallVerdict, PhaseOutput, PhaseStatus, gate::first_failure,
};

/// Helper to create a forgeflow Command
fn forgeflow() -> Command {
    cargo_bin_cmd!("forgeflow")
}

fn dark_mode(run_id: &str) -> LaunchRequest {
    LaunchRequest {
        prompt: "Add dark mode toggle".into(),
        repo: "org/app".into(),
        base_branch: "main".into(),
        run_id: Some(run_id.into()),
    }
}

fn phase_statuses(h: &TestHarness, run_id: &str) -> Result<Vec<(FeaturePhase, PhaseStatus)>> {
    Ok(h.ctx
        .db
        .lock_sync()?
        .get_phase_results(run_id)?
        .into_iter()
        .map(|p| (p.phase, p.status))
        .collect())
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_forgeflow_help() {
        forgeflow()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("resume"))
            .stdout(predicate::str::contains("respond"));
    }

    #[test]
    fn test_forgeflow_version() {
        forgeflow()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_status_on_empty_database() {
        let dir = TempDir::new().unwrap();
        forgeflow()
            .current_dir(dir.path())
            .args(["--db-path", "flow.db", "status"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[]"));
        assert!(dir.path().join("flow.db").exists());
    }

    #[test]
    fn test_status_for_unknown_run_fails() {
        let dir = TempDir::new().unwrap();
        forgeflow()
            .current_dir(dir.path())
            .args(["--db-path", "flow.db", "status", "--run-id", "nope"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Feature run nope not found"));
    }

    #[test]
    fn test_respond_requires_exactly_one_answer() {
        let dir = TempDir::new().unwrap();
        forgeflow()
            .current_dir(dir.path())
            .args(["--db-path", "flow.db", "respond", "--cta-id", "c1"])
            .assert()
            .failure();
        forgeflow()
            .current_dir(dir.path())
            .args(["--db-path", "flow.db", "respond", "--cta-id", "c1", "--approve", "--choose", "A"])
            .assert()
            .failure();
    }

    #[test]
    fn test_respond_to_unknown_cta_fails() {
        let dir = TempDir::new().unwrap();
        forgeflow()
            .current_dir(dir.path())
            .args(["--db-path", "flow.db", "respond", "--cta-id", "c1", "--approve"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("CTA c1 not found"));
    }

    #[test]
    fn test_run_without_api_key_fails_fast() {
        let dir = TempDir::new().unwrap();
        forgeflow()
            .current_dir(dir.path())
            .env_remove("ANTHROPIC_API_KEY")
            .args([
                "--db-path",
                "flow.db",
                "run",
                "--prompt",
                "Add dark mode toggle",
                "--repo",
                "org/app",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("ANTHROPIC_API_KEY"));
    }
}

// =============================================================================
// Pipeline Scenarios
// =============================================================================

mod pipeline_scenarios {
    use super::*;

    #[tokio::test]
    async fn test_happy_path_opens_pull_request() -> Result<()> {
        let h = test_context(
            ScriptedModel::new().with_defaults(),
            FakeSandbox::new(),
            ResponderPolicy::Choose("A".into()),
        )?;
        let summary = Pipeline::new(h.ctx.clone()).start_run(dark_mode("run-1")).await?;

        assert_eq!(summary.phase, FeaturePhase::Completed);
        assert_eq!(summary.pr_url.as_deref(), Some("https://github.com/org/app/pull/1"));
        assert!(h.sandbox.is_stopped());
        assert!(
            phase_statuses(&h, "run-1")?
                .iter()
                .all(|(_, status)| *status == PhaseStatus::Passed)
        );

        let db = h.ctx.db.lock_sync()?;
        match db.passed_output("run-1", FeaturePhase::Judging)? {
            Some(PhaseOutput::Judging(judging)) => {
                assert_eq!(judging.approach_id, "A");
                assert_eq!(judging.verdicts.len(), 5);
                assert_eq!(judging.synthesis.verdict, OverallVerdict::Approved);
            }
            other => panic!("unexpected judging output: {:?}", other),
        }
        match db.passed_output("run-1", FeaturePhase::Implementation)? {
            Some(PhaseOutput::Implementation(implementation)) => {
                assert_eq!(implementation.total_coder_attempts, 1);
            }
            other => panic!("unexpected implementation output: {:?}", other),
        }

        // Analysis approval, approach choice, judging approval, implementation approval.
        let events = db.list_cta_events("run-1")?;
        assert_eq!(events.len(), 4);
        assert_eq!(events[1].response_selected_id(), Some("A"));
        Ok(())
    }

    #[tokio::test]
    async fn test_bug_hunter_rejection_fails_the_run() -> Result<()> {
        let failing = judge_reply(
            "fail",
            r#"{"severity": "critical", "description": "toggle state lost on reload", "recommendation": "persist it"}"#,
        );
        let model = ScriptedModel::new()
            .on("bug-hunter", vec![failing])
            .with_defaults();
        let h = test_context(model, FakeSandbox::new(), ResponderPolicy::Approve)?;
        let summary = Pipeline::new(h.ctx.clone()).start_run(dark_mode("run-1")).await?;

        assert_eq!(summary.phase, FeaturePhase::Failed);
        assert!(summary.error.unwrap_or_default().contains("bug-hunter"));
        assert!(h.sandbox.is_stopped());
        assert_eq!(h.model.requests_matching("implementation coder"), 0);
        assert_eq!(
            phase_statuses(&h, "run-1")?.last(),
            Some(&(FeaturePhase::Judging, PhaseStatus::Failed))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_unanswered_analysis_approval_times_out() -> Result<()> {
        let h = test_context(
            ScriptedModel::new().with_defaults(),
            FakeSandbox::new(),
            ResponderPolicy::Silent,
        )?;
        let summary = Pipeline::new(h.ctx.clone()).start_run(dark_mode("run-1")).await?;

        assert_eq!(summary.phase, FeaturePhase::Failed);
        assert!(summary.error.unwrap_or_default().contains("No human response after analysis"));
        assert!(h.sandbox.is_stopped());
        assert_eq!(h.model.requests_matching("approaches architect"), 0);

        let events = h.ctx.db.lock_sync()?.list_cta_events("run-1")?;
        assert_eq!(events.len(), 1);
        assert!(events[0].timed_out);
        assert!(events[0].response.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_implementation_passes_on_third_attempt() -> Result<()> {
        let sandbox = FakeSandbox::new()
            .with_exit_codes("npm run typecheck", &[1, 0])
            .with_output("npm run typecheck", "error TS2304: Cannot find name 'theme'")
            .with_exit_codes("npm run lint", &[1, 0]);
        let h = test_context(
            ScriptedModel::new().with_defaults(),
            sandbox,
            ResponderPolicy::Approve,
        )?;
        let summary = Pipeline::new(h.ctx.clone()).start_run(dark_mode("run-1")).await?;
        assert_eq!(summary.phase, FeaturePhase::Completed);

        let output = h
            .ctx
            .db
            .lock_sync()?
            .passed_output("run-1", FeaturePhase::Implementation)?;
        let Some(PhaseOutput::Implementation(implementation)) = output else {
            panic!("missing implementation output");
        };
        assert_eq!(implementation.total_coder_attempts, 3);
        let failing: Vec<Option<Gate>> = implementation
            .attempts
            .iter()
            .map(|a| first_failure(&a.gates).map(|g| g.gate))
            .collect();
        assert_eq!(failing, vec![Some(Gate::Typecheck), Some(Gate::Lint), None]);

        // The second coder prompt carries the first attempt's failure.
        let coder_requests: Vec<String> = h
            .model
            .requests()
            .iter()
            .filter(|r| r.system.contains("implementation coder"))
            .map(|r| serde_json::to_string(&r.messages))
            .collect::<Result<_, _>>()?;
        assert_eq!(coder_requests.len(), 3);
        assert!(coder_requests[1].contains("Cannot find name 'theme'"));
        Ok(())
    }

    #[tokio::test]
    async fn test_implementation_exhausts_attempts() -> Result<()> {
        let sandbox = FakeSandbox::new()
            .with_exit_codes("npm test", &[1])
            .with_output("npm test", "FAIL src/toggle.test.ts");
        let h = test_context(
            ScriptedModel::new().with_defaults(),
            sandbox,
            ResponderPolicy::Approve,
        )?;
        let summary = Pipeline::new(h.ctx.clone()).start_run(dark_mode("run-1")).await?;

        assert_eq!(summary.phase, FeaturePhase::Failed);
        assert!(h.sandbox.is_stopped());
        assert!(h.prs.calls().is_empty());

        let db = h.ctx.db.lock_sync()?;
        let implementation = db
            .get_phase_results("run-1")?
            .into_iter()
            .find(|p| p.phase == FeaturePhase::Implementation)
            .expect("implementation phase result");
        assert_eq!(implementation.status, PhaseStatus::Failed);
        let Some(PhaseOutput::Implementation(output)) = implementation.output else {
            panic!("failed implementation keeps its output");
        };
        assert_eq!(output.total_coder_attempts, 5);
        assert!(output.conditions_addressed.is_empty());
        assert!(
            output
                .attempts
                .iter()
                .all(|a| a.gates.iter().any(|g| g.output.contains("FAIL src/toggle.test.ts")))
        );
        drop(db);

        let detail = h.responder.notifications().into_iter().find_map(|n| match n {
            Notification::PhaseFailed { phase, detail, .. } if phase == FeaturePhase::Implementation => {
                Some(detail)
            }
            _ => None,
        });
        assert!(detail.unwrap_or_default().contains("FAIL src/toggle.test.ts"));
        Ok(())
    }

    #[tokio::test]
    async fn test_interrupted_run_resumes_from_journal() -> Result<()> {
        let h = test_context(
            ScriptedModel::new().with_defaults(),
            FakeSandbox::new(),
            ResponderPolicy::Silent,
        )?;
        let mut config = test_config();
        config.cta.timeout_secs = 600;
        let mut ctx = h.ctx.clone();
        ctx.config = Arc::new(config);

        // Run until the analysis approval is pending, then drop the process.
        let first = ctx.clone();
        let task = tokio::spawn(async move { Pipeline::new(first).start_run(dark_mode("run-1")).await });
        let mut pending = None;
        for _ in 0..500 {
            let events = h.ctx.db.lock_sync()?.list_cta_events("run-1")?;
            if let Some(event) = events.into_iter().next() {
                pending = Some(event);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();
        let pending = pending.expect("analysis approval requested");

        // The human answers while nothing is running.
        forgeflow::cta::respond(
            &ctx.db,
            &ctx.bus,
            &pending.id,
            serde_json::json!({"kind": "approval", "approved": true}),
        )
        .await?;

        ctx.notifier = Arc::new(AutoResponder::new(ctx.bus.clone(), ResponderPolicy::Approve));
        let summary = Pipeline::new(ctx).resume("run-1").await?;

        assert_eq!(summary.phase, FeaturePhase::Completed);
        assert_eq!(h.model.requests_matching("analysis orchestrator"), 1);
        assert_eq!(h.sandboxes.specs().len(), 2);
        assert_eq!(h.prs.calls().len(), 1);
        Ok(())
    }
}
