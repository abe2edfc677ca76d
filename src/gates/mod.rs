//! Quality gates.
//!
//! Four gates run in a fixed order, cheapest signal first:
//! typecheck, lint, test, build. [`run_all_gates`] stops at the first
//! failure. A failing gate is an ordinary [`GateResult`]; only a failure to
//! dispatch the command is an error.

use anyhow::{Context, Result, bail};
use forgeflow_common::{Gate, GateResult, GateStatus};

use crate::config::GatesSection;
use crate::factory::sandbox::Sandbox;

/// Keep the last `limit` characters of `output`.
pub fn tail_truncate(output: &str, limit: usize) -> String {
    let count = output.chars().count();
    if count <= limit {
        return output.to_string();
    }
    output.chars().skip(count - limit).collect()
}

/// The argv configured for `gate`.
pub fn gate_command(config: &GatesSection, gate: Gate) -> &[String] {
    match gate {
        Gate::Typecheck => &config.typecheck,
        Gate::Lint => &config.lint,
        Gate::Test => &config.test,
        Gate::Build => &config.build,
    }
}

pub async fn run_gate(
    sandbox: &dyn Sandbox,
    config: &GatesSection,
    gate: Gate,
    attempt: u32,
) -> Result<GateResult> {
    let Some((cmd, args)) = gate_command(config, gate).split_first() else {
        bail!("No command configured for gate {}", gate);
    };
    let out = sandbox
        .run_command(cmd, args)
        .await
        .with_context(|| format!("Failed to dispatch {} gate", gate))?;

    let status = GateStatus::from_exit_code(out.exit_code);
    tracing::info!(%gate, attempt, exit_code = out.exit_code, "gate {:?}", status);
    Ok(GateResult {
        gate,
        status,
        output: tail_truncate(&out.combined(), config.output_limit),
        attempt,
        exit_code: out.exit_code,
    })
}

/// Run every gate in order, stopping after the first failure. The returned
/// list ends with the failing gate when there is one.
pub async fn run_all_gates(
    sandbox: &dyn Sandbox,
    config: &GatesSection,
    attempt: u32,
) -> Result<Vec<GateResult>> {
    let mut results = Vec::with_capacity(Gate::ORDER.len());
    for gate in Gate::ORDER {
        let result = run_gate(sandbox, config, gate, attempt).await?;
        let failed = !result.passed();
        results.push(result);
        if failed {
            break;
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeSandbox;
    use forgeflow_common::gate::all_passed;

    #[test]
    fn test_tail_truncate_keeps_the_end() {
        assert_eq!(tail_truncate("abc", 8000), "abc");
        let long = format!("{}END", "x".repeat(9000));
        let cut = tail_truncate(&long, 8000);
        assert_eq!(cut.chars().count(), 8000);
        assert!(cut.ends_with("END"));
    }

    #[tokio::test]
    async fn test_all_gates_pass() -> Result<()> {
        let sb = FakeSandbox::new();
        let results = run_all_gates(&sb, &GatesSection::default(), 1).await?;
        assert_eq!(results.len(), 4);
        assert!(all_passed(&results));
        let gates: Vec<Gate> = results.iter().map(|r| r.gate).collect();
        assert_eq!(gates, Gate::ORDER.to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn test_typecheck_failure_short_circuits() -> Result<()> {
        let sb = FakeSandbox::new().with_exit_codes("npm run typecheck", &[2]);
        let results = run_all_gates(&sb, &GatesSection::default(), 1).await?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].gate, Gate::Typecheck);
        assert_eq!(results[0].status, GateStatus::Failed);
        assert_eq!(results[0].exit_code, 2);

        let commands = sb.commands();
        assert_eq!(commands, vec!["npm run typecheck"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_in_the_middle_keeps_prior_results() -> Result<()> {
        let sb = FakeSandbox::new().with_exit_codes("npm test", &[1]);
        let results = run_all_gates(&sb, &GatesSection::default(), 3).await?;
        let statuses: Vec<(Gate, GateStatus)> = results.iter().map(|r| (r.gate, r.status)).collect();
        assert_eq!(
            statuses,
            vec![
                (Gate::Typecheck, GateStatus::Passed),
                (Gate::Lint, GateStatus::Passed),
                (Gate::Test, GateStatus::Failed),
            ]
        );
        assert!(results.iter().all(|r| r.attempt == 3));
        Ok(())
    }

    #[tokio::test]
    async fn test_output_is_truncated() -> Result<()> {
        let sb = FakeSandbox::new()
            .with_exit_codes("npm run lint", &[1])
            .with_output("npm run lint", &"e".repeat(100));
        let config = GatesSection {
            output_limit: 10,
            ..GatesSection::default()
        };
        let results = run_all_gates(&sb, &config, 1).await?;
        assert_eq!(results[1].output.chars().count(), 10);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_command_is_an_error() {
        let sb = FakeSandbox::new();
        let config = GatesSection {
            typecheck: Vec::new(),
            ..GatesSection::default()
        };
        assert!(run_all_gates(&sb, &config, 1).await.is_err());
    }
}
