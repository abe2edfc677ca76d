use anyhow::{Result, bail};
use forgeflow_common::FileChangeSummary;

use crate::factory::sandbox::Sandbox;

/// Parse `git diff --name-status` output. Renames count as a delete plus an
/// add; copies as an add.
pub fn parse_name_status(output: &str) -> FileChangeSummary {
    let mut summary = FileChangeSummary::default();
    for line in output.lines() {
        let mut fields = line.split('\t');
        let (Some(status), Some(first)) = (fields.next(), fields.next()) else {
            continue;
        };
        let second = fields.next();
        match status.chars().next() {
            Some('A') => summary.added.push(first.to_string()),
            Some('M') | Some('T') => summary.modified.push(first.to_string()),
            Some('D') => summary.deleted.push(first.to_string()),
            Some('R') => {
                summary.deleted.push(first.to_string());
                if let Some(new) = second {
                    summary.added.push(new.to_string());
                }
            }
            Some('C') => {
                if let Some(new) = second {
                    summary.added.push(new.to_string());
                }
            }
            _ => {}
        }
    }
    summary
}

/// File-level changes in the sandbox's working tree against `base`,
/// including untracked files.
pub async fn compute_diff(sandbox: &dyn Sandbox, base: &str) -> Result<FileChangeSummary> {
    let diff = sandbox
        .run_command(
            "git",
            &["diff".to_string(), "--name-status".to_string(), base.to_string()],
        )
        .await?;
    if !diff.success() {
        bail!("git diff against {} failed: {}", base, diff.combined().trim());
    }
    let mut summary = parse_name_status(&diff.stdout);

    let untracked = sandbox
        .run_command(
            "git",
            &[
                "ls-files".to_string(),
                "--others".to_string(),
                "--exclude-standard".to_string(),
            ],
        )
        .await?;
    if untracked.success() {
        for path in untracked.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if !summary.added.iter().any(|a| a == path) {
                summary.added.push(path.to_string());
            }
        }
    }

    summary.added.sort();
    summary.modified.sort();
    summary.deleted.sort();
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeSandbox;

    #[test]
    fn test_parse_name_status() {
        let out = "M\tsrc/app.ts\nA\tsrc/theme.ts\nD\told.css\nR087\ta.ts\tb.ts\nbogus\n";
        let summary = parse_name_status(out);
        assert_eq!(summary.modified, vec!["src/app.ts"]);
        assert_eq!(summary.added, vec!["src/theme.ts", "b.ts"]);
        assert_eq!(summary.deleted, vec!["old.css", "a.ts"]);
    }

    #[tokio::test]
    async fn test_compute_diff_includes_untracked() -> Result<()> {
        let sb = FakeSandbox::new()
            .with_output("git diff --name-status main", "M\tsrc/app.ts\n")
            .with_output(
                "git ls-files --others --exclude-standard",
                "src/toggle.tsx\n",
            );
        let summary = compute_diff(&sb, "main").await?;
        assert_eq!(summary.modified, vec!["src/app.ts"]);
        assert_eq!(summary.added, vec!["src/toggle.tsx"]);
        assert_eq!(summary.total(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_compute_diff_fails_on_git_error() {
        let sb = FakeSandbox::new().with_exit_codes("git diff --name-status main", &[128]);
        assert!(compute_diff(&sb, "main").await.is_err());
    }
}
