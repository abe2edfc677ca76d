//! Sandboxed execution environment.
//!
//! A sandbox is one working copy of the target repository that serves a
//! single feature run for its whole lifetime. Agents reach it only through
//! the [`Sandbox`] trait; [`LocalSandboxProvider`] backs it with a directory
//! per sandbox id so a resumed run re-attaches to the same checkout.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::github::RepoLocator;

/// Resource spec for a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub memory: String,
    pub cpus: f64,
    /// Per-command timeout in seconds.
    pub timeout: u64,
    pub env: HashMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory: "4g".to_string(),
            cpus: 2.0,
            timeout: 1800,
            env: HashMap::new(),
        }
    }
}

/// Everything needed to provision (or re-attach to) a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub id: String,
    pub repo: RepoLocator,
    pub base_branch: String,
    pub work_branch: String,
    pub config: SandboxConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrepMatch {
    pub path: String,
    pub line: usize,
    pub text: String,
}

/// Exit code reported when a command exceeds the sandbox timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const MAX_GREP_MATCHES: usize = 200;
const MAX_GLOB_MATCHES: usize = 500;

/// File and command primitives over one sandbox. Paths are relative to the
/// sandbox root.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    async fn run_command(&self, cmd: &str, args: &[String]) -> Result<CommandOutput>;

    async fn read_file(&self, path: &str) -> Result<String>;

    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    /// Replace exactly one occurrence of `old` with `new`.
    async fn edit_file(&self, path: &str, old: &str, new: &str) -> Result<()>;

    async fn glob(&self, pattern: &str) -> Result<Vec<String>>;

    async fn grep(&self, pattern: &str, path: Option<&str>) -> Result<Vec<GrepMatch>>;

    async fn stop(&self) -> Result<()>;
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provision the sandbox, or re-attach if `spec.id` already exists.
    async fn create(&self, spec: &SandboxSpec) -> Result<Arc<dyn Sandbox>>;
}

/// Resolve `path` under `root`, refusing absolute paths and `..` escapes.
pub fn resolve_in_root(root: &Path, path: &str) -> Result<PathBuf> {
    let rel = Path::new(path);
    let mut out = root.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => bail!("Path '{}' escapes the sandbox", path),
            Component::RootDir | Component::Prefix(_) => {
                bail!("Path '{}' must be relative to the sandbox root", path)
            }
        }
    }
    Ok(out)
}

fn relative_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn in_git_dir(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .ok()
        .and_then(|p| p.components().next())
        .is_some_and(|c| c.as_os_str() == ".git")
}

/// A sandbox backed by a local working directory.
pub struct LocalSandbox {
    id: String,
    root: PathBuf,
    config: SandboxConfig,
    stopped: AtomicBool,
}

impl LocalSandbox {
    pub fn new(id: &str, root: PathBuf, config: SandboxConfig) -> Self {
        Self {
            id: id.to_string(),
            root,
            config,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            bail!("Sandbox {} is stopped", self.id);
        }
        Ok(())
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run_command(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        self.ensure_running()?;
        let child = tokio::process::Command::new(cmd)
            .args(args)
            .current_dir(&self.root)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}' in sandbox {}", cmd, self.id))?;

        let limit = Duration::from_secs(self.config.timeout);
        match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(output) => {
                let output = output.with_context(|| format!("Failed to wait for '{}'", cmd))?;
                Ok(CommandOutput {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_code: output.status.code().unwrap_or(-1),
                })
            }
            Err(_) => Ok(CommandOutput {
                stdout: String::new(),
                stderr: format!("'{}' timed out after {}s", cmd, self.config.timeout),
                exit_code: TIMEOUT_EXIT_CODE,
            }),
        }
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        self.ensure_running()?;
        let full = resolve_in_root(&self.root, path)?;
        tokio::fs::read_to_string(&full)
            .await
            .with_context(|| format!("Failed to read {}", path))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.ensure_running()?;
        let full = resolve_in_root(&self.root, path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create parent of {}", path))?;
        }
        tokio::fs::write(&full, content)
            .await
            .with_context(|| format!("Failed to write {}", path))
    }

    async fn edit_file(&self, path: &str, old: &str, new: &str) -> Result<()> {
        let content = self.read_file(path).await?;
        if old.is_empty() {
            bail!("old_string must not be empty");
        }
        match content.matches(old).count() {
            0 => bail!("old_string not found in {}", path),
            1 => self.write_file(path, &content.replacen(old, new, 1)).await,
            n => bail!(
                "old_string matches {} times in {}; include more surrounding context",
                n,
                path
            ),
        }
    }

    async fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        self.ensure_running()?;
        // Validate the pattern as a path so it cannot reach outside the root.
        let full = resolve_in_root(&self.root, pattern)?;
        let full = full.to_string_lossy().to_string();
        let mut matches = Vec::new();
        for entry in glob::glob(&full).with_context(|| format!("Invalid glob '{}'", pattern))? {
            let Ok(path) = entry else { continue };
            if in_git_dir(&self.root, &path) || !path.is_file() {
                continue;
            }
            matches.push(relative_display(&self.root, &path));
            if matches.len() >= MAX_GLOB_MATCHES {
                break;
            }
        }
        matches.sort();
        Ok(matches)
    }

    async fn grep(&self, pattern: &str, path: Option<&str>) -> Result<Vec<GrepMatch>> {
        self.ensure_running()?;
        let re = regex::Regex::new(pattern).with_context(|| format!("Invalid regex '{}'", pattern))?;
        let start = match path {
            Some(p) => resolve_in_root(&self.root, p)?,
            None => self.root.clone(),
        };
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let mut matches = Vec::new();
            let walker = walkdir::WalkDir::new(&start)
                .into_iter()
                .filter_entry(|e| e.file_name() != ".git");
            for entry in walker.filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(text) = std::fs::read_to_string(entry.path()) else {
                    continue;
                };
                for (i, line) in text.lines().enumerate() {
                    if re.is_match(line) {
                        matches.push(GrepMatch {
                            path: relative_display(&root, entry.path()),
                            line: i + 1,
                            text: line.to_string(),
                        });
                        if matches.len() >= MAX_GREP_MATCHES {
                            return matches;
                        }
                    }
                }
            }
            matches
        })
        .await
        .context("grep task panicked")
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Provisions sandboxes as git clones under a local root directory.
pub struct LocalSandboxProvider {
    root: PathBuf,
    remote_base: String,
}

impl LocalSandboxProvider {
    pub fn new(root: PathBuf, remote_base: &str) -> Self {
        Self {
            root,
            remote_base: remote_base.to_string(),
        }
    }

    async fn git(dir: &Path, args: &[&str]) -> Result<()> {
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    async fn create(&self, spec: &SandboxSpec) -> Result<Arc<dyn Sandbox>> {
        let dir = self.root.join(&spec.id);

        if dir.join(".git").exists() {
            tracing::info!(sandbox_id = %spec.id, "re-attaching to existing sandbox");
        } else {
            if dir.exists() {
                // A clone that died half way.
                tokio::fs::remove_dir_all(&dir)
                    .await
                    .with_context(|| format!("Failed to clear {}", dir.display()))?;
            }
            tokio::fs::create_dir_all(&self.root)
                .await
                .with_context(|| format!("Failed to create {}", self.root.display()))?;

            let url = spec.repo.clone_url(&self.remote_base);
            let dir_str = dir.to_string_lossy().to_string();
            tracing::info!(sandbox_id = %spec.id, %url, branch = %spec.base_branch, "cloning");
            Self::git(
                &self.root,
                &["clone", "--branch", &spec.base_branch, &url, &dir_str],
            )
            .await?;
            Self::git(&dir, &["checkout", "-b", &spec.work_branch]).await?;
        }

        Ok(Arc::new(LocalSandbox::new(
            &spec.id,
            dir,
            spec.config.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sandbox(dir: &Path) -> LocalSandbox {
        LocalSandbox::new("sb", dir.to_path_buf(), SandboxConfig::default())
    }

    #[test]
    fn test_sandbox_config_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.memory, "4g");
        assert_eq!(config.cpus, 2.0);
        assert_eq!(config.timeout, 1800);
        assert!(config.env.is_empty());
    }

    #[test]
    fn test_resolve_in_root() {
        let root = Path::new("/sb");
        assert_eq!(
            resolve_in_root(root, "src/./main.rs").unwrap(),
            PathBuf::from("/sb/src/main.rs")
        );
        assert!(resolve_in_root(root, "../etc/passwd").is_err());
        assert!(resolve_in_root(root, "src/../../x").is_err());
        assert!(resolve_in_root(root, "/etc/passwd").is_err());
    }

    #[test]
    fn test_combined_output() {
        let out = CommandOutput {
            stdout: "a".into(),
            stderr: "b".into(),
            exit_code: 1,
        };
        assert_eq!(out.combined(), "a\nb");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_write_read_edit() -> Result<()> {
        let dir = tempdir()?;
        let sb = sandbox(dir.path());

        sb.write_file("src/theme.ts", "const dark = false;\n").await?;
        assert_eq!(sb.read_file("src/theme.ts").await?, "const dark = false;\n");

        sb.edit_file("src/theme.ts", "false", "true").await?;
        assert_eq!(sb.read_file("src/theme.ts").await?, "const dark = true;\n");

        let missing = sb.edit_file("src/theme.ts", "nope", "x").await.unwrap_err();
        assert!(missing.to_string().contains("not found"));

        sb.write_file("dup.txt", "a a").await?;
        let ambiguous = sb.edit_file("dup.txt", "a", "b").await.unwrap_err();
        assert!(ambiguous.to_string().contains("2 times"));

        assert!(sb.read_file("../outside").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_glob_and_grep() -> Result<()> {
        let dir = tempdir()?;
        let sb = sandbox(dir.path());
        sb.write_file("src/a.ts", "export const toggle = 1;\n").await?;
        sb.write_file("src/b.ts", "nothing here\n").await?;
        sb.write_file(".git/config", "toggle").await?;

        let files = sb.glob("src/*.ts").await?;
        assert_eq!(files, vec!["src/a.ts", "src/b.ts"]);

        let hits = sb.grep("toggle", None).await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "src/a.ts");
        assert_eq!(hits[0].line, 1);

        assert!(sb.grep("(", None).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_run_command_and_stop() -> Result<()> {
        let dir = tempdir()?;
        let sb = sandbox(dir.path());

        let out = sb
            .run_command("sh", &["-c".into(), "echo hi; exit 3".into()])
            .await?;
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.exit_code, 3);

        sb.stop().await?;
        assert!(sb.run_command("true", &[]).await.is_err());
        assert!(sb.read_file("x").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_run_command_timeout() -> Result<()> {
        let dir = tempdir()?;
        let sb = LocalSandbox::new(
            "sb",
            dir.path().to_path_buf(),
            SandboxConfig {
                timeout: 1,
                ..SandboxConfig::default()
            },
        );
        let out = sb.run_command("sleep", &["5".into()]).await?;
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
        assert!(out.stderr.contains("timed out"));
        Ok(())
    }

    #[tokio::test]
    async fn test_local_provider_clones_and_reattaches() -> Result<()> {
        let git_available = std::process::Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success());
        if !git_available {
            return Ok(());
        }

        let remote = tempdir()?;
        let origin = remote.path().join("org").join("app.git");
        std::fs::create_dir_all(&origin)?;
        let run = |args: &[&str]| {
            std::process::Command::new("git")
                .args(args)
                .current_dir(&origin)
                .output()
        };
        run(&["init", "-q", "-b", "main"])?;
        std::fs::write(origin.join("README.md"), "hello\n")?;
        run(&["add", "."])?;
        run(&[
            "-c",
            "user.email=t@example.com",
            "-c",
            "user.name=t",
            "commit",
            "-q",
            "-m",
            "init",
        ])?;

        let sandboxes = tempdir()?;
        let provider =
            LocalSandboxProvider::new(sandboxes.path().to_path_buf(), &remote.path().to_string_lossy());
        let spec = SandboxSpec {
            id: "sb-1".into(),
            repo: RepoLocator {
                owner: "org".into(),
                repo: "app".into(),
            },
            base_branch: "main".into(),
            work_branch: "forgeflow/test-12345678".into(),
            config: SandboxConfig::default(),
        };

        let sb = provider.create(&spec).await?;
        assert_eq!(sb.read_file("README.md").await?, "hello\n");
        let branch = sb
            .run_command("git", &["rev-parse".into(), "--abbrev-ref".into(), "HEAD".into()])
            .await?;
        assert_eq!(branch.stdout.trim(), "forgeflow/test-12345678");

        sb.write_file("marker", "kept").await?;
        let again = provider.create(&spec).await?;
        assert_eq!(again.read_file("marker").await?, "kept");
        Ok(())
    }
}
