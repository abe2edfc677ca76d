//! Configuration for forgeflow.
//!
//! Settings are read from `.forgeflow/forgeflow.toml`. Every section is
//! optional; missing keys fall back to defaults. Environment variables
//! override the file, and CLI flags override both.
//!
//! # Configuration File Format
//!
//! ```toml
//! [storage]
//! db_path = ".forgeflow/forgeflow.db"
//!
//! [models]
//! orchestrator = "claude-sonnet-4-5"
//! coder = "claude-sonnet-4-5"
//! max_tokens = 8192
//!
//! [limits]
//! max_coder_attempts = 5
//! judge_max_steps = 15
//!
//! [cta]
//! timeout_secs = 2592000
//!
//! [gates]
//! typecheck = ["npm", "run", "typecheck"]
//! output_limit = 8000
//!
//! [sandbox]
//! root = ".forgeflow/sandboxes"
//! memory = "4g"
//! cpus = 2.0
//!
//! [sandbox.env]
//! CI = "1"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::factory::sandbox::SandboxConfig;

pub const CONFIG_DIR: &str = ".forgeflow";
pub const CONFIG_FILE: &str = "forgeflow.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".forgeflow/forgeflow.db")
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Model ids per agent role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsSection {
    #[serde(default = "default_model")]
    pub orchestrator: String,
    #[serde(default = "default_model")]
    pub explorer: String,
    #[serde(default = "default_model")]
    pub coder: String,
    #[serde(default = "default_model")]
    pub judge: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_model_api_base")]
    pub api_base: String,
}

fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_model_api_base() -> String {
    "https://api.anthropic.com".to_string()
}

impl Default for ModelsSection {
    fn default() -> Self {
        Self {
            orchestrator: default_model(),
            explorer: default_model(),
            coder: default_model(),
            judge: default_model(),
            max_tokens: default_max_tokens(),
            api_base: default_model_api_base(),
        }
    }
}

/// Step budgets and retry bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_orchestrator_max_steps")]
    pub orchestrator_max_steps: u32,
    #[serde(default = "default_explorer_max_steps")]
    pub explorer_max_steps: u32,
    #[serde(default = "default_coder_max_steps")]
    pub coder_max_steps: u32,
    #[serde(default = "default_judge_max_steps")]
    pub judge_max_steps: u32,
    #[serde(default = "default_max_coder_attempts")]
    pub max_coder_attempts: u32,
    #[serde(default = "default_max_step_retries")]
    pub max_step_retries: u32,
    #[serde(default = "default_max_explorers")]
    pub max_explorers: u32,
}

fn default_orchestrator_max_steps() -> u32 {
    30
}

fn default_explorer_max_steps() -> u32 {
    20
}

fn default_coder_max_steps() -> u32 {
    40
}

fn default_judge_max_steps() -> u32 {
    15
}

fn default_max_coder_attempts() -> u32 {
    5
}

fn default_max_step_retries() -> u32 {
    3
}

fn default_max_explorers() -> u32 {
    6
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            orchestrator_max_steps: default_orchestrator_max_steps(),
            explorer_max_steps: default_explorer_max_steps(),
            coder_max_steps: default_coder_max_steps(),
            judge_max_steps: default_judge_max_steps(),
            max_coder_attempts: default_max_coder_attempts(),
            max_step_retries: default_max_step_retries(),
            max_explorers: default_max_explorers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CtaSection {
    /// How long a human may take to answer (30 days).
    #[serde(default = "default_cta_timeout_secs")]
    pub timeout_secs: u64,
    /// Poll interval for responses recorded by another process.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_cta_timeout_secs() -> u64 {
    30 * 24 * 60 * 60
}

fn default_poll_interval_ms() -> u64 {
    2000
}

impl Default for CtaSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_cta_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Quality gate commands, each an argv array run in the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatesSection {
    #[serde(default = "default_typecheck_cmd")]
    pub typecheck: Vec<String>,
    #[serde(default = "default_lint_cmd")]
    pub lint: Vec<String>,
    #[serde(default = "default_test_cmd")]
    pub test: Vec<String>,
    #[serde(default = "default_build_cmd")]
    pub build: Vec<String>,
    #[serde(default = "default_output_limit")]
    pub output_limit: usize,
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn default_typecheck_cmd() -> Vec<String> {
    argv(&["npm", "run", "typecheck"])
}

fn default_lint_cmd() -> Vec<String> {
    argv(&["npm", "run", "lint"])
}

fn default_test_cmd() -> Vec<String> {
    argv(&["npm", "test"])
}

fn default_build_cmd() -> Vec<String> {
    argv(&["npm", "run", "build"])
}

fn default_output_limit() -> usize {
    8000
}

impl Default for GatesSection {
    fn default() -> Self {
        Self {
            typecheck: default_typecheck_cmd(),
            lint: default_lint_cmd(),
            test: default_test_cmd(),
            build: default_build_cmd(),
            output_limit: default_output_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSection {
    #[serde(default = "default_sandbox_root")]
    pub root: PathBuf,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_sandbox_root() -> PathBuf {
    PathBuf::from(".forgeflow/sandboxes")
}

fn default_memory() -> String {
    "4g".to_string()
}

fn default_cpus() -> f64 {
    2.0
}

fn default_command_timeout_secs() -> u64 {
    1800
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            root: default_sandbox_root(),
            memory: default_memory(),
            cpus: default_cpus(),
            command_timeout_secs: default_command_timeout_secs(),
            env: HashMap::new(),
        }
    }
}

impl SandboxSection {
    pub fn to_sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            memory: self.memory.clone(),
            cpus: self.cpus,
            timeout: self.command_timeout_secs,
            env: self.env.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubSection {
    #[serde(default = "default_github_api_base")]
    pub api_base: String,
    /// Clone URLs are `{remote_base}/{owner}/{repo}.git`.
    #[serde(default = "default_remote_base")]
    pub remote_base: String,
}

fn default_github_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_remote_base() -> String {
    "https://github.com".to_string()
}

impl Default for GithubSection {
    fn default() -> Self {
        Self {
            api_base: default_github_api_base(),
            remote_base: default_remote_base(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub json_file: bool,
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".forgeflow/logs")
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            json_file: false,
            dir: default_log_dir(),
        }
    }
}

/// The complete forgeflow.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgeflowConfig {
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub models: ModelsSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub cta: CtaSection,
    #[serde(default)]
    pub gates: GatesSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub github: GithubSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl ForgeflowConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse forgeflow.toml")
    }

    /// Load from `.forgeflow/forgeflow.toml` under `project_dir`, or defaults
    /// if the file doesn't exist.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load the file layer, then apply environment overrides.
    pub fn resolve(explicit: Option<&Path>, project_dir: &Path) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(project_dir)?,
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `FORGEFLOW_*` overrides. The lookup is injected so tests can
    /// supply values without touching the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("FORGEFLOW_DB_PATH") {
            self.storage.db_path = PathBuf::from(path);
        }
        if let Some(secs) = lookup("FORGEFLOW_CTA_TIMEOUT_SECS") {
            self.cta.timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("Invalid FORGEFLOW_CTA_TIMEOUT_SECS '{}'", secs))?;
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for (name, cmd) in [
            ("typecheck", &self.gates.typecheck),
            ("lint", &self.gates.lint),
            ("test", &self.gates.test),
            ("build", &self.gates.build),
        ] {
            if cmd.is_empty() {
                warnings.push(format!("Gate '{}' has an empty command", name));
            }
        }
        if self.limits.max_coder_attempts == 0 {
            warnings.push("limits.max_coder_attempts is 0; implementation can never pass".into());
        }
        if self.cta.timeout_secs == 0 {
            warnings.push("cta.timeout_secs is 0; every approval will time out".into());
        }
        if self.sandbox.cpus <= 0.0 {
            warnings.push(format!("Invalid sandbox.cpus {}", self.sandbox.cpus));
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = ForgeflowConfig::default();
        assert_eq!(config.storage.db_path, PathBuf::from(".forgeflow/forgeflow.db"));
        assert_eq!(config.limits.max_coder_attempts, 5);
        assert_eq!(config.limits.orchestrator_max_steps, 30);
        assert_eq!(config.cta.timeout_secs, 2_592_000);
        assert_eq!(config.gates.output_limit, 8000);
        assert_eq!(config.sandbox.memory, "4g");
        assert_eq!(config.github.api_base, "https://api.github.com");
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_file() {
        let config = ForgeflowConfig::parse(
            r#"
            [limits]
            max_coder_attempts = 3

            [gates]
            test = ["cargo", "test"]

            [sandbox.env]
            CI = "1"
            "#,
        )
        .unwrap();
        assert_eq!(config.limits.max_coder_attempts, 3);
        assert_eq!(config.limits.judge_max_steps, 15);
        assert_eq!(config.gates.test, vec!["cargo", "test"]);
        assert_eq!(config.gates.lint, vec!["npm", "run", "lint"]);
        assert_eq!(config.sandbox.env.get("CI").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_parse_invalid_toml() {
        assert!(ForgeflowConfig::parse("[limits\nmax = ").is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = ForgeflowConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.limits.max_explorers, 6);
    }

    #[test]
    fn test_load_or_default_reads_file() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(CONFIG_DIR)).unwrap();
        std::fs::write(
            dir.path().join(CONFIG_DIR).join(CONFIG_FILE),
            "[cta]\ntimeout_secs = 60\n",
        )
        .unwrap();
        let config = ForgeflowConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.cta.timeout_secs, 60);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ForgeflowConfig::default();
        config
            .apply_env(|key| match key {
                "FORGEFLOW_DB_PATH" => Some("/tmp/flow.db".to_string()),
                "FORGEFLOW_CTA_TIMEOUT_SECS" => Some("120".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.storage.db_path, PathBuf::from("/tmp/flow.db"));
        assert_eq!(config.cta.timeout_secs, 120);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = ForgeflowConfig::default();
        let result = config.apply_env(|key| {
            (key == "FORGEFLOW_CTA_TIMEOUT_SECS").then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_flags_empty_gate() {
        let mut config = ForgeflowConfig::default();
        config.gates.lint.clear();
        config.limits.max_coder_attempts = 0;
        let warnings = config.validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("lint"));
    }
}
