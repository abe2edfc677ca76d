use std::collections::HashMap;
use std::str::FromStr;

use forgeflow_common::{CtaKind, CtaRequest, CtaResponse, FeaturePhase, MemoryRecord, PhaseOutput, PhaseStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureRun {
    pub id: String,
    pub prompt: String,
    /// `owner/repo`
    pub repo: String,
    pub base_branch: String,
    pub work_branch: Option<String>,
    pub sandbox_id: Option<String>,
    pub current_phase: FeaturePhase,
    pub memories: Vec<MemoryRecord>,
    pub pr_url: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewFeatureRun {
    pub id: String,
    pub prompt: String,
    pub repo: String,
    pub base_branch: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Pending,
    Running,
    Stopping,
    Stopped,
    Failed,
    Aborted,
    Snapshotting,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::Snapshotting => "snapshotting",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Aborted)
    }
}

impl FromStr for SandboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            "snapshotting" => Ok(Self::Snapshotting),
            _ => Err(format!("Invalid sandbox status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub id: String,
    pub run_id: String,
    pub status: SandboxStatus,
    pub memory: String,
    pub cpus: f64,
    pub timeout_secs: u64,
    pub workdir: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub stopped_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewSandboxRecord {
    pub id: String,
    pub run_id: String,
    pub memory: String,
    pub cpus: f64,
    pub timeout_secs: u64,
    pub workdir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub id: String,
    pub run_id: String,
    pub phase: FeaturePhase,
    pub status: PhaseStatus,
    pub output: Option<PhaseOutput>,
    pub error: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Orchestrator,
    Explorer,
    Coder,
    Judge,
    MetaJudge,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orchestrator => "orchestrator",
            Self::Explorer => "explorer",
            Self::Coder => "coder",
            Self::Judge => "judge",
            Self::MetaJudge => "meta_judge",
        }
    }
}

impl FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orchestrator" => Ok(Self::Orchestrator),
            "explorer" => Ok(Self::Explorer),
            "coder" => Ok(Self::Coder),
            "judge" => Ok(Self::Judge),
            "meta_judge" => Ok(Self::MetaJudge),
            _ => Err(format!("Invalid agent type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub id: String,
    pub phase_result_id: String,
    pub parent_invocation_id: Option<String>,
    pub agent_type: AgentType,
    pub model: String,
    pub system_prompt: String,
    pub input_messages: serde_json::Value,
    pub finish_reason: Option<String>,
    pub output_text: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub steps: u32,
    pub tool_calls: serde_json::Value,
    pub started_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAgentInvocation {
    pub id: String,
    pub phase_result_id: String,
    pub parent_invocation_id: Option<String>,
    pub agent_type: AgentType,
    pub model: String,
    pub system_prompt: String,
    pub input_messages: serde_json::Value,
}

/// Terminal fields written when an invocation's loop stops.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvocationCompletion {
    pub finish_reason: String,
    pub output_text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub steps: u32,
    pub tool_calls: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CtaEvent {
    pub id: String,
    pub run_id: String,
    pub phase_result_id: String,
    pub invocation_id: Option<String>,
    pub tool_call_id: Option<String>,
    pub kind: CtaKind,
    pub request: CtaRequest,
    pub response: Option<CtaResponse>,
    /// Raw response exactly as received, kept even when it fails validation.
    pub response_payload: Option<String>,
    pub protocol_error: Option<String>,
    pub requested_at: String,
    pub responded_at: Option<String>,
    pub timed_out: bool,
}

impl CtaEvent {
    pub fn is_resolved(&self) -> bool {
        self.responded_at.is_some() || self.timed_out
    }

    pub fn response_selected_id(&self) -> Option<&str> {
        match &self.response {
            Some(CtaResponse::Choice { selected_id }) => Some(selected_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewCtaEvent {
    pub id: String,
    pub run_id: String,
    pub phase_result_id: String,
    pub invocation_id: Option<String>,
    pub tool_call_id: Option<String>,
    pub request: CtaRequest,
}

/// A persisted event on the flow bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowEvent {
    pub id: String,
    pub run_id: String,
    pub name: String,
    pub correlation_id: String,
    pub payload: serde_json::Value,
    pub created_at: String,
}

impl FlowEvent {
    pub fn new(
        run_id: &str,
        name: &str,
        correlation_id: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            name: name.to_string(),
            correlation_id: correlation_id.to_string(),
            payload,
            created_at: super::db::now_ts(),
        }
    }
}

/// Invocation tree for one run, held as an arena indexed by position.
/// Parent links come from `parent_invocation_id`; nothing holds back-pointers.
#[derive(Debug, Clone, Default)]
pub struct InvocationForest {
    pub nodes: Vec<AgentInvocation>,
    index: HashMap<String, usize>,
    children: Vec<Vec<usize>>,
    roots: Vec<usize>,
}

impl InvocationForest {
    /// Build from invocations in creation order. An invocation whose parent
    /// is not in the set becomes a root.
    pub fn build(nodes: Vec<AgentInvocation>) -> Self {
        let index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        let mut children = vec![Vec::new(); nodes.len()];
        let mut roots = Vec::new();
        for (i, node) in nodes.iter().enumerate() {
            match node.parent_invocation_id.as_ref().and_then(|p| index.get(p)) {
                Some(&parent) => children[parent].push(i),
                None => roots.push(i),
            }
        }
        Self {
            nodes,
            index,
            children,
            roots,
        }
    }

    pub fn roots(&self) -> impl Iterator<Item = &AgentInvocation> {
        self.roots.iter().map(|&i| &self.nodes[i])
    }

    pub fn get(&self, id: &str) -> Option<&AgentInvocation> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn children_of(&self, id: &str) -> Vec<&AgentInvocation> {
        self.index
            .get(id)
            .map(|&i| self.children[i].iter().map(|&c| &self.nodes[c]).collect())
            .unwrap_or_default()
    }

    pub fn depth_of(&self, id: &str) -> Option<usize> {
        let mut depth = 0;
        let mut current = self.get(id)?;
        while let Some(parent) = current
            .parent_invocation_id
            .as_deref()
            .and_then(|p| self.get(p))
        {
            depth += 1;
            current = parent;
        }
        Some(depth)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Everything `forgeflow status` prints for one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: FeatureRun,
    pub sandbox: Option<SandboxRecord>,
    pub phases: Vec<PhaseResult>,
    pub cta_events: Vec<CtaEvent>,
    pub invocation_count: usize,
}
