//! Per-phase outputs persisted on each passed phase result.
//!
//! `PhaseOutput` is discriminated by the `phase` field so a later phase reads
//! a concrete shape instead of an opaque blob.

use serde::{Deserialize, Serialize};

use crate::gate::GateResult;
use crate::judge::{JudgeVerdict, Synthesis};
use crate::phase::FeaturePhase;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum PhaseOutput {
    Analysis(AnalysisOutput),
    Approaches(ApproachesOutput),
    Judging(JudgingOutput),
    Implementation(ImplementationOutput),
    Pr(PrOutput),
}

impl PhaseOutput {
    pub fn phase(&self) -> FeaturePhase {
        match self {
            Self::Analysis(_) => FeaturePhase::Analysis,
            Self::Approaches(_) => FeaturePhase::Approaches,
            Self::Judging(_) => FeaturePhase::Judging,
            Self::Implementation(_) => FeaturePhase::Implementation,
            Self::Pr(_) => FeaturePhase::Pr,
        }
    }
}

impl From<AnalysisOutput> for PhaseOutput {
    fn from(output: AnalysisOutput) -> Self {
        Self::Analysis(output)
    }
}

impl From<ApproachesOutput> for PhaseOutput {
    fn from(output: ApproachesOutput) -> Self {
        Self::Approaches(output)
    }
}

impl From<JudgingOutput> for PhaseOutput {
    fn from(output: JudgingOutput) -> Self {
        Self::Judging(output)
    }
}

impl From<ImplementationOutput> for PhaseOutput {
    fn from(output: ImplementationOutput) -> Self {
        Self::Implementation(output)
    }
}

impl From<PrOutput> for PhaseOutput {
    fn from(output: PrOutput) -> Self {
        Self::Pr(output)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisOutput {
    /// Markdown description of the relevant parts of the codebase.
    pub codebase_map: String,
    pub explorer_count: u32,
    pub invocation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approach {
    pub id: String,
    pub title: String,
    pub summary: String,
    /// Step-by-step implementation plan handed to the coder.
    pub plan: String,
    #[serde(default)]
    pub tradeoffs: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproachesOutput {
    pub approaches: Vec<Approach>,
}

impl ApproachesOutput {
    pub fn find(&self, id: &str) -> Option<&Approach> {
        self.approaches.iter().find(|a| a.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgingOutput {
    pub approach_id: String,
    pub verdicts: Vec<JudgeVerdict>,
    pub synthesis: Synthesis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub invocation_id: String,
    pub gates: Vec<GateResult>,
    pub passed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangeSummary {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl FileChangeSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn total(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplementationOutput {
    pub passed: bool,
    pub total_coder_attempts: u32,
    pub attempts: Vec<AttemptRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<FileChangeSummary>,
    /// Judging conditions the coder was asked to satisfy. Empty on failure.
    #[serde(default)]
    pub conditions_addressed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrOutput {
    pub url: String,
    pub number: u64,
    pub branch: String,
    pub base: String,
}
