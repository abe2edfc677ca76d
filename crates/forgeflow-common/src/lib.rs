//! Shared domain types for the forgeflow feature pipeline.
//!
//! Everything in this crate is plain data: phases and their statuses, memory
//! records threaded between phases, the human-feedback (CTA) request and
//! response shapes, quality-gate results, judge verdicts, and the tagged
//! per-phase output union persisted on each phase result.
//!
//! | Module   | Types                                                        |
//! |----------|--------------------------------------------------------------|
//! | `phase`  | `FeaturePhase`, `PhaseStatus`                                |
//! | `memory` | `MemoryKind`, `MemoryRecord`                                 |
//! | `cta`    | `CtaKind`, `CtaRequest`, `CtaResponse`, `CtaOutcome`         |
//! | `gate`   | `Gate`, `GateStatus`, `GateResult`                           |
//! | `judge`  | `JudgeCriterion`, `JudgeVerdict`, `Synthesis`                |
//! | `output` | `PhaseOutput` and one concrete output struct per phase       |

pub mod cta;
pub mod gate;
pub mod judge;
pub mod memory;
pub mod output;
pub mod phase;

pub use cta::{ChoiceOption, CtaKind, CtaOutcome, CtaRequest, CtaResponse, CtaValidationError};
pub use gate::{Gate, GateResult, GateStatus};
pub use judge::{
    FindingSeverity, JudgeCriterion, JudgeFinding, JudgeVerdict, OverallVerdict, Synthesis,
    Verdict,
};
pub use memory::{MemoryKind, MemoryRecord};
pub use output::{
    AnalysisOutput, Approach, ApproachesOutput, AttemptRecord, FileChangeSummary,
    ImplementationOutput, JudgingOutput, PhaseOutput, PrOutput,
};
pub use phase::{FeaturePhase, PhaseStatus};
