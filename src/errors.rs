//! Typed error hierarchy for forgeflow.
//!
//! - `OrchestratorError`: run-level failures
//! - `PhaseError`: per-phase failures that end a run
//! - `CtaError`: human-feedback protocol failures
//! - `StepError`: marks a failure as retriable by the step journal
//!
//! Library code returns `anyhow::Result`; these types travel inside the
//! `anyhow::Error` chain and are recovered with `downcast_ref`.

use forgeflow_common::{CtaKind, FeaturePhase};
use thiserror::Error;

/// Errors from the master orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Feature run {id} not found")]
    RunNotFound { id: String },

    #[error("Feature run {id} already finished as {phase}")]
    RunFinished { id: String, phase: FeaturePhase },

    #[error("Failed to provision sandbox {sandbox_id}: {message}")]
    SandboxProvision { sandbox_id: String, message: String },

    #[error("Invalid repository locator '{0}'")]
    InvalidRepo(String),

    #[error("Missing required environment variable {0}")]
    MissingEnv(&'static str),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors that fail a single phase, and with it the run.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Implementation failed after {attempts} coder attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Judging rejected approach {approach_id}: {reason}")]
    Rejected { approach_id: String, reason: String },

    #[error("Agent output for {phase} is malformed: {detail}")]
    MalformedOutput { phase: FeaturePhase, detail: String },

    #[error("Human declined after {phase}: {reason}")]
    Declined { phase: FeaturePhase, reason: String },

    #[error("No human response after {phase} before the timeout")]
    CtaTimedOut { phase: FeaturePhase },

    #[error("Phase {phase} has no output from {missing}")]
    MissingUpstream {
        phase: FeaturePhase,
        missing: FeaturePhase,
    },

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// Errors from the human-feedback protocol.
#[derive(Debug, Error)]
pub enum CtaError {
    /// A response that does not match its request. Never retried.
    #[error("CTA {cta_id} protocol violation (expected {expected}): {detail}")]
    ProtocolViolation {
        cta_id: String,
        expected: CtaKind,
        detail: String,
    },

    #[error("Invalid CTA request: {0}")]
    InvalidRequest(String),

    #[error("CTA {0} not found")]
    NotFound(String),

    #[error("CTA {0} is already resolved")]
    AlreadyResolved(String),
}

/// Marks an error as transient so the step journal retries it.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("Transient failure: {0}")]
    Transient(String),
}

/// True when any error in the chain is a [`StepError::Transient`].
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|e| matches!(e.downcast_ref::<StepError>(), Some(StepError::Transient(_))))
}

/// True when the chain carries a CTA protocol violation.
pub fn is_protocol_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|e| {
        matches!(
            e.downcast_ref::<CtaError>(),
            Some(CtaError::ProtocolViolation { .. })
        )
    })
}
