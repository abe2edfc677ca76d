//! Collaborators shared by every phase of a run.

use std::sync::Arc;
use std::time::Duration;

use forgeflow_common::{FeaturePhase, MemoryRecord};

use crate::agent::model::ModelClient;
use crate::config::ForgeflowConfig;
use crate::durable::{EventBus, StepJournal};
use crate::factory::db::DbHandle;
use crate::factory::github::PullRequestCreator;
use crate::factory::notify::{Notification, Notifier};
use crate::factory::sandbox::{Sandbox, SandboxProvider};

/// Process-wide wiring. Cheap to clone.
#[derive(Clone)]
pub struct RunContext {
    pub db: DbHandle,
    pub bus: EventBus,
    pub model: Arc<dyn ModelClient>,
    pub sandboxes: Arc<dyn SandboxProvider>,
    pub notifier: Arc<dyn Notifier>,
    pub pr_creator: Arc<dyn PullRequestCreator>,
    pub config: Arc<ForgeflowConfig>,
}

impl RunContext {
    /// Root journal for a run.
    pub fn journal(&self, run_id: &str) -> StepJournal {
        StepJournal::new(self.db.clone(), self.bus.clone(), run_id)
            .with_max_retries(self.config.limits.max_step_retries)
            .with_poll_interval(Duration::from_millis(self.config.cta.poll_interval_ms))
    }

    pub fn cta_timeout(&self) -> Duration {
        Duration::from_secs(self.config.cta.timeout_secs)
    }

    /// Publish, logging instead of failing when the surface is down.
    pub async fn notify(&self, notification: Notification) {
        if let Err(e) = self.notifier.publish(&notification).await {
            tracing::warn!("Failed to publish notification: {:#}", e);
        }
    }
}

/// One running phase of one run.
#[derive(Clone)]
pub struct PhaseScope {
    pub ctx: RunContext,
    pub run_id: String,
    pub prompt: String,
    pub phase: FeaturePhase,
    pub phase_result_id: String,
    pub sandbox: Arc<dyn Sandbox>,
    /// Journal scoped to this phase.
    pub journal: StepJournal,
    /// Memories recorded before the phase started.
    pub memories: Vec<MemoryRecord>,
}
