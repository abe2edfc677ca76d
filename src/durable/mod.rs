//! Durable step substrate.
//!
//! Every side-effecting step of a run goes through a [`StepJournal`]. A step
//! is memoized by `(run_id, key)` in the `step_journal` table: replaying a run
//! returns the recorded value and never re-executes the step. Waiting for an
//! external event (a human answering a CTA) is itself a step with a persisted
//! deadline, so a process can exit mid-wait and [`StepJournal::wait_for_event`]
//! picks up where it left off on resume.
//!
//! Keys are hierarchical. [`StepJournal::scope`] derives a child journal whose
//! keys are prefixed, which is how sub-agent invocations get their own
//! namespace inside a run.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;

use crate::errors::is_transient;
use crate::factory::db::DbHandle;
use crate::factory::models::FlowEvent;

const BACKOFF_BASE_MS: u64 = 250;
const BACKOFF_MAX: Duration = Duration::from_secs(30);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Persisted, in-process broadcast event bus.
///
/// Events are written to `flow_events` before being broadcast so a waiter
/// that subscribes late, or lives in another process, still finds them.
#[derive(Clone)]
pub struct EventBus {
    db: DbHandle,
    tx: broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(db: DbHandle) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { db, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }

    /// At-least-once publish. Re-sending an event id is a no-op and returns
    /// false.
    pub async fn send_event(&self, event: FlowEvent) -> Result<bool> {
        let stored = event.clone();
        let inserted = self
            .db
            .call(move |db| db.insert_flow_event(&stored))
            .await?;
        if inserted {
            tracing::debug!(name = %event.name, correlation_id = %event.correlation_id, "event sent");
            let _ = self.tx.send(event);
        }
        Ok(inserted)
    }
}

/// Exponential backoff from [`BACKOFF_BASE_MS`], capped at [`BACKOFF_MAX`].
fn backoff_delay(attempt: u32) -> Duration {
    2u64.checked_pow(attempt)
        .and_then(|factor| BACKOFF_BASE_MS.checked_mul(factor))
        .map(Duration::from_millis)
        .map_or(BACKOFF_MAX, |delay| delay.min(BACKOFF_MAX))
}

/// Memoized step execution for one run.
#[derive(Clone)]
pub struct StepJournal {
    db: DbHandle,
    bus: EventBus,
    run_id: String,
    scope: String,
    max_retries: u32,
    poll_interval: Duration,
}

impl StepJournal {
    pub fn new(db: DbHandle, bus: EventBus, run_id: &str) -> Self {
        Self {
            db,
            bus,
            run_id: run_id.to_string(),
            scope: String::new(),
            max_retries: 3,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Child journal whose keys live under `prefix`.
    pub fn scope(&self, prefix: &str) -> Self {
        let mut child = self.clone();
        child.scope = self.full_key(prefix);
        child
    }

    pub fn full_key(&self, key: &str) -> String {
        if self.scope.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.scope, key)
        }
    }

    async fn recorded<T: DeserializeOwned>(&self, full_key: &str) -> Result<Option<T>> {
        let run_id = self.run_id.clone();
        let k = full_key.to_string();
        let stored = self.db.call(move |db| db.get_step(&run_id, &k)).await?;
        stored
            .map(|raw| {
                serde_json::from_str(&raw)
                    .with_context(|| format!("Corrupt journal entry for step '{}'", full_key))
            })
            .transpose()
    }

    async fn record<T: Serialize + DeserializeOwned>(&self, full_key: &str, value: &T) -> Result<T> {
        let raw = serde_json::to_string(value)
            .with_context(|| format!("Failed to serialize step '{}'", full_key))?;
        let run_id = self.run_id.clone();
        let k = full_key.to_string();
        let stored = self
            .db
            .call(move |db| db.record_step(&run_id, &k, &raw))
            .await?;
        serde_json::from_str(&stored)
            .with_context(|| format!("Corrupt journal entry for step '{}'", full_key))
    }

    /// Run `f` at most once per key. Transient failures are retried with
    /// exponential backoff; any other error is returned and nothing is
    /// recorded, so the step runs again on resume.
    pub async fn run<T, F, Fut>(&self, key: &str, mut f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let full_key = self.full_key(key);
        if let Some(value) = self.recorded(&full_key).await? {
            tracing::trace!(run_id = %self.run_id, step = %full_key, "replayed");
            return Ok(value);
        }

        let mut attempt = 0u32;
        loop {
            match f().await {
                Ok(value) => return self.record(&full_key, &value).await,
                Err(e) if is_transient(&e) && attempt < self.max_retries => {
                    let delay = backoff_delay(attempt);
                    tracing::warn!(
                        run_id = %self.run_id,
                        step = %full_key,
                        attempt = attempt + 1,
                        "transient failure, retrying in {:?}: {:#}",
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Step '{}' failed", full_key));
                }
            }
        }
    }

    /// Suspend until an event named `name` with `correlation_id` arrives, or
    /// until `timeout` elapses from the first time this step ran. Returns
    /// `None` on timeout. The outcome is memoized under `key`.
    pub async fn wait_for_event(
        &self,
        key: &str,
        name: &str,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<Option<FlowEvent>> {
        let full_key = self.full_key(key);
        if let Some(outcome) = self.recorded::<Option<FlowEvent>>(&full_key).await? {
            return Ok(outcome);
        }

        let deadline: DateTime<Utc> = self
            .run(&format!("{}:deadline", key), || async {
                let now = Utc::now();
                Ok(TimeDelta::from_std(timeout)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC))
            })
            .await?;

        // Subscribe before the first store lookup so nothing slips between.
        let mut rx = self.bus.subscribe();
        let mut live = true;
        let outcome = loop {
            let (n, c) = (name.to_string(), correlation_id.to_string());
            if let Some(event) = self.db.call(move |db| db.find_flow_event(&n, &c)).await? {
                break Some(event);
            }

            let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                break None;
            }
            let nap = remaining.min(self.poll_interval);

            if live {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(event) if event.name == name && event.correlation_id == correlation_id => {
                            break Some(event);
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => live = false,
                    },
                    _ = tokio::time::sleep(nap) => {}
                }
            } else {
                tokio::time::sleep(nap).await;
            }
        };

        if outcome.is_none() {
            tracing::info!(run_id = %self.run_id, step = %full_key, %correlation_id, "wait timed out");
        }
        self.record(&full_key, &outcome).await
    }
}
