use anyhow::Result;
use async_trait::async_trait;
use forgeflow_common::{CtaOutcome, CtaRequest, FeaturePhase};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ── Notification types ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum Notification {
    RunStarted {
        run_id: String,
        prompt: String,
        repo: String,
    },
    PhaseStarted {
        run_id: String,
        phase: FeaturePhase,
    },
    PhasePassed {
        run_id: String,
        phase: FeaturePhase,
    },
    /// `detail` carries the tail of the last gate or agent output.
    PhaseFailed {
        run_id: String,
        phase: FeaturePhase,
        detail: String,
    },
    CtaRequested {
        run_id: String,
        cta_id: String,
        request: CtaRequest,
    },
    CtaResolved {
        cta_id: String,
        outcome: CtaOutcome,
    },
    RunCompleted {
        run_id: String,
        pr_url: String,
    },
    RunFailed {
        run_id: String,
        reason: String,
    },
}

impl Notification {
    pub fn run_id(&self) -> Option<&str> {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::PhaseStarted { run_id, .. }
            | Self::PhasePassed { run_id, .. }
            | Self::PhaseFailed { run_id, .. }
            | Self::CtaRequested { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. } => Some(run_id),
            Self::CtaResolved { .. } => None,
        }
    }
}

/// Publish side of the chat/notification surface.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, notification: &Notification) -> Result<()>;
}

/// Writes every notification to the tracing log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(&self, notification: &Notification) -> Result<()> {
        match notification {
            Notification::CtaRequested {
                run_id,
                cta_id,
                request,
            } => {
                tracing::info!(
                    %run_id,
                    %cta_id,
                    kind = %request.kind(),
                    "awaiting human feedback: {} (answer with `forgeflow respond --cta-id {}`)",
                    request.headline(),
                    cta_id
                );
            }
            Notification::PhaseFailed {
                run_id,
                phase,
                detail,
            } => {
                tracing::error!(%run_id, %phase, "phase failed: {}", detail);
            }
            Notification::RunFailed { run_id, reason } => {
                tracing::error!(%run_id, "run failed: {}", reason);
            }
            other => match serde_json::to_string(other) {
                Ok(json) => tracing::info!(notification = %json, "notify"),
                Err(e) => tracing::warn!("Failed to serialize notification: {}", e),
            },
        }
        Ok(())
    }
}

/// Fans notifications out as JSON strings to in-process subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<String>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn publish(&self, notification: &Notification) -> Result<()> {
        broadcast_message(&self.tx, notification);
        Ok(())
    }
}

pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &Notification) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(json); // Ignore error if no receivers
        }
        Err(e) => {
            tracing::warn!("Failed to serialize notification: {}", e);
        }
    }
}

/// Keep the last `max` characters of `text`, marking the cut.
pub fn tail(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    let skipped: String = text.chars().skip(count - max).collect();
    format!("...[truncated]\n{}", skipped)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use forgeflow_common::CtaResponse;

    #[test]
    fn test_notification_serialization_shape() {
        let msg = Notification::PhaseStarted {
            run_id: "r1".into(),
            phase: FeaturePhase::Judging,
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "PhaseStarted");
        assert_eq!(json["data"]["run_id"], "r1");
        assert_eq!(json["data"]["phase"], "judging");
    }

    #[test]
    fn test_cta_resolved_roundtrip() {
        let msg = Notification::CtaResolved {
            cta_id: "c1".into(),
            outcome: CtaOutcome::Responded {
                response: CtaResponse::Approval {
                    approved: true,
                    reason: None,
                },
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: Notification = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.run_id(), None);
    }

    #[tokio::test]
    async fn test_broadcast_notifier_delivers_json() {
        let notifier = BroadcastNotifier::new(16);
        let mut rx = notifier.subscribe();
        notifier
            .publish(&Notification::RunFailed {
                run_id: "r1".into(),
                reason: "boom".into(),
            })
            .await
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert!(received.contains("\"RunFailed\""));
        assert!(received.contains("boom"));
    }

    #[tokio::test]
    async fn test_broadcast_without_receivers_is_ok() {
        let notifier = BroadcastNotifier::new(4);
        assert!(
            notifier
                .publish(&Notification::RunCompleted {
                    run_id: "r".into(),
                    pr_url: "u".into(),
                })
                .await
                .is_ok()
        );
    }

    #[test]
    fn test_tail() {
        assert_eq!(tail("short", 10), "short");
        let t = tail("abcdefghij", 3);
        assert!(t.ends_with("hij"));
        assert!(t.starts_with("...[truncated]"));
    }
}
