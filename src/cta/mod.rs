//! Human feedback ("call to action") protocol.
//!
//! A CTA is a rendezvous keyed by a generated id. The request side persists a
//! `CtaEvent` and publishes it to the notification surface, then waits on the
//! event bus for a `cta.response` event carrying the same id. The wait is a
//! durable step with a persisted deadline, so the run may be suspended for
//! days and resumed by a different process.
//!
//! Outcomes:
//! - a valid response resolves to [`CtaOutcome::Responded`]
//! - the deadline passing resolves to [`CtaOutcome::TimedOut`], never an error
//! - a response of the wrong shape is a [`CtaError::ProtocolViolation`]; the
//!   raw payload and the validation error are kept on the event for audit

use anyhow::Result;
use forgeflow_common::{CtaOutcome, CtaRequest, CtaResponse};

use crate::context::RunContext;
use crate::durable::{EventBus, StepJournal};
use crate::errors::CtaError;
use crate::factory::db::DbHandle;
use crate::factory::models::{FlowEvent, NewCtaEvent};
use crate::factory::notify::Notification;

/// Event name carrying a human's answer. Correlated by CTA id.
pub const CTA_RESPONSE_EVENT: &str = "cta.response";

/// Where a CTA was raised from.
#[derive(Debug, Clone)]
pub struct CtaSite {
    pub run_id: String,
    pub phase_result_id: String,
    pub invocation_id: Option<String>,
    pub tool_call_id: Option<String>,
}

/// Ask a human and suspend until they answer or the configured timeout
/// elapses. All steps are memoized in `journal`, which must be unique to
/// this request.
pub async fn request_human_feedback(
    ctx: &RunContext,
    journal: &StepJournal,
    site: &CtaSite,
    request: CtaRequest,
) -> Result<CtaOutcome> {
    request
        .validate()
        .map_err(|e| CtaError::InvalidRequest(e.to_string()))?;

    let cta_id: String = journal
        .run("cta-id", || async { Ok(uuid::Uuid::new_v4().to_string()) })
        .await?;

    journal
        .run("cta-request", || async {
            let new = NewCtaEvent {
                id: cta_id.clone(),
                run_id: site.run_id.clone(),
                phase_result_id: site.phase_result_id.clone(),
                invocation_id: site.invocation_id.clone(),
                tool_call_id: site.tool_call_id.clone(),
                request: request.clone(),
            };
            ctx.db.call(move |db| db.create_cta_event(&new)).await?;
            tracing::info!(run_id = %site.run_id, %cta_id, kind = %request.kind(), "CTA requested");
            ctx.notify(Notification::CtaRequested {
                run_id: site.run_id.clone(),
                cta_id: cta_id.clone(),
                request: request.clone(),
            })
            .await;
            Ok(())
        })
        .await?;

    let event = journal
        .wait_for_event("cta-wait", CTA_RESPONSE_EVENT, &cta_id, ctx.cta_timeout())
        .await?;

    let outcome = match event {
        None => {
            let id = cta_id.clone();
            ctx.db.call(move |db| db.timeout_cta_event(&id)).await?;
            tracing::warn!(run_id = %site.run_id, %cta_id, "CTA timed out");
            CtaOutcome::TimedOut
        }
        Some(event) => {
            let raw = event.payload.to_string();
            match parse_response(&cta_id, &request, event.payload) {
                Ok(response) => {
                    let (id, stored) = (cta_id.clone(), response.clone());
                    ctx.db
                        .call(move |db| db.complete_cta_event(&id, &stored, &raw))
                        .await?;
                    tracing::info!(run_id = %site.run_id, %cta_id, "CTA answered");
                    CtaOutcome::Responded { response }
                }
                Err(violation) => {
                    let (id, detail) = (cta_id.clone(), violation.to_string());
                    ctx.db
                        .call(move |db| db.record_cta_protocol_error(&id, &raw, &detail))
                        .await?;
                    tracing::error!(run_id = %site.run_id, %cta_id, "{}", violation);
                    return Err(violation.into());
                }
            }
        }
    };

    ctx.notify(Notification::CtaResolved {
        cta_id,
        outcome: outcome.clone(),
    })
    .await;
    Ok(outcome)
}

fn parse_response(
    cta_id: &str,
    request: &CtaRequest,
    payload: serde_json::Value,
) -> Result<CtaResponse, CtaError> {
    let violation = |detail: String| CtaError::ProtocolViolation {
        cta_id: cta_id.to_string(),
        expected: request.kind(),
        detail,
    };
    let response: CtaResponse =
        serde_json::from_value(payload).map_err(|e| violation(e.to_string()))?;
    response
        .validate_against(request)
        .map_err(|e| violation(e.to_string()))?;
    Ok(response)
}

/// Deliver a human's answer. The payload is forwarded as-is; validation
/// happens on the waiting side so malformed answers are audited there.
pub async fn respond(
    db: &DbHandle,
    bus: &EventBus,
    cta_id: &str,
    payload: serde_json::Value,
) -> Result<()> {
    let id = cta_id.to_string();
    let event = db
        .call(move |db| db.get_cta_event(&id))
        .await?
        .ok_or_else(|| CtaError::NotFound(cta_id.to_string()))?;
    if event.is_resolved() {
        return Err(CtaError::AlreadyResolved(cta_id.to_string()).into());
    }
    bus.send_event(FlowEvent::new(
        &event.run_id,
        CTA_RESPONSE_EVENT,
        cta_id,
        payload,
    ))
    .await?;
    tracing::info!(run_id = %event.run_id, %cta_id, "CTA response sent");
    Ok(())
}
