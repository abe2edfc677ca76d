//! `forgeflow respond`: deliver a human answer to a waiting CTA.

use anyhow::{Result, bail};
use forgeflow::config::ForgeflowConfig;
use forgeflow::cta;
use forgeflow::durable::EventBus;
use forgeflow_common::CtaResponse;

use super::open_db;

/// One answer from the command-line flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Approve,
    Reject(Option<String>),
    Text(String),
    Choose(String),
}

impl Answer {
    pub fn from_flags(
        approve: bool,
        reject: bool,
        reason: Option<String>,
        text: Option<String>,
        choose: Option<String>,
    ) -> Result<Self> {
        match (approve, reject, text, choose) {
            (true, false, None, None) => Ok(Self::Approve),
            (false, true, None, None) => Ok(Self::Reject(reason)),
            (false, false, Some(text), None) => Ok(Self::Text(text)),
            (false, false, None, Some(id)) => Ok(Self::Choose(id)),
            _ => bail!("Pass exactly one of --approve, --reject, --text or --choose"),
        }
    }

    pub fn into_response(self) -> CtaResponse {
        match self {
            Self::Approve => CtaResponse::Approval {
                approved: true,
                reason: None,
            },
            Self::Reject(reason) => CtaResponse::Approval {
                approved: false,
                reason,
            },
            Self::Text(text) => CtaResponse::Text { text },
            Self::Choose(selected_id) => CtaResponse::Choice { selected_id },
        }
    }
}

pub async fn cmd_respond(config: &ForgeflowConfig, cta_id: &str, answer: Answer) -> Result<()> {
    let db = open_db(config)?;
    let bus = EventBus::new(db.clone());
    let payload = serde_json::to_value(answer.into_response())?;
    cta::respond(&db, &bus, cta_id, payload).await?;
    println!("Response recorded for CTA {}", cta_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answer_from_flags() {
        assert_eq!(
            Answer::from_flags(true, false, None, None, None).unwrap(),
            Answer::Approve
        );
        assert_eq!(
            Answer::from_flags(false, true, Some("too risky".into()), None, None).unwrap(),
            Answer::Reject(Some("too risky".into()))
        );
        assert_eq!(
            Answer::from_flags(false, false, None, None, Some("B".into())).unwrap(),
            Answer::Choose("B".into())
        );
        assert!(Answer::from_flags(true, true, None, None, None).is_err());
        assert!(Answer::from_flags(false, false, None, None, None).is_err());
    }

    #[test]
    fn test_reject_payload_matches_wire_shape() {
        let payload =
            serde_json::to_value(Answer::Reject(Some("no".into())).into_response()).unwrap();
        assert_eq!(
            payload,
            serde_json::json!({"kind": "approval", "approved": false, "reason": "no"})
        );
    }
}
