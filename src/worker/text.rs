use super::checks::parse_check_reply;
use super::WorkerContext;
use crate::models::{Check, StepResult, WorkerName, WorkerResult};
use crate::worker::weights;
use crate::Result;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TextPayload {
    pub message: String,
}

/// Text worker: one LLM classification check over the message.
pub async fn run(ctx: &WorkerContext, payload: TextPayload) -> Result<WorkerResult> {
    let reply = ctx
        .provider
        .chat_complete(classification_prompt(&payload.message))
        .await?;
    let finding = parse_check_reply(&reply);

    let mut steps = vec![StepResult {
        step: "Text_Classification".to_string(),
        checks: vec![Check {
            check_id: "text_1".to_string(),
            analysis_agent: "LLM_text_classifier".to_string(),
            weight: 1.0,
            risk_level: finding.risk_level,
            confidence: finding.confidence,
            explanation: finding.explanation,
            error: None,
        }],
    }];
    weights::renormalize(&mut steps);

    Ok(WorkerResult {
        worker_name: WorkerName::Text,
        steps,
    })
}

fn classification_prompt(message: &str) -> String {
    format!(
        "You are a security analyst. Classify the following message as benign, \
         suspicious, or malicious (phishing, scams, social engineering, malware \
         lures). Respond with JSON only: {{\"classification\": \"benign|suspicious|malicious\", \
         \"confidence\": 0.0-1.0, \"reasoning\": \"...\", \"suspicious_indicators\": [\"...\"]}}.\n\n\
         Message:\n{message}"
    )
}
