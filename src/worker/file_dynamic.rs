use super::checks::{parse_check_reply, run_step, PendingCheck};
use super::{ensure_llm_survived, WorkerContext};
use crate::models::{Check, RiskLevel, StepResult, WorkerName, WorkerResult};
use crate::worker::weights;
use crate::Result;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileDynamicPayload {
    pub file_ref: String,
}

const STEP_DETONATION: &str = "Sandbox_Detonation";
const STEP_CLASSIFICATION: &str = "LLM_Behavior_Classification";

const WEIGHT_DETONATION: f64 = 0.3;
const WEIGHT_CLASSIFICATION: f64 = 0.7;

/// Keeps the behavior-classification prompt bounded.
const MAX_LOG_PROMPT_BYTES: usize = 16 * 1024;

/// File dynamic worker: detonate in the sandbox, then classify the
/// observed behavior. The sandbox is a required backend: unavailability
/// fails the worker before any step runs.
pub async fn run(ctx: &WorkerContext, payload: FileDynamicPayload) -> Result<WorkerResult> {
    let sandbox_run = ctx.provider.run_file(payload.file_ref.clone()).await?;

    let mut steps = vec![StepResult {
        step: STEP_DETONATION.to_string(),
        checks: vec![Check {
            check_id: "sandbox_detonation".to_string(),
            analysis_agent: "sandbox_driver".to_string(),
            weight: WEIGHT_DETONATION,
            risk_level: RiskLevel::Low,
            confidence: 1.0,
            explanation: format!("Sandbox run produced {} log lines", sandbox_run.logs.len()),
            error: None,
        }],
    }];

    let prompt = behavior_prompt(&payload.file_ref, &sandbox_run.logs);
    let provider = ctx.provider.clone();
    steps.push(
        run_step(
            STEP_CLASSIFICATION,
            vec![PendingCheck::new(
                "behavior_classification",
                "LLM_behavior_classifier",
                WEIGHT_CLASSIFICATION,
                async move {
                    let reply = provider.chat_complete(prompt).await?;
                    Ok(parse_check_reply(&reply))
                },
            )],
            ctx.config.worker.parallel_checks,
        )
        .await,
    );

    ensure_llm_survived(&steps)?;
    weights::renormalize(&mut steps);

    Ok(WorkerResult {
        worker_name: WorkerName::FileDynamic,
        steps,
    })
}

fn behavior_prompt(file_ref: &str, logs: &[String]) -> String {
    let mut joined = logs.join("\n");
    if joined.len() > MAX_LOG_PROMPT_BYTES {
        let mut cut = MAX_LOG_PROMPT_BYTES;
        while !joined.is_char_boundary(cut) {
            cut -= 1;
        }
        joined.truncate(cut);
    }
    format!(
        "You are a malware analyst. These are sandbox execution logs for the \
         file `{file_ref}`. Judge whether the observed behavior is malicious \
         (persistence, C2 traffic, credential theft, ransomware patterns). \
         Respond with JSON only: {{\"risk_level\": \"low|medium|high\", \
         \"confidence\": 0.0-1.0, \"explanation\": \"...\"}}.\n\nLogs:\n{joined}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_embeds_logs_and_caps_size() {
        let logs = vec!["created HKLM\\Run key".to_string(), "connect 1.2.3.4".to_string()];
        let prompt = behavior_prompt("x.bin", &logs);
        assert!(prompt.contains("created HKLM"));
        assert!(prompt.contains("connect 1.2.3.4"));

        let huge = vec!["x".repeat(64 * 1024)];
        let prompt = behavior_prompt("x.bin", &huge);
        assert!(prompt.len() < 64 * 1024);
    }

    #[test]
    fn payload_is_strict() {
        let bad: std::result::Result<FileDynamicPayload, _> =
            serde_json::from_value(serde_json::json!({"file_ref": "x", "timeout": 5}));
        assert!(bad.is_err());
    }
}
