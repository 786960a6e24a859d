use super::checks::{parse_check_reply, run_step, PendingCheck};
use super::{ensure_llm_survived, ensure_step_survived, WorkerContext};
use crate::constants::MAX_VISION_IMAGES;
use crate::models::{Check, ImagePayload, RiskLevel, StepResult, WorkerName, WorkerResult};
use crate::worker::weights;
use crate::Result;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppBehaviorPayload {
    pub app_ref: String,
    pub instructions: String,
}

const STEP_RUN: &str = "Emulator_Run";
const STEP_BEHAVIOR: &str = "Behavior_Analysis";

const WEIGHT_RUN: f64 = 0.2;
// Behavior step weight 0.8, split between the vision pass over
// screenshots and the chat pass over the event stream.
const WEIGHT_VISUALS: f64 = 0.48;
const WEIGHT_EVENTS: f64 = 0.32;

/// App behavior worker: drive the app in an emulator, then judge the
/// captured screenshots with the vision model and the event stream with
/// the chat model. The emulator is a required backend.
pub async fn run(ctx: &WorkerContext, payload: AppBehaviorPayload) -> Result<WorkerResult> {
    let emulator_run = ctx
        .provider
        .run_app(payload.app_ref.clone(), payload.instructions.clone())
        .await?;

    let mut steps = vec![StepResult {
        step: STEP_RUN.to_string(),
        checks: vec![Check {
            check_id: "emulator_run".to_string(),
            analysis_agent: "emulator_driver".to_string(),
            weight: WEIGHT_RUN,
            risk_level: RiskLevel::Low,
            confidence: 1.0,
            explanation: format!(
                "Captured {} screenshots and {} events (session {})",
                emulator_run.visuals.screenshots.len(),
                emulator_run.events.len(),
                emulator_run.task_id
            ),
            error: None,
        }],
    }];

    let images: Vec<ImagePayload> = emulator_run
        .visuals
        .screenshots
        .iter()
        .take(MAX_VISION_IMAGES)
        .map(|b64| ImagePayload {
            mime: "image/png".to_string(),
            base64: b64.clone(),
        })
        .collect();

    let mut behavior_checks = Vec::new();
    if !images.is_empty() {
        let provider = ctx.provider.clone();
        let prompt = visuals_prompt(&payload.app_ref);
        behavior_checks.push(PendingCheck::new(
            "vision_screenshots",
            "LLM_vision_screen_analyzer",
            WEIGHT_VISUALS,
            async move {
                let reply = provider.vision_complete(prompt, images).await?;
                Ok(parse_check_reply(&reply))
            },
        ));
    }
    let provider = ctx.provider.clone();
    let prompt = events_prompt(&payload.app_ref, &emulator_run.events);
    behavior_checks.push(PendingCheck::new(
        "event_analysis",
        "LLM_event_analyzer",
        WEIGHT_EVENTS,
        async move {
            let reply = provider.chat_complete(prompt).await?;
            Ok(parse_check_reply(&reply))
        },
    ));

    let behavior = run_step(STEP_BEHAVIOR, behavior_checks, ctx.config.worker.parallel_checks).await;
    ensure_step_survived(&behavior, "App behavior analysis failed")?;
    steps.push(behavior);

    ensure_llm_survived(&steps)?;
    weights::renormalize(&mut steps);

    Ok(WorkerResult {
        worker_name: WorkerName::AppBehavior,
        steps,
    })
}

fn visuals_prompt(app_ref: &str) -> String {
    format!(
        "You are a mobile security analyst. These screenshots were captured while \
         driving the app `{app_ref}` in an emulator. Look for phishing overlays, \
         fake login screens, permission abuse prompts, and deceptive UI. Respond \
         with JSON only: {{\"risk_level\": \"low|medium|high\", \"confidence\": 0.0-1.0, \
         \"explanation\": \"...\"}}."
    )
}

fn events_prompt(app_ref: &str, events: &[String]) -> String {
    format!(
        "You are a mobile security analyst. These are behavioral events recorded \
         while driving the app `{app_ref}` in an emulator. Judge whether the \
         behavior is malicious (exfiltration, premium SMS, hidden installs, \
         C2 traffic). Respond with JSON only: {{\"risk_level\": \"low|medium|high\", \
         \"confidence\": 0.0-1.0, \"explanation\": \"...\"}}.\n\nEvents:\n{}",
        events.join("\n")
    )
}
