//! Step execution machinery shared by all worker compositions.
//!
//! A step is a list of prepared checks run in parallel under a bounded
//! fan-out. A check that raises never escapes: it is recorded with
//! `risk_level=unknown, confidence=0` and its error kind.

use crate::models::{Check, RiskLevel, StepResult};
use crate::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

/// What a successful check produces.
#[derive(Debug, Clone)]
pub struct CheckFinding {
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub explanation: String,
}

type CheckFuture = Pin<Box<dyn Future<Output = Result<CheckFinding>> + Send>>;

/// A check ready to run: identity, declared weight, and the work.
pub struct PendingCheck {
    pub check_id: String,
    pub analysis_agent: String,
    pub weight: f64,
    pub run: CheckFuture,
}

impl PendingCheck {
    pub fn new<F>(check_id: &str, analysis_agent: &str, weight: f64, run: F) -> Self
    where
        F: Future<Output = Result<CheckFinding>> + Send + 'static,
    {
        Self {
            check_id: check_id.to_string(),
            analysis_agent: analysis_agent.to_string(),
            weight,
            run: Box::pin(run),
        }
    }
}

/// Run one step's checks in parallel, at most `parallel_cap` at a time.
/// Results come back in declaration order regardless of completion
/// order, so identical inputs produce identical records.
pub async fn run_step(step_name: &str, checks: Vec<PendingCheck>, parallel_cap: usize) -> StepResult {
    let semaphore = Arc::new(Semaphore::new(parallel_cap.max(1)));
    let mut join_set = JoinSet::new();

    let mut identities = Vec::with_capacity(checks.len());
    for (index, check) in checks.into_iter().enumerate() {
        identities.push((check.check_id.clone(), check.analysis_agent.clone(), check.weight));
        let semaphore = Arc::clone(&semaphore);
        let run = check.run;
        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            (index, run.await)
        });
    }

    let mut outcomes: Vec<Option<Result<CheckFinding>>> =
        identities.iter().map(|_| None).collect();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((index, outcome)) => outcomes[index] = Some(outcome),
            Err(e) => warn!(step = step_name, "check task panicked: {e}"),
        }
    }

    let checks = identities
        .into_iter()
        .zip(outcomes)
        .map(|((check_id, analysis_agent, weight), outcome)| match outcome {
            Some(Ok(finding)) => Check {
                check_id,
                analysis_agent,
                weight,
                risk_level: finding.risk_level,
                confidence: finding.confidence.clamp(0.0, 1.0),
                explanation: finding.explanation,
                error: None,
            },
            Some(Err(e)) => {
                warn!(step = step_name, check = %check_id, "check failed: {e}");
                Check::failed(&check_id, &analysis_agent, weight, e.kind().to_string())
            }
            None => Check::failed(&check_id, &analysis_agent, weight, "internal".to_string()),
        })
        .collect();

    StepResult {
        step: step_name.to_string(),
        checks,
    }
}

/// Parse an LLM reply into a finding. The model is instructed to answer
/// with `{"risk_level": ..., "confidence": ..., "explanation": ...}`;
/// replies that are not valid JSON degrade to a lexical read of the
/// text rather than failing the check.
pub fn parse_check_reply(reply: &str) -> CheckFinding {
    let trimmed = reply.trim();
    let candidate = extract_json_object(trimmed).unwrap_or(trimmed);

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(candidate) {
        let risk_source = value
            .get("risk_level")
            .or_else(|| value.get("classification"))
            .and_then(|v| v.as_str())
            .unwrap_or("medium");
        let risk_level = classification_to_risk(risk_source);
        let confidence = value
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);
        let explanation = value
            .get("explanation")
            .or_else(|| value.get("reasoning"))
            .and_then(|v| v.as_str())
            .unwrap_or(trimmed)
            .to_string();
        return CheckFinding {
            risk_level,
            confidence,
            explanation,
        };
    }

    CheckFinding {
        risk_level: RiskLevel::from_lexical(trimmed),
        confidence: 0.5,
        explanation: trimmed.to_string(),
    }
}

/// Classification vocabulary maps onto the risk scale; anything else
/// goes through the lexical fallback.
fn classification_to_risk(label: &str) -> RiskLevel {
    match label.to_lowercase().as_str() {
        "benign" | "safe" | "clean" => RiskLevel::Low,
        "suspicious" => RiskLevel::Medium,
        "malicious" | "phishing" | "malware" => RiskLevel::High,
        other => RiskLevel::from_lexical(other),
    }
}

/// Models often wrap JSON in prose or code fences; take the outermost
/// balanced object if one exists.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}
