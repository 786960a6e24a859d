//! Aggregator fan-in: prompt construction, verdict parsing, and the
//! deterministic tie-break that bounds how far the LLM's judgment may
//! drift from the weighted evidence.

use crate::constants::{TIEBREAK_HIGH, TIEBREAK_MEDIUM};
use crate::models::{RiskLevel, Verdict, WorkerResult};
use crate::{Result, WopaError};

/// Deterministic aggregation over the successful checks: risk score is
/// the weight-weighted mean of risk levels (low=0, medium=0.5, high=1),
/// overall confidence the weight-weighted mean of confidences.
pub fn deterministic_tiebreak(result: &WorkerResult) -> (RiskLevel, f64) {
    let mut score = 0.0;
    let mut confidence = 0.0;
    for check in result.all_checks().filter(|c| c.is_success()) {
        score += check.weight * check.risk_level.score();
        confidence += check.weight * check.confidence;
    }
    let level = if score >= TIEBREAK_HIGH {
        RiskLevel::High
    } else if score >= TIEBREAK_MEDIUM {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };
    (level, confidence.clamp(0.0, 1.0))
}

/// The aggregation prompt: strict output instruction, the compact
/// per-check serialization, and the tie-break rule the model is asked
/// to follow.
pub fn build_prompt(result: &WorkerResult) -> String {
    let mut lines = String::new();
    for step in &result.steps {
        for check in &step.checks {
            let record = serde_json::json!({
                "step": step.step,
                "check_id": check.check_id,
                "analysis_agent": check.analysis_agent,
                "weight": check.weight,
                "risk_level": check.risk_level,
                "confidence": check.confidence,
                "explanation": check.explanation,
                "error": check.error,
            });
            lines.push_str(&record.to_string());
            lines.push('\n');
        }
    }
    format!(
        "You are the final risk aggregator for a security analysis pipeline. \
         Combine the per-check findings below into one verdict. Weight only \
         successful checks (error is null). Apply this rule: compute the \
         weighted average of risk levels (low=0, medium=0.5, high=1); label \
         high when it is >= 0.66, medium when >= 0.33, otherwise low. Overall \
         confidence is the weighted mean of per-check confidences.\n\
         Return strictly a JSON object of shape {{\"risk_level\": \"low|medium|high\", \
         \"confidence\": 0.0-1.0, \"reasons\": {{\"<step name>\": [<check records>]}}}} \
         with no other text.\n\nFindings:\n{lines}"
    )
}

/// Harder variant used for the single reparse retry.
pub fn reinforce_prompt(original: &str) -> String {
    format!(
        "{original}\n\nYour previous reply was not valid JSON. Respond with \
         JSON only: a single object with keys risk_level, confidence, reasons. \
         No prose, no code fences."
    )
}

/// Parse the aggregator's reply into a Verdict. Risk levels outside the
/// allowed set normalize by lexical match; confidence clamps to [0,1];
/// a missing or empty reasons map is a parse failure (it would violate
/// the completed-task invariant).
pub fn parse_verdict(reply: &str) -> Result<Verdict> {
    let trimmed = reply.trim();
    let candidate = extract_json_object(trimmed).ok_or_else(|| {
        WopaError::ProviderProtocol("aggregator reply contained no JSON object".to_string())
    })?;
    let value: serde_json::Value = serde_json::from_str(candidate)
        .map_err(|e| WopaError::ProviderProtocol(format!("aggregator reply did not parse: {e}")))?;

    let risk_raw = value
        .get("risk_level")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            WopaError::ProviderProtocol("aggregator reply missing risk_level".to_string())
        })?;
    let risk_level = RiskLevel::from_lexical(risk_raw);

    let confidence = value
        .get("confidence")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| {
            WopaError::ProviderProtocol("aggregator reply missing confidence".to_string())
        })?
        .clamp(0.0, 1.0);

    let reasons = value
        .get("reasons")
        .and_then(|v| v.as_object())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| {
            WopaError::ProviderProtocol("aggregator reply missing reasons".to_string())
        })?
        .clone();

    Ok(Verdict {
        risk_level,
        confidence,
        reasons,
    })
}

/// Bound the LLM verdict by the deterministic tie-break: a disagreement
/// of more than one level is overridden and annotated.
pub fn reconcile(mut verdict: Verdict, deterministic: RiskLevel) -> Verdict {
    let distance = (verdict.risk_level.ordinal() - deterministic.ordinal()).abs();
    if distance > 1 {
        verdict.risk_level = deterministic;
        verdict.reasons.insert(
            "override".to_string(),
            serde_json::json!("deterministic_tiebreak"),
        );
    }
    verdict
}

fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Check, StepResult, WorkerName};

    fn check(id: &str, weight: f64, risk: RiskLevel, confidence: f64) -> Check {
        Check {
            check_id: id.to_string(),
            analysis_agent: "test".to_string(),
            weight,
            risk_level: risk,
            confidence,
            explanation: String::new(),
            error: None,
        }
    }

    /// The mixed-risk link example: high-risk HTML under low-risk
    /// siblings stays below the medium threshold.
    fn mixed_link_result() -> WorkerResult {
        WorkerResult {
            worker_name: WorkerName::Link,
            steps: vec![
                StepResult {
                    step: "Page_Accessibility".to_string(),
                    checks: vec![check("page", 0.2, RiskLevel::Low, 1.0)],
                },
                StepResult {
                    step: "Content_Analysis".to_string(),
                    checks: vec![
                        check("html", 0.255, RiskLevel::High, 0.85),
                        check("s0", 0.015, RiskLevel::Low, 0.9),
                        check("s1", 0.015, RiskLevel::Low, 0.9),
                        check("s2", 0.015, RiskLevel::Low, 0.9),
                    ],
                },
                StepResult {
                    step: "LLM_Link_Suspiciousness".to_string(),
                    checks: vec![check("overall", 0.5, RiskLevel::Low, 0.95)],
                },
            ],
        }
    }

    #[test]
    fn tiebreak_matches_documented_arithmetic() {
        let (level, confidence) = deterministic_tiebreak(&mixed_link_result());
        // 0.255*1 + everything else at 0 = 0.255 < 0.33.
        assert_eq!(level, RiskLevel::Low);
        let expected =
            0.2 * 1.0 + 0.255 * 0.85 + 3.0 * 0.015 * 0.9 + 0.5 * 0.95;
        assert!((confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn tiebreak_is_deterministic() {
        let result = mixed_link_result();
        let a = deterministic_tiebreak(&result);
        let b = deterministic_tiebreak(&result);
        assert_eq!(a.0, b.0);
        assert!((a.1 - b.1).abs() < 1e-9);
    }

    #[test]
    fn tiebreak_thresholds() {
        let high = WorkerResult {
            worker_name: WorkerName::Text,
            steps: vec![StepResult {
                step: "S".to_string(),
                checks: vec![check("c", 1.0, RiskLevel::High, 0.9)],
            }],
        };
        assert_eq!(deterministic_tiebreak(&high).0, RiskLevel::High);

        let medium = WorkerResult {
            worker_name: WorkerName::Text,
            steps: vec![StepResult {
                step: "S".to_string(),
                checks: vec![check("c", 1.0, RiskLevel::Medium, 0.9)],
            }],
        };
        assert_eq!(deterministic_tiebreak(&medium).0, RiskLevel::Medium);
    }

    #[test]
    fn failed_checks_do_not_contribute() {
        let result = WorkerResult {
            worker_name: WorkerName::Text,
            steps: vec![StepResult {
                step: "S".to_string(),
                checks: vec![
                    check("ok", 1.0, RiskLevel::Low, 0.8),
                    Check::failed("bad", "test", 0.5, "timeout".to_string()),
                ],
            }],
        };
        let (level, confidence) = deterministic_tiebreak(&result);
        assert_eq!(level, RiskLevel::Low);
        assert!((confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn parse_accepts_strict_json() {
        let verdict = parse_verdict(
            r#"{"risk_level": "low", "confidence": 0.9,
                "reasons": {"Step1": [{"check_id": "text_1", "risk_level": "low",
                                        "confidence": 0.9, "weight": 1.0}]}}"#,
        )
        .unwrap();
        assert_eq!(verdict.risk_level, RiskLevel::Low);
        assert!(verdict.is_well_formed());
    }

    #[test]
    fn parse_normalizes_out_of_set_risk_levels() {
        let verdict = parse_verdict(
            r#"{"risk_level": "HIGH RISK", "confidence": 0.7, "reasons": {"s": []}}"#,
        )
        .unwrap();
        assert_eq!(verdict.risk_level, RiskLevel::High);

        let verdict = parse_verdict(
            r#"{"risk_level": "uncertain", "confidence": 0.7, "reasons": {"s": []}}"#,
        )
        .unwrap();
        assert_eq!(verdict.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn parse_clamps_confidence() {
        let verdict =
            parse_verdict(r#"{"risk_level": "low", "confidence": 1.7, "reasons": {"s": []}}"#)
                .unwrap();
        assert!((verdict.confidence - 1.0).abs() < 1e-12);
    }

    #[test]
    fn parse_rejects_non_json_and_missing_reasons() {
        assert!(parse_verdict("not json").is_err());
        assert!(parse_verdict(r#"{"risk_level": "low", "confidence": 0.5}"#).is_err());
        assert!(
            parse_verdict(r#"{"risk_level": "low", "confidence": 0.5, "reasons": {}}"#).is_err()
        );
    }

    #[test]
    fn parse_unwraps_fenced_json() {
        let verdict = parse_verdict(
            "```json\n{\"risk_level\": \"medium\", \"confidence\": 0.6, \"reasons\": {\"s\": []}}\n```",
        )
        .unwrap();
        assert_eq!(verdict.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn two_level_disagreement_is_overridden_and_annotated() {
        let mut reasons = serde_json::Map::new();
        reasons.insert("s".to_string(), serde_json::json!([]));
        let llm_verdict = Verdict {
            risk_level: RiskLevel::High,
            confidence: 0.8,
            reasons,
        };
        let reconciled = reconcile(llm_verdict, RiskLevel::Low);
        assert_eq!(reconciled.risk_level, RiskLevel::Low);
        assert_eq!(
            reconciled.reasons.get("override"),
            Some(&serde_json::json!("deterministic_tiebreak"))
        );
    }

    #[test]
    fn one_level_disagreement_stands() {
        let mut reasons = serde_json::Map::new();
        reasons.insert("s".to_string(), serde_json::json!([]));
        let llm_verdict = Verdict {
            risk_level: RiskLevel::Medium,
            confidence: 0.8,
            reasons,
        };
        let reconciled = reconcile(llm_verdict.clone(), RiskLevel::Low);
        assert_eq!(reconciled.risk_level, RiskLevel::Medium);
        assert!(reconciled.reasons.get("override").is_none());
    }

    #[test]
    fn prompt_carries_every_check_and_the_rule() {
        let prompt = build_prompt(&mixed_link_result());
        assert!(prompt.contains("\"check_id\":\"html\""));
        assert!(prompt.contains("\"check_id\":\"overall\""));
        assert!(prompt.contains("0.66"));
        assert!(prompt.contains("JSON object"));
    }
}
