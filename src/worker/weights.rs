//! Check weight assignment and renormalization.
//!
//! Every worker declares per-step base weights. When checks fail, their
//! weight is first redistributed proportionally to surviving siblings
//! within the same step; a step with no survivors then loses its weight
//! to a global renormalization so the surviving checks always sum to 1.

use crate::models::StepResult;

/// Split a Content_Analysis-style step weight across one HTML artifact
/// and `script_count` scripts. The HTML takes `html_share` of the step;
/// the remainder splits equally across scripts, each clipped to at
/// least `min_script_weight`. With no scripts the HTML carries the
/// whole step.
pub fn split_artifact_weights(
    step_weight: f64,
    script_count: usize,
    html_share: f64,
    min_script_weight: f64,
) -> (f64, Vec<f64>) {
    if script_count == 0 {
        return (step_weight, Vec::new());
    }
    let html = html_share * step_weight;
    let per_script =
        ((1.0 - html_share) * step_weight / script_count as f64).max(min_script_weight);
    (html, vec![per_script; script_count])
}

/// Renormalize check weights in place after execution so the weights of
/// the successful checks sum to 1. Failed checks keep their declared
/// weight on the record; only surviving weights are rescaled.
pub fn renormalize(steps: &mut [StepResult]) {
    // Sibling redistribution: a failed check's weight moves
    // proportionally onto the surviving checks of the same step.
    for step in steps.iter_mut() {
        let surviving: f64 = step
            .checks
            .iter()
            .filter(|c| c.is_success())
            .map(|c| c.weight)
            .sum();
        let lost: f64 = step
            .checks
            .iter()
            .filter(|c| !c.is_success())
            .map(|c| c.weight)
            .sum();
        if surviving > 0.0 && lost > 0.0 {
            let scale = (surviving + lost) / surviving;
            for check in step.checks.iter_mut().filter(|c| c.is_success()) {
                check.weight *= scale;
            }
        }
    }

    // Global pass: absorbs fully failed steps and any declared weights
    // that did not sum to exactly 1.
    let total: f64 = steps
        .iter()
        .flat_map(|s| s.checks.iter())
        .filter(|c| c.is_success())
        .map(|c| c.weight)
        .sum();
    if total > 0.0 {
        for step in steps.iter_mut() {
            for check in step.checks.iter_mut().filter(|c| c.is_success()) {
                check.weight /= total;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{HTML_WEIGHT_SHARE, MIN_SCRIPT_WEIGHT};
    use crate::models::{Check, RiskLevel};

    fn ok_check(id: &str, weight: f64) -> Check {
        Check {
            check_id: id.to_string(),
            analysis_agent: "test".to_string(),
            weight,
            risk_level: RiskLevel::Low,
            confidence: 0.9,
            explanation: String::new(),
            error: None,
        }
    }

    fn surviving_sum(steps: &[StepResult]) -> f64 {
        steps
            .iter()
            .flat_map(|s| s.checks.iter())
            .filter(|c| c.is_success())
            .map(|c| c.weight)
            .sum()
    }

    #[test]
    fn link_split_matches_documented_example() {
        // 0.3 step weight, 3 scripts: HTML 0.85*0.3 = 0.255, scripts
        // split the remaining 0.045 as 0.015 each.
        let (html, scripts) = split_artifact_weights(0.3, 3, HTML_WEIGHT_SHARE, MIN_SCRIPT_WEIGHT);
        assert!((html - 0.255).abs() < 1e-12);
        assert_eq!(scripts.len(), 3);
        for w in scripts {
            assert!((w - 0.015).abs() < 1e-12);
        }
    }

    #[test]
    fn no_scripts_gives_html_the_whole_step() {
        let (html, scripts) = split_artifact_weights(0.3, 0, HTML_WEIGHT_SHARE, MIN_SCRIPT_WEIGHT);
        assert!((html - 0.3).abs() < 1e-12);
        assert!(scripts.is_empty());
    }

    #[test]
    fn script_weight_floor_is_applied() {
        let (_, scripts) = split_artifact_weights(0.3, 1000, HTML_WEIGHT_SHARE, MIN_SCRIPT_WEIGHT);
        for w in scripts {
            assert!(w >= MIN_SCRIPT_WEIGHT);
        }
    }

    #[test]
    fn already_normalized_weights_are_untouched() {
        let mut steps = vec![
            StepResult {
                step: "A".to_string(),
                checks: vec![ok_check("a1", 0.2)],
            },
            StepResult {
                step: "B".to_string(),
                checks: vec![ok_check("b1", 0.3), ok_check("b2", 0.5)],
            },
        ];
        renormalize(&mut steps);
        assert!((steps[0].checks[0].weight - 0.2).abs() < 1e-9);
        assert!((steps[1].checks[0].weight - 0.3).abs() < 1e-9);
        assert!((steps[1].checks[1].weight - 0.5).abs() < 1e-9);
    }

    #[test]
    fn failed_sibling_weight_moves_within_the_step() {
        let mut steps = vec![
            StepResult {
                step: "A".to_string(),
                checks: vec![ok_check("a1", 0.5)],
            },
            StepResult {
                step: "B".to_string(),
                checks: vec![
                    ok_check("b1", 0.1),
                    ok_check("b2", 0.3),
                    Check::failed("b3", "test", 0.1, "transport".to_string()),
                ],
            },
        ];
        renormalize(&mut steps);
        // b3's 0.1 redistributes 1:3 across b1/b2, step total stays 0.5.
        assert!((steps[1].checks[0].weight - 0.125).abs() < 1e-9);
        assert!((steps[1].checks[1].weight - 0.375).abs() < 1e-9);
        // The failed record keeps its declared weight.
        assert!((steps[1].checks[2].weight - 0.1).abs() < 1e-9);
        assert!((surviving_sum(&steps) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn fully_failed_step_loses_weight_to_global_pass() {
        let mut steps = vec![
            StepResult {
                step: "A".to_string(),
                checks: vec![Check::failed("a1", "test", 0.2, "timeout".to_string())],
            },
            StepResult {
                step: "B".to_string(),
                checks: vec![ok_check("b1", 0.3), ok_check("b2", 0.5)],
            },
        ];
        renormalize(&mut steps);
        // 0.3/0.8 and 0.5/0.8.
        assert!((steps[1].checks[0].weight - 0.375).abs() < 1e-9);
        assert!((steps[1].checks[1].weight - 0.625).abs() < 1e-9);
        assert!((surviving_sum(&steps) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn surviving_weights_sum_to_one_across_mixed_failures() {
        let mut steps = vec![
            StepResult {
                step: "Page_Accessibility".to_string(),
                checks: vec![ok_check("page", 0.2)],
            },
            StepResult {
                step: "Content_Analysis".to_string(),
                checks: vec![
                    ok_check("html", 0.255),
                    ok_check("script_0", 0.015),
                    Check::failed("script_1", "test", 0.015, "transport".to_string()),
                    ok_check("script_2", 0.015),
                ],
            },
            StepResult {
                step: "LLM_Link_Suspiciousness".to_string(),
                checks: vec![ok_check("overall", 0.5)],
            },
        ];
        renormalize(&mut steps);
        assert!((surviving_sum(&steps) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn all_checks_failed_leaves_weights_in_place() {
        let mut steps = vec![StepResult {
            step: "A".to_string(),
            checks: vec![
                Check::failed("a1", "test", 0.4, "timeout".to_string()),
                Check::failed("a2", "test", 0.6, "timeout".to_string()),
            ],
        }];
        renormalize(&mut steps);
        assert!((steps[0].checks[0].weight - 0.4).abs() < 1e-9);
        assert!((steps[0].checks[1].weight - 0.6).abs() < 1e-9);
    }
}
