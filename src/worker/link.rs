use super::checks::{parse_check_reply, run_step, CheckFinding, PendingCheck};
use super::{ensure_llm_survived, WorkerContext};
use crate::models::{Check, RiskLevel, StepResult, WorkerName, WorkerResult};
use crate::worker::weights;
use crate::{Result, WopaError};
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;
use url::Url;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkPayload {
    pub url: String,
}

const STEP_ACCESSIBILITY: &str = "Page_Accessibility";
const STEP_CONTENT: &str = "Content_Analysis";
const STEP_SUSPICIOUSNESS: &str = "LLM_Link_Suspiciousness";

const WEIGHT_ACCESSIBILITY: f64 = 0.2;
const WEIGHT_CONTENT: f64 = 0.3;
const WEIGHT_SUSPICIOUSNESS: f64 = 0.5;

/// A fetched page plus the scripts extracted from it.
struct FetchedPage {
    status: u16,
    final_url: Url,
    body: String,
}

/// One script artifact queued for content analysis.
enum ScriptArtifact {
    Inline { index: usize, source: String },
    External { src: Url },
}

/// Link worker: fetch the page, analyze the HTML and its scripts, and
/// take an overall judgment on the URL itself.
pub async fn run(ctx: &WorkerContext, payload: LinkPayload) -> Result<WorkerResult> {
    let mut steps = Vec::new();

    // Page_Accessibility gates content analysis; whether its failure
    // fails the whole worker is configurable.
    let fetched = fetch_page(ctx, &payload.url).await;
    match &fetched {
        Ok(page) => steps.push(StepResult {
            step: STEP_ACCESSIBILITY.to_string(),
            checks: vec![Check {
                check_id: "page_accessibility".to_string(),
                analysis_agent: "http_fetcher".to_string(),
                weight: WEIGHT_ACCESSIBILITY,
                risk_level: RiskLevel::Low,
                confidence: 1.0,
                explanation: format!(
                    "Fetched {} with status {} ({} bytes)",
                    page.final_url,
                    page.status,
                    page.body.len()
                ),
                error: None,
            }],
        }),
        Err(e) => {
            if ctx.config.worker.accessibility_critical {
                return Err(WopaError::Worker {
                    message: "Could not fetch URL".to_string(),
                });
            }
            steps.push(StepResult {
                step: STEP_ACCESSIBILITY.to_string(),
                checks: vec![Check::failed(
                    "page_accessibility",
                    "http_fetcher",
                    WEIGHT_ACCESSIBILITY,
                    e.kind().to_string(),
                )],
            });
        }
    }

    if let Ok(page) = &fetched {
        steps.push(analyze_content(ctx, page).await);
    }

    // Overall judgment on the URL, independent of page content.
    let overall_prompt = suspiciousness_prompt(&payload.url);
    let provider = ctx.provider.clone();
    let overall = run_step(
        STEP_SUSPICIOUSNESS,
        vec![PendingCheck::new(
            "link_suspiciousness",
            "LLM_link_suspiciousness",
            WEIGHT_SUSPICIOUSNESS,
            async move {
                let reply = provider.chat_complete(overall_prompt).await?;
                Ok(parse_check_reply(&reply))
            },
        )],
        ctx.config.worker.parallel_checks,
    )
    .await;
    steps.push(overall);

    ensure_llm_survived(&steps)?;
    weights::renormalize(&mut steps);

    Ok(WorkerResult {
        worker_name: WorkerName::Link,
        steps,
    })
}

async fn fetch_page(ctx: &WorkerContext, raw_url: &str) -> Result<FetchedPage> {
    let response = ctx.page_client.get(raw_url).send().await?;
    let status = response.status().as_u16();
    let final_url = response.url().clone();
    let response = response.error_for_status()?;
    let mut body = response.text().await?;
    truncate_at_boundary(&mut body, ctx.config.worker.max_script_bytes);
    Ok(FetchedPage {
        status,
        final_url,
        body,
    })
}

/// HTML plus every script under the caps, each as its own parallel
/// check. External scripts are fetched inside their check so slow hosts
/// only cost their own artifact.
async fn analyze_content(ctx: &WorkerContext, page: &FetchedPage) -> StepResult {
    let scripts = extract_scripts(&page.body, &page.final_url, ctx.config.worker.max_scripts);
    let (html_weight, script_weights) = weights::split_artifact_weights(
        WEIGHT_CONTENT,
        scripts.len(),
        crate::constants::HTML_WEIGHT_SHARE,
        crate::constants::MIN_SCRIPT_WEIGHT,
    );

    let mut checks = Vec::with_capacity(scripts.len() + 1);
    let provider = ctx.provider.clone();
    let html_prompt = artifact_prompt("HTML document", &page.final_url.to_string(), &page.body);
    checks.push(PendingCheck::new(
        "content_html",
        "LLM_html_analyzer",
        html_weight,
        async move {
            let reply = provider.chat_complete(html_prompt).await?;
            Ok(parse_check_reply(&reply))
        },
    ));

    for (artifact, weight) in scripts.into_iter().zip(script_weights) {
        match artifact {
            ScriptArtifact::Inline { index, source } => {
                let provider = ctx.provider.clone();
                let prompt = artifact_prompt("inline script", &format!("inline #{index}"), &source);
                checks.push(PendingCheck::new(
                    &format!("content_script_{index}"),
                    "LLM_script_analyzer",
                    weight,
                    async move {
                        let reply = provider.chat_complete(prompt).await?;
                        Ok(parse_check_reply(&reply))
                    },
                ));
            }
            ScriptArtifact::External { src } => {
                let provider = ctx.provider.clone();
                let page_client = ctx.page_client.clone();
                let max_bytes = ctx.config.worker.max_script_bytes;
                let check_id = format!("content_script_{}", sanitize_id(src.as_str()));
                checks.push(PendingCheck::new(
                    &check_id,
                    "LLM_script_analyzer",
                    weight,
                    async move {
                        let response = page_client.get(src.clone()).send().await?;
                        let response = response.error_for_status()?;
                        let mut source = response.text().await?;
                        truncate_at_boundary(&mut source, max_bytes);
                        let prompt = artifact_prompt("linked script", src.as_str(), &source);
                        let reply = provider.chat_complete(prompt).await?;
                        Ok::<CheckFinding, WopaError>(parse_check_reply(&reply))
                    },
                ));
            }
        }
    }

    run_step(STEP_CONTENT, checks, ctx.config.worker.parallel_checks).await
}

fn inline_script_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<script[^>]*>(.*?)</script>").expect("static regex"))
}

fn external_script_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)<script[^>]*\bsrc\s*=\s*["']([^"']+)["']"#).expect("static regex")
    })
}

/// Collect external script URLs and non-empty inline bodies, capped at
/// `max_scripts` total.
fn extract_scripts(html: &str, base: &Url, max_scripts: usize) -> Vec<ScriptArtifact> {
    let mut artifacts = Vec::new();

    for capture in external_script_regex().captures_iter(html) {
        if artifacts.len() >= max_scripts {
            return artifacts;
        }
        if let Ok(src) = base.join(&capture[1]) {
            if matches!(src.scheme(), "http" | "https") {
                artifacts.push(ScriptArtifact::External { src });
            }
        }
    }

    for (index, capture) in inline_script_regex().captures_iter(html).enumerate() {
        if artifacts.len() >= max_scripts {
            break;
        }
        let source = capture[1].trim();
        if !source.is_empty() {
            artifacts.push(ScriptArtifact::Inline {
                index,
                source: source.to_string(),
            });
        }
    }

    artifacts
}

fn artifact_prompt(kind: &str, name: &str, content: &str) -> String {
    format!(
        "You are a security analyst reviewing a web page artifact for malicious \
         behavior (drive-by downloads, credential phishing, obfuscated payloads, \
         redirect chains). Respond with JSON only: {{\"risk_level\": \"low|medium|high\", \
         \"confidence\": 0.0-1.0, \"explanation\": \"...\"}}.\n\n\
         Artifact kind: {kind}\nArtifact name: {name}\n\n{content}"
    )
}

fn suspiciousness_prompt(url: &str) -> String {
    format!(
        "You are a security analyst. Judge how suspicious this URL is on its own \
         (typosquatting, deceptive hosts, unusual ports or paths, known-bad \
         patterns). Respond with JSON only: {{\"risk_level\": \"low|medium|high\", \
         \"confidence\": 0.0-1.0, \"explanation\": \"...\"}}.\n\nURL: {url}"
    )
}

fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(48)
        .collect()
}

fn truncate_at_boundary(text: &mut String, max_bytes: usize) {
    if text.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}
