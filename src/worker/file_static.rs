use super::checks::{parse_check_reply, run_step, CheckFinding, PendingCheck};
use super::{ensure_llm_survived, ensure_step_survived, WorkerContext};
use crate::models::{RiskLevel, WorkerName, WorkerResult};
use crate::worker::weights;
use crate::{Result, WopaError};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileStaticPayload {
    pub file_ref: String,
}

const STEP_STATIC: &str = "Static_Analysis";

const WEIGHT_HASHING: f64 = 0.2;
const WEIGHT_METADATA: f64 = 0.2;
const WEIGHT_SIGNATURES: f64 = 0.6;

/// Extracted once, shared by all three checks.
#[derive(Clone)]
struct FileFacts {
    digest: String,
    size: usize,
    extension: String,
    magic: String,
    strings_sample: String,
}

/// File static worker: hash + metadata extraction + one LLM pass over
/// the extracted signatures.
pub async fn run(ctx: &WorkerContext, payload: FileStaticPayload) -> Result<WorkerResult> {
    let bytes = tokio::fs::read(&payload.file_ref)
        .await
        .map_err(|_| WopaError::Worker {
            message: "File reference could not be read".to_string(),
        })?;
    let facts = extract_facts(&payload.file_ref, &bytes);

    let hashing_facts = facts.clone();
    let metadata_facts = facts.clone();
    let provider = ctx.provider.clone();
    let signature_prompt = signature_prompt(&facts);

    let checks = vec![
        PendingCheck::new("file_hashing", "hash_digest", WEIGHT_HASHING, async move {
            Ok(CheckFinding {
                risk_level: RiskLevel::Low,
                confidence: 1.0,
                explanation: format!(
                    "blake3={} size={} bytes",
                    hashing_facts.digest, hashing_facts.size
                ),
            })
        }),
        PendingCheck::new(
            "metadata_extraction",
            "metadata_extractor",
            WEIGHT_METADATA,
            async move {
                Ok(CheckFinding {
                    risk_level: RiskLevel::Low,
                    confidence: 1.0,
                    explanation: format!(
                        "extension={} magic={}",
                        metadata_facts.extension, metadata_facts.magic
                    ),
                })
            },
        ),
        PendingCheck::new(
            "llm_signature_analysis",
            "LLM_signature_analyzer",
            WEIGHT_SIGNATURES,
            async move {
                let reply = provider.chat_complete(signature_prompt).await?;
                Ok(parse_check_reply(&reply))
            },
        ),
    ];

    let mut steps = vec![run_step(STEP_STATIC, checks, ctx.config.worker.parallel_checks).await];
    ensure_step_survived(&steps[0], "Static analysis failed")?;
    ensure_llm_survived(&steps)?;
    weights::renormalize(&mut steps);

    Ok(WorkerResult {
        worker_name: WorkerName::FileStatic,
        steps,
    })
}

fn extract_facts(file_ref: &str, bytes: &[u8]) -> FileFacts {
    let extension = Path::new(file_ref)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("none")
        .to_string();
    let magic = bytes
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join("");
    FileFacts {
        digest: blake3::hash(bytes).to_hex().to_string(),
        size: bytes.len(),
        extension,
        magic,
        strings_sample: printable_strings(bytes, 16, 2048),
    }
}

/// Runs of printable ASCII at least `min_len` long, capped at
/// `max_bytes` of output. The cheap stand-in for a full strings pass.
fn printable_strings(bytes: &[u8], min_len: usize, max_bytes: usize) -> String {
    let mut out = String::new();
    let mut run = String::new();
    for &b in bytes {
        if (0x20..0x7f).contains(&b) {
            run.push(b as char);
        } else {
            if run.len() >= min_len {
                out.push_str(&run);
                out.push('\n');
                if out.len() >= max_bytes {
                    break;
                }
            }
            run.clear();
        }
    }
    if run.len() >= min_len && out.len() < max_bytes {
        out.push_str(&run);
    }
    out.truncate(max_bytes);
    out
}

fn signature_prompt(facts: &FileFacts) -> String {
    format!(
        "You are a malware analyst. Judge the risk of a file from its static \
         signatures alone. Respond with JSON only: {{\"risk_level\": \"low|medium|high\", \
         \"confidence\": 0.0-1.0, \"explanation\": \"...\"}}.\n\n\
         blake3: {}\nsize: {} bytes\nextension: {}\nmagic: {}\n\
         extracted strings:\n{}",
        facts.digest, facts.size, facts.extension, facts.magic, facts.strings_sample
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facts_capture_magic_and_extension() {
        let bytes = b"MZ\x90\x00binary-content-here";
        let facts = extract_facts("sample.exe", bytes);
        assert_eq!(facts.extension, "exe");
        assert!(facts.magic.starts_with("4d5a9000"));
        assert_eq!(facts.size, bytes.len());
        assert_eq!(facts.digest.len(), 64);
    }

    #[test]
    fn printable_strings_finds_long_runs() {
        let mut bytes = vec![0u8; 10];
        bytes.extend_from_slice(b"http://malicious.example/payload");
        bytes.extend_from_slice(&[0, 1, 2]);
        bytes.extend_from_slice(b"short");
        let strings = printable_strings(&bytes, 16, 2048);
        assert!(strings.contains("http://malicious.example/payload"));
        assert!(!strings.contains("short"));
    }

    #[test]
    fn identical_bytes_hash_identically() {
        let a = extract_facts("a.bin", b"same content");
        let b = extract_facts("b.bin", b"same content");
        assert_eq!(a.digest, b.digest);
    }
}
