//! System-wide defaults. Anything an operator may need to tune has a
//! config key; these are the values used when the key is absent.

/// Service -> Worker dispatch timeout.
pub const WORKER_TIMEOUT_SECS: u64 = 120;

/// Service -> aggregator LLM call timeout.
pub const AGGREGATOR_TIMEOUT_SECS: u64 = 60;

/// Provider -> LLM backend timeout.
pub const LLM_TIMEOUT_SECS: u64 = 60;

/// LLM health probe timeout.
pub const LLM_PROBE_TIMEOUT_SECS: u64 = 5;

/// Provider -> sandbox outer cap; runs poll internally.
pub const SANDBOX_TIMEOUT_SECS: u64 = 300;

/// Provider -> emulator outer cap; app runs may be long.
pub const EMULATOR_TIMEOUT_SECS: u64 = 600;

/// Poll interval for sandbox/emulator status.
pub const POLL_INTERVAL_SECS: u64 = 5;

/// Health probe cadence per instance.
pub const HEALTH_PROBE_INTERVAL_SECS: u64 = 30;

/// Consecutive probe failures before an instance is marked unhealthy.
pub const UNHEALTHY_THRESHOLD: u32 = 3;

/// Parallel checks within one worker step.
pub const MAX_PARALLEL_CHECKS: usize = 8;

/// Inbound message size cap (16 KiB).
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024;

/// App analysis instruction size cap (4 KiB).
pub const MAX_INSTRUCTIONS_BYTES: usize = 4 * 1024;

/// Link worker: page fetch timeout.
pub const PAGE_FETCH_TIMEOUT_SECS: u64 = 10;

/// Link worker: redirect ceiling on the page fetch.
pub const MAX_REDIRECTS: usize = 3;

/// Link worker: scripts analyzed per page.
pub const MAX_SCRIPTS: usize = 32;

/// Link worker: per-artifact size cap (256 KiB).
pub const MAX_SCRIPT_BYTES: usize = 256 * 1024;

/// Share of the Content_Analysis step weight assigned to the HTML
/// artifact; the remainder splits equally across scripts.
pub const HTML_WEIGHT_SHARE: f64 = 0.85;

/// Floor for a single script's weight after splitting.
pub const MIN_SCRIPT_WEIGHT: f64 = 1e-4;

/// Vision request limits.
pub const MAX_VISION_IMAGES: usize = 8;
pub const MAX_VISION_IMAGE_BYTES: usize = 4 * 1024 * 1024;

/// Task store soft cap; oldest terminal tasks evict past this.
pub const TASK_SOFT_CAP: usize = 10_000;

/// Deterministic tie-break thresholds on the weighted risk score.
pub const TIEBREAK_HIGH: f64 = 0.66;
pub const TIEBREAK_MEDIUM: f64 = 0.33;
