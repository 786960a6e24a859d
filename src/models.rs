use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// The five public analysis services exposed by the Service tier.
///
/// Each service maps to exactly one worker composition; the wire name
/// (`message_analysis`, ...) prefixes every task id the service mints.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ServiceName {
    MessageAnalysis,
    LinkAnalysis,
    FileStaticAnalysis,
    FileDynamicAnalysis,
    AppAnalysis,
}

impl ServiceName {
    pub const ALL: [ServiceName; 5] = [
        ServiceName::MessageAnalysis,
        ServiceName::LinkAnalysis,
        ServiceName::FileStaticAnalysis,
        ServiceName::FileDynamicAnalysis,
        ServiceName::AppAnalysis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceName::MessageAnalysis => "message_analysis",
            ServiceName::LinkAnalysis => "link_analysis",
            ServiceName::FileStaticAnalysis => "file_static_analysis",
            ServiceName::FileDynamicAnalysis => "file_dynamic_analysis",
            ServiceName::AppAnalysis => "app_analysis",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ServiceName::MessageAnalysis => "Classify a free-text message for malicious intent",
            ServiceName::LinkAnalysis => "Fetch and analyze a URL, its page, and its scripts",
            ServiceName::FileStaticAnalysis => "Static analysis of a file: hashes, metadata, signatures",
            ServiceName::FileDynamicAnalysis => "Detonate a file in the sandbox and classify its behavior",
            ServiceName::AppAnalysis => "Run an app in an emulator and analyze its visuals and events",
        }
    }

    /// The worker composition this service dispatches to.
    pub fn worker_name(&self) -> WorkerName {
        match self {
            ServiceName::MessageAnalysis => WorkerName::Text,
            ServiceName::LinkAnalysis => WorkerName::Link,
            ServiceName::FileStaticAnalysis => WorkerName::FileStatic,
            ServiceName::FileDynamicAnalysis => WorkerName::FileDynamic,
            ServiceName::AppAnalysis => WorkerName::AppBehavior,
        }
    }

    /// Mint a fresh task id: `<service_name>-<uuid-v4>`.
    pub fn new_task_id(&self) -> String {
        format!("{}-{}", self.as_str(), Uuid::new_v4())
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message_analysis" => Ok(ServiceName::MessageAnalysis),
            "link_analysis" => Ok(ServiceName::LinkAnalysis),
            "file_static_analysis" => Ok(ServiceName::FileStaticAnalysis),
            "file_dynamic_analysis" => Ok(ServiceName::FileDynamicAnalysis),
            "app_analysis" => Ok(ServiceName::AppAnalysis),
            _ => Err(format!("Unknown service name: {s}")),
        }
    }
}

/// The five worker compositions the Worker tier can execute.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkerName {
    Text,
    Link,
    FileStatic,
    FileDynamic,
    AppBehavior,
}

impl WorkerName {
    pub const ALL: [WorkerName; 5] = [
        WorkerName::Text,
        WorkerName::Link,
        WorkerName::FileStatic,
        WorkerName::FileDynamic,
        WorkerName::AppBehavior,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerName::Text => "text",
            WorkerName::Link => "link",
            WorkerName::FileStatic => "file_static",
            WorkerName::FileDynamic => "file_dynamic",
            WorkerName::AppBehavior => "app_behavior",
        }
    }
}

impl fmt::Display for WorkerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a task.
///
/// Transitions form a DAG: `pending -> in_progress -> {completed, error}`.
/// Terminal states absorb; no transition ever leaves them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
        }
    }

    /// Whether `self -> to` is a legal edge of the lifecycle DAG.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        match self {
            TaskStatus::Pending => matches!(to, TaskStatus::InProgress | TaskStatus::Error),
            TaskStatus::InProgress => matches!(to, TaskStatus::Completed | TaskStatus::Error),
            TaskStatus::Completed | TaskStatus::Error => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk level of a check or verdict.
///
/// `Unknown` is legal only on per-check records (a failed check); final
/// verdicts carry low/medium/high exclusively.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Unknown,
}

impl RiskLevel {
    /// Numeric value used by the deterministic tie-break.
    pub fn score(&self) -> f64 {
        match self {
            RiskLevel::Low => 0.0,
            RiskLevel::Medium => 0.5,
            RiskLevel::High => 1.0,
            RiskLevel::Unknown => 0.0,
        }
    }

    /// Ordinal for level-distance comparisons (low=0, medium=1, high=2).
    pub fn ordinal(&self) -> i32 {
        match self {
            RiskLevel::Low => 0,
            RiskLevel::Medium | RiskLevel::Unknown => 1,
            RiskLevel::High => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Unknown => "unknown",
        }
    }

    /// Map a free-form string onto the allowed verdict set by lexical
    /// match, defaulting to `Medium` when nothing matches.
    pub fn from_lexical(s: &str) -> RiskLevel {
        let lowered = s.to_lowercase();
        if lowered.contains("high") {
            RiskLevel::High
        } else if lowered.contains("low") {
            RiskLevel::Low
        } else {
            RiskLevel::Medium
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single named analysis unit inside a worker step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Check {
    pub check_id: String,
    pub analysis_agent: String,
    pub weight: f64,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub explanation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Check {
    /// A check that raised: unknown risk, zero confidence, weight
    /// retained for the renormalization accounting.
    pub fn failed(check_id: &str, analysis_agent: &str, weight: f64, error: String) -> Self {
        Self {
            check_id: check_id.to_string(),
            analysis_agent: analysis_agent.to_string(),
            weight,
            risk_level: RiskLevel::Unknown,
            confidence: 0.0,
            explanation: String::new(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.risk_level != RiskLevel::Unknown
    }
}

/// Final aggregated verdict stored in `Task::result`.
///
/// `reasons` maps step names to lists of check records; the service tier
/// may add an `"override": "deterministic_tiebreak"` annotation key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Verdict {
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub reasons: serde_json::Map<String, serde_json::Value>,
}

impl Verdict {
    /// Shape check per the task invariants: allowed risk set, confidence
    /// in range, non-empty reasons.
    pub fn is_well_formed(&self) -> bool {
        self.risk_level != RiskLevel::Unknown
            && (0.0..=1.0).contains(&self.confidence)
            && !self.reasons.is_empty()
    }
}

/// Typed input payload of a task, one variant per service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskInput {
    Message { message: String },
    Link { url: String },
    FileStatic { file_ref: String },
    FileDynamic { file_ref: String },
    App { app_ref: String, instructions: String },
}

/// A unit of work created by the Service tier (or mirrored by the
/// Worker tier for traceability).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub service_name: ServiceName,
    pub status: TaskStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub input: TaskInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Verdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    pub fn new(service_name: ServiceName, input: TaskInput) -> Self {
        let now = chrono::Utc::now();
        Self {
            task_id: service_name.new_task_id(),
            service_name,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            input,
            result: None,
            error: None,
        }
    }
}

/// Service -> Worker request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub task_id: String,
    pub worker_name: WorkerName,
    pub payload: serde_json::Value,
}

/// Terminal status of a worker run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Completed,
    Error,
}

/// Worker -> Service response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub task_id: String,
    pub status: WorkerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<WorkerResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerResponse {
    pub fn completed(task_id: String, result: WorkerResult) -> Self {
        Self {
            task_id,
            status: WorkerStatus::Completed,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(task_id: String, message: String) -> Self {
        Self {
            task_id,
            status: WorkerStatus::Error,
            result: None,
            error: Some(message),
        }
    }
}

/// Combined per-worker payload: the ordered steps with their checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    pub worker_name: WorkerName,
    pub steps: Vec<StepResult>,
}

impl WorkerResult {
    pub fn all_checks(&self) -> impl Iterator<Item = &Check> {
        self.steps.iter().flat_map(|s| s.checks.iter())
    }
}

/// One executed step and the checks it ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step: String,
    pub checks: Vec<Check>,
}

/// Backend kinds the Provider tier routes to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    LlmChat,
    LlmVision,
    Sandbox,
    Emulator,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::LlmChat,
        ProviderKind::LlmVision,
        ProviderKind::Sandbox,
        ProviderKind::Emulator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::LlmChat => "llm_chat",
            ProviderKind::LlmVision => "llm_vision",
            ProviderKind::Sandbox => "sandbox",
            ProviderKind::Emulator => "emulator",
        }
    }

    /// Name used in user-visible unavailability messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::LlmChat => "LLM service",
            ProviderKind::LlmVision => "LLM vision service",
            ProviderKind::Sandbox => "Sandbox",
            ProviderKind::Emulator => "Emulator",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llm_chat" => Ok(ProviderKind::LlmChat),
            "llm_vision" => Ok(ProviderKind::LlmVision),
            "sandbox" => Ok(ProviderKind::Sandbox),
            "emulator" => Ok(ProviderKind::Emulator),
            _ => Err(format!("Unknown provider kind: {s}")),
        }
    }
}

// --- Provider tier wire contracts ---

/// `POST /llm/chat_complete` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompleteRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Successful LLM response: `{status:"success", response:"..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompleteResponse {
    pub status: String,
    pub response: String,
}

impl ChatCompleteResponse {
    pub fn success(response: String) -> Self {
        Self {
            status: "success".to_string(),
            response,
        }
    }
}

/// One image attached to a vision request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePayload {
    pub mime: String,
    pub base64: String,
}

/// `POST /llm/vision_complete` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionCompleteRequest {
    pub prompt: String,
    pub images: Vec<ImagePayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// `POST /sandbox/run_file` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRunRequest {
    pub file_ref: String,
}

/// Sandbox run outcome: execution logs plus optional artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRunResponse {
    pub status: String,
    pub logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<serde_json::Value>,
}

/// `POST /emulator/run_app` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorRunRequest {
    pub app_ref: String,
    pub instructions: String,
}

/// Screenshots captured during an emulator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Visuals {
    pub screenshots: Vec<String>,
}

/// Emulator run outcome: visuals plus the observed event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorRunResponse {
    pub status: String,
    pub task_id: String,
    pub visuals: Visuals,
    pub events: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_carries_service_prefix() {
        let task = Task::new(
            ServiceName::MessageAnalysis,
            TaskInput::Message {
                message: "hi".to_string(),
            },
        );
        assert!(task.task_id.starts_with("message_analysis-"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.result.is_none());
        assert!(task.error.is_none());
    }

    #[test]
    fn status_dag_has_no_exit_from_terminal_states() {
        for terminal in [TaskStatus::Completed, TaskStatus::Error] {
            for to in [
                TaskStatus::Pending,
                TaskStatus::InProgress,
                TaskStatus::Completed,
                TaskStatus::Error,
            ] {
                assert!(!terminal.can_transition_to(to));
            }
        }
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Error));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Error));
        assert!(!TaskStatus::InProgress.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn risk_level_lexical_normalization() {
        assert_eq!(RiskLevel::from_lexical("HIGH"), RiskLevel::High);
        assert_eq!(RiskLevel::from_lexical("very low risk"), RiskLevel::Low);
        assert_eq!(RiskLevel::from_lexical("moderate"), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_lexical("???"), RiskLevel::Medium);
    }

    #[test]
    fn service_names_round_trip_and_map_to_workers() {
        for service in ServiceName::ALL {
            let parsed: ServiceName = service.as_str().parse().unwrap();
            assert_eq!(parsed, service);
        }
        assert_eq!(ServiceName::LinkAnalysis.worker_name(), WorkerName::Link);
        assert_eq!(
            ServiceName::AppAnalysis.worker_name(),
            WorkerName::AppBehavior
        );
    }

    #[test]
    fn wire_names_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&WorkerName::FileDynamic).unwrap(),
            "\"file_dynamic\""
        );
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(serde_json::to_string(&RiskLevel::Low).unwrap(), "\"low\"");
    }

    #[test]
    fn verdict_shape_validation() {
        let mut reasons = serde_json::Map::new();
        reasons.insert("Step1".to_string(), serde_json::json!([]));
        let verdict = Verdict {
            risk_level: RiskLevel::Low,
            confidence: 0.9,
            reasons,
        };
        assert!(verdict.is_well_formed());

        let empty = Verdict {
            risk_level: RiskLevel::Low,
            confidence: 0.9,
            reasons: serde_json::Map::new(),
        };
        assert!(!empty.is_well_formed());
    }
}
