//! Service tier: the public HTTP surface. Validates inputs, creates and
//! tracks tasks, dispatches to the Worker tier, runs the aggregator
//! fan-in, and serves verdicts.

pub mod aggregator;
mod clients;

pub use clients::ServiceClients;

#[cfg(test)]
mod tests;

use crate::config::Config;
use crate::models::{
    ServiceName, Task, TaskInput, TaskStatus, Verdict, WorkerRequest, WorkerResponse,
    WorkerResult, WorkerStatus,
};
use crate::store::TaskStore;
use crate::validation::InputValidator;
use crate::{Result, WopaError};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const SERVICE_NAME: &str = "wopa-service";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

const MSG_WORKER_UNAVAILABLE: &str = "Analysis backend unavailable";
const MSG_INTERNAL: &str = "Internal error occurred";
const MSG_TASK_NOT_FOUND: &str = "Task not found";

/// Completed/error envelope returned by every analyze endpoint.
#[derive(Debug, Serialize)]
pub struct TaskEnvelope {
    pub task_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Verdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Raw worker findings when the aggregator failed but the analysis
    /// itself produced usable partial results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_result: Option<WorkerResult>,
}

impl TaskEnvelope {
    fn completed(task_id: String, result: Verdict) -> Self {
        Self {
            task_id,
            status: "completed".to_string(),
            result: Some(result),
            message: None,
            worker_result: None,
        }
    }

    fn error(task_id: String, message: String) -> Self {
        Self {
            task_id,
            status: "error".to_string(),
            result: None,
            message: Some(message),
            worker_result: None,
        }
    }

    fn degraded(task_id: String, message: String, worker_result: WorkerResult) -> Self {
        Self {
            task_id,
            status: "error".to_string(),
            result: None,
            message: Some(message),
            worker_result: Some(worker_result),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: String,
    pub message: String,
}

impl ErrorBody {
    fn new(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
        }
    }
}

type ValidationFailure = (StatusCode, Json<ErrorBody>);

fn bad_request(message: String) -> ValidationFailure {
    (StatusCode::BAD_REQUEST, Json(ErrorBody::new(message)))
}

/// Service tier shared state.
#[derive(Clone)]
pub struct ServiceState {
    store: Arc<TaskStore>,
    clients: ServiceClients,
    validator: InputValidator,
}

impl ServiceState {
    pub fn new(config: &Config) -> Self {
        Self {
            store: Arc::new(TaskStore::new(config.service.task_soft_cap)),
            clients: ServiceClients::new(config),
            validator: InputValidator::new(),
        }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }
}

/// The Service tier HTTP server.
pub struct ServiceServer {
    config: Arc<Config>,
    state: ServiceState,
}

impl ServiceServer {
    pub fn new(config: Arc<Config>) -> Self {
        let state = ServiceState::new(&config);
        Self { config, state }
    }

    pub fn build_router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub async fn run(&self) -> Result<()> {
        let app = self.build_router();
        let listener = tokio::net::TcpListener::bind(format!(
            "{}:{}",
            self.config.service.host, self.config.service.port
        ))
        .await
        .map_err(|e| WopaError::Internal(e.into()))?;

        info!(
            "Service server listening on {}:{}",
            self.config.service.host, self.config.service.port
        );

        axum::serve(listener, app)
            .await
            .map_err(|e| WopaError::Internal(e.into()))?;
        Ok(())
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/available_services", get(available_services))
        .route("/analyze_message", post(analyze_message))
        .route("/analyze_link", post(analyze_link))
        .route("/analyze_file_static", post(analyze_file_static))
        .route("/analyze_file_dynamic", post(analyze_file_dynamic))
        .route("/analyze_app", post(analyze_app))
        .route("/tasks", get(list_tasks))
        .route("/get_task_status", get(get_task_status))
        .route("/health", get(health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Marks the task as cancelled if the request handler is dropped before
/// the analysis reaches a terminal state (client disconnect).
struct CancelGuard {
    store: Arc<TaskStore>,
    task_id: String,
    armed: bool,
}

impl CancelGuard {
    fn new(store: Arc<TaskStore>, task_id: String) -> Self {
        Self {
            store,
            task_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!(task_id = %self.task_id, "Request cancelled mid-analysis");
            let _ = self.store.set_error(&self.task_id, "cancelled".to_string());
        }
    }
}

/// The shared processing algorithm: create the task, dispatch to the
/// worker, aggregate, persist the verdict. Business failures come back
/// as HTTP 200 error envelopes.
async fn run_analysis(
    state: &ServiceState,
    service_name: ServiceName,
    input: TaskInput,
    worker_payload: serde_json::Value,
) -> Json<TaskEnvelope> {
    let task = Task::new(service_name, input);
    let task_id = task.task_id.clone();
    if let Err(e) = state.store.create(task) {
        warn!(task_id = %task_id, "Could not create task: {e}");
        return Json(TaskEnvelope::error(task_id, MSG_INTERNAL.to_string()));
    }
    let mut guard = CancelGuard::new(Arc::clone(&state.store), task_id.clone());

    let _ = state
        .store
        .transition(&task_id, TaskStatus::Pending, TaskStatus::InProgress);

    let request = WorkerRequest {
        task_id: task_id.clone(),
        worker_name: service_name.worker_name(),
        payload: worker_payload,
    };

    let worker_response = match state.clients.request_worker(&request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(task_id = %task_id, "Worker dispatch failed: {e}");
            let message = if e.is_retryable() {
                MSG_WORKER_UNAVAILABLE.to_string()
            } else {
                e.user_message()
            };
            let _ = state.store.set_error(&task_id, message.clone());
            guard.disarm();
            return Json(TaskEnvelope::error(task_id, message));
        }
    };

    let worker_result = match interpret_worker_response(worker_response) {
        Ok(result) => result,
        Err(message) => {
            let _ = state.store.set_error(&task_id, message.clone());
            guard.disarm();
            return Json(TaskEnvelope::error(task_id, message));
        }
    };

    match aggregate(state, &worker_result).await {
        Ok(verdict) => {
            if let Err(e) = state.store.set_result(&task_id, verdict.clone()) {
                warn!(task_id = %task_id, "Could not persist verdict: {e}");
            }
            guard.disarm();
            info!(task_id = %task_id, risk = %verdict.risk_level, "Task completed");
            Json(TaskEnvelope::completed(task_id, verdict))
        }
        Err(e) => {
            warn!(task_id = %task_id, "Aggregation failed: {e}");
            let message = e.user_message();
            let _ = state.store.set_error(&task_id, message.clone());
            guard.disarm();
            // Degrade with the raw worker findings on protocol failure.
            if matches!(e, WopaError::ProviderProtocol(_)) {
                Json(TaskEnvelope::degraded(task_id, message, worker_result))
            } else {
                Json(TaskEnvelope::error(task_id, message))
            }
        }
    }
}

/// A partially populated worker result still aggregates; a worker-level
/// error surfaces as-is (the worker's messages are already user-safe).
fn interpret_worker_response(
    response: WorkerResponse,
) -> std::result::Result<WorkerResult, String> {
    match response.status {
        WorkerStatus::Completed => response
            .result
            .ok_or_else(|| MSG_INTERNAL.to_string()),
        WorkerStatus::Error => Err(response
            .error
            .unwrap_or_else(|| MSG_WORKER_UNAVAILABLE.to_string())),
    }
}

/// Aggregator call with the single JSON-reparse retry, bounded by the
/// deterministic tie-break.
async fn aggregate(state: &ServiceState, worker_result: &WorkerResult) -> Result<Verdict> {
    let prompt = aggregator::build_prompt(worker_result);
    let (deterministic_level, _) = aggregator::deterministic_tiebreak(worker_result);

    let first_reply = state.clients.aggregate(prompt.clone()).await?;
    let parsed = match aggregator::parse_verdict(&first_reply) {
        Ok(verdict) => verdict,
        Err(first_err) => {
            info!("Aggregator reply was not valid JSON, retrying once: {first_err}");
            let retry_reply = state
                .clients
                .aggregate(aggregator::reinforce_prompt(&prompt))
                .await?;
            aggregator::parse_verdict(&retry_reply)?
        }
    };

    let verdict = aggregator::reconcile(parsed, deterministic_level);
    if !verdict.is_well_formed() {
        return Err(WopaError::ProviderProtocol(
            "aggregator verdict failed shape validation".to_string(),
        ));
    }
    Ok(verdict)
}

// --- Handlers ---

async fn available_services() -> Json<serde_json::Value> {
    let services: Vec<serde_json::Value> = ServiceName::ALL
        .iter()
        .map(|s| {
            serde_json::json!({
                "service_name": s,
                "description": s.description(),
            })
        })
        .collect();
    Json(serde_json::json!(services))
}

fn field<'a>(body: &'a serde_json::Value, name: &str) -> Option<&'a str> {
    body.get(name).and_then(|v| v.as_str())
}

async fn analyze_message(
    State(state): State<ServiceState>,
    Json(body): Json<serde_json::Value>,
) -> std::result::Result<Json<TaskEnvelope>, ValidationFailure> {
    let message = field(&body, "message")
        .ok_or_else(|| bad_request("Missing required field: message".to_string()))?;
    state
        .validator
        .validate_message(message)
        .map_err(|e| bad_request(e.user_message()))?;

    Ok(run_analysis(
        &state,
        ServiceName::MessageAnalysis,
        TaskInput::Message {
            message: message.to_string(),
        },
        serde_json::json!({"message": message}),
    )
    .await)
}

async fn analyze_link(
    State(state): State<ServiceState>,
    Json(body): Json<serde_json::Value>,
) -> std::result::Result<Json<TaskEnvelope>, ValidationFailure> {
    let url = field(&body, "url")
        .ok_or_else(|| bad_request("Missing required field: url".to_string()))?;
    state
        .validator
        .validate_url(url)
        .map_err(|e| bad_request(e.user_message()))?;

    Ok(run_analysis(
        &state,
        ServiceName::LinkAnalysis,
        TaskInput::Link {
            url: url.to_string(),
        },
        serde_json::json!({"url": url}),
    )
    .await)
}

async fn analyze_file_static(
    State(state): State<ServiceState>,
    Json(body): Json<serde_json::Value>,
) -> std::result::Result<Json<TaskEnvelope>, ValidationFailure> {
    let file_ref = field(&body, "file_ref")
        .ok_or_else(|| bad_request("Missing required field: file_ref".to_string()))?;
    state
        .validator
        .validate_file_ref(file_ref)
        .map_err(|e| bad_request(e.user_message()))?;

    Ok(run_analysis(
        &state,
        ServiceName::FileStaticAnalysis,
        TaskInput::FileStatic {
            file_ref: file_ref.to_string(),
        },
        serde_json::json!({"file_ref": file_ref}),
    )
    .await)
}

async fn analyze_file_dynamic(
    State(state): State<ServiceState>,
    Json(body): Json<serde_json::Value>,
) -> std::result::Result<Json<TaskEnvelope>, ValidationFailure> {
    let file_ref = field(&body, "file_ref")
        .ok_or_else(|| bad_request("Missing required field: file_ref".to_string()))?;
    state
        .validator
        .validate_file_ref(file_ref)
        .map_err(|e| bad_request(e.user_message()))?;

    Ok(run_analysis(
        &state,
        ServiceName::FileDynamicAnalysis,
        TaskInput::FileDynamic {
            file_ref: file_ref.to_string(),
        },
        serde_json::json!({"file_ref": file_ref}),
    )
    .await)
}

async fn analyze_app(
    State(state): State<ServiceState>,
    Json(body): Json<serde_json::Value>,
) -> std::result::Result<Json<TaskEnvelope>, ValidationFailure> {
    let app_ref = field(&body, "app_ref")
        .ok_or_else(|| bad_request("Missing required field: app_ref".to_string()))?;
    let instructions = field(&body, "instructions").unwrap_or_default();
    state
        .validator
        .validate_app(app_ref, instructions)
        .map_err(|e| bad_request(e.user_message()))?;

    Ok(run_analysis(
        &state,
        ServiceName::AppAnalysis,
        TaskInput::App {
            app_ref: app_ref.to_string(),
            instructions: instructions.to_string(),
        },
        serde_json::json!({"app_ref": app_ref, "instructions": instructions}),
    )
    .await)
}

async fn list_tasks(State(state): State<ServiceState>) -> Json<serde_json::Value> {
    let tasks: Vec<serde_json::Value> = state
        .store
        .list()
        .into_iter()
        .map(|t| {
            serde_json::json!({
                "task_id": t.task_id,
                "status": t.status,
                "service_name": t.service_name,
                "created_at": t.created_at.to_rfc3339(),
            })
        })
        .collect();
    Json(serde_json::json!({ "tasks": tasks }))
}

#[derive(Debug, Deserialize)]
struct TaskStatusQuery {
    task_id: Option<String>,
}

async fn get_task_status(
    State(state): State<ServiceState>,
    Query(query): Query<TaskStatusQuery>,
) -> std::result::Result<Json<serde_json::Value>, ValidationFailure> {
    let task_id = query
        .task_id
        .ok_or_else(|| bad_request("Missing required parameter: task_id".to_string()))?;
    match state.store.get(&task_id) {
        Some(task) => {
            let mut body = serde_json::json!({
                "task_id": task.task_id,
                "status": task.status,
            });
            if let Some(result) = task.result {
                body["result"] = serde_json::to_value(result).unwrap_or_default();
            }
            if let Some(error) = task.error {
                body["error"] = serde_json::json!(error);
            }
            Ok(Json(body))
        }
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorBody::new(MSG_TASK_NOT_FOUND)),
        )),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
    }))
}
