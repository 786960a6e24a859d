//! Worker tier: a uniform dispatcher over the five statically composed
//! analyzers. Each composition is a sequence of steps whose checks run
//! in parallel under a bounded fan-out; failing checks are recorded,
//! never raised.

mod app_behavior;
mod checks;
mod file_dynamic;
mod file_static;
mod link;
mod provider_client;
mod text;
pub mod weights;

pub use checks::{parse_check_reply, run_step, CheckFinding, PendingCheck};
pub use provider_client::ProviderClient;

#[cfg(test)]
mod tests;

use crate::config::Config;
use crate::models::{
    ProviderKind, ServiceName, StepResult, Task, TaskInput, TaskStatus, WorkerName,
    WorkerRequest, WorkerResponse, WorkerResult,
};
use crate::store::TaskStore;
use crate::{Result, WopaError};
use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const SERVICE_NAME: &str = "wopa-worker";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared dependencies of every composition.
pub struct WorkerContext {
    pub provider: ProviderClient,
    pub config: Arc<Config>,
    /// Page-fetch client with the redirect ceiling and fetch timeout
    /// the link worker requires.
    pub page_client: reqwest::Client,
}

impl WorkerContext {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let page_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(
                config.worker.max_redirects,
            ))
            .timeout(Duration::from_secs(config.worker.page_fetch_timeout_seconds))
            .build()
            .map_err(WopaError::Transport)?;
        Ok(Self {
            provider: ProviderClient::new(&config),
            config,
            page_client,
        })
    }
}

/// Worker tier shared state.
#[derive(Clone)]
pub struct WorkerState {
    ctx: Arc<WorkerContext>,
    store: Arc<TaskStore>,
    config: Arc<Config>,
}

impl WorkerState {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let ctx = Arc::new(WorkerContext::new(Arc::clone(&config))?);
        Ok(Self {
            ctx,
            store: Arc::new(TaskStore::new(config.service.task_soft_cap)),
            config,
        })
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }
}

/// The Worker tier HTTP server.
pub struct WorkerServer {
    config: Arc<Config>,
    state: WorkerState,
}

impl WorkerServer {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let state = WorkerState::new(Arc::clone(&config))?;
        Ok(Self { config, state })
    }

    pub fn build_router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub async fn run(&self) -> Result<()> {
        let app = self.build_router();
        let listener = tokio::net::TcpListener::bind(format!(
            "{}:{}",
            self.config.worker.host, self.config.worker.port
        ))
        .await
        .map_err(|e| WopaError::Internal(e.into()))?;

        info!(
            "Worker server listening on {}:{}",
            self.config.worker.host, self.config.worker.port
        );

        axum::serve(listener, app)
            .await
            .map_err(|e| WopaError::Internal(e.into()))?;
        Ok(())
    }
}

pub fn build_router(state: WorkerState) -> Router {
    Router::new()
        .route("/request_worker", post(request_worker))
        .route("/workers", get(list_workers))
        .route("/configs", get(effective_configs))
        .route("/tasks", get(list_tasks))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Typed view of a worker-specific payload, parsed strictly.
enum ParsedPayload {
    Text(text::TextPayload),
    Link(link::LinkPayload),
    FileStatic(file_static::FileStaticPayload),
    FileDynamic(file_dynamic::FileDynamicPayload),
    App(app_behavior::AppBehaviorPayload),
}

impl ParsedPayload {
    fn parse(worker_name: WorkerName, payload: serde_json::Value) -> Result<Self> {
        let invalid = |e: serde_json::Error| {
            WopaError::Validation(format!("Invalid {worker_name} worker payload: {e}"))
        };
        match worker_name {
            WorkerName::Text => serde_json::from_value(payload)
                .map(ParsedPayload::Text)
                .map_err(invalid),
            WorkerName::Link => serde_json::from_value(payload)
                .map(ParsedPayload::Link)
                .map_err(invalid),
            WorkerName::FileStatic => serde_json::from_value(payload)
                .map(ParsedPayload::FileStatic)
                .map_err(invalid),
            WorkerName::FileDynamic => serde_json::from_value(payload)
                .map(ParsedPayload::FileDynamic)
                .map_err(invalid),
            WorkerName::AppBehavior => serde_json::from_value(payload)
                .map(ParsedPayload::App)
                .map_err(invalid),
        }
    }

    fn to_task_input(&self) -> TaskInput {
        match self {
            ParsedPayload::Text(p) => TaskInput::Message {
                message: p.message.clone(),
            },
            ParsedPayload::Link(p) => TaskInput::Link { url: p.url.clone() },
            ParsedPayload::FileStatic(p) => TaskInput::FileStatic {
                file_ref: p.file_ref.clone(),
            },
            ParsedPayload::FileDynamic(p) => TaskInput::FileDynamic {
                file_ref: p.file_ref.clone(),
            },
            ParsedPayload::App(p) => TaskInput::App {
                app_ref: p.app_ref.clone(),
                instructions: p.instructions.clone(),
            },
        }
    }
}

async fn request_worker(
    State(state): State<WorkerState>,
    Json(request): Json<WorkerRequest>,
) -> Json<WorkerResponse> {
    let task_id = request.task_id.clone();
    let worker_name = request.worker_name;

    let parsed = match ParsedPayload::parse(worker_name, request.payload) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(task_id = %task_id, worker = %worker_name, "Rejected worker request: {e}");
            return Json(WorkerResponse::error(task_id, e.user_message()));
        }
    };

    // Subtask record keyed by the caller's task id, for traceability.
    // The id may repeat on a re-dispatch; only the first create wins.
    let service_name = service_for(worker_name);
    let mut subtask = Task::new(service_name, parsed.to_task_input());
    subtask.task_id = task_id.clone();
    let tracked = state.store.create(subtask).is_ok();
    if tracked {
        let _ = state
            .store
            .transition(&task_id, TaskStatus::Pending, TaskStatus::InProgress);
    }

    info!(task_id = %task_id, worker = %worker_name, "Dispatching worker");
    let outcome = dispatch(&state.ctx, parsed).await;

    match outcome {
        Ok(result) => {
            if tracked {
                let _ = state
                    .store
                    .transition(&task_id, TaskStatus::InProgress, TaskStatus::Completed);
            }
            Json(WorkerResponse::completed(task_id, result))
        }
        Err(e) => {
            warn!(task_id = %task_id, worker = %worker_name, "Worker failed: {e}");
            if tracked {
                let _ = state.store.set_error(&task_id, e.user_message());
            }
            Json(WorkerResponse::error(task_id, e.user_message()))
        }
    }
}

async fn dispatch(ctx: &WorkerContext, payload: ParsedPayload) -> Result<WorkerResult> {
    match payload {
        ParsedPayload::Text(p) => text::run(ctx, p).await,
        ParsedPayload::Link(p) => link::run(ctx, p).await,
        ParsedPayload::FileStatic(p) => file_static::run(ctx, p).await,
        ParsedPayload::FileDynamic(p) => file_dynamic::run(ctx, p).await,
        ParsedPayload::App(p) => app_behavior::run(ctx, p).await,
    }
}

fn service_for(worker_name: WorkerName) -> ServiceName {
    match worker_name {
        WorkerName::Text => ServiceName::MessageAnalysis,
        WorkerName::Link => ServiceName::LinkAnalysis,
        WorkerName::FileStatic => ServiceName::FileStaticAnalysis,
        WorkerName::FileDynamic => ServiceName::FileDynamicAnalysis,
        WorkerName::AppBehavior => ServiceName::AppAnalysis,
    }
}

/// Worker fails as a whole when an entire required step produced
/// nothing.
fn ensure_step_survived(step: &StepResult, failure_message: &str) -> Result<()> {
    if step.checks.iter().any(|c| c.is_success()) {
        Ok(())
    } else {
        Err(WopaError::Worker {
            message: failure_message.to_string(),
        })
    }
}

/// Worker fails as a whole when every LLM check failed, which includes
/// the no-healthy-LLM-instance case.
fn ensure_llm_survived(steps: &[StepResult]) -> Result<()> {
    let llm_checks: Vec<_> = steps
        .iter()
        .flat_map(|s| s.checks.iter())
        .filter(|c| c.analysis_agent.starts_with("LLM_"))
        .collect();
    if llm_checks.is_empty() || llm_checks.iter().any(|c| c.is_success()) {
        return Ok(());
    }
    if llm_checks
        .iter()
        .any(|c| c.error.as_deref() == Some("provider_unavailable"))
    {
        return Err(WopaError::ProviderUnavailable {
            kind: ProviderKind::LlmChat,
        });
    }
    Err(WopaError::Worker {
        message: "LLM analysis failed".to_string(),
    })
}

async fn list_workers(State(_state): State<WorkerState>) -> Json<serde_json::Value> {
    let names: Vec<&str> = WorkerName::ALL.iter().map(|w| w.as_str()).collect();
    Json(serde_json::json!({ "workers": names }))
}

async fn effective_configs(State(state): State<WorkerState>) -> Json<serde_json::Value> {
    Json(state.config.sanitized())
}

async fn list_tasks(State(state): State<WorkerState>) -> Json<serde_json::Value> {
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

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
    }))
}
