//! Provider tier: backend-agnostic HTTP surface over the LLM, sandbox,
//! and emulator backends, with per-kind instance pools, health probing,
//! and single-retry failover.

mod emulator;
mod health;
mod llm;
mod pool;
mod registry;
mod sandbox;

pub use emulator::EmulatorBackend;
pub use health::HealthProber;
pub use llm::LlmBackend;
pub use pool::{Instance, InstanceLease, InstancePool, InstanceView};
pub use registry::{apply as apply_registry, load as load_registry, parse as parse_registry};
pub use sandbox::SandboxBackend;

#[cfg(test)]
mod tests;

use crate::config::Config;
use crate::models::{
    ChatCompleteRequest, ChatCompleteResponse, EmulatorRunRequest, EmulatorRunResponse,
    ProviderKind, SandboxRunRequest, SandboxRunResponse, VisionCompleteRequest,
};
use crate::validation::InputValidator;
use crate::{Result, WopaError};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

const SERVICE_NAME: &str = "wopa-provider";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Serialize)]
pub struct ProviderErrorBody {
    pub status: String,
    pub error: String,
}

impl ProviderErrorBody {
    fn new(error: String) -> Self {
        Self {
            status: "error".to_string(),
            error,
        }
    }
}

type HandlerError = (StatusCode, Json<ProviderErrorBody>);

/// Shared state of the Provider tier.
#[derive(Clone)]
pub struct ProviderState {
    pub pool: Arc<InstancePool>,
    llm: LlmBackend,
    sandbox: SandboxBackend,
    emulator: EmulatorBackend,
    validator: InputValidator,
    vnc_sessions: Arc<Mutex<HashMap<String, String>>>,
    sandbox_timeout: Duration,
    emulator_timeout: Duration,
}

impl ProviderState {
    pub fn new(config: &Config, pool: Arc<InstancePool>) -> Self {
        let client = reqwest::Client::new();
        Self {
            pool,
            llm: LlmBackend::new(client.clone(), &config.llm),
            sandbox: SandboxBackend::new(client.clone(), &config.sandbox),
            emulator: EmulatorBackend::new(client, &config.emulator),
            validator: InputValidator::new(),
            vnc_sessions: Arc::new(Mutex::new(HashMap::new())),
            sandbox_timeout: Duration::from_secs(config.sandbox.timeout_seconds),
            emulator_timeout: Duration::from_secs(config.emulator.timeout_seconds),
        }
    }
}

/// The Provider tier HTTP server.
pub struct ProviderServer {
    config: Arc<Config>,
    state: ProviderState,
}

impl ProviderServer {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let pool = Arc::new(InstancePool::from_config(&config));
        if let Some(path) = &config.provider.registry_path {
            let registry = registry::load(path)?;
            registry::apply(&pool, &registry);
        }
        let state = ProviderState::new(&config, pool);
        Ok(Self { config, state })
    }

    pub fn state(&self) -> &ProviderState {
        &self.state
    }

    pub fn build_router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub async fn run(&self) -> Result<()> {
        HealthProber::new(Arc::clone(&self.state.pool), &self.config).spawn();
        if let Some(path) = &self.config.provider.registry_path {
            registry::spawn_sighup_reloader(Arc::clone(&self.state.pool), path.clone());
        }

        let app = self.build_router();
        let listener = tokio::net::TcpListener::bind(format!(
            "{}:{}",
            self.config.provider.host, self.config.provider.port
        ))
        .await
        .map_err(|e| WopaError::Internal(e.into()))?;

        info!(
            "Provider server listening on {}:{}",
            self.config.provider.host, self.config.provider.port
        );

        axum::serve(listener, app)
            .await
            .map_err(|e| WopaError::Internal(e.into()))?;
        Ok(())
    }
}

pub fn build_router(state: ProviderState) -> Router {
    Router::new()
        .route("/llm/chat_complete", post(chat_complete))
        .route("/llm/vision_complete", post(vision_complete))
        .route("/sandbox/run_file", post(sandbox_run_file))
        .route("/emulator/run_app", post(emulator_run_app))
        .route("/{task_id}/vnc", get(vnc_session))
        .route("/health", get(health))
        .route("/admin/endpoints", get(admin_endpoints))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run `call` against a leased instance; on transport error or timeout,
/// retry exactly once against a different healthy instance. The lease
/// guard restores `in_flight` on every path out of here.
async fn call_with_failover<T, F, Fut>(
    pool: &InstancePool,
    kind: ProviderKind,
    outer_timeout: Option<Duration>,
    call: F,
) -> Result<T>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let lease = pool.acquire(kind).await?;
    let endpoint = lease.endpoint().to_string();
    let first = with_deadline(outer_timeout, call(endpoint.clone())).await;
    drop(lease);

    match first {
        Ok(value) => Ok(value),
        Err(e) if e.is_retryable() => {
            warn!(kind = kind.as_str(), endpoint = %endpoint, "Backend call failed, retrying on another instance: {e}");
            let retry_lease = match pool.acquire_excluding(kind, Some(&endpoint)).await {
                Ok(lease) => lease,
                // No second instance to try; surface the original failure.
                Err(_) => return Err(e),
            };
            let second =
                with_deadline(outer_timeout, call(retry_lease.endpoint().to_string())).await;
            drop(retry_lease);
            second
        }
        Err(e) => Err(e),
    }
}

async fn with_deadline<T>(
    outer: Option<Duration>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match outer {
        Some(deadline) => match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(WopaError::Timeout {
                message: "backend call exceeded its deadline".to_string(),
            }),
        },
        None => fut.await,
    }
}

/// Collapse post-retry transport failures into unavailability, per the
/// propagation policy, then map onto the provider boundary status codes.
fn error_response(err: WopaError, kind: Option<ProviderKind>) -> HandlerError {
    let err = match (err, kind) {
        (e, Some(kind)) if e.is_retryable() => WopaError::ProviderUnavailable { kind },
        (e, _) => e,
    };
    match &err {
        WopaError::Validation(msg) => (
            StatusCode::BAD_REQUEST,
            Json(ProviderErrorBody::new(msg.clone())),
        ),
        WopaError::ProviderUnavailable { kind } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ProviderErrorBody::new(format!(
                "{} unavailable",
                kind.display_name()
            ))),
        ),
        WopaError::ProviderProtocol(_) => (
            StatusCode::BAD_GATEWAY,
            Json(ProviderErrorBody::new(err.user_message())),
        ),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ProviderErrorBody::new("Internal error occurred".to_string())),
        ),
    }
}

async fn chat_complete(
    State(state): State<ProviderState>,
    Json(request): Json<ChatCompleteRequest>,
) -> std::result::Result<Json<ChatCompleteResponse>, HandlerError> {
    let kind = ProviderKind::LlmChat;
    state
        .validator
        .validate_chat_params(&request)
        .map_err(|e| error_response(e, None))?;

    let llm = state.llm.clone();
    let request = Arc::new(request);
    let response = call_with_failover(&state.pool, kind, None, move |endpoint| {
        let llm = llm.clone();
        let request = Arc::clone(&request);
        async move { llm.chat(&endpoint, &request).await }
    })
    .await
    .map_err(|e| error_response(e, Some(kind)))?;

    Ok(Json(ChatCompleteResponse::success(response)))
}

async fn vision_complete(
    State(state): State<ProviderState>,
    Json(request): Json<VisionCompleteRequest>,
) -> std::result::Result<Json<ChatCompleteResponse>, HandlerError> {
    let kind = ProviderKind::LlmVision;
    state
        .validator
        .validate_vision_images(&request.images)
        .map_err(|e| error_response(e, None))?;

    let llm = state.llm.clone();
    let request = Arc::new(request);
    let response = call_with_failover(&state.pool, kind, None, move |endpoint| {
        let llm = llm.clone();
        let request = Arc::clone(&request);
        async move { llm.vision(&endpoint, &request).await }
    })
    .await
    .map_err(|e| error_response(e, Some(kind)))?;

    Ok(Json(ChatCompleteResponse::success(response)))
}

async fn sandbox_run_file(
    State(state): State<ProviderState>,
    Json(request): Json<SandboxRunRequest>,
) -> std::result::Result<Json<SandboxRunResponse>, HandlerError> {
    let kind = ProviderKind::Sandbox;
    state
        .validator
        .validate_file_ref(&request.file_ref)
        .map_err(|e| error_response(e, None))?;

    let sandbox = state.sandbox.clone();
    let request = Arc::new(request);
    let response = call_with_failover(
        &state.pool,
        kind,
        Some(state.sandbox_timeout),
        move |endpoint| {
            let sandbox = sandbox.clone();
            let request = Arc::clone(&request);
            async move { sandbox.run_file(&endpoint, &request).await }
        },
    )
    .await
    .map_err(|e| error_response(e, Some(kind)))?;

    Ok(Json(response))
}

async fn emulator_run_app(
    State(state): State<ProviderState>,
    Json(request): Json<EmulatorRunRequest>,
) -> std::result::Result<Json<EmulatorRunResponse>, HandlerError> {
    let kind = ProviderKind::Emulator;
    state
        .validator
        .validate_app(&request.app_ref, &request.instructions)
        .map_err(|e| error_response(e, None))?;

    let session_id = format!("emulator-{}", Uuid::new_v4());
    let emulator = state.emulator.clone();
    let sessions = Arc::clone(&state.vnc_sessions);
    let request = Arc::new(request);
    let session = session_id.clone();

    let response = call_with_failover(
        &state.pool,
        kind,
        Some(state.emulator_timeout),
        move |endpoint| {
            let emulator = emulator.clone();
            let sessions = Arc::clone(&sessions);
            let request = Arc::clone(&request);
            let session = session.clone();
            async move {
                // Record the VNC target before the run starts so the
                // session is observable while the app executes; a retry
                // on another instance overwrites it.
                let vnc = emulator.vnc_url(&endpoint);
                sessions
                    .lock()
                    .expect("vnc session map poisoned")
                    .insert(session.clone(), vnc);
                emulator.run_app(&endpoint, &session, &request).await
            }
        },
    )
    .await
    .map_err(|e| {
        state
            .vnc_sessions
            .lock()
            .expect("vnc session map poisoned")
            .remove(&session_id);
        error_response(e, Some(kind))
    })?;

    Ok(Json(response))
}

async fn vnc_session(
    State(state): State<ProviderState>,
    Path(task_id): Path<String>,
) -> std::result::Result<Json<serde_json::Value>, HandlerError> {
    let sessions = state.vnc_sessions.lock().expect("vnc session map poisoned");
    match sessions.get(&task_id) {
        Some(url) => Ok(Json(serde_json::json!({
            "task_id": task_id,
            "vnc_url": url,
        }))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ProviderErrorBody::new("Task not found".to_string())),
        )),
    }
}

async fn health(State(state): State<ProviderState>) -> Json<serde_json::Value> {
    let views = state.pool.views();
    let mut kinds = serde_json::Map::new();
    let mut overall_healthy = true;
    for kind in ProviderKind::ALL {
        let of_kind: Vec<&InstanceView> = views.iter().filter(|v| v.kind == kind).collect();
        let healthy = of_kind.iter().filter(|v| v.healthy).count();
        if !of_kind.is_empty() && healthy == 0 {
            overall_healthy = false;
        }
        kinds.insert(
            kind.as_str().to_string(),
            serde_json::json!({
                "instances": of_kind.len(),
                "healthy": healthy,
                "available": healthy > 0,
            }),
        );
    }
    Json(serde_json::json!({
        "status": if overall_healthy { "healthy" } else { "degraded" },
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
        "kinds": kinds,
    }))
}

async fn admin_endpoints(State(state): State<ProviderState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "endpoints": state.pool.views() }))
}
