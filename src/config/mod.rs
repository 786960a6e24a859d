use crate::{Result, WopaError};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;


/// Routing mode: `local` targets the in-cluster provider tier URL;
/// `online` may address external endpoints (out of scope here).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Local,
    Online,
}

/// Process mode from the `MODE` environment variable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Run,
    Test,
}

/// Test granularity from the `TEST_MODE` environment variable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TestMode {
    #[default]
    Unit,
    Integration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    /// Directive string for tracing-subscriber's EnvFilter.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: Mode,
    pub providers_server_url: String,
    pub worker_server_url: String,
    pub service: ServiceConfig,
    pub worker: WorkerConfig,
    pub provider: ProviderConfig,
    pub llm: LlmConfig,
    pub sandbox: SandboxConfig,
    pub emulator: EmulatorConfig,
    pub health: HealthConfig,
    pub logging: LoggingConfig,
    /// Set from env only; never read from the YAML document.
    #[serde(skip)]
    pub run_mode: RunMode,
    #[serde(skip)]
    pub test_mode: TestMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Local,
            providers_server_url: "http://127.0.0.1:8102".to_string(),
            worker_server_url: "http://127.0.0.1:8101".to_string(),
            service: ServiceConfig::default(),
            worker: WorkerConfig::default(),
            provider: ProviderConfig::default(),
            llm: LlmConfig::default(),
            sandbox: SandboxConfig::default(),
            emulator: EmulatorConfig::default(),
            health: HealthConfig::default(),
            logging: LoggingConfig::default(),
            run_mode: RunMode::Run,
            test_mode: TestMode::Unit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub worker_timeout_seconds: u64,
    pub aggregator_timeout_seconds: u64,
    pub task_soft_cap: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8100,
            worker_timeout_seconds: crate::constants::WORKER_TIMEOUT_SECS,
            aggregator_timeout_seconds: crate::constants::AGGREGATOR_TIMEOUT_SECS,
            task_soft_cap: crate::constants::TASK_SOFT_CAP,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub host: String,
    pub port: u16,
    pub parallel_checks: usize,
    pub page_fetch_timeout_seconds: u64,
    pub max_redirects: usize,
    pub max_scripts: usize,
    pub max_script_bytes: usize,
    /// When true, a failed Page_Accessibility step fails the link worker;
    /// when false it is recorded as a failed check and analysis continues.
    pub accessibility_critical: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8101,
            parallel_checks: crate::constants::MAX_PARALLEL_CHECKS,
            page_fetch_timeout_seconds: crate::constants::PAGE_FETCH_TIMEOUT_SECS,
            max_redirects: crate::constants::MAX_REDIRECTS,
            max_scripts: crate::constants::MAX_SCRIPTS,
            max_script_bytes: crate::constants::MAX_SCRIPT_BYTES,
            accessibility_critical: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub host: String,
    pub port: u16,
    /// Optional JSON instance registry written by the provisioner;
    /// re-read atomically on SIGHUP.
    pub registry_path: Option<PathBuf>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8102,
            registry_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub timeout_seconds: u64,
    pub probe_timeout_seconds: u64,
    pub models: LlmModels,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:11434".to_string(),
            timeout_seconds: crate::constants::LLM_TIMEOUT_SECS,
            probe_timeout_seconds: crate::constants::LLM_PROBE_TIMEOUT_SECS,
            models: LlmModels::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LlmModels {
    pub chat_model: ModelConfig,
    pub vision_model: ModelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    /// Pass-through sampling parameters (temperature, top_p, ...).
    pub default_params: serde_json::Map<String, serde_json::Value>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            default_params: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub endpoints: Vec<String>,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub poll_interval_seconds: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            timeout_seconds: crate::constants::SANDBOX_TIMEOUT_SECS,
            max_retries: 1,
            poll_interval_seconds: crate::constants::POLL_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub endpoints: Vec<String>,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub poll_interval_seconds: u64,
    /// Template with `{host}` and `{port}` placeholders.
    pub vnc_url_template: String,
    pub default_vnc_port: u16,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            timeout_seconds: crate::constants::EMULATOR_TIMEOUT_SECS,
            max_retries: 1,
            poll_interval_seconds: crate::constants::POLL_INTERVAL_SECS,
            vnc_url_template: "vnc://{host}:{port}".to_string(),
            default_vnc_port: 5900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub probe_interval_seconds: u64,
    pub unhealthy_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_seconds: crate::constants::HEALTH_PROBE_INTERVAL_SECS,
            unhealthy_threshold: crate::constants::UNHEALTHY_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
}

impl Config {
    /// Load from an optional YAML document, then apply environment
    /// overrides and validate. Errors here are fatal at startup.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        match path {
            Some(p) => {
                builder = builder.add_source(
                    config::File::from(p)
                        .format(config::FileFormat::Yaml)
                        .required(true),
                );
            }
            None => {
                builder = builder.add_source(
                    config::File::with_name("wopa")
                        .format(config::FileFormat::Yaml)
                        .required(false),
                );
            }
        }
        let mut cfg: Config = builder.build()?.try_deserialize()?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Environment variables take precedence over file values.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("PROVIDER_SERVER_URL") {
            if !url.trim().is_empty() {
                self.providers_server_url = url;
            }
        }
        if let Ok(url) = env::var("WORKER_SERVER_URL") {
            if !url.trim().is_empty() {
                self.worker_server_url = url;
            }
        }
        if let Ok(mode) = env::var("MODE") {
            match mode.to_lowercase().as_str() {
                "test" => self.run_mode = RunMode::Test,
                "run" => self.run_mode = RunMode::Run,
                other => tracing::warn!("Ignoring unrecognized MODE value: {other}"),
            }
        }
        if let Ok(mode) = env::var("TEST_MODE") {
            match mode.to_lowercase().as_str() {
                "integration" => self.test_mode = TestMode::Integration,
                "unit" => self.test_mode = TestMode::Unit,
                other => tracing::warn!("Ignoring unrecognized TEST_MODE value: {other}"),
            }
        }
    }

    fn validate(&self) -> Result<()> {
        for (name, raw) in [
            ("providers_server_url", &self.providers_server_url),
            ("worker_server_url", &self.worker_server_url),
            ("llm.endpoint", &self.llm.endpoint),
        ] {
            url::Url::parse(raw).map_err(|e| {
                WopaError::ConfigurationError(format!("{name} is not a valid URL: {e}"))
            })?;
        }
        for endpoint in self.sandbox.endpoints.iter().chain(&self.emulator.endpoints) {
            url::Url::parse(endpoint).map_err(|e| {
                WopaError::ConfigurationError(format!("invalid backend endpoint {endpoint}: {e}"))
            })?;
        }
        if self.worker.parallel_checks == 0 {
            return Err(WopaError::ConfigurationError(
                "worker.parallel_checks must be at least 1".to_string(),
            ));
        }
        if !self.emulator.vnc_url_template.contains("{host}") {
            return Err(WopaError::ConfigurationError(
                "emulator.vnc_url_template must contain a {host} placeholder".to_string(),
            ));
        }
        Ok(())
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.service.worker_timeout_seconds)
    }

    pub fn aggregator_timeout(&self) -> Duration {
        Duration::from_secs(self.service.aggregator_timeout_seconds)
    }

    /// Effective configuration with backend addresses redacted, for the
    /// worker tier's `/configs` endpoint.
    pub fn sanitized(&self) -> serde_json::Value {
        serde_json::json!({
            "mode": self.mode,
            "worker": self.worker,
            "service": {
                "worker_timeout_seconds": self.service.worker_timeout_seconds,
                "aggregator_timeout_seconds": self.service.aggregator_timeout_seconds,
            },
            "llm": {
                "models": {
                    "chat_model": { "name": self.llm.models.chat_model.name },
                    "vision_model": { "name": self.llm.models.vision_model.name },
                },
            },
            "health": self.health,
            "logging": self.logging,
        })
    }
}
