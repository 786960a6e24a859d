//! # WOPA Core
//!
//! WOPA analyzes potentially malicious inputs (free-text messages,
//! URLs, files, and mobile application packages) and returns a
//! structured risk verdict.
//!
//! ## Architecture
//!
//! Three cooperating HTTP services plus the libraries they share:
//! - **Service tier**: public API; validates input, creates tasks,
//!   orchestrates worker dispatch and aggregator fan-in
//! - **Worker tier**: five statically composed analyzers (text, link,
//!   file static, file dynamic, app behavior) built from parallel checks
//! - **Provider tier**: backend abstraction over the local LLM
//!   (chat + vision), the dynamic-analysis sandbox, and Android
//!   emulators, with instance pools, health probing, and failover
//!
//! The tiers run as separate processes (`wopa-service`, `wopa-worker`,
//! `wopa-provider`) or together in one process (`wopa`) for local use.

/// System configuration loaded from YAML plus environment overrides
pub mod config;
/// System-wide default values
pub mod constants;
/// Error types and handling
pub mod error;
/// Core data model: tasks, checks, verdicts, wire contracts
pub mod models;
/// Provider tier: instance pools, health, backend routing
pub mod provider;
/// Service tier: public HTTP surface and aggregation
pub mod service;
/// Per-tier in-memory task store
pub mod store;
/// Input validation at the public and provider boundaries
pub mod validation;
/// Worker tier: check compositions and dispatch
pub mod worker;

pub use error::{Result, WopaError};
