use super::pool::InstancePool;
use crate::models::ProviderKind;
use crate::{Result, WopaError};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

/// One entry of the dynamic instance registry written by the external
/// provisioner.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryEntry {
    pub endpoint: String,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

fn default_capacity() -> usize {
    1
}

/// Parsed registry: provider kind to its provisioned endpoints.
pub type Registry = HashMap<ProviderKind, Vec<RegistryEntry>>;

/// Parse the registry document. Unknown kind keys are skipped with a
/// warning so a newer provisioner does not take the tier down.
pub fn parse(raw: &str) -> Result<Registry> {
    let document: HashMap<String, Vec<RegistryEntry>> = serde_json::from_str(raw)?;
    let mut registry = Registry::new();
    for (kind_name, entries) in document {
        match ProviderKind::from_str(&kind_name) {
            Ok(kind) => {
                registry.insert(kind, entries);
            }
            Err(_) => warn!("Skipping unknown provider kind in registry: {kind_name}"),
        }
    }
    Ok(registry)
}

/// Read and parse the registry file.
pub fn load(path: &Path) -> Result<Registry> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        WopaError::ConfigurationError(format!(
            "Cannot read instance registry {}: {e}",
            path.display()
        ))
    })?;
    parse(&raw)
}

/// Apply a registry snapshot to the pool. Only the kinds the document
/// names are replaced; in-flight calls complete against their leased
/// instances regardless.
pub fn apply(pool: &InstancePool, registry: &Registry) {
    for (kind, entries) in registry {
        let endpoints: Vec<(String, usize)> = entries
            .iter()
            .map(|e| (e.endpoint.clone(), e.capacity))
            .collect();
        info!(
            kind = kind.as_str(),
            instances = endpoints.len(),
            "Applying instance registry"
        );
        pool.replace(*kind, &endpoints);
    }
}

/// Reload the registry on SIGHUP for as long as the process lives.
/// Reload failures keep the previous snapshot.
pub fn spawn_sighup_reloader(pool: Arc<InstancePool>, path: PathBuf) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut hangup = match signal(SignalKind::hangup()) {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Cannot install SIGHUP handler: {e}");
                    return;
                }
            };
            loop {
                hangup.recv().await;
                info!("SIGHUP received, reloading instance registry");
                match load(&path) {
                    Ok(registry) => apply(&pool, &registry),
                    Err(e) => error!("Registry reload failed, keeping previous snapshot: {e}"),
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (pool, path);
        }
    });
}
