use crate::models::ProviderKind;
use crate::{Result, WopaError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;

/// A single concrete backend endpoint of one provider kind.
///
/// Health and load are tracked with atomics so selection, completion,
/// and the health prober can update concurrently without a lock.
#[derive(Debug)]
pub struct Instance {
    pub kind: ProviderKind,
    pub endpoint: String,
    pub capacity: usize,
    in_flight: AtomicUsize,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    last_check: Mutex<Option<chrono::DateTime<chrono::Utc>>>,
}

impl Instance {
    pub fn new(kind: ProviderKind, endpoint: String, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            kind,
            endpoint,
            capacity: capacity.max(1),
            in_flight: AtomicUsize::new(0),
            // Instances start healthy; the first probe corrects this.
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            last_check: Mutex::new(None),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn last_check(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        *self.last_check.lock().expect("instance state poisoned")
    }

    /// One probe success restores health immediately.
    pub fn record_probe_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.healthy.store(true, Ordering::SeqCst);
        *self.last_check.lock().expect("instance state poisoned") = Some(chrono::Utc::now());
    }

    /// Marks unhealthy once `threshold` consecutive probes have failed.
    pub fn record_probe_failure(&self, threshold: u32) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= threshold {
            self.healthy.store(false, Ordering::SeqCst);
        }
        *self.last_check.lock().expect("instance state poisoned") = Some(chrono::Utc::now());
    }

    /// CAS-increment `in_flight` if a slot is free.
    fn try_acquire_slot(&self) -> bool {
        let mut current = self.in_flight.load(Ordering::SeqCst);
        loop {
            if current >= self.capacity {
                return false;
            }
            match self.in_flight.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn release_slot(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Snapshot of one instance for `/health` and `/admin/endpoints`.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceView {
    pub kind: ProviderKind,
    pub endpoint: String,
    pub capacity: usize,
    pub in_flight: usize,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<chrono::DateTime<chrono::Utc>>,
}

/// RAII lease on an instance slot.
///
/// Dropping the lease decrements `in_flight` and wakes pool waiters,
/// which guarantees the counter restores on success, error, and
/// cancellation alike.
#[derive(Debug)]
pub struct InstanceLease {
    instance: Arc<Instance>,
    released: Arc<Notify>,
}

impl InstanceLease {
    pub fn endpoint(&self) -> &str {
        &self.instance.endpoint
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        self.instance.release_slot();
        self.released.notify_waiters();
    }
}

/// Instance pools per provider kind with least-loaded-healthy selection.
///
/// Selection picks the healthy instance with the lowest `in_flight`,
/// breaking ties by lowest index. When every healthy instance is at
/// capacity the caller waits for a lease to free; when no healthy
/// instance exists at all the call fails with ProviderUnavailable.
pub struct InstancePool {
    kinds: RwLock<HashMap<ProviderKind, Vec<Arc<Instance>>>>,
    released: Arc<Notify>,
}

impl Default for InstancePool {
    fn default() -> Self {
        Self::new()
    }
}

impl InstancePool {
    pub fn new() -> Self {
        let mut kinds = HashMap::new();
        for kind in ProviderKind::ALL {
            kinds.insert(kind, Vec::new());
        }
        Self {
            kinds: RwLock::new(kinds),
            released: Arc::new(Notify::new()),
        }
    }

    /// Build the initial pools from static configuration. Both LLM kinds
    /// share the configured LLM endpoint; sandbox and emulator pools come
    /// from their endpoint lists.
    pub fn from_config(config: &crate::config::Config) -> Self {
        let pool = Self::new();
        pool.replace(
            ProviderKind::LlmChat,
            &[(config.llm.endpoint.clone(), 1)],
        );
        pool.replace(
            ProviderKind::LlmVision,
            &[(config.llm.endpoint.clone(), 1)],
        );
        let sandbox: Vec<(String, usize)> = config
            .sandbox
            .endpoints
            .iter()
            .map(|e| (e.clone(), 1))
            .collect();
        pool.replace(ProviderKind::Sandbox, &sandbox);
        let emulator: Vec<(String, usize)> = config
            .emulator
            .endpoints
            .iter()
            .map(|e| (e.clone(), 1))
            .collect();
        pool.replace(ProviderKind::Emulator, &emulator);
        pool
    }

    /// Replace the instance set of one kind. Instances surviving by
    /// endpoint keep their identity, so health state and in-flight
    /// counters persist across registry reloads; removed instances keep
    /// serving calls that hold leases on them.
    pub fn replace(&self, kind: ProviderKind, endpoints: &[(String, usize)]) {
        let mut kinds = self.kinds.write().expect("pool poisoned");
        let existing = kinds.remove(&kind).unwrap_or_default();
        let mut next = Vec::with_capacity(endpoints.len());
        for (endpoint, capacity) in endpoints {
            match existing.iter().find(|i| &i.endpoint == endpoint) {
                Some(kept) => next.push(Arc::clone(kept)),
                None => next.push(Instance::new(kind, endpoint.clone(), *capacity)),
            }
        }
        kinds.insert(kind, next);
        drop(kinds);
        // Capacity may have appeared; wake anyone queued.
        self.released.notify_waiters();
    }

    pub fn snapshot(&self, kind: ProviderKind) -> Vec<Arc<Instance>> {
        let kinds = self.kinds.read().expect("pool poisoned");
        kinds.get(&kind).cloned().unwrap_or_default()
    }

    pub fn views(&self) -> Vec<InstanceView> {
        let kinds = self.kinds.read().expect("pool poisoned");
        let mut views = Vec::new();
        for kind in ProviderKind::ALL {
            if let Some(instances) = kinds.get(&kind) {
                for instance in instances {
                    views.push(InstanceView {
                        kind,
                        endpoint: instance.endpoint.clone(),
                        capacity: instance.capacity,
                        in_flight: instance.in_flight(),
                        healthy: instance.is_healthy(),
                        last_check: instance.last_check(),
                    });
                }
            }
        }
        views
    }

    pub fn has_healthy(&self, kind: ProviderKind) -> bool {
        self.snapshot(kind).iter().any(|i| i.is_healthy())
    }

    /// Acquire a lease on the least-loaded healthy instance, waiting for
    /// capacity when all are busy.
    pub async fn acquire(&self, kind: ProviderKind) -> Result<InstanceLease> {
        self.acquire_excluding(kind, None).await
    }

    /// Like `acquire`, but never selects `exclude`. Used for the single
    /// retry against a different instance.
    pub async fn acquire_excluding(
        &self,
        kind: ProviderKind,
        exclude: Option<&str>,
    ) -> Result<InstanceLease> {
        loop {
            // Register interest before probing so a release between the
            // probe and the await cannot be missed.
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            match self.try_acquire_now(kind, exclude)? {
                Some(lease) => return Ok(lease),
                None => released.await,
            }
        }
    }

    /// One selection attempt. `Ok(None)` means every healthy instance is
    /// at capacity; `Err` means no healthy instance exists.
    fn try_acquire_now(
        &self,
        kind: ProviderKind,
        exclude: Option<&str>,
    ) -> Result<Option<InstanceLease>> {
        let candidates: Vec<Arc<Instance>> = self
            .snapshot(kind)
            .into_iter()
            .filter(|i| i.is_healthy())
            .filter(|i| exclude != Some(i.endpoint.as_str()))
            .collect();
        if candidates.is_empty() {
            return Err(WopaError::ProviderUnavailable { kind });
        }

        // Stable sort keeps the lowest-index instance first among ties.
        let mut ordered: Vec<(usize, Arc<Instance>)> =
            candidates.into_iter().enumerate().collect();
        ordered.sort_by_key(|(idx, i)| (i.in_flight(), *idx));

        for (_, instance) in ordered {
            if instance.try_acquire_slot() {
                return Ok(Some(InstanceLease {
                    instance,
                    released: Arc::clone(&self.released),
                }));
            }
        }
        Ok(None)
    }
}
