use super::pool::InstancePool;
use crate::config::Config;
use crate::models::ProviderKind;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Background health prober. One scheduler task probes every registered
/// instance on a fixed cadence; instances flip unhealthy after the
/// configured number of consecutive failures and recover on a single
/// success.
pub struct HealthProber {
    pool: Arc<InstancePool>,
    client: reqwest::Client,
    interval: Duration,
    threshold: u32,
    llm_probe_timeout: Duration,
}

impl HealthProber {
    pub fn new(pool: Arc<InstancePool>, config: &Config) -> Self {
        Self {
            pool,
            client: reqwest::Client::new(),
            interval: Duration::from_secs(config.health.probe_interval_seconds),
            threshold: config.health.unhealthy_threshold,
            llm_probe_timeout: Duration::from_secs(config.llm.probe_timeout_seconds),
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.probe_all().await;
            }
        })
    }

    async fn probe_all(&self) {
        for kind in ProviderKind::ALL {
            for instance in self.pool.snapshot(kind) {
                let healthy_before = instance.is_healthy();
                if self.probe(kind, &instance.endpoint).await {
                    instance.record_probe_success();
                    if !healthy_before {
                        debug!(kind = kind.as_str(), endpoint = %instance.endpoint, "Instance recovered");
                    }
                } else {
                    instance.record_probe_failure(self.threshold);
                    if healthy_before && !instance.is_healthy() {
                        warn!(kind = kind.as_str(), endpoint = %instance.endpoint, "Instance marked unhealthy");
                    }
                }
            }
        }
    }

    async fn probe(&self, kind: ProviderKind, endpoint: &str) -> bool {
        match kind {
            // A trivial completion proves the model actually answers.
            ProviderKind::LlmChat | ProviderKind::LlmVision => {
                let body = serde_json::json!({
                    "messages": [{"role": "user", "content": "ping"}],
                    "max_tokens": 1,
                });
                self.client
                    .post(format!("{}/v1/chat/completions", endpoint.trim_end_matches('/')))
                    .timeout(self.llm_probe_timeout)
                    .json(&body)
                    .send()
                    .await
                    .map(|r| r.status().is_success())
                    .unwrap_or(false)
            }
            ProviderKind::Sandbox => self.ping(endpoint, "ping").await,
            // The backend's status endpoint fronts its ADB connection.
            ProviderKind::Emulator => self.ping(endpoint, "status").await,
        }
    }

    async fn ping(&self, endpoint: &str, path: &str) -> bool {
        self.client
            .get(format!("{}/{path}", endpoint.trim_end_matches('/')))
            .timeout(self.llm_probe_timeout)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prober_with_pool(endpoints: &[(String, usize)]) -> (HealthProber, Arc<InstancePool>) {
        let pool = Arc::new(InstancePool::new());
        pool.replace(ProviderKind::Sandbox, endpoints);
        let config = Config::default();
        (HealthProber::new(Arc::clone(&pool), &config), pool)
    }

    #[tokio::test]
    async fn three_failures_mark_unhealthy_one_success_restores() {
        let mut server = mockito::Server::new_async().await;
        let (prober, pool) = prober_with_pool(&[(server.url(), 1)]);

        let failing = server
            .mock("GET", "/ping")
            .with_status(500)
            .expect(3)
            .create_async()
            .await;
        for _ in 0..3 {
            prober.probe_all().await;
        }
        failing.assert_async().await;
        assert!(!pool.snapshot(ProviderKind::Sandbox)[0].is_healthy());

        let _ok = server
            .mock("GET", "/ping")
            .with_status(200)
            .create_async()
            .await;
        prober.probe_all().await;
        assert!(pool.snapshot(ProviderKind::Sandbox)[0].is_healthy());
    }

    #[tokio::test]
    async fn two_failures_keep_instance_healthy() {
        let mut server = mockito::Server::new_async().await;
        let (prober, pool) = prober_with_pool(&[(server.url(), 1)]);
        let _failing = server
            .mock("GET", "/ping")
            .with_status(500)
            .create_async()
            .await;
        for _ in 0..2 {
            prober.probe_all().await;
        }
        assert!(pool.snapshot(ProviderKind::Sandbox)[0].is_healthy());
    }

    #[tokio::test]
    async fn unreachable_endpoint_counts_as_failure() {
        let (prober, pool) = prober_with_pool(&[("http://127.0.0.1:1".to_string(), 1)]);
        for _ in 0..3 {
            prober.probe_all().await;
        }
        assert!(!pool.snapshot(ProviderKind::Sandbox)[0].is_healthy());
    }
}
