// Latency probing used to pick the fastest endpoint.

use crate::registry::Endpoint;
use async_trait::async_trait;
use futures::StreamExt;
use speedtest_sdk::UrlUtil;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How many endpoints are probed concurrently.
pub const PROBE_CONCURRENCY: usize = 6;

/// Measures round-trip latency to one endpoint.
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    /// `None` when the endpoint could not be reached.
    async fn probe(&self, endpoint: &Endpoint) -> Option<Duration>;
}

/// Probes an endpoint's ping address over HTTP, keeping the fastest of a
/// few attempts.
pub struct HttpLatencyProbe {
    client: reqwest::Client,
    attempts: usize,
    timeout: Duration,
}

impl HttpLatencyProbe {
    pub const DEFAULT_ATTEMPTS: usize = 3;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            attempts: Self::DEFAULT_ATTEMPTS,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Per-request timeout; a slower answer counts as unreachable.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn ping_once(&self, address: &str) -> Option<Duration> {
        let nonce = rand::random::<u32>().to_string();
        let url = UrlUtil::append_query(address, "r", &nonce);

        let started = Instant::now();
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            tracing::debug!("Ping to {} returned {}", url, response.status());
            return None;
        }
        response.bytes().await.ok()?;
        Some(started.elapsed())
    }
}

impl Default for HttpLatencyProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LatencyProbe for HttpLatencyProbe {
    async fn probe(&self, endpoint: &Endpoint) -> Option<Duration> {
        let address = endpoint.ping_address();
        if let Err(e) = UrlUtil::parse_http(&address) {
            tracing::debug!("Skipping endpoint '{}': {}", endpoint.name, e);
            return None;
        }

        let mut best: Option<Duration> = None;
        for _ in 0..self.attempts {
            if let Some(rtt) = self.ping_once(&address).await {
                best = Some(best.map_or(rtt, |b| b.min(rtt)));
            }
        }
        best
    }
}

/// Probe every endpoint, at most [`PROBE_CONCURRENCY`] at a time. The
/// result is in registration order.
pub async fn probe_all(
    probe: Arc<dyn LatencyProbe>,
    endpoints: Vec<Endpoint>,
) -> Vec<Option<Duration>> {
    futures::stream::iter(endpoints.into_iter().map(move |endpoint| {
        let probe = probe.clone();
        async move { probe.probe(&endpoint).await }
    }))
    .buffered(PROBE_CONCURRENCY)
    .collect()
    .await
}
