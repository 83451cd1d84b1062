// One measurement run: executes the phases named by `test_order` and keeps
// the shared status snapshot current for the command loop to report.

use crate::settings::WorkerSettings;
use anyhow::Result;
use bytes::Bytes;
use parking_lot::Mutex;
use speedtest_common::{StatusSnapshot, TestPhase};
use speedtest_sdk::{TraceWriter, UrlUtil};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Interval at which transfer phases refresh speed and progress.
const SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

/// Pause inserted for each `_` in the test order.
const PHASE_PAUSE: Duration = Duration::from_secs(1);

/// Per-request timeout for ping and IP lookups.
const SHORT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Back-off after a failed transfer request before the stream retries.
const STREAM_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Piece size used when streaming upload bodies.
const UPLOAD_PIECE: usize = 64 * 1024;

/// Snapshot shared between a run and the command loop.
pub type SharedStatus = Arc<Mutex<StatusSnapshot>>;

/// A single phase named in the test order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ClientIp,
    Ping,
    Download,
    Upload,
    Pause,
}

/// Parse a test order string. Unknown characters are skipped.
pub fn parse_test_order(order: &str) -> Vec<Step> {
    order
        .chars()
        .filter_map(|c| match c.to_ascii_uppercase() {
            'I' => Some(Step::ClientIp),
            'P' => Some(Step::Ping),
            'D' => Some(Step::Download),
            'U' => Some(Step::Upload),
            '_' => Some(Step::Pause),
            _ => None,
        })
        .collect()
}

/// Running ping and jitter estimate.
///
/// Ping keeps the lowest round trip seen. Jitter smooths the absolute
/// difference between consecutive round trips, reacting faster to rises
/// than to falls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PingStats {
    pub ping: Option<f64>,
    pub jitter: Option<f64>,
    last: Option<f64>,
}

impl PingStats {
    pub fn record(&mut self, rtt_ms: f64) {
        if let Some(last) = self.last {
            let delta = (rtt_ms - last).abs();
            self.jitter = Some(match self.jitter {
                None => delta,
                Some(j) if delta > j => j * 0.3 + delta * 0.7,
                Some(j) => j * 0.8 + delta * 0.2,
            });
        }
        self.ping = Some(self.ping.map_or(rtt_ms, |p| p.min(rtt_ms)));
        self.last = Some(rtt_ms);
    }
}

/// Executes one run against the shared snapshot.
pub struct MeasurementRun {
    settings: WorkerSettings,
    client: reqwest::Client,
    status: SharedStatus,
    cancel: CancellationToken,
    trace: Arc<dyn TraceWriter>,
}

impl MeasurementRun {
    pub fn new(
        settings: WorkerSettings,
        client: reqwest::Client,
        status: SharedStatus,
        cancel: CancellationToken,
        trace: Arc<dyn TraceWriter>,
    ) -> Self {
        Self {
            settings,
            client,
            status,
            cancel,
            trace,
        }
    }

    /// Run every phase, then report `FINISHED`. A failing phase ends the run
    /// with `ABORTED`; a cancelled run leaves the phase the aborter set.
    pub async fn run(self) {
        self.update(|s| s.test_state = TestPhase::STARTING);

        for step in parse_test_order(&self.settings.test_order) {
            if self.cancel.is_cancelled() {
                return;
            }
            let result = match step {
                Step::ClientIp => self.client_ip().await,
                Step::Ping => self.ping().await,
                Step::Download => self.download().await,
                Step::Upload => self.upload().await,
                Step::Pause => {
                    self.pause(PHASE_PAUSE).await;
                    Ok(())
                }
            };
            if let Err(e) = result {
                self.trace.error(&format!("{:?} phase failed: {:#}", step, e));
                self.update(|s| s.test_state = TestPhase::ABORTED);
                self.cancel.cancel();
                return;
            }
        }

        self.update(|s| s.test_state = TestPhase::FINISHED);
        self.trace.info("Measurement run finished");
    }

    /// Mutate the snapshot unless the run has been cancelled.
    fn update(&self, f: impl FnOnce(&mut StatusSnapshot)) {
        // Checked under the lock: an abort cancels while holding it.
        let mut status = self.status.lock();
        if self.cancel.is_cancelled() {
            return;
        }
        f(&mut status);
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    // -----------------------------------------------------------------------
    // Client IP
    // -----------------------------------------------------------------------

    async fn client_ip(&self) -> Result<()> {
        let mut url = self.settings.url_get_ip.clone();
        if self.settings.get_ip_isp_info {
            url = UrlUtil::append_query(&url, "isp", "true");
        }
        let url = UrlUtil::append_query(&url, "r", &rand::random::<u32>().to_string());
        UrlUtil::parse_http(&url)?;

        let response = self
            .client
            .get(&url)
            .timeout(SHORT_REQUEST_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status());

        let body = match response {
            Ok(r) => r.text().await.unwrap_or_default(),
            Err(e) => {
                self.trace.warning(&format!("Client IP lookup failed: {}", e));
                return Ok(());
            }
        };

        let client_ip = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("processedString").and_then(|p| p.as_str()).map(str::to_string))
            .unwrap_or_else(|| body.trim().to_string());

        self.update(|s| s.client_ip = client_ip);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Ping / jitter
    // -----------------------------------------------------------------------

    async fn ping(&self) -> Result<()> {
        self.update(|s| s.test_state = TestPhase::PING);
        UrlUtil::parse_http(&self.settings.url_ping)?;

        let count = self.settings.count_ping.max(1);
        let mut stats = PingStats::default();

        for i in 0..count {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let url = UrlUtil::append_query(
                &self.settings.url_ping,
                "r",
                &rand::random::<u32>().to_string(),
            );
            let started = Instant::now();
            let request = self.client.get(&url).timeout(SHORT_REQUEST_TIMEOUT).send();
            let response = tokio::select! {
                r = request => r,
                _ = self.cancel.cancelled() => return Ok(()),
            };

            match response.and_then(|r| r.error_for_status()) {
                Ok(_) => stats.record(started.elapsed().as_secs_f64() * 1000.0),
                Err(e) => self.trace.verbose(&format!("Ping sample {} failed: {}", i, e)),
            }

            let progress = f64::from(i + 1) / f64::from(count);
            self.update(|s| {
                s.ping_status = stats.ping;
                s.jitter_status = stats.jitter;
                s.ping_progress = progress;
            });
        }

        if stats.ping.is_none() {
            anyhow::bail!("no ping sample succeeded against {}", self.settings.url_ping);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Download / upload
    // -----------------------------------------------------------------------

    async fn download(&self) -> Result<()> {
        self.update(|s| s.test_state = TestPhase::DOWNLOAD);
        let base = UrlUtil::append_query(
            &self.settings.url_dl,
            "ckSize",
            &self.settings.dl_chunk_size.to_string(),
        );
        UrlUtil::parse_http(&base)?;

        let client = self.client.clone();
        let trace = self.trace.clone();
        self.timed_transfer(
            self.settings.dl_streams,
            self.settings.download_window(),
            self.settings.download_grace(),
            move |loaded, stop| {
                download_stream(client.clone(), base.clone(), loaded, stop, trace.clone())
            },
            |s, speed, progress| {
                s.dl_status = Some(speed);
                s.dl_progress = progress;
            },
        )
        .await;
        Ok(())
    }

    async fn upload(&self) -> Result<()> {
        self.update(|s| s.test_state = TestPhase::UPLOAD);
        UrlUtil::parse_http(&self.settings.url_ul)?;

        let piece = random_piece(UPLOAD_PIECE);
        let pieces = (self.settings.ul_blob_megabytes as usize * 1024 * 1024) / UPLOAD_PIECE;
        let client = self.client.clone();
        let url = self.settings.url_ul.clone();
        let trace = self.trace.clone();
        self.timed_transfer(
            self.settings.ul_streams,
            self.settings.upload_window(),
            self.settings.upload_grace(),
            move |loaded, stop| {
                upload_stream(
                    client.clone(),
                    url.clone(),
                    piece.clone(),
                    pieces,
                    loaded,
                    stop,
                    trace.clone(),
                )
            },
            |s, speed, progress| {
                s.ul_status = Some(speed);
                s.ul_progress = progress;
            },
        )
        .await;
        Ok(())
    }

    /// Drive `streams` concurrent transfer loops for `window`, sampling the
    /// shared byte counter every [`SAMPLE_INTERVAL`]. Bytes moved during the
    /// first `grace` are discarded and the clock restarts once it elapses.
    async fn timed_transfer<S, Fut>(
        &self,
        streams: usize,
        window: Duration,
        grace: Duration,
        spawn_stream: S,
        report: impl Fn(&mut StatusSnapshot, f64, f64),
    ) where
        S: Fn(Arc<AtomicU64>, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let loaded = Arc::new(AtomicU64::new(0));
        let stop = self.cancel.child_token();
        let handles: Vec<_> = (0..streams.max(1))
            .map(|_| tokio::spawn(spawn_stream(loaded.clone(), stop.clone())))
            .collect();

        let mut started = Instant::now();
        let mut in_grace = !grace.is_zero();
        let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.cancel.cancelled() => break,
            }

            let elapsed = started.elapsed();
            if in_grace {
                if elapsed >= grace {
                    loaded.store(0, Ordering::Relaxed);
                    started = Instant::now();
                    in_grace = false;
                }
                continue;
            }

            let speed = self.settings.speed(loaded.load(Ordering::Relaxed), elapsed);
            let progress = (elapsed.as_secs_f64() / window.as_secs_f64()).min(1.0);
            self.update(|s| report(s, speed, progress));

            if elapsed >= window {
                break;
            }
        }

        stop.cancel();
        futures::future::join_all(handles).await;
    }
}

async fn download_stream(
    client: reqwest::Client,
    url: String,
    loaded: Arc<AtomicU64>,
    stop: CancellationToken,
    trace: Arc<dyn TraceWriter>,
) {
    while !stop.is_cancelled() {
        let request_url = UrlUtil::append_query(&url, "r", &rand::random::<u32>().to_string());
        let fetch = async {
            let mut response = client.get(&request_url).send().await?.error_for_status()?;
            while let Some(chunk) = response.chunk().await? {
                loaded.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
            Ok::<_, reqwest::Error>(())
        };

        let result = tokio::select! {
            r = fetch => r,
            _ = stop.cancelled() => return,
        };
        if let Err(e) = result {
            trace.verbose(&format!("Download stream request failed: {}", e));
            retry_delay(&stop).await;
        }
    }
}

async fn upload_stream(
    client: reqwest::Client,
    url: String,
    piece: Bytes,
    pieces: usize,
    loaded: Arc<AtomicU64>,
    stop: CancellationToken,
    trace: Arc<dyn TraceWriter>,
) {
    while !stop.is_cancelled() {
        let request_url = UrlUtil::append_query(&url, "r", &rand::random::<u32>().to_string());
        let counter = loaded.clone();
        let body_piece = piece.clone();
        // Bytes are counted as the HTTP client pulls them from the body stream.
        let body = futures::stream::iter((0..pieces.max(1)).map(move |_| {
            counter.fetch_add(body_piece.len() as u64, Ordering::Relaxed);
            Ok::<Bytes, std::io::Error>(body_piece.clone())
        }));

        let send = client
            .post(&request_url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(body))
            .send();

        let result = tokio::select! {
            r = send => r.and_then(|r| r.error_for_status()).map(|_| ()),
            _ = stop.cancelled() => return,
        };
        if let Err(e) = result {
            trace.verbose(&format!("Upload stream request failed: {}", e));
            retry_delay(&stop).await;
        }
    }
}

async fn retry_delay(stop: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(STREAM_RETRY_DELAY) => {}
        _ = stop.cancelled() => {}
    }
}

/// Incompressible upload payload.
fn random_piece(len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    rand::Rng::fill(&mut rand::thread_rng(), &mut data[..]);
    Bytes::from(data)
}
