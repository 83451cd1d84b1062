// Worker settings decoded from the `start` payload.

use serde_json::{Map, Value};
use speedtest_sdk::TraceWriter;
use std::time::Duration;

/// Upper bound on parallel transfer streams per phase.
pub const MAX_STREAMS: usize = 32;

/// Tunables for one measurement run.
///
/// The payload is applied key by key over the defaults: unknown keys are
/// ignored and values of the wrong type are skipped with a warning, so a bad
/// entry never prevents a run.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Phase sequence: `I` ip, `P` ping/jitter, `D` download, `U` upload, `_` pause.
    pub test_order: String,
    /// Download phase length in seconds.
    pub time_dl_max: f64,
    /// Upload phase length in seconds.
    pub time_ul_max: f64,
    /// Seconds of download traffic discarded while connections ramp up.
    pub time_dl_grace: f64,
    /// Seconds of upload traffic discarded while connections ramp up.
    pub time_ul_grace: f64,
    /// Number of ping samples.
    pub count_ping: u32,
    pub url_dl: String,
    pub url_ul: String,
    pub url_ping: String,
    pub url_get_ip: String,
    /// Ask the IP endpoint for ISP details.
    pub get_ip_isp_info: bool,
    /// Parallel download streams.
    pub dl_streams: usize,
    /// Parallel upload streams.
    pub ul_streams: usize,
    /// Size of each upload request body in MiB.
    pub ul_blob_megabytes: u32,
    /// MiB requested per download request (`ckSize`).
    pub dl_chunk_size: u32,
    /// Multiplier applied to raw payload throughput to account for protocol overhead.
    pub overhead_compensation: f64,
    /// Report Mibit/s instead of Mbit/s.
    pub use_mebibits: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            test_order: "IP_D_U".to_string(),
            time_dl_max: 15.0,
            time_ul_max: 15.0,
            time_dl_grace: 1.5,
            time_ul_grace: 3.0,
            count_ping: 10,
            url_dl: "backend/garbage.php".to_string(),
            url_ul: "backend/empty.php".to_string(),
            url_ping: "backend/empty.php".to_string(),
            url_get_ip: "backend/getIP.php".to_string(),
            get_ip_isp_info: true,
            dl_streams: 6,
            ul_streams: 3,
            ul_blob_megabytes: 20,
            dl_chunk_size: 100,
            overhead_compensation: 1.06,
            use_mebibits: false,
        }
    }
}

impl WorkerSettings {
    /// Decode a `start` payload. Fails only when the payload is not a JSON object.
    pub fn from_json(payload: &str, trace: &dyn TraceWriter) -> Result<Self, serde_json::Error> {
        let map: Map<String, Value> = serde_json::from_str(payload)?;
        let mut settings = Self::default();
        for (key, value) in &map {
            if !settings.apply(key, value) {
                trace.warning(&format!("Ignoring setting {key}={value}"));
            }
        }
        Ok(settings)
    }

    /// Apply one entry. Returns `false` when the key is unknown or the value
    /// has the wrong type.
    fn apply(&mut self, key: &str, value: &Value) -> bool {
        fn text(value: &Value) -> Option<String> {
            value.as_str().map(str::to_string)
        }
        fn seconds(value: &Value) -> Option<f64> {
            value
                .as_f64()
                .filter(|v| Duration::try_from_secs_f64(*v).is_ok())
        }
        fn count(value: &Value) -> Option<u32> {
            value.as_u64().and_then(|v| u32::try_from(v).ok())
        }
        fn streams(value: &Value) -> Option<usize> {
            count(value)
                .filter(|v| *v > 0)
                .map(|v| (v as usize).min(MAX_STREAMS))
        }

        let applied = match key {
            "test_order" => text(value).map(|v| self.test_order = v),
            "time_dl_max" => seconds(value).map(|v| self.time_dl_max = v),
            "time_ul_max" => seconds(value).map(|v| self.time_ul_max = v),
            "time_dlGraceTime" => seconds(value).map(|v| self.time_dl_grace = v),
            "time_ulGraceTime" => seconds(value).map(|v| self.time_ul_grace = v),
            "count_ping" => count(value).map(|v| self.count_ping = v),
            "url_dl" => text(value).map(|v| self.url_dl = v),
            "url_ul" => text(value).map(|v| self.url_ul = v),
            "url_ping" => text(value).map(|v| self.url_ping = v),
            "url_getIp" => text(value).map(|v| self.url_get_ip = v),
            "getIp_ispInfo" => value.as_bool().map(|v| self.get_ip_isp_info = v),
            "xhr_dlMultistream" => streams(value).map(|v| self.dl_streams = v),
            "xhr_ulMultistream" => streams(value).map(|v| self.ul_streams = v),
            "xhr_ul_blob_megabytes" => count(value)
                .filter(|v| *v > 0)
                .map(|v| self.ul_blob_megabytes = v),
            "garbagePhp_chunkSize" => count(value)
                .filter(|v| *v > 0)
                .map(|v| self.dl_chunk_size = v.min(1024)),
            "overheadCompensationFactor" => value
                .as_f64()
                .filter(|v| *v > 0.0)
                .map(|v| self.overhead_compensation = v),
            "useMebibits" => value.as_bool().map(|v| self.use_mebibits = v),
            _ => None,
        };
        applied.is_some()
    }

    pub fn download_window(&self) -> Duration {
        seconds_or_max(self.time_dl_max)
    }

    pub fn upload_window(&self) -> Duration {
        seconds_or_max(self.time_ul_max)
    }

    pub fn download_grace(&self) -> Duration {
        seconds_or_max(self.time_dl_grace)
    }

    pub fn upload_grace(&self) -> Duration {
        seconds_or_max(self.time_ul_grace)
    }

    /// Convert a byte count over an interval into the reported speed unit.
    pub fn speed(&self, bytes: u64, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        let divisor = if self.use_mebibits { 1_048_576.0 } else { 1_000_000.0 };
        (bytes as f64 * 8.0 * self.overhead_compensation) / secs / divisor
    }
}

/// Negative or NaN values become zero; values too large for a `Duration`
/// saturate.
fn seconds_or_max(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
