// Candidate test endpoints and the outcome of endpoint selection.

use serde::{Deserialize, Serialize};
use speedtest_common::constants::settings;
use speedtest_sdk::UrlUtil;
use std::time::Duration;

/// A named remote test target.
///
/// `server` is the base address (`http://host/`, `https://host/` or
/// protocol-relative `//host/`); the other paths are relative to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub server: String,
    #[serde(rename = "dlURL", default = "default_dl_url")]
    pub dl_url: String,
    #[serde(rename = "ulURL", default = "default_empty_url")]
    pub ul_url: String,
    #[serde(rename = "pingURL", default = "default_empty_url")]
    pub ping_url: String,
    #[serde(rename = "getIpURL", default = "default_get_ip_url")]
    pub get_ip_url: String,
}

fn default_dl_url() -> String {
    "garbage.php".to_string()
}

fn default_empty_url() -> String {
    "empty.php".to_string()
}

fn default_get_ip_url() -> String {
    "getIP.php".to_string()
}

impl Endpoint {
    /// An endpoint using the conventional backend paths.
    pub fn new(name: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server: server.into(),
            dl_url: default_dl_url(),
            ul_url: default_empty_url(),
            ping_url: default_empty_url(),
            get_ip_url: default_get_ip_url(),
        }
    }

    pub fn download_address(&self) -> String {
        UrlUtil::join_endpoint(&self.server, &self.dl_url)
    }

    pub fn upload_address(&self) -> String {
        UrlUtil::join_endpoint(&self.server, &self.ul_url)
    }

    pub fn ping_address(&self) -> String {
        UrlUtil::join_endpoint(&self.server, &self.ping_url)
    }

    pub fn ip_address(&self) -> String {
        UrlUtil::join_endpoint(&self.server, &self.get_ip_url)
    }

    /// Worker settings pointing a run at this endpoint.
    pub fn worker_settings(&self) -> [(&'static str, String); 4] {
        [
            (settings::URL_DL, self.download_address()),
            (settings::URL_UL, self.upload_address()),
            (settings::URL_PING, self.ping_address()),
            (settings::URL_GET_IP, self.ip_address()),
        ]
    }
}

/// Ordered candidate endpoints plus the selected one.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    endpoints: Vec<Endpoint>,
    selected: Option<Endpoint>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, endpoint: Endpoint) {
        self.endpoints.push(endpoint);
    }

    pub fn extend(&mut self, endpoints: impl IntoIterator<Item = Endpoint>) {
        self.endpoints.extend(endpoints);
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn selected(&self) -> Option<&Endpoint> {
        self.selected.as_ref()
    }

    /// Record the selection. The first selection sticks: returns `false`
    /// and keeps the existing one if an endpoint was already selected.
    pub fn select(&mut self, endpoint: Endpoint) -> bool {
        if self.selected.is_some() {
            return false;
        }
        self.selected = Some(endpoint);
        true
    }
}

/// Index of the lowest latency, the earliest entry winning ties.
/// Unreachable entries (`None`) never win.
pub fn fastest_index(latencies: &[Option<Duration>]) -> Option<usize> {
    let mut best: Option<(usize, Duration)> = None;
    for (i, latency) in latencies.iter().enumerate() {
        if let Some(latency) = *latency {
            match best {
                Some((_, b)) if latency >= b => {}
                _ => best = Some((i, latency)),
            }
        }
    }
    best.map(|(i, _)| i)
}
