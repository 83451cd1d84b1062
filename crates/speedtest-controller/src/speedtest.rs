// The host-facing speedtest controller.
//
// `Speedtest` owns the controller state, the staged settings and the endpoint
// registry. It drives one `WorkerSession` per run and relays the worker's
// status snapshots to the host's update/end callbacks.

use crate::error::ControllerError;
use crate::launcher::WorkerLauncher;
use crate::probe::{probe_all, HttpLatencyProbe, LatencyProbe};
use crate::registry::{fastest_index, Endpoint, ServerRegistry};
use crate::session::WorkerSession;
use crate::settings::SettingsStore;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use speedtest_common::constants::DEFAULT_POLL_INTERVAL;
use speedtest_common::{StatusSnapshot, WorkerCommand};
use speedtest_sdk::{TraceWriter, TracingTraceWriter};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Controller lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerState {
    /// Settings may be changed. Initial state.
    Configuring,
    /// Endpoints are being added or probed.
    SelectingEndpoint,
    /// An endpoint is selected; the test may start.
    ReadyToStart,
    Running,
    /// The last run ended, normally or aborted. A new run may be started.
    Finished,
}

impl ControllerState {
    /// Numeric code, 0 (configuring) through 4 (finished).
    pub fn code(self) -> i32 {
        match self {
            ControllerState::Configuring => 0,
            ControllerState::SelectingEndpoint => 1,
            ControllerState::ReadyToStart => 2,
            ControllerState::Running => 3,
            ControllerState::Finished => 4,
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Configuring => "configuring",
            ControllerState::SelectingEndpoint => "selecting an endpoint",
            ControllerState::ReadyToStart => "ready to start",
            ControllerState::Running => "running",
            ControllerState::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Tunables for the controller.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Period of `status` polls while a run is active.
    pub poll_interval: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

type UpdateHandler = Arc<dyn Fn(&StatusSnapshot) + Send + Sync>;
type EndHandler = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    on_update: Option<UpdateHandler>,
    on_end: Option<EndHandler>,
}

struct Inner {
    state: ControllerState,
    settings: SettingsStore,
    registry: ServerRegistry,
    /// A latency probe is in flight.
    selecting: bool,
    session: Option<WorkerSession>,
    next_run_id: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    handlers: RwLock<Handlers>,
}

/// The speedtest controller.
///
/// Clones share the same controller. The state lock is never held while a
/// host callback runs, so callbacks may call back into the controller.
#[derive(Clone)]
pub struct Speedtest {
    shared: Arc<Shared>,
    launcher: Arc<dyn WorkerLauncher>,
    probe: Arc<dyn LatencyProbe>,
    options: ControllerOptions,
    trace: Arc<dyn TraceWriter>,
}

impl Speedtest {
    pub fn new(launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: ControllerState::Configuring,
                    settings: SettingsStore::new(),
                    registry: ServerRegistry::new(),
                    selecting: false,
                    session: None,
                    next_run_id: 0,
                }),
                handlers: RwLock::new(Handlers::default()),
            }),
            launcher,
            probe: Arc::new(HttpLatencyProbe::new()),
            options: ControllerOptions::default(),
            trace: Arc::new(TracingTraceWriter::new("Speedtest")),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn LatencyProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_options(mut self, options: ControllerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_trace(mut self, trace: Arc<dyn TraceWriter>) -> Self {
        self.trace = trace;
        self
    }

    pub fn state(&self) -> ControllerState {
        self.shared.inner.lock().state
    }

    /// Register the callback receiving every distinct status snapshot.
    pub fn on_update<F>(&self, handler: F)
    where
        F: Fn(&StatusSnapshot) + Send + Sync + 'static,
    {
        self.shared.handlers.write().on_update = Some(Arc::new(handler));
    }

    /// Register the callback invoked once per run with `aborted`.
    pub fn on_end<F>(&self, handler: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.shared.handlers.write().on_end = Some(Arc::new(handler));
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    pub fn set_parameter(
        &self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), ControllerError> {
        let mut inner = self.shared.inner.lock();
        if inner.state != ControllerState::Configuring {
            return Err(ControllerError::invalid_state("change settings", inner.state));
        }
        inner.settings.set(key, value);
        Ok(())
    }

    pub fn add_endpoint(&self, endpoint: Endpoint) -> Result<(), ControllerError> {
        self.add_endpoints(std::iter::once(endpoint))
    }

    /// Register candidate endpoints. The first call ends the configuring
    /// phase; settings are frozen from then on.
    pub fn add_endpoints(
        &self,
        endpoints: impl IntoIterator<Item = Endpoint>,
    ) -> Result<(), ControllerError> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            ControllerState::Configuring => inner.state = ControllerState::SelectingEndpoint,
            ControllerState::SelectingEndpoint => {}
            other => return Err(ControllerError::invalid_state("add endpoints", other)),
        }
        inner.registry.extend(endpoints);
        Ok(())
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.shared.inner.lock().registry.endpoints().to_vec()
    }

    pub fn selected_endpoint(&self) -> Option<Endpoint> {
        self.shared.inner.lock().registry.selected().cloned()
    }

    /// Probe every registered endpoint and select the one with the lowest
    /// latency, the earliest registered winning ties.
    ///
    /// If an endpoint is selected manually while the probe runs, that
    /// selection stands and is returned.
    pub async fn select_best_endpoint(&self) -> Result<Endpoint, ControllerError> {
        let endpoints = {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                ControllerState::Configuring | ControllerState::SelectingEndpoint
                    if inner.registry.is_empty() =>
                {
                    return Err(ControllerError::NoEndpoints)
                }
                ControllerState::SelectingEndpoint if !inner.selecting => {}
                other => return Err(ControllerError::invalid_state("select an endpoint", other)),
            }
            inner.selecting = true;
            inner.registry.endpoints().to_vec()
        };
        let _selecting = SelectionGuard(&self.shared);

        self.trace
            .info(&format!("Probing {} endpoints", endpoints.len()));
        let latencies = probe_all(self.probe.clone(), endpoints.clone()).await;
        for (endpoint, latency) in endpoints.iter().zip(&latencies) {
            match latency {
                Some(latency) => self
                    .trace
                    .verbose(&format!("  {}: {} ms", endpoint.name, latency.as_millis())),
                None => self
                    .trace
                    .verbose(&format!("  {}: unreachable", endpoint.name)),
            }
        }

        let mut inner = self.shared.inner.lock();
        if let Some(selected) = inner.registry.selected() {
            return Ok(selected.clone());
        }

        let index = match fastest_index(&latencies) {
            Some(index) => index,
            None => {
                self.trace.warning("No endpoint answered the latency probe");
                return Err(ControllerError::NoReachableEndpoint(endpoints.len()));
            }
        };

        let best = endpoints[index].clone();
        self.trace.info(&format!(
            "Selected endpoint '{}' ({})",
            best.name, best.server
        ));
        inner.registry.select(best.clone());
        inner.state = ControllerState::ReadyToStart;
        Ok(best)
    }

    /// Select an endpoint without probing.
    pub fn select_endpoint(&self, endpoint: Endpoint) -> Result<(), ControllerError> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            ControllerState::Configuring | ControllerState::SelectingEndpoint => {}
            other => return Err(ControllerError::invalid_state("select an endpoint", other)),
        }
        self.trace
            .info(&format!("Endpoint '{}' selected manually", endpoint.name));
        inner.registry.select(endpoint);
        inner.state = ControllerState::ReadyToStart;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run control
    // -----------------------------------------------------------------------

    /// Spawn a fresh worker and start a run. The state is `Running` as soon
    /// as this returns; the worker's acknowledgment is not awaited.
    pub fn start(&self) -> Result<(), ControllerError> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            ControllerState::Running => return Err(ControllerError::AlreadyRunning),
            ControllerState::SelectingEndpoint => {
                return Err(ControllerError::invalid_state("start", inner.state))
            }
            ControllerState::Configuring
            | ControllerState::ReadyToStart
            | ControllerState::Finished => {}
        }

        let payload = match inner.registry.selected() {
            Some(endpoint) => inner.settings.payload_with(endpoint.worker_settings()),
            None => inner.settings.to_payload(),
        };

        inner.next_run_id += 1;
        let run_id = inner.next_run_id;

        let shared = Arc::downgrade(&self.shared);
        let trace = self.trace.clone();
        let session = WorkerSession::spawn(
            run_id,
            self.launcher.as_ref(),
            self.options.poll_interval,
            self.trace.clone(),
            move |snapshot| dispatch(&shared, trace.as_ref(), run_id, snapshot),
        )
        .map_err(ControllerError::WorkerLaunch)?;

        if !session.send(&WorkerCommand::Start(payload)) {
            self.trace
                .warning(&format!("Run {}: worker is gone before start", run_id));
        }

        inner.session = Some(session);
        inner.state = ControllerState::Running;
        self.trace.info(&format!("Run {} started", run_id));
        Ok(())
    }

    /// Ask the worker to stop. The state moves to `Finished` only once the
    /// worker reports the aborted phase.
    pub fn abort(&self) -> Result<(), ControllerError> {
        let inner = self.shared.inner.lock();
        match inner.state {
            ControllerState::Running => {}
            ControllerState::Finished => return Ok(()),
            _ => return Err(ControllerError::NotStarted),
        }

        if let Some(session) = &inner.session {
            self.trace
                .info(&format!("Run {}: abort requested", session.run_id()));
            if !session.send(&WorkerCommand::Abort) {
                self.trace.warning("Worker is gone; abort not delivered");
            }
        }
        Ok(())
    }
}

/// Clears the in-flight flag when a selection ends or is dropped.
struct SelectionGuard<'a>(&'a Shared);

impl Drop for SelectionGuard<'_> {
    fn drop(&mut self) {
        self.0.inner.lock().selecting = false;
    }
}

/// Relay one snapshot of run `run_id` to the host and finish the run on a
/// terminal phase. Snapshots of any other run are ignored.
fn dispatch(shared: &Weak<Shared>, trace: &dyn TraceWriter, run_id: u64, snapshot: StatusSnapshot) {
    let Some(shared) = shared.upgrade() else {
        return;
    };

    {
        let inner = shared.inner.lock();
        let current = inner.state == ControllerState::Running
            && inner.session.as_ref().map(WorkerSession::run_id) == Some(run_id);
        if !current {
            return;
        }
    }

    let (on_update, on_end) = {
        let handlers = shared.handlers.read();
        (handlers.on_update.clone(), handlers.on_end.clone())
    };

    if let Some(on_update) = on_update {
        invoke_callback(trace, "update", || on_update(&snapshot));
    }

    if !snapshot.test_state.is_terminal() {
        return;
    }

    let aborted = snapshot.test_state.is_aborted();
    trace.info(&format!(
        "Run {} ended ({})",
        run_id,
        if aborted { "aborted" } else { "completed" }
    ));
    if let Some(on_end) = on_end {
        invoke_callback(trace, "end", || on_end(aborted));
    }

    let session = {
        let mut inner = shared.inner.lock();
        if inner.session.as_ref().map(WorkerSession::run_id) != Some(run_id) {
            return;
        }
        inner.state = ControllerState::Finished;
        inner.session.take()
    };
    if let Some(session) = session {
        session.terminate();
    }
}

/// Run a host callback, logging a panic instead of unwinding into the
/// controller.
fn invoke_callback(trace: &dyn TraceWriter, name: &str, callback: impl FnOnce()) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(callback)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        trace.error(&format!("The {} callback panicked: {}", name, message));
    }
}
