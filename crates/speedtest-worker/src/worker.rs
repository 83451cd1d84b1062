// The worker's command loop: receives protocol lines from the controller,
// starts and aborts measurement runs, and answers status polls.

use crate::measurement::{MeasurementRun, SharedStatus};
use crate::settings::WorkerSettings;
use parking_lot::Mutex;
use speedtest_common::{StatusSnapshot, TestPhase, WorkerCommand};
use speedtest_sdk::TraceWriter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The measurement worker.
///
/// A worker serves a single run: the first `start` launches it and later
/// `start` commands are ignored. The controller spawns a new worker for
/// every run.
pub struct Worker {
    client: reqwest::Client,
    trace: Arc<dyn TraceWriter>,
    status: SharedStatus,
    run_cancel: CancellationToken,
    run_handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn new(trace: Arc<dyn TraceWriter>) -> Self {
        Self::with_client(reqwest::Client::new(), trace)
    }

    /// Create a worker that issues requests through the given client.
    pub fn with_client(client: reqwest::Client, trace: Arc<dyn TraceWriter>) -> Self {
        Self {
            client,
            trace,
            status: Arc::new(Mutex::new(StatusSnapshot::not_started())),
            run_cancel: CancellationToken::new(),
            run_handle: None,
        }
    }

    /// Process commands until the controller hangs up or `shutdown` fires.
    /// Snapshot replies are written to `replies`.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<String>,
        replies: mpsc::UnboundedSender<String>,
        shutdown: CancellationToken,
    ) {
        self.trace.info("Worker ready for commands");

        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = commands.recv() => match line {
                    Some(line) => line,
                    None => break,
                },
            };

            match WorkerCommand::parse(&line) {
                Ok(WorkerCommand::Start(payload)) => self.start(&payload),
                Ok(WorkerCommand::Abort) => self.abort(),
                Ok(WorkerCommand::Status) => {
                    if !self.reply(&replies) {
                        break;
                    }
                }
                Err(e) => self.trace.warning(&format!("Ignoring command: {}", e)),
            }
        }

        self.run_cancel.cancel();
        if let Some(handle) = self.run_handle.take() {
            let _ = handle.await;
        }
        self.trace.info("Worker stopped");
    }

    fn start(&mut self, payload: &str) {
        if self.status.lock().test_state != TestPhase::NOT_STARTED {
            self.trace.warning("Ignoring start: a run was already started");
            return;
        }

        let settings = match WorkerSettings::from_json(payload, self.trace.as_ref()) {
            Ok(settings) => settings,
            Err(e) => {
                self.trace.error(&format!("Invalid start payload: {}", e));
                self.status.lock().test_state = TestPhase::ABORTED;
                return;
            }
        };

        self.trace.info(&format!(
            "Starting run with test order {:?}",
            settings.test_order
        ));
        let run = MeasurementRun::new(
            settings,
            self.client.clone(),
            self.status.clone(),
            self.run_cancel.clone(),
            self.trace.clone(),
        );
        self.status.lock().test_state = TestPhase::STARTING;
        self.run_handle = Some(supervise_run(
            tokio::spawn(run.run()),
            self.status.clone(),
            self.trace.clone(),
        ));
    }

    fn abort(&self) {
        let mut status = self.status.lock();
        if status.test_state.is_terminal() {
            return;
        }
        self.trace.info("Aborting run");
        self.run_cancel.cancel();
        status.test_state = TestPhase::ABORTED;
        // Unfinished measurements are reported as unknown.
        if status.dl_progress < 1.0 {
            status.dl_status = None;
        }
        if status.ul_progress < 1.0 {
            status.ul_status = None;
        }
        if status.ping_progress < 1.0 {
            status.ping_status = None;
            status.jitter_status = None;
        }
    }

    /// Send the current snapshot. Returns `false` once the controller is gone.
    fn reply(&self, replies: &mpsc::UnboundedSender<String>) -> bool {
        let json = match self.status.lock().to_json() {
            Ok(json) => json,
            Err(e) => {
                self.trace.error(&format!("Failed to encode status: {}", e));
                return true;
            }
        };
        replies.send(json).is_ok()
    }
}

/// Wait for a run task and make sure its snapshot ends in a terminal phase,
/// even when the task panicked or returned early.
fn supervise_run(
    run: JoinHandle<()>,
    status: SharedStatus,
    trace: Arc<dyn TraceWriter>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let outcome = run.await;
        let mut status = status.lock();
        if status.test_state.is_terminal() {
            return;
        }
        match outcome {
            Err(e) if e.is_panic() => trace.error("Measurement run panicked"),
            Err(e) => trace.error(&format!("Measurement run failed: {}", e)),
            Ok(()) => trace.warning("Measurement run stopped before finishing"),
        }
        status.test_state = TestPhase::ABORTED;
    })
}
