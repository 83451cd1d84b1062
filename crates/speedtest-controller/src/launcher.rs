// Worker launchers: hand the controller a fresh message link per run.
//
// A link is a pair of line queues plus a shutdown token. The worker behind it
// is either a Tokio task in this process or a `speedtest-worker` child
// process reached over a Unix domain socket.

use anyhow::{Context, Result};
use speedtest_common::constants::{variables, WORKER_BINARY_NAME};
use speedtest_common::{LogFormat, WorkerChannel};
use speedtest_sdk::{TraceWriter, TracingTraceWriter};
use speedtest_worker::Worker;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Controller-side ends of a worker's message channel.
pub struct WorkerLink {
    /// Command lines to the worker.
    pub commands: mpsc::UnboundedSender<String>,
    /// Reply lines from the worker, in the order it sent them.
    pub replies: mpsc::UnboundedReceiver<String>,
    /// Cancelling this releases the worker.
    pub shutdown: CancellationToken,
}

/// Spawns one worker per call. Workers are never reused.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self) -> Result<WorkerLink>;
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

/// Runs the worker as a task on the current Tokio runtime.
pub struct InProcessLauncher {
    client: reqwest::Client,
    trace: Arc<dyn TraceWriter>,
}

impl InProcessLauncher {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            trace: Arc::new(TracingTraceWriter::new("Worker")),
        }
    }
}

impl Default for InProcessLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerLauncher for InProcessLauncher {
    fn launch(&self) -> Result<WorkerLink> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("In-process worker requires a Tokio runtime")?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let worker = Worker::with_client(self.client.clone(), self.trace.clone());
        runtime.spawn(worker.run(command_rx, reply_tx, shutdown.clone()));

        Ok(WorkerLink {
            commands: command_tx,
            replies: reply_rx,
            shutdown,
        })
    }
}

// ---------------------------------------------------------------------------
// Out-of-process
// ---------------------------------------------------------------------------

/// Runs each worker as a `speedtest-worker` child process.
///
/// The launcher binds a fresh socket, spawns the child with `--pipe <socket>`
/// and pumps lines between the socket and the link until either side hangs
/// up. The child is killed once the link is shut down.
pub struct ProcessLauncher {
    worker_binary: PathBuf,
    socket_dir: PathBuf,
    log_format: LogFormat,
    trace: Arc<dyn TraceWriter>,
}

impl ProcessLauncher {
    pub fn new(worker_binary: impl Into<PathBuf>) -> Self {
        let socket_dir = std::env::var_os(variables::SOCKET_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        Self {
            worker_binary: worker_binary.into(),
            socket_dir,
            log_format: LogFormat::default(),
            trace: Arc::new(TracingTraceWriter::new("ProcessLauncher")),
        }
    }

    pub fn socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    /// Diagnostics format passed on to the child.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }

    pub fn worker_binary(&self) -> &Path {
        &self.worker_binary
    }

    /// Find the worker binary next to the current executable.
    pub fn locate() -> Result<PathBuf> {
        let exe_path = std::env::current_exe().context("Failed to resolve current executable")?;
        let bin_dir = exe_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Executable {:?} has no parent directory", exe_path))?;

        let candidates = [Some(bin_dir), bin_dir.parent()];
        for dir in candidates.into_iter().flatten() {
            let worker = dir.join(WORKER_BINARY_NAME);
            if worker.exists() {
                return Ok(worker);
            }
        }

        Err(anyhow::anyhow!(
            "Worker binary '{}' not found near {:?}",
            WORKER_BINARY_NAME,
            bin_dir
        ))
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self) -> Result<WorkerLink> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("Worker process supervision requires a Tokio runtime")?;

        let mut channel = WorkerChannel::new();
        let socket_path = channel
            .start_server(&self.socket_dir)
            .context("Failed to open IPC socket for worker")?;

        self.trace.info(&format!(
            "Starting worker process: {:?} --pipe {}",
            self.worker_binary,
            socket_path.display()
        ));

        let child = tokio::process::Command::new(&self.worker_binary)
            .arg("--pipe")
            .arg(&socket_path)
            .arg("--log-format")
            .arg(self.log_format.to_string())
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn worker process {:?}", self.worker_binary))?;

        self.trace.info(&format!(
            "Worker process spawned with PID: {}",
            child.id().unwrap_or(0)
        ));

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        runtime.spawn(supervise(
            channel,
            child,
            command_rx,
            reply_tx,
            shutdown.clone(),
            self.trace.clone(),
        ));

        Ok(WorkerLink {
            commands: command_tx,
            replies: reply_rx,
            shutdown,
        })
    }
}

/// Connect the child to the link and keep it alive until the link is shut
/// down or the child exits.
async fn supervise(
    mut channel: WorkerChannel,
    mut child: Child,
    commands: mpsc::UnboundedReceiver<String>,
    replies: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
    trace: Arc<dyn TraceWriter>,
) {
    let connected = tokio::select! {
        accepted = channel.accept() => match accepted {
            Ok(()) => true,
            Err(e) => {
                trace.error(&format!("Worker did not connect: {:#}", e));
                false
            }
        },
        status = child.wait() => {
            trace.warning(&format!("Worker exited before connecting: {:?}", status));
            false
        }
        _ = shutdown.cancelled() => false,
    };

    if connected {
        trace.verbose("Worker connected to IPC socket");
        tokio::select! {
            pumped = channel.pump(commands, replies, shutdown.clone()) => {
                if let Err(e) = pumped {
                    trace.warning(&format!("Worker IPC ended with error: {:#}", e));
                }
            }
            status = child.wait() => {
                trace.info(&format!("Worker process exited: {:?}", status));
            }
        }
    }

    if let Ok(None) = child.try_wait() {
        trace.verbose("Stopping worker process");
        let _ = child.kill().await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Worker-side ends of a scripted link.
    pub(crate) struct ScriptedWorker {
        pub commands: mpsc::UnboundedReceiver<String>,
        pub replies: mpsc::UnboundedSender<String>,
        pub shutdown: CancellationToken,
    }

    impl ScriptedWorker {
        /// Commands received so far, without waiting.
        pub fn drain(&mut self) -> Vec<String> {
            let mut lines = Vec::new();
            while let Ok(line) = self.commands.try_recv() {
                lines.push(line);
            }
            lines
        }

        pub fn reply(&self, raw: &str) {
            let _ = self.replies.send(raw.to_string());
        }
    }

    /// Launcher whose workers are driven by the test.
    #[derive(Default)]
    pub(crate) struct ScriptedLauncher {
        workers: Mutex<VecDeque<ScriptedWorker>>,
        launches: AtomicUsize,
        fail: AtomicBool,
    }

    impl ScriptedLauncher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_next(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        pub fn launches(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }

        /// The oldest launched worker not yet taken.
        pub fn take_worker(&self) -> ScriptedWorker {
            self.workers
                .lock()
                .pop_front()
                .expect("no worker was launched")
        }
    }

    impl WorkerLauncher for ScriptedLauncher {
        fn launch(&self) -> Result<WorkerLink> {
            if self.fail.swap(false, Ordering::SeqCst) {
                anyhow::bail!("scripted launch failure");
            }
            let (command_tx, command_rx) = mpsc::unbounded_channel();
            let (reply_tx, reply_rx) = mpsc::unbounded_channel();
            let shutdown = CancellationToken::new();

            self.launches.fetch_add(1, Ordering::SeqCst);
            self.workers.lock().push_back(ScriptedWorker {
                commands: command_rx,
                replies: reply_tx,
                shutdown: shutdown.clone(),
            });

            Ok(WorkerLink {
                commands: command_tx,
                replies: reply_rx,
                shutdown,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use speedtest_common::{StatusSnapshot, TestPhase};

    #[tokio::test]
    async fn in_process_worker_answers_status() {
        let launcher = InProcessLauncher::new();
        let mut link = launcher.launch().unwrap();

        link.commands.send("status".to_string()).unwrap();
        let raw = link.replies.recv().await.unwrap();
        let snapshot = StatusSnapshot::from_json(&raw).unwrap();
        assert_eq!(snapshot.test_state, TestPhase::NOT_STARTED);

        link.shutdown.cancel();
        // The worker drops its reply sender once it stops.
        assert_eq!(link.replies.recv().await, None);
    }

    #[test]
    fn in_process_launch_needs_runtime() {
        let launcher = InProcessLauncher::new();
        assert!(launcher.launch().is_err());
    }

    #[tokio::test]
    async fn missing_worker_binary_fails_and_cleans_socket() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new(dir.path().join("no-such-worker")).socket_dir(dir.path());

        let err = launcher.launch().err().unwrap();
        assert!(format!("{:#}", err).contains("Failed to spawn worker process"));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn socket_dir_override() {
        let launcher = ProcessLauncher::new("/opt/speedtest/speedtest-worker").socket_dir("/run/st");
        assert_eq!(launcher.socket_dir, PathBuf::from("/run/st"));
        assert_eq!(
            launcher.worker_binary(),
            Path::new("/opt/speedtest/speedtest-worker")
        );
    }
}
