// One worker session per run: status polling, reply dedupe, teardown.

use crate::launcher::{WorkerLauncher, WorkerLink};
use anyhow::{Context, Result};
use speedtest_common::{StatusSnapshot, WorkerCommand};
use speedtest_sdk::TraceWriter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// The controller's handle to the worker serving one run.
///
/// Spawning starts two tasks: a poll loop that sends `status` every
/// `poll_interval`, and a receive loop that hands each distinct reply to the
/// session's handler. Both stop on [`terminate`](Self::terminate), which also
/// releases the worker. Dropping the session terminates it.
pub struct WorkerSession {
    run_id: u64,
    commands: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
    trace: Arc<dyn TraceWriter>,
}

impl WorkerSession {
    pub fn spawn<F>(
        run_id: u64,
        launcher: &dyn WorkerLauncher,
        poll_interval: Duration,
        trace: Arc<dyn TraceWriter>,
        handler: F,
    ) -> Result<Self>
    where
        F: Fn(StatusSnapshot) + Send + 'static,
    {
        let runtime =
            tokio::runtime::Handle::try_current().context("Worker session requires a Tokio runtime")?;

        let WorkerLink {
            commands,
            replies,
            shutdown,
        } = launcher.launch()?;

        trace.verbose(&format!("Run {}: worker session started", run_id));

        runtime.spawn(poll_loop(commands.clone(), poll_interval, shutdown.clone()));
        runtime.spawn(receive_loop(
            run_id,
            replies,
            shutdown.clone(),
            trace.clone(),
            handler,
        ));

        Ok(Self {
            run_id,
            commands,
            shutdown,
            trace,
        })
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Queue a command for the worker. Returns `false` if the session has
    /// been terminated or the worker is gone.
    pub fn send(&self, command: &WorkerCommand) -> bool {
        if self.is_terminated() {
            return false;
        }
        self.commands.send(command.to_line()).is_ok()
    }

    /// Stop polling and release the worker. Safe to call more than once.
    pub fn terminate(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.trace
            .verbose(&format!("Run {}: terminating worker session", self.run_id));
        self.shutdown.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for WorkerSession {
    fn drop(&mut self) {
        self.terminate();
    }
}

async fn poll_loop(
    commands: mpsc::UnboundedSender<String>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let status = WorkerCommand::Status.to_line();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if commands.send(status.clone()).is_err() {
                    break;
                }
            }
        }
    }
}

async fn receive_loop<F>(
    run_id: u64,
    mut replies: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
    trace: Arc<dyn TraceWriter>,
    handler: F,
) where
    F: Fn(StatusSnapshot) + Send + 'static,
{
    // Last raw reply; a repeat of it is not relayed.
    let mut previous: Option<String> = None;

    loop {
        let raw = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            raw = replies.recv() => match raw {
                Some(raw) => raw,
                None => {
                    trace.warning(&format!("Run {}: worker closed its reply stream", run_id));
                    break;
                }
            },
        };

        if previous.as_deref() == Some(raw.as_str()) {
            continue;
        }

        let decoded = StatusSnapshot::from_json(&raw);
        previous = Some(raw);
        match decoded {
            Ok(snapshot) => handler(snapshot),
            Err(e) => trace.warning(&format!("Run {}: undecodable worker reply: {}", run_id, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::testing::ScriptedLauncher;
    use parking_lot::Mutex;
    use speedtest_common::TestPhase;
    use speedtest_sdk::{CollectingTraceWriter, NullTraceWriter, TraceLevel};

    fn recording() -> (Arc<Mutex<Vec<StatusSnapshot>>>, impl Fn(StatusSnapshot) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |snapshot: StatusSnapshot| sink.lock().push(snapshot))
    }

    const POLL: Duration = Duration::from_millis(200);

    #[tokio::test(start_paused = true)]
    async fn polls_on_fixed_interval() {
        let launcher = ScriptedLauncher::new();
        let session =
            WorkerSession::spawn(1, &launcher, POLL, Arc::new(NullTraceWriter), |_| {}).unwrap();
        let mut worker = launcher.take_worker();

        tokio::time::sleep(Duration::from_millis(650)).await;
        assert_eq!(worker.drain(), vec!["status", "status", "status"]);

        session.terminate();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(worker.drain().is_empty());
        assert!(worker.shutdown.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn identical_replies_are_relayed_once() {
        let launcher = ScriptedLauncher::new();
        let (seen, handler) = recording();
        let _session =
            WorkerSession::spawn(1, &launcher, POLL, Arc::new(NullTraceWriter), handler).unwrap();
        let worker = launcher.take_worker();

        let starting = r#"{"testState":0,"dlStatus":"","dlProgress":0}"#;
        let download = r#"{"testState":1,"dlStatus":"12.50","dlProgress":0.1}"#;
        worker.reply(starting);
        worker.reply(starting);
        worker.reply(download);
        worker.reply(download);
        worker.reply(starting);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let phases: Vec<_> = seen.lock().iter().map(|s| s.test_state).collect();
        assert_eq!(
            phases,
            vec![TestPhase::STARTING, TestPhase::DOWNLOAD, TestPhase::STARTING]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_reply_is_logged_and_skipped() {
        let launcher = ScriptedLauncher::new();
        let trace = Arc::new(CollectingTraceWriter::new());
        let (seen, handler) = recording();
        let _session = WorkerSession::spawn(7, &launcher, POLL, trace.clone(), handler).unwrap();
        let worker = launcher.take_worker();

        worker.reply("not json");
        worker.reply(r#"{"testState":4}"#);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(seen.lock().len(), 1);
        let warnings = trace.messages_at(TraceLevel::Warning);
        assert!(warnings.iter().any(|m| m.contains("undecodable")));
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_is_idempotent_and_blocks_sends() {
        let launcher = ScriptedLauncher::new();
        let session =
            WorkerSession::spawn(3, &launcher, POLL, Arc::new(NullTraceWriter), |_| {}).unwrap();
        let mut worker = launcher.take_worker();

        assert!(session.send(&WorkerCommand::Abort));
        session.terminate();
        session.terminate();
        assert!(session.is_terminated());
        assert!(!session.send(&WorkerCommand::Abort));
        assert_eq!(worker.drain(), vec!["abort"]);
        assert_eq!(session.run_id(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn replies_after_terminate_are_dropped() {
        let launcher = ScriptedLauncher::new();
        let (seen, handler) = recording();
        let session =
            WorkerSession::spawn(1, &launcher, POLL, Arc::new(NullTraceWriter), handler).unwrap();
        let worker = launcher.take_worker();

        session.terminate();
        worker.reply(r#"{"testState":1}"#);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn launch_failure_is_reported() {
        let launcher = ScriptedLauncher::new();
        launcher.fail_next(true);
        let result = WorkerSession::spawn(1, &launcher, POLL, Arc::new(NullTraceWriter), |_| {});
        assert!(result.is_err());
        assert_eq!(launcher.launches(), 0);
    }
}
