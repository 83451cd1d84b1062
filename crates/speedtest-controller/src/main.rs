// Entry point for the `speedtest` command-line controller.
//
// Parses arguments, stages settings and endpoints on a `Speedtest`, runs one
// test and prints the result. Ctrl-C asks the worker to abort; a second
// Ctrl-C exits without waiting.

use anyhow::{Context, Result};
use clap::Parser;
use speedtest_common::{logging, StatusSnapshot};
use speedtest_controller::config::{self, Args};
use speedtest_controller::report;
use speedtest_controller::{InProcessLauncher, ProcessLauncher, Speedtest, WorkerLauncher};
use speedtest_sdk::SpeedtestPackage;
use std::sync::Arc;
use tokio::sync::mpsc;

enum Event {
    Update(StatusSnapshot),
    End(bool),
}

fn main() {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build Tokio runtime");

    let exit_code = runtime.block_on(async move {
        logging::init(args.log_format);
        match run(args).await {
            Ok(code) => code,
            Err(e) => {
                tracing::error!("Speedtest failed: {:#}", e);
                2
            }
        }
    });

    std::process::exit(exit_code);
}

fn launcher(args: &Args) -> Result<Arc<dyn WorkerLauncher>> {
    if !args.isolated {
        return Ok(Arc::new(InProcessLauncher::new()));
    }
    let binary = match &args.worker {
        Some(path) => path.clone(),
        None => ProcessLauncher::locate().context("Cannot run an isolated worker")?,
    };
    tracing::info!("  worker = {}", binary.display());
    Ok(Arc::new(ProcessLauncher::new(binary).log_format(args.log_format)))
}

async fn run(args: Args) -> Result<i32> {
    tracing::info!("{} starting", SpeedtestPackage::banner());
    tracing::info!("  poll interval = {} ms", args.poll_interval_ms);

    let speedtest = Speedtest::new(launcher(&args)?).with_options(args.options());

    for (key, value) in &args.settings {
        speedtest.set_parameter(key.clone(), value.clone())?;
    }

    if let Some(path) = &args.servers {
        let servers = config::load_servers(path)?;
        let manual = match &args.server {
            Some(name) => Some(
                servers
                    .iter()
                    .find(|e| &e.name == name)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("No server named '{}' in {:?}", name, path))?,
            ),
            None => None,
        };

        speedtest.add_endpoints(servers)?;
        match manual {
            Some(endpoint) => speedtest.select_endpoint(endpoint)?,
            None => {
                let best = speedtest.select_best_endpoint().await?;
                tracing::info!("Testing against '{}'", best.name);
            }
        }
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let updates = event_tx.clone();
    speedtest.on_update(move |snapshot| {
        let _ = updates.send(Event::Update(snapshot.clone()));
    });
    speedtest.on_end(move |aborted| {
        let _ = event_tx.send(Event::End(aborted));
    });

    speedtest.start()?;

    let mut last = StatusSnapshot::not_started();
    let mut interrupted = false;
    let aborted = loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(Event::Update(snapshot)) => {
                    if !args.json {
                        eprint!("\r{}", report::format_progress(&snapshot));
                    }
                    last = snapshot;
                }
                Some(Event::End(aborted)) => break aborted,
                None => anyhow::bail!("Controller event stream closed"),
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                if interrupted {
                    tracing::warn!("Interrupted again; exiting without waiting for the worker");
                    return Ok(130);
                }
                interrupted = true;
                tracing::info!("Interrupted; aborting test");
                speedtest.abort()?;
            }
        }
    };

    if args.json {
        println!("{}", last.to_json()?);
    } else {
        eprintln!();
        println!("{}", report::format_summary(&last, aborted));
    }

    Ok(if aborted { 1 } else { 0 })
}
