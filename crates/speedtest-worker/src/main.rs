// Entry point for the out-of-process measurement worker.
//
// The controller spawns this binary with `--pipe <path>`. It connects to the
// controller's Unix socket, serves one run over the line protocol, and exits
// when the controller hangs up.

use anyhow::{Context, Result};
use clap::Parser;
use speedtest_common::{logging, LogFormat, WorkerChannel};
use speedtest_sdk::{SpeedtestPackage, TracingTraceWriter};
use speedtest_worker::Worker;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Command-line arguments for the worker process.
#[derive(Parser, Debug)]
#[command(name = "speedtest-worker", about = "Speedtest measurement worker")]
struct Args {
    /// Path of the controller's IPC socket.
    #[arg(long)]
    pipe: PathBuf,

    /// Diagnostics format: text or json.
    #[arg(long, default_value = "text")]
    log_format: LogFormat,
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
            Ok(()) => 0,
            Err(e) => {
                tracing::error!("Worker failed with error: {:#}", e);
                1
            }
        }
    });

    std::process::exit(exit_code);
}

async fn run(args: Args) -> Result<()> {
    tracing::info!("{} worker starting", SpeedtestPackage::banner());
    tracing::info!("  pipe = {}", args.pipe.display());

    let mut channel = WorkerChannel::new();
    channel
        .connect(&args.pipe)
        .await
        .context("Failed to connect to controller")?;

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();

    let pump = tokio::spawn(channel.pump(reply_rx, command_tx, shutdown.clone()));

    let worker = Worker::new(Arc::new(TracingTraceWriter::new("Worker")));
    worker.run(command_rx, reply_tx, shutdown.clone()).await;

    shutdown.cancel();
    pump.await.context("IPC pump task panicked")??;
    Ok(())
}
