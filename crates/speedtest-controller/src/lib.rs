// speedtest-controller: the host-facing state machine.
// Depends on `speedtest-sdk`, `speedtest-common` and `speedtest-worker`.
//
// Architecture:
//   Speedtest (state machine) → WorkerSession (one per run) → WorkerLauncher
//     → in-process worker task | worker child process over a Unix socket
//   Speedtest::select_best_endpoint → LatencyProbe → ServerRegistry

pub mod config;
pub mod error;
pub mod launcher;
pub mod probe;
pub mod registry;
pub mod report;
pub mod session;
pub mod settings;
pub mod speedtest;

pub use error::ControllerError;
pub use launcher::{InProcessLauncher, ProcessLauncher, WorkerLauncher, WorkerLink};
pub use probe::{HttpLatencyProbe, LatencyProbe};
pub use registry::{Endpoint, ServerRegistry};
pub use session::WorkerSession;
pub use settings::SettingsStore;
pub use speedtest::{ControllerOptions, ControllerState, Speedtest};
