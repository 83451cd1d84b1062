// speedtest-common: Shared services and infrastructure for the speedtest workspace.
// Holds the controller <-> worker wire protocol, the Unix socket channel used by
// out-of-process workers, and logging setup.

pub mod constants;
pub mod logging;
pub mod protocol;
pub mod worker_channel;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use logging::LogFormat;
pub use protocol::{ProtocolError, StatusSnapshot, TestPhase, WorkerCommand};
pub use worker_channel::WorkerChannel;
