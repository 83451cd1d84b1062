// Constants shared by the controller and the worker.

use std::time::Duration;

/// Period between `status` polls while a run is active.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Longest line accepted on the worker channel. A full settings payload or
/// status snapshot is a few hundred bytes.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// File name of the out-of-process worker binary.
pub const WORKER_BINARY_NAME: &str = "speedtest-worker";

/// Prefix of the Unix socket files created for worker IPC.
pub const SOCKET_FILE_PREFIX: &str = "speedtest_ipc_";

/// Environment variables read by the binaries.
pub mod variables {
    /// Overrides the directory holding the worker IPC socket.
    pub const SOCKET_DIR: &str = "SPEEDTEST_SOCKET_DIR";
    /// Standard filter directive variable read by `tracing-subscriber`.
    pub const LOG_FILTER: &str = "RUST_LOG";
}

/// Command words of the worker protocol.
pub mod commands {
    pub const START: &str = "start";
    pub const ABORT: &str = "abort";
    pub const STATUS: &str = "status";
}

/// Setting keys the controller writes itself when an endpoint is selected.
pub mod settings {
    pub const URL_DL: &str = "url_dl";
    pub const URL_UL: &str = "url_ul";
    pub const URL_PING: &str = "url_ping";
    pub const URL_GET_IP: &str = "url_getIp";
}
