// Errors returned synchronously by the controller API.

use crate::speedtest::ControllerState;
use thiserror::Error;

/// Precondition and launch failures of [`crate::Speedtest`] operations.
///
/// Worker-side failures are never reported here; they arrive as status
/// snapshots with a terminal phase.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The operation is not legal in the current state.
    #[error("cannot {operation} while the controller is {state}")]
    InvalidState {
        operation: &'static str,
        state: ControllerState,
    },

    #[error("a test is already running")]
    AlreadyRunning,

    #[error("cannot abort a test that has not been started")]
    NotStarted,

    #[error("no endpoints have been registered")]
    NoEndpoints,

    #[error("none of the {0} registered endpoints answered the latency probe")]
    NoReachableEndpoint(usize),

    #[error("failed to launch the measurement worker")]
    WorkerLaunch(#[source] anyhow::Error),
}

impl ControllerError {
    pub(crate) fn invalid_state(operation: &'static str, state: ControllerState) -> Self {
        ControllerError::InvalidState { operation, state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_message_names_operation_and_state() {
        let err = ControllerError::invalid_state("change settings", ControllerState::Running);
        assert_eq!(
            err.to_string(),
            "cannot change settings while the controller is running"
        );
    }

    #[test]
    fn launch_error_keeps_source() {
        let err = ControllerError::WorkerLaunch(anyhow::anyhow!("binary not found"));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("binary not found"));
    }
}
