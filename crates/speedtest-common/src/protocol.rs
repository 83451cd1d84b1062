// Wire protocol between the controller and a measurement worker.
//
// Controller -> worker: one command per line (`start <json>`, `abort`, `status`).
// Worker -> controller: one JSON status snapshot per line.

use crate::constants::commands;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown worker command: {0:?}")]
    UnknownCommand(String),

    #[error("malformed status snapshot: {0}")]
    InvalidSnapshot(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// A command sent from the controller to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Begin a run; the payload is the JSON-encoded settings object.
    Start(String),
    /// Ask the worker to stop the current run.
    Abort,
    /// Ask the worker to report its current snapshot.
    Status,
}

impl WorkerCommand {
    /// Encode as a single protocol line (without the trailing newline).
    pub fn to_line(&self) -> String {
        match self {
            WorkerCommand::Start(payload) => format!("{} {}", commands::START, payload),
            WorkerCommand::Abort => commands::ABORT.to_string(),
            WorkerCommand::Status => commands::STATUS.to_string(),
        }
    }

    /// Decode a protocol line. A bare `start` carries an empty settings object.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(&['\r', '\n'][..]);
        let (word, rest) = match line.split_once(' ') {
            Some((word, rest)) => (word, rest.trim()),
            None => (line.trim(), ""),
        };

        match word {
            commands::START if rest.is_empty() => Ok(WorkerCommand::Start("{}".to_string())),
            commands::START => Ok(WorkerCommand::Start(rest.to_string())),
            commands::ABORT => Ok(WorkerCommand::Abort),
            commands::STATUS => Ok(WorkerCommand::Status),
            _ => Err(ProtocolError::UnknownCommand(line.to_string())),
        }
    }
}

impl fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerCommand::Start(_) => write!(f, "{}", commands::START),
            WorkerCommand::Abort => write!(f, "{}", commands::ABORT),
            WorkerCommand::Status => write!(f, "{}", commands::STATUS),
        }
    }
}

// ---------------------------------------------------------------------------
// Phase code
// ---------------------------------------------------------------------------

/// Discrete marker of the active measurement stage or of how a run ended.
///
/// Kept as an open integer rather than a closed enum: every code `>= 4` is
/// terminal, and only `5` means the run was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestPhase(pub i32);

impl TestPhase {
    pub const NOT_STARTED: TestPhase = TestPhase(-1);
    pub const STARTING: TestPhase = TestPhase(0);
    pub const DOWNLOAD: TestPhase = TestPhase(1);
    pub const PING: TestPhase = TestPhase(2);
    pub const UPLOAD: TestPhase = TestPhase(3);
    pub const FINISHED: TestPhase = TestPhase(4);
    pub const ABORTED: TestPhase = TestPhase(5);

    /// Whether this phase ends the run.
    pub fn is_terminal(self) -> bool {
        self.0 >= Self::FINISHED.0
    }

    /// Whether this phase reports an aborted run.
    pub fn is_aborted(self) -> bool {
        self == Self::ABORTED
    }
}

impl fmt::Display for TestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NOT_STARTED => write!(f, "not started"),
            Self::STARTING => write!(f, "starting"),
            Self::DOWNLOAD => write!(f, "download"),
            Self::PING => write!(f, "ping/jitter"),
            Self::UPLOAD => write!(f, "upload"),
            Self::FINISHED => write!(f, "finished"),
            Self::ABORTED => write!(f, "aborted"),
            TestPhase(other) => write!(f, "phase {}", other),
        }
    }
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

/// One progress/result report emitted by the worker.
///
/// Speeds are in Mbit/s, ping and jitter in milliseconds. `None` means the
/// value has not been measured (the wire carries an empty string).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    #[serde(default, with = "wire_number")]
    pub dl_status: Option<f64>,
    #[serde(default, with = "wire_number")]
    pub ul_status: Option<f64>,
    #[serde(default, with = "wire_number")]
    pub ping_status: Option<f64>,
    #[serde(default, with = "wire_number")]
    pub jitter_status: Option<f64>,
    #[serde(default)]
    pub dl_progress: f64,
    #[serde(default)]
    pub ul_progress: f64,
    #[serde(default)]
    pub ping_progress: f64,
    pub test_state: TestPhase,
    #[serde(default)]
    pub client_ip: String,
}

impl StatusSnapshot {
    /// The report of a worker that has not begun measuring.
    pub fn not_started() -> Self {
        Self {
            dl_status: None,
            ul_status: None,
            ping_status: None,
            jitter_status: None,
            dl_progress: 0.0,
            ul_progress: 0.0,
            ping_progress: 0.0,
            test_state: TestPhase::NOT_STARTED,
            client_ip: String::new(),
        }
    }

    /// Decode a snapshot line received from the worker.
    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Encode as a single protocol line.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self::not_started()
    }
}

/// Speed/latency fields travel as decimal strings (`"93.41"`, `""` when
/// unknown) but numbers and `null` are accepted too. Text that is not a
/// number (a worker may report `"Fail"`) decodes as unknown.
mod wire_number {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Option<f64>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => s.serialize_str(&format!("{:.2}", v)),
            None => s.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(match Option::<Raw>::deserialize(d)? {
            None => None,
            Some(Raw::Number(n)) => Some(n),
            Some(Raw::Text(text)) => text.trim().parse::<f64>().ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_lines() {
        assert_eq!(
            WorkerCommand::Start(r#"{"count_ping":5}"#.into()).to_line(),
            r#"start {"count_ping":5}"#
        );
        assert_eq!(WorkerCommand::Abort.to_line(), "abort");
        assert_eq!(WorkerCommand::Status.to_line(), "status");
    }

    #[test]
    fn parse_commands() {
        assert_eq!(
            WorkerCommand::parse("start {\"a\":1}\n").unwrap(),
            WorkerCommand::Start("{\"a\":1}".into())
        );
        assert_eq!(
            WorkerCommand::parse("start").unwrap(),
            WorkerCommand::Start("{}".into())
        );
        assert_eq!(WorkerCommand::parse("status").unwrap(), WorkerCommand::Status);
        assert_eq!(WorkerCommand::parse("abort\r\n").unwrap(), WorkerCommand::Abort);
        assert!(matches!(
            WorkerCommand::parse("restart"),
            Err(ProtocolError::UnknownCommand(_))
        ));
    }

    #[test]
    fn phase_classification() {
        assert!(!TestPhase::UPLOAD.is_terminal());
        assert!(TestPhase::FINISHED.is_terminal());
        assert!(!TestPhase::FINISHED.is_aborted());
        assert!(TestPhase::ABORTED.is_terminal());
        assert!(TestPhase::ABORTED.is_aborted());
        assert!(TestPhase(7).is_terminal());
        assert!(!TestPhase(7).is_aborted());
        assert_eq!(TestPhase(9).to_string(), "phase 9");
    }

    #[test]
    fn decode_string_speeds() {
        let raw = r#"{"dlStatus":"93.41","ulStatus":"","pingStatus":"12.00","jitterStatus":"1.50",
            "dlProgress":1,"ulProgress":0,"pingProgress":1,"testState":3,"clientIp":"10.0.0.2 - private IPv4 access"}"#;
        let snap = StatusSnapshot::from_json(raw).unwrap();
        assert_eq!(snap.dl_status, Some(93.41));
        assert_eq!(snap.ul_status, None);
        assert_eq!(snap.ping_status, Some(12.0));
        assert_eq!(snap.jitter_status, Some(1.5));
        assert_eq!(snap.dl_progress, 1.0);
        assert_eq!(snap.test_state, TestPhase::UPLOAD);
        assert_eq!(snap.client_ip, "10.0.0.2 - private IPv4 access");
    }

    #[test]
    fn decode_numeric_null_and_failed_speeds() {
        let raw = r#"{"dlStatus":88.5,"ulStatus":null,"pingStatus":"Fail","testState":5}"#;
        let snap = StatusSnapshot::from_json(raw).unwrap();
        assert_eq!(snap.dl_status, Some(88.5));
        assert_eq!(snap.ul_status, None);
        assert_eq!(snap.ping_status, None);
        assert_eq!(snap.jitter_status, None);
        assert!(snap.test_state.is_aborted());
    }

    #[test]
    fn snapshot_without_phase_is_rejected() {
        assert!(StatusSnapshot::from_json(r#"{"dlStatus":"1.00"}"#).is_err());
        assert!(StatusSnapshot::from_json("not json").is_err());
    }

    #[test]
    fn encode_uses_wire_shape() {
        let mut snap = StatusSnapshot::not_started();
        snap.dl_status = Some(12.5);
        let json = snap.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["dlStatus"], "12.50");
        assert_eq!(value["ulStatus"], "");
        assert_eq!(value["testState"], -1);
        assert_eq!(value["clientIp"], "");
        assert!(value.get("dlProgress").is_some());
    }
}
