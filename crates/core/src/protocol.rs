//! Wire protocol messages and the line codec.
//!
//! The service and worker exchange one compact JSON object per line over
//! the worker's stdin/stdout. Requests flow service -> worker and are
//! tagged by `requestType`; responses flow worker -> service and are
//! tagged by `responseType`. Bulk array payloads never travel inline;
//! they cross as shared-memory descriptors (see `tandem-shm`).

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::errors::{Error, Result};

/// Key/value arguments attached to requests and responses.
pub type Args = Map<String, Value>;

/// A request sent from the service to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "requestType", rename_all = "UPPERCASE")]
pub enum Request {
    /// Begin executing a script under the given task id.
    Execute {
        task: String,
        script: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        inputs: Args,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        queue: Option<String>,
    },
    /// Request cooperative cancellation of a running task.
    Cancel { task: String },
}

impl Request {
    /// The task id this request addresses.
    pub fn task_id(&self) -> &str {
        match self {
            Request::Execute { task, .. } | Request::Cancel { task } => task,
        }
    }
}

/// A response sent from the worker to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "responseType", rename_all = "UPPERCASE")]
pub enum Response {
    /// The worker has picked the task up and begun running its script.
    Launch { task: String },
    /// Progress report from a running script. All fields optional.
    Update {
        task: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        maximum: Option<i64>,
    },
    /// The script finished normally; outputs carry its results.
    Completion {
        task: String,
        #[serde(default)]
        outputs: Args,
    },
    /// The script observed the cancel flag and terminated cooperatively.
    Cancelation { task: String },
    /// The script raised an uncaught failure.
    Failure {
        task: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Fatal worker-level failure not attributable to a single task.
    Crash {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Response {
    /// The task id this response addresses, if any. CRASH has none.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Response::Launch { task }
            | Response::Update { task, .. }
            | Response::Completion { task, .. }
            | Response::Cancelation { task }
            | Response::Failure { task, .. } => Some(task),
            Response::Crash { .. } => None,
        }
    }

    /// The kind of this response, independent of its payload.
    pub fn kind(&self) -> ResponseType {
        match self {
            Response::Launch { .. } => ResponseType::Launch,
            Response::Update { .. } => ResponseType::Update,
            Response::Completion { .. } => ResponseType::Completion,
            Response::Cancelation { .. } => ResponseType::Cancelation,
            Response::Failure { .. } => ResponseType::Failure,
            Response::Crash { .. } => ResponseType::Crash,
        }
    }
}

/// The kind of a worker response, as delivered to task listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseType {
    Launch,
    Update,
    Completion,
    Cancelation,
    Failure,
    Crash,
}

impl ResponseType {
    /// True iff this response ends the task it addresses.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResponseType::Completion
                | ResponseType::Cancelation
                | ResponseType::Failure
                | ResponseType::Crash
        )
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponseType::Launch => "LAUNCH",
            ResponseType::Update => "UPDATE",
            ResponseType::Completion => "COMPLETION",
            ResponseType::Cancelation => "CANCELATION",
            ResponseType::Failure => "FAILURE",
            ResponseType::Crash => "CRASH",
        };
        f.write_str(name)
    }
}

/// Lifecycle status of a task as seen by the service side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Constructed but not yet started.
    Initial,
    /// EXECUTE sent; not yet picked up by the worker.
    Queued,
    /// The worker reported LAUNCH.
    Running,
    Complete,
    Canceled,
    Failed,
    /// The worker process died before the task reached a terminal state.
    Crashed,
}

impl TaskStatus {
    /// True iff status is Complete, Canceled, Failed, or Crashed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Complete
                | TaskStatus::Canceled
                | TaskStatus::Failed
                | TaskStatus::Crashed
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Initial => "INITIAL",
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Canceled => "CANCELED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Crashed => "CRASHED",
        };
        f.write_str(name)
    }
}

/// Encode a message as a single self-delimited line.
///
/// Compact JSON never contains a raw newline (newlines inside strings are
/// escaped), so one record always occupies exactly one line.
pub fn encode<T: Serialize>(message: &T) -> Result<String> {
    let line = serde_json::to_string(message)?;
    debug_assert!(!line.contains('\n'));
    Ok(line)
}

/// Decode one line into a message, surfacing failures as protocol errors.
pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T> {
    serde_json::from_str(line.trim()).map_err(|e| Error::Protocol {
        message: format!("undecodable record: {e}"),
    })
}
