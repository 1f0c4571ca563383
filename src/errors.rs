//! Per-subsystem error types and the Validation/Transient/Fatal taxonomy
//! from the error-handling design (§7).

use thiserror::Error;

/// How a caller should react to an error that crossed a subsystem boundary.
///
/// This mirrors the three-kind taxonomy in §7 as a trait rather than a
/// string tag, so the controller can dispatch mechanically instead of
/// pattern-matching on error messages.
pub trait ErrorKind {
    fn kind(&self) -> Severity;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Reported to the caller as-is, never retried.
    Validation,
    /// Logged, skipped, the surrounding operation continues.
    Transient,
    /// Rolls back any externally visible state already produced by the
    /// surrounding operation.
    Fatal,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ErrorKind for ConfigError {
    fn kind(&self) -> Severity {
        Severity::Fatal
    }
}

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("unsupported stress type or mode")]
    UnsupportedStressShape,
    #[error("plan has {count} tasks, maximum is {max}")]
    TooManyTasks { count: usize, max: usize },
    #[error("malformed URL '{0}'")]
    MalformedUrl(String),
    #[error("URL '{0}' unreachable at admission time: {reason}")]
    UrlUnreachable { url: String, reason: String },
    #[error("request body is not valid JSON: {0}")]
    InvalidJsonBody(String),
    #[error("script '{name}' failed dry-run: {reason}")]
    ScriptDryRunFailed { name: String, reason: String },
    #[error("dynamic-param output exceeds {max} bytes")]
    DynamicParamTooLarge { max: usize },
    #[error("invalid task: {0}")]
    InvalidTask(String),
}

impl ErrorKind for ValidationError {
    fn kind(&self) -> Severity {
        Severity::Validation
    }
}

#[derive(Error, Debug)]
pub enum PlacementError {
    #[error("nodes are busy: could not place {remaining} of {requested} units for task {task_id}")]
    NodesBusy {
        task_id: i64,
        requested: u64,
        remaining: u64,
    },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ErrorKind for PlacementError {
    fn kind(&self) -> Severity {
        Severity::Fatal
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger compare-and-swap conflict on key(s) {keys:?}")]
    Conflict { keys: Vec<String> },
    #[error("ledger transport error: {0}")]
    Transport(String),
    #[error("ledger entry for {addr} not found")]
    NotFound { addr: String },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ErrorKind for LedgerError {
    fn kind(&self) -> Severity {
        match self {
            LedgerError::Conflict { .. } => Severity::Fatal,
            _ => Severity::Transient,
        }
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry transport error: {0}")]
    Transport(String),
    #[error("lease keep-alive exhausted after {attempts} attempts")]
    LeaseLost { attempts: u32 },
}

impl ErrorKind for RegistryError {
    fn kind(&self) -> Severity {
        Severity::Transient
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue transport error: {0}")]
    Transport(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ErrorKind for QueueError {
    fn kind(&self) -> Severity {
        Severity::Transient
    }
}

#[derive(Error, Debug)]
pub enum RecordStoreError {
    #[error("record store transport error: {0}")]
    Transport(String),
    #[error("batch insert affected 0 rows")]
    NoRowsAffected,
    #[error("plan {0} not found")]
    PlanNotFound(i64),
}

impl ErrorKind for RecordStoreError {
    fn kind(&self) -> Severity {
        Severity::Fatal
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ErrorKind for WorkerError {
    fn kind(&self) -> Severity {
        Severity::Transient
    }
}

/// Classification of HTTP/transport errors observed while driving load,
/// used for per-category result tagging (not for the Validation/Transient/
/// Fatal taxonomy above, which governs control flow rather than labeling).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    ClientError,
    ServerError,
    NetworkError,
    TimeoutError,
    OtherError,
}

impl ErrorCategory {
    pub fn from_status_code(status_code: u16) -> Option<Self> {
        match status_code {
            200..=399 => None,
            400..=499 => Some(ErrorCategory::ClientError),
            500..=599 => Some(ErrorCategory::ServerError),
            _ => Some(ErrorCategory::OtherError),
        }
    }

    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            ErrorCategory::TimeoutError
        } else if error.is_connect() || error.is_request() || error.is_body() || error.is_decode()
        {
            ErrorCategory::NetworkError
        } else {
            ErrorCategory::OtherError
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::ClientError => "client_error",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::TimeoutError => "timeout_error",
            ErrorCategory::OtherError => "other_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_validation_severity() {
        let e = ValidationError::TooManyTasks { count: 60, max: 50 };
        assert_eq!(e.kind(), Severity::Validation);
    }

    #[test]
    fn ledger_conflict_is_fatal_but_other_ledger_errors_are_transient() {
        let conflict = LedgerError::Conflict {
            keys: vec!["a".into()],
        };
        assert_eq!(conflict.kind(), Severity::Fatal);

        let transport = LedgerError::Transport("boom".into());
        assert_eq!(transport.kind(), Severity::Transient);
    }

    #[test]
    fn placement_nodes_busy_is_fatal() {
        let e = PlacementError::NodesBusy {
            task_id: 1,
            requested: 80,
            remaining: 40,
        };
        assert_eq!(e.kind(), Severity::Fatal);
    }

    #[test]
    fn status_code_categorization() {
        assert_eq!(ErrorCategory::from_status_code(200), None);
        assert_eq!(
            ErrorCategory::from_status_code(404),
            Some(ErrorCategory::ClientError)
        );
        assert_eq!(
            ErrorCategory::from_status_code(503),
            Some(ErrorCategory::ServerError)
        );
    }
}
