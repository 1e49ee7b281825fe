//! Error types for the bridge crate.

use serde::Serialize;
use thiserror::Error;

use crate::readiness::ReadinessState;

/// Bridge error type
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Module image could not be retrieved from its source
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    /// Module image references a host call the function table does not provide
    #[error("link error: {0}")]
    LinkError(String),

    /// Module image is malformed or its entry routine faulted
    #[error("instantiation error: {0}")]
    InstantiationError(String),

    /// Memory access outside the module's linear memory
    #[error("out of bounds access: offset {offset} len {len} exceeds memory size {size}")]
    OutOfBounds {
        /// Requested start offset
        offset: u64,
        /// Requested length
        len: u64,
        /// Memory size at the time of the access
        size: u64,
    },

    /// Bridge has not reached the ready state
    #[error("bridge not ready: {0}")]
    NotReady(ReadinessState),

    /// No entry point registered under this name
    #[error("unknown entry point: {0}")]
    UnknownEntryPoint(String),

    /// Required entry points never appeared within the polling budget
    #[error("readiness timeout: still missing {missing:?} after {attempts} attempts")]
    ReadyTimeout {
        /// Required names absent at the final check
        missing: Vec<String>,
        /// Number of registry checks performed
        attempts: u32,
    },

    /// Module trapped while servicing a call
    #[error("module fault: {0}")]
    ModuleFault(String),

    /// Random source failure while filling module memory
    #[error("random source failure: {0}")]
    RandomSource(String),

    /// Module returned a result the bridge could not decode
    #[error("malformed module result: {0}")]
    MalformedResult(String),

    /// Bridge has been shut down and accepts no further calls
    #[error("bridge shut down")]
    ShutDown,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// True when the error leaves the module instance unusable, as opposed to
    /// failing only the call that produced it.
    pub fn is_instance_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::OutOfBounds { .. }
                | BridgeError::ModuleFault(_)
                | BridgeError::RandomSource(_)
        )
    }

    /// User-visible status message for this error. Recoverable conditions
    /// (call again later, or with a different name) carry a warning tag,
    /// everything else is an error.
    pub fn status(&self) -> StatusMessage {
        let severity = match self {
            BridgeError::NotReady(_) | BridgeError::UnknownEntryPoint(_) => Severity::Warning,
            _ => Severity::Error,
        };
        StatusMessage {
            severity,
            text: self.to_string(),
        }
    }
}

/// Severity tag for user-visible status messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Recoverable condition, caller may retry
    Warning,
    /// Terminal failure for the call or the instance
    Error,
}

/// User-visible failure report derived from a bridge error
#[derive(Debug, Clone, Serialize)]
pub struct StatusMessage {
    /// How bad it is
    pub severity: Severity,
    /// Human-readable description, free of internal backtraces
    pub text: String,
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
