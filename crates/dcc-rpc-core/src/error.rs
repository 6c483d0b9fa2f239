//! Error types for the RPC fabric.
//!
//! The taxonomy follows the surfaces callers actually branch on: lookup
//! failures, permission failures, communication failures, validation
//! failures, and serialization failures. Task and script errors get their
//! own variants because the task manager re-raises them across call sites.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the RPC fabric.
#[derive(Debug, Error)]
pub enum RpcError {
    // Lookup errors
    #[error("Function not registered: {name}")]
    FunctionNotRegistered { name: String },

    #[error("No registered instance found for {host_type}/{instance}")]
    InstanceNotFound { host_type: String, instance: String },

    #[error("No service registered for {type_name}")]
    ServiceNotRegistered { type_name: &'static str },

    // Permission errors
    #[error("Permission denied: {message}")]
    Permission { message: String },

    // Communication errors
    #[error("Communication error with {address}: {message}")]
    Communication { address: String, message: String },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    // Remote execution errors (peer raised; message preserved verbatim)
    #[error("Remote error ({type_name}): {message}")]
    Remote { type_name: String, message: String },

    // Validation errors
    #[error("Validation error for {param}: {message}")]
    Validation { param: String, message: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // Serialization errors
    #[error("Encode error: {message}")]
    Encode { message: String },

    #[error("Decode error: {message}")]
    Decode { message: String },

    // Task errors
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("Task {task_id} has not completed yet")]
    TaskNotCompleted { task_id: String },

    #[error("Task {task_id} failed: {message}")]
    TaskFailed { task_id: String, message: String },

    #[error("Task was cancelled")]
    TaskCancelled,

    // Script host errors
    #[error("Script error in {name}: {message}")]
    Script { name: String, message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rmp_serde::encode::Error> for RpcError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        RpcError::Encode {
            message: err.to_string(),
        }
    }
}

impl From<rmp_serde::decode::Error> for RpcError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        RpcError::Decode {
            message: err.to_string(),
        }
    }
}

impl RpcError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        RpcError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC codes:
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Application codes (-32000 to -32099):
    /// - -32000: Communication / timeout
    /// - -32001: Instance not found
    /// - -32002: Permission denied
    /// - -32003: Task error
    /// - -32004: Script error
    /// - -32005: Serialization error
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            RpcError::FunctionNotRegistered { .. } => -32601,

            RpcError::Validation { .. } | RpcError::InvalidAddress(_) => -32602,

            RpcError::Communication { .. } | RpcError::Timeout(_) => -32000,

            RpcError::InstanceNotFound { .. } => -32001,

            RpcError::Permission { .. } => -32002,

            RpcError::TaskNotFound { .. }
            | RpcError::TaskNotCompleted { .. }
            | RpcError::TaskFailed { .. }
            | RpcError::TaskCancelled => -32003,

            RpcError::Script { .. } => -32004,

            RpcError::Encode { .. } | RpcError::Decode { .. } => -32005,

            _ => -32603,
        }
    }

    /// Short type name used in batch-call error reporting.
    pub fn type_name(&self) -> &'static str {
        match self {
            RpcError::FunctionNotRegistered { .. } => "FunctionNotRegistered",
            RpcError::InstanceNotFound { .. } => "InstanceNotFound",
            RpcError::ServiceNotRegistered { .. } => "ServiceNotRegistered",
            RpcError::Permission { .. } => "Permission",
            RpcError::Communication { .. } => "Communication",
            RpcError::Timeout(_) => "Timeout",
            RpcError::Remote { .. } => "Remote",
            RpcError::Validation { .. } => "Validation",
            RpcError::InvalidAddress(_) => "InvalidAddress",
            RpcError::Encode { .. } => "Encode",
            RpcError::Decode { .. } => "Decode",
            RpcError::TaskNotFound { .. } => "TaskNotFound",
            RpcError::TaskNotCompleted { .. } => "TaskNotCompleted",
            RpcError::TaskFailed { .. } => "TaskFailed",
            RpcError::TaskCancelled => "TaskCancelled",
            RpcError::Script { .. } => "Script",
            RpcError::Config { .. } => "Config",
            RpcError::Io { .. } => "Io",
            RpcError::Json { .. } => "Json",
            RpcError::Other(_) => "Other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RpcError::FunctionNotRegistered {
            name: "create_rig".into(),
        };
        assert_eq!(err.to_string(), "Function not registered: create_rig");
    }

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(
            RpcError::FunctionNotRegistered {
                name: "f".into()
            }
            .to_rpc_error_code(),
            -32601
        );
        assert_eq!(
            RpcError::Permission {
                message: "nope".into()
            }
            .to_rpc_error_code(),
            -32002
        );
        assert_eq!(
            RpcError::InstanceNotFound {
                host_type: "maya".into(),
                instance: "[default]".into()
            }
            .to_rpc_error_code(),
            -32001
        );
    }

    #[test]
    fn test_type_name_matches_variant() {
        assert_eq!(RpcError::TaskCancelled.type_name(), "TaskCancelled");
        assert_eq!(
            RpcError::Validation {
                param: "count".into(),
                message: "must be positive".into()
            }
            .type_name(),
            "Validation"
        );
    }
}
