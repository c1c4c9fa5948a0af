// ABOUTME: Centralized error taxonomy for the dynamic tool MCP server
// ABOUTME: Converts into tool-result payloads and JSON-RPC error objects

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::jsonrpc::{error_codes, JsonRpcError};

/// The error taxonomy surfaced across management, guard and sandbox paths.
///
/// Variant names mirror the "Kind" column of the error taxonomy table
/// rather than internal type names, so they read naturally in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Duplicate,
    LimitReached,
    ReservedName,
    RevisionConflict,
    ReadOnly,
    AdminDenied,
    GuardRate,
    GuardConcurrency,
    SandboxPolicy,
    SandboxTimeout,
    SandboxOom,
    SandboxExec,
    TransientStorage,
    AuthMissing,
    AuthInvalid,
    OversizeRequest,
    Internal,
}

/// Unified application error.
#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    #[must_use]
    pub fn reserved_name(name: &str) -> Self {
        Self::new(
            ErrorKind::ReservedName,
            format!("tool name '{name}' is reserved"),
        )
    }

    #[must_use]
    pub fn revision_conflict(expected: i64, actual: i64) -> Self {
        Self::new(
            ErrorKind::RevisionConflict,
            format!("expected revision {expected}, current revision is {actual}"),
        )
    }

    #[must_use]
    pub fn read_only() -> Self {
        Self::new(ErrorKind::ReadOnly, "registry is read-only")
    }

    #[must_use]
    pub fn admin_denied() -> Self {
        Self::new(ErrorKind::AdminDenied, "admin token missing or invalid")
    }

    /// Render as an MCP tool-call result: `{isError: true, content: [...]}`.
    #[must_use]
    pub fn to_tool_result(&self) -> Value {
        json!({
            "isError": true,
            "content": [{"type": "text", "text": self.message}],
            "structuredContent": {"kind": self.kind},
        })
    }

    /// Render as a JSON-RPC error object with a stable numeric code.
    #[must_use]
    pub fn to_jsonrpc_error(&self) -> JsonRpcError {
        let code = match self.kind {
            ErrorKind::Validation | ErrorKind::OversizeRequest => error_codes::INVALID_PARAMS,
            ErrorKind::NotFound => error_codes::SERVER_ERROR_START - 1,
            ErrorKind::AuthMissing => -32001,
            ErrorKind::AuthInvalid => -32002,
            ErrorKind::AdminDenied => error_codes::SERVER_ERROR_START - 2,
            ErrorKind::Duplicate
            | ErrorKind::LimitReached
            | ErrorKind::ReservedName
            | ErrorKind::RevisionConflict
            | ErrorKind::ReadOnly
            | ErrorKind::GuardRate
            | ErrorKind::GuardConcurrency
            | ErrorKind::SandboxPolicy
            | ErrorKind::SandboxTimeout
            | ErrorKind::SandboxOom
            | ErrorKind::SandboxExec
            | ErrorKind::TransientStorage
            | ErrorKind::Internal => error_codes::SERVER_ERROR_START - 3,
        };
        JsonRpcError::with_data(code, self.message.clone(), json!({"kind": self.kind}))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Internal, err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Validation, err.to_string())
    }
}

#[cfg(feature = "postgresql")]
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        if is_transient(&err) {
            Self::new(ErrorKind::TransientStorage, err.to_string())
        } else {
            Self::new(ErrorKind::Internal, err.to_string())
        }
    }
}

/// Classifies a known set of transient connection-class errors, per spec
/// §4.2 (connection refused/reset, unreachable, timeout, shutting down,
/// too-many-connections, other class-08 errors).
#[cfg(feature = "postgresql")]
#[must_use]
pub fn is_transient(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.starts_with("08") || code == "53300" || code == "57P03";
        }
    }
    matches!(err, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
}
