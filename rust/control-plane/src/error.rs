use std::time::Duration;

use thiserror::Error;

use crate::vm::{RecordSet, VmState};

/// Errors raised by the state store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The requested record is absent; callers decide what that means.
    #[error("{set} record '{name}' not found")]
    NotFound { set: RecordSet, name: String },

    /// Backing file unreachable or corrupt.
    #[error("State store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Store operation cancelled")]
    Cancelled,
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn not_found(set: RecordSet, name: impl Into<String>) -> Self {
        StoreError::NotFound {
            set,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::StoreUnavailable(err.to_string())
    }
}

// A document that no longer decodes means the backing file is corrupt.
impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::StoreUnavailable(format!("corrupt record document: {err}"))
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::StoreUnavailable(format!("store worker failed: {err}"))
    }
}

/// Failure modes of a call to a hypervisor agent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("Agent call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The agent could not be reached.
    #[error("Agent unavailable: {0}")]
    Unavailable(String),

    /// Certificate or trust failure. Never retried by the client itself.
    #[error("Agent authentication failed: {0}")]
    AuthError(String),

    /// The agent answered but reported a failure.
    #[error("Agent reported failure: {0}")]
    RemoteError(String),

    #[error("Agent call cancelled")]
    Cancelled,
}

/// Result type alias for agent calls
pub type AgentResult<T> = Result<T, AgentError>;

impl From<tonic::Status> for AgentError {
    fn from(status: tonic::Status) -> Self {
        use tonic::Code;

        let message = status.message().to_string();
        match status.code() {
            Code::Unavailable => {
                if looks_like_tls_failure(&message) {
                    AgentError::AuthError(message)
                } else {
                    AgentError::Unavailable(message)
                }
            }
            Code::DeadlineExceeded => AgentError::RemoteError(format!("deadline exceeded: {message}")),
            Code::Unauthenticated | Code::PermissionDenied => AgentError::AuthError(message),
            Code::Cancelled => AgentError::Cancelled,
            code => AgentError::RemoteError(format!("{code:?}: {message}")),
        }
    }
}

impl From<tonic::transport::Error> for AgentError {
    fn from(err: tonic::transport::Error) -> Self {
        let chain = error_chain(&err);
        if looks_like_tls_failure(&chain) {
            AgentError::AuthError(chain)
        } else {
            AgentError::Unavailable(chain)
        }
    }
}

/// Render an error with all of its sources, outermost first.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        rendered.push_str(": ");
        rendered.push_str(&inner.to_string());
        source = inner.source();
    }
    rendered
}

fn looks_like_tls_failure(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["certificate", "tls", "handshake", "unknownissuer", "badsignature"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Errors that abort or skip reconciliation work.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Store failure; aborts the current tick, retried on the next one.
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("VM '{name}' has desired state '{state}', which the reconciler cannot drive toward")]
    InvalidDesiredState { name: String, state: VmState },
}
