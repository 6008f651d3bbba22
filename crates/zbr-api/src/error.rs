use std::path::PathBuf;

use thiserror::Error;

/// Failure of a single reporting API call. Never retried by the client.
#[derive(Debug, Error)]
pub enum AgentApiError {
    #[error("failed to build http client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("{operation}: transport error: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{operation}: backend returned non-success status {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("{operation}: invalid response: {message}")]
    InvalidResponse {
        operation: &'static str,
        message: String,
    },
    #[error("{operation}: failed to read '{}': {source}", path.display())]
    File {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("run context is not valid json: {0}")]
    InvalidRunContext(#[source] serde_json::Error),
}

impl AgentApiError {
    /// Name of the remote operation that failed.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::ClientBuild(_) => "build client",
            Self::InvalidRunContext(_) => "exchange run context",
            Self::Transport { operation, .. }
            | Self::Status { operation, .. }
            | Self::InvalidResponse { operation, .. }
            | Self::File { operation, .. } => operation,
        }
    }

    /// HTTP status when the backend rejected the call.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}
