use std::path::PathBuf;

use thiserror::Error;
use zbr_api::AgentApiError;

use crate::settings::SettingsError;

/// Misuse of the reporting API by test code.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("no test run is active")]
    NoActiveRun,
    #[error("no test is active")]
    NoActiveTest,
    #[error("{0} must not be empty")]
    EmptyValue(&'static str),
    #[error("'{0}' must be configured before the first test starts")]
    TestsAlreadyStarted(&'static str),
}

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("timed out waiting for coordination lock '{}' held by {holder}", path.display())]
    LockTimeout { path: PathBuf, holder: String },
    #[error("coordination io failure at '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("shared coordination store '{}' is corrupted: {message}", path.display())]
    Corrupted { path: PathBuf, message: String },
    #[error("failed to persist shared values to '{}': {message}", path.display())]
    Persist { path: PathBuf, message: String },
    #[error("shared value '{key}' is not an integer: {value}")]
    NotAnInteger { key: String, value: String },
}

/// Lifecycle outcomes that stop the host test runner.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("reporting agent authentication failed: {0}")]
    Authentication(#[source] AgentApiError),
    #[error("reporting client could not be created: {0}")]
    Client(#[source] AgentApiError),
    #[error("test run is not allowed by the rerun context: {}", reason.as_deref().unwrap_or("no reason given"))]
    RunNotAllowed { reason: Option<String> },
    #[error("rerun context requires specific tests but selected none")]
    EmptyRerunSelection,
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

impl ListenerError {
    /// True for failures caused by missing or rejected configuration.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::Settings(_) | Self::Authentication(_) | Self::Client(_)
        )
    }

    /// True for intentional aborts requested by the rerun context.
    pub fn is_rerun_abort(&self) -> bool {
        matches!(self, Self::RunNotAllowed { .. } | Self::EmptyRerunSelection)
    }
}
