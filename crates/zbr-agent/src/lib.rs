//! Test-run reporting agent: mirrors suite, test and session lifecycle events
//! to the reporting backend and lets test code attach metadata to the run.

pub mod ci;
pub mod context;
pub mod coordinator;
mod error;
pub mod listener;
pub mod log_buffer;
pub mod reporter;
pub mod session;
pub mod settings;
pub mod tags;
pub mod tcm;

#[cfg(test)]
mod test_support;

pub use ci::{resolve_ci_context, resolve_ci_context_from, CiType};
pub use context::{RunContext, SharedRunContext};
pub use coordinator::{
    Coordinator, FileCoordinator, LocalCoordinator, LockHolder, COORDINATION_LOCK,
    RUNNING_TESTS_KEY, RUN_FINISHED_KEY, RUN_ID_KEY,
};
pub use error::{AgentError, CoordinationError, ListenerError};
pub use listener::{
    LifecycleController, LogMessage, RerunPlan, RunnerListener, SuiteInfo, TestInfo, TestOutcome,
    DEFAULT_FRAMEWORK, DEFAULT_RUN_ID_FILE,
};
pub use log_buffer::LogBuffer;
pub use reporter::Reporter;
pub use session::{LauncherOverrides, SessionHandle, SessionObserver, SessionTracker};
pub use settings::{load_settings, load_settings_from, Settings, SettingsError};
pub use zbr_api::{ApiClient, ApiConfig, RerunTest};
