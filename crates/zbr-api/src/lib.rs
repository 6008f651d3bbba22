//! Thin blocking client for the reporting backend REST API.
//!
//! One method per remote capability, a single network attempt per call, and
//! typed request/response models serialized in the backend's camelCase form.
mod client;
mod error;
mod models;

pub use client::{ApiClient, ApiConfig, SCREENSHOT_CAPTURED_AT_HEADER};
pub use error::AgentApiError;
pub use models::{
    ArtifactReference, CiContext, CorrelationData, FinishTest, FinishTestSession, Label,
    LogRecord, Milestone, NotificationTarget, NotificationType, Notifications, Platform,
    RerunData, RerunTest, StartTest, StartTestRun, StartTestSession, TestRunConfig,
};
