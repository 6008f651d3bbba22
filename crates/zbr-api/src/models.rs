use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use zbr_core::rfc3339_now;

fn new_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn serialize_as_string<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: std::fmt::Display,
{
    serializer.collect_str(value)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TestRunConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Environment snapshot of the CI system that triggered the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CiContext {
    pub ci_type: String,
    pub env_variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    EmailRecipients,
    MsTeamsChannels,
    SlackChannels,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationTarget {
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Notifications {
    pub notify_on_each_failure: bool,
    pub targets: Vec<NotificationTarget>,
}

/// Body of `POST /test-runs`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartTestRun {
    pub name: String,
    pub framework: String,
    pub started_at: String,
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<TestRunConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub milestone: Option<Milestone>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_context: Option<CiContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notifications: Option<Notifications>,
}

impl StartTestRun {
    /// Run stamped with the current time and a fresh uuid.
    pub fn new(name: impl Into<String>, framework: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            framework: framework.into(),
            started_at: rfc3339_now(),
            uuid: new_uuid(),
            config: None,
            milestone: None,
            ci_context: None,
            notifications: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Label {
    pub key: String,
    pub value: String,
}

impl Label {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactReference {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorrelationData {
    pub name: String,
}

/// Body of `POST /test-runs/{id}/tests`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartTest {
    pub name: String,
    pub class_name: String,
    pub method_name: String,
    pub uuid: String,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintainer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_case: Option<String>,
    pub labels: Vec<Label>,
}

impl StartTest {
    pub fn new(
        name: impl Into<String>,
        class_name: impl Into<String>,
        method_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            class_name: class_name.into(),
            method_name: method_name.into(),
            uuid: new_uuid(),
            started_at: rfc3339_now(),
            correlation_data: None,
            maintainer: None,
            test_case: None,
            labels: Vec::new(),
        }
    }
}

/// Body of `PUT /test-runs/{id}/tests/{id}`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FinishTest {
    pub result: String,
    pub ended_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl FinishTest {
    pub fn new(result: impl Into<String>, reason: Option<String>) -> Self {
        Self {
            result: result.into(),
            ended_at: rfc3339_now(),
            reason,
        }
    }
}

/// One buffered log line. Ids and timestamps travel as strings.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    #[serde(serialize_with = "serialize_as_string")]
    pub test_id: u64,
    pub level: String,
    #[serde(rename = "timestamp", serialize_with = "serialize_as_string")]
    pub timestamp_ms: u64,
    pub message: String,
}

/// Body of `POST /test-runs/{id}/test-sessions`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartTestSession {
    pub session_id: String,
    pub started_at: String,
    pub desired_capabilities: Value,
    pub capabilities: Value,
    pub test_ids: Vec<u64>,
}

impl StartTestSession {
    pub fn new(
        session_id: impl Into<String>,
        capabilities: Value,
        desired_capabilities: Value,
        test_ids: Vec<u64>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            started_at: rfc3339_now(),
            desired_capabilities,
            capabilities,
            test_ids,
        }
    }
}

/// Body of `PUT /test-runs/{id}/test-sessions/{id}`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FinishTestSession {
    pub ended_at: String,
    pub test_ids: Vec<u64>,
}

impl FinishTestSession {
    pub fn new(test_ids: Vec<u64>) -> Self {
        Self {
            ended_at: rfc3339_now(),
            test_ids,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Platform {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// A test selected by the backend for a rerun.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RerunTest {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub correlation_data: Option<CorrelationData>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub ended_at: Option<String>,
}

/// Decision returned by `POST /run-context-exchanges`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RerunData {
    pub test_run_uuid: String,
    pub run_allowed: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub run_only_specific_tests: bool,
    #[serde(default)]
    pub tests_to_run: Vec<RerunTest>,
}
