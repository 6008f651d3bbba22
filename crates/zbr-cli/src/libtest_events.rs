//! Events from `cargo test -- -Z unstable-options --format json`.

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LibtestEvent {
    Suite(SuiteEvent),
    Test(TestEvent),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuiteStatus {
    Started,
    Ok,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SuiteEvent {
    pub event: SuiteStatus,
    #[serde(default)]
    pub test_count: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Started,
    Ok,
    Failed,
    Ignored,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TestEvent {
    pub event: TestStatus,
    pub name: String,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl TestEvent {
    /// Last `::` segment of the test path.
    pub fn short_name(&self) -> &str {
        self.name
            .rsplit_once("::")
            .map_or(self.name.as_str(), |(_, short)| short)
    }
}

/// Parses one output line; blank lines yield `None`.
pub fn parse_event_line(line: &str) -> Result<Option<LibtestEvent>, serde_json::Error> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed).map(Some)
}
