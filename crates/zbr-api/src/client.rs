use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{multipart, Client, RequestBuilder, Response};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use zbr_core::{current_unix_timestamp_ms, rfc3339_seconds_ago};

use crate::{
    AgentApiError, ArtifactReference, FinishTest, FinishTestSession, Label, LogRecord, Platform,
    RerunData, StartTest, StartTestRun, StartTestSession,
};

/// Header carrying the screenshot capture time in epoch milliseconds.
pub const SCREENSHOT_CAPTURED_AT_HEADER: &str = "x-zbr-screenshot-captured-at";

const REPORTING_PATH: &str = "/api/reporting/v1";
const AUTH_REFRESH_PATH: &str = "/api/iam/v1/auth/refresh";

#[derive(Debug, Clone)]
/// Connection parameters for [`ApiClient`].
pub struct ApiConfig {
    pub service_url: String,
    pub access_token: String,
    /// Transport timeout; `None` keeps the transport default.
    pub request_timeout_ms: Option<u64>,
}

impl ApiConfig {
    pub fn new(service_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            service_url: service_url.into(),
            access_token: access_token.into(),
            request_timeout_ms: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    auth_token: String,
}

#[derive(Deserialize)]
struct NumericId {
    id: u64,
}

#[derive(Deserialize)]
struct AnyId {
    #[serde(default)]
    id: Option<Value>,
}

#[derive(Debug)]
/// Blocking client for the reporting backend.
///
/// Stateless apart from the bearer token obtained by [`ApiClient::auth`].
/// Every method performs exactly one HTTP attempt and maps transport failures
/// and non-success statuses to [`AgentApiError`].
pub struct ApiClient {
    client: Client,
    service_url: String,
    access_token: String,
    auth_token: Option<String>,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> Result<Self, AgentApiError> {
        let mut builder = Client::builder();
        if let Some(timeout_ms) = config.request_timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout_ms.max(1)));
        }
        let client = builder.build().map_err(AgentApiError::ClientBuild)?;
        Ok(Self {
            client,
            service_url: config.service_url.trim_end_matches('/').to_string(),
            access_token: config.access_token,
            auth_token: None,
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_token.is_some()
    }

    /// Exchanges the long-lived access token for a short-lived bearer token.
    pub fn auth(&mut self) -> Result<(), AgentApiError> {
        const OPERATION: &str = "authorize agent";
        let url = format!("{}{AUTH_REFRESH_PATH}", self.service_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "refreshToken": self.access_token }))
            .send()
            .map_err(|source| AgentApiError::Transport {
                operation: OPERATION,
                source,
            })?;
        let response = ensure_success(OPERATION, response)?;
        let body: AuthResponse = parse_json(OPERATION, response)?;
        self.auth_token = Some(body.auth_token);
        debug!("reporting agent authenticated");
        Ok(())
    }

    pub fn start_test_run(
        &self,
        project_key: &str,
        body: &StartTestRun,
    ) -> Result<u64, AgentApiError> {
        const OPERATION: &str = "create test run";
        let request = self
            .request(reqwest::Method::POST, "/test-runs")
            .query(&[("projectKey", project_key)])
            .json(body);
        let response = self.send(OPERATION, request)?;
        let created: NumericId = parse_json(OPERATION, response)?;
        Ok(created.id)
    }

    /// Marks the run finished one second in the past so the end timestamp
    /// trails every event already recorded.
    pub fn finish_test_run(&self, run_id: u64) -> Result<(), AgentApiError> {
        let request = self
            .request(reqwest::Method::PUT, &format!("/test-runs/{run_id}"))
            .json(&json!({ "endedAt": rfc3339_seconds_ago(1) }));
        self.send("finish test run", request).map(drop)
    }

    pub fn patch_test_run_build(&self, run_id: u64, build: &str) -> Result<(), AgentApiError> {
        let body = json!([{ "op": "replace", "path": "/config/build", "value": build }]);
        let request = self
            .request(reqwest::Method::PATCH, &format!("/test-runs/{run_id}"))
            .json(&body);
        self.send("patch test run build", request).map(drop)
    }

    pub fn set_test_run_platform(
        &self,
        run_id: u64,
        platform: &Platform,
    ) -> Result<(), AgentApiError> {
        let request = self
            .request(reqwest::Method::PUT, &format!("/test-runs/{run_id}/platform"))
            .json(platform);
        self.send("set test run platform", request).map(drop)
    }

    pub fn start_test(&self, run_id: u64, body: &StartTest) -> Result<u64, AgentApiError> {
        const OPERATION: &str = "create test";
        let request = self
            .request(reqwest::Method::POST, &format!("/test-runs/{run_id}/tests"))
            .json(body);
        let response = self.send(OPERATION, request)?;
        let created: NumericId = parse_json(OPERATION, response)?;
        Ok(created.id)
    }

    pub fn finish_test(
        &self,
        run_id: u64,
        test_id: u64,
        body: &FinishTest,
    ) -> Result<(), AgentApiError> {
        let request = self
            .request(
                reqwest::Method::PUT,
                &format!("/test-runs/{run_id}/tests/{test_id}"),
            )
            .json(body);
        self.send("finish test", request).map(drop)
    }

    /// Removes a test from the run as if it had never been registered.
    pub fn revert_test_registration(&self, run_id: u64, test_id: u64) -> Result<(), AgentApiError> {
        let request = self.request(
            reqwest::Method::DELETE,
            &format!("/test-runs/{run_id}/tests/{test_id}"),
        );
        self.send("revert test registration", request).map(drop)
    }

    pub fn send_logs(&self, run_id: u64, logs: &[LogRecord]) -> Result<(), AgentApiError> {
        let request = self
            .request(reqwest::Method::POST, &format!("/test-runs/{run_id}/logs"))
            .json(logs);
        self.send("send logs", request).map(drop)
    }

    pub fn send_screenshot(
        &self,
        run_id: u64,
        test_id: u64,
        image_path: &Path,
    ) -> Result<(), AgentApiError> {
        const OPERATION: &str = "send screenshot";
        let bytes = read_upload(OPERATION, image_path)?;
        let request = self
            .request(
                reqwest::Method::POST,
                &format!("/test-runs/{run_id}/tests/{test_id}/screenshots"),
            )
            .header(CONTENT_TYPE, "image/png")
            .header(
                SCREENSHOT_CAPTURED_AT_HEADER,
                current_unix_timestamp_ms().to_string(),
            )
            .body(bytes);
        self.send(OPERATION, request).map(drop)
    }

    /// Uploads a file to the test when `test_id` is present, else to the run.
    pub fn send_artifact(
        &self,
        path: &Path,
        run_id: u64,
        test_id: Option<u64>,
    ) -> Result<(), AgentApiError> {
        const OPERATION: &str = "send artifact";
        let bytes = read_upload(OPERATION, path)?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("artifact")
            .to_string();
        let form = multipart::Form::new()
            .part("file", multipart::Part::bytes(bytes).file_name(file_name));
        let request = self
            .request(reqwest::Method::POST, &scoped_path(run_id, test_id, "artifacts"))
            .multipart(form);
        self.send(OPERATION, request).map(drop)
    }

    pub fn send_artifact_references(
        &self,
        references: &[ArtifactReference],
        run_id: u64,
        test_id: Option<u64>,
    ) -> Result<(), AgentApiError> {
        let request = self
            .request(
                reqwest::Method::PUT,
                &scoped_path(run_id, test_id, "artifact-references"),
            )
            .json(&json!({ "items": references }));
        self.send("send artifact references", request).map(drop)
    }

    pub fn send_labels(
        &self,
        labels: &[Label],
        run_id: u64,
        test_id: Option<u64>,
    ) -> Result<(), AgentApiError> {
        let request = self
            .request(reqwest::Method::PUT, &scoped_path(run_id, test_id, "labels"))
            .json(&json!({ "items": labels }));
        self.send("send labels", request).map(drop)
    }

    /// Returns the backend session id, or `None` when the backend did not
    /// assign one.
    pub fn start_test_session(
        &self,
        run_id: u64,
        body: &StartTestSession,
    ) -> Result<Option<String>, AgentApiError> {
        const OPERATION: &str = "start test session";
        let request = self
            .request(
                reqwest::Method::POST,
                &format!("/test-runs/{run_id}/test-sessions"),
            )
            .json(body);
        let response = self.send(OPERATION, request)?;
        let created: AnyId = parse_json(OPERATION, response)?;
        Ok(created.id.and_then(|id| match id {
            Value::String(text) if !text.is_empty() => Some(text),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        }))
    }

    pub fn finish_test_session(
        &self,
        run_id: u64,
        session_id: &str,
        body: &FinishTestSession,
    ) -> Result<(), AgentApiError> {
        let request = self
            .request(
                reqwest::Method::PUT,
                &format!("/test-runs/{run_id}/test-sessions/{session_id}"),
            )
            .json(body);
        self.send("finish test session", request).map(drop)
    }

    /// Exchanges an opaque rerun token for a run-permission decision.
    pub fn exchange_run_context(&self, run_context: &str) -> Result<RerunData, AgentApiError> {
        const OPERATION: &str = "exchange run context";
        let payload: Value =
            serde_json::from_str(run_context).map_err(AgentApiError::InvalidRunContext)?;
        let request = self
            .request(reqwest::Method::POST, "/run-context-exchanges")
            .json(&payload);
        let response = self.send(OPERATION, request)?;
        let mut body: Value = parse_json(OPERATION, response)?;
        if let Some(tests) = body.get_mut("testsToRun").and_then(Value::as_array_mut) {
            for test in tests {
                decode_correlation_data(test);
            }
        }
        serde_json::from_value(body).map_err(|error| AgentApiError::InvalidResponse {
            operation: OPERATION,
            message: error.to_string(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let url = format!("{}{REPORTING_PATH}{path}", self.service_url);
        let builder = self.client.request(method, url);
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn send(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<Response, AgentApiError> {
        let response = request
            .send()
            .map_err(|source| AgentApiError::Transport { operation, source })?;
        debug!(
            operation,
            url = %response.url(),
            status = response.status().as_u16(),
            "reporting api response"
        );
        ensure_success(operation, response)
    }
}

fn ensure_success(operation: &'static str, response: Response) -> Result<Response, AgentApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(AgentApiError::Status {
        operation,
        status: status.as_u16(),
        body,
    })
}

fn parse_json<T: serde::de::DeserializeOwned>(
    operation: &'static str,
    response: Response,
) -> Result<T, AgentApiError> {
    let raw = response
        .text()
        .map_err(|source| AgentApiError::Transport { operation, source })?;
    serde_json::from_str(&raw).map_err(|error| AgentApiError::InvalidResponse {
        operation,
        message: format!("{error}: {raw}"),
    })
}

fn read_upload(operation: &'static str, path: &Path) -> Result<Vec<u8>, AgentApiError> {
    std::fs::read(path).map_err(|source| AgentApiError::File {
        operation,
        path: path.to_path_buf(),
        source,
    })
}

fn scoped_path(run_id: u64, test_id: Option<u64>, resource: &str) -> String {
    match test_id {
        Some(test_id) => format!("/test-runs/{run_id}/tests/{test_id}/{resource}"),
        None => format!("/test-runs/{run_id}/{resource}"),
    }
}

fn decode_correlation_data(test: &mut Value) {
    let Some(slot) = test.get_mut("correlationData") else {
        return;
    };
    let decoded = match slot {
        Value::String(raw) if raw.trim().is_empty() => Value::Null,
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(value) => value,
            Err(error) => {
                warn!(%error, "ignoring undecodable rerun correlation data");
                Value::Null
            }
        },
        _ => return,
    };
    *slot = decoded;
}
