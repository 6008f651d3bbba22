//! Metadata API for test code: screenshots, artifacts, labels, run
//! attributes and test case management settings.
//!
//! Calls made without an active run or test fail with [`AgentError`].
//! Backend failures are logged and swallowed so reporting never fails a test.

use std::path::Path;
use std::sync::Arc;

use tracing::{error, warn};
use zbr_api::{AgentApiError, ApiClient, ArtifactReference, Label, Platform};

use crate::context::{lock_or_recover, SharedRunContext};
use crate::error::AgentError;
use crate::tcm::{TcmKey, TcmScope, TestRailKey, XrayKey, ZephyrKey};

pub const LOCALE_LABEL: &str = "com.zebrunner.app/sut.locale";

#[derive(Clone)]
pub struct Reporter {
    api: Arc<ApiClient>,
    context: SharedRunContext,
}

impl Reporter {
    pub fn new(api: Arc<ApiClient>, context: SharedRunContext) -> Self {
        Self { api, context }
    }

    fn active_test(&self) -> Result<(u64, u64), AgentError> {
        lock_or_recover(&self.context)
            .active_test()
            .ok_or(AgentError::NoActiveTest)
    }

    fn active_run(&self) -> Result<u64, AgentError> {
        lock_or_recover(&self.context)
            .active_run()
            .ok_or(AgentError::NoActiveRun)
    }

    pub fn attach_test_screenshot(&self, path: &Path) -> Result<(), AgentError> {
        let (run_id, test_id) = self.active_test()?;
        log_failure(self.api.send_screenshot(run_id, test_id, path));
        Ok(())
    }

    pub fn attach_test_artifact(&self, path: &Path) -> Result<(), AgentError> {
        let (run_id, test_id) = self.active_test()?;
        log_failure(self.api.send_artifact(path, run_id, Some(test_id)));
        Ok(())
    }

    pub fn attach_run_artifact(&self, path: &Path) -> Result<(), AgentError> {
        let run_id = self.active_run()?;
        log_failure(self.api.send_artifact(path, run_id, None));
        Ok(())
    }

    pub fn attach_test_artifact_reference(&self, name: &str, value: &str) -> Result<(), AgentError> {
        let reference = artifact_reference(name, value)?;
        let (run_id, test_id) = self.active_test()?;
        log_failure(
            self.api
                .send_artifact_references(&[reference], run_id, Some(test_id)),
        );
        Ok(())
    }

    pub fn attach_run_artifact_reference(&self, name: &str, value: &str) -> Result<(), AgentError> {
        let reference = artifact_reference(name, value)?;
        let run_id = self.active_run()?;
        log_failure(self.api.send_artifact_references(&[reference], run_id, None));
        Ok(())
    }

    pub fn attach_test_label(&self, key: &str, value: &str) -> Result<(), AgentError> {
        let label = label(key, value)?;
        let (run_id, test_id) = self.active_test()?;
        log_failure(self.api.send_labels(&[label], run_id, Some(test_id)));
        Ok(())
    }

    pub fn attach_run_label(&self, key: &str, value: &str) -> Result<(), AgentError> {
        let label = label(key, value)?;
        let run_id = self.active_run()?;
        log_failure(self.api.send_labels(&[label], run_id, None));
        Ok(())
    }

    /// Deletes the current test from the run. Its end event is then not
    /// reported.
    pub fn revert_current_test(&self) -> Result<(), AgentError> {
        let (run_id, test_id) = self.active_test()?;
        match self.api.revert_test_registration(run_id, test_id) {
            Ok(()) => {
                let mut context = lock_or_recover(&self.context);
                if context.test_id == Some(test_id) {
                    context.is_reverted = true;
                }
            }
            Err(error) => log_failure::<()>(Err(error)),
        }
        Ok(())
    }

    pub fn set_run_build(&self, build: &str) -> Result<(), AgentError> {
        let build = non_empty("build", build)?;
        let run_id = self.active_run()?;
        log_failure(self.api.patch_test_run_build(run_id, build));
        Ok(())
    }

    pub fn set_run_locale(&self, locale: &str) -> Result<(), AgentError> {
        let locale = non_empty("locale", locale)?;
        let run_id = self.active_run()?;
        log_failure(
            self.api
                .send_labels(&[Label::new(LOCALE_LABEL, locale)], run_id, None),
        );
        Ok(())
    }

    pub fn set_run_platform(&self, name: &str, version: Option<&str>) -> Result<(), AgentError> {
        let name = non_empty("platform", name)?;
        let run_id = self.active_run()?;
        let platform = Platform {
            name: name.to_string(),
            version: version
                .map(str::trim)
                .filter(|version| !version.is_empty())
                .map(str::to_string),
        };
        log_failure(self.api.set_test_run_platform(run_id, &platform));
        Ok(())
    }

    pub fn test_rail(&self) -> TestRail<'_> {
        TestRail { reporter: self }
    }

    pub fn xray(&self) -> Xray<'_> {
        Xray { reporter: self }
    }

    pub fn zephyr(&self) -> Zephyr<'_> {
        Zephyr { reporter: self }
    }

    fn attach_tcm_label<K: TcmKey>(&self, key: K, value: &str) -> Result<(), AgentError> {
        let label_key = key.label_key();
        let (run_id, test_id) = {
            let context = lock_or_recover(&self.context);
            if key.scope() == TcmScope::Run && context.test_is_active() {
                return Err(AgentError::TestsAlreadyStarted(label_key));
            }
            (context.active_run(), context.active_test().map(|(_, test_id)| test_id))
        };
        let Some(run_id) = run_id else {
            error!(label = label_key, value, "cannot attach tcm label before the test run starts");
            return Ok(());
        };
        log_failure(
            self.api
                .send_labels(&[Label::new(label_key, value)], run_id, test_id),
        );
        Ok(())
    }
}

pub struct TestRail<'a> {
    reporter: &'a Reporter,
}

impl TestRail<'_> {
    pub fn disable_sync(&self) -> Result<(), AgentError> {
        self.reporter
            .attach_tcm_label(TestRailKey::SyncEnabled, "false")
    }

    pub fn enable_real_time_sync(&self) -> Result<(), AgentError> {
        self.reporter
            .attach_tcm_label(TestRailKey::SyncRealTime, "true")?;
        self.reporter
            .attach_tcm_label(TestRailKey::IncludeAllCases, "true")
    }

    pub fn include_all_test_cases_in_new_run(&self) -> Result<(), AgentError> {
        self.reporter
            .attach_tcm_label(TestRailKey::IncludeAllCases, "true")
    }

    pub fn set_suite_id(&self, suite_id: &str) -> Result<(), AgentError> {
        self.reporter.attach_tcm_label(TestRailKey::SuiteId, suite_id)
    }

    pub fn set_run_id(&self, run_id: &str) -> Result<(), AgentError> {
        self.reporter.attach_tcm_label(TestRailKey::RunId, run_id)
    }

    pub fn set_run_name(&self, run_name: &str) -> Result<(), AgentError> {
        self.reporter.attach_tcm_label(TestRailKey::RunName, run_name)
    }

    pub fn set_milestone(&self, milestone: &str) -> Result<(), AgentError> {
        self.reporter
            .attach_tcm_label(TestRailKey::Milestone, milestone)
    }

    pub fn set_assignee(&self, assignee: &str) -> Result<(), AgentError> {
        self.reporter.attach_tcm_label(TestRailKey::Assignee, assignee)
    }

    pub fn set_case_id(&self, case_id: &str) -> Result<(), AgentError> {
        self.reporter.attach_tcm_label(TestRailKey::CaseId, case_id)
    }
}

pub struct Xray<'a> {
    reporter: &'a Reporter,
}

impl Xray<'_> {
    pub fn disable_sync(&self) -> Result<(), AgentError> {
        self.reporter.attach_tcm_label(XrayKey::SyncEnabled, "false")
    }

    pub fn enable_real_time_sync(&self) -> Result<(), AgentError> {
        self.reporter.attach_tcm_label(XrayKey::SyncRealTime, "true")
    }

    pub fn set_execution_key(&self, execution_key: &str) -> Result<(), AgentError> {
        self.reporter
            .attach_tcm_label(XrayKey::ExecutionKey, execution_key)
    }

    pub fn set_test_key(&self, test_key: &str) -> Result<(), AgentError> {
        self.reporter.attach_tcm_label(XrayKey::TestKey, test_key)
    }
}

pub struct Zephyr<'a> {
    reporter: &'a Reporter,
}

impl Zephyr<'_> {
    pub fn disable_sync(&self) -> Result<(), AgentError> {
        self.reporter.attach_tcm_label(ZephyrKey::SyncEnabled, "false")
    }

    pub fn enable_real_time_sync(&self) -> Result<(), AgentError> {
        self.reporter.attach_tcm_label(ZephyrKey::SyncRealTime, "true")
    }

    pub fn set_test_cycle_key(&self, key: &str) -> Result<(), AgentError> {
        self.reporter.attach_tcm_label(ZephyrKey::TestCycleKey, key)
    }

    pub fn set_jira_project_key(&self, key: &str) -> Result<(), AgentError> {
        self.reporter.attach_tcm_label(ZephyrKey::JiraProjectKey, key)
    }

    pub fn set_test_case_key(&self, key: &str) -> Result<(), AgentError> {
        self.reporter.attach_tcm_label(ZephyrKey::TestCaseKey, key)
    }
}

fn non_empty<'a>(what: &'static str, value: &'a str) -> Result<&'a str, AgentError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AgentError::EmptyValue(what));
    }
    Ok(trimmed)
}

fn label(key: &str, value: &str) -> Result<Label, AgentError> {
    Ok(Label::new(non_empty("label key", key)?, non_empty("label value", value)?))
}

fn artifact_reference(name: &str, value: &str) -> Result<ArtifactReference, AgentError> {
    Ok(ArtifactReference {
        name: non_empty("artifact reference name", name)?.to_string(),
        value: non_empty("artifact reference value", value)?.to_string(),
    })
}

fn log_failure<T>(result: Result<T, AgentApiError>) {
    if let Err(error) = result {
        match error.status() {
            Some(status) => warn!(operation = error.operation(), status, "{error}"),
            None => error!(operation = error.operation(), "{error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use httpmock::prelude::*;
    use serde_json::json;
    use tempfile::tempdir;
    use zbr_api::{ApiClient, ApiConfig};

    use super::Reporter;
    use crate::context::{RunContext, SharedRunContext};
    use crate::error::AgentError;
    use crate::test_support::settings;

    fn reporter_for(base_url: &str, run_id: Option<u64>, test_id: Option<u64>) -> (Reporter, SharedRunContext) {
        let api = Arc::new(ApiClient::new(ApiConfig::new(base_url, "token")).expect("client"));
        let mut context = RunContext::new(Some(Arc::new(settings(true))));
        context.run_id = run_id;
        context.test_id = test_id;
        let context = Arc::new(Mutex::new(context));
        (Reporter::new(api, Arc::clone(&context)), context)
    }

    #[test]
    fn regression_screenshot_without_active_test_makes_no_calls() {
        let server = MockServer::start();
        let any = server.mock(|when, then| {
            when.method(POST);
            then.status(200);
        });
        let temp = tempdir().expect("tempdir");
        let image = temp.path().join("shot.png");
        std::fs::write(&image, b"png").expect("write");

        let (reporter, _) = reporter_for(&server.base_url(), Some(1), None);
        let error = reporter
            .attach_test_screenshot(&image)
            .expect_err("no active test");
        assert_eq!(error, AgentError::NoActiveTest);
        any.assert_calls(0);
    }

    #[test]
    fn functional_labels_target_test_or_run() {
        let server = MockServer::start();
        let test_labels = server.mock(|when, then| {
            when.method(PUT)
                .path("/api/reporting/v1/test-runs/1/tests/2/labels")
                .json_body(json!({"items": [{"key": "area", "value": "checkout"}]}));
            then.status(204);
        });
        let run_labels = server.mock(|when, then| {
            when.method(PUT)
                .path("/api/reporting/v1/test-runs/1/labels")
                .json_body(json!({"items": [{"key": "com.zebrunner.app/sut.locale", "value": "en_US"}]}));
            then.status(204);
        });

        let (reporter, _) = reporter_for(&server.base_url(), Some(1), Some(2));
        reporter.attach_test_label("area", "checkout").expect("test label");
        reporter.set_run_locale(" en_US ").expect("locale");
        test_labels.assert_calls(1);
        run_labels.assert_calls(1);
    }

    #[test]
    fn unit_empty_values_are_rejected_before_guards() {
        let (reporter, _) = reporter_for("http://127.0.0.1:9", None, None);
        assert_eq!(
            reporter.set_run_build("  "),
            Err(AgentError::EmptyValue("build"))
        );
        assert_eq!(
            reporter.set_run_platform("", None),
            Err(AgentError::EmptyValue("platform"))
        );
        assert_eq!(
            reporter.attach_run_label("key", ""),
            Err(AgentError::EmptyValue("label value"))
        );
        assert_eq!(
            reporter.attach_run_artifact_reference("logs", "https://logs"),
            Err(AgentError::NoActiveRun)
        );
    }

    #[test]
    fn functional_revert_marks_context_only_on_success() {
        let server = MockServer::start();
        let revert = server.mock(|when, then| {
            when.method(DELETE)
                .path("/api/reporting/v1/test-runs/1/tests/2");
            then.status(200);
        });
        let (reporter, context) = reporter_for(&server.base_url(), Some(1), Some(2));
        reporter.revert_current_test().expect("revert");
        revert.assert_calls(1);
        assert!(context.lock().expect("context").is_reverted);

        let failing = MockServer::start();
        failing.mock(|when, then| {
            when.method(DELETE);
            then.status(500);
        });
        let (reporter, context) = reporter_for(&failing.base_url(), Some(1), Some(2));
        reporter.revert_current_test().expect("swallowed");
        assert!(!context.lock().expect("context").is_reverted);
    }

    #[test]
    fn functional_backend_failures_are_swallowed() {
        let server = MockServer::start();
        let platform = server.mock(|when, then| {
            when.method(PUT)
                .path("/api/reporting/v1/test-runs/1/platform")
                .json_body(json!({"name": "linux", "version": "6.1"}));
            then.status(500).body("down");
        });
        let (reporter, _) = reporter_for(&server.base_url(), Some(1), None);
        reporter
            .set_run_platform("linux", Some("6.1"))
            .expect("failure is logged");
        platform.assert_calls(1);
    }

    #[test]
    fn regression_run_level_tcm_settings_rejected_once_test_started() {
        let server = MockServer::start();
        let case_label = server.mock(|when, then| {
            when.method(PUT)
                .path("/api/reporting/v1/test-runs/1/tests/2/labels")
                .json_body(json!({"items": [{"key": "com.zebrunner.app/tcm.xray.test-key", "value": "QA-1"}]}));
            then.status(204);
        });
        let (reporter, _) = reporter_for(&server.base_url(), Some(1), Some(2));

        assert_eq!(
            reporter.test_rail().set_run_name("nightly"),
            Err(AgentError::TestsAlreadyStarted(
                "com.zebrunner.app/tcm.testrail.run-name"
            ))
        );
        reporter.xray().set_test_key("QA-1").expect("case key");
        case_label.assert_calls(1);
    }

    #[test]
    fn functional_run_level_tcm_settings_attach_to_run_before_tests() {
        let server = MockServer::start();
        let run_labels = server.mock(|when, then| {
            when.method(PUT)
                .path("/api/reporting/v1/test-runs/1/labels");
            then.status(204);
        });
        let (reporter, _) = reporter_for(&server.base_url(), Some(1), None);
        reporter.test_rail().enable_real_time_sync().expect("sync");
        reporter.zephyr().set_jira_project_key("QA").expect("project");
        run_labels.assert_calls(3);
    }

    #[test]
    fn unit_tcm_label_without_run_is_dropped() {
        let server = MockServer::start();
        let any = server.mock(|when, then| {
            when.method(PUT);
            then.status(204);
        });
        let (reporter, _) = reporter_for(&server.base_url(), None, None);
        reporter.xray().disable_sync().expect("dropped");
        any.assert_calls(0);
    }
}
