//! Maps test-runner lifecycle callbacks onto reporting API calls.
//!
//! Only the root suite opens and closes the run. Remote failures inside a
//! transition are logged and the run continues unreported; the transitions
//! that return [`ListenerError`] are the ones meant to stop the host runner.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};
use zbr_api::{
    ApiClient, ApiConfig, CorrelationData, FinishTest, LogRecord, Milestone, NotificationTarget,
    NotificationType, Notifications, RerunData, RerunTest, StartTest, StartTestRun,
    TestRunConfig,
};
use zbr_core::{current_unix_timestamp_ms, write_text_atomic};

use crate::ci::{resolve_ci_context, resolve_ci_context_from};
use crate::context::{lock_or_recover, RunContext, SharedRunContext};
use crate::coordinator::{
    Coordinator, COORDINATION_LOCK, RUNNING_TESTS_KEY, RUN_FINISHED_KEY, RUN_ID_KEY,
};
use crate::error::{CoordinationError, ListenerError};
use crate::log_buffer::LogBuffer;
use crate::reporter::Reporter;
use crate::session::{SessionHandle, SessionTracker, SharedSessionTracker};
use crate::settings::{load_settings, Settings};
use crate::tags::parse_test_tags;

pub const DEFAULT_FRAMEWORK: &str = "rust-libtest";
pub const DEFAULT_RUN_ID_FILE: &str = ".zbr-test-run-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteInfo {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
}

impl SuiteInfo {
    pub fn root(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parent_id: None,
        }
    }

    pub fn nested(
        id: impl Into<String>,
        name: impl Into<String>,
        parent_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parent_id: Some(parent_id.into()),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestInfo {
    pub name: String,
    pub qualified_name: String,
    pub tags: Vec<String>,
}

impl TestInfo {
    pub fn new(name: impl Into<String>, qualified_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            qualified_name: qualified_name.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Qualified name without its last `::` or `.` segment.
    pub fn class_name(&self) -> &str {
        let qualified = self.qualified_name.as_str();
        let cut = match (qualified.rfind("::"), qualified.rfind('.')) {
            (Some(colons), Some(dot)) => colons.max(dot),
            (Some(colons), None) => colons,
            (None, Some(dot)) => dot,
            (None, None) => return qualified,
        };
        &qualified[..cut]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    /// Runner status such as `PASS`, `FAIL`, `SKIP` or `NOT RUN`.
    pub status: String,
    pub message: Option<String>,
}

impl TestOutcome {
    pub fn new(status: impl Into<String>, message: Option<String>) -> Self {
        Self {
            status: status.into(),
            message,
        }
    }

    pub fn passed() -> Self {
        Self::new("PASS", None)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new("FAIL", Some(message.into()))
    }

    pub fn skipped() -> Self {
        Self::new("SKIP", None)
    }

    /// Statuses other than `PASS` and `FAIL` report as `SKIPPED`.
    pub fn result(&self) -> &'static str {
        match self.status.as_str() {
            "PASS" => "PASSED",
            "FAIL" => "FAILED",
            _ => "SKIPPED",
        }
    }

    pub fn reason(&self) -> Option<String> {
        self.message
            .as_deref()
            .map(str::trim)
            .filter(|message| !message.is_empty())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub timestamp_ms: Option<u64>,
}

impl LogMessage {
    pub fn new(level: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            message: message.into(),
            timestamp_ms: None,
        }
    }
}

/// Callbacks a host test runner delivers, in order, from one thread.
pub trait RunnerListener {
    fn on_suite_start(&mut self, suite: &SuiteInfo) -> Result<(), ListenerError>;
    fn on_suite_end(&mut self, suite: &SuiteInfo) -> Result<(), ListenerError>;
    fn on_test_start(&mut self, test: &TestInfo) -> Result<(), ListenerError>;
    fn on_test_end(&mut self, test: &TestInfo, outcome: &TestOutcome) -> Result<(), ListenerError>;
    fn on_log_message(&mut self, message: &LogMessage) -> Result<(), ListenerError>;
    fn on_output_file(&mut self, path: &Path) -> Result<(), ListenerError>;

    /// Test selection in force once the root suite has started.
    fn rerun_plan(&self) -> Option<&RerunPlan> {
        None
    }
}

/// Tests selected by a rerun context.
#[derive(Debug, Clone, PartialEq)]
pub struct RerunPlan {
    pub test_run_uuid: String,
    pub run_only_specific_tests: bool,
    pub tests: Vec<RerunTest>,
}

impl RerunPlan {
    pub fn includes(&self, qualified_name: &str) -> bool {
        if !self.run_only_specific_tests {
            return true;
        }
        self.tests.iter().any(|test| {
            test.name == qualified_name
                || test
                    .correlation_data
                    .as_ref()
                    .is_some_and(|data| data.name == qualified_name)
        })
    }
}

impl From<RerunData> for RerunPlan {
    fn from(data: RerunData) -> Self {
        Self {
            test_run_uuid: data.test_run_uuid,
            run_only_specific_tests: data.run_only_specific_tests,
            tests: data.tests_to_run,
        }
    }
}

pub struct LifecycleController {
    api: Option<Arc<ApiClient>>,
    context: SharedRunContext,
    framework: String,
    coordinator: Option<Arc<dyn Coordinator>>,
    run_id_file: Option<PathBuf>,
    ci_environment: Option<BTreeMap<String, String>>,
    log_buffer: Option<LogBuffer>,
    sessions: SharedSessionTracker,
    rerun_plan: Option<RerunPlan>,
}

impl LifecycleController {
    /// Loads settings from `agent.yaml` and the environment, then connects.
    pub fn from_env() -> Result<Self, ListenerError> {
        Self::connect(load_settings()?)
    }

    /// Authenticates against the backend. A disabled configuration yields an
    /// inert controller without contacting the backend.
    pub fn connect(settings: Settings) -> Result<Self, ListenerError> {
        if !settings.enabled {
            info!("reporting agent is disabled");
            return Ok(Self::with_parts(None, RunContext::new(Some(Arc::new(settings)))));
        }
        let config = ApiConfig::new(&settings.server.hostname, &settings.server.access_token);
        let mut api = ApiClient::new(config).map_err(ListenerError::Client)?;
        api.auth().map_err(ListenerError::Authentication)?;
        Ok(Self::new(settings, Arc::new(api)))
    }

    /// Uses an already constructed client as-is.
    pub fn new(settings: Settings, api: Arc<ApiClient>) -> Self {
        Self::with_parts(Some(api), RunContext::new(Some(Arc::new(settings))))
    }

    pub fn disabled() -> Self {
        Self::with_parts(None, RunContext::new(None))
    }

    fn with_parts(api: Option<Arc<ApiClient>>, context: RunContext) -> Self {
        Self {
            api,
            context: Arc::new(Mutex::new(context)),
            framework: DEFAULT_FRAMEWORK.to_string(),
            coordinator: None,
            run_id_file: Some(PathBuf::from(DEFAULT_RUN_ID_FILE)),
            ci_environment: None,
            log_buffer: None,
            sessions: Arc::new(Mutex::new(None)),
            rerun_plan: None,
        }
    }

    pub fn with_framework(mut self, framework: impl Into<String>) -> Self {
        self.framework = framework.into();
        self
    }

    pub fn with_coordinator(mut self, coordinator: Arc<dyn Coordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// `None` disables writing the run id file.
    pub fn with_run_id_file(mut self, path: Option<PathBuf>) -> Self {
        self.run_id_file = path;
        self
    }

    /// Detects the CI system from `env` instead of the process environment.
    pub fn with_ci_environment(mut self, env: BTreeMap<String, String>) -> Self {
        self.ci_environment = Some(env);
        self
    }

    pub fn context(&self) -> SharedRunContext {
        Arc::clone(&self.context)
    }

    pub fn run_id(&self) -> Option<u64> {
        lock_or_recover(&self.context).active_run()
    }

    pub fn reporter(&self) -> Option<Reporter> {
        let api = self.api.as_ref()?;
        Some(Reporter::new(Arc::clone(api), Arc::clone(&self.context)))
    }

    pub fn session_observer(&self) -> SessionHandle {
        SessionHandle::new(Arc::clone(&self.sessions))
    }

    fn settings(&self) -> Option<Arc<Settings>> {
        let context = lock_or_recover(&self.context);
        if !context.is_configured() {
            return None;
        }
        context.settings.clone()
    }

    fn build_run_request(&self, settings: &Settings, suite: &SuiteInfo) -> StartTestRun {
        let name = settings
            .run
            .display_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(&suite.name);
        let mut request = StartTestRun::new(name, &self.framework);

        if settings.run.environment.is_some() || settings.run.build.is_some() {
            request.config = Some(TestRunConfig {
                environment: settings.run.environment.clone(),
                build: settings.run.build.clone(),
            });
        }

        if let Some(milestone) = &settings.milestone {
            let id = milestone.id.as_deref().and_then(|raw| {
                let parsed = raw.trim().parse::<u64>().ok();
                if parsed.is_none() {
                    warn!(milestone_id = raw, "ignoring non-numeric milestone id");
                }
                parsed
            });
            if id.is_some() || milestone.name.is_some() {
                request.milestone = Some(Milestone {
                    id,
                    name: milestone.name.clone(),
                });
            }
        }

        if let Some(notification) = &settings.notification {
            let targets = [
                (NotificationType::EmailRecipients, &notification.emails),
                (NotificationType::SlackChannels, &notification.slack_channels),
                (NotificationType::MsTeamsChannels, &notification.ms_teams_channels),
            ]
            .into_iter()
            .filter_map(|(kind, value)| {
                let value = value.as_deref()?.trim();
                (!value.is_empty()).then(|| NotificationTarget {
                    kind,
                    value: value.to_string(),
                })
            })
            .collect();
            request.notifications = Some(Notifications {
                notify_on_each_failure: notification.notify_on_each_failure,
                targets,
            });
        }

        request.ci_context = match &self.ci_environment {
            Some(env) => resolve_ci_context_from(env),
            None => resolve_ci_context(),
        };
        request
    }

    fn apply_rerun_context(
        &mut self,
        api: &ApiClient,
        token: &str,
        request: &mut StartTestRun,
    ) -> Result<(), ListenerError> {
        let data = match api.exchange_run_context(token) {
            Ok(data) => data,
            Err(error) => {
                error!(
                    operation = error.operation(),
                    "rerun context exchange failed, starting a fresh run: {error}"
                );
                return Ok(());
            }
        };
        if !data.run_allowed {
            return Err(ListenerError::RunNotAllowed {
                reason: data.reason,
            });
        }
        if data.run_only_specific_tests && data.tests_to_run.is_empty() {
            return Err(ListenerError::EmptyRerunSelection);
        }
        info!(
            test_run_uuid = %data.test_run_uuid,
            selected = data.tests_to_run.len(),
            "continuing test run from rerun context"
        );
        request.uuid = data.test_run_uuid.clone();
        self.rerun_plan = Some(RerunPlan::from(data));
        Ok(())
    }

    fn adjust_running_tests(&self, delta: i64) {
        let Some(coordinator) = &self.coordinator else {
            return;
        };
        let mut outcome = Ok(0);
        let locked = coordinator.with_lock(COORDINATION_LOCK, &mut || {
            outcome = coordinator.adjust_counter(RUNNING_TESTS_KEY, delta);
        });
        match locked.and(outcome) {
            Ok(running) => debug!(running, "shared running test count updated"),
            Err(error) => error!("failed to update shared running test count: {error}"),
        }
    }

    fn should_finish_run(&self) -> bool {
        let Some(coordinator) = &self.coordinator else {
            return true;
        };
        let mut outcome = Ok(false);
        let locked = coordinator.with_lock(COORDINATION_LOCK, &mut || {
            outcome = claim_run_finish(coordinator.as_ref());
        });
        match locked.and(outcome) {
            Ok(claimed) => claimed,
            Err(error) => {
                error!("cannot decide whether to finish the shared run: {error}");
                false
            }
        }
    }

    fn write_run_id_file(&self, run_id: u64) {
        let Some(path) = &self.run_id_file else {
            return;
        };
        if let Err(error) = write_text_atomic(path, &run_id.to_string()) {
            warn!(path = %path.display(), "failed to write run id file: {error:#}");
        }
    }
}

impl RunnerListener for LifecycleController {
    fn on_suite_start(&mut self, suite: &SuiteInfo) -> Result<(), ListenerError> {
        if !suite.is_root() {
            return Ok(());
        }
        let (Some(api), Some(settings)) = (self.api.clone(), self.settings()) else {
            return Ok(());
        };

        let mut request = self.build_run_request(&settings, suite);
        if let Some(token) = settings
            .run
            .context
            .as_deref()
            .filter(|token| !token.trim().is_empty())
        {
            self.apply_rerun_context(&api, token, &mut request)?;
        }

        let run_id = match &self.coordinator {
            Some(coordinator) => {
                adopt_or_create_run(coordinator.as_ref(), &api, &settings.project_key, &request)?
            }
            None => create_run(&api, &settings.project_key, &request),
        };
        let Some(run_id) = run_id else {
            return Ok(());
        };

        lock_or_recover(&self.context).run_id = Some(run_id);
        self.log_buffer = Some(LogBuffer::new(Arc::clone(&api), Some(run_id)));
        *lock_or_recover(&self.sessions) = Some(SessionTracker::new(api, run_id));
        Ok(())
    }

    fn on_suite_end(&mut self, suite: &SuiteInfo) -> Result<(), ListenerError> {
        if !suite.is_root() {
            return Ok(());
        }
        let Some(run_id) = lock_or_recover(&self.context).active_run() else {
            return Ok(());
        };
        if let Some(buffer) = self.log_buffer.as_mut() {
            buffer.flush();
        }

        // Sessions belong to this process even when the run is shared.
        if let Some(tracker) = lock_or_recover(&self.sessions).as_mut() {
            tracker.finish_all();
        }
        if self.should_finish_run() {
            if let Some(api) = &self.api {
                match api.finish_test_run(run_id) {
                    Ok(()) => info!(run_id, "test run finished"),
                    Err(error) => error!(run_id, operation = error.operation(), "{error}"),
                }
            }
        } else {
            debug!(run_id, "leaving shared test run open for other workers");
        }
        self.write_run_id_file(run_id);
        Ok(())
    }

    fn on_test_start(&mut self, test: &TestInfo) -> Result<(), ListenerError> {
        let Some(api) = &self.api else {
            return Ok(());
        };
        let Some(run_id) = lock_or_recover(&self.context).active_run() else {
            return Ok(());
        };

        let metadata = parse_test_tags(&test.tags);
        let mut request = StartTest::new(&test.name, test.class_name(), &test.name);
        request.correlation_data = serde_json::to_string(&CorrelationData {
            name: test.qualified_name.clone(),
        })
        .ok();
        request.maintainer = metadata.maintainer;
        request.test_case = Some(test.qualified_name.clone());
        request.labels = metadata.labels;

        let test_id = match api.start_test(run_id, &request) {
            Ok(test_id) => test_id,
            Err(error) => {
                error!(run_id, test = %test.qualified_name, operation = error.operation(), "{error}");
                lock_or_recover(&self.context).test_id = None;
                return Ok(());
            }
        };
        debug!(run_id, test_id, test = %test.qualified_name, "test started");
        {
            let mut context = lock_or_recover(&self.context);
            context.test_id = Some(test_id);
            context.is_reverted = false;
        }
        if let Some(tracker) = lock_or_recover(&self.sessions).as_mut() {
            tracker.add_test(test_id);
        }
        self.adjust_running_tests(1);
        Ok(())
    }

    fn on_test_end(&mut self, test: &TestInfo, outcome: &TestOutcome) -> Result<(), ListenerError> {
        let (active, is_reverted) = {
            let context = lock_or_recover(&self.context);
            (context.active_test(), context.is_reverted)
        };
        let Some((run_id, test_id)) = active else {
            return Ok(());
        };

        if let Some(tracker) = lock_or_recover(&self.sessions).as_mut() {
            tracker.remove_test(test_id);
        }
        if is_reverted {
            debug!(run_id, test_id, "skipping finish of reverted test");
        } else if let Some(api) = &self.api {
            let request = FinishTest::new(outcome.result(), outcome.reason());
            match api.finish_test(run_id, test_id, &request) {
                Ok(()) => debug!(run_id, test_id, result = outcome.result(), test = %test.qualified_name, "test finished"),
                Err(error) => error!(run_id, test_id, operation = error.operation(), "{error}"),
            }
        }
        self.adjust_running_tests(-1);
        lock_or_recover(&self.context).test_id = None;
        Ok(())
    }

    fn on_log_message(&mut self, message: &LogMessage) -> Result<(), ListenerError> {
        let (test_id, send_logs) = {
            let context = lock_or_recover(&self.context);
            let send_logs = context
                .settings
                .as_ref()
                .is_some_and(|settings| settings.send_logs);
            (context.active_test().map(|(_, test_id)| test_id), send_logs)
        };
        let (Some(test_id), true) = (test_id, send_logs) else {
            return Ok(());
        };
        if let Some(buffer) = self.log_buffer.as_mut() {
            buffer.add(LogRecord {
                test_id,
                level: message.level.clone(),
                timestamp_ms: message.timestamp_ms.unwrap_or_else(current_unix_timestamp_ms),
                message: message.message.clone(),
            });
        }
        Ok(())
    }

    fn on_output_file(&mut self, path: &Path) -> Result<(), ListenerError> {
        let Some(api) = &self.api else {
            return Ok(());
        };
        let (run_id, test_id) = {
            let context = lock_or_recover(&self.context);
            (context.active_run(), context.active_test().map(|(_, test_id)| test_id))
        };
        let Some(run_id) = run_id else {
            return Ok(());
        };
        if let Err(error) = api.send_artifact(path, run_id, test_id) {
            error!(run_id, path = %path.display(), operation = error.operation(), "{error}");
        }
        Ok(())
    }

    fn rerun_plan(&self) -> Option<&RerunPlan> {
        self.rerun_plan.as_ref()
    }
}

fn create_run(api: &ApiClient, project_key: &str, request: &StartTestRun) -> Option<u64> {
    match api.start_test_run(project_key, request) {
        Ok(run_id) => {
            info!(run_id, name = %request.name, "test run started");
            Some(run_id)
        }
        Err(error) => {
            error!(operation = error.operation(), "{error}");
            None
        }
    }
}

fn adopt_or_create_run(
    coordinator: &dyn Coordinator,
    api: &ApiClient,
    project_key: &str,
    request: &StartTestRun,
) -> Result<Option<u64>, CoordinationError> {
    let mut outcome = Ok(None);
    coordinator.with_lock(COORDINATION_LOCK, &mut || {
        outcome = adopt_or_create_run_locked(coordinator, api, project_key, request);
    })?;
    outcome
}

fn adopt_or_create_run_locked(
    coordinator: &dyn Coordinator,
    api: &ApiClient,
    project_key: &str,
    request: &StartTestRun,
) -> Result<Option<u64>, CoordinationError> {
    if let Some(shared) = coordinator.get(RUN_ID_KEY)? {
        let run_id = shared
            .trim()
            .parse::<u64>()
            .map_err(|_| CoordinationError::NotAnInteger {
                key: RUN_ID_KEY.to_string(),
                value: shared.clone(),
            })?;
        if !run_finish_claimed(coordinator)? {
            info!(run_id, "joining shared test run");
            return Ok(Some(run_id));
        }
        info!(
            previous_run_id = run_id,
            "shared test run already finished, starting a new one"
        );
    }
    let run_id = create_run(api, project_key, request);
    if let Some(run_id) = run_id {
        coordinator.set(RUN_ID_KEY, &run_id.to_string())?;
        coordinator.set(RUNNING_TESTS_KEY, "0")?;
        coordinator.set(RUN_FINISHED_KEY, "false")?;
    }
    Ok(run_id)
}

fn run_finish_claimed(coordinator: &dyn Coordinator) -> Result<bool, CoordinationError> {
    Ok(coordinator.get(RUN_FINISHED_KEY)?.as_deref() == Some("true"))
}

/// Claims the shared run finish once no worker has a test in flight.
fn claim_run_finish(coordinator: &dyn Coordinator) -> Result<bool, CoordinationError> {
    let running = coordinator.counter(RUNNING_TESTS_KEY)?;
    if running > 0 {
        return Ok(false);
    }
    if run_finish_claimed(coordinator)? {
        return Ok(false);
    }
    coordinator.set(RUN_FINISHED_KEY, "true")?;
    Ok(true)
}
