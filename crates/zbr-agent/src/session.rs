//! Tracking of externally managed sessions (browser drivers and the like).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tracing::{debug, error, warn};
use zbr_api::{ApiClient, FinishTestSession, StartTestSession};

use crate::context::lock_or_recover;
use crate::settings::LauncherSettings;

/// Hook the host wires to its driver library to report session open/close.
pub trait SessionObserver {
    fn on_session_start(&self, session_id: &str, capabilities: &Value, desired_capabilities: &Value);
    fn on_session_end(&self, session_id: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedSession {
    pub local_id: String,
    pub remote_id: Option<String>,
    /// Every test seen while open, in first-seen order.
    pub test_ids: Vec<u64>,
}

/// Sessions open within one run together with the tests that touched them.
pub struct SessionTracker {
    api: Arc<ApiClient>,
    run_id: u64,
    active_tests: Vec<u64>,
    sessions: HashMap<String, TrackedSession>,
}

impl SessionTracker {
    pub fn new(api: Arc<ApiClient>, run_id: u64) -> Self {
        Self {
            api,
            run_id,
            active_tests: Vec::new(),
            sessions: HashMap::new(),
        }
    }

    pub fn active_tests(&self) -> &[u64] {
        &self.active_tests
    }

    pub fn session(&self, local_id: &str) -> Option<&TrackedSession> {
        self.sessions.get(local_id)
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Registers a session seeded with every currently active test. A session
    /// the backend does not acknowledge stays tracked without a remote id.
    pub fn start_session(&mut self, local_id: &str, capabilities: &Value, desired: &Value) {
        let test_ids = self.active_tests.clone();
        let request = StartTestSession::new(
            local_id,
            capabilities.clone(),
            desired.clone(),
            test_ids.clone(),
        );
        let remote_id = match self.api.start_test_session(self.run_id, &request) {
            Ok(Some(remote_id)) => {
                debug!(session_id = %remote_id, local_id, "test session started");
                Some(remote_id)
            }
            Ok(None) => {
                warn!(local_id, "backend did not assign a test session id");
                None
            }
            Err(error) => {
                error!(local_id, operation = error.operation(), "{error}");
                None
            }
        };
        self.sessions.insert(
            local_id.to_string(),
            TrackedSession {
                local_id: local_id.to_string(),
                remote_id,
                test_ids,
            },
        );
    }

    /// Stops tracking the session; the backend hears about it only when it
    /// had assigned a remote id.
    pub fn finish_session(&mut self, local_id: &str) {
        let Some(session) = self.sessions.remove(local_id) else {
            debug!(local_id, "finish requested for unknown session");
            return;
        };
        let Some(remote_id) = session.remote_id else {
            return;
        };
        let request = FinishTestSession::new(session.test_ids);
        if let Err(error) = self
            .api
            .finish_test_session(self.run_id, &remote_id, &request)
        {
            error!(session_id = %remote_id, operation = error.operation(), "{error}");
        }
    }

    pub fn add_test(&mut self, test_id: u64) {
        if !self.active_tests.contains(&test_id) {
            self.active_tests.push(test_id);
        }
        for session in self.sessions.values_mut() {
            if !session.test_ids.contains(&test_id) {
                session.test_ids.push(test_id);
            }
        }
    }

    /// Sessions keep tests they have already seen.
    pub fn remove_test(&mut self, test_id: u64) {
        self.active_tests.retain(|active| *active != test_id);
    }

    pub fn finish_all(&mut self) {
        let local_ids = self.sessions.keys().cloned().collect::<Vec<_>>();
        for local_id in local_ids {
            self.finish_session(&local_id);
        }
    }
}

/// Shared slot holding the tracker once a run is active.
pub type SharedSessionTracker = Arc<Mutex<Option<SessionTracker>>>;

/// Cloneable [`SessionObserver`] handed to the host's driver integration.
#[derive(Clone)]
pub struct SessionHandle {
    tracker: SharedSessionTracker,
}

impl SessionHandle {
    pub(crate) fn new(tracker: SharedSessionTracker) -> Self {
        Self { tracker }
    }
}

impl SessionObserver for SessionHandle {
    fn on_session_start(&self, session_id: &str, capabilities: &Value, desired_capabilities: &Value) {
        let mut tracker = lock_or_recover(&self.tracker);
        match tracker.as_mut() {
            Some(tracker) => tracker.start_session(session_id, capabilities, desired_capabilities),
            None => debug!(session_id, "ignoring session start outside an active run"),
        }
    }

    fn on_session_end(&self, session_id: &str) {
        let mut tracker = lock_or_recover(&self.tracker);
        if let Some(tracker) = tracker.as_mut() {
            tracker.finish_session(session_id);
        }
    }
}

/// Driver start parameters adjusted by launcher settings.
#[derive(Debug, Clone, PartialEq)]
pub struct LauncherOverrides {
    pub hub_url: Option<String>,
    pub capabilities: Option<Map<String, Value>>,
}

impl LauncherOverrides {
    pub fn from_settings(settings: Option<&LauncherSettings>) -> Self {
        Self {
            hub_url: settings.and_then(|launcher| launcher.hub_url.clone()),
            capabilities: settings.and_then(LauncherSettings::desired_capabilities),
        }
    }

    /// Returns the executor url the driver should connect to.
    pub fn command_executor(&self, requested: &str) -> String {
        self.hub_url
            .clone()
            .unwrap_or_else(|| requested.to_string())
    }

    /// Launcher capabilities override keys already present in `desired`.
    pub fn apply_capabilities(&self, desired: &mut Value) {
        let Some(overrides) = &self.capabilities else {
            return;
        };
        if !desired.is_object() {
            *desired = Value::Object(Map::new());
        }
        if let Value::Object(target) = desired {
            for (key, value) in overrides {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use httpmock::prelude::*;
    use serde_json::json;
    use zbr_api::{ApiClient, ApiConfig};

    use super::{LauncherOverrides, SessionHandle, SessionObserver, SessionTracker};
    use crate::settings::LauncherSettings;

    fn client(base_url: &str) -> Arc<ApiClient> {
        Arc::new(ApiClient::new(ApiConfig::new(base_url, "token")).expect("client"))
    }

    #[test]
    fn functional_session_is_seeded_with_active_tests_and_keeps_history() {
        let server = MockServer::start();
        let start = server.mock(|when, then| {
            when.method(POST)
                .path("/api/reporting/v1/test-runs/1/test-sessions")
                .body_includes(r#""sessionId":"local-1""#)
                .body_includes(r#""testIds":[10,11]"#);
            then.status(200).json_body(json!({"id": "remote-1"}));
        });
        let finish = server.mock(|when, then| {
            when.method(PUT)
                .path("/api/reporting/v1/test-runs/1/test-sessions/remote-1")
                .body_includes(r#""testIds":[10,11,12]"#);
            then.status(200);
        });

        let mut tracker = SessionTracker::new(client(&server.base_url()), 1);
        tracker.add_test(10);
        tracker.add_test(11);
        tracker.start_session("local-1", &json!({}), &json!({}));
        tracker.remove_test(10);
        tracker.add_test(12);
        assert_eq!(tracker.active_tests(), &[11, 12]);

        let session = tracker.session("local-1").expect("session");
        assert_eq!(session.remote_id.as_deref(), Some("remote-1"));
        assert!(session.test_ids.contains(&10));

        tracker.finish_session("local-1");
        start.assert_calls(1);
        finish.assert_calls(1);
        assert_eq!(tracker.open_sessions(), 0);
    }

    #[test]
    fn regression_session_without_remote_id_is_never_finished_remotely() {
        let server = MockServer::start();
        let start = server.mock(|when, then| {
            when.method(POST)
                .path("/api/reporting/v1/test-runs/1/test-sessions");
            then.status(503);
        });
        let finish = server.mock(|when, then| {
            when.method(PUT);
            then.status(200);
        });

        let mut tracker = SessionTracker::new(client(&server.base_url()), 1);
        tracker.start_session("local-1", &json!({}), &json!({}));
        assert!(tracker.session("local-1").expect("tracked").remote_id.is_none());
        tracker.finish_all();

        start.assert_calls(1);
        finish.assert_calls(0);
        assert_eq!(tracker.open_sessions(), 0);
    }

    #[test]
    fn regression_session_tests_keep_first_seen_order() {
        let server = MockServer::start();
        let start = server.mock(|when, then| {
            when.method(POST)
                .path("/api/reporting/v1/test-runs/1/test-sessions")
                .body_includes(r#""testIds":[12,5]"#);
            then.status(200).json_body(json!({"id": "remote-1"}));
        });
        let finish = server.mock(|when, then| {
            when.method(PUT)
                .path("/api/reporting/v1/test-runs/1/test-sessions/remote-1")
                .body_includes(r#""testIds":[12,5,7]"#);
            then.status(200);
        });

        let mut tracker = SessionTracker::new(client(&server.base_url()), 1);
        tracker.add_test(12);
        tracker.add_test(5);
        tracker.start_session("local-1", &json!({}), &json!({}));
        tracker.add_test(7);
        tracker.add_test(5);
        assert_eq!(
            tracker.session("local-1").expect("session").test_ids,
            vec![12, 5, 7]
        );

        tracker.finish_session("local-1");
        start.assert_calls(1);
        finish.assert_calls(1);
    }

    #[test]
    fn unit_removing_unknown_test_is_tolerated() {
        let mut tracker = SessionTracker::new(client("http://127.0.0.1:9"), 1);
        tracker.remove_test(99);
        tracker.add_test(1);
        tracker.add_test(1);
        assert_eq!(tracker.active_tests(), &[1]);
    }

    #[test]
    fn functional_finish_all_closes_every_acknowledged_session() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST)
                .path("/api/reporting/v1/test-runs/1/test-sessions");
            then.status(200).json_body(json!({"id": 77}));
        });
        let finish = server.mock(|when, then| {
            when.method(PUT)
                .path("/api/reporting/v1/test-runs/1/test-sessions/77");
            then.status(200);
        });

        let mut tracker = SessionTracker::new(client(&server.base_url()), 1);
        tracker.start_session("a", &json!({}), &json!({}));
        tracker.start_session("b", &json!({}), &json!({}));
        tracker.finish_all();

        finish.assert_calls(2);
        assert_eq!(tracker.open_sessions(), 0);
    }

    #[test]
    fn unit_handle_ignores_sessions_before_run_starts() {
        let handle = SessionHandle::new(Arc::new(Mutex::new(None)));
        handle.on_session_start("early", &json!({}), &json!({}));
        handle.on_session_end("early");
    }

    #[test]
    fn unit_launcher_overrides_replace_hub_and_merge_capabilities() {
        let launcher = LauncherSettings {
            capabilities: Some(r#"{"browserName":"firefox","enableVNC":true}"#.to_string()),
            hub_url: Some("http://hub:4444/wd/hub".to_string()),
        };
        let overrides = LauncherOverrides::from_settings(Some(&launcher));
        assert_eq!(
            overrides.command_executor("http://localhost:4444"),
            "http://hub:4444/wd/hub"
        );

        let mut desired = json!({"browserName": "chrome", "platformName": "linux"});
        overrides.apply_capabilities(&mut desired);
        assert_eq!(
            desired,
            json!({"browserName": "firefox", "platformName": "linux", "enableVNC": true})
        );

        let untouched = LauncherOverrides::from_settings(None);
        assert_eq!(untouched.command_executor("http://local"), "http://local");
    }
}
