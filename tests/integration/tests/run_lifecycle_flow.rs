use std::collections::BTreeMap;
use std::sync::{Arc, Barrier};
use std::thread;

use httpmock::prelude::*;
use serde_json::json;
use tempfile::tempdir;
use zbr_agent::settings::{RunSettings, ServerSettings};
use zbr_agent::{
    AgentError, ApiClient, ApiConfig, Coordinator, FileCoordinator, LifecycleController,
    ListenerError, LocalCoordinator, LogMessage, RunnerListener, Settings, SuiteInfo, TestInfo,
    TestOutcome, RUN_FINISHED_KEY, RUN_ID_KEY, RUNNING_TESTS_KEY,
};

fn settings(server: &MockServer) -> Settings {
    Settings {
        enabled: true,
        project_key: "DEF".to_string(),
        send_logs: true,
        server: ServerSettings {
            hostname: server.base_url(),
            access_token: "token".to_string(),
        },
        run: RunSettings::default(),
        notification: None,
        milestone: None,
        zebrunner: None,
    }
}

fn controller_with(server: &MockServer, settings: Settings) -> LifecycleController {
    let api = ApiClient::new(ApiConfig::new(server.base_url(), "token")).expect("client");
    LifecycleController::new(settings, Arc::new(api))
        .with_run_id_file(None)
        .with_ci_environment(BTreeMap::new())
}

fn controller(server: &MockServer) -> LifecycleController {
    controller_with(server, settings(server))
}

#[test]
fn integration_passing_test_reports_run_test_logs_and_finish() {
    let server = MockServer::start();
    let create_run = server.mock(|when, then| {
        when.method(POST).path("/api/reporting/v1/test-runs");
        then.status(200).json_body(json!({"id": 1}));
    });
    let create_test = server.mock(|when, then| {
        when.method(POST)
            .path("/api/reporting/v1/test-runs/1/tests")
            .json_body_includes(json!({"name": "pays", "className": "shop::checkout"}).to_string());
        then.status(200).json_body(json!({"id": 2}));
    });
    let logs = server.mock(|when, then| {
        when.method(POST)
            .path("/api/reporting/v1/test-runs/1/logs")
            .body_includes(r#""message":"one""#)
            .body_includes(r#""message":"two""#)
            .body_includes(r#""message":"three""#);
        then.status(202);
    });
    let finish_test = server.mock(|when, then| {
        when.method(PUT)
            .path("/api/reporting/v1/test-runs/1/tests/2")
            .json_body_includes(json!({"result": "PASSED"}).to_string());
        then.status(200);
    });
    let finish_run = server.mock(|when, then| {
        when.method(PUT).path("/api/reporting/v1/test-runs/1");
        then.status(200);
    });

    let mut listener = controller(&server);
    let root = SuiteInfo::root("s1", "shop");
    let test = TestInfo::new("pays", "shop::checkout::pays");
    listener.on_suite_start(&root).expect("suite start");
    listener.on_test_start(&test).expect("test start");
    for message in ["one", "two", "three"] {
        listener
            .on_log_message(&LogMessage::new("INFO", message))
            .expect("log");
    }
    listener.on_test_end(&test, &TestOutcome::passed()).expect("test end");
    listener.on_suite_end(&root).expect("suite end");

    create_run.assert_calls(1);
    create_test.assert_calls(1);
    logs.assert_calls(1);
    finish_test.assert_calls(1);
    finish_run.assert_calls(1);
}

#[test]
fn integration_disallowed_rerun_aborts_before_tests_are_created() {
    let server = MockServer::start();
    let exchange = server.mock(|when, then| {
        when.method(POST)
            .path("/api/reporting/v1/run-context-exchanges")
            .json_body(json!({"testRunUuid": "b2f1", "mode": "RERUN"}));
        then.status(200).json_body(json!({
            "testRunUuid": "b2f1",
            "runAllowed": false,
            "reason": "run already passed"
        }));
    });
    let any_create = server.mock(|when, then| {
        when.method(POST).path("/api/reporting/v1/test-runs");
        then.status(200).json_body(json!({"id": 1}));
    });

    let mut configured = settings(&server);
    configured.run.context = Some(r#"{"testRunUuid":"b2f1","mode":"RERUN"}"#.to_string());
    let mut listener = controller_with(&server, configured);
    let error = listener
        .on_suite_start(&SuiteInfo::root("s1", "shop"))
        .expect_err("run must be refused");

    assert!(matches!(error, ListenerError::RunNotAllowed { .. }));
    assert!(error.is_rerun_abort());
    exchange.assert_calls(1);
    any_create.assert_calls(0);
}

#[test]
fn integration_screenshot_outside_a_test_is_a_usage_error_without_http() {
    let server = MockServer::start();
    let create_run = server.mock(|when, then| {
        when.method(POST).path("/api/reporting/v1/test-runs");
        then.status(200).json_body(json!({"id": 1}));
    });
    let screenshots = server.mock(|when, then| {
        when.method(POST).path("/api/reporting/v1/test-runs/1/tests/2/screenshots");
        then.status(201);
    });

    let mut listener = controller(&server);
    listener
        .on_suite_start(&SuiteInfo::root("s1", "shop"))
        .expect("suite start");
    let reporter = listener.reporter().expect("reporter");
    let error = reporter
        .attach_test_screenshot(std::path::Path::new("missing.png"))
        .expect_err("no active test");

    assert_eq!(error, AgentError::NoActiveTest);
    create_run.assert_calls(1);
    screenshots.assert_calls(0);
}

#[test]
fn integration_parallel_workers_share_one_run_through_file_coordination() {
    let server = MockServer::start();
    let create_run = server.mock(|when, then| {
        when.method(POST).path("/api/reporting/v1/test-runs");
        then.status(200).json_body(json!({"id": 31}));
    });
    let finish_run = server.mock(|when, then| {
        when.method(PUT).path("/api/reporting/v1/test-runs/31");
        then.status(200);
    });
    let dir = tempdir().expect("tempdir");
    let workers = 4;
    let barrier = Arc::new(Barrier::new(workers));

    let handles = (0..workers)
        .map(|worker| {
            let barrier = Arc::clone(&barrier);
            let base_url = server.base_url();
            let shared_dir = dir.path().to_path_buf();
            let worker_settings = settings(&server);
            thread::spawn(move || {
                let api = ApiClient::new(ApiConfig::new(base_url, "token")).expect("client");
                let mut listener = LifecycleController::new(worker_settings, Arc::new(api))
                    .with_run_id_file(None)
                    .with_ci_environment(BTreeMap::new())
                    .with_coordinator(Arc::new(FileCoordinator::new(shared_dir)));
                let root = SuiteInfo::root("s1", format!("worker {worker}"));
                barrier.wait();
                listener.on_suite_start(&root).expect("suite start");
                let run_id = listener.run_id();
                barrier.wait();
                listener.on_suite_end(&root).expect("suite end");
                run_id
            })
        })
        .collect::<Vec<_>>();

    let run_ids = handles
        .into_iter()
        .map(|handle| handle.join().expect("worker"))
        .collect::<Vec<_>>();

    assert!(run_ids.iter().all(|run_id| *run_id == Some(31)));
    create_run.assert_calls(1);
    finish_run.assert_calls(1);

    let coordinator = FileCoordinator::new(dir.path());
    assert_eq!(coordinator.get(RUN_ID_KEY).expect("read").as_deref(), Some("31"));
    assert_eq!(
        coordinator.get(RUN_FINISHED_KEY).expect("read").as_deref(),
        Some("true")
    );
}

#[test]
fn integration_shared_run_finishes_once_after_last_running_test() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/reporting/v1/test-runs");
        then.status(200).json_body(json!({"id": 5}));
    });
    server.mock(|when, then| {
        when.method(POST).path("/api/reporting/v1/test-runs/5/tests");
        then.status(200).json_body(json!({"id": 50}));
    });
    server.mock(|when, then| {
        when.method(PUT).path("/api/reporting/v1/test-runs/5/tests/50");
        then.status(200);
    });
    let finish_run = server.mock(|when, then| {
        when.method(PUT).path("/api/reporting/v1/test-runs/5");
        then.status(200);
    });

    let coordinator: Arc<dyn Coordinator> = Arc::new(LocalCoordinator::new());
    let mut first = controller(&server).with_coordinator(Arc::clone(&coordinator));
    let mut second = controller(&server).with_coordinator(Arc::clone(&coordinator));
    let root = SuiteInfo::root("s1", "shop");
    let test = TestInfo::new("slow", "shop::slow");

    first.on_suite_start(&root).expect("first start");
    second.on_suite_start(&root).expect("second start");
    second.on_test_start(&test).expect("test start");
    assert_eq!(coordinator.counter(RUNNING_TESTS_KEY).expect("counter"), 1);

    first.on_suite_end(&root).expect("first end");
    finish_run.assert_calls(0);

    second.on_test_end(&test, &TestOutcome::passed()).expect("test end");
    second.on_suite_end(&root).expect("second end");
    first.on_suite_end(&root).expect("repeated end");
    finish_run.assert_calls(1);
}

#[test]
fn regression_reused_coordination_dir_starts_a_new_run_per_invocation() {
    let server = MockServer::start();
    let create_run = server.mock(|when, then| {
        when.method(POST).path("/api/reporting/v1/test-runs");
        then.status(200).json_body(json!({"id": 7}));
    });
    let finish_run = server.mock(|when, then| {
        when.method(PUT).path("/api/reporting/v1/test-runs/7");
        then.status(200);
    });
    let dir = tempdir().expect("tempdir");

    for invocation in 1..=2 {
        let mut listener = controller(&server)
            .with_coordinator(Arc::new(FileCoordinator::new(dir.path())));
        let root = SuiteInfo::root("s1", format!("nightly #{invocation}"));
        listener.on_suite_start(&root).expect("suite start");
        assert_eq!(listener.run_id(), Some(7));
        listener.on_suite_end(&root).expect("suite end");
    }

    create_run.assert_calls(2);
    finish_run.assert_calls(2);
}
