//! Replays a libtest JSON stream through a [`RunnerListener`].
//!
//! libtest runs tests in parallel and only reports results, so each test is
//! replayed at its completion event as start, captured output, end.

use std::io::BufRead;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, warn};
use zbr_agent::{LogMessage, RerunPlan, RunnerListener, SuiteInfo, TestInfo, TestOutcome};

use crate::libtest_events::{parse_event_line, LibtestEvent, SuiteStatus, TestEvent, TestStatus};

const ROOT_SUITE_ID: &str = "s1";

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Listener(#[from] zbr_agent::ListenerError),
    #[error("failed to read libtest output: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    pub suite_name: String,
    pub attachments: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub suites: usize,
    pub passed: usize,
    pub failed: usize,
    pub ignored: usize,
    pub not_selected: usize,
    pub malformed_lines: usize,
}

/// Drives the whole stream as one root suite.
pub fn replay_libtest<L, R>(
    listener: &mut L,
    reader: R,
    options: &ReplayOptions,
) -> Result<ReplaySummary, ReplayError>
where
    L: RunnerListener + ?Sized,
    R: BufRead,
{
    let root = SuiteInfo::root(ROOT_SUITE_ID, &options.suite_name);
    listener.on_suite_start(&root)?;
    let rerun_plan = listener.rerun_plan().cloned();

    let mut summary = ReplaySummary::default();
    let mut nested: Option<SuiteInfo> = None;
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let event = match parse_event_line(&line) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(error) => {
                summary.malformed_lines += 1;
                warn!(line = index + 1, "skipping malformed libtest line: {error}");
                continue;
            }
        };
        match event {
            LibtestEvent::Suite(suite) => match suite.event {
                SuiteStatus::Started => {
                    if let Some(open) = nested.take() {
                        listener.on_suite_end(&open)?;
                    }
                    summary.suites += 1;
                    let suite = SuiteInfo::nested(
                        format!("{ROOT_SUITE_ID}-s{}", summary.suites),
                        format!("{} #{}", options.suite_name, summary.suites),
                        ROOT_SUITE_ID,
                    );
                    listener.on_suite_start(&suite)?;
                    nested = Some(suite);
                }
                SuiteStatus::Ok | SuiteStatus::Failed => {
                    if let Some(open) = nested.take() {
                        listener.on_suite_end(&open)?;
                    }
                }
            },
            LibtestEvent::Test(test) => {
                replay_test(listener, &test, rerun_plan.as_ref(), &mut summary)?;
            }
            LibtestEvent::Other => {}
        }
    }

    if let Some(open) = nested.take() {
        listener.on_suite_end(&open)?;
    }
    for path in &options.attachments {
        listener.on_output_file(path)?;
    }
    listener.on_suite_end(&root)?;
    Ok(summary)
}

fn replay_test<L>(
    listener: &mut L,
    event: &TestEvent,
    rerun_plan: Option<&RerunPlan>,
    summary: &mut ReplaySummary,
) -> Result<(), ReplayError>
where
    L: RunnerListener + ?Sized,
{
    let outcome = match event.event {
        TestStatus::Started => return Ok(()),
        TestStatus::Timeout => {
            warn!(test = %event.name, "test has been running for over 60 seconds");
            return Ok(());
        }
        TestStatus::Ok => {
            summary.passed += 1;
            TestOutcome::passed()
        }
        TestStatus::Failed => {
            summary.failed += 1;
            TestOutcome::new("FAIL", event.message.clone())
        }
        TestStatus::Ignored => {
            summary.ignored += 1;
            TestOutcome::new("SKIP", event.message.clone())
        }
    };
    if rerun_plan.is_some_and(|plan| !plan.includes(&event.name)) {
        debug!(test = %event.name, "test not selected by rerun context");
        summary.not_selected += 1;
        return Ok(());
    }

    let test = TestInfo::new(event.short_name(), &event.name);
    listener.on_test_start(&test)?;
    for line in event
        .stdout
        .iter()
        .flat_map(|stdout| stdout.lines())
        .filter(|line| !line.trim().is_empty())
    {
        listener.on_log_message(&LogMessage::new("INFO", line))?;
    }
    listener.on_test_end(&test, &outcome)?;
    Ok(())
}
