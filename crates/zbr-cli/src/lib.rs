//! Host adapter that reports `cargo test` JSON output through the reporting
//! agent.

mod cli_args;
pub mod libtest_events;
pub mod replay;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use zbr_agent::{load_settings_from, FileCoordinator, LifecycleController, ListenerError};

pub use cli_args::Cli;
pub use libtest_events::{parse_event_line, LibtestEvent};
pub use replay::{replay_libtest, ReplayError, ReplayOptions, ReplaySummary};

pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIGURATION: u8 = 2;
pub const EXIT_RERUN_ABORTED: u8 = 3;

/// Loads settings, connects to the backend and replays the configured input.
pub fn run(cli: &Cli) -> Result<ReplaySummary> {
    let env = std::env::vars().collect::<BTreeMap<_, _>>();
    let settings = load_settings_from(&cli.config_dir, &env).map_err(ListenerError::from)?;
    let controller = LifecycleController::connect(settings)?;
    let mut controller = configure_controller(controller, cli);

    let reader: Box<dyn BufRead> = match cli.input.as_deref().filter(|_| !cli.reads_stdin()) {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("failed to open libtest output {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(io::stdin().lock()),
    };
    run_with(&mut controller, reader, cli)
}

/// Applies framework, coordination and run id file options.
pub fn configure_controller(controller: LifecycleController, cli: &Cli) -> LifecycleController {
    let controller = controller
        .with_framework(&cli.framework)
        .with_run_id_file(cli.run_id_file());
    match &cli.coordination_dir {
        Some(dir) => controller.with_coordinator(Arc::new(FileCoordinator::new(dir))),
        None => controller,
    }
}

/// Replays `reader` through an already connected controller.
pub fn run_with<R: BufRead>(
    controller: &mut LifecycleController,
    reader: R,
    cli: &Cli,
) -> Result<ReplaySummary> {
    let options = ReplayOptions {
        suite_name: cli.suite_name.clone(),
        attachments: cli.attachments.clone(),
    };
    let summary = replay_libtest(controller, reader, &options)?;
    info!(
        passed = summary.passed,
        failed = summary.failed,
        ignored = summary.ignored,
        not_selected = summary.not_selected,
        "libtest results reported"
    );
    Ok(summary)
}

/// Process exit code for a failed [`run`].
pub fn exit_code_for(error: &anyhow::Error) -> u8 {
    let listener_error = error.downcast_ref::<ListenerError>().or_else(|| {
        match error.downcast_ref::<ReplayError>() {
            Some(ReplayError::Listener(inner)) => Some(inner),
            _ => None,
        }
    });
    match listener_error {
        Some(error) if error.is_configuration_error() => EXIT_CONFIGURATION,
        Some(error) if error.is_rerun_abort() => EXIT_RERUN_ABORTED,
        _ => EXIT_FAILURE,
    }
}
