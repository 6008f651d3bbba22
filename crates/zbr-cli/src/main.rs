use std::process::ExitCode;

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use zbr_cli::{exit_code_for, run, Cli};

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(summary) => {
            println!(
                "reported {} passed, {} failed, {} ignored ({} suites)",
                summary.passed, summary.failed, summary.ignored, summary.suites
            );
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("zbr-reporter: {error:#}");
            ExitCode::from(exit_code_for(&error))
        }
    }
}
