use std::path::PathBuf;

use clap::{ArgAction, Parser};
use zbr_agent::{DEFAULT_FRAMEWORK, DEFAULT_RUN_ID_FILE};

#[derive(Debug, Parser)]
#[command(
    name = "zbr-reporter",
    about = "Report libtest JSON results to a Zebrunner reporting backend",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "ZBR_INPUT",
        help = "libtest JSON output to replay; reads stdin when omitted or '-'"
    )]
    pub input: Option<PathBuf>,

    #[arg(
        long,
        env = "ZBR_SUITE_NAME",
        default_value = "cargo test",
        help = "Root suite name, used as run name when run.display-name is unset"
    )]
    pub suite_name: String,

    #[arg(
        long,
        env = "ZBR_CONFIG_DIR",
        default_value = ".",
        help = "Directory holding agent.yaml or agent.yml"
    )]
    pub config_dir: PathBuf,

    #[arg(
        long,
        env = "ZBR_FRAMEWORK",
        default_value = DEFAULT_FRAMEWORK,
        help = "Framework tag sent with the test run"
    )]
    pub framework: String,

    #[arg(
        long,
        env = "ZBR_COORDINATION_DIR",
        help = "Shared directory used by cooperating workers to report into one run"
    )]
    pub coordination_dir: Option<PathBuf>,

    #[arg(
        long = "attach",
        env = "ZBR_ATTACH",
        value_delimiter = ',',
        action = ArgAction::Append,
        help = "File uploaded as a run artifact before the run finishes; repeatable"
    )]
    pub attachments: Vec<PathBuf>,

    #[arg(
        long,
        env = "ZBR_RUN_ID_FILE",
        default_value = DEFAULT_RUN_ID_FILE,
        help = "File receiving the run id when the root suite ends"
    )]
    pub run_id_file: PathBuf,

    #[arg(
        long,
        default_value_t = false,
        help = "Do not write the run id file"
    )]
    pub no_run_id_file: bool,
}

impl Cli {
    pub fn run_id_file(&self) -> Option<PathBuf> {
        if self.no_run_id_file || self.run_id_file.as_os_str().is_empty() {
            return None;
        }
        Some(self.run_id_file.clone())
    }

    pub fn reads_stdin(&self) -> bool {
        self.input
            .as_deref()
            .map_or(true, |path| path.as_os_str() == "-")
    }
}
