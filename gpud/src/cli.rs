//! Command line for the gpud daemon
//!
//! Every flag except `--config` and `--once` can also come from a `GPUD_*`
//! environment variable. Flags win over the environment, which wins over
//! the config file.

use std::path::PathBuf;

use clap::builder::BoolishValueParser;
use clap::Parser;

use crate::config::Config;

/// GPUd - GPU node health diagnostics and remediation recommendations
#[derive(Debug, Parser)]
#[command(name = "gpud")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file, defaults are used when it does not exist
    #[arg(short, long, default_value = "/etc/gpud/config.yaml")]
    pub config: PathBuf,

    /// Machine identifier reported in health states
    #[arg(long, env = "GPUD_MACHINE_ID")]
    pub machine_id: Option<String>,

    /// Tracing filter, a level or a full directive such as `gpud=debug`
    #[arg(long, default_value = "info", env = "GPUD_LOG_LEVEL")]
    pub log_level: String,

    /// Emit logs as JSON lines (env accepts 1/0, yes/no, on/off)
    #[arg(long, env = "GPUD_LOG_JSON", value_parser = BoolishValueParser::new())]
    pub log_json: bool,

    /// Check every component once, print the states as JSON and exit
    #[arg(long)]
    pub once: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Layer command line settings over a loaded config
    pub fn apply_to(&self, mut config: Config) -> Config {
        if let Some(id) = self.machine_id.as_ref().filter(|id| !id.is_empty()) {
            config.machine_id = Some(id.clone());
        }
        config
    }
}
