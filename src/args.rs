//! ## CLI Arguments Parsing Module
//!
//! Parses the command line and loads the TOML configuration it points at.

use clap::Parser;
use ext_config::{Config, File, FileFormat};
use mining_orchestrator::{
    config::OrchestratorConfig,
    error::{OrchestratorError, OrchestratorResult},
};

use std::path::PathBuf;
use tracing::error;

#[derive(Debug, Parser)]
#[command(author, version, about = "Mining Orchestrator", long_about = None)]
pub struct Args {
    #[arg(
        short = 'c',
        long = "config",
        help = "Path to the TOML configuration file",
        default_value = "orchestrator-config.toml"
    )]
    pub config_path: PathBuf,
    #[arg(
        short = 'f',
        long = "log-file",
        help = "Path to the log file. If not set, logs will only be written to stdout."
    )]
    pub log_file: Option<PathBuf>,
}

/// Process CLI args and load configuration.
pub fn process_cli_args() -> OrchestratorResult<OrchestratorConfig> {
    let args = Args::parse();

    let config_path = args.config_path.to_str().ok_or_else(|| {
        error!("Invalid configuration path.");
        OrchestratorError::BadCliArgs
    })?;

    let settings = Config::builder()
        .add_source(File::new(config_path, FileFormat::Toml))
        .build()?;

    let mut config = settings.try_deserialize::<OrchestratorConfig>()?;
    config.set_log_dir(args.log_file);

    Ok(config)
}
