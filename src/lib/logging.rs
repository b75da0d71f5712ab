use std::{
    fs::OpenOptions,
    io,
    path::Path,
    str::FromStr,
    sync::Mutex,
};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

use crate::error::{OrchestratorError, OrchestratorResult};

/// Initialize logging to stdout and optionally to a file.
///
/// If `log_file` is Some, logs are written to both stdout and the file, which is opened
/// in append mode. The level comes from `RUST_LOG` and defaults to "info".
pub fn init_logging(log_file: Option<&Path>) -> OrchestratorResult<()> {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let log_level_filter = LevelFilter::from_str(&rust_log).unwrap_or(LevelFilter::INFO);
    let env_filter = EnvFilter::new(log_level_filter.to_string());

    let stdout_layer = fmt::layer().with_writer(io::stdout);
    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let file_layer = fmt::layer().with_ansi(false).with_writer(Mutex::new(file));
            Box::new(
                Registry::default()
                    .with(env_filter)
                    .with(stdout_layer)
                    .with(file_layer),
            )
        }
        None => Box::new(Registry::default().with(env_filter).with(stdout_layer)),
    };

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| OrchestratorError::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwritable_log_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("orchestrator.log");
        assert!(matches!(
            init_logging(Some(&path)),
            Err(OrchestratorError::Io(_))
        ));
    }
}
