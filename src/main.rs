use mining_orchestrator::{logging::init_logging, MiningOrchestrator};

use crate::args::process_cli_args;

mod args;

#[tokio::main]
async fn main() {
    let config = process_cli_args().unwrap_or_else(|e| {
        eprintln!("Mining orchestrator config error: {e}");
        std::process::exit(1);
    });

    if let Err(e) = init_logging(config.log_dir()) {
        eprintln!("{e}");
        std::process::exit(1);
    }

    let orchestrator = match MiningOrchestrator::new(config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            tracing::error!("Failed to initialize mining orchestrator: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = orchestrator.start().await {
        tracing::error!("Mining orchestrator exited with error: {e}");
        std::process::exit(1);
    }
}
