use std::path::PathBuf;
use std::process::ExitCode;

use chatview_bridge::{config, logging};
use clap::Parser;
use tracing::error;

/// Host side of the chat webview protocol, served over stdio.
#[derive(Debug, Parser)]
#[command(name = "chatview-bridge", version)]
struct Args {
    /// Config file (defaults to the per-user config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Conversation storage directory
    #[arg(long)]
    storage: Option<PathBuf>,

    /// tracing filter, e.g. `chatview_bridge=debug`
    #[arg(long)]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config_path = args.config.unwrap_or_else(config::default_config_path);
    let mut cfg = match config::load_config(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("chatview-bridge: {}", e);
            return ExitCode::FAILURE;
        }
    };
    cfg.apply_env_overrides();
    if let Some(storage) = args.storage {
        cfg.storage_path = Some(storage);
    }
    if let Some(filter) = args.log_filter {
        cfg.log_filter = Some(filter);
    }

    logging::init_logging(cfg.log_filter.as_deref());

    match chatview_bridge::run_stdio(cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "bridge stopped");
            ExitCode::FAILURE
        }
    }
}
