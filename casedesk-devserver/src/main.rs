//! `casedesk-devserver`: in-memory case desk API for local development.
//!
//! Seeds three demo accounts (`admin@casedesk.test`,
//! `investigator@casedesk.test`, `victim@casedesk.test`; password
//! `<role>-pass`) and serves the auth and chat endpoints under `/api`.
//!
//! ```bash
//! cargo run --bin casedesk-devserver -- --bind 127.0.0.1:8000 --access-ttl-secs 30
//! ```

use std::sync::Arc;

use clap::Parser;
use casedesk_devserver::config::{ServerCliArgs, ServerConfig};
use casedesk_devserver::routes;
use casedesk_devserver::state::DevState;

#[tokio::main]
async fn main() {
    let cli = ServerCliArgs::parse();

    let config = match ServerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter)
        .init();

    tracing::info!(addr = %config.bind_addr, "starting casedesk dev server");

    let state = Arc::new(DevState::new(
        config.access_ttl_secs,
        config.refresh_ttl_secs,
    ));

    match routes::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "dev server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "dev server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start dev server");
            std::process::exit(1);
        }
    }
}
