//! Foreman - block dispatch coordinator
//!
//! Hands out block offsets to remote worker processes over TCP and tracks
//! their completion.

use foreman_core::{run_service, Config, ServiceOutcome};
use std::error::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Parse CLI arguments and build config
    let config = Config::from_cli()?;

    // Initialize logging
    init_logging(&config.log_level);

    tracing::info!("Starting block service...");

    match run_service(&config).await? {
        ServiceOutcome::Exhausted => Ok(()),
        ServiceOutcome::Interrupted => {
            // re-surface the interrupt for the invoking shell
            std::process::exit(130);
        }
    }
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
