use std::sync::Arc;

use clap::Parser;
use ember::{
    cli::EmberArgs,
    config::EmberConfig,
    management::VmManager,
    runtime,
    server::{self, ServerState},
    EmberResult,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const DEFAULT_LOG_FILTER: &str = "ember=info";

const VERBOSE_LOG_FILTER: &str = "ember=debug";

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> EmberResult<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let args = EmberArgs::parse();

    let filter = if args.verbose {
        EnvFilter::new(VERBOSE_LOG_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    fmt()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .with_env_filter(filter)
        .init();

    let config = EmberConfig::locate(args.config.as_deref()).await?;
    tracing::debug!(?config, "resolved config");

    let manager = Arc::new(VmManager::with_host(config)?);
    let done = CancellationToken::new();
    let signals = runtime::install(manager.clone(), done.clone())?;

    let state = ServerState::new(manager, done.clone());
    server::serve(args.addr(), state, done).await?;

    signals.abort();
    Ok(())
}
