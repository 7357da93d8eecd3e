//! `codex-lb` binary entry point.

use clap::Parser;
use codex_lb::cli::{self, Cli};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "codex_lb=info,tower_http=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if let Err(err) = cli::run(cli).await {
        tracing::error!(%err, "startup failed");
        std::process::exit(err.exit_code());
    }
}
