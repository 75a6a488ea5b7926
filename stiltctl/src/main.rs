use clap::Parser;

use stiltctl::cli::{self, Cli};
use stiltctl::telemetry::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let cli = Cli::parse();
    init_tracing(cli.settings.log_level.as_deref());
    cli::execute(cli).await
}
