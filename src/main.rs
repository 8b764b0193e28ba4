use clap::Parser;
use tracing_subscriber::EnvFilter;

use fleetproxy::config::{Cli, Command};
use fleetproxy::error::Result;

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.command.debug());

    match cli.command {
        Command::Proxy(args) => args.build()?.run().await,
        Command::Manager(args) => args.build()?.run().await,
    }
}
