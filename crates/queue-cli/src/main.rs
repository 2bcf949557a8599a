use clap::Parser;
use queue_cli::Cli;
use queue_core::StaticResolver;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let resolver = Arc::new(StaticResolver::new());

    if let Err(err) = queue_cli::run(cli, resolver).await {
        tracing::error!(error = %err, "command failed");
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
