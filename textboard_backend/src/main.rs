use anyhow::Result;
use clap::Parser;
use textboard_backend::cli::{self, Command};
use textboard_backend::config::TextboardConfig;
use textboard_backend::node::TextboardNode;
use textboard_backend::telemetry;

#[derive(Parser)]
#[command(author, version, about = "Textboard submission pipeline and moderation CLI")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();

    let args = Args::parse();

    let config = TextboardConfig::from_env()?;
    let node = TextboardNode::start(config).await?;
    let outcome = cli::run(&node, args.command).await;
    node.shutdown().await;
    outcome
}
