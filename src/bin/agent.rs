use clap::Parser;
use dotenv::dotenv;
use sentinel::agent::config::AgentConfig;
use sentinel::agent::SentinelAgent;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Sentinel validator monitoring agent")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    sentinel::logging::init("agent.log");
    dotenv().ok();

    let config = match AgentConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load agent configuration: {}", e);
            return Err(e.into());
        }
    };

    let mut agent = SentinelAgent::new(config);
    agent.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received.");
    agent.shutdown().await;

    Ok(())
}
