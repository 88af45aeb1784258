use clap::Parser;
use dotenv::dotenv;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{error, info};

use sentinel::collector::aggregator::{ConsensusAggregator, PgReportStore};
use sentinel::collector::broadcaster::EventBroadcaster;
use sentinel::collector::config::CollectorConfig;
use sentinel::collector::liveness::LivenessTracker;
use sentinel::notifications::webhook::WebhookDispatcher;
use sentinel::web::{self, AppState};

#[derive(Parser, Debug)]
#[command(author, version, about = "Sentinel collector")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    sentinel::logging::init("collector.log");
    dotenv().ok();

    let config = match CollectorConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load collector configuration: {}", e);
            return Err(e.into());
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    info!("Connected to database.");

    let broadcaster = Arc::new(EventBroadcaster::new(256));
    let dispatcher = Arc::new(WebhookDispatcher::new(pool.clone()));
    let aggregator = Arc::new(ConsensusAggregator::new(
        config.consensus_threshold,
        Arc::new(PgReportStore::new(pool.clone())),
        broadcaster.clone(),
        dispatcher,
    ));
    let liveness = Arc::new(LivenessTracker::new(pool.clone(), broadcaster.clone()));

    let sweep_task = tokio::spawn(aggregator.clone().run_aging_sweep());
    let liveness_task = tokio::spawn(liveness.clone().run());

    let app_state = Arc::new(AppState {
        pool: pool.clone(),
        broadcaster,
        aggregator,
        liveness,
    });
    let app = web::create_router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(address = %config.listen_addr, threshold = config.consensus_threshold, "Collector listening.");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down collector.");
    sweep_task.abort();
    liveness_task.abort();
    pool.close().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal.");
    }
}
