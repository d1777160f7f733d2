//! Conveyor server.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use conveyor_api::{AppState, HookTrigger, routes};
use conveyor_config::Config;
use conveyor_scheduler::JobQueue;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Webhook-triggered CI orchestrator", long_about = None)]
struct Args {
    /// Path to the KDL configuration file
    #[arg(long, env = "CONVEYOR_CONFIG", default_value = "conveyor.kdl")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!(path = %args.config, "loading configuration");
    let config = Arc::new(Config::from_file(&args.config)?);

    // The scheduler loop runs for the process lifetime
    let queue = JobQueue::new(config.queue.max_queued, config.queue.max_running);
    tokio::spawn(queue.clone().process_jobs());

    let state = AppState::new(config.clone(), queue);

    // Webhook triggers are provided by deployments; none ship built in
    let triggers: Vec<Arc<dyn HookTrigger>> = Vec::new();

    let app = routes::router(state, triggers)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let addr: SocketAddr = format!("{}:{}", config.server.address, config.server.port).parse()?;
    info!("starting server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
