use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use llm_gateway::circuit::clock::SystemClock;
use llm_gateway::config::Config;
use llm_gateway::database::Database;
use llm_gateway::dispatcher::transport::ReqwestTransport;
use llm_gateway::dispatcher::Dispatcher;
use llm_gateway::metrics::{HeuristicEstimator, MetricsEngine};
use llm_gateway::scheduler::Scheduler;
use llm_gateway::url_manager::{UrlManager, UrlManagerConfig};
use llm_gateway::web::WebServer;

#[derive(Parser)]
#[command(name = "llm-gateway")]
#[command(version = "0.1.0")]
#[command(about = "A multi-upstream LLM reverse proxy with dialect translation and failover")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Database URL (overrides config file)
    #[arg(short = 'd', long, value_name = "URL")]
    database_url: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = if cli.log_level == "trace" {
        format!("llm_gateway={},tower_http=trace", cli.log_level)
    } else {
        format!("llm_gateway={}", cli.log_level)
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| log_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting LLM gateway v{}", env!("CARGO_PKG_VERSION"));

    std::env::set_var("CONFIG_FILE", &cli.config);
    let mut config = Config::load()?;
    info!(config_file = %cli.config, "configuration loaded");

    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    if let Some(database_url) = cli.database_url {
        config.database.url = database_url;
    }

    let database = Database::new(&config.database).await?;
    database.migrate().await?;
    info!(url = %config.database.url, "database connection established and migrations applied");

    let clock = Arc::new(SystemClock);

    let metrics = Arc::new(MetricsEngine::new(config.metrics.to_metrics_config(), clock.clone()));
    metrics.spawn_background_workers(database.pool().clone());
    info!("metrics engine started");

    let url_manager = Arc::new(UrlManager::new(
        UrlManagerConfig {
            failure_cooldown: chrono::Duration::seconds(config.dispatcher.url_failure_cooldown_secs),
        },
        clock.clone(),
    ));

    let scheduler = Arc::new(Scheduler::new(
        config.scheduler.strategy(),
        chrono::Duration::seconds(config.scheduler.trace_affinity_ttl_secs),
        clock.clone(),
    ));

    let transport = Arc::new(ReqwestTransport::new());
    let estimator = Arc::new(HeuristicEstimator);

    let dispatcher = Arc::new(Dispatcher::new(
        scheduler,
        url_manager,
        metrics,
        transport,
        estimator,
    ));

    let web_server = WebServer::new(config, dispatcher)?;
    info!(host = %web_server.host(), port = web_server.port(), "starting web server");
    web_server.serve().await?;

    Ok(())
}
