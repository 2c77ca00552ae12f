//! Main entry point for the Huddle matchmaking service
//!
//! Initializes and runs the matchmaking microservice with logging,
//! health endpoints and graceful shutdown.

use anyhow::{Context, Result};
use clap::Parser;
use huddle::config::{validate_config, AppConfig};
use huddle::service::{AppState, HealthCheck, HealthStatus};
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn};

/// Huddle Matchmaking Service - 2v2/3v3/4v4 voice team queues
#[derive(Parser)]
#[command(
    name = "huddle",
    version,
    about = "Team matchmaking for voice-chat servers",
    long_about = "Huddle queues players for 2v2, 3v3 and 4v4 from a voice lobby, forms teams \
                 within skill brackets, promotes short-handed teams when a late joiner shows up, \
                 and asks the platform bot to create team channels and move members over AMQP."
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Path to configuration file (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Perform health check and exit
    #[arg(long, help = "Perform a health check and exit with status code")]
    health_check: bool,

    /// Log level override
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        help = "Override log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    /// AMQP URL override
    #[arg(long, value_name = "URL", help = "Override AMQP connection URL")]
    amqp_url: Option<String>,

    /// Health port override
    #[arg(long, value_name = "PORT", help = "Override health endpoint port")]
    health_port: Option<u16>,

    /// Metrics port override
    #[arg(long, value_name = "PORT", help = "Serve metrics on a separate port")]
    metrics_port: Option<u16>,

    /// Enable debug mode
    #[arg(short, long, help = "Enable debug mode with verbose logging")]
    debug: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit without starting service")]
    check_config: bool,

    /// Run without a broker
    #[arg(
        long,
        help = "Run without connecting to AMQP; events are recorded in memory"
    )]
    dry_run: bool,
}

/// Initialize structured logging with the configured level
fn init_logging(log_level: &str, debug: bool) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_target(debug)
        .with_thread_ids(true)
        .with_file(debug)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Perform health check and exit with the matching status code
async fn perform_health_check(config: AppConfig) -> Result<()> {
    info!("Performing health check...");

    let app_state = AppState::new(config).await?;
    let core = app_state.core();
    core.set_running(true).await;

    match HealthCheck::check(core).await {
        Ok(health) => {
            println!("Health Check: {}", health.status);
            for check in &health.checks {
                match &check.message {
                    Some(message) => println!("  {}: {} ({})", check.name, check.status, message),
                    None => println!("  {}: {}", check.name, check.status),
                }
            }

            if health.status == HealthStatus::Healthy {
                std::process::exit(0);
            } else {
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("Health check failed: {}", e);
            std::process::exit(1);
        }
    }
}

/// Wait for shutdown signals (SIGINT, SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.context("Failed to listen for Ctrl+C") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received SIGINT (Ctrl+C) signal");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM signal");
        },
    }
    Ok(())
}

/// Display startup banner with service information
fn display_startup_banner(config: &AppConfig, dry_run: bool) {
    let matchmaking = &config.matchmaking;

    info!("Huddle Matchmaking Service v{}", huddle::VERSION);
    info!("   Service: {}", config.service.name);
    info!("   Log level: {}", config.service.log_level);
    info!("   Health port: {}", config.service.health_port);
    if let Some(metrics_port) = config.service.metrics_port {
        info!("   Metrics port: {}", metrics_port);
    }
    if dry_run {
        info!("   AMQP: disabled (dry run)");
    } else {
        info!("   AMQP: {}", config.amqp.url);
    }
    info!(
        "   Promotion wait: {}-{}s",
        matchmaking.promotion_wait_min_seconds, matchmaking.promotion_wait_max_seconds
    );
    info!(
        "   Brackets: low <= {}, mid <= {}",
        matchmaking.low_bracket_max, matchmaking.mid_bracket_max
    );
    info!("   Sweep interval: {}s", matchmaking.sweep_interval_seconds);
}

/// Load configuration and apply CLI overrides
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(config_path) => AppConfig::from_file(config_path)?,
        None => AppConfig::from_env()?,
    };

    if let Some(log_level) = &args.log_level {
        config.service.log_level = log_level.clone();
    }

    if args.debug {
        config.service.log_level = "debug".to_string();
    }

    if let Some(amqp_url) = &args.amqp_url {
        config.amqp.url = amqp_url.clone();
    }

    if let Some(health_port) = args.health_port {
        config.service.health_port = health_port;
    }

    if args.metrics_port.is_some() {
        config.service.metrics_port = args.metrics_port;
    }

    validate_config(&config)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args).unwrap_or_else(|e| {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    });

    if let Err(e) = init_logging(&config.service.log_level, args.debug) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    if args.health_check {
        return perform_health_check(config).await;
    }

    if args.check_config {
        info!("Configuration validation successful");
        display_startup_banner(&config, args.dry_run);
        return Ok(());
    }

    display_startup_banner(&config, args.dry_run);

    info!("Initializing service components...");
    let state = if args.dry_run {
        AppState::dry_run(config)
    } else {
        AppState::new(config).await
    };
    let mut app_state = match state {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to initialize application: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = app_state.start().await {
        error!("Failed to start service: {}", e);
        std::process::exit(1);
    }

    info!("Huddle matchmaking service is running");
    info!("Press Ctrl+C to shutdown gracefully...");

    if let Err(e) = wait_for_shutdown_signal().await {
        warn!("Signal handling failed, shutting down: {}", e);
    }

    info!("Shutdown signal received, beginning graceful shutdown...");
    if let Err(e) = app_state.shutdown().await {
        error!("Graceful shutdown failed: {}", e);
        std::process::exit(1);
    }

    info!("Huddle matchmaking service stopped");
    Ok(())
}
