//! filefeed daemon
//!
//! Runs one subscription from a TOML config against a spool transport until
//! interrupted. Exit status: 0 clean, 1 if any error was counted, 2 for a
//! configuration error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use filefeed::config::{Config, DeliveryMode};
use filefeed::delivery::{DeliveryEngine, DeliverySource, EngineSettings};
use filefeed::notify::{Notifier, ReportingNotifier, TracingNotifier};
use filefeed::session::spool::SpoolTransport;
use filefeed::shutdown;

#[derive(Parser)]
#[command(name = "filefeed")]
#[command(about = "Deliver files published to a server group into a local directory")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "filefeed.toml")]
    config: PathBuf,

    /// Delivery mode (overrides config file)
    #[arg(long, env = "FILEFEED_MODE", value_enum)]
    mode: Option<DeliveryMode>,

    /// Server group (overrides config file)
    #[arg(long, env = "FILEFEED_SERVER_GROUP")]
    server_group: Option<String>,

    /// File type (overrides config file)
    #[arg(long, env = "FILEFEED_FILE_TYPE")]
    file_type: Option<String>,

    /// Output directory (overrides config file)
    #[arg(short, long, env = "FILEFEED_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Spool root (overrides config file)
    #[arg(long, env = "FILEFEED_SPOOL_ROOT")]
    spool_root: Option<PathBuf>,

    #[arg(long, env = "FILEFEED_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("filefeed=info".parse()?)
        )
        .init();

    let cli = Cli::parse();
    info!("Config file: {}", cli.config.display());

    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Cannot load configuration");
            return Ok(ExitCode::from(2));
        }
    };

    // Apply CLI overrides
    if let Some(mode) = cli.mode {
        config.subscription.mode = mode;
    }
    if let Some(group) = cli.server_group {
        config.subscription.server_group = group;
    }
    if let Some(file_type) = cli.file_type {
        config.subscription.file_type = Some(file_type);
    }
    if let Some(dir) = cli.output_dir {
        config.subscription.output_dir = dir;
    }
    if let Some(root) = cli.spool_root {
        config.transport.spool_root = root;
    }
    if cli.password.is_some() {
        config.transport.password = cli.password;
    }

    let (trigger, shutdown) = shutdown::channel();

    let tracing_notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);
    let notifier: Arc<dyn Notifier> = if config.report.interval_secs > 0 {
        let reporting = Arc::new(ReportingNotifier::new(tracing_notifier));
        reporting
            .clone()
            .spawn_schedule(Duration::from_secs(config.report.interval_secs), shutdown.clone());
        reporting
    } else {
        tracing_notifier
    };

    let transport = SpoolTransport::new(config.transport.spool_root.clone());
    let settings = EngineSettings::from(&config.transport);
    let subscription = config.subscription.clone();

    let source = match subscription.mode {
        DeliveryMode::Pull => DeliverySource::Pull,
        DeliveryMode::Push => DeliverySource::Push(Box::new(transport.notifications(
            &subscription.server_group,
            subscription.file_type.as_deref().unwrap_or_default(),
            settings.tick,
            subscription.restart,
        ))),
        DeliveryMode::Query => DeliverySource::Query(Box::new(transport.query(
            &subscription.server_group,
            subscription.query_types.clone(),
            settings.tick,
        ))),
    };

    let engine = match DeliveryEngine::new(subscription, Arc::new(transport), notifier, settings) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "Invalid subscription");
            return Ok(ExitCode::from(2));
        }
    };

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                trigger.trigger();
            }
            Err(e) => warn!(error = %e, "Cannot listen for shutdown signal"),
        }
    });

    match engine.run(source, shutdown).await {
        Ok(report) => {
            match serde_json::to_string(&report) {
                Ok(line) => info!(report = %line, "Run complete"),
                Err(e) => warn!(error = %e, "Failed to serialize run report"),
            }
            Ok(if report.errors > 0 { ExitCode::from(1) } else { ExitCode::SUCCESS })
        }
        Err(e) if e.is_configuration() => {
            error!(error = %e, "Configuration error");
            Ok(ExitCode::from(2))
        }
        Err(e) => {
            error!(error = %e, "Subscription failed");
            Ok(ExitCode::from(1))
        }
    }
}
