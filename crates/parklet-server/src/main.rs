//! parklet: HTTP lane server for the parking allocation engine.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use parklet::{ParkingService, ParkletConfig, VersionInfo, serve};

/// Parking slot allocation and ticketing server.
#[derive(Parser, Debug)]
#[command(name = "parklet", version, about)]
struct Cli {
    /// TOML configuration file. Built-in defaults when omitted.
    #[arg(long, env = "PARKLET_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address, overriding the file and PARKLET_HOST.
    #[arg(long)]
    host: Option<String>,

    /// Bind port, overriding the file and PARKLET_PORT.
    #[arg(long)]
    port: Option<u16>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

/// Initialize tracing with PARKLET_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("PARKLET_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("parklet={base_level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<ParkletConfig> {
    let mut config = match &cli.config {
        Some(path) => ParkletConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ParkletConfig::default(),
    };
    config.apply_env()?;
    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = load_config(&cli)?;
    if cli.check {
        tracing::info!(slots = config.slots()?.len(), "Configuration is valid");
        return Ok(());
    }

    let engine = config.build_engine()?;
    let report = engine.recover();
    if !report.is_clean() {
        tracing::warn!(
            released = report.released.len(),
            occupied = report.occupied.len(),
            dangling = report.dangling.len(),
            "Startup reconcile repaired state"
        );
    }

    let mut version = VersionInfo::new();
    if let Some(site) = &config.site {
        version = version.with_site(site.clone());
    }

    let service = Arc::new(ParkingService::new(Arc::new(engine)).with_version(version));
    serve(config.server_config(), service).await
}
