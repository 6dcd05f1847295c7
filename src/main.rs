//! R0N Upgrade binary entry point.
//!
//! Loads the service configuration, installs logging and runs an upgrade
//! server on its own TCP listener until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use r0n_upgrade::config::{
    BasicValidator, ConfigError, ConfigLoader, LogFormat, LogOutput, LoggingConfig, ServiceConfig,
    WebSocketValidator,
};
use r0n_upgrade::modules::transport::TlsOptions;
use r0n_upgrade::modules::websocket_upgrade::{UpgradeEvent, UpgradeResult, UpgradeServer};

#[derive(Parser)]
#[command(name = "r0n-upgrade", version)]
#[command(about = "WebSocket upgrade server of the R0N gateway family")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "r0n-upgrade.toml")]
    config: PathBuf,

    /// Listen on this port instead of the configured one
    #[arg(short, long)]
    port: Option<u16>,
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.to_string()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let _ = match (logging.format, logging.output) {
        (LogFormat::Json, LogOutput::Stdout) => builder.json().try_init(),
        (LogFormat::Json, LogOutput::Stderr) => {
            builder.json().with_writer(std::io::stderr).try_init()
        },
        (LogFormat::Pretty, LogOutput::Stdout) => builder.pretty().try_init(),
        (LogFormat::Pretty, LogOutput::Stderr) => {
            builder.pretty().with_writer(std::io::stderr).try_init()
        },
        (LogFormat::Compact, LogOutput::Stdout) => builder.compact().try_init(),
        (LogFormat::Compact, LogOutput::Stderr) => {
            builder.compact().with_writer(std::io::stderr).try_init()
        },
    };
}

async fn run(config: ServiceConfig) -> UpgradeResult<()> {
    let mut builder = UpgradeServer::builder(config.websocket.clone());
    if let Some(tls) = &config.tls {
        builder = builder.tls(TlsOptions::server_from_pem(&tls.cert_path, &tls.key_path)?);
    }
    let (server, mut events) = builder.build()?;
    info!(service = %config.service.name, secure = config.tls.is_some(), "Service started");

    let mut shutting_down = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(UpgradeEvent::Listening(address)) => info!(%address, "Listening"),
                Some(UpgradeEvent::Connection(client)) => info!(
                    client_id = client.id(),
                    url = client.url(),
                    protocol = ?client.protocol(),
                    "Client connected"
                ),
                Some(UpgradeEvent::Error(e)) => warn!(error = %e, "Listener error"),
                Some(UpgradeEvent::Close) | None => break,
            },
            signal = tokio::signal::ctrl_c(), if !shutting_down => {
                if let Err(e) = signal {
                    warn!(error = %e, "Cannot wait for interrupt");
                }
                info!("Shutdown requested");
                shutting_down = true;
                for client in server.clients().unwrap_or_default() {
                    client.close();
                }
                server.close(|result| {
                    if let Err(e) = result {
                        warn!(error = %e, "Close failed");
                    }
                });
            },
        }
    }

    info!("Service stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let loader = ConfigLoader::new()
        .with_validator(BasicValidator::new())
        .with_validator(WebSocketValidator::new());

    let mut config = match loader.read(&cli.config) {
        Ok(config) => config,
        Err(ConfigError::NotFound(_)) => ServiceConfig::default(),
        Err(e) => {
            eprintln!("r0n-upgrade: {e}");
            return ExitCode::FAILURE;
        },
    };
    if let Some(port) = cli.port {
        config.websocket.port = Some(port);
        config.websocket.no_server = false;
    }

    init_logging(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), config = %cli.config.display(), "R0N Upgrade starting");

    if let Err(e) = loader.validate(&config) {
        error!(error = %e, "Invalid configuration");
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Service failed");
            ExitCode::FAILURE
        },
    }
}
