//! Reference Near Share receiver.
//!
//! Accepts TCP connections as a development stand-in for the RFCOMM socket
//! the production deployment supplies, and runs one receive loop per
//! connection.

mod config;
mod handler;
mod progress;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rand::RngCore;
use tokio::net::TcpListener;

use nearshare_core::{serve_connection, LocalIdentity, RemoteDevice, SessionHost};

use config::Config;
use handler::ConsoleHandler;

/// Near Share receiver
#[derive(Parser)]
#[command(name = "nearshare")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output (implies --verbose)
    #[arg(short, long)]
    debug: bool,

    /// Configuration file path
    #[arg(short, long, default_value = "nearshare.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Receive files and links from peers
    Receive {
        /// Output directory for received files
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Listen address (overrides the configuration file)
        #[arg(short, long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let config = Config::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Receive { output, bind } => {
            let bind = bind.unwrap_or_else(|| config.network.listen_addr.clone());
            receive(output, bind, &config).await?;
        }
    }

    Ok(())
}

/// Resolve the local identity from configuration, generating an ephemeral
/// certificate when none is configured.
fn local_identity(config: &Config) -> anyhow::Result<LocalIdentity> {
    let device_name = config
        .device
        .name
        .clone()
        .unwrap_or_else(|| "nearshare-receiver".to_string());

    let certificate = match &config.device.certificate_file {
        Some(path) => std::fs::read(path)?,
        None => {
            let mut certificate = vec![0u8; 64];
            rand::rngs::OsRng.fill_bytes(&mut certificate);
            tracing::info!(
                fingerprint = %hex::encode(&certificate[..8]),
                "generated ephemeral device certificate"
            );
            certificate
        }
    };

    Ok(LocalIdentity {
        device_name,
        certificate,
    })
}

async fn receive(output: PathBuf, bind: String, config: &Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&output)?;

    let identity = local_identity(config)?;
    let handler = Arc::new(ConsoleHandler::new(output));
    let host = SessionHost::new(identity, handler);

    let listener = TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "listening for peers");

    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::info!(%peer, "peer connected");

        let host = host.clone();
        tokio::spawn(async move {
            let device = RemoteDevice {
                name: peer.ip().to_string(),
                address: peer.to_string(),
            };
            let (reader, writer) = stream.into_split();
            if let Err(err) = serve_connection(host, reader, writer, device).await {
                tracing::warn!(%peer, %err, "connection ended with error");
            } else {
                tracing::info!(%peer, "connection closed");
            }
        });
    }
}
