//! ndt-client - NDT network diagnostic client
//!
//! Runs one NDT session (upload, download and metadata tests) against a
//! server and prints or exports the results.

mod config;
mod control;
mod output;
mod session;
mod testing;
mod transport;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "ndt-client")]
#[command(version)]
#[command(about = "NDT network throughput client", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// NDT server host (overrides server.host)
    #[arg(short, long)]
    server: Option<String>,

    /// Control port (overrides server.control_port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Skip the upload test
    #[arg(long)]
    no_upload: bool,

    /// Skip the download test
    #[arg(long)]
    no_download: bool,

    /// Skip the metadata test
    #[arg(long)]
    no_metadata: bool,

    /// Write results as CSV to this file
    #[arg(long)]
    export: Option<PathBuf>,

    /// Print results as JSON instead of text
    #[arg(long)]
    json: bool,
}

fn load_config(args: &Args) -> Result<config::Config> {
    let mut config = match &args.config {
        Some(path) => config::Config::load(path)?,
        None => config::Config::default(),
    };

    if let Some(host) = &args.server {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.control_port = port;
    }
    if args.no_upload {
        config.tests.upload = false;
    }
    if args.no_download {
        config.tests.download = false;
    }
    if args.no_metadata {
        config.tests.metadata = false;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .init();

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let settings = config.settings();
    let transport = Arc::new(transport::TcpTransport);
    let metadata = Arc::new(testing::SystemMetadata::new(config.client.application.clone()));
    let sink = Box::new(output::ConsoleSink::new(args.json, args.export.clone()));

    let outcome = control::run_session(&settings, transport, metadata, sink).await?;

    match outcome.failure() {
        Some(failure) => {
            error!("Session failed: {}", failure);
            anyhow::bail!("{}", failure)
        }
        None => {
            info!("Session complete");
            Ok(())
        }
    }
}
