//! nvbridge server - msgpack-rpc daemon on a Unix socket

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{error, info};

use nvbridge_server::RpcServer;
use nvbridge_utils::{ConfigLoader, LogConfig, LogOutput, Result};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Socket path (defaults to the runtime directory)
    #[arg(short, long, env = "NVBRIDGE_SOCKET")]
    socket: Option<PathBuf>,

    /// Config file (defaults to the XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where logs go
    #[arg(long, value_enum, default_value_t = LogTarget::File)]
    log: LogTarget,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogTarget {
    Stderr,
    File,
    Both,
}

impl From<LogTarget> for LogOutput {
    fn from(target: LogTarget) -> Self {
        match target {
            LogTarget::Stderr => LogOutput::Stderr,
            LogTarget::File => LogOutput::File,
            LogTarget::Both => LogOutput::Both,
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ConfigLoader::load_from_path(path)?,
        None => ConfigLoader::load()?,
    };
    if let Some(socket) = args.socket {
        config.socket_path = Some(socket);
    }

    let server = RpcServer::from_config(&config);
    server.start().await?;

    info!(socket = %server.socket_path().display(), "nvbridge server started");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for shutdown signal: {}", e);
    }

    info!("Shutting down");
    server.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut log_config = LogConfig::server();
    log_config.output = args.log.into();
    nvbridge_utils::init_logging_with_config(log_config)?;

    run(args).await
}
