//! imgsim-daemon entry point.

use anyhow::Result;
use clap::Parser;
use imgsim_core::DbMode;
use imgsim_daemon::Server;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "imgsim-daemon")]
#[command(about = "imgsim daemon - similarity queries over a TCP command protocol")]
#[command(version)]
struct Args {
    /// Listen address, host:port or just a port.
    listen: String,

    /// Database files to serve, addressed as dbid 0, 1, ...
    files: Vec<PathBuf>,

    /// Mode to open the databases in.
    #[arg(long, default_value = "simple")]
    mode: String,

    /// Allow maintenance commands (quit, rehash, saveas, load, drop).
    #[arg(long)]
    maintenance: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let addr = if args.listen.contains(':') {
        args.listen.clone()
    } else {
        format!("localhost:{}", args.listen)
    };
    let mode = DbMode::from_name(&args.mode)?;

    let server = Server::bind(&addr, &args.files, mode, args.maintenance).await?;
    server.run().await
}
