//! KV server binary
//!
//! Run with: cargo run --bin kv-server -- --help

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use kv_bulk::server::{run_server, ServerConfig};
use kv_bulk::storage::BackendConfig;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backend {
    Filesystem,
    Redis,
    Memory,
}

#[derive(Parser, Debug)]
#[command(name = "kv-server")]
#[command(about = "Key/value server with server-driven bulk transfers")]
struct Args {
    /// Load the whole configuration from a JSON file; other flags are ignored
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address (transport://host:port)
    #[arg(long, default_value = "tcp://127.0.0.1:1234")]
    listen_addr: String,

    /// Storage backend
    #[arg(long, value_enum, default_value = "filesystem")]
    backend: Backend,

    /// Root directory of the filesystem backend
    #[arg(long, default_value = "kv-data")]
    root: PathBuf,

    /// Redis host for the redis backend
    #[arg(long, default_value = "127.0.0.1")]
    redis_host: String,

    /// Redis port for the redis backend
    #[arg(long, default_value = "6379")]
    redis_port: u16,

    /// Largest value accepted, in MB
    #[arg(long, default_value = "128")]
    max_value_mb: usize,

    /// Directory to write the peer discovery file into
    #[arg(long)]
    peer_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Number of worker threads for processing requests
    #[arg(long, default_value = "4")]
    worker_threads: usize,
}

fn megabytes(mb: usize) -> Result<usize> {
    mb.checked_mul(1024 * 1024)
        .ok_or_else(|| anyhow!("--max-value-mb {} is too large", mb))
}

fn build_config(args: &Args) -> Result<ServerConfig> {
    if let Some(path) = &args.config {
        let raw = std::fs::read(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        return serde_json::from_slice(&raw)
            .with_context(|| format!("invalid config file {}", path.display()));
    }

    let backend = match args.backend {
        Backend::Filesystem => BackendConfig::Filesystem {
            root: args.root.clone(),
        },
        Backend::Redis => BackendConfig::Redis {
            host: args.redis_host.clone(),
            port: args.redis_port,
        },
        Backend::Memory => BackendConfig::Memory,
    };

    Ok(ServerConfig {
        listen_addr: args.listen_addr.clone(),
        backend,
        max_value_size: megabytes(args.max_value_mb)?,
        peer_dir: args.peer_dir.clone(),
        ..Default::default()
    })
}

async fn run_with_config(args: Args) -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = build_config(&args)?;

    tracing::info!("=== KV Server Configuration ===");
    tracing::info!("Worker threads: {}", args.worker_threads);
    tracing::info!("Listen address: {}", config.listen_addr);
    tracing::info!("Backend: {:?}", config.backend);
    tracing::info!("Max value size: {} MB", config.max_value_size / 1024 / 1024);
    tracing::info!("Chunk size: {} KB", config.transfer.chunk_size / 1024);
    if let Some(dir) = &config.peer_dir {
        tracing::info!("Peer directory: {}", dir.display());
    }
    tracing::info!("===============================");

    run_server(config).await?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let worker_threads = args.worker_threads;

    // Build tokio runtime with specified number of worker threads
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?
        .block_on(run_with_config(args))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_value_mb_overflow_is_an_error() {
        assert_eq!(megabytes(128).unwrap(), 128 * 1024 * 1024);
        assert!(megabytes(usize::MAX).is_err());

        let args = Args::parse_from(["kv-server", "--max-value-mb", &usize::MAX.to_string()]);
        assert!(build_config(&args).is_err());
    }
}
