//! KV client binary
//!
//! Run with: cargo run --bin kv-client -- --help

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use kv_bulk::client::{discover_peers, ClientConfig, KvClient};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "kv-client")]
#[command(about = "Key/value client with server-driven bulk transfers")]
struct Args {
    /// Server address (transport://host:port)
    #[arg(long)]
    server_addr: Option<String>,

    /// Pick the server from the discovery files in this directory
    #[arg(long)]
    peer_dir: Option<PathBuf>,

    /// Reply timeout in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store a value
    Set {
        key: String,
        value: String,
    },
    /// Fetch a value
    Get {
        key: String,
        /// Receive buffer size; defaults to the stored value's size
        #[arg(long)]
        max_size: Option<usize>,
    },
    /// Check whether a key is stored
    Exists { key: String },
    /// Print the stored size of a value
    Size { key: String },
    /// Run interactive REPL
    Repl,
    /// Run a quick set/get benchmark
    Bench {
        /// Number of operations
        #[arg(long, default_value = "1000")]
        ops: usize,
        /// Value size in bytes
        #[arg(long, default_value = "1024")]
        value_size: usize,
    },
}

fn server_address(args: &Args) -> Result<String> {
    if let Some(addr) = &args.server_addr {
        return Ok(addr.clone());
    }
    if let Some(dir) = &args.peer_dir {
        let peers = discover_peers(dir)?;
        return peers
            .into_iter()
            .next()
            .map(|peer| peer.addr)
            .ok_or_else(|| anyhow!("no peer files in {}", dir.display()));
    }
    Ok("tcp://127.0.0.1:1234".to_string())
}

async fn run_client(args: &Args) -> Result<KvClient> {
    let config = ClientConfig {
        timeout_ms: args.timeout_ms,
        ..Default::default()
    };

    let client = KvClient::new(config);
    client.connect(&server_address(args)?).await?;
    Ok(client)
}

fn print_value(value: &[u8]) {
    match std::str::from_utf8(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!("{:?}", value),
    }
}

async fn cmd_get(client: &KvClient, key: &str, max_size: Option<usize>) -> Result<()> {
    let result = match max_size {
        Some(size) => client.get(key, size).await,
        None => client.fetch(key).await,
    };
    match result {
        Ok(value) => print_value(&value),
        Err(e) => eprintln!("Error: {}", e),
    }
    Ok(())
}

async fn cmd_set(client: &KvClient, key: &str, value: &str) -> Result<()> {
    match client.set(key, value.as_bytes()).await {
        Ok(()) => println!("OK"),
        Err(e) => eprintln!("Error: {}", e),
    }
    Ok(())
}

async fn cmd_exists(client: &KvClient, key: &str) -> Result<()> {
    match client.exists(key).await {
        Ok(true) => println!("Yes"),
        Ok(false) => println!("No"),
        Err(e) => eprintln!("Error: {}", e),
    }
    Ok(())
}

async fn cmd_size(client: &KvClient, key: &str) -> Result<()> {
    match client.value_size(key).await {
        Ok(size) => println!("{}", size),
        Err(e) => eprintln!("Error: {}", e),
    }
    Ok(())
}

async fn cmd_repl(client: &KvClient) -> Result<()> {
    use std::io::{self, BufRead, Write};

    println!("KV REPL - Commands: set <key> <value>, get <key> [max_size], exists <key>, size <key>, stats, quit");
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        match parts[0] {
            "get" => {
                if parts.len() < 2 {
                    println!("Usage: get <key> [max_size]");
                    continue;
                }
                let max_size = match parts.get(2).map(|s| s.parse::<usize>()) {
                    Some(Ok(size)) => Some(size),
                    Some(Err(_)) => {
                        println!("max_size must be a number");
                        continue;
                    }
                    None => None,
                };
                cmd_get(client, parts[1], max_size).await?;
            }
            "set" | "put" => {
                if parts.len() < 3 {
                    println!("Usage: set <key> <value>");
                    continue;
                }
                cmd_set(client, parts[1], &parts[2..].join(" ")).await?;
            }
            "exists" => {
                if parts.len() < 2 {
                    println!("Usage: exists <key>");
                    continue;
                }
                cmd_exists(client, parts[1]).await?;
            }
            "size" => {
                if parts.len() < 2 {
                    println!("Usage: size <key>");
                    continue;
                }
                cmd_size(client, parts[1]).await?;
            }
            "stats" => {
                let stats = client.registry_stats();
                println!(
                    "Registry: live handles={}, used={} KB, capacity={} MB",
                    stats.live_handles,
                    stats.used / 1024,
                    stats.capacity / 1024 / 1024
                );
            }
            "quit" | "exit" | "q" => {
                println!("Bye!");
                break;
            }
            _ => {
                println!("Unknown command: {}", parts[0]);
            }
        }
    }

    Ok(())
}

async fn cmd_bench(client: &KvClient, ops: usize, value_size: usize) -> Result<()> {
    use std::time::Instant;

    let value = vec![b'x'; value_size];

    println!("Running benchmark: {} ops, {} byte values", ops, value_size);

    // SET benchmark
    let start = Instant::now();
    for i in 0..ops {
        let key = format!("bench_key_{}", i);
        client.set(&key, &value).await?;
    }
    let set_duration = start.elapsed();
    println!(
        "SET: {} ops in {:.2}s = {:.0} ops/sec",
        ops,
        set_duration.as_secs_f64(),
        ops as f64 / set_duration.as_secs_f64()
    );

    // GET benchmark
    let start = Instant::now();
    for i in 0..ops {
        let key = format!("bench_key_{}", i);
        let _ = client.get(&key, value_size).await?;
    }
    let get_duration = start.elapsed();
    println!(
        "GET: {} ops in {:.2}s = {:.0} ops/sec",
        ops,
        get_duration.as_secs_f64(),
        ops as f64 / get_duration.as_secs_f64()
    );

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let client = run_client(&args).await?;

    match &args.command {
        Commands::Set { key, value } => cmd_set(&client, key, value).await?,
        Commands::Get { key, max_size } => cmd_get(&client, key, *max_size).await?,
        Commands::Exists { key } => cmd_exists(&client, key).await?,
        Commands::Size { key } => cmd_size(&client, key).await?,
        Commands::Repl => cmd_repl(&client).await?,
        Commands::Bench { ops, value_size } => cmd_bench(&client, *ops, *value_size).await?,
    }

    client.disconnect()?;
    Ok(())
}
