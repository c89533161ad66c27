//! KV benchmark
//!
//! Sweeps value sizes over powers of two, timing `set` and `get` for each size,
//! then measures concurrent read throughput with a pool of clients.
//!
//! Run with: cargo run --bin kv-bench -- --help

use anyhow::{bail, Result};
use clap::Parser;
use kv_bulk::client::{ClientConfig, KvClient};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::task::JoinSet;

#[derive(Parser, Debug, Clone)]
#[command(name = "kv-bench")]
#[command(about = "KV set/get benchmark")]
struct Args {
    /// Server address (transport://host:port)
    #[arg(long, default_value = "tcp://127.0.0.1:1234")]
    server_addr: String,

    /// Store name written into the CSV rows
    #[arg(long, default_value = "kv")]
    store: String,

    /// Smallest value size, as a power of two
    #[arg(long, default_value = "10")]
    min_exp: u32,

    /// Largest value size (exclusive), as a power of two
    #[arg(long, default_value = "24")]
    max_exp: u32,

    /// CSV output file; rows are printed when omitted
    #[arg(long)]
    logfile: Option<String>,

    /// Number of keys for the read throughput phase
    #[arg(long, default_value = "1000")]
    num_keys: usize,

    /// Value size in bytes for the read throughput phase (supports KB, MB suffixes)
    #[arg(long, default_value = "64KB")]
    value_size: String,

    /// Number of concurrent workers (tokio tasks, not OS threads)
    #[arg(long, default_value = "16")]
    num_workers: usize,

    /// Number of client connections shared by the workers
    #[arg(long, default_value = "4")]
    num_clients: usize,

    /// Number of times each worker repeats reading its assigned keys
    #[arg(long, default_value = "10")]
    repeat_reads: usize,

    /// Reply timeout in milliseconds
    #[arg(long, default_value = "30000")]
    timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Parse value size string like "16KB", "1MB", etc.
fn parse_size(s: &str) -> Result<usize> {
    let s = s.trim().to_uppercase();

    if let Some(stripped) = s.strip_suffix("KB") {
        Ok(stripped.parse::<usize>()? * 1024)
    } else if let Some(stripped) = s.strip_suffix("MB") {
        Ok(stripped.parse::<usize>()? * 1024 * 1024)
    } else if let Some(stripped) = s.strip_suffix('B') {
        Ok(stripped.parse::<usize>()?)
    } else {
        Ok(s.parse::<usize>()?)
    }
}

/// Format size in human-readable form
fn format_size(bytes: usize) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

/// Format throughput in human-readable form
fn format_throughput(bytes_per_sec: f64) -> String {
    if bytes_per_sec >= 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} GB/s", bytes_per_sec / (1024.0 * 1024.0 * 1024.0))
    } else if bytes_per_sec >= 1024.0 * 1024.0 {
        format!("{:.2} MB/s", bytes_per_sec / (1024.0 * 1024.0))
    } else if bytes_per_sec >= 1024.0 {
        format!("{:.2} KB/s", bytes_per_sec / 1024.0)
    } else {
        format!("{:.2} B/s", bytes_per_sec)
    }
}

fn now_ns() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// CSV rows `store,function,size,start,end,duration`
struct BenchLog {
    store: String,
    out: Option<BufWriter<File>>,
}

impl BenchLog {
    fn open(store: &str, path: Option<&str>) -> Result<Self> {
        let out = match path {
            Some(path) => {
                let mut out = BufWriter::new(File::create(path)?);
                writeln!(out, "store,function,size,start,end,duration")?;
                Some(out)
            }
            None => None,
        };
        Ok(Self {
            store: store.to_string(),
            out,
        })
    }

    fn record(&mut self, function: &str, size: usize, start: u128, end: u128) -> Result<()> {
        let duration = end.saturating_sub(start) as f64 * 1e-9;
        match &mut self.out {
            Some(out) => writeln!(
                out,
                "{},{},{},{},{},{}",
                self.store, function, size, start, end, duration
            )?,
            None => println!(
                "store={}, function={}, size={}, start={}, end={}, duration={:.6}",
                self.store, function, size, start, end, duration
            ),
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(out) = &mut self.out {
            out.flush()?;
        }
        Ok(())
    }
}

/// Create and connect a client
async fn create_client(args: &Args) -> Result<KvClient> {
    let config = ClientConfig {
        timeout_ms: args.timeout_ms,
        ..Default::default()
    };
    let client = KvClient::new(config);
    client.connect(&args.server_addr).await?;
    Ok(client)
}

/// Size sweep: one set and one get per power-of-two size
async fn sweep_phase(args: &Args, client: &KvClient, log: &mut BenchLog) -> Result<()> {
    println!("\n=== Size Sweep ===");

    for exp in args.min_exp..args.max_exp {
        let size = 1usize << exp;
        let key = format!("sweep_{}", size);
        let value = vec![b'a'; size];

        let set_start = now_ns();
        client.set(&key, &value).await?;
        let set_end = now_ns();
        log.record("set", size, set_start, set_end)?;

        let get_start = now_ns();
        let read = client.get(&key, size).await?;
        let get_end = now_ns();
        log.record("get", size, get_start, get_end)?;

        if read.len() != size {
            bail!("get of {} returned {} bytes", key, read.len());
        }
        println!(
            "{:>10}: set {:>8.3} ms, get {:>8.3} ms",
            format_size(size),
            set_end.saturating_sub(set_start) as f64 / 1e6,
            get_end.saturating_sub(get_start) as f64 / 1e6
        );
    }

    Ok(())
}

/// Write phase: single client writes all keys
async fn write_phase(args: &Args, client: &KvClient, value_size: usize, keys: &[String]) -> Result<Duration> {
    println!("\n=== Write Phase ===");
    println!("Writing {} keys with {} values...", keys.len(), format_size(value_size));

    let value: Vec<u8> = (0..value_size).map(|i| (i % 256) as u8).collect();
    let start = Instant::now();

    for (i, key) in keys.iter().enumerate() {
        client.set(key, &value).await?;
        if (i + 1) % 100 == 0 {
            print!("\rWrote {}/{} keys...", i + 1, args.num_keys);
            std::io::stdout().flush()?;
        }
    }

    let duration = start.elapsed();
    println!("\rWrote {}/{} keys.", args.num_keys, args.num_keys);
    println!(
        "Write throughput: {:.0} ops/sec, {}",
        keys.len() as f64 / duration.as_secs_f64(),
        format_throughput((keys.len() * value_size) as f64 / duration.as_secs_f64())
    );
    Ok(duration)
}

/// Read phase: multiple workers read all keys using a pool of clients
async fn read_phase(
    args: &Args,
    value_size: usize,
    keys: &[String],
    clients: &[Arc<KvClient>],
) -> Result<Duration> {
    println!("\n=== Read Phase ===");
    println!(
        "Reading {} keys {} times each with {} workers using {} clients...",
        args.num_keys,
        args.repeat_reads,
        args.num_workers,
        clients.len()
    );

    let keys = Arc::new(keys.to_vec());
    let mut tasks = JoinSet::new();
    let start = Instant::now();

    for worker_id in 0..args.num_workers {
        let client = Arc::clone(&clients[worker_id % clients.len()]);
        let keys = Arc::clone(&keys);
        let num_workers = args.num_workers;
        let repeat_reads = args.repeat_reads;

        tasks.spawn(async move {
            // Each worker reads a contiguous slice of the keys
            let per_worker = keys.len() / num_workers;
            let start_idx = worker_id * per_worker;
            let end_idx = if worker_id == num_workers - 1 {
                keys.len()
            } else {
                start_idx + per_worker
            };

            let mut ops: u64 = 0;
            let mut errors: u64 = 0;
            for _ in 0..repeat_reads {
                for key in &keys[start_idx..end_idx] {
                    match client.get(key, value_size).await {
                        Ok(value) if value.len() == value_size => ops += 1,
                        Ok(value) => {
                            tracing::warn!(
                                "Worker {}: expected {} bytes, got {}",
                                worker_id,
                                value_size,
                                value.len()
                            );
                            errors += 1;
                        }
                        Err(e) => {
                            tracing::error!("Worker {}: GET error: {}", worker_id, e);
                            errors += 1;
                        }
                    }
                }
            }
            (ops, errors)
        });
    }

    let mut total_ops: u64 = 0;
    let mut total_errors: u64 = 0;
    while let Some(result) = tasks.join_next().await {
        let (ops, errors) = result?;
        total_ops += ops;
        total_errors += errors;
    }

    let duration = start.elapsed();
    println!(
        "Read completed: {} operations in {:.2}s",
        total_ops,
        duration.as_secs_f64()
    );
    println!(
        "Read throughput: {:.0} ops/sec, {}",
        total_ops as f64 / duration.as_secs_f64(),
        format_throughput((total_ops * value_size as u64) as f64 / duration.as_secs_f64())
    );
    if total_errors > 0 {
        println!("Errors: {}", total_errors);
    }

    Ok(duration)
}

/// Measure individual GET latencies
async fn latency_analysis(client: &KvClient, value_size: usize, keys: &[String], num_samples: usize) -> Result<()> {
    println!("\n=== Latency Analysis ===");
    println!("Measuring latency for {} GET operations...", num_samples);

    let mut latencies = Vec::with_capacity(num_samples);
    for i in 0..num_samples {
        let key = &keys[i % keys.len()];
        let start = Instant::now();
        client.get(key, value_size).await?;
        latencies.push(start.elapsed());
    }
    if latencies.is_empty() {
        return Ok(());
    }

    latencies.sort();
    let percentile = |p: usize| latencies[(latencies.len() * p / 100).min(latencies.len() - 1)];
    let avg = latencies.iter().sum::<Duration>() / latencies.len() as u32;

    println!("Latency statistics (microseconds):");
    println!("  Min:    {:8}", latencies[0].as_micros());
    println!("  Median: {:8}", percentile(50).as_micros());
    println!("  Avg:    {:8}", avg.as_micros());
    println!("  P95:    {:8}", percentile(95).as_micros());
    println!("  P99:    {:8}", percentile(99).as_micros());
    println!("  Max:    {:8}", latencies[latencies.len() - 1].as_micros());

    Ok(())
}

#[tokio::main(worker_threads = 4)]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let value_size = parse_size(&args.value_size)?;
    if args.num_workers == 0 || args.num_clients == 0 {
        bail!("--num-workers and --num-clients must be at least 1");
    }

    println!("==============================================");
    println!("KV Benchmark");
    println!("==============================================");
    println!("Server:             {}", args.server_addr);
    println!("Sweep:              2^{} .. 2^{} bytes", args.min_exp, args.max_exp);
    println!("Keys:               {}", args.num_keys);
    println!("Value size:         {}", format_size(value_size));
    println!("Repeat reads:       {}", args.repeat_reads);
    println!("Concurrent workers: {}", args.num_workers);
    println!("Clients:            {}", args.num_clients);
    println!("==============================================");

    let mut log = BenchLog::open(&args.store, args.logfile.as_deref())?;

    let start = now_ns();
    let client = create_client(&args).await?;
    log.record("connect", 0, start, now_ns())?;

    // Phase 1: size sweep
    sweep_phase(&args, &client, &mut log).await?;
    log.finish()?;

    if args.num_keys == 0 {
        client.disconnect()?;
        return Ok(());
    }

    // Phase 2: write the read-phase keys
    let keys: Vec<String> = (0..args.num_keys)
        .map(|i| format!("bench_key_{:08}", i))
        .collect();
    let write_duration = write_phase(&args, &client, value_size, &keys).await?;

    // Phase 3: client pool
    let mut clients: Vec<Arc<KvClient>> = Vec::with_capacity(args.num_clients);
    for _ in 0..args.num_clients {
        clients.push(Arc::new(create_client(&args).await?));
    }

    // Phase 4: concurrent reads
    let read_duration = read_phase(&args, value_size, &keys, &clients).await?;

    // Phase 5: latency
    latency_analysis(&client, value_size, &keys, 100.min(args.num_keys)).await?;

    let total_reads = (args.num_keys * args.repeat_reads) as f64;
    println!("\n=== Summary ===");
    println!(
        "Write:  {:.2}s, {:.0} ops/sec",
        write_duration.as_secs_f64(),
        args.num_keys as f64 / write_duration.as_secs_f64()
    );
    println!(
        "Read:   {:.2}s, {:.0} ops/sec ({} workers)",
        read_duration.as_secs_f64(),
        total_reads / read_duration.as_secs_f64(),
        args.num_workers
    );
    println!(
        "Read throughput: {}",
        format_throughput(total_reads * value_size as f64 / read_duration.as_secs_f64())
    );

    for c in &clients {
        c.disconnect()?;
    }
    client.disconnect()?;
    Ok(())
}
