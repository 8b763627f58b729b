use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use hdrhistogram::Histogram;
use log::{info, warn};
use tokio::sync::Mutex;
use tokio::time::sleep;

use nrg::accumulator::Accumulator;
use nrg::config::RaftConfig;
use nrg::group::RaftGroup;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of concurrent clients
    #[arg(short, long, default_value = "1")]
    concurrency: usize,

    /// Pause between two proposals of one client, in ms
    #[arg(short, long, default_value = "0")]
    interval: u64,

    /// Duration of the benchmark in seconds
    #[arg(short, long, default_value = "30")]
    duration: u64,

    /// Number of group members
    #[arg(short, long, default_value = "3")]
    nodes: usize,

    /// fsync every log write
    #[arg(long)]
    sync: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .try_init()
        .unwrap_or_default();
    let args = Args::parse();

    let dir = tempfile::tempdir()?;
    let config = RaftConfig {
        sync_writes: args.sync,
        ..Default::default()
    };
    let group = Arc::new(RaftGroup::create(
        "BENCH",
        args.nodes,
        dir.path(),
        config,
        |_| Accumulator::new(),
    )?);
    let leader = group.wait_on_leader(Duration::from_secs(10)).await?;

    let histogram = Arc::new(Mutex::new(Histogram::<u64>::new(3)?));
    let total_requests = Arc::new(Mutex::new(0u64));

    println!(
        "Starting benchmark against {} members (leader {}) with {} concurrent clients, interval: {}ms",
        args.nodes,
        leader.id(),
        args.concurrency,
        args.interval
    );

    // Spawn client tasks
    let mut handles = vec![];
    for _ in 0..args.concurrency {
        let group = group.clone();
        let histogram = histogram.clone();
        let total_requests = total_requests.clone();
        let interval = args.interval;

        let handle = tokio::spawn(async move {
            loop {
                let start = Instant::now();
                let delta = rand::random::<i8>() as i64;
                match group.propose(Accumulator::encode_delta(delta)).await {
                    Ok(_) => {
                        let duration = start.elapsed();
                        let mut hist = histogram.lock().await;
                        if let Err(e) = hist.record(duration.as_micros() as u64) {
                            warn!("failed to record latency: {}", e);
                        }
                        let mut total = total_requests.lock().await;
                        *total += 1;
                    }
                    Err(e) => warn!("proposal failed: {}", e),
                }

                if interval > 0 {
                    sleep(Duration::from_millis(interval)).await;
                }
            }
        });

        handles.push(handle);
    }

    // Run for specified duration
    sleep(Duration::from_secs(args.duration)).await;

    // Cancel all tasks
    info!("stopping {} clients", handles.len());
    for handle in handles {
        handle.abort();
        let _ = handle.await;
    }

    // Print statistics
    let total = *total_requests.lock().await;
    let hist = histogram.lock().await;

    println!("\nBenchmark Results:");
    println!("Total Proposals: {}", total);
    println!("Average TPS: {:.2}", total as f64 / args.duration as f64);
    println!("\nLatency Distribution (microseconds):");
    println!("p50: {}", hist.value_at_percentile(50.0));
    println!("p90: {}", hist.value_at_percentile(90.0));
    println!("p95: {}", hist.value_at_percentile(95.0));
    println!("p99: {}", hist.value_at_percentile(99.0));
    println!("p99.9: {}", hist.value_at_percentile(99.9));

    match Arc::try_unwrap(group) {
        Ok(mut group) => group.shutdown().await,
        Err(_) => warn!("group still in use, skipping shutdown"),
    }
    Ok(())
}
