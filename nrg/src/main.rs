use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use log::{error, info};
use rand::Rng;
use tokio::signal;
use tokio::time::{self, Duration, Instant};

use nrg::accumulator::Accumulator;
use nrg::config::RuntimeConfig;
use nrg::group::RaftGroup;
use nrg::metrics;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Runtime config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Number of group members
    #[arg(short, long)]
    nodes: Option<usize>,

    /// Number of random proposals to run
    #[arg(short, long)]
    proposals: Option<usize>,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Remove the group's data before starting
    #[arg(long)]
    clean: bool,

    /// Print the metrics registry before exiting
    #[arg(long)]
    metrics: bool,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn wait_on_total(
    group: &RaftGroup<Accumulator>,
    expected: i64,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let lagging: Vec<String> = group
            .running()
            .filter_map(|n| {
                let total = group.state(n.id()).map(|s| s.total());
                (total != Some(expected)).then(|| format!("{}={:?}", n.id(), total))
            })
            .collect();
        if lagging.is_empty() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("members did not converge on {}: {}", expected, lagging.join(", "));
        }
        time::sleep(Duration::from_millis(20)).await;
    }
}

async fn run(group: &mut RaftGroup<Accumulator>, cfg: &RuntimeConfig) -> anyhow::Result<()> {
    let leader = group.wait_on_leader(Duration::from_secs(10)).await?;
    info!("leader elected: {}", leader.id());

    let mut expected = 0i64;
    let mut stopped = None;
    for i in 0..cfg.proposals {
        if cfg.restart_after > 0 && i == cfg.restart_after {
            if let Some(follower) = group.non_leader() {
                let id = follower.id().clone();
                let index = follower.snapshot().await?;
                info!("snapshot of {} taken at {}, stopping it", id, index);
                group.stop(&id).await;
                stopped = Some(id);
            }
        }
        let delta: i64 = rand::thread_rng().gen_range(-100..=100);
        let index = group.propose(Accumulator::encode_delta(delta)).await?;
        expected += delta;
        log::debug!("proposal {} applied at {}", delta, index);
    }

    if let Some(id) = stopped {
        group.restart(&id)?;
    }
    wait_on_total(group, expected, Duration::from_secs(10)).await?;
    info!(
        "{} proposals applied, every member converged on {}",
        cfg.proposals, expected
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();

    let mut cfg = RuntimeConfig::from_toml(&args.config);
    if let Some(nodes) = args.nodes {
        cfg.nodes = nodes;
    }
    if let Some(proposals) = args.proposals {
        cfg.proposals = proposals;
    }
    if let Some(data_dir) = args.data_dir {
        cfg.data_dir = data_dir;
    }
    metrics::init_registry();

    if args.clean {
        let dir = cfg.data_dir.join(&cfg.group);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("removing {}", dir.display()))?;
        }
    }

    let mut group = RaftGroup::create(
        &cfg.group,
        cfg.nodes,
        &cfg.data_dir,
        cfg.raft.clone(),
        |_| Accumulator::new(),
    )?;

    let outcome = tokio::select! {
        result = run(&mut group, &cfg) => result,
        _ = shutdown_signal() => {
            info!("interrupted");
            Ok(())
        }
    };

    println!("{}", serde_json::to_string_pretty(&group.statuses())?);
    group.shutdown().await;
    if args.metrics {
        print!("{}", metrics::gather_text());
    }
    outcome
}
