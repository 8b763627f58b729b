#![allow(dead_code)]

use std::time::Duration;

use tempfile::TempDir;
use tokio::time::{self, Instant};

use nrg::accumulator::Accumulator;
use nrg::config::RaftConfig;
use nrg::group::RaftGroup;
use nrg::raft::NodeStatus;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Faster timers than the defaults, no fsync.
pub fn test_config() -> RaftConfig {
    RaftConfig {
        election_timeout_min_ms: 150,
        election_timeout_max_ms: 300,
        heartbeat_interval_ms: 30,
        proposal_timeout_ms: 5_000,
        sync_writes: false,
        ..Default::default()
    }
}

pub fn create_group(dir: &TempDir, size: usize) -> RaftGroup<Accumulator> {
    init_logger();
    RaftGroup::create("TEST", size, dir.path(), test_config(), |_| {
        Accumulator::new()
    })
    .unwrap()
}

pub fn delta(value: i64) -> Vec<u8> {
    Accumulator::encode_delta(value)
}

/// Waits until every running member's accumulator reads `expected`.
pub async fn wait_on_total(group: &RaftGroup<Accumulator>, expected: i64) {
    let deadline = Instant::now() + WAIT;
    loop {
        let totals: Vec<i64> = group
            .running()
            .map(|n| group.state(n.id()).unwrap().total())
            .collect();
        if totals.iter().all(|t| *t == expected) {
            return;
        }
        if Instant::now() >= deadline {
            panic!(
                "members never converged on {}: {:?} {:?}",
                expected,
                totals,
                group.statuses()
            );
        }
        time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_on_commit(group: &RaftGroup<Accumulator>, index: u64) -> Vec<NodeStatus> {
    group
        .wait_until(WAIT, |statuses| {
            statuses
                .iter()
                .all(|s| s.commit == index && s.applied == index)
        })
        .await
        .unwrap()
}
