//! Metrics collection module for the consensus core
//!
//! Counters and histograms are registered in a process-wide Prometheus
//! registry and labelled by group member.

use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::future::Future;
use std::time::Instant;

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Proposals accepted by a leader
    pub static ref PROPOSALS: CounterVec =
        CounterVec::new(Opts::new("nrg_proposals_total", "proposals appended by a leader"), &["peer"]).unwrap();

    /// Entries handed to the state machine
    pub static ref APPLIED: CounterVec =
        CounterVec::new(Opts::new("nrg_applied_total", "entries applied"), &["peer"]).unwrap();

    /// Elections started
    pub static ref ELECTIONS: CounterVec =
        CounterVec::new(Opts::new("nrg_elections_total", "elections started"), &["peer"]).unwrap();

    /// Times a member became leader
    pub static ref LEADER_CHANGES: CounterVec =
        CounterVec::new(Opts::new("nrg_leader_elected_total", "elections won"), &["peer"]).unwrap();

    /// Inbound messages dropped because they failed to decode
    pub static ref MALFORMED: CounterVec =
        CounterVec::new(Opts::new("nrg_malformed_messages_total", "undecodable messages"), &["peer"]).unwrap();

    /// Snapshots taken or installed
    pub static ref SNAPSHOTS: CounterVec =
        CounterVec::new(Opts::new("nrg_snapshots_total", "snapshots taken or installed"), &["peer", "kind"]).unwrap();

    /// Histogram for tracking proposal latency until applied
    pub static ref PROPOSE_HISTOGRAM: HistogramVec = HistogramVec::new(
        HistogramOpts::new("nrg_propose_seconds", "time from propose to applied"),
        &["peer"]
    )
    .unwrap();
}

/// Registers all metric collectors with the global registry
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(PROPOSALS.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(APPLIED.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(ELECTIONS.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(LEADER_CHANGES.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(MALFORMED.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(SNAPSHOTS.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(PROPOSE_HISTOGRAM.clone()));
}

/// Renders the registry in the Prometheus text format.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY_INSTANCE.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        log::warn!("failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Records the latency of an async operation
///
/// # Arguments
///
/// * `peer` - Member the operation runs against
/// * `handler` - Async function to execute and measure
///
/// # Returns
///
/// Returns the result of the handler function
pub async fn record_propose<F, Fut, T, E>(peer: &str, handler: F) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let result = handler().await;

    if result.is_ok() {
        PROPOSE_HISTOGRAM
            .with_label_values(&[peer])
            .observe(start.elapsed().as_secs_f64());
    }

    result
}
