//! Integer accumulator state machine
//!
//! Every entry carries a signed delta that is added to a running total. Used by
//! the demo binary, the benchmark and the group tests to check convergence.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::raft::{ApplyError, StateMachine};

/// State machine that sums `i64` deltas
///
/// Clones share the same total, so a clone kept outside the node observes what
/// the node applied.
#[derive(Debug, Default, Clone)]
pub struct Accumulator {
    total: Arc<AtomicI64>,
}

impl Accumulator {
    pub fn new() -> Accumulator {
        Accumulator::default()
    }

    pub fn total(&self) -> i64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Encodes a delta as an entry payload.
    pub fn encode_delta(delta: i64) -> Vec<u8> {
        delta.to_le_bytes().to_vec()
    }

    fn decode_delta(data: &[u8]) -> Result<i64, ApplyError> {
        let raw: [u8; 8] = data
            .try_into()
            .map_err(|_| ApplyError::new(format!("delta must be 8 bytes, got {}", data.len())))?;
        Ok(i64::from_le_bytes(raw))
    }
}

impl StateMachine for Accumulator {
    fn apply(&mut self, _index: u64, data: &[u8]) -> Result<(), ApplyError> {
        let delta = Self::decode_delta(data)?;
        self.total.fetch_add(delta, Ordering::SeqCst);
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>, ApplyError> {
        bincode::serialize(&self.total()).map_err(|e| ApplyError::new(e.to_string()))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), ApplyError> {
        let total: i64 = bincode::deserialize(data).map_err(|e| ApplyError::new(e.to_string()))?;
        self.total.store(total, Ordering::SeqCst);
        Ok(())
    }
}
