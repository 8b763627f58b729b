use log::warn;
use serde_derive::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::raft::storage::DEFAULT_SEGMENT_ENTRIES;
use crate::raft::RaftError;

/// Timing and storage knobs of a single group member.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout, in milliseconds.
    pub election_timeout_min_ms: u64,
    /// Upper bound (exclusive) of the randomized election timeout, in milliseconds.
    pub election_timeout_max_ms: u64,
    /// Leader heartbeat and replication re-drive period, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// How long `propose` waits for the entry to be applied, in milliseconds.
    pub proposal_timeout_ms: u64,
    /// Maximum entries carried by one append-entry message.
    pub max_append_entries: usize,
    /// Entries per segment file.
    pub segment_entries: u64,
    /// Take a snapshot once this many applied entries sit above the last one. 0 disables.
    pub snapshot_threshold: u64,
    /// fsync every log and state write.
    pub sync_writes: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            election_timeout_min_ms: 300,
            election_timeout_max_ms: 600,
            heartbeat_interval_ms: 50,
            proposal_timeout_ms: 5_000,
            max_append_entries: 1024,
            segment_entries: DEFAULT_SEGMENT_ENTRIES,
            snapshot_threshold: 0,
            sync_writes: true,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<(), RaftError> {
        if self.election_timeout_min_ms == 0
            || self.election_timeout_min_ms >= self.election_timeout_max_ms
        {
            return Err(RaftError::Config(format!(
                "election timeout range [{}, {}) is empty",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(RaftError::Config(format!(
                "heartbeat interval {}ms must be non-zero and below the election timeout",
                self.heartbeat_interval_ms
            )));
        }
        if self.max_append_entries == 0 || self.max_append_entries > u16::MAX as usize {
            return Err(RaftError::Config(format!(
                "max_append_entries {} out of range",
                self.max_append_entries
            )));
        }
        Ok(())
    }

    pub fn election_timeout_min(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms)
    }

    pub fn election_timeout_max(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_millis(self.proposal_timeout_ms)
    }
}

/// Settings of the demo binary: an in-process group driven by random proposals.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    pub group: String,
    pub nodes: usize,
    pub data_dir: PathBuf,
    pub proposals: usize,
    /// Snapshot, stop and later restart one follower after this many proposals. 0 disables.
    pub restart_after: usize,
    pub raft: RaftConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::new()
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig {
            group: "TEST".to_string(),
            nodes: 3,
            data_dir: PathBuf::from("data"),
            proposals: 100,
            restart_after: 0,
            raft: RaftConfig::default(),
        }
    }

    pub fn from_toml(path: &str) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file {}, {:?}",
                    path, e
                );
                return RuntimeConfig::new();
            }
        };
        match toml::from_str(&contents) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong parsing the runtime config file {}, {:?}",
                    path, e
                );
                RuntimeConfig::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RaftConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_timeouts() {
        let cfg = RaftConfig {
            election_timeout_min_ms: 500,
            election_timeout_max_ms: 500,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = RaftConfig {
            heartbeat_interval_ms: 400,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_runtime_config_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
nodes = 5
proposals = 10

[raft]
heartbeat_interval_ms = 20
sync_writes = false
"#,
        )
        .unwrap();

        let cfg = RuntimeConfig::from_toml(path.to_str().unwrap());
        assert_eq!(cfg.nodes, 5);
        assert_eq!(cfg.proposals, 10);
        assert_eq!(cfg.group, "TEST");
        assert_eq!(cfg.raft.heartbeat_interval_ms, 20);
        assert!(!cfg.raft.sync_writes);
        assert_eq!(cfg.raft.election_timeout_min_ms, 300);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let cfg = RuntimeConfig::from_toml("/definitely/not/here.toml");
        assert_eq!(cfg.nodes, 3);
    }
}
