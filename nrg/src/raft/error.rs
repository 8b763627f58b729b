//! Error types for the consensus core.

use std::io;

use thiserror::Error;

use crate::raft::PeerId;

/// Errors produced while encoding or decoding wire messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The leader field is neither empty nor exactly `ID_LEN` bytes.
    #[error("leader field must be empty or {expected} bytes, got {0}", expected = crate::raft::ID_LEN)]
    LeaderFieldLength(usize),
    /// More entries than the 16-bit count field can carry.
    #[error("too many entries: {0} (max {max})", max = u16::MAX)]
    TooManyEntries(usize),
    /// Truncated, corrupted or otherwise inconsistent input.
    #[error("malformed message: {0}")]
    MalformedMessage(&'static str),
}

/// Errors returned by the log store.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("log index {0} not found")]
    NotFound(u64),
    #[error("log index {0} has been compacted")]
    Compacted(u64),
    #[error("out of order append: expected index {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },
    #[error("log storage io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt log storage: {0}")]
    Corrupt(String),
}

impl From<bincode::Error> for LogError {
    fn from(e: bincode::Error) -> Self {
        LogError::Corrupt(e.to_string())
    }
}

/// Error reported by a state machine. Always fatal to the node that hit it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("state machine error: {0}")]
pub struct ApplyError(pub String);

impl ApplyError {
    pub fn new(msg: impl Into<String>) -> Self {
        ApplyError(msg.into())
    }
}

/// Errors surfaced to callers of the node's administrative operations.
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("not the leader (current leader: {})", display_leader(.leader))]
    NotLeader { leader: Option<PeerId> },
    #[error("operation timed out")]
    Timeout,
    #[error("proposal was dropped by a leader change")]
    ProposalDropped,
    #[error("node is stopped")]
    Stopped,
    #[error("node halted: {0}")]
    Halted(String),
    #[error("invalid peer id {0:?}")]
    InvalidPeerId(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
}

fn display_leader(leader: &Option<PeerId>) -> &str {
    leader.as_ref().map(|l| l.as_str()).unwrap_or("none")
}

pub type Result<T, E = RaftError> = std::result::Result<T, E>;
