//! Single-group Raft consensus core.
//!
//! A [`node::RaftNode`] runs as one tokio task per member. It replicates a log of
//! [`entry::Entry`] values through a [`transport::Transport`], persists them in a
//! [`storage::LogStore`] and feeds committed entries to a [`StateMachine`].

use std::fmt;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_derive::{Deserialize, Serialize};

pub mod codec;
mod election;
pub mod entry;
pub mod error;
pub mod node;
pub mod proposal;
mod replication;
mod segment;
pub mod storage;
pub mod transport;

pub use error::{ApplyError, CodecError, LogError, RaftError};
pub use node::{NodeHandle, NodeStatus, RaftNode, RoleKind};

/// Length in bytes of every peer identifier.
pub const ID_LEN: usize = 8;

/// Identifier of a group member. Always exactly [`ID_LEN`] ASCII bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Result<Self, RaftError> {
        let id = id.into();
        if id.len() != ID_LEN || !id.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(RaftError::InvalidPeerId(id));
        }
        Ok(PeerId(id))
    }

    /// Generates a random alphanumeric id.
    pub fn random() -> Self {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(ID_LEN)
            .map(char::from)
            .collect();
        PeerId(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub(crate) fn from_wire(raw: &[u8]) -> Result<Option<Self>, CodecError> {
        if raw.iter().all(|b| *b == 0) {
            return Ok(None);
        }
        if !raw.iter().all(|b| b.is_ascii_graphic()) {
            return Err(CodecError::MalformedMessage("invalid peer id"));
        }
        // ascii graphic bytes are valid utf-8
        let id = String::from_utf8_lossy(raw).into_owned();
        Ok(Some(PeerId(id)))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PeerId {
    type Error = RaftError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PeerId::new(value)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

/// Application state replicated by the group.
///
/// Every member applies the same committed entries in the same order, so two
/// implementations that are deterministic in `apply` stay identical.
pub trait StateMachine: Send + 'static {
    /// Applies one committed entry. Called exactly once per entry, in index order.
    /// An error halts the node.
    fn apply(&mut self, index: u64, data: &[u8]) -> Result<(), ApplyError>;

    /// Serializes the state as of the last applied entry.
    fn snapshot(&self) -> Result<Vec<u8>, ApplyError>;

    /// Replaces the whole state with a snapshot produced by [`StateMachine::snapshot`].
    fn restore(&mut self, data: &[u8]) -> Result<(), ApplyError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_length() {
        assert!(PeerId::new("DEREK123").is_ok());
        assert!(PeerId::new("foo_bar_baz").is_err());
        assert!(PeerId::new("").is_err());
        assert_eq!(PeerId::random().as_str().len(), ID_LEN);
    }

    #[test]
    fn test_peer_id_from_wire() {
        assert_eq!(PeerId::from_wire(&[0u8; ID_LEN]).unwrap(), None);
        assert_eq!(
            PeerId::from_wire(b"12345678").unwrap(),
            Some(PeerId::new("12345678").unwrap())
        );
        assert!(PeerId::from_wire(b"1234\x005678").is_err());
    }
}
