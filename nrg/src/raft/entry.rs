use serde_derive::{Deserialize, Serialize};

/// Kind of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryKind {
    /// Application data, delivered to the state machine.
    Normal = 0,
    /// Marker written by a new leader to commit entries left over from earlier terms.
    LeaderChange = 1,
}

impl EntryKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(EntryKind::Normal),
            1 => Some(EntryKind::LeaderChange),
            _ => None,
        }
    }
}

/// An entry as carried on the wire: its index is implied by its position in the
/// append-entry message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub term: u64,
    pub kind: EntryKind,
    pub data: Vec<u8>,
}

impl Entry {
    pub fn new(term: u64, kind: EntryKind, data: Vec<u8>) -> Self {
        Entry { term, kind, data }
    }

    /// Places the entry at `index`.
    pub fn at(self, index: u64) -> LogEntry {
        LogEntry {
            term: self.term,
            index,
            kind: self.kind,
            data: self.data,
        }
    }
}

/// A log entry as it lives in the log store: payload plus its position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub kind: EntryKind,
    pub data: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: u64, index: u64, kind: EntryKind, data: Vec<u8>) -> Self {
        LogEntry {
            term,
            index,
            kind,
            data,
        }
    }

    pub fn normal(term: u64, index: u64, data: Vec<u8>) -> Self {
        LogEntry::new(term, index, EntryKind::Normal, data)
    }

    pub fn to_entry(&self) -> Entry {
        Entry::new(self.term, self.kind, self.data.clone())
    }
}

/// Point-in-time state machine image that replaces the log prefix up to `last_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_index: u64,
    pub last_term: u64,
    pub data: Vec<u8>,
}

impl Snapshot {
    /// The implicit placeholder every fresh log starts from.
    pub fn initial() -> Self {
        Snapshot {
            last_index: 1,
            last_term: 1,
            data: Vec::new(),
        }
    }
}
