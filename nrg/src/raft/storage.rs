//! Durable log store.
//!
//! Entries live in segment files (`segment_<start>.log`) and are mirrored in
//! memory. The prefix replaced by the latest snapshot is kept in `snapshot`, and
//! the vote/term pair plus the last known commit index in `hardstate`.

use crate::raft::entry::{LogEntry, Snapshot};
use crate::raft::error::LogError;
use crate::raft::segment::Segment;
use crate::raft::PeerId;
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

type Result<T> = std::result::Result<T, LogError>;

const SNAPSHOT_FILE: &str = "snapshot";
const HARD_STATE_FILE: &str = "hardstate";
const SEGMENT_PREFIX: &str = "segment_";
const SEGMENT_SUFFIX: &str = ".log";

/// Default number of entries per segment file.
pub const DEFAULT_SEGMENT_ENTRIES: u64 = 4096;

/// State that must survive restarts besides the log itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<PeerId>,
    /// Last commit index this node learned. Used to replay entries at startup.
    pub commit: u64,
}

impl Default for HardState {
    fn default() -> Self {
        HardState {
            term: 0,
            voted_for: None,
            commit: 1,
        }
    }
}

pub struct LogStore {
    dir: PathBuf,
    sync: bool,
    segment_entries: u64,
    segments: BTreeMap<u64, Segment>,
    entries: VecDeque<LogEntry>,
    snapshot: Snapshot,
    hard_state: HardState,
}

impl LogStore {
    /// Opens (or creates) the store in `dir`, rebuilding state from disk.
    pub fn open<P: AsRef<Path>>(dir: P, sync: bool, segment_entries: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let snapshot = match read_file(&dir.join(SNAPSHOT_FILE))? {
            Some(bytes) => bincode::deserialize::<Snapshot>(&bytes)?,
            None => Snapshot::initial(),
        };
        let hard_state = match read_file(&dir.join(HARD_STATE_FILE))? {
            Some(bytes) => bincode::deserialize::<HardState>(&bytes)?,
            None => HardState::default(),
        };

        let mut starts = Vec::new();
        for dir_entry in fs::read_dir(&dir)? {
            let path = dir_entry?.path();
            if !path.is_file() {
                continue;
            }
            match segment_start(&path) {
                Some(start) => starts.push(start),
                None => continue,
            }
        }
        starts.sort_unstable();

        let mut store = LogStore {
            dir,
            sync,
            segment_entries: segment_entries.max(1),
            segments: BTreeMap::new(),
            entries: VecDeque::new(),
            snapshot,
            hard_state,
        };

        for start in starts {
            let path = store.segment_path(start);
            let mut segment = Segment::open(&path, start, sync)?;
            if segment.get_end_index() <= store.snapshot.last_index {
                // Fully covered by the snapshot; left over from an interrupted compaction.
                segment.remove()?;
                continue;
            }
            for index in segment.get_start_index()..=segment.get_end_index() {
                let entry: LogEntry = bincode::deserialize(&segment.read_entry(index)?)?;
                if entry.index != index {
                    return Err(LogError::Corrupt(format!(
                        "segment {} holds index {} at position {}",
                        path.display(),
                        entry.index,
                        index
                    )));
                }
                if index <= store.snapshot.last_index {
                    continue;
                }
                if index != store.last_index() + 1 {
                    return Err(LogError::Corrupt(format!(
                        "gap in log: expected index {}, found {}",
                        store.last_index() + 1,
                        index
                    )));
                }
                store.entries.push_back(entry);
            }
            store.segments.insert(start, segment);
        }

        log::debug!(
            "opened log store {}: snapshot at {}/{}, last index {}",
            store.dir.display(),
            store.snapshot.last_index,
            store.snapshot.last_term,
            store.last_index()
        );
        Ok(store)
    }

    fn segment_path(&self, start_index: u64) -> PathBuf {
        self.dir
            .join(format!("{}{}{}", SEGMENT_PREFIX, start_index, SEGMENT_SUFFIX))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// First index still present in the log.
    pub fn first_index(&self) -> u64 {
        self.snapshot.last_index + 1
    }

    pub fn last_index(&self) -> u64 {
        self.snapshot.last_index + self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .back()
            .map(|e| e.term)
            .unwrap_or(self.snapshot.last_term)
    }

    /// The snapshot that bounds the log. A fresh store reports the placeholder at index 1.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn hard_state(&self) -> &HardState {
        &self.hard_state
    }

    pub fn save_hard_state(&mut self, hard_state: HardState) -> Result<()> {
        if hard_state == self.hard_state {
            return Ok(());
        }
        let bytes = bincode::serialize(&hard_state)?;
        self.write_atomic(HARD_STATE_FILE, &bytes)?;
        self.hard_state = hard_state;
        Ok(())
    }

    pub fn get(&self, index: u64) -> Result<&LogEntry> {
        if index <= self.snapshot.last_index {
            return Err(LogError::Compacted(index));
        }
        let offset = (index - self.first_index()) as usize;
        self.entries.get(offset).ok_or(LogError::NotFound(index))
    }

    /// Term of the entry at `index`, including the snapshot boundary itself.
    pub fn term(&self, index: u64) -> Result<u64> {
        if index == self.snapshot.last_index {
            return Ok(self.snapshot.last_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Entries in `[from, last_index]`, at most `max` of them.
    pub fn entries_from(&self, from: u64, max: usize) -> Result<Vec<LogEntry>> {
        if from <= self.snapshot.last_index {
            return Err(LogError::Compacted(from));
        }
        if from > self.last_index() + 1 {
            return Err(LogError::NotFound(from));
        }
        let offset = (from - self.first_index()) as usize;
        Ok(self.entries.iter().skip(offset).take(max).cloned().collect())
    }

    pub fn append(&mut self, entry: LogEntry) -> Result<u64> {
        let index = entry.index;
        self.append_entries(vec![entry])?;
        Ok(index)
    }

    /// Appends a contiguous batch, durably, after the current last index.
    ///
    /// On error the in-memory log holds exactly the entries whose segment
    /// write went through.
    pub fn append_entries(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        let mut expected = self.last_index() + 1;
        for entry in &entries {
            if entry.index != expected {
                return Err(LogError::OutOfOrder {
                    expected,
                    got: entry.index,
                });
            }
            expected += 1;
        }

        let mut pending: Vec<Vec<u8>> = Vec::new();
        let mut written: Vec<LogEntry> = Vec::new();
        let mut segment_start = self.tail_segment_start();
        for entry in entries {
            let full = match segment_start {
                Some(start) => {
                    let on_disk = self.segments.get(&start).map(|s| s.len()).unwrap_or(0);
                    on_disk + pending.len() as u64 >= self.segment_entries
                }
                None => true,
            };
            if full {
                if let Some(start) = segment_start {
                    self.write_segment(start, &pending)?;
                    pending.clear();
                    self.entries.extend(written.drain(..));
                }
                let start = entry.index;
                let segment = Segment::open(self.segment_path(start), start, self.sync)?;
                self.segments.insert(start, segment);
                segment_start = Some(start);
            }
            pending.push(bincode::serialize(&entry)?);
            written.push(entry);
        }
        if let Some(start) = segment_start {
            self.write_segment(start, &pending)?;
        }

        self.entries.extend(written);
        Ok(())
    }

    fn tail_segment_start(&self) -> Option<u64> {
        self.segments
            .iter()
            .next_back()
            .filter(|(_, s)| s.get_end_index() == self.last_index() || s.is_empty())
            .map(|(start, _)| *start)
    }

    fn write_segment(&mut self, start: u64, pending: &[Vec<u8>]) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let segment = self
            .segments
            .get_mut(&start)
            .ok_or_else(|| LogError::Corrupt(format!("missing segment {}", start)))?;
        segment.append(pending)?;
        Ok(())
    }

    /// Discards every entry after `index`.
    pub fn truncate_after(&mut self, index: u64) -> Result<()> {
        if index < self.snapshot.last_index {
            return Err(LogError::Compacted(index));
        }
        if index >= self.last_index() {
            return Ok(());
        }

        let doomed: Vec<u64> = self.segments.range(index + 1..).map(|(s, _)| *s).collect();
        for start in doomed {
            if let Some(segment) = self.segments.remove(&start) {
                segment.remove()?;
            }
        }
        if let Some((_, segment)) = self.segments.range_mut(..=index).next_back() {
            segment.truncate_after(index)?;
        }

        self.entries
            .truncate((index - self.snapshot.last_index) as usize);
        Ok(())
    }

    /// Replaces the log prefix up to `index` with `snapshot`.
    pub fn compact_before(&mut self, index: u64, snapshot: Snapshot) -> Result<()> {
        if index <= self.snapshot.last_index {
            return Ok(());
        }
        if index > self.last_index() {
            return Err(LogError::NotFound(index));
        }
        let term = self.term(index)?;
        if snapshot.last_index != index || snapshot.last_term != term {
            return Err(LogError::Corrupt(format!(
                "snapshot {}/{} does not match log entry {}/{}",
                snapshot.last_index, snapshot.last_term, index, term
            )));
        }

        self.persist_snapshot(&snapshot)?;
        let removed = (index - self.snapshot.last_index) as usize;
        self.entries.drain(..removed);
        self.snapshot = snapshot;
        self.drop_covered_segments()?;
        Ok(())
    }

    /// Installs a snapshot received from the leader. Entries after it are kept
    /// only when the log agrees with the snapshot at its boundary.
    pub fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        if snapshot.last_index <= self.snapshot.last_index {
            return Ok(());
        }
        if let Ok(term) = self.term(snapshot.last_index) {
            if term == snapshot.last_term {
                return self.compact_before(snapshot.last_index, snapshot);
            }
        }

        self.persist_snapshot(&snapshot)?;
        for (_, segment) in std::mem::take(&mut self.segments) {
            segment.remove()?;
        }
        self.entries.clear();
        self.snapshot = snapshot;
        Ok(())
    }

    fn drop_covered_segments(&mut self) -> Result<()> {
        let covered: Vec<u64> = self
            .segments
            .iter()
            .filter(|(_, s)| s.get_end_index() <= self.snapshot.last_index)
            .map(|(start, _)| *start)
            .collect();
        for start in covered {
            if let Some(segment) = self.segments.remove(&start) {
                segment.remove()?;
            }
        }
        Ok(())
    }

    fn persist_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let bytes = bincode::serialize(snapshot)?;
        self.write_atomic(SNAPSHOT_FILE, &bytes)
    }

    /// Write to a temporary file first, then rename over the target.
    fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.dir.join(name);
        let temp_path = self.dir.join(format!("{}.tmp", name));

        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        if self.sync {
            file.sync_all()?;
        }
        drop(file);

        fs::rename(&temp_path, &path)?;
        #[cfg(unix)]
        if self.sync {
            File::open(&self.dir)?.sync_all()?;
        }
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn segment_start(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::entry::EntryKind;

    fn open(dir: &Path) -> LogStore {
        LogStore::open(dir, false, 4).unwrap()
    }

    fn fill(store: &mut LogStore, term: u64, count: u64) {
        for _ in 0..count {
            let index = store.last_index() + 1;
            let data = format!("entry-{}", index).into_bytes();
            store.append(LogEntry::normal(term, index, data)).unwrap();
        }
    }

    #[test]
    fn test_fresh_store_starts_at_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        assert_eq!(store.last_index(), 1);
        assert_eq!(store.last_term(), 1);
        assert_eq!(store.first_index(), 2);
        assert_eq!(store.term(1).unwrap(), 1);
        assert_eq!(store.hard_state(), &HardState::default());
    }

    #[test]
    fn test_append_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(dir.path());
        assert_eq!(store.append(LogEntry::normal(1, 2, b"a".to_vec())).unwrap(), 2);
        assert_eq!(store.append(LogEntry::normal(1, 3, b"b".to_vec())).unwrap(), 3);

        assert_eq!(store.get(3).unwrap().data, b"b");
        assert!(matches!(store.get(4), Err(LogError::NotFound(4))));
        assert!(matches!(store.get(1), Err(LogError::Compacted(1))));
        assert!(matches!(
            store.append(LogEntry::normal(1, 7, Vec::new())),
            Err(LogError::OutOfOrder {
                expected: 4,
                got: 7
            })
        ));
    }

    #[test]
    fn test_segments_roll_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = open(dir.path());
            fill(&mut store, 1, 10);
            store
                .append(LogEntry::new(2, 12, EntryKind::LeaderChange, b"AAAAAAAA".to_vec()))
                .unwrap();
            assert_eq!(store.segments.len(), 3);
        }

        let store = open(dir.path());
        assert_eq!(store.last_index(), 12);
        assert_eq!(store.last_term(), 2);
        assert_eq!(store.get(5).unwrap().data, b"entry-5");
        assert_eq!(store.get(12).unwrap().kind, EntryKind::LeaderChange);
    }

    #[test]
    fn test_failed_roll_keeps_written_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let mut store = open(&path);
        fill(&mut store, 1, 3);

        // The open segment handle still writes, but the next segment file cannot be created.
        fs::remove_dir_all(&path).unwrap();
        let batch = (5..=7)
            .map(|i| LogEntry::normal(1, i, format!("entry-{}", i).into_bytes()))
            .collect();
        assert!(matches!(store.append_entries(batch), Err(LogError::Io(_))));

        assert_eq!(store.last_index(), 5);
        assert_eq!(store.get(5).unwrap().data, b"entry-5");
        assert!(matches!(store.get(6), Err(LogError::NotFound(6))));
    }

    #[test]
    fn test_truncate_after() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = open(dir.path());
            fill(&mut store, 1, 10);
            store.truncate_after(4).unwrap();
            assert_eq!(store.last_index(), 4);
            assert!(matches!(store.get(5), Err(LogError::NotFound(5))));
            fill(&mut store, 2, 3);
            assert_eq!(store.term(7).unwrap(), 2);
        }

        let store = open(dir.path());
        assert_eq!(store.last_index(), 7);
        assert_eq!(store.term(4).unwrap(), 1);
        assert_eq!(store.term(5).unwrap(), 2);
    }

    #[test]
    fn test_compact_before() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = open(dir.path());
            fill(&mut store, 1, 10);
            let snapshot = Snapshot {
                last_index: 8,
                last_term: 1,
                data: b"state".to_vec(),
            };
            store.compact_before(8, snapshot.clone()).unwrap();

            assert!(matches!(store.get(8), Err(LogError::Compacted(8))));
            assert!(matches!(store.get(3), Err(LogError::Compacted(3))));
            assert!(matches!(store.get(12), Err(LogError::NotFound(12))));
            assert_eq!(store.get(9).unwrap().index, 9);
            assert_eq!(store.term(8).unwrap(), 1);
            assert_eq!(store.snapshot(), &snapshot);
            assert!(matches!(store.entries_from(5, 10), Err(LogError::Compacted(5))));
            assert!(matches!(store.truncate_after(3), Err(LogError::Compacted(3))));
        }

        let store = open(dir.path());
        assert_eq!(store.snapshot().data, b"state");
        assert_eq!(store.first_index(), 9);
        assert_eq!(store.last_index(), 11);
        // segment_2 (entries 2..=5) was fully covered and deleted
        assert_eq!(store.segments.keys().copied().collect::<Vec<_>>(), vec![6, 10]);
    }

    #[test]
    fn test_compact_rejects_mismatched_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(dir.path());
        fill(&mut store, 1, 3);
        let snapshot = Snapshot {
            last_index: 3,
            last_term: 5,
            data: Vec::new(),
        };
        assert!(store.compact_before(3, snapshot).is_err());
        assert_eq!(store.first_index(), 2);
    }

    #[test]
    fn test_install_snapshot_replaces_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(dir.path());
        fill(&mut store, 1, 5);
        store
            .install_snapshot(Snapshot {
                last_index: 20,
                last_term: 3,
                data: b"leader".to_vec(),
            })
            .unwrap();
        assert_eq!(store.last_index(), 20);
        assert_eq!(store.last_term(), 3);
        assert!(store.segments.is_empty());

        fill(&mut store, 3, 2);
        drop(store);
        let store = open(dir.path());
        assert_eq!(store.last_index(), 22);
        assert_eq!(store.snapshot().data, b"leader");
    }

    #[test]
    fn test_entries_from() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(dir.path());
        fill(&mut store, 1, 6);
        let batch = store.entries_from(3, 2).unwrap();
        assert_eq!(batch.iter().map(|e| e.index).collect::<Vec<_>>(), vec![3, 4]);
        assert!(store.entries_from(8, 10).unwrap().is_empty());
        assert!(matches!(store.entries_from(9, 10), Err(LogError::NotFound(9))));
    }

    #[test]
    fn test_hard_state_persists() {
        let dir = tempfile::tempdir().unwrap();
        let hs = HardState {
            term: 4,
            voted_for: Some(PeerId::new("AAAAAAAA").unwrap()),
            commit: 9,
        };
        {
            let mut store = open(dir.path());
            store.save_hard_state(hs.clone()).unwrap();
        }
        assert_eq!(open(dir.path()).hard_state(), &hs);
    }
}
