use bytes::{Buf, BufMut, BytesMut};
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const HEADER_SIZE: u64 = 16; // 8 bytes for start_index + 8 bytes for end_index
const ENTRY_HEADER_SIZE: u64 = 8; // 8 bytes for entry size

/// One file holding a contiguous run of encoded log entries starting at `start_index`.
#[derive(Debug)]
pub struct Segment {
    file: File,
    start_index: u64,
    end_index: u64,
    path: PathBuf,
    sync: bool,
    entry_positions: BTreeMap<u64, u64>, // index -> file position
}

#[derive(Debug, Serialize, Deserialize)]
struct SegmentHeader {
    start_index: u64,
    end_index: u64,
}

impl Segment {
    pub fn open<P: AsRef<Path>>(path: P, start_index: u64, sync: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut segment = Segment {
            file,
            start_index,
            end_index: start_index - 1,
            path: path.as_ref().to_path_buf(),
            sync,
            entry_positions: BTreeMap::new(),
        };

        // Initialize header if file is empty
        if segment.file.metadata()?.len() == 0 {
            segment.write_header()?;
            segment.flush()?;
        } else {
            segment.read_header()?;
            segment.rebuild_entry_positions()?;
        }

        Ok(segment)
    }

    fn write_header(&mut self) -> io::Result<()> {
        let header = SegmentHeader {
            start_index: self.start_index,
            end_index: self.end_index,
        };

        let header_bytes =
            bincode::serialize(&header).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header_bytes)?;
        Ok(())
    }

    fn read_header(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut header_bytes = vec![0u8; HEADER_SIZE as usize];
        self.file.read_exact(&mut header_bytes)?;

        let header: SegmentHeader = bincode::deserialize(&header_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if header.start_index != self.start_index {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "segment {} starts at {}, expected {}",
                    self.path.display(),
                    header.start_index,
                    self.start_index
                ),
            ));
        }
        self.end_index = header.end_index;
        Ok(())
    }

    fn read_entry_header(&mut self) -> io::Result<u64> {
        let mut size_bytes = [0u8; ENTRY_HEADER_SIZE as usize];
        self.file.read_exact(&mut size_bytes)?;
        Ok((&size_bytes[..]).get_u64_le())
    }

    /// Scans the file and indexes every complete entry. A torn write at the tail
    /// (crash in the middle of an append) is cut off, and so is a size field
    /// pointing past the end of the file.
    fn rebuild_entry_positions(&mut self) -> io::Result<()> {
        self.entry_positions.clear();
        let file_len = self.file.metadata()?.len();
        let mut pos = HEADER_SIZE;

        while pos + ENTRY_HEADER_SIZE <= file_len {
            self.file.seek(SeekFrom::Start(pos))?;
            let entry_size = self.read_entry_header()?;
            let end = match (pos + ENTRY_HEADER_SIZE).checked_add(entry_size) {
                Some(end) if end <= file_len => end,
                _ => break,
            };
            let entry_index = self.start_index + (self.entry_positions.len() as u64);
            self.entry_positions.insert(entry_index, pos);
            pos = end;
        }

        if pos != file_len {
            log::warn!(
                "segment {}: dropping {} bytes of torn tail",
                self.path.display(),
                file_len - pos
            );
            self.file.set_len(pos)?;
        }
        self.end_index = self.start_index + self.entry_positions.len() as u64 - 1;
        self.write_header()?;
        self.flush()
    }

    pub fn append(&mut self, entries: &[Vec<u8>]) -> io::Result<()> {
        let mut pos = self.file.seek(SeekFrom::End(0))?;
        let mut batch = BytesMut::with_capacity(
            entries
                .iter()
                .map(|e| ENTRY_HEADER_SIZE as usize + e.len())
                .sum(),
        );
        let mut positions = Vec::with_capacity(entries.len());

        for entry in entries {
            let entry_size = entry.len() as u64;
            batch.put_u64_le(entry_size);
            batch.put_slice(entry);
            positions.push(pos);
            pos += ENTRY_HEADER_SIZE + entry_size;
        }
        self.file.write_all(&batch)?;

        for pos in positions {
            let entry_index = self.end_index + 1;
            self.entry_positions.insert(entry_index, pos);
            self.end_index = entry_index;
        }

        self.write_header()?;
        self.flush()
    }

    pub fn read_entry(&mut self, index: u64) -> io::Result<Vec<u8>> {
        if index < self.start_index || index > self.end_index {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Index out of range",
            ));
        }

        let pos = *self.entry_positions.get(&index).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "Entry position not found")
        })?;

        self.file.seek(SeekFrom::Start(pos))?;
        let entry_size = self.read_entry_header()?;

        let mut entry = vec![0u8; entry_size as usize];
        self.file.read_exact(&mut entry)?;
        Ok(entry)
    }

    /// Discards every entry after `index`. An index below the segment empties it.
    pub fn truncate_after(&mut self, index: u64) -> io::Result<()> {
        if index >= self.end_index {
            return Ok(());
        }

        let cut = if index < self.start_index {
            HEADER_SIZE
        } else {
            match self.entry_positions.get(&(index + 1)) {
                Some(pos) => *pos,
                None => return Ok(()),
            }
        };

        self.file.set_len(cut)?;
        self.entry_positions.split_off(&(index + 1));
        self.end_index = index.max(self.start_index - 1);
        self.write_header()?;
        self.flush()
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Deletes the backing file.
    pub fn remove(self) -> io::Result<()> {
        let path = self.path.clone();
        drop(self);
        fs::remove_file(path)
    }

    pub fn get_start_index(&self) -> u64 {
        self.start_index
    }

    pub fn get_end_index(&self) -> u64 {
        self.end_index
    }

    pub fn len(&self) -> u64 {
        self.end_index + 1 - self.start_index
    }

    pub fn is_empty(&self) -> bool {
        self.end_index < self.start_index
    }
}
