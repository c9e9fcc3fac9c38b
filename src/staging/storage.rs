//! Cell storage backends.
//!
//! RAM storage keeps encoded cells in a chain of chunks: every chunk except
//! the tail holds exactly [CHUNK_SIZE] bytes, so a byte offset maps to a
//! chunk by plain division, and the tail grows by powers of two from
//! [MIN_CHUNK_SIZE]. Because a single cell never reaches [CELL_SIZE_LIMIT],
//! any cell spans at most two consecutive chunks.
//!
//! File storage (feature `file`) appends to a single backing file; reads go
//! through independent handles so the append position is never disturbed.

use crate::codec::error::SinkError;
use crate::codec::sink::Sink;
use crate::staging::enums::StorageKind;
use crate::staging::error::StagingError;
use log::trace;
use static_assertions::const_assert;

#[cfg(feature = "file")]
use std::fs::{File, OpenOptions};
#[cfg(feature = "file")]
use std::io::Write;
#[cfg(feature = "file")]
use std::path::PathBuf;

/// Smallest tail-chunk allocation.
pub const MIN_CHUNK_SIZE: usize = 0x100;

/// Size of every full chunk.
pub const CHUNK_SIZE: usize = 0x1_0000;

/// Upper bound (exclusive) on one encoded cell.
pub const CELL_SIZE_LIMIT: usize = 0x1_0000;

// A cell must fit in at most two consecutive chunks.
const_assert!(CHUNK_SIZE >= CELL_SIZE_LIMIT);

#[derive(Debug, Default)]
pub struct RamStorage {
    /// All chunks but the last hold exactly [CHUNK_SIZE] bytes.
    chunks: Vec<Vec<u8>>,
}

impl RamStorage {
    fn new() -> Self {
        RamStorage {
            chunks: vec![Vec::with_capacity(MIN_CHUNK_SIZE)],
        }
    }

    fn len(&self) -> usize {
        match self.chunks.split_last() {
            Some((last, full)) => full.len() * CHUNK_SIZE + last.len(),
            None => 0,
        }
    }

    fn append(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        if bytes.len() >= CELL_SIZE_LIMIT {
            return Err(SinkError::TooBig);
        }
        let last = self.chunks.last_mut().expect("storage always has a tail chunk");
        let used = last.len();
        let left = CHUNK_SIZE - used;
        if left > bytes.len() {
            // Fits in the tail; grow its allocation in power-of-two steps.
            let wanted = (used + bytes.len()).next_power_of_two().min(CHUNK_SIZE);
            if last.capacity() < wanted {
                trace!("growing tail chunk {} -> {}", last.capacity(), wanted);
                last.reserve_exact(wanted - used);
            }
            last.extend_from_slice(bytes);
        } else {
            // Spans into a fresh chunk; the tail is topped up to full size
            // first so offset arithmetic stays uniform. A write that exactly
            // fills the tail opens an empty successor: no chunk is ever left
            // full.
            let (head, rest) = bytes.split_at(left);
            last.reserve_exact(CHUNK_SIZE - used);
            last.extend_from_slice(head);
            let mut fresh =
                Vec::with_capacity(rest.len().next_power_of_two().max(MIN_CHUNK_SIZE));
            fresh.extend_from_slice(rest);
            trace!("linked chunk #{} ({} bytes in)", self.chunks.len(), rest.len());
            self.chunks.push(fresh);
        }
        Ok(())
    }

    pub(crate) fn chunk(&self, index: usize) -> Option<&[u8]> {
        self.chunks.get(index).map(|c| c.as_slice())
    }

    pub(crate) fn nchunks(&self) -> usize {
        self.chunks.len()
    }

    fn reset(&mut self) {
        self.chunks.clear();
        self.chunks.push(Vec::with_capacity(MIN_CHUNK_SIZE));
    }

    fn trim(&mut self) {
        if let Some(last) = self.chunks.last_mut() {
            last.shrink_to_fit();
        }
    }
}

#[cfg(feature = "file")]
#[derive(Debug)]
pub struct FileStorage {
    file: File,
    path: PathBuf,
    nbytes: usize,
}

#[cfg(feature = "file")]
impl FileStorage {
    fn open(path: &str) -> Result<Self, StagingError> {
        let file = OpenOptions::new()
            .append(true)
            .read(true)
            .create(true)
            .open(path)?;
        let nbytes = file.metadata()?.len() as usize;
        Ok(FileStorage {
            file,
            path: PathBuf::from(path),
            nbytes,
        })
    }

    fn append(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        if bytes.len() >= CELL_SIZE_LIMIT {
            return Err(SinkError::TooBig);
        }
        self.file
            .write_all(bytes)
            .map_err(|e| SinkError::Io(e.kind()))?;
        self.nbytes += bytes.len();
        Ok(())
    }

    /// A fresh read handle on the backing file.
    pub(crate) fn reader(&self) -> Result<File, StagingError> {
        Ok(File::open(&self.path)?)
    }

    fn reset(&mut self) -> Result<(), StagingError> {
        self.file.set_len(0)?;
        self.nbytes = 0;
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> Result<(), StagingError> {
        self.file.flush()?;
        Ok(())
    }
}

/// A table's backing store.
#[derive(Debug)]
pub enum Storage {
    Ram(RamStorage),
    #[cfg(feature = "file")]
    File(FileStorage),
}

impl Storage {
    pub fn ram() -> Storage {
        Storage::Ram(RamStorage::new())
    }

    #[cfg(feature = "file")]
    pub fn file(path: &str) -> Result<Storage, StagingError> {
        Ok(Storage::File(FileStorage::open(path)?))
    }

    /// Placeholder used when swapping backings around; holds no chunks.
    pub(crate) fn empty() -> Storage {
        Storage::Ram(RamStorage { chunks: Vec::new() })
    }

    pub fn kind(&self) -> StorageKind {
        match self {
            Storage::Ram(_) => StorageKind::Ram,
            #[cfg(feature = "file")]
            Storage::File(_) => StorageKind::File,
        }
    }

    /// Bytes currently stored.
    pub fn len(&self) -> usize {
        match self {
            Storage::Ram(ram) => ram.len(),
            #[cfg(feature = "file")]
            Storage::File(f) => f.nbytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn append(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        match self {
            Storage::Ram(ram) => ram.append(bytes),
            #[cfg(feature = "file")]
            Storage::File(f) => f.append(bytes),
        }
    }

    /// Drops all stored cells, keeping the backend usable.
    pub(crate) fn reset(&mut self) -> Result<(), StagingError> {
        match self {
            Storage::Ram(ram) => {
                ram.reset();
                Ok(())
            }
            #[cfg(feature = "file")]
            Storage::File(f) => f.reset(),
        }
    }

    /// Releases slack: shrinks the RAM tail chunk, flushes files.
    pub(crate) fn trim(&mut self) -> Result<(), StagingError> {
        match self {
            Storage::Ram(ram) => {
                ram.trim();
                Ok(())
            }
            #[cfg(feature = "file")]
            Storage::File(f) => f.flush(),
        }
    }
}

/// [Sink] adapter writing a table's cell stream into its storage.
#[derive(Debug)]
pub struct StagingSink {
    pub(crate) storage: Storage,
}

impl StagingSink {
    pub(crate) fn new(storage: Storage) -> Self {
        StagingSink { storage }
    }

    pub(crate) fn into_storage(self) -> Storage {
        self.storage
    }
}

impl Sink for StagingSink {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, SinkError> {
        // Storage accepts whole writes or fails; there is no short-write
        // overflow on the staging side.
        self.storage.append(bytes)?;
        Ok(bytes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_chunks_fill_to_exact_size() {
        let mut s = Storage::ram();
        let blob = vec![0xAB; CELL_SIZE_LIMIT - 1];
        s.append(&blob).unwrap();
        s.append(&blob).unwrap();
        assert_eq!(s.len(), 2 * blob.len());
        let Storage::Ram(ram) = &s else { unreachable!() };
        assert_eq!(ram.nchunks(), 2);
        assert_eq!(ram.chunk(0).unwrap().len(), CHUNK_SIZE);
    }

    #[test]
    fn exact_fill_opens_empty_successor() {
        let mut s = Storage::ram();
        let half = vec![1u8; CHUNK_SIZE / 2];
        s.append(&half).unwrap();
        s.append(&half).unwrap();
        let Storage::Ram(ram) = &s else { unreachable!() };
        // No chunk is ever left full: the second write rolled into a fresh,
        // empty tail.
        assert_eq!(ram.nchunks(), 2);
        assert_eq!(ram.chunk(0).unwrap().len(), CHUNK_SIZE);
        assert_eq!(ram.chunk(1).unwrap().len(), 0);
    }

    #[test]
    fn oversized_cell_is_rejected() {
        let mut s = Storage::ram();
        let blob = vec![0u8; CELL_SIZE_LIMIT];
        assert_eq!(s.append(&blob), Err(SinkError::TooBig));
    }

    #[test]
    fn reset_drops_content() {
        let mut s = Storage::ram();
        s.append(&[1, 2, 3]).unwrap();
        s.reset().unwrap();
        assert_eq!(s.len(), 0);
        s.append(&[4]).unwrap();
        assert_eq!(s.len(), 1);
    }

    #[cfg(feature = "file")]
    #[test]
    fn file_storage_appends_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cells.sdb");
        let path = path.to_str().unwrap();
        {
            let mut s = Storage::file(path).unwrap();
            s.append(&[1, 2, 3]).unwrap();
            s.trim().unwrap();
            assert_eq!(s.len(), 3);
        }
        // Reopening picks the existing length up.
        let s = Storage::file(path).unwrap();
        assert_eq!(s.len(), 3);
    }
}
