//! Cell-by-cell cursor over a table's storage.
//!
//! The cursor reads sequentially and hands out both the raw encoded bytes
//! of each cell and its decoded value. Bytes point straight into the chunk
//! store whenever the cell is contiguous; a cell straddling two chunks is
//! reassembled into a scratch buffer allocated on first need. Either way
//! the returned slices are only valid until the next cursor call.

use crate::codec::deserializer::{Data, Deserializer, MIN_BUFFER_SIZE};
use crate::codec::error::DecodeError;
use crate::staging::error::StagingError;
use crate::staging::storage::{Storage, CELL_SIZE_LIMIT, CHUNK_SIZE};

#[cfg(feature = "file")]
use std::fs::File;
#[cfg(feature = "file")]
use std::io::{Read, Seek, SeekFrom};

/// One cell read from storage.
#[derive(Debug)]
pub struct Cell<'a> {
    /// Raw encoded bytes; `None` when a chunk-spanning cell was skipped.
    pub bytes: Option<&'a [u8]>,
    /// Decoded value; `None` when a chunk-spanning cell was skipped.
    pub value: Option<Data<'a>>,
    /// Encoded size in bytes.
    pub size: usize,
    /// Byte offset of the cell in storage.
    pub offset: usize,
}

/// Sequential reader over a table's stored cells.
pub struct CellCursor {
    nread_bytes: usize,
    nread_objects: usize,
    minibuff: [u8; MIN_BUFFER_SIZE],
    /// Reassembly buffer, sized for the largest legal cell once allocated.
    scratch: Option<Vec<u8>>,
    decoder: Deserializer,
    #[cfg(feature = "file")]
    reader: Option<File>,
}

impl CellCursor {
    /// Creates a cursor positioned on the first cell.
    pub fn new(storage: &Storage) -> Result<CellCursor, StagingError> {
        #[cfg(feature = "file")]
        let reader = match storage {
            Storage::File(f) => Some(f.reader()?),
            _ => None,
        };
        #[cfg(not(feature = "file"))]
        let _ = storage;
        Ok(CellCursor {
            nread_bytes: 0,
            nread_objects: 0,
            minibuff: [0; MIN_BUFFER_SIZE],
            scratch: None,
            decoder: Deserializer::new(),
            #[cfg(feature = "file")]
            reader,
        })
    }

    /// Total bytes consumed so far.
    pub fn nread_bytes(&self) -> usize {
        self.nread_bytes
    }

    /// Cells consumed so far.
    pub fn nread_objects(&self) -> usize {
        self.nread_objects
    }

    fn scratch_mut(&mut self) -> &mut Vec<u8> {
        self.scratch.get_or_insert_with(|| Vec::with_capacity(CELL_SIZE_LIMIT))
    }

    /// Reads the next cell. `skip` avoids the reassembly (and decoding) of
    /// cells spanning two chunks when only the size matters. Returns `None`
    /// at the end of the stored data.
    pub fn next<'a>(
        &'a mut self,
        storage: &'a Storage,
        skip: bool,
    ) -> Result<Option<Cell<'a>>, StagingError> {
        match storage {
            Storage::Ram(_) => self.next_ram(storage, skip),
            #[cfg(feature = "file")]
            Storage::File(_) => self.next_file(skip),
        }
    }

    fn next_ram<'a>(
        &'a mut self,
        storage: &'a Storage,
        skip: bool,
    ) -> Result<Option<Cell<'a>>, StagingError> {
        let offset = self.nread_bytes;
        let total = storage.len();
        if offset >= total {
            return Ok(None);
        }
        let Storage::Ram(ram) = storage else {
            return Err(StagingError::Internal);
        };
        let ci = offset / CHUNK_SIZE;
        let within = offset % CHUNK_SIZE;
        let chunk = ram.chunk(ci).ok_or(StagingError::Internal)?;
        let avail = chunk.len() - within;
        let is_last = ci + 1 == ram.nchunks();

        if avail >= MIN_BUFFER_SIZE || is_last {
            match self.decoder.read(&chunk[within..]) {
                Ok((n, data)) => {
                    self.nread_bytes += n;
                    self.nread_objects += 1;
                    return Ok(Some(Cell {
                        bytes: Some(&chunk[within..within + n]),
                        value: Some(data),
                        size: n,
                        offset,
                    }));
                }
                Err(DecodeError::Incomplete(needed)) => {
                    return self.next_spanning(storage, offset, needed, skip)
                }
                Err(e) => return Err(StagingError::Decode(e)),
            }
        }

        // Too close to the chunk boundary to even probe the size; stage the
        // first bytes of this and the next chunk in the minibuffer.
        let next = ram.chunk(ci + 1).ok_or(StagingError::Internal)?;
        let from_next = (MIN_BUFFER_SIZE - avail).min(next.len());
        self.minibuff[..avail].copy_from_slice(&chunk[within..]);
        self.minibuff[avail..avail + from_next].copy_from_slice(&next[..from_next]);
        let staged = avail + from_next;
        let result = self.decoder.read(&self.minibuff[..staged]);
        match result {
            Ok((n, data)) => {
                self.nread_bytes += n;
                self.nread_objects += 1;
                Ok(Some(Cell {
                    bytes: Some(&self.minibuff[..n]),
                    value: Some(data),
                    size: n,
                    offset,
                }))
            }
            Err(DecodeError::Incomplete(first_estimate)) => {
                // Inlined copy of `next_spanning`: calling it here as a
                // `&mut self` method would conflict with the still-live
                // borrow of `self.minibuff` backing the `Ok` arm above.
                let total = storage.len();
                let mut needed = first_estimate;
                loop {
                    if needed > CELL_SIZE_LIMIT {
                        return Err(StagingError::TooBig);
                    }
                    if offset + needed > total {
                        return Err(StagingError::Internal);
                    }
                    if skip {
                        self.nread_bytes += needed;
                        self.nread_objects += 1;
                        return Ok(Some(Cell {
                            bytes: None,
                            value: None,
                            size: needed,
                            offset,
                        }));
                    }
                    copy_range(
                        storage,
                        offset,
                        needed,
                        self.scratch.get_or_insert_with(|| Vec::with_capacity(CELL_SIZE_LIMIT)),
                    )?;
                    let mut probe = self.decoder.clone();
                    let scratch = self.scratch.as_ref().ok_or(StagingError::Internal)?;
                    match probe.read(&scratch[..needed]) {
                        Ok((n, _)) if n == needed => break,
                        Ok(_) => return Err(StagingError::Internal),
                        Err(DecodeError::Incomplete(more)) if more > needed => needed = more,
                        Err(DecodeError::Incomplete(_)) => return Err(StagingError::Internal),
                        Err(e) => return Err(StagingError::Decode(e)),
                    }
                }
                let scratch = self.scratch.as_ref().ok_or(StagingError::Internal)?;
                let (n, data) = self
                    .decoder
                    .read(&scratch[..needed])
                    .map_err(StagingError::Decode)?;
                if n != needed {
                    return Err(StagingError::Internal);
                }
                self.nread_bytes += n;
                self.nread_objects += 1;
                Ok(Some(Cell {
                    bytes: Some(&scratch[..n]),
                    value: Some(data),
                    size: n,
                    offset,
                }))
            }
            Err(e) => Err(StagingError::Decode(e)),
        }
    }

    /// Handles a cell that does not fit in the contiguous bytes at hand:
    /// either skip by size, or reassemble into scratch and decode there.
    fn next_spanning<'a>(
        &'a mut self,
        storage: &'a Storage,
        offset: usize,
        first_estimate: usize,
        skip: bool,
    ) -> Result<Option<Cell<'a>>, StagingError> {
        let total = storage.len();
        let mut needed = first_estimate;
        loop {
            if needed > CELL_SIZE_LIMIT {
                return Err(StagingError::TooBig);
            }
            if offset + needed > total {
                return Err(StagingError::Internal);
            }
            if skip {
                // Size estimates are exact once the header bytes are
                // visible; no need to materialize the cell.
                self.nread_bytes += needed;
                self.nread_objects += 1;
                return Ok(Some(Cell {
                    bytes: None,
                    value: None,
                    size: needed,
                    offset,
                }));
            }
            copy_range(storage, offset, needed, self.scratch_mut())?;
            // Probe with a throwaway decoder so the real one only ever
            // consumes the cell once.
            let mut probe = self.decoder.clone();
            let scratch = self.scratch.as_ref().ok_or(StagingError::Internal)?;
            match probe.read(&scratch[..needed]) {
                Ok((n, _)) if n == needed => break,
                Ok(_) => return Err(StagingError::Internal),
                Err(DecodeError::Incomplete(more)) if more > needed => needed = more,
                Err(DecodeError::Incomplete(_)) => return Err(StagingError::Internal),
                Err(e) => return Err(StagingError::Decode(e)),
            }
        }
        let scratch = self.scratch.as_ref().ok_or(StagingError::Internal)?;
        let (n, data) = self
            .decoder
            .read(&scratch[..needed])
            .map_err(StagingError::Decode)?;
        if n != needed {
            return Err(StagingError::Internal);
        }
        self.nread_bytes += n;
        self.nread_objects += 1;
        Ok(Some(Cell {
            bytes: Some(&scratch[..n]),
            value: Some(data),
            size: n,
            offset,
        }))
    }

    #[cfg(feature = "file")]
    fn next_file<'a>(&'a mut self, skip: bool) -> Result<Option<Cell<'a>>, StagingError> {
        let offset = self.nread_bytes;
        let staged = {
            let reader = self.reader.as_mut().ok_or(StagingError::Internal)?;
            reader.seek(SeekFrom::Start(offset as u64))?;
            read_up_to(reader, &mut self.minibuff)?
        };
        if staged == 0 {
            return Ok(None);
        }
        match self.decoder.read(&self.minibuff[..staged]) {
            Ok((n, data)) => {
                self.nread_bytes += n;
                self.nread_objects += 1;
                Ok(Some(Cell {
                    bytes: Some(&self.minibuff[..n]),
                    value: Some(data),
                    size: n,
                    offset,
                }))
            }
            Err(DecodeError::Incomplete(first_estimate)) => {
                let mut needed = first_estimate;
                loop {
                    if needed > CELL_SIZE_LIMIT {
                        return Err(StagingError::TooBig);
                    }
                    if skip {
                        self.nread_bytes += needed;
                        self.nread_objects += 1;
                        return Ok(Some(Cell {
                            bytes: None,
                            value: None,
                            size: needed,
                            offset,
                        }));
                    }
                    {
                        let scratch = self
                            .scratch
                            .get_or_insert_with(|| Vec::with_capacity(CELL_SIZE_LIMIT));
                        scratch.resize(needed, 0);
                        let reader = self.reader.as_mut().ok_or(StagingError::Internal)?;
                        reader.seek(SeekFrom::Start(offset as u64))?;
                        let got = read_up_to(reader, scratch.as_mut_slice())?;
                        if got < needed {
                            return Err(StagingError::Internal);
                        }
                    }
                    let mut probe = self.decoder.clone();
                    let scratch = self.scratch.as_ref().ok_or(StagingError::Internal)?;
                    match probe.read(&scratch[..needed]) {
                        Ok((n, _)) if n == needed => break,
                        Ok(_) => return Err(StagingError::Internal),
                        Err(DecodeError::Incomplete(more)) if more > needed => needed = more,
                        Err(DecodeError::Incomplete(_)) => return Err(StagingError::Internal),
                        Err(e) => return Err(StagingError::Decode(e)),
                    }
                }
                let scratch = self.scratch.as_ref().ok_or(StagingError::Internal)?;
                let (n, data) = self
                    .decoder
                    .read(&scratch[..needed])
                    .map_err(StagingError::Decode)?;
                if n != needed {
                    return Err(StagingError::Internal);
                }
                self.nread_bytes += n;
                self.nread_objects += 1;
                Ok(Some(Cell {
                    bytes: Some(&scratch[..n]),
                    value: Some(data),
                    size: n,
                    offset,
                }))
            }
            Err(e) => Err(StagingError::Decode(e)),
        }
    }

    /// Fetches the raw bytes of a cell by position, independent of the
    /// sequential read position. Used to retry interrupted emissions and to
    /// copy cells between tables.
    pub fn cell_bytes<'a>(
        &'a mut self,
        storage: &'a Storage,
        offset: usize,
        len: usize,
    ) -> Result<&'a [u8], StagingError> {
        match storage {
            Storage::Ram(ram) => {
                let ci = offset / CHUNK_SIZE;
                let within = offset % CHUNK_SIZE;
                let chunk = ram.chunk(ci).ok_or(StagingError::Internal)?;
                if within + len <= chunk.len() {
                    return Ok(&chunk[within..within + len]);
                }
                copy_range(storage, offset, len, self.scratch_mut())?;
                let scratch = self.scratch.as_ref().ok_or(StagingError::Internal)?;
                Ok(&scratch[..len])
            }
            #[cfg(feature = "file")]
            Storage::File(_) => {
                {
                    let scratch = self
                        .scratch
                        .get_or_insert_with(|| Vec::with_capacity(CELL_SIZE_LIMIT));
                    scratch.resize(len, 0);
                    let reader = self.reader.as_mut().ok_or(StagingError::Internal)?;
                    reader.seek(SeekFrom::Start(offset as u64))?;
                    let got = read_up_to(reader, scratch.as_mut_slice())?;
                    if got < len {
                        return Err(StagingError::Internal);
                    }
                }
                let scratch = self.scratch.as_ref().ok_or(StagingError::Internal)?;
                Ok(&scratch[..len])
            }
        }
    }
}

/// Copies `len` bytes starting at `offset` out of RAM storage into `buf`.
/// The range covers at most two chunks.
fn copy_range(
    storage: &Storage,
    offset: usize,
    len: usize,
    buf: &mut Vec<u8>,
) -> Result<(), StagingError> {
    let Storage::Ram(ram) = storage else {
        return Err(StagingError::Internal);
    };
    buf.clear();
    let ci = offset / CHUNK_SIZE;
    let within = offset % CHUNK_SIZE;
    let chunk = ram.chunk(ci).ok_or(StagingError::Internal)?;
    let first = (chunk.len() - within).min(len);
    buf.extend_from_slice(&chunk[within..within + first]);
    if first < len {
        let next = ram.chunk(ci + 1).ok_or(StagingError::Internal)?;
        let rest = len - first;
        if rest > next.len() {
            return Err(StagingError::Internal);
        }
        buf.extend_from_slice(&next[..rest]);
    }
    Ok(())
}

#[cfg(feature = "file")]
fn read_up_to(reader: &mut File, buf: &mut [u8]) -> Result<usize, StagingError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::deserializer::Value;
    use crate::codec::serializer::Serializer;
    use crate::staging::storage::StagingSink;

    /// A storage populated through the cell encoder, as tables do it.
    fn storage_with_cells(cells: &[CellSpec]) -> Storage {
        let mut enc = Serializer::new(StagingSink::new(Storage::ram()));
        for cell in cells {
            match cell {
                CellSpec::Int(x) => enc.write_int(*x).unwrap(),
                CellSpec::Str(n) => enc.write_string(&vec![b'a'; *n]).unwrap(),
                CellSpec::Double(x) => enc.write_double(*x).unwrap(),
            }
        }
        enc.into_sink().into_storage()
    }

    enum CellSpec {
        Int(i64),
        Str(usize),
        Double(f64),
    }

    #[test]
    fn sequential_reads_with_values_and_bytes() {
        let storage = storage_with_cells(&[
            CellSpec::Int(5),
            CellSpec::Str(3),
            CellSpec::Double(0.5),
        ]);
        let mut cursor = CellCursor::new(&storage).unwrap();

        let cell = cursor.next(&storage, false).unwrap().unwrap();
        assert_eq!(cell.value.as_ref().unwrap().value, Value::Int(5));
        assert_eq!(cell.bytes.unwrap(), &[0xA4]);
        assert_eq!(cell.offset, 0);

        let cell = cursor.next(&storage, false).unwrap().unwrap();
        assert_eq!(
            cell.value.as_ref().unwrap().value,
            Value::String(b"aaa".as_slice())
        );
        assert_eq!(cell.size, 4);
        assert_eq!(cell.offset, 1);

        let cell = cursor.next(&storage, false).unwrap().unwrap();
        assert_eq!(cell.value.as_ref().unwrap().value, Value::Double(0.5));

        assert!(cursor.next(&storage, false).unwrap().is_none());
        assert_eq!(cursor.nread_objects(), 3);
        assert_eq!(cursor.nread_bytes(), storage.len());
    }

    #[test]
    fn spanning_cell_is_reassembled() {
        // Fill most of the first chunk, then write a cell that straddles
        // the boundary.
        let mut cells = Vec::new();
        let big = 60_000;
        cells.push(CellSpec::Str(big));
        cells.push(CellSpec::Str(big));
        let storage = storage_with_cells(&cells);
        let Storage::Ram(ram) = &storage else { unreachable!() };
        assert!(ram.nchunks() >= 2, "test setup must span chunks");

        let mut cursor = CellCursor::new(&storage).unwrap();
        let first = cursor.next(&storage, false).unwrap().unwrap();
        assert!(matches!(
            first.value.as_ref().unwrap().value,
            Value::String(s) if s.len() == big
        ));
        let second = cursor.next(&storage, false).unwrap().unwrap();
        assert!(matches!(
            second.value.as_ref().unwrap().value,
            Value::String(s) if s.len() == big
        ));
        assert!(cursor.next(&storage, false).unwrap().is_none());
    }

    #[test]
    fn skip_mode_reports_size_only_for_spanning_cells() {
        let big = 60_000;
        let storage = storage_with_cells(&[CellSpec::Str(big), CellSpec::Str(big)]);
        let mut cursor = CellCursor::new(&storage).unwrap();
        let first = cursor.next(&storage, true).unwrap().unwrap();
        // First cell is contiguous, so it decodes even when skipping.
        assert!(first.value.is_some());
        let second = cursor.next(&storage, true).unwrap().unwrap();
        assert!(second.value.is_none());
        assert!(second.bytes.is_none());
        assert_eq!(second.size, big + 3);
    }

    #[test]
    fn cell_bytes_refetches_by_position() {
        let storage = storage_with_cells(&[CellSpec::Int(5), CellSpec::Int(1000)]);
        let mut cursor = CellCursor::new(&storage).unwrap();
        let (off1, size1) = {
            let c = cursor.next(&storage, false).unwrap().unwrap();
            (c.offset, c.size)
        };
        let (off2, size2) = {
            let c = cursor.next(&storage, false).unwrap().unwrap();
            (c.offset, c.size)
        };
        assert_eq!(cursor.cell_bytes(&storage, off1, size1).unwrap(), &[0xA4]);
        assert_eq!(
            cursor.cell_bytes(&storage, off2, size2).unwrap(),
            &[0xE3, 0xA7]
        );
    }

    #[cfg(feature = "file")]
    #[test]
    fn file_cursor_reads_back_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.sdb");
        let mut enc = Serializer::new(StagingSink::new(
            Storage::file(path.to_str().unwrap()).unwrap(),
        ));
        enc.write_int(7).unwrap();
        enc.write_string(b"hello").unwrap();
        enc.write_double(2.5).unwrap();
        let storage = enc.into_sink().into_storage();

        let mut cursor = CellCursor::new(&storage).unwrap();
        let c = cursor.next(&storage, false).unwrap().unwrap();
        assert_eq!(c.value.as_ref().unwrap().value, Value::Int(7));
        let c = cursor.next(&storage, false).unwrap().unwrap();
        assert_eq!(
            c.value.as_ref().unwrap().value,
            Value::String(b"hello".as_slice())
        );
        let c = cursor.next(&storage, false).unwrap().unwrap();
        assert_eq!(c.value.as_ref().unwrap().value, Value::Double(2.5));
        assert!(cursor.next(&storage, false).unwrap().is_none());
    }
}
