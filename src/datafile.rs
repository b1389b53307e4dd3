//! Append-only data file backing the live key/value records.
//!
//! Writes go through a buffered `File` handle opened in append mode; reads
//! go through a read-only `memmap2::Mmap` that is replaced after every
//! append so the mapping always covers the current tail. Callers are
//! expected to hold the store's shared-exclusive lock around every call —
//! this type performs no internal synchronization of its own.

use crate::error::{io_err, KvError, KvResult};
use crate::record::{decode, encode};
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// One open append-only data file.
pub struct DataFile {
    path: PathBuf,
    file: File,
    size: u64,
    mmap: Option<Mmap>,
}

impl DataFile {
    /// Opens (creating if absent) the data file at `path` and maps its
    /// current contents for reading.
    pub fn open(path: impl Into<PathBuf>) -> KvResult<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_err("open_data_file", e))?;
        let size = file.metadata().map_err(|e| io_err("stat_data_file", e))?.len();
        let mut data_file = DataFile {
            path,
            file,
            size,
            mmap: None,
        };
        data_file.remap()?;
        Ok(data_file)
    }

    fn remap(&mut self) -> KvResult<()> {
        if self.size == 0 {
            self.mmap = None;
            return Ok(());
        }
        // Map from a fresh read handle; the append-mode `self.file` handle
        // is not used for reads, only appends.
        let read_file = File::open(&self.path).map_err(|e| io_err("reopen_for_mmap", e))?;
        let mmap = unsafe { Mmap::map(&read_file) }.map_err(|e| io_err("mmap_data_file", e))?;
        self.mmap = Some(mmap);
        Ok(())
    }

    /// Appends one record and `fsync`s before returning, so the write is
    /// durable by the time the caller observes success.
    ///
    /// ## Output
    /// `(offset, length)` of the newly written record.
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> KvResult<(u64, u64)> {
        let bytes = encode(key, value);
        let offset = self.size;
        let len = bytes.len() as u64;

        self.file.write_all(&bytes).map_err(|e| io_err("append_data", e))?;
        self.file.sync_all().map_err(|e| io_err("fsync_data", e))?;

        self.size += len;
        self.remap()?;

        Ok((offset, len))
    }

    /// Reads the record at `offset`.
    ///
    /// ## Error Conditions
    /// - `RecordOutOfBounds`: `offset` (or the record it points at) falls
    ///   outside the current mapping; this indicates index/data
    ///   divergence and is treated as fatal by callers.
    pub fn read(&self, offset: u64, length: u64) -> KvResult<(Vec<u8>, Vec<u8>)> {
        let mmap = self.mmap.as_ref().ok_or(KvError::RecordOutOfBounds {
            offset,
            file_size: self.size,
        })?;
        let start = offset as usize;
        let end = start
            .checked_add(length as usize)
            .ok_or(KvError::RecordOutOfBounds {
                offset,
                file_size: self.size,
            })?;
        if end > mmap.len() {
            return Err(KvError::RecordOutOfBounds {
                offset,
                file_size: self.size,
            });
        }
        decode(&mmap[start..end])
    }

    /// Current byte length of the data file.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let mut df = DataFile::open(dir.path().join("data.db")).unwrap();

        let (o1, l1) = df.append(b"k1", b"v1").unwrap();
        let (o2, l2) = df.append(b"k2", b"v2").unwrap();

        let (k, v) = df.read(o1, l1).unwrap();
        assert_eq!(k, b"k1");
        assert_eq!(v, b"v1");

        let (k, v) = df.read(o2, l2).unwrap();
        assert_eq!(k, b"k2");
        assert_eq!(v, b"v2");
    }

    #[test]
    fn read_past_eof_is_an_error() {
        let dir = tempdir().unwrap();
        let mut df = DataFile::open(dir.path().join("data.db")).unwrap();
        df.append(b"k", b"v").unwrap();

        assert!(df.read(1000, 10).is_err());
    }

    #[test]
    fn reopen_sees_prior_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        {
            let mut df = DataFile::open(&path).unwrap();
            df.append(b"k", b"v").unwrap();
        }
        let df = DataFile::open(&path).unwrap();
        assert_eq!(df.size(), 8 + 1 + 1);
        let (k, v) = df.read(0, df.size()).unwrap();
        assert_eq!(k, b"k");
        assert_eq!(v, b"v");
    }
}
