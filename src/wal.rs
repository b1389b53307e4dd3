//! Write-ahead log: the durable record of not-yet-checkpointed mutations.
//!
//! Framing per entry: `[entry_length: u32 BE][payload]`, where `payload`
//! is `[op: u8][key_len: u32 BE][key][value_present: u8][value_len: u32
//! BE][value]?[timestamp_micros: u64 BE]`. This is a small explicit
//! binary format rather than a general-purpose object serializer, per the
//! design note in the top-level specification: self-describing via the op
//! tag, and stable across process restarts without depending on any
//! particular language's reflection.

use crate::error::{io_err, KvResult};
use log::warn;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// One WAL operation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOp {
    Put,
    Delete,
}

/// One replayed WAL entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    pub op: WalOp,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub timestamp_micros: u64,
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

fn encode_entry(op: WalOp, key: &[u8], value: Option<&[u8]>) -> Vec<u8> {
    let mut payload = Vec::with_capacity(14 + key.len() + value.map_or(0, |v| v.len()));
    payload.push(match op {
        WalOp::Put => 0u8,
        WalOp::Delete => 1u8,
    });
    payload.extend_from_slice(&(key.len() as u32).to_be_bytes());
    payload.extend_from_slice(key);
    match value {
        Some(v) => {
            payload.push(1u8);
            payload.extend_from_slice(&(v.len() as u32).to_be_bytes());
            payload.extend_from_slice(v);
        }
        None => payload.push(0u8),
    }
    payload.extend_from_slice(&now_micros().to_be_bytes());

    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(&payload);
    framed
}

/// Parses one entry's payload (without the leading length prefix).
/// Returns `None` if `bytes` is shorter than the fields it declares —
/// callers treat that as a torn tail write, not a hard error.
fn decode_payload(bytes: &[u8]) -> Option<WalEntry> {
    if bytes.is_empty() {
        return None;
    }
    let op = match bytes[0] {
        0 => WalOp::Put,
        1 => WalOp::Delete,
        _ => return None,
    };
    let mut pos = 1usize;
    if bytes.len() < pos + 4 {
        return None;
    }
    let key_len = u32::from_be_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
    pos += 4;
    if bytes.len() < pos + key_len {
        return None;
    }
    let key = bytes[pos..pos + key_len].to_vec();
    pos += key_len;

    if bytes.len() < pos + 1 {
        return None;
    }
    let has_value = bytes[pos] == 1;
    pos += 1;
    let value = if has_value {
        if bytes.len() < pos + 4 {
            return None;
        }
        let value_len = u32::from_be_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if bytes.len() < pos + value_len {
            return None;
        }
        let v = bytes[pos..pos + value_len].to_vec();
        pos += value_len;
        Some(v)
    } else {
        None
    };

    if bytes.len() < pos + 8 {
        return None;
    }
    let timestamp_micros = u64::from_be_bytes(bytes[pos..pos + 8].try_into().unwrap());

    Some(WalEntry {
        op,
        key,
        value,
        timestamp_micros,
    })
}

/// One open write-ahead log.
pub struct Wal {
    path: PathBuf,
    file: File,
}

impl Wal {
    /// Opens (creating if absent) the WAL for appending.
    pub fn open(path: impl Into<PathBuf>) -> KvResult<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .map_err(|e| io_err("open_wal", e))?;
        Ok(Wal { path, file })
    }

    /// Appends one framed entry and `fsync`s before returning.
    pub fn log(&mut self, op: WalOp, key: &[u8], value: Option<&[u8]>) -> KvResult<()> {
        let framed = encode_entry(op, key, value);
        self.file.write_all(&framed).map_err(|e| io_err("append_wal", e))?;
        self.file.sync_all().map_err(|e| io_err("fsync_wal", e))?;
        Ok(())
    }

    /// Reads every complete entry from the beginning of the file, in
    /// write order. A zero-length file yields an empty sequence. A
    /// partial tail entry (a length prefix with insufficient payload
    /// behind it) indicates a crash mid-write and is silently dropped.
    pub fn replay(&mut self) -> KvResult<Vec<WalEntry>> {
        let mut buf = Vec::new();
        {
            let mut reader = File::open(&self.path).map_err(|e| io_err("open_wal_for_replay", e))?;
            reader.read_to_end(&mut buf).map_err(|e| io_err("read_wal", e))?;
        }

        let mut entries = Vec::new();
        let mut pos = 0usize;
        while pos + 4 <= buf.len() {
            let entry_len = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            let payload_start = pos + 4;
            let payload_end = payload_start + entry_len;
            if payload_end > buf.len() {
                warn!(
                    target: "kv_store::wal",
                    "discarding partial WAL tail at byte {} ({} bytes expected, {} available)",
                    pos,
                    entry_len,
                    buf.len() - payload_start.min(buf.len())
                );
                break;
            }
            match decode_payload(&buf[payload_start..payload_end]) {
                Some(entry) => entries.push(entry),
                None => {
                    warn!(
                        target: "kv_store::wal",
                        "discarding malformed WAL entry at byte {}",
                        pos
                    );
                    break;
                }
            }
            pos = payload_end;
        }
        Ok(entries)
    }

    /// Closes, re-creates as empty, and re-opens for append.
    pub fn truncate(&mut self) -> KvResult<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .read(true)
            .open(&self.path)
            .map_err(|e| io_err("truncate_wal", e))?;
        self.file = file;
        Ok(())
    }

    /// Flushes and releases the file handle.
    pub fn close(self) -> KvResult<()> {
        self.file.sync_all().map_err(|e| io_err("close_wal", e))?;
        Ok(())
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
    fn replay_empty_file_is_empty() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path().join("wal.log")).unwrap();
        assert!(wal.replay().unwrap().is_empty());
    }

    #[test]
    fn replay_returns_entries_in_write_order() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path().join("wal.log")).unwrap();

        wal.log(WalOp::Put, b"a", Some(b"1")).unwrap();
        wal.log(WalOp::Put, b"b", Some(b"2")).unwrap();
        wal.log(WalOp::Delete, b"a", None).unwrap();

        let entries = wal.replay().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].op, WalOp::Put);
        assert_eq!(entries[0].key, b"a");
        assert_eq!(entries[0].value, Some(b"1".to_vec()));
        assert_eq!(entries[2].op, WalOp::Delete);
        assert_eq!(entries[2].value, None);
    }

    #[test]
    fn truncate_clears_the_log() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path().join("wal.log")).unwrap();
        wal.log(WalOp::Put, b"a", Some(b"1")).unwrap();
        wal.truncate().unwrap();
        assert!(wal.replay().unwrap().is_empty());
    }

    #[test]
    fn partial_tail_write_is_dropped_not_errored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.log(WalOp::Put, b"a", Some(b"1")).unwrap();
        }
        // Simulate a crash mid-write: a length prefix claiming more bytes
        // than are actually present.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&100u32.to_be_bytes()).unwrap();
            file.write_all(b"short").unwrap();
        }

        let mut wal = Wal::open(&path).unwrap();
        let entries = wal.replay().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, b"a");
    }
}
