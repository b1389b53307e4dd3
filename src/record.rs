//! On-disk record framing for the append-only data file.
//!
//! `[key_length: u32 BE][key bytes][value_length: u32 BE][value bytes]`

use crate::error::{KvError, KvResult};

/// Encodes one key/value record into its on-disk representation.
pub fn encode(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + key.len() + value.len());
    buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value);
    buf
}

/// Total byte length a record for `key`/`value` would occupy on disk.
pub fn encoded_len(key: &[u8], value: &[u8]) -> u64 {
    8 + key.len() as u64 + value.len() as u64
}

/// Decodes one record from a byte slice that begins exactly at the
/// record's first byte.
///
/// ## Error Conditions
/// - `CorruptedLog`: the slice is shorter than the length prefixes claim.
pub fn decode(bytes: &[u8]) -> KvResult<(Vec<u8>, Vec<u8>)> {
    if bytes.len() < 4 {
        return Err(KvError::CorruptedLog {
            reason: "record shorter than key-length prefix".to_string(),
        });
    }
    let key_len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let key_start = 4;
    let key_end = key_start + key_len;
    if bytes.len() < key_end + 4 {
        return Err(KvError::CorruptedLog {
            reason: "record shorter than key bytes + value-length prefix".to_string(),
        });
    }
    let key = bytes[key_start..key_end].to_vec();
    let value_len = u32::from_be_bytes(bytes[key_end..key_end + 4].try_into().unwrap()) as usize;
    let value_start = key_end + 4;
    let value_end = value_start + value_len;
    if bytes.len() < value_end {
        return Err(KvError::CorruptedLog {
            reason: "record shorter than declared value length".to_string(),
        });
    }
    let value = bytes[value_start..value_end].to_vec();
    Ok((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_bytes() {
        let key = b"some\x00key";
        let value = b"";
        let encoded = encode(key, value);
        assert_eq!(encoded.len() as u64, encoded_len(key, value));
        let (k, v) = decode(&encoded).unwrap();
        assert_eq!(k, key);
        assert_eq!(v, value);
    }

    #[test]
    fn rejects_truncated_record() {
        let encoded = encode(b"key", b"value");
        let err = decode(&encoded[..encoded.len() - 2]);
        assert!(err.is_err());
    }

    #[test]
    fn empty_key_and_value_permitted() {
        let encoded = encode(b"", b"");
        assert_eq!(encoded.len(), 8);
        let (k, v) = decode(&encoded).unwrap();
        assert!(k.is_empty());
        assert!(v.is_empty());
    }
}
