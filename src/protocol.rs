//! Line-based wire protocol shared by the server and the client library.
//!
//! One command per line, `\n`-terminated; batch payloads are joined with
//! the two-byte separator `||`; arbitrary value bytes are backslash
//! escaped so they survive the `\n`-delimited framing. Everything here
//! operates on raw bytes rather than `String` — keys and values are
//! opaque binary data and need not be valid UTF-8.

pub const BATCH_SEPARATOR: &[u8] = b"||";

/// Escapes `\`, `\n`, `\r`, and `\t`. Every other byte, including
/// non-ASCII bytes, passes through unchanged — the wire format is framed
/// by `\n` and by whitespace-splitting on a bounded number of leading
/// tokens, so raw high bytes never need escaping of their own.
pub fn escape(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            _ => out.push(b),
        }
    }
    out
}

/// Inverse of [`escape`]. Scans left to right consuming one escape
/// sequence at a time, so a literal `\\n` (an escaped backslash
/// immediately followed by the letter `n`) is never mistaken for an
/// escaped newline — unlike a chain of global substitutions, which would
/// conflate the two.
pub fn unescape(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            match bytes[i + 1] {
                b'\\' => out.push(b'\\'),
                b'n' => out.push(b'\n'),
                b'r' => out.push(b'\r'),
                b't' => out.push(b'\t'),
                other => {
                    // Not a recognized escape: keep both bytes verbatim.
                    out.push(b'\\');
                    out.push(other);
                }
            }
            i += 2;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    out
}

/// Joins escaped values with [`BATCH_SEPARATOR`].
pub fn join_batch(values: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            out.extend_from_slice(BATCH_SEPARATOR);
        }
        out.extend_from_slice(&escape(v));
    }
    out
}

/// Splits a batch token on [`BATCH_SEPARATOR`] and unescapes each
/// element. An empty token yields an empty vector (not a single empty
/// element).
pub fn split_batch(token: &[u8]) -> Vec<Vec<u8>> {
    if token.is_empty() {
        return Vec::new();
    }
    split_on(token, BATCH_SEPARATOR)
        .into_iter()
        .map(unescape)
        .collect()
}

/// Joins raw (unescaped) parts with [`BATCH_SEPARATOR`]. Used for keys,
/// which the wire protocol carries verbatim rather than escaped —
/// unlike values, keys are never expected to contain the separator
/// bytes in practice.
pub fn join_raw(parts: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, p) in parts.iter().enumerate() {
        if i > 0 {
            out.extend_from_slice(BATCH_SEPARATOR);
        }
        out.extend_from_slice(p);
    }
    out
}

/// Splits on [`BATCH_SEPARATOR`] without unescaping, the counterpart of
/// [`join_raw`]. An empty token yields an empty vector.
pub fn split_raw(token: &[u8]) -> Vec<Vec<u8>> {
    if token.is_empty() {
        return Vec::new();
    }
    split_on(token, BATCH_SEPARATOR)
        .into_iter()
        .map(|s| s.to_vec())
        .collect()
}

fn split_on<'a>(haystack: &'a [u8], needle: &[u8]) -> Vec<&'a [u8]> {
    let mut out = Vec::new();
    let mut rest = haystack;
    loop {
        match find_subslice(rest, needle) {
            Some(pos) => {
                out.push(&rest[..pos]);
                rest = &rest[pos + needle.len()..];
            }
            None => {
                out.push(rest);
                break;
            }
        }
    }
    out
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Splits one command line into at most `max_tokens` whitespace-delimited
/// tokens, where the final token runs to the end of the line verbatim
/// (so a value token may itself contain raw spaces without being split
/// further).
pub fn split_command(line: &[u8], max_tokens: usize) -> Vec<&[u8]> {
    let mut tokens = Vec::new();
    let mut rest = line;
    while tokens.len() + 1 < max_tokens {
        match rest.iter().position(|&b| b == b' ') {
            Some(pos) => {
                tokens.push(&rest[..pos]);
                rest = &rest[pos + 1..];
            }
            None => break,
        }
    }
    if !rest.is_empty() || !tokens.is_empty() {
        tokens.push(rest);
    }
    tokens
}
