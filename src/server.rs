//! TCP server: accept loop plus per-connection command dispatch.
//!
//! One thread polls `accept` with a short non-blocking interval so
//! shutdown is observed promptly; each accepted connection gets its own
//! worker thread for the lifetime of that connection (OS threads
//! throughout, no async I/O, matching the rest of the store).

use crate::error::KvResult;
use crate::protocol;
use crate::replication::ReplicationOp;
use crate::store::Store;
use log::{debug, error, info, warn};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Owns the listening socket and dispatches accepted connections.
pub struct Server {
    store: Store,
    host: String,
    port: u16,
}

impl Server {
    pub fn new(store: Store, host: impl Into<String>, port: u16) -> Server {
        Server {
            store,
            host: host.into(),
            port,
        }
    }

    /// Binds and serves until `shutdown` is set to `true`.
    pub fn run(&self, shutdown: Arc<AtomicBool>) -> KvResult<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)?;
        listener.set_nonblocking(true)?;
        info!(target: "kv_store::server", "listening on {}", addr);

        let poll_interval = self.store.config().accept_poll_interval;
        let mut workers = Vec::new();
        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(target: "kv_store::server", "accepted connection from {}", peer);
                    let store = self.store.clone();
                    workers.push(std::thread::spawn(move || {
                        if let Err(e) = handle_connection(store, stream) {
                            warn!(target: "kv_store::server", "connection from {} ended with error: {}", peer, e);
                        }
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(poll_interval);
                }
                Err(e) => {
                    error!(target: "kv_store::server", "accept failed: {}", e);
                    std::thread::sleep(poll_interval);
                }
            }
        }

        for handle in workers {
            let _ = handle.join();
        }
        info!(target: "kv_store::server", "server stopped");
        Ok(())
    }
}

fn handle_connection(store: Store, stream: TcpStream) -> std::io::Result<()> {
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Ok(());
        }
        let line = strip_line_endings(&buf);
        let mut reply = dispatch(&store, line);
        reply.push(b'\n');
        writer.write_all(&reply)?;
    }
}

fn strip_line_endings(buf: &[u8]) -> &[u8] {
    let mut end = buf.len();
    if end > 0 && buf[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && buf[end - 1] == b'\r' {
        end -= 1;
    }
    &buf[..end]
}

/// Parses and executes one command line, returning the reply bytes
/// (without the trailing `\n`, which the caller appends).
fn dispatch(store: &Store, line: &[u8]) -> Vec<u8> {
    let head = protocol::split_command(line, 2);
    if head.is_empty() {
        return protocol_error("empty command");
    }
    let command = String::from_utf8_lossy(head[0]).to_ascii_uppercase();

    match command.as_str() {
        "PING" => b"PONG".to_vec(),
        "STATS" => stats_reply(store),
        "PUT" => {
            let tokens = protocol::split_command(line, 3);
            if tokens.len() != 3 {
                return protocol_error("PUT requires <key> <value>");
            }
            let value = protocol::unescape(tokens[2]);
            match store.put(tokens[1], &value) {
                Ok(()) => b"OK".to_vec(),
                Err(e) => protocol_error(&e.to_string()),
            }
        }
        "BATCHPUT" => {
            let tokens = protocol::split_command(line, 3);
            if tokens.len() != 3 {
                return protocol_error("BATCHPUT requires <keys> <values>");
            }
            let keys = protocol::split_raw(tokens[1]);
            let values = protocol::split_batch(tokens[2]);
            match store.batch_put(&keys, &values) {
                Ok(()) => b"OK".to_vec(),
                Err(e) => protocol_error(&e.to_string()),
            }
        }
        "READ" => {
            let tokens = protocol::split_command(line, 2);
            if tokens.len() != 2 {
                return protocol_error("READ requires <key>");
            }
            match store.read(tokens[1]) {
                Ok(Some(value)) => protocol::escape(&value),
                Ok(None) => b"NOT_FOUND".to_vec(),
                Err(e) => protocol_error(&e.to_string()),
            }
        }
        "READRANGE" => {
            let tokens = protocol::split_command(line, 3);
            if tokens.len() != 3 {
                return protocol_error("READRANGE requires <start> <end>");
            }
            match store.range(tokens[1], tokens[2]) {
                Ok(entries) if entries.is_empty() => b"NOT_FOUND".to_vec(),
                Ok(entries) => {
                    let mut flat = Vec::with_capacity(entries.len() * 2);
                    for (k, v) in entries {
                        flat.push(k);
                        flat.push(protocol::escape(&v));
                    }
                    protocol::join_raw(&flat)
                }
                Err(e) => protocol_error(&e.to_string()),
            }
        }
        "DELETE" => {
            let tokens = protocol::split_command(line, 2);
            if tokens.len() != 2 {
                return protocol_error("DELETE requires <key>");
            }
            match store.delete(tokens[1]) {
                Ok(true) => b"OK".to_vec(),
                Ok(false) => b"NOT_FOUND".to_vec(),
                Err(e) => protocol_error(&e.to_string()),
            }
        }
        "REPLICATE" => dispatch_replicate(store, line),
        other => protocol_error(&format!("unknown command '{}'", other)),
    }
}

fn dispatch_replicate(store: &Store, line: &[u8]) -> Vec<u8> {
    let tokens = protocol::split_command(line, 3);
    if tokens.len() < 2 {
        return protocol_error("REPLICATE requires a subcommand");
    }
    let subcommand = String::from_utf8_lossy(tokens[1]).to_ascii_uppercase();
    let rest = tokens.get(2).copied().unwrap_or(b"");

    let op = match subcommand.as_str() {
        "PUT" => {
            let sub = protocol::split_command(rest, 2);
            if sub.len() != 2 {
                return protocol_error("REPLICATE PUT requires <key> <value>");
            }
            ReplicationOp::Put {
                key: sub[0].to_vec(),
                value: protocol::unescape(sub[1]),
            }
        }
        "DELETE" => {
            if rest.is_empty() {
                return protocol_error("REPLICATE DELETE requires <key>");
            }
            ReplicationOp::Delete { key: rest.to_vec() }
        }
        "BATCHPUT" => {
            let sub = protocol::split_command(rest, 2);
            if sub.len() != 2 {
                return protocol_error("REPLICATE BATCHPUT requires <keys> <values>");
            }
            ReplicationOp::BatchPut {
                keys: protocol::split_raw(sub[0]),
                values: protocol::split_batch(sub[1]),
            }
        }
        other => return protocol_error(&format!("unknown REPLICATE subcommand '{}'", other)),
    };

    match store.apply_replicated(op) {
        Ok(()) => b"OK".to_vec(),
        Err(e) => protocol_error(&e.to_string()),
    }
}

fn stats_reply(store: &Store) -> Vec<u8> {
    let snapshot = store.metrics_snapshot();
    let mut line = String::new();
    for (i, (key, value)) in snapshot.iter().enumerate() {
        if i > 0 {
            line.push(' ');
        }
        line.push_str(&format!("{}={}", key, value));
    }
    protocol::escape(line.as_bytes())
}

fn protocol_error(message: &str) -> Vec<u8> {
    let mut out = b"ERROR: ".to_vec();
    out.extend_from_slice(message.as_bytes());
    out
}
