//! Synchronous TCP client for the wire protocol, shared by the
//! `kv-client` binary and available for embedding in other programs.

use crate::error::{KvError, KvResult};
use crate::protocol;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::Duration;

/// One connection to a `kv-server` instance.
pub struct Client {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Client {
    /// Connects to `host:port`.
    pub fn connect(host: &str, port: u16) -> KvResult<Client> {
        let stream = TcpStream::connect((host, port))?;
        let reader_stream = stream.try_clone()?;
        Ok(Client {
            writer: stream,
            reader: BufReader::new(reader_stream),
        })
    }

    /// Sets a read/write timeout on the underlying socket.
    pub fn set_timeout(&mut self, timeout: Duration) -> KvResult<()> {
        self.writer.set_read_timeout(Some(timeout))?;
        self.writer.set_write_timeout(Some(timeout))?;
        Ok(())
    }

    fn roundtrip(&mut self, command: &[u8]) -> KvResult<Vec<u8>> {
        self.writer.write_all(command)?;
        self.writer.write_all(b"\n")?;
        let mut line = Vec::new();
        self.reader.read_until(b'\n', &mut line)?;
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(line)
    }

    fn roundtrip_text(&mut self, command: &[u8]) -> KvResult<String> {
        let reply = self.roundtrip(command)?;
        reply_or_error(reply)
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> KvResult<()> {
        let mut command = b"PUT ".to_vec();
        command.extend_from_slice(key);
        command.push(b' ');
        command.extend_from_slice(&protocol::escape(value));
        expect_ok(self.roundtrip_text(&command)?)
    }

    pub fn batch_put(&mut self, keys: &[Vec<u8>], values: &[Vec<u8>]) -> KvResult<()> {
        let mut command = b"BATCHPUT ".to_vec();
        command.extend_from_slice(&protocol::join_raw(keys));
        command.push(b' ');
        command.extend_from_slice(&protocol::join_batch(values));
        expect_ok(self.roundtrip_text(&command)?)
    }

    pub fn read(&mut self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        let mut command = b"READ ".to_vec();
        command.extend_from_slice(key);
        let reply = self.roundtrip(&command)?;
        if reply == b"NOT_FOUND" {
            return Ok(None);
        }
        if reply.starts_with(b"ERROR: ") {
            return Err(server_error(&reply));
        }
        Ok(Some(protocol::unescape(&reply)))
    }

    pub fn read_range(&mut self, start: &[u8], end: &[u8]) -> KvResult<BTreeMap<Vec<u8>, Vec<u8>>> {
        let mut command = b"READRANGE ".to_vec();
        command.extend_from_slice(start);
        command.push(b' ');
        command.extend_from_slice(end);
        let reply = self.roundtrip(&command)?;
        if reply == b"NOT_FOUND" {
            return Ok(BTreeMap::new());
        }
        if reply.starts_with(b"ERROR: ") {
            return Err(server_error(&reply));
        }
        let flat = protocol::split_raw(&reply);
        let mut out = BTreeMap::new();
        let mut iter = flat.into_iter();
        while let (Some(key), Some(escaped_value)) = (iter.next(), iter.next()) {
            out.insert(key, protocol::unescape(&escaped_value));
        }
        Ok(out)
    }

    pub fn delete(&mut self, key: &[u8]) -> KvResult<bool> {
        let mut command = b"DELETE ".to_vec();
        command.extend_from_slice(key);
        let reply = self.roundtrip(&command)?;
        match reply.as_slice() {
            b"OK" => Ok(true),
            b"NOT_FOUND" => Ok(false),
            _ if reply.starts_with(b"ERROR: ") => Err(server_error(&reply)),
            _ => Err(KvError::ProtocolError {
                message: "unexpected DELETE reply".to_string(),
            }),
        }
    }

    pub fn ping(&mut self) -> KvResult<bool> {
        let reply = self.roundtrip(b"PING")?;
        Ok(reply == b"PONG")
    }

    pub fn stats(&mut self) -> KvResult<String> {
        let reply = self.roundtrip(b"STATS")?;
        Ok(String::from_utf8_lossy(&protocol::unescape(&reply)).into_owned())
    }
}

fn reply_or_error(reply: Vec<u8>) -> KvResult<String> {
    if reply.starts_with(b"ERROR: ") {
        return Err(server_error(&reply));
    }
    Ok(String::from_utf8_lossy(&reply).into_owned())
}

fn expect_ok(reply: String) -> KvResult<()> {
    if reply == "OK" {
        Ok(())
    } else {
        Err(KvError::ProtocolError {
            message: format!("unexpected reply '{}'", reply),
        })
    }
}

fn server_error(reply: &[u8]) -> KvError {
    let message = String::from_utf8_lossy(&reply[b"ERROR: ".len()..]).into_owned();
    KvError::ProtocolError { message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::Store;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn start_test_server(port: u16) -> (Store, Arc<AtomicBool>, std::thread::JoinHandle<()>) {
        let dir = tempdir().unwrap();
        // Leak the tempdir so it outlives the server thread in this test helper.
        let path = dir.into_path();
        let store = Store::open(Config::new(&path)).unwrap();
        let server_store = store.clone();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);
        let handle = std::thread::spawn(move || {
            let server = crate::server::Server::new(server_store, "127.0.0.1", port);
            server.run(shutdown_clone).unwrap();
        });
        std::thread::sleep(Duration::from_millis(100));
        (store, shutdown, handle)
    }

    #[test]
    fn put_read_delete_round_trip_over_tcp() {
        let (store, shutdown, handle) = start_test_server(18881);
        let mut client = Client::connect("127.0.0.1", 18881).unwrap();

        assert!(client.ping().unwrap());
        client.put(b"k1", b"v1").unwrap();
        assert_eq!(client.read(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert!(client.delete(b"k1").unwrap());
        assert_eq!(client.read(b"k1").unwrap(), None);

        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap();
        store.close();
    }

    #[test]
    fn batch_put_and_range_over_tcp() {
        let (store, shutdown, handle) = start_test_server(18882);
        let mut client = Client::connect("127.0.0.1", 18882).unwrap();

        client
            .batch_put(&[b"a".to_vec(), b"b".to_vec()], &[b"1".to_vec(), b"2".to_vec()])
            .unwrap();
        let range = client.read_range(b"a", b"b").unwrap();
        assert_eq!(range.get(b"a".as_slice()), Some(&b"1".to_vec()));

        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap();
        store.close();
    }
}
