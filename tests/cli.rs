//! Exercises the `kv-server` / `kv-client` binaries as separate processes,
//! the way an operator would actually run them.

use assert_cmd::Command;
use serial_test::serial;
use std::process::{Child, Command as StdCommand};
use std::time::Duration;

struct ServerProcess {
    child: Child,
    data_dir: tempfile::TempDir,
}

impl ServerProcess {
    fn spawn(port: u16) -> ServerProcess {
        let data_dir = tempfile::tempdir().unwrap();
        let child = StdCommand::new(assert_cmd::cargo::cargo_bin("kv-server"))
            .arg("--port")
            .arg(port.to_string())
            .arg("--data-dir")
            .arg(data_dir.path())
            .spawn()
            .expect("failed to spawn kv-server");
        std::thread::sleep(Duration::from_millis(300));
        ServerProcess { child, data_dir }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
#[serial]
fn put_then_read_via_cli_round_trips() {
    let server = ServerProcess::spawn(19201);

    Command::cargo_bin("kv-client")
        .unwrap()
        .args(["--port", "19201", "put", "greeting", "hello world"])
        .assert()
        .success()
        .stdout(predicates::str::contains("OK"));

    Command::cargo_bin("kv-client")
        .unwrap()
        .args(["--port", "19201", "read", "greeting"])
        .assert()
        .success()
        .stdout(predicates::str::contains("hello world"));

    drop(server);
}

#[test]
#[serial]
fn reading_an_absent_key_prints_not_found() {
    let server = ServerProcess::spawn(19202);

    Command::cargo_bin("kv-client")
        .unwrap()
        .args(["--port", "19202", "read", "absent"])
        .assert()
        .success()
        .stdout(predicates::str::contains("NOT_FOUND"));

    drop(server);
}

#[test]
#[serial]
fn connecting_to_a_closed_port_is_a_client_error_exit_code() {
    let server = ServerProcess::spawn(19203);

    // Nothing listens on 19298; this is a connection failure, which the
    // client maps to exit code 1 (as opposed to a server-reported ERROR
    // reply, which maps to exit code 2).
    Command::cargo_bin("kv-client")
        .unwrap()
        .args(["--port", "19298", "ping"])
        .assert()
        .failure()
        .code(1);

    drop(server);
}
