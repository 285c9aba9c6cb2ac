//! End-to-end tests that spawn the real `flexnbd` binary against an
//! ephemeral TCP port and a scratch backing file, exactly the way a
//! user would run it.

use std::env;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::thread::sleep;
use std::time::Duration;

fn exe_path(name: &str) -> PathBuf {
    env::current_exe().unwrap().parent().expect("dir").parent().expect("dir").join(name)
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

struct ServerGuard {
    child: Child,
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn start_server(port: u16, control_socket: &str, filename: &str) -> ServerGuard {
    let child = Command::new(exe_path("flexnbd"))
        .args([
            "serve",
            "127.0.0.1",
            &port.to_string(),
            filename,
            "--size-mb",
            "1",
            "--create",
            "--control-socket",
            control_socket,
        ])
        .spawn()
        .expect("failed to start flexnbd serve");
    sleep(Duration::from_millis(150));
    ServerGuard { child }
}

fn control_roundtrip(path: &str, lines: &[&str]) -> String {
    let mut stream = UnixStream::connect(path).expect("connect control socket");
    for line in lines {
        writeln!(stream, "{line}").unwrap();
    }
    writeln!(stream).unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

#[test]
fn write_then_read_round_trips_over_real_binaries() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let filename = tmp.path().to_str().unwrap().to_string();
    let control_socket = format!("{}.ctl", filename);
    let port = free_port();
    let _server = start_server(port, &control_socket, &filename);

    let status = Command::new(exe_path("flexnbd"))
        .args(["write", "127.0.0.1", &port.to_string(), "0", "11"])
        .stdin(std::process::Stdio::piped())
        .spawn()
        .and_then(|mut child| {
            child.stdin.take().unwrap().write_all(b"hello world").unwrap();
            child.wait()
        })
        .unwrap();
    assert!(status.success());

    let out = Command::new(exe_path("flexnbd")).args(["read", "127.0.0.1", &port.to_string(), "0", "11"]).output().unwrap();
    assert!(out.status.success());
    assert_eq!(&out.stdout, b"hello world");

    let _ = std::fs::remove_file(&control_socket);
}

#[test]
fn status_reports_size_and_no_migration_when_idle() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let filename = tmp.path().to_str().unwrap().to_string();
    let control_socket = format!("{}.ctl", filename);
    let port = free_port();
    let _server = start_server(port, &control_socket, &filename);

    let response = control_roundtrip(&control_socket, &["status"]);
    assert!(response.starts_with("0:"));
    assert!(response.contains("size=1048576"));
    assert!(!response.contains("migration"));

    let _ = std::fs::remove_file(&control_socket);
}

#[test]
fn break_with_no_mirror_running_is_reported_cleanly() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let filename = tmp.path().to_str().unwrap().to_string();
    let control_socket = format!("{}.ctl", filename);
    let port = free_port();
    let _server = start_server(port, &control_socket, &filename);

    let response = control_roundtrip(&control_socket, &["break"]);
    assert!(response.starts_with("0:"));
    assert!(response.contains("no mirror running"));

    let _ = std::fs::remove_file(&control_socket);
}

#[test]
fn acl_deny_list_rejects_client_outside_it() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let filename = tmp.path().to_str().unwrap().to_string();
    let control_socket = format!("{}.ctl", filename);
    let port = free_port();
    let _server = start_server(port, &control_socket, &filename);

    // restrict to a CIDR that excludes loopback
    let response = control_roundtrip(&control_socket, &["acl", "10.0.0.0/8"]);
    assert!(response.starts_with("0:"));

    let out = Command::new(exe_path("flexnbd")).args(["read", "127.0.0.1", &port.to_string(), "0", "1"]).output().unwrap();
    assert!(!out.status.success());

    let _ = std::fs::remove_file(&control_socket);
}
