//! Argument-surface tests: these only exercise `--help` and basic
//! argument validation, not a running server.

use std::env;
use std::path::PathBuf;
use std::process::{Command, Output};

fn exe_path(name: &str) -> PathBuf {
    let bin_dir = env::current_exe()
        .unwrap()
        .parent()
        .expect("test executable's directory")
        .parent()
        .expect("output directory")
        .to_path_buf();
    bin_dir.join(name)
}

fn cmd_stdout(out: Output) -> String {
    String::from_utf8(out.stdout).expect("non utf-8 output")
}

#[test]
fn test_server_help_flag() {
    let out = Command::new(exe_path("flexnbd")).arg("--help").output().expect("failed to run flexnbd --help");
    let stdout = cmd_stdout(out);
    assert!(stdout.contains("flexnbd"));
}

#[test]
fn test_serve_subcommand_help() {
    let out = Command::new(exe_path("flexnbd"))
        .args(["serve", "--help"])
        .output()
        .expect("failed to run flexnbd serve --help");
    let stdout = cmd_stdout(out);
    assert!(stdout.contains("control-socket") || stdout.contains("control_socket"));
}

#[test]
fn test_mirror_subcommand_rejects_bad_action() {
    let out = Command::new(exe_path("flexnbd"))
        .args(["mirror", "/tmp/does-not-matter.sock", "127.0.0.1", "10900", "not-a-real-action"])
        .output()
        .expect("failed to run flexnbd mirror");
    assert!(!out.status.success());
}

#[test]
fn test_proxy_help_flag() {
    let out = Command::new(exe_path("flexnbd-proxy"))
        .arg("--help")
        .output()
        .expect("failed to run flexnbd-proxy --help");
    let stdout = cmd_stdout(out);
    assert!(stdout.contains("proxy"));
}
