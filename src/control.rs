//! UNIX-domain control socket: a line-oriented protocol for `acl`,
//! `mirror`, `mirror_max_bps`, `break`, and `status`. Accepts one client
//! at a time; each connection is read to a blank line, dispatched, and
//! answered with a single `<code>: <message>` line.

use crate::acl::Acl;
use crate::error::ControlError;
use crate::mirror::FinishAction;
use crate::server::Server;
use log::{info, warn};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;

/// Run the control socket accept loop on the calling thread (spawned by
/// `main` as a dedicated control thread when serving, never in `listen`
/// mode).
pub fn run(server: Arc<Server>, path: &Path) -> std::io::Result<()> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    info!(target: "control", "listening on {}", path.display());
    for conn in listener.incoming() {
        match conn {
            Ok(stream) => handle_connection(&server, stream),
            Err(e) => warn!(target: "control", "accept failed: {e}"),
        }
    }
    Ok(())
}

fn handle_connection(server: &Arc<Server>, stream: UnixStream) {
    let mut reader = BufReader::new(stream.try_clone().expect("clone control stream"));
    let mut writer = stream;
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => return,
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\n', '\r']);
                if trimmed.is_empty() {
                    break;
                }
                lines.push(trimmed.to_string());
            }
            Err(e) => {
                warn!(target: "control", "read failed: {e}");
                return;
            }
        }
    }
    if lines.is_empty() {
        return;
    }
    let response = dispatch(server, &lines);
    let _ = writeln!(writer, "{response}");
}

fn dispatch(server: &Arc<Server>, lines: &[String]) -> String {
    let cmd = lines[0].as_str();
    let args = &lines[1..];
    let result = match cmd {
        "acl" => do_acl(server, args),
        "mirror" => do_mirror(server, args),
        "mirror_max_bps" => do_mirror_max_bps(server, args),
        "break" => do_break(server),
        "status" => Ok(crate::status::gather(server).format_line()),
        other => Err(ControlError::UnknownCommand(other.to_string())),
    };
    match result {
        Ok(msg) => format!("0: {msg}"),
        Err(e) => format!("1: {e}"),
    }
}

fn do_acl(server: &Arc<Server>, args: &[String]) -> Result<String, ControlError> {
    let mut acl = Acl::new(true);
    acl.set_entries(args).map_err(|e| ControlError::BadArgument(e.to_string()))?;
    server.replace_acl(acl);
    Ok(format!("acl updated with {} entries", args.len()))
}

fn do_mirror(server: &Arc<Server>, args: &[String]) -> Result<String, ControlError> {
    if args.len() < 3 {
        return Err(ControlError::WrongArity("mirror"));
    }
    let addr: std::net::IpAddr = args[0].parse().map_err(|_| ControlError::BadArgument(args[0].clone()))?;
    let port: u16 = args[1].parse().map_err(|_| ControlError::BadArgument(args[1].clone()))?;
    let connect_to = std::net::SocketAddr::new(addr, port);
    let action = match args[2].as_str() {
        "exit" => FinishAction::Exit,
        "unlink" => FinishAction::Unlink,
        "nothing" => FinishAction::Nothing,
        other => return Err(ControlError::BadArgument(other.to_string())),
    };
    let connect_from = args.get(3).and_then(|s| s.parse().ok());
    let max_bps = args.get(4).and_then(|s| s.parse().ok());
    let outcome = server.start_mirror(connect_to, connect_from, max_bps, action)?;
    Ok(format!("mirror {:?}", outcome.state))
}

fn do_mirror_max_bps(server: &Arc<Server>, args: &[String]) -> Result<String, ControlError> {
    let bps: u64 = args.first().ok_or(ControlError::WrongArity("mirror_max_bps"))?.parse().map_err(|_| ControlError::BadArgument(args[0].clone()))?;
    if server.set_mirror_max_bps(bps) {
        Ok("updated".to_string())
    } else {
        Err(ControlError::BadArgument("no mirror running".to_string()))
    }
}

fn do_break(server: &Arc<Server>) -> Result<String, ControlError> {
    if server.break_mirror() {
        Ok("mirror abandoned".to_string())
    } else {
        Ok("no mirror running".to_string())
    }
}
