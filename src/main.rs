use clap::{Parser, Subcommand};
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use flexnbd::acl::Acl;
use flexnbd::alloc_scan::{build_allocation_bitset, StatFallbackExtentSource};
use flexnbd::backing::BackingFile;
use flexnbd::server::Server;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;

/// flexnbd: a userspace NBD server with live migration.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve an export with a control socket attached.
    Serve {
        bind_addr: IpAddr,
        port: u16,
        filename: String,
        #[arg(long)]
        size_mb: Option<u64>,
        #[arg(long)]
        create: bool,
        #[arg(long)]
        control_socket: String,
        #[arg(long)]
        deny: bool,
        #[arg(long)]
        acl: Vec<String>,
        /// Per-request kill-switch timeout, in seconds.
        #[arg(long)]
        client_timeout_secs: Option<u64>,
    },
    /// Serve an export with no control socket.
    Listen {
        bind_addr: IpAddr,
        port: u16,
        filename: String,
        #[arg(long)]
        size_mb: Option<u64>,
        #[arg(long)]
        create: bool,
        #[arg(long)]
        deny: bool,
        #[arg(long)]
        acl: Vec<String>,
        /// Per-request kill-switch timeout, in seconds.
        #[arg(long)]
        client_timeout_secs: Option<u64>,
    },
    /// Read a range from a remote export to stdout.
    Read { addr: IpAddr, port: u16, offset: u64, len: u32 },
    /// Write stdin to a range of a remote export.
    Write { addr: IpAddr, port: u16, offset: u64, len: u32 },
    /// Replace the ACL of a running server.
    Acl { control_socket: String, cidrs: Vec<String> },
    /// Start a live migration.
    Mirror {
        control_socket: String,
        addr: IpAddr,
        port: u16,
        #[arg(value_enum)]
        action: MirrorFinish,
        #[arg(long)]
        bind: Option<IpAddr>,
        #[arg(long)]
        max_bps: Option<u64>,
    },
    /// Abandon a running migration.
    Break { control_socket: String },
    /// Print a one-line status snapshot.
    Status { control_socket: String },
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum MirrorFinish {
    Exit,
    Unlink,
    Nothing,
}

fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { bind_addr, port, filename, size_mb, create, control_socket, deny, acl, client_timeout_secs } => {
            run_server(bind_addr, port, &filename, size_mb, create, Some(control_socket), deny, acl, client_timeout_secs)
        }
        Command::Listen { bind_addr, port, filename, size_mb, create, deny, acl, client_timeout_secs } => {
            run_server(bind_addr, port, &filename, size_mb, create, None, deny, acl, client_timeout_secs)
        }
        Command::Read { addr, port, offset, len } => do_read(addr, port, offset, len),
        Command::Write { addr, port, offset, len } => do_write(addr, port, offset, len),
        Command::Acl { control_socket, cidrs } => send_control(&control_socket, "acl", &cidrs),
        Command::Mirror { control_socket, addr, port, action, bind, max_bps } => {
            let action = match action {
                MirrorFinish::Exit => "exit",
                MirrorFinish::Unlink => "unlink",
                MirrorFinish::Nothing => "nothing",
            };
            let mut args = vec![addr.to_string(), port.to_string(), action.to_string()];
            if let Some(b) = bind {
                args.push(b.to_string());
            }
            if let Some(bps) = max_bps {
                args.push(bps.to_string());
            }
            send_control(&control_socket, "mirror", &args)
        }
        Command::Break { control_socket } => send_control(&control_socket, "break", &[]),
        Command::Status { control_socket } => send_control(&control_socket, "status", &[]),
    }
}

fn run_server(
    bind_addr: IpAddr,
    port: u16,
    filename: &str,
    size_mb: Option<u64>,
    create: bool,
    control_socket: Option<String>,
    deny: bool,
    acl_entries: Vec<String>,
    client_timeout_secs: Option<u64>,
) -> Result<ExitCode> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .open(filename)
        .wrap_err_with(|| format!("opening {filename}"))?;
    if let Some(mb) = size_mb {
        file.set_len(mb * 1024 * 1024)?;
    }
    drop(file);

    let backing = BackingFile::open(std::path::Path::new(filename))?;
    let size = backing.size();
    let allocation = build_allocation_bitset(&std::fs::File::open(filename)?, size, flexnbd::handler::BLOCK_SIZE, &StatFallbackExtentSource)?;
    let mut acl = Acl::new(deny);
    acl.set_entries(&acl_entries)?;

    let request_timeout = client_timeout_secs.map(std::time::Duration::from_secs).unwrap_or(flexnbd::handler::DEFAULT_REQUEST_TIMEOUT);
    let server = Server::new(backing, allocation, acl, control_socket.is_some(), request_timeout)?;

    if let Some(path) = control_socket {
        let control_server = server.clone();
        std::thread::spawn(move || {
            if let Err(e) = flexnbd::control::run(control_server, std::path::Path::new(&path)) {
                log::warn!(target: "control", "control socket exited: {e}");
            }
        });
    }

    install_signal_handler(server.clone());

    let has_control = server.run(SocketAddr::new(bind_addr, port))?;
    Ok(if has_control { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

static SHUTDOWN_REQUESTED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, std::sync::atomic::Ordering::SeqCst);
}

fn install_signal_handler(server: std::sync::Arc<Server>) {
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
    std::thread::spawn(move || loop {
        std::thread::sleep(std::time::Duration::from_millis(100));
        if SHUTDOWN_REQUESTED.load(std::sync::atomic::Ordering::SeqCst) {
            server.request_close();
            return;
        }
    });
}

fn do_read(addr: IpAddr, port: u16, offset: u64, len: u32) -> Result<ExitCode> {
    let stream = std::net::TcpStream::connect((addr, port))?;
    let mut client = flexnbd::client::Client::new(stream)?;
    let data = client.read(offset, len)?;
    std::io::stdout().write_all(&data)?;
    Ok(ExitCode::SUCCESS)
}

fn do_write(addr: IpAddr, port: u16, offset: u64, len: u32) -> Result<ExitCode> {
    let stream = std::net::TcpStream::connect((addr, port))?;
    let mut client = flexnbd::client::Client::new(stream)?;
    let mut buf = vec![0u8; len as usize];
    std::io::stdin().read_exact(&mut buf)?;
    client.write(offset, &buf)?;
    Ok(ExitCode::SUCCESS)
}

fn send_control(path: &str, command: &str, args: &[String]) -> Result<ExitCode> {
    use std::os::unix::net::UnixStream;
    let mut stream = UnixStream::connect(path).wrap_err_with(|| format!("connecting to control socket {path}"))?;
    writeln!(stream, "{command}")?;
    for arg in args {
        writeln!(stream, "{arg}")?;
    }
    writeln!(stream)?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    print!("{response}");
    if response.starts_with("0:") {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
