//! Standalone resilient-proxy binary: relays an NBD client to an
//! upstream flexnbd, reconnecting transparently on upstream failure.

use clap::Parser;
use color_eyre::Result;
use std::net::SocketAddr;

/// flexnbd-proxy: a reconnecting NBD man-in-the-middle.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to accept downstream clients on.
    listen_addr: SocketAddr,
    /// Upstream flexnbd to relay to.
    upstream_addr: SocketAddr,
    /// Enable the read-ahead cache: each cache miss fetches double the
    /// requested length upstream and holds the unconsumed half for a
    /// later read, invalidated on an overlapping write or reconnect.
    #[arg(long)]
    prefetch: bool,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();
    let args = Args::parse();
    flexnbd::proxy::run(args.listen_addr, args.upstream_addr, args.prefetch)?;
    Ok(())
}
