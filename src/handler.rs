//! Per-connection client handler: one thread per connected client,
//! running the hello + request/reply loop against the shared backing
//! file and bitsets.

use crate::backing::BackingFile;
use crate::bitset::Bitset;
use crate::sync::{KillSwitch, SelfPipe};
use crate::wire::{Cmd, ErrorType, InitFlags, InitMessage, Reply, Request};
use log::{info, warn};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

/// Block-granularity used for the sparse-preserving write path and for
/// both the allocation and dirty bitsets.
pub const BLOCK_SIZE: u64 = 4096;

/// Default per-request time budget before the kill switch shuts the
/// connection down out from under a stuck client, configurable per
/// `Server` (CLI: `--client-timeout-secs`).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// One connected NBD client.
pub struct ClientHandler {
    stream: TcpStream,
    peer: SocketAddr,
    backing: Arc<BackingFile>,
    allocation: Arc<Bitset>,
    dirty: Option<Arc<Bitset>>,
    stop: Arc<SelfPipe>,
    request_timeout: Duration,
}

impl ClientHandler {
    /// Build a handler for an already-accepted, already-`nodelay`'d
    /// stream.
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        backing: Arc<BackingFile>,
        allocation: Arc<Bitset>,
        dirty: Option<Arc<Bitset>>,
        stop: Arc<SelfPipe>,
        request_timeout: Duration,
    ) -> Self {
        ClientHandler { stream, peer, backing, allocation, dirty, stop, request_timeout }
    }

    /// Run until the client disconnects, the stop pipe fires, or a
    /// per-connection fatal error occurs. Never panics: any error below
    /// the wire-codec level is logged and simply ends this thread.
    pub fn run(mut self) {
        let kill = Arc::new(KillSwitch::new());
        let fd = self.stream.as_raw_fd();
        kill.clone().spawn_watcher(move || {
            // SAFETY: fd is owned by the handler's TcpStream for the
            // lifetime of this thread; shutdown is safe to call even if
            // the stream has already been dropped concurrently would
            // not be, but the watcher thread exits once `run` returns
            // because nothing keeps the Arc<KillSwitch> alive past that.
            unsafe {
                libc::shutdown(fd, libc::SHUT_RDWR);
            }
        });

        let init = InitMessage { size: self.backing.size(), flags: InitFlags::HAS_FLAGS | InitFlags::SEND_FLUSH | InitFlags::SEND_FUA };
        if let Err(e) = init.put(&mut self.stream) {
            warn!(target: "nbd", "{}: hello failed: {e}", self.peer);
            return;
        }

        if let Err(e) = self.loop_requests(&kill) {
            warn!(target: "nbd", "{}: connection ended: {e}", self.peer);
        } else {
            info!(target: "nbd", "{}: client disconnected", self.peer);
        }
    }

    fn loop_requests(&mut self, kill: &Arc<KillSwitch>) -> std::io::Result<()> {
        let mut poll = Poll::new()?;
        const SOCK: Token = Token(0);
        const STOP: Token = Token(1);
        poll.registry().register(&mut SourceFd(&self.stream.as_raw_fd()), SOCK, Interest::READABLE)?;
        poll.registry().register(&mut SourceFd(&self.stop.read_fd()), STOP, Interest::READABLE)?;
        let mut events = Events::with_capacity(4);

        loop {
            kill.disarm();
            poll.poll(&mut events, None)?;
            let mut stop_requested = false;
            let mut readable = false;
            for event in events.iter() {
                match event.token() {
                    STOP => stop_requested = true,
                    SOCK => readable = true,
                    _ => unreachable!(),
                }
            }
            if stop_requested {
                self.stop.clear();
                return Ok(());
            }
            if !readable {
                continue;
            }
            kill.arm(self.request_timeout);
            let req = match Request::get(&mut self.stream) {
                Ok(req) => req,
                Err(e) => {
                    warn!(target: "nbd", "{}: bad request header: {e}", self.peer);
                    let _ = Reply { error: ErrorType::EBadMsg, handle: 0 }.put(&mut self.stream);
                    return Ok(());
                }
            };
            if self.dispatch(&req)? {
                return Ok(());
            }
        }
    }

    /// Handle one request. Returns `Ok(true)` if the connection should
    /// close (a clean `DISCONNECT`).
    fn dispatch(&mut self, req: &Request) -> std::io::Result<bool> {
        let size = self.backing.size();
        let in_range = req.from.checked_add(req.len as u64).map(|end| end <= size).unwrap_or(false);
        match req.typ {
            Cmd::Disconnect => return Ok(true),
            Cmd::Flush => {
                let result = self.backing.msync_all();
                self.reply(req.handle, result.map_err(|e| ErrorType::from_io_kind(e.kind())))?;
            }
            Cmd::Read => {
                if !in_range {
                    self.reply(req.handle, Err(ErrorType::ENoSpc))?;
                } else {
                    self.handle_read(req)?;
                }
            }
            Cmd::Write => {
                if !in_range {
                    drain(&mut self.stream, req.len as u64)?;
                    self.reply(req.handle, Err(ErrorType::ENoSpc))?;
                } else {
                    let result = self.handle_write(req);
                    self.reply(req.handle, result)?;
                }
            }
        }
        Ok(false)
    }

    fn handle_read(&mut self, req: &Request) -> std::io::Result<()> {
        Reply { error: ErrorType::Ok, handle: req.handle }.put(&mut self.stream)?;
        cork(&self.stream, true);
        let result = self.backing.write_out_to(self.stream.as_raw_fd(), req.from, req.len as u64);
        cork(&self.stream, false);
        if let Err(e) = result {
            warn!(target: "nbd", "{}: read failed: {e:?}", self.peer);
        }
        Ok(())
    }

    /// The sparse-preserving write path: walk the allocation bitset's
    /// runs under the request, reading allocated runs straight into the
    /// map and testing unallocated 4096-byte blocks for all-zero before
    /// deciding whether to materialize them.
    fn handle_write(&mut self, req: &Request) -> Result<(), ErrorType> {
        let mut remaining = req.len as u64;
        let mut offset = req.from;
        let mut scratch = [0u8; BLOCK_SIZE as usize];

        while remaining > 0 {
            let (run_len, allocated) = self.allocation.run_count_ex(offset, remaining);
            let run_len = run_len.max(1).min(remaining);
            if allocated {
                self.backing.read_into_from(&mut self.stream, offset, run_len)?;
                self.mark_dirty(offset, run_len);
            } else {
                let mut done = 0u64;
                while done < run_len {
                    let block_len = BLOCK_SIZE.min(run_len - done);
                    let buf = &mut scratch[..block_len as usize];
                    self.stream.read_exact(buf).map_err(|e| ErrorType::from_io_kind(e.kind()))?;
                    if !buf.iter().all(|&b| b == 0) {
                        self.backing.write_at(offset + done, buf).map_err(|_| ErrorType::EIo)?;
                        self.allocation.set_range(offset + done, block_len);
                        self.mark_dirty(offset + done, block_len);
                    }
                    done += block_len;
                }
            }
            offset += run_len;
            remaining -= run_len;
        }

        if req.flags.contains(crate::wire::CmdFlags::FUA) {
            self.backing.msync_range(req.from, req.len as u64).map_err(|e| ErrorType::from_io_kind(e.kind()))?;
        }
        Ok(())
    }

    fn mark_dirty(&self, offset: u64, len: u64) {
        if let Some(dirty) = &self.dirty {
            dirty.set_range(offset, len);
        }
    }

    fn reply(&mut self, handle: u64, result: Result<(), ErrorType>) -> std::io::Result<()> {
        let error = result.err().unwrap_or(ErrorType::Ok);
        Reply { error, handle }.put(&mut self.stream)
    }
}

fn drain<R: std::io::Read>(stream: &mut R, len: u64) -> std::io::Result<()> {
    let mut remaining = len;
    let mut buf = [0u8; 65536];
    while remaining > 0 {
        let n = buf.len().min(remaining as usize);
        stream.read_exact(&mut buf[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn cork(stream: &TcpStream, enable: bool) {
    let value: libc::c_int = if enable { 1 } else { 0 };
    // SAFETY: stream's fd is valid for the duration of this call.
    unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_CORK,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn cork(_stream: &TcpStream, _enable: bool) {}

use std::io::Read;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc_scan::{build_allocation_bitset, StatFallbackExtentSource};
    use std::io::Write;
    use std::net::TcpListener;

    fn make_backing(size: u64) -> (tempfile::NamedTempFile, Arc<BackingFile>, Arc<Bitset>) {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(size).unwrap();
        let backing = Arc::new(BackingFile::open(tmp.path()).unwrap());
        let allocation = Arc::new(build_allocation_bitset(tmp.as_file(), size, BLOCK_SIZE, &StatFallbackExtentSource).unwrap());
        (tmp, backing, allocation)
    }

    #[test]
    fn all_zero_write_to_unallocated_block_preserves_hole() {
        let (_tmp, backing, allocation) = make_backing(BLOCK_SIZE * 2);
        assert!(allocation.is_clear_at(0));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_stream, peer) = listener.accept().unwrap();
        let stop = Arc::new(SelfPipe::new().unwrap());
        let mut handler = ClientHandler::new(server_stream, peer, backing.clone(), allocation.clone(), None, stop, DEFAULT_REQUEST_TIMEOUT);
        let zeros = vec![0u8; BLOCK_SIZE as usize];
        let req = Request { flags: crate::wire::CmdFlags::empty(), typ: Cmd::Write, handle: 1, from: 0, len: BLOCK_SIZE as u32 };
        let mut client = client;
        client.write_all(&zeros).unwrap();
        let result = handler.handle_write(&req);
        assert!(result.is_ok());
        assert!(allocation.is_clear_at(0));
    }

    #[test]
    fn nonzero_write_to_unallocated_block_marks_allocated() {
        let (_tmp, backing, allocation) = make_backing(BLOCK_SIZE * 2);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_stream, peer) = listener.accept().unwrap();
        let stop = Arc::new(SelfPipe::new().unwrap());
        let mut handler = ClientHandler::new(server_stream, peer, backing.clone(), allocation.clone(), None, stop, DEFAULT_REQUEST_TIMEOUT);
        let mut data = vec![0u8; BLOCK_SIZE as usize];
        data[10] = 7;
        let req = Request { flags: crate::wire::CmdFlags::empty(), typ: Cmd::Write, handle: 1, from: 0, len: BLOCK_SIZE as u32 };
        let mut client = client;
        client.write_all(&data).unwrap();
        handler.handle_write(&req).unwrap();
        assert!(allocation.is_set_at(0));
    }
}
