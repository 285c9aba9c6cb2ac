//! Live migration engine: one attempt of mirroring the export to a peer
//! flexnbd, via an initial linear sweep followed by draining the dirty
//! bitset's event stream until the peer has converged.
//!
//! The transfer loop is a single-threaded, non-blocking `mio` event
//! loop over one socket: writable readiness drives sending a chunk's
//! header and payload, readable readiness drives reading its reply, and
//! an abandon self-pipe wakes the loop early when a control-socket
//! `break` comes in mid-wait.

use crate::bitset::{Bitset, Event};
use crate::error::MirrorError;
use crate::server::Server;
use crate::sync::SelfPipe;
use crate::wire::{Cmd, CmdFlags, ErrorType, InitMessage, Reply, Request, MIRROR_HANDLE};
use log::{info, warn};
use mio::net::TcpStream as MioTcpStream;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-connect timeout before a mirror attempt gives up on reaching the
/// peer.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// How long to wait for the peer's hello after connecting.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
/// Delay before the supervisor retries a dropped mirror.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);
/// Convergence window: once remaining work is estimated at or under
/// this many seconds, the engine stops admitting new clients and drains
/// the rest before finishing.
pub const CONVERGE_WINDOW: Duration = Duration::from_secs(5);
/// Largest single NBD `WRITE` the mirror will ever issue.
pub const MAX_TRANSFER: u64 = 8 << 20;
/// Default per-request budget; overridable for slow links via
/// `FLEXNBD_MIRROR_REQUEST_TIMEOUT_SECS`.
pub const DEFAULT_REQUEST_BUDGET: Duration = Duration::from_secs(60);
/// Fraction of the dirty event stream's capacity at which the scheduler
/// latches into stream-only draining.
const CLEAR_EVENTS_HIGH_WATER: f64 = 0.5;
/// Fraction at which the latch releases, letting the linear sweep
/// resume.
const CLEAR_EVENTS_LOW_WATER: f64 = 0.25;
/// `mio` token for the mirror's socket to the peer.
const SOCK: Token = Token(0);
/// `mio` token for the abandon self-pipe.
const ABANDON: Token = Token(1);

/// What to do with the local export once a migration finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishAction {
    /// Exit the process.
    Exit,
    /// Delete the backing file, then exit.
    Unlink,
    /// Leave everything as-is (used by tests and by callers who will
    /// shut the export down themselves).
    Nothing,
}

/// The mirror's externally visible state, reported by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorState {
    Init,
    Go,
    Abandoned,
    Done,
    FailConnect,
    FailRejected,
    FailNoHello,
    FailSizeMismatch,
}

/// The result handed back to whoever asked for a mirror to start, once
/// the first attempt has either reached `Go` or failed outright.
#[derive(Debug, Clone, Copy)]
pub struct MirrorOutcome {
    pub state: MirrorState,
}

struct SharedState {
    state: std::sync::Mutex<MirrorState>,
    abandon: AtomicBool,
    abandon_signal: SelfPipe,
    max_bps: AtomicU64,
    migration_started: std::sync::Mutex<Option<Instant>>,
    /// Bytes sent that count toward the throughput estimate. Transfers
    /// taken from the dirty stream while the clear-events latch is held
    /// are excluded, so a catch-up burst can't make bandwidth limiting
    /// think the link is faster than it is.
    bytes_sent: AtomicU64,
    /// A running snapshot of [`Mirror::bytes_remaining`], refreshed once
    /// per loop iteration so `status` can read it without reaching into
    /// the supervisor thread.
    remaining_bytes: AtomicU64,
}

/// One mirror attempt: owns the connection to the peer and the
/// scheduling state (linear sweep offset, event-stream draining).
pub struct Mirror {
    connect_to: SocketAddr,
    connect_from: Option<SocketAddr>,
    dirty: Arc<Bitset>,
    backing: Arc<crate::backing::BackingFile>,
    shared: Arc<SharedState>,
    offset: u64,
    size: u64,
    /// Latched once the dirty stream crosses the high-water mark; while
    /// set, `next_transfer` only drains the stream, ignoring the linear
    /// sweep, until the stream falls back under the low-water mark.
    clear_events: bool,
    closed_clients: bool,
}

/// A cheap, cloneable reference to a running mirror, used by the
/// control socket and `status` to observe/steer it without touching the
/// supervisor thread.
#[derive(Clone)]
pub struct MirrorControl {
    shared: Arc<SharedState>,
}

impl MirrorControl {
    /// Signal the engine to abandon at its next opportunity.
    pub fn abandon(&self) {
        self.shared.abandon.store(true, Ordering::SeqCst);
        self.shared.abandon_signal.signal();
    }

    /// Change the bandwidth cap in bytes/sec (0 = unlimited).
    pub fn set_max_bps(&self, bps: u64) {
        self.shared.max_bps.store(bps, Ordering::SeqCst);
    }

    /// Current externally visible state.
    pub fn state(&self) -> MirrorState {
        *self.shared.state.lock().unwrap()
    }

    /// Bytes sent since this attempt's linear sweep began.
    pub fn bytes_sent(&self) -> u64 {
        self.shared.bytes_sent.load(Ordering::SeqCst)
    }

    /// Instantaneous throughput since the migration started.
    pub fn current_bps(&self) -> f64 {
        let started = self.shared.migration_started.lock().unwrap();
        match *started {
            Some(t0) => {
                let secs = t0.elapsed().as_secs_f64().max(0.001);
                self.bytes_sent() as f64 / secs
            }
            None => 0.0,
        }
    }

    /// The configured bandwidth cap, or `None` if unlimited.
    pub fn max_bps(&self) -> Option<u64> {
        match self.shared.max_bps.load(Ordering::SeqCst) {
            0 => None,
            cap => Some(cap),
        }
    }

    /// How long the migration has been running, or `None` before it
    /// reaches `Go`.
    pub fn duration(&self) -> Option<Duration> {
        self.shared.migration_started.lock().unwrap().map(|t0| t0.elapsed())
    }

    /// Bytes left to transfer as of the last loop iteration.
    pub fn remaining_bytes(&self) -> u64 {
        self.shared.remaining_bytes.load(Ordering::SeqCst)
    }
}

impl Mirror {
    /// Build a fresh mirror attempt over `size` bytes of export.
    pub fn new(
        connect_to: SocketAddr,
        connect_from: Option<SocketAddr>,
        dirty: Arc<Bitset>,
        backing: Arc<crate::backing::BackingFile>,
        size: u64,
        max_bps: Option<u64>,
    ) -> (Self, MirrorControl) {
        let shared = Arc::new(SharedState {
            state: std::sync::Mutex::new(MirrorState::Init),
            abandon: AtomicBool::new(false),
            abandon_signal: SelfPipe::new().expect("creating mirror abandon self-pipe"),
            max_bps: AtomicU64::new(max_bps.unwrap_or(0)),
            migration_started: std::sync::Mutex::new(None),
            bytes_sent: AtomicU64::new(0),
            remaining_bytes: AtomicU64::new(size),
        });
        let control = MirrorControl { shared: shared.clone() };
        let mirror = Mirror {
            connect_to,
            connect_from,
            dirty,
            backing,
            shared,
            offset: 0,
            size,
            clear_events: false,
            closed_clients: false,
        };
        (mirror, control)
    }

    fn set_state(&self, s: MirrorState) {
        info!(target: "mirror", "state -> {s:?}");
        *self.shared.state.lock().unwrap() = s;
    }

    /// Current externally visible state.
    pub fn current_state(&self) -> MirrorState {
        *self.shared.state.lock().unwrap()
    }

    /// The bytes remaining to reach convergence: whatever the linear
    /// sweep hasn't yet covered, plus whatever's queued on the dirty
    /// stream. Exposed for `status`.
    pub fn bytes_remaining(&self) -> u64 {
        (self.size - self.offset) + self.dirty.stream().queued_bytes(Event::Set)
    }

    /// Reset the linear sweep and byte counters before a supervisor
    /// retry, and freshly re-initialize the dirty bitset: any events
    /// queued from before the drop are discarded in favor of a single
    /// synthetic `On` spanning the whole export, the same way a mirror
    /// starting from scratch would see it.
    pub fn reset(&mut self) {
        self.offset = 0;
        self.clear_events = false;
        self.closed_clients = false;
        self.shared.bytes_sent.store(0, Ordering::SeqCst);
        self.shared.remaining_bytes.store(self.size, Ordering::SeqCst);
        *self.shared.migration_started.lock().unwrap() = None;
        self.dirty.reinitialize();
    }

    /// Connect to the peer and exchange hellos. On success the engine's
    /// state becomes `Go`; on any failure it becomes the matching
    /// `Fail*` state and this returns `Err`.
    pub fn connect(&self) -> Result<TcpStream, MirrorError> {
        let stream = connect_with_timeout(self.connect_to, self.connect_from, CONNECT_TIMEOUT).map_err(|e| {
            self.set_state(MirrorState::FailConnect);
            MirrorError::Connect(e)
        })?;
        stream.set_read_timeout(Some(HELLO_TIMEOUT)).ok();
        let mut reader = &stream;
        let hello = match InitMessage::get(&mut reader) {
            Ok(h) => h,
            Err(_) => {
                self.set_state(MirrorState::FailNoHello);
                return Err(MirrorError::NoHello);
            }
        };
        if hello.size == 0 {
            self.set_state(MirrorState::FailRejected);
            return Err(MirrorError::Rejected);
        }
        if hello.size != self.size {
            self.set_state(MirrorState::FailSizeMismatch);
            return Err(MirrorError::SizeMismatch { peer: hello.size, local: self.size });
        }
        stream.set_read_timeout(None).ok();
        self.set_state(MirrorState::Go);
        *self.shared.migration_started.lock().unwrap() = Some(Instant::now());
        Ok(stream)
    }

    /// Run the transfer loop to completion (`Done`), abandonment
    /// (`Abandoned`), or failure (state stays `Go`, caller decides
    /// whether to retry).
    pub fn run(&mut self, server: &Arc<Server>, stream: &mut TcpStream, finish: FinishAction) -> Result<(), MirrorError> {
        let budget = std::env::var("FLEXNBD_MIRROR_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REQUEST_BUDGET);

        stream.set_nonblocking(true).map_err(MirrorError::Transfer)?;
        let cloned = stream.try_clone().map_err(MirrorError::Transfer)?;
        let mut mio_stream = MioTcpStream::from_std(cloned);

        let mut poll = Poll::new().map_err(MirrorError::Transfer)?;
        poll.registry().register(&mut mio_stream, SOCK, Interest::WRITABLE).map_err(MirrorError::Transfer)?;
        poll.registry()
            .register(&mut SourceFd(&self.shared.abandon_signal.read_fd()), ABANDON, Interest::READABLE)
            .map_err(MirrorError::Transfer)?;
        let mut events = Events::with_capacity(8);

        loop {
            if self.shared.abandon.load(Ordering::SeqCst) {
                self.set_state(MirrorState::Abandoned);
                return Ok(());
            }
            self.shared.remaining_bytes.store(self.bytes_remaining(), Ordering::SeqCst);

            if let Some((from, len, metered)) = self.next_transfer() {
                self.send_chunk(&mut poll, &mut events, &mut mio_stream, from, len, metered, budget)?;
                continue;
            }

            if self.should_converge() {
                if !self.closed_clients {
                    server.forbid_new_clients();
                    server.close_and_join_clients();
                    self.closed_clients = true;
                }
                match self.next_transfer() {
                    Some((from, len, metered)) => {
                        self.send_chunk(&mut poll, &mut events, &mut mio_stream, from, len, metered, budget)?;
                        continue;
                    }
                    None => {
                        self.finish(stream, server, finish);
                        return Ok(());
                    }
                }
            }

            let wait = self.bandwidth_wait().unwrap_or(Duration::from_secs(1)).min(Duration::from_secs(1));
            poll.poll(&mut events, Some(wait)).map_err(MirrorError::Transfer)?;
        }
    }

    /// The hysteresis scheduler: while the dirty stream sits under the
    /// high-water mark and the sweep isn't finished, take the next
    /// linear chunk. Once latched (stream crossed the high-water mark,
    /// or the sweep is done), drain the stream for the next `Set`
    /// event, staying latched until the stream falls under the
    /// low-water mark. Returns `(from, len, counts_toward_bps)`.
    fn next_transfer(&mut self) -> Option<(u64, u64, bool)> {
        let fill = self.dirty.stream().fill_ratio();
        if fill >= CLEAR_EVENTS_HIGH_WATER {
            self.clear_events = true;
        } else if fill <= CLEAR_EVENTS_LOW_WATER {
            self.clear_events = false;
        }

        if self.offset < self.size && !self.clear_events {
            let len = MAX_TRANSFER.min(self.size - self.offset);
            let from = self.offset;
            self.offset += len;
            return Some((from, len, true));
        }

        while let Some(entry) = self.dirty.stream().try_dequeue() {
            if matches!(entry.event, Event::Set) {
                return Some((entry.from, entry.len, !self.clear_events));
            }
        }
        None
    }

    fn should_converge(&self) -> bool {
        let remaining = self.bytes_remaining();
        if remaining == 0 {
            return true;
        }
        let bps = MirrorControl { shared: self.shared.clone() }.current_bps();
        if bps <= 0.0 {
            return false;
        }
        let eta = Duration::from_secs_f64(remaining as f64 / bps);
        eta <= CONVERGE_WINDOW
    }

    fn send_chunk(
        &self,
        poll: &mut Poll,
        events: &mut Events,
        stream: &mut MioTcpStream,
        from: u64,
        len: u64,
        metered: bool,
        budget: Duration,
    ) -> Result<(), MirrorError> {
        self.wait_for_bandwidth(poll, events)?;

        let req = Request { flags: CmdFlags::empty(), typ: Cmd::Write, handle: MIRROR_HANDLE, from, len: len as u32 };
        let mut header = Vec::with_capacity(28);
        req.put(&mut header).map_err(MirrorError::Transfer)?;
        let mut payload = vec![0u8; len as usize];
        self.fill_from_backing(&mut payload, from)?;

        let deadline = Instant::now() + budget;
        self.write_all_nonblocking(poll, events, stream, &header, deadline)?;
        self.write_all_nonblocking(poll, events, stream, &payload, deadline)?;

        let mut reply_buf = [0u8; 16];
        self.read_exact_nonblocking(poll, events, stream, &mut reply_buf, deadline)?;
        let reply = Reply::get(&mut &reply_buf[..])
            .map_err(|_| MirrorError::Transfer(std::io::Error::from(std::io::ErrorKind::InvalidData)))?;
        if !matches!(reply.error, ErrorType::Ok) {
            warn!(target: "mirror", "peer rejected a write at {from}: {:?}", reply.error);
        }
        if metered {
            self.shared.bytes_sent.fetch_add(len, Ordering::SeqCst);
        }
        Ok(())
    }

    fn write_all_nonblocking(
        &self,
        poll: &mut Poll,
        events: &mut Events,
        stream: &mut MioTcpStream,
        buf: &[u8],
        deadline: Instant,
    ) -> Result<(), MirrorError> {
        poll.registry().reregister(stream, SOCK, Interest::WRITABLE).map_err(MirrorError::Transfer)?;
        let mut sent = 0;
        while sent < buf.len() {
            if self.shared.abandon.load(Ordering::SeqCst) {
                return Err(MirrorError::Transfer(std::io::Error::from(std::io::ErrorKind::ConnectionAborted)));
            }
            match stream.write(&buf[sent..]) {
                Ok(n) => sent += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => self.await_ready(poll, events, deadline)?,
                Err(e) => return Err(MirrorError::Transfer(e)),
            }
        }
        Ok(())
    }

    fn read_exact_nonblocking(
        &self,
        poll: &mut Poll,
        events: &mut Events,
        stream: &mut MioTcpStream,
        buf: &mut [u8],
        deadline: Instant,
    ) -> Result<(), MirrorError> {
        poll.registry().reregister(stream, SOCK, Interest::READABLE).map_err(MirrorError::Transfer)?;
        let mut read = 0;
        while read < buf.len() {
            if self.shared.abandon.load(Ordering::SeqCst) {
                return Err(MirrorError::Transfer(std::io::Error::from(std::io::ErrorKind::ConnectionAborted)));
            }
            match stream.read(&mut buf[read..]) {
                Ok(0) => return Err(MirrorError::Transfer(std::io::Error::from(std::io::ErrorKind::UnexpectedEof))),
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => self.await_ready(poll, events, deadline)?,
                Err(e) => return Err(MirrorError::Transfer(e)),
            }
        }
        Ok(())
    }

    fn await_ready(&self, poll: &mut Poll, events: &mut Events, deadline: Instant) -> Result<(), MirrorError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(MirrorError::Transfer(std::io::Error::from(std::io::ErrorKind::TimedOut)));
        }
        poll.poll(events, Some(remaining.min(Duration::from_secs(1)))).map_err(MirrorError::Transfer)
    }

    /// How long to wait before the bandwidth cap allows another chunk,
    /// `None` if sending now is fine. Folded into the event loop's poll
    /// timeout instead of a blocking sleep, so the abandon pipe still
    /// wakes the loop immediately.
    fn bandwidth_wait(&self) -> Option<Duration> {
        let cap = self.shared.max_bps.load(Ordering::SeqCst);
        if cap == 0 {
            return None;
        }
        let t0 = (*self.shared.migration_started.lock().unwrap())?;
        let elapsed = t0.elapsed().as_secs_f64();
        let sent = self.shared.bytes_sent.load(Ordering::SeqCst) as f64;
        let allowed = cap as f64 * elapsed;
        if sent > allowed {
            let over = sent - allowed;
            Some(Duration::from_secs_f64((over / cap as f64).min(1.0)))
        } else {
            None
        }
    }

    fn wait_for_bandwidth(&self, poll: &mut Poll, events: &mut Events) -> Result<(), MirrorError> {
        while !self.shared.abandon.load(Ordering::SeqCst) {
            match self.bandwidth_wait() {
                None => return Ok(()),
                Some(delay) => poll.poll(events, Some(delay.min(Duration::from_secs(1)))).map_err(MirrorError::Transfer)?,
            }
        }
        Ok(())
    }

    fn fill_from_backing(&self, buf: &mut [u8], from: u64) -> Result<(), MirrorError> {
        self.backing
            .read_at(from, buf)
            .map_err(|_| MirrorError::Transfer(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)))
    }

    /// Best-effort disconnect notice. The peer may already be gone by
    /// the time we get here, so write failures are swallowed the same
    /// way the rest of the shutdown path is.
    fn finish(&self, stream: &mut TcpStream, server: &Arc<Server>, finish: FinishAction) {
        self.set_state(MirrorState::Done);
        let req = Request { flags: CmdFlags::empty(), typ: Cmd::Disconnect, handle: MIRROR_HANDLE, from: 0, len: 0 };
        let mut buf = Vec::new();
        let _ = req.put(&mut buf);
        let mut sent = 0;
        for _ in 0..50 {
            match stream.write(&buf[sent..]) {
                Ok(n) => {
                    sent += n;
                    if sent >= buf.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => std::thread::sleep(Duration::from_millis(10)),
                Err(_) => break,
            }
        }
        match finish {
            FinishAction::Exit => server.request_close(),
            FinishAction::Unlink => {
                let _ = std::fs::remove_file(server.backing.path());
                server.request_close();
            }
            FinishAction::Nothing => {}
        }
    }
}

fn connect_with_timeout(to: SocketAddr, from: Option<SocketAddr>, timeout: Duration) -> std::io::Result<TcpStream> {
    if let Some(bind_addr) = from {
        // std has no bind-then-connect-with-timeout; fall back to a
        // plain connect preceded by a bind via a raw socket for the
        // common case of needing a specific source address.
        use nix::sys::socket::{bind, connect, socket, AddressFamily, SockFlag, SockType, SockaddrStorage};
        let family = if to.is_ipv4() { AddressFamily::Inet } else { AddressFamily::Inet6 };
        let fd = socket(family, SockType::Stream, SockFlag::empty(), None)?;
        bind(fd.as_raw_fd(), &SockaddrStorage::from(bind_addr))?;
        connect(fd.as_raw_fd(), &SockaddrStorage::from(to))?;
        // SAFETY: fd is a connected, owned socket fd.
        Ok(unsafe { TcpStream::from_raw_fd(std::os::fd::IntoRawFd::into_raw_fd(fd)) })
    } else {
        TcpStream::connect_timeout(&to, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_backing(size: u64) -> (tempfile::NamedTempFile, Arc<crate::backing::BackingFile>) {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(size).unwrap();
        let backing = Arc::new(crate::backing::BackingFile::open(tmp.path()).unwrap());
        (tmp, backing)
    }

    #[test]
    fn linear_sweep_covers_whole_export_in_bounded_chunks() {
        let size = MAX_TRANSFER * 2 + 10;
        let (_tmp, backing) = test_backing(size);
        let (mut mirror, _ctl) = Mirror::new(
            "127.0.0.1:1".parse().unwrap(),
            None,
            Arc::new(Bitset::new(size, 4096)),
            backing,
            size,
            None,
        );
        let mut total = 0u64;
        let mut chunks = 0;
        while let Some((_from, len, metered)) = mirror.next_transfer() {
            assert!(len <= MAX_TRANSFER);
            assert!(metered);
            total += len;
            chunks += 1;
        }
        assert_eq!(total, MAX_TRANSFER * 2 + 10);
        assert_eq!(chunks, 3);
    }

    #[test]
    fn abandon_flag_is_observable_through_control_handle() {
        let (_tmp, backing) = test_backing(4096);
        let (_, ctl) =
            Mirror::new("127.0.0.1:1".parse().unwrap(), None, Arc::new(Bitset::new(4096, 4096)), backing, 4096, None);
        assert!(!ctl.shared.abandon.load(Ordering::SeqCst));
        ctl.abandon();
        assert!(ctl.shared.abandon.load(Ordering::SeqCst));
    }

    #[test]
    fn once_sweep_is_done_the_stream_is_drained_for_set_events() {
        let size = 4096;
        let (_tmp, backing) = test_backing(size);
        let dirty = Arc::new(Bitset::new(size, 4096));
        dirty.enable_stream();
        let _on = dirty.stream().try_dequeue().unwrap();
        let (mut mirror, _ctl) = Mirror::new("127.0.0.1:1".parse().unwrap(), None, dirty.clone(), backing, size, None);
        assert!(mirror.next_transfer().is_some()); // the lone linear chunk
        assert!(mirror.next_transfer().is_none()); // sweep done, stream empty
        dirty.set_range(0, 4096);
        let (from, len, metered) = mirror.next_transfer().unwrap();
        assert_eq!((from, len), (0, 4096));
        assert!(metered);
    }

    #[test]
    fn reset_reinitializes_the_dirty_bitset_in_place() {
        let size = 4096;
        let (_tmp, backing) = test_backing(size);
        let dirty = Arc::new(Bitset::new(size, 4096));
        dirty.enable_stream();
        let _on = dirty.stream().try_dequeue().unwrap();
        dirty.set_range(0, 4096);
        let (mut mirror, _ctl) = Mirror::new("127.0.0.1:1".parse().unwrap(), None, dirty.clone(), backing, size, None);
        mirror.reset();
        assert!(dirty.is_clear_at(0));
        let entry = dirty.stream().try_dequeue().unwrap();
        assert_eq!(entry.event, Event::On);
        assert!(dirty.stream().try_dequeue().is_none());
    }
}
