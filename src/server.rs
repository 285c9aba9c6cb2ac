//! The accept loop: binds the listening socket, enforces the ACL on
//! every new connection, tracks the live client table, and owns the
//! export's backing file and bitsets for the lifetime of the process.

use crate::acl::Acl;
use crate::bitset::Bitset;
use crate::handler::ClientHandler;
use crate::sync::{FlexMutex, SelfPipe};
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use log::{info, warn};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Maximum number of simultaneously connected clients.
pub const MAX_CLIENTS: usize = 16;

struct ClientSlot {
    peer: SocketAddr,
    stop: Arc<SelfPipe>,
    thread: std::thread::JoinHandle<()>,
}

/// State shared between the accept loop, every client handler thread,
/// the mirror supervisor, and the control socket.
pub struct Server {
    pub(crate) backing: Arc<crate::backing::BackingFile>,
    pub(crate) allocation: Arc<Bitset>,
    pub(crate) dirty: Mutex<Option<Arc<Bitset>>>,
    acl: FlexMutex<Acl>,
    clients: Mutex<Vec<ClientSlot>>,
    allow_new_clients: AtomicBool,
    closed: AtomicBool,
    close_signal: SelfPipe,
    acl_updated_signal: SelfPipe,
    /// Whether a control socket is attached (serve mode) or not (listen
    /// mode). Reported in `status`.
    pub has_control: AtomicBool,
    pub(crate) mirror: Mutex<Option<crate::supervisor::MirrorHandle>>,
    pub(crate) l_mirror: FlexMutex<()>,
    request_timeout: Duration,
}

impl Server {
    /// Build a server over an already-opened backing file.
    pub fn new(
        backing: crate::backing::BackingFile,
        allocation: Bitset,
        acl: Acl,
        has_control: bool,
        request_timeout: Duration,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Server {
            backing: Arc::new(backing),
            allocation: Arc::new(allocation),
            dirty: Mutex::new(None),
            acl: FlexMutex::new(acl),
            clients: Mutex::new(Vec::new()),
            allow_new_clients: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            close_signal: SelfPipe::new().wrap_err("creating close self-pipe")?,
            acl_updated_signal: SelfPipe::new().wrap_err("creating acl self-pipe")?,
            has_control: AtomicBool::new(has_control),
            mirror: Mutex::new(None),
            l_mirror: FlexMutex::new(()),
            request_timeout,
        }))
    }

    /// Replace the ACL wholesale, then kick any now-disallowed client.
    pub fn replace_acl(&self, acl: Acl) {
        *self.acl.lock() = acl;
        self.acl_updated_signal.signal();
    }

    /// Bind with an exact backlog (std's `TcpListener` doesn't expose
    /// one), honoring `SO_REUSEADDR` the way the rest of the stack
    /// expects.
    fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
        use nix::sys::socket::{bind, listen, socket, AddressFamily, SockFlag, SockType, SockaddrStorage};
        let family = if addr.is_ipv4() { AddressFamily::Inet } else { AddressFamily::Inet6 };
        let fd = socket(family, SockType::Stream, SockFlag::empty(), None)?;
        nix::sys::socket::setsockopt(&fd, nix::sys::socket::sockopt::ReuseAddr, &true)?;
        let sockaddr = SockaddrStorage::from(addr);
        bind(fd.as_raw_fd(), &sockaddr)?;
        listen(&fd, nix::sys::socket::Backlog::new(10).unwrap())?;
        // SAFETY: fd is a freshly bound, listening, valid socket fd we
        // own exclusively from here on.
        Ok(unsafe { TcpListener::from_raw_fd(std::os::fd::IntoRawFd::into_raw_fd(fd)) })
    }

    /// Run the accept loop on the calling thread until `request_close`
    /// is called (from the control socket's shutdown path, a signal
    /// handler, or mirror completion). Returns whether a control socket
    /// was attached, which `main` uses to decide the process exit code.
    pub fn run(self: Arc<Self>, addr: SocketAddr) -> Result<bool> {
        let listener = Self::bind(addr).wrap_err("binding listen socket")?;
        listener.set_nonblocking(true)?;
        info!(target: "nbd", "listening on {addr}");

        let mut poll = Poll::new()?;
        const LISTENER: Token = Token(0);
        const CLOSE: Token = Token(1);
        const ACL: Token = Token(2);
        poll.registry().register(&mut SourceFd(&listener.as_raw_fd()), LISTENER, Interest::READABLE)?;
        poll.registry().register(&mut SourceFd(&self.close_signal.read_fd()), CLOSE, Interest::READABLE)?;
        poll.registry().register(&mut SourceFd(&self.acl_updated_signal.read_fd()), ACL, Interest::READABLE)?;

        let mut events = Events::with_capacity(16);
        'accept: loop {
            poll.poll(&mut events, None)?;
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.drain_accepts(&listener),
                    ACL => {
                        self.acl_updated_signal.clear();
                        self.evict_disallowed_clients();
                    }
                    CLOSE => {
                        self.close_signal.clear();
                        break 'accept;
                    }
                    _ => unreachable!(),
                }
            }
        }
        self.teardown();
        Ok(self.has_control.load(Ordering::SeqCst))
    }

    fn drain_accepts(&self, listener: &TcpListener) {
        loop {
            match listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(target: "nbd", "accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn admit(&self, mut stream: TcpStream, peer: SocketAddr) {
        if !self.allow_new_clients.load(Ordering::SeqCst) {
            return;
        }
        if !self.acl.lock().includes(&peer.ip()) {
            info!(target: "nbd", "refusing {peer}: not in acl");
            let _ = stream.write_all(b"Access control error");
            return;
        }
        let mut clients = self.clients.lock().unwrap();
        if clients.len() >= MAX_CLIENTS {
            warn!(target: "nbd", "refusing {peer}: too many clients");
            let _ = stream.write_all(b"Too many clients");
            return;
        }
        let _ = stream.set_nodelay(true);
        let stop = match SelfPipe::new() {
            Ok(p) => Arc::new(p),
            Err(e) => {
                warn!(target: "nbd", "could not create client stop pipe: {e}");
                return;
            }
        };
        let handler = ClientHandler::new(
            stream,
            peer,
            self.backing.clone(),
            self.allocation.clone(),
            self.dirty_snapshot(),
            stop.clone(),
            self.request_timeout,
        );
        let thread = std::thread::spawn(move || handler.run());
        clients.push(ClientSlot { peer, stop, thread });
        info!(target: "nbd", "client connected from {peer}");
    }

    fn dirty_snapshot(&self) -> Option<Arc<Bitset>> {
        self.dirty.lock().unwrap().clone()
    }

    fn evict_disallowed_clients(&self) {
        let acl = self.acl.lock();
        let clients = self.clients.lock().unwrap();
        for slot in clients.iter() {
            if !acl.includes(&slot.peer.ip()) {
                slot.stop.signal();
            }
        }
    }

    /// Ask the accept loop to stop. Safe to call from any thread.
    pub fn request_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_signal.signal();
    }

    /// Forbid new clients without touching existing ones. Used by the
    /// mirror engine as it nears convergence.
    pub fn forbid_new_clients(&self) {
        self.allow_new_clients.store(false, Ordering::SeqCst);
    }

    /// Signal every live client's stop pipe and join their threads.
    pub fn close_and_join_clients(&self) {
        let slots = std::mem::take(&mut *self.clients.lock().unwrap());
        for slot in &slots {
            slot.stop.signal();
        }
        for slot in slots {
            let _ = slot.thread.join();
        }
    }

    /// How many clients are currently connected.
    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Is the server still accepting new clients?
    pub fn accepting_clients(&self) -> bool {
        self.allow_new_clients.load(Ordering::SeqCst)
    }

    fn teardown(&self) {
        self.allow_new_clients.store(false, Ordering::SeqCst);
        self.close_and_join_clients();
    }

    /// Start (or reject, if one is already running) a mirror attempt.
    pub fn start_mirror(
        self: &Arc<Self>,
        connect_to: SocketAddr,
        connect_from: Option<SocketAddr>,
        max_bps: Option<u64>,
        finish_action: crate::mirror::FinishAction,
    ) -> std::result::Result<crate::mirror::MirrorOutcome, crate::error::ControlError> {
        let _guard = self.l_mirror.lock();
        if self.mirror.lock().unwrap().is_some() {
            return Err(crate::error::ControlError::MirrorAlreadyRunning);
        }
        let dirty = Arc::new(Bitset::new(self.backing.size(), 4096));
        dirty.enable_stream();
        *self.dirty.lock().unwrap() = Some(dirty.clone());
        let (handle, outcome) =
            crate::supervisor::spawn(self.clone(), dirty, connect_to, connect_from, max_bps, finish_action);
        *self.mirror.lock().unwrap() = Some(handle);
        Ok(outcome)
    }

    /// Abandon any running mirror. Returns whether one was running.
    pub fn break_mirror(&self) -> bool {
        let _guard = self.l_mirror.lock();
        match self.mirror.lock().unwrap().as_ref() {
            Some(handle) => {
                handle.abandon();
                true
            }
            None => false,
        }
    }

    /// Update the running mirror's bandwidth cap, if any.
    pub fn set_mirror_max_bps(&self, bps: u64) -> bool {
        match self.mirror.lock().unwrap().as_ref() {
            Some(handle) => {
                handle.set_max_bps(bps);
                true
            }
            None => false,
        }
    }

    /// Clear the finished mirror handle, called by the supervisor just
    /// before its thread exits.
    pub fn clear_mirror(&self) {
        *self.mirror.lock().unwrap() = None;
        *self.dirty.lock().unwrap() = None;
    }
}
