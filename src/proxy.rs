//! A non-blocking, resilient NBD proxy: accepts downstream clients and
//! relays their requests to an upstream flexnbd, reconnecting upstream
//! transparently (from the downstream client's point of view) if the
//! upstream connection drops.
//!
//! The upstream hello (export size and flags) is negotiated once and
//! cached, so a downstream connection that arrives after the first one
//! doesn't have to wait on its own upstream handshake before it can be
//! answered. With prefetching enabled the proxy additionally parses
//! request/reply framing so it can read ahead on cache misses and serve
//! repeat reads for the look-ahead half without going back upstream.

use crate::wire::{Cmd, ErrorType, InitMessage, Reply, Request};
use log::{info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Per-connection in-flight byte budget before the proxy gives up and
/// disconnects the downstream client, to bound memory under a stalled
/// upstream.
const MAX_BUFFERED: usize = 32 << 20;
/// How long an upstream operation may take before it's treated as
/// failed and a reconnect is attempted.
const UPSTREAM_BUDGET: Duration = Duration::from_secs(30);
/// Minimum gap between reconnect attempts to the same upstream.
const RECONNECT_COOLDOWN: Duration = Duration::from_secs(3);

const REQUEST_HEADER_LEN: usize = 28;
const REPLY_HEADER_LEN: usize = 16;

/// The upstream hello, learned once from whichever connection gets
/// there first and reused by every connection after it.
type SharedHello = Arc<Mutex<Option<InitMessage>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    ConnectingUpstream,
    ReadingUpstreamHello,
    Relaying,
    WaitingToReconnect,
}

/// One `READ` forwarded upstream with its length doubled, waiting on
/// its reply.
struct PendingRead {
    offset: u64,
    requested_len: u32,
    fetched_len: u32,
}

/// The single most recently read-ahead extent, held until consumed by a
/// later read, invalidated by an overlapping write, or dropped on
/// reconnect.
#[derive(Default)]
struct Prefetch {
    cached: Option<(u64, Vec<u8>)>,
}

impl Prefetch {
    fn hit(&self, offset: u64, len: u32) -> Option<Vec<u8>> {
        let (cached_off, data) = self.cached.as_ref()?;
        let cached_off = *cached_off;
        let cached_end = cached_off + data.len() as u64;
        if offset >= cached_off && offset + len as u64 <= cached_end {
            let start = (offset - cached_off) as usize;
            Some(data[start..start + len as usize].to_vec())
        } else {
            None
        }
    }

    fn store(&mut self, offset: u64, data: Vec<u8>) {
        self.cached = (!data.is_empty()).then_some((offset, data));
    }

    fn invalidate_overlap(&mut self, offset: u64, len: u64) {
        if let Some((cached_off, data)) = &self.cached {
            let cached_end = cached_off + data.len() as u64;
            if offset < cached_end && offset + len > *cached_off {
                self.cached = None;
            }
        }
    }

    fn invalidate_all(&mut self) {
        self.cached = None;
    }
}

/// Incremental parse state for requests arriving from the downstream
/// client.
enum DownParse {
    Header(Vec<u8>),
    WritePayload { req: Request, buf: Vec<u8> },
}

/// Incremental parse state for replies arriving from upstream.
enum UpParse {
    Header(Vec<u8>),
    Payload { reply: Reply, need: usize, buf: Vec<u8> },
}

struct Connection {
    downstream: TcpStream,
    upstream: Option<TcpStream>,
    upstream_addr: SocketAddr,
    state: ConnState,
    shared_hello: SharedHello,
    hello: Option<InitMessage>,
    hello_sent_downstream: bool,
    export_size: Option<u64>,
    down_to_up: VecDeque<u8>,
    up_to_down: VecDeque<u8>,
    last_attempt: Option<Instant>,
    upstream_op_started: Option<Instant>,
    prefetch: Option<Prefetch>,
    down_parse: DownParse,
    up_parse: UpParse,
    pending_reads: HashMap<u64, PendingRead>,
}

impl Connection {
    fn new(downstream: TcpStream, upstream_addr: SocketAddr, shared_hello: SharedHello, prefetch: bool) -> Self {
        Connection {
            downstream,
            upstream: None,
            upstream_addr,
            state: ConnState::ConnectingUpstream,
            shared_hello,
            hello: None,
            hello_sent_downstream: false,
            export_size: None,
            down_to_up: VecDeque::new(),
            up_to_down: VecDeque::new(),
            last_attempt: None,
            upstream_op_started: None,
            prefetch: prefetch.then(Prefetch::default),
            down_parse: DownParse::Header(Vec::new()),
            up_parse: UpParse::Header(Vec::new()),
            pending_reads: HashMap::new(),
        }
    }

    fn overflowed(&self) -> bool {
        self.down_to_up.len() > MAX_BUFFERED || self.up_to_down.len() > MAX_BUFFERED
    }

    fn try_connect_upstream(&mut self) -> io::Result<()> {
        if let Some(last) = self.last_attempt {
            if last.elapsed() < RECONNECT_COOLDOWN {
                return Ok(());
            }
        }
        self.last_attempt = Some(Instant::now());
        let stream = TcpStream::connect(self.upstream_addr)?;
        self.upstream = Some(stream);
        self.state = ConnState::ReadingUpstreamHello;
        self.upstream_op_started = Some(Instant::now());
        Ok(())
    }

    fn upstream_timed_out(&self) -> bool {
        self.upstream_op_started.map(|t| t.elapsed() > UPSTREAM_BUDGET).unwrap_or(false)
    }

    fn drop_upstream(&mut self) {
        self.upstream = None;
        self.state = ConnState::WaitingToReconnect;
        self.upstream_op_started = None;
        self.pending_reads.clear();
        self.up_parse = UpParse::Header(Vec::new());
        if let Some(p) = &mut self.prefetch {
            p.invalidate_all();
        }
    }

    /// Send the cached hello to downstream as soon as one is known,
    /// independent of whether this connection's own upstream link has
    /// finished negotiating.
    fn maybe_send_cached_hello(&mut self) -> io::Result<()> {
        if self.hello_sent_downstream {
            return Ok(());
        }
        let cached = self.hello.or(*self.shared_hello.lock().unwrap());
        if let Some(hello) = cached {
            self.export_size.get_or_insert(hello.size);
            hello.put(&mut self.downstream)?;
            self.hello_sent_downstream = true;
        }
        Ok(())
    }

    /// Pump bytes in both directions as far as non-blocking I/O allows.
    fn pump(&mut self) -> io::Result<bool> {
        if self.overflowed() {
            return Err(io::Error::new(io::ErrorKind::Other, "buffered bytes exceeded bound"));
        }
        // A cached hello can answer this connection's downstream client
        // immediately, independent of whether this connection's own
        // upstream negotiation has finished yet.
        self.maybe_send_cached_hello()?;
        match self.state {
            ConnState::ConnectingUpstream => {
                self.try_connect_upstream()?;
            }
            ConnState::ReadingUpstreamHello => {
                if let Some(up) = &mut self.upstream {
                    let mut buf = [0u8; 152];
                    match up.read_exact(&mut buf) {
                        Ok(()) => {
                            if let Ok(hello) = InitMessage::get(&mut &buf[..]) {
                                self.hello = Some(hello);
                                self.export_size = Some(hello.size);
                                *self.shared_hello.lock().unwrap() = Some(hello);
                                self.state = ConnState::Relaying;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(_) => self.drop_upstream(),
                    }
                }
                if self.upstream_timed_out() {
                    self.drop_upstream();
                }
            }
            ConnState::Relaying => {
                if self.prefetch.is_some() {
                    self.pump_framed()?;
                } else {
                    self.relay_direction_down_to_up()?;
                    self.relay_direction_up_to_down()?;
                }
            }
            ConnState::WaitingToReconnect => {
                self.state = ConnState::ConnectingUpstream;
            }
        }
        Ok(true)
    }

    fn relay_direction_down_to_up(&mut self) -> io::Result<()> {
        let mut buf = [0u8; 65536];
        loop {
            match self.downstream.read(&mut buf) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "downstream closed")),
                Ok(n) => self.down_to_up.extend(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        if let Some(up) = &mut self.upstream {
            while !self.down_to_up.is_empty() {
                let chunk: Vec<u8> = self.down_to_up.iter().copied().collect();
                match up.write(&chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        self.down_to_up.drain(..n);
                        self.upstream_op_started = Some(Instant::now());
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => {
                        self.drop_upstream();
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn relay_direction_up_to_down(&mut self) -> io::Result<()> {
        if let Some(up) = &mut self.upstream {
            let mut buf = [0u8; 65536];
            loop {
                match up.read(&mut buf) {
                    Ok(0) => {
                        self.drop_upstream();
                        break;
                    }
                    Ok(n) => {
                        self.up_to_down.extend(&buf[..n]);
                        self.upstream_op_started = Some(Instant::now());
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => {
                        self.drop_upstream();
                        break;
                    }
                }
            }
        }
        while !self.up_to_down.is_empty() {
            let chunk: Vec<u8> = self.up_to_down.iter().copied().collect();
            match self.downstream.write(&chunk) {
                Ok(0) => break,
                Ok(n) => {
                    self.up_to_down.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        if self.upstream.is_none() && self.state == ConnState::Relaying {
            self.state = ConnState::WaitingToReconnect;
        }
        Ok(())
    }

    /// Request-aware relay used when prefetching is enabled: parses
    /// request/reply framing in both directions instead of passing raw
    /// bytes through untouched.
    fn pump_framed(&mut self) -> io::Result<()> {
        self.read_downstream_requests()?;
        self.flush_to_upstream()?;
        self.read_upstream_replies()?;
        self.flush_to_downstream()?;
        if self.upstream.is_none() && self.state == ConnState::Relaying {
            self.state = ConnState::WaitingToReconnect;
        }
        Ok(())
    }

    fn read_downstream_requests(&mut self) -> io::Result<()> {
        let mut buf = [0u8; 65536];
        loop {
            match self.downstream.read(&mut buf) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "downstream closed")),
                Ok(n) => self.feed_down_bytes(&buf[..n])?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn feed_down_bytes(&mut self, mut bytes: &[u8]) -> io::Result<()> {
        while !bytes.is_empty() {
            match &mut self.down_parse {
                DownParse::Header(partial) => {
                    let need = REQUEST_HEADER_LEN - partial.len();
                    let take = need.min(bytes.len());
                    partial.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];
                    if partial.len() == REQUEST_HEADER_LEN {
                        let header = std::mem::take(partial);
                        let req = Request::get(&mut &header[..])
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                        if req.typ == Cmd::Write {
                            self.down_parse = DownParse::WritePayload { req, buf: Vec::with_capacity(req.len as usize) };
                        } else {
                            self.handle_down_request(req, Vec::new());
                            self.down_parse = DownParse::Header(Vec::new());
                        }
                    }
                }
                DownParse::WritePayload { req, buf } => {
                    let need = req.len as usize - buf.len();
                    let take = need.min(bytes.len());
                    buf.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];
                    if buf.len() == req.len as usize {
                        let req = *req;
                        let payload = std::mem::take(buf);
                        self.handle_down_request(req, payload);
                        self.down_parse = DownParse::Header(Vec::new());
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_down_request(&mut self, req: Request, payload: Vec<u8>) {
        match req.typ {
            Cmd::Read => self.handle_down_read(req),
            Cmd::Write => {
                if let Some(p) = &mut self.prefetch {
                    p.invalidate_overlap(req.from, req.len as u64);
                }
                self.queue_request_to_upstream(req, &payload);
            }
            Cmd::Flush | Cmd::Disconnect => self.queue_request_to_upstream(req, &payload),
        }
    }

    fn handle_down_read(&mut self, req: Request) {
        if let Some(p) = &self.prefetch {
            if let Some(data) = p.hit(req.from, req.len) {
                self.queue_reply_to_downstream(req.handle, ErrorType::Ok, &data);
                return;
            }
        }
        let fetched_len = match (self.prefetch.is_some(), self.export_size) {
            (true, Some(size)) => {
                let doubled = req.len as u64 * 2;
                doubled.min(size.saturating_sub(req.from)).min(u32::MAX as u64) as u32
            }
            _ => req.len,
        };
        self.pending_reads.insert(req.handle, PendingRead { offset: req.from, requested_len: req.len, fetched_len });
        let rewritten = Request { len: fetched_len, ..req };
        self.queue_request_to_upstream(rewritten, &[]);
    }

    fn queue_request_to_upstream(&mut self, req: Request, payload: &[u8]) {
        let mut header = Vec::with_capacity(REQUEST_HEADER_LEN);
        let _ = req.put(&mut header);
        self.down_to_up.extend(header);
        self.down_to_up.extend(payload.iter().copied());
    }

    fn queue_reply_to_downstream(&mut self, handle: u64, error: ErrorType, data: &[u8]) {
        let mut header = Vec::with_capacity(REPLY_HEADER_LEN);
        let _ = Reply { error, handle }.put(&mut header);
        self.up_to_down.extend(header);
        self.up_to_down.extend(data.iter().copied());
    }

    fn flush_to_downstream(&mut self) -> io::Result<()> {
        while !self.up_to_down.is_empty() {
            let chunk: Vec<u8> = self.up_to_down.iter().copied().collect();
            match self.downstream.write(&chunk) {
                Ok(0) => break,
                Ok(n) => {
                    self.up_to_down.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn flush_to_upstream(&mut self) -> io::Result<()> {
        if let Some(up) = &mut self.upstream {
            while !self.down_to_up.is_empty() {
                let chunk: Vec<u8> = self.down_to_up.iter().copied().collect();
                match up.write(&chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        self.down_to_up.drain(..n);
                        self.upstream_op_started = Some(Instant::now());
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => {
                        self.drop_upstream();
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn read_upstream_replies(&mut self) -> io::Result<()> {
        let mut buf = [0u8; 65536];
        loop {
            let result = match &mut self.upstream {
                Some(up) => up.read(&mut buf),
                None => return Ok(()),
            };
            match result {
                Ok(0) => {
                    self.drop_upstream();
                    break;
                }
                Ok(n) => {
                    self.upstream_op_started = Some(Instant::now());
                    let chunk = buf[..n].to_vec();
                    self.feed_up_bytes(&chunk)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.drop_upstream();
                    break;
                }
            }
        }
        Ok(())
    }

    fn feed_up_bytes(&mut self, mut bytes: &[u8]) -> io::Result<()> {
        while !bytes.is_empty() {
            match &mut self.up_parse {
                UpParse::Header(partial) => {
                    let need = REPLY_HEADER_LEN - partial.len();
                    let take = need.min(bytes.len());
                    partial.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];
                    if partial.len() == REPLY_HEADER_LEN {
                        let header = std::mem::take(partial);
                        let reply = Reply::get(&mut &header[..])
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                        let need = self.pending_reads.get(&reply.handle).map(|p| p.fetched_len as usize).unwrap_or(0);
                        self.up_parse = UpParse::Payload { reply, need, buf: Vec::with_capacity(need) };
                    }
                }
                UpParse::Payload { reply, need, buf } => {
                    let remaining = *need - buf.len();
                    let take = remaining.min(bytes.len());
                    buf.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];
                    if buf.len() == *need {
                        let reply = *reply;
                        let payload = std::mem::take(buf);
                        self.complete_upstream_reply(reply, payload);
                        self.up_parse = UpParse::Header(Vec::new());
                    }
                }
            }
        }
        Ok(())
    }

    fn complete_upstream_reply(&mut self, reply: Reply, payload: Vec<u8>) {
        let Some(pending) = self.pending_reads.remove(&reply.handle) else {
            let mut header = Vec::with_capacity(REPLY_HEADER_LEN);
            let _ = reply.put(&mut header);
            self.up_to_down.extend(header);
            return;
        };
        if reply.error != ErrorType::Ok {
            self.queue_reply_to_downstream(reply.handle, reply.error, &[]);
            return;
        }
        let requested = pending.requested_len as usize;
        let served = &payload[..requested.min(payload.len())];
        self.queue_reply_to_downstream(reply.handle, ErrorType::Ok, served);
        if let Some(p) = &mut self.prefetch {
            if payload.len() > requested {
                p.store(pending.offset + requested as u64, payload[requested..].to_vec());
            }
        }
    }
}

/// Run the proxy: accept downstream connections on `listen_addr`,
/// relaying each to `upstream_addr`. `prefetch` enables the read-ahead
/// cache: each miss fetches double the requested length and holds the
/// unconsumed half for a later read.
pub fn run(listen_addr: SocketAddr, upstream_addr: SocketAddr, prefetch: bool) -> io::Result<()> {
    let mut listener = TcpListener::bind(listen_addr)?;
    let mut poll = Poll::new()?;
    const LISTENER: Token = Token(0);
    poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;

    let shared_hello: SharedHello = Arc::new(Mutex::new(None));
    let mut connections: HashMap<Token, Connection> = HashMap::new();
    let mut next_token = 1usize;
    let mut events = Events::with_capacity(128);
    info!(target: "proxy", "relaying {listen_addr} -> {upstream_addr}{}", if prefetch { " (prefetch enabled)" } else { "" });

    loop {
        poll.poll(&mut events, Some(Duration::from_millis(200)))?;
        for event in events.iter() {
            if event.token() == LISTENER {
                loop {
                    match listener.accept() {
                        Ok((mut stream, peer)) => {
                            let token = Token(next_token);
                            next_token += 1;
                            poll.registry().register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;
                            info!(target: "proxy", "downstream connected from {peer}");
                            connections.insert(token, Connection::new(stream, upstream_addr, shared_hello.clone(), prefetch));
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            warn!(target: "proxy", "accept failed: {e}");
                            break;
                        }
                    }
                }
            }
        }
        let mut dead = Vec::new();
        for (token, conn) in connections.iter_mut() {
            if conn.pump().is_err() {
                dead.push(*token);
            }
        }
        for token in dead {
            connections.remove(&token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefetch_hit_requires_full_containment() {
        let mut p = Prefetch::default();
        p.store(100, vec![0xAA; 50]);
        assert_eq!(p.hit(100, 50), Some(vec![0xAA; 50]));
        assert_eq!(p.hit(110, 10), Some(vec![0xAA; 10]));
        assert!(p.hit(90, 20).is_none());
        assert!(p.hit(140, 20).is_none());
    }

    #[test]
    fn prefetch_invalidates_on_overlapping_write() {
        let mut p = Prefetch::default();
        p.store(100, vec![0xAA; 50]);
        p.invalidate_overlap(120, 5);
        assert!(p.cached.is_none());
    }

    #[test]
    fn prefetch_survives_non_overlapping_write() {
        let mut p = Prefetch::default();
        p.store(100, vec![0xAA; 50]);
        p.invalidate_overlap(200, 5);
        assert!(p.hit(100, 50).is_some());
    }

    #[test]
    fn storing_empty_data_clears_the_cache() {
        let mut p = Prefetch::default();
        p.store(100, vec![0xAA; 50]);
        p.store(200, Vec::new());
        assert!(p.cached.is_none());
    }
}
