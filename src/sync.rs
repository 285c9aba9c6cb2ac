//! Small concurrency primitives shared by the server, mirror, and
//! control socket: a self-pipe for waking a `select`/`poll` loop from
//! another thread, a mutex that remembers who holds it, and a
//! single-slot rendezvous mailbox.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// A non-blocking pipe used purely to wake a poller blocked on its read
/// end. Writing (or reading) more than one byte never happens: each
/// `signal` deposits one byte, each `clear` drains everything currently
/// queued and reports whether anything was there.
pub struct SelfPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl SelfPipe {
    /// Create a new self-pipe with both ends non-blocking.
    pub fn new() -> nix::Result<Self> {
        let (read, write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_NONBLOCK)?;
        Ok(SelfPipe { read, write })
    }

    /// Raw fd to register with a poller.
    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Wake anyone blocked reading `read_fd`.
    pub fn signal(&self) {
        let buf = [b'X'];
        let _ = nix::unistd::write(&self.write, &buf);
    }

    /// Drain any pending signal. Returns `true` if one was consumed.
    pub fn clear(&self) -> bool {
        let mut buf = [0u8; 64];
        let mut any = false;
        loop {
            match nix::unistd::read(self.read.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(_) => any = true,
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
        any
    }
}

/// A mutex that records which thread is currently holding it, so a
/// cleanup path running on a different thread (or a signal-adjacent
/// handler) can check [`FlexMutex::held_by_current_thread`] before
/// deciding whether it's safe to touch the guarded state directly.
pub struct FlexMutex<T> {
    inner: Mutex<T>,
    holder: Mutex<Option<ThreadId>>,
}

/// Guard returned by [`FlexMutex::lock`]; clears the recorded holder on
/// drop.
pub struct FlexGuard<'a, T> {
    guard: Option<std::sync::MutexGuard<'a, T>>,
    holder: &'a Mutex<Option<ThreadId>>,
}

impl<T> FlexMutex<T> {
    /// Wrap `value` in a flex-mutex.
    pub fn new(value: T) -> Self {
        FlexMutex { inner: Mutex::new(value), holder: Mutex::new(None) }
    }

    /// Lock, recording the current thread as holder.
    pub fn lock(&self) -> FlexGuard<'_, T> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *self.holder.lock().unwrap() = Some(std::thread::current().id());
        FlexGuard { guard: Some(guard), holder: &self.holder }
    }

    /// Whether the calling thread is the current holder. Used by
    /// cleanup code that must not double-lock its own mutex while
    /// unwinding.
    pub fn held_by_current_thread(&self) -> bool {
        *self.holder.lock().unwrap() == Some(std::thread::current().id())
    }
}

impl<'a, T> std::ops::Deref for FlexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<'a, T> std::ops::DerefMut for FlexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<'a, T> Drop for FlexGuard<'a, T> {
    fn drop(&mut self) {
        self.guard.take();
        *self.holder.lock().unwrap() = None;
    }
}

/// A single-slot rendezvous: `post` blocks while the slot is occupied,
/// `receive` blocks while it's empty. Used to hand a mirror attempt's
/// outcome back to whichever control-socket connection asked for it.
pub struct Mailbox<T> {
    state: Mutex<Option<T>>,
    filled: Condvar,
    emptied: Condvar,
}

impl<T> Mailbox<T> {
    /// An empty mailbox.
    pub fn new() -> Self {
        Mailbox { state: Mutex::new(None), filled: Condvar::new(), emptied: Condvar::new() }
    }

    /// Block until the slot is empty, then deposit `value`.
    pub fn post(&self, value: T) {
        let mut slot = self.state.lock().unwrap();
        while slot.is_some() {
            slot = self.emptied.wait(slot).unwrap();
        }
        *slot = Some(value);
        self.filled.notify_one();
    }

    /// Block until a value is present, then take it.
    pub fn receive(&self) -> T {
        let mut slot = self.state.lock().unwrap();
        while slot.is_none() {
            slot = self.filled.wait(slot).unwrap();
        }
        let value = slot.take().unwrap();
        self.emptied.notify_one();
        value
    }

    /// Non-blocking check.
    pub fn is_full(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A background timer that shuts a socket down if not disarmed before a
/// deadline. Used by the client handler to bound how long any single
/// request may take, without dedicating a signal handler to it (signal
/// delivery is out of scope here; a dedicated watcher thread gives the
/// same guarantee with a plain `shutdown(2)`).
pub struct KillSwitch {
    deadline_millis: AtomicU64,
    epoch: Instant,
}

const DISARMED: u64 = u64::MAX;

impl KillSwitch {
    /// A disarmed kill switch watching `fd`.
    pub fn new() -> Self {
        KillSwitch { deadline_millis: AtomicU64::new(DISARMED), epoch: Instant::now() }
    }

    /// Arm the switch to fire `timeout` from now.
    pub fn arm(&self, timeout: Duration) {
        let at = self.epoch.elapsed().saturating_add(timeout).as_millis() as u64;
        self.deadline_millis.store(at, Ordering::SeqCst);
    }

    /// Disarm; no shutdown will happen until armed again.
    pub fn disarm(&self) {
        self.deadline_millis.store(DISARMED, Ordering::SeqCst);
    }

    /// Spawn the watcher thread, which calls `on_fire` once if the
    /// deadline is ever reached while armed, then exits.
    pub fn spawn_watcher(self: std::sync::Arc<Self>, on_fire: impl Fn() + Send + 'static) {
        std::thread::spawn(move || loop {
            std::thread::sleep(Duration::from_millis(200));
            let deadline = self.deadline_millis.load(Ordering::SeqCst);
            if deadline == DISARMED {
                continue;
            }
            if self.epoch.elapsed().as_millis() as u64 >= deadline {
                on_fire();
                return;
            }
        });
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn self_pipe_signals_across_threads() {
        let pipe = Arc::new(SelfPipe::new().unwrap());
        assert!(!pipe.clear());
        let p2 = pipe.clone();
        let t = thread::spawn(move || p2.signal());
        t.join().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(pipe.clear());
        assert!(!pipe.clear());
    }

    #[test]
    fn flex_mutex_tracks_holder() {
        let m = FlexMutex::new(0);
        assert!(!m.held_by_current_thread());
        {
            let mut g = m.lock();
            *g += 1;
            assert!(m.held_by_current_thread());
        }
        assert!(!m.held_by_current_thread());
    }

    #[test]
    fn mailbox_round_trips() {
        let mbox = Arc::new(Mailbox::new());
        let m2 = mbox.clone();
        let t = thread::spawn(move || m2.post(7));
        let v = mbox.receive();
        t.join().unwrap();
        assert_eq!(v, 7);
    }

    #[test]
    fn kill_switch_fires_when_armed_and_expired() {
        let ks = Arc::new(KillSwitch::new());
        let (tx, rx) = std::sync::mpsc::channel();
        ks.clone().spawn_watcher(move || tx.send(()).unwrap());
        ks.arm(Duration::from_millis(50));
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }
}
