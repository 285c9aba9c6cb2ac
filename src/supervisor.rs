//! Wraps one mirror attempt with retry: if the first attempt reaches
//! `Go`, a later transport failure gets one retry per drop after a
//! short delay; anything that fails before `Go`, or an explicit
//! abandon, is never retried.

use crate::bitset::Bitset;
use crate::mirror::{FinishAction, Mirror, MirrorControl, MirrorOutcome, MirrorState, RETRY_DELAY};
use crate::server::Server;
use crate::sync::Mailbox;
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::Arc;

/// A handle the control socket and `status` use to steer and observe a
/// running (or retrying) mirror without touching the supervisor thread
/// directly.
pub struct MirrorHandle {
    control: std::sync::Mutex<MirrorControl>,
}

impl MirrorHandle {
    /// Ask the mirror to abandon at its next opportunity.
    pub fn abandon(&self) {
        self.control.lock().unwrap().abandon();
    }

    /// Update the bandwidth cap.
    pub fn set_max_bps(&self, bps: u64) {
        self.control.lock().unwrap().set_max_bps(bps);
    }

    /// Current externally visible state.
    pub fn state(&self) -> MirrorState {
        self.control.lock().unwrap().state()
    }

    /// Current throughput estimate.
    pub fn current_bps(&self) -> f64 {
        self.control.lock().unwrap().current_bps()
    }

    /// The configured bandwidth cap, or `None` if unlimited.
    pub fn max_bps(&self) -> Option<u64> {
        self.control.lock().unwrap().max_bps()
    }

    /// How long the migration has been running.
    pub fn duration(&self) -> Option<std::time::Duration> {
        self.control.lock().unwrap().duration()
    }

    /// Bytes left to transfer as of the last loop iteration.
    pub fn remaining_bytes(&self) -> u64 {
        self.control.lock().unwrap().remaining_bytes()
    }
}

/// Start the supervisor thread for one migration. Blocks the calling
/// thread until the first attempt reaches `Go` or fails, returning both
/// a handle to the (possibly still-retrying) mirror and that first
/// outcome.
pub fn spawn(
    server: Arc<Server>,
    dirty: Arc<Bitset>,
    connect_to: SocketAddr,
    connect_from: Option<SocketAddr>,
    max_bps: Option<u64>,
    finish: FinishAction,
) -> (MirrorHandle, MirrorOutcome) {
    let size = server.backing.size();
    let (mirror, control) = Mirror::new(connect_to, connect_from, dirty, server.backing.clone(), size, max_bps);
    let first_outcome: Arc<Mailbox<MirrorOutcome>> = Arc::new(Mailbox::new());
    let handle = MirrorHandle { control: std::sync::Mutex::new(control) };

    let mailbox_for_thread = first_outcome.clone();
    std::thread::spawn(move || run_supervised(server, mirror, finish, mailbox_for_thread));

    let outcome = first_outcome.receive();
    (handle, outcome)
}

fn run_supervised(server: Arc<Server>, mut mirror: Mirror, finish: FinishAction, first_outcome: Arc<Mailbox<MirrorOutcome>>) {
    let mut stream = match mirror.connect() {
        Ok(s) => s,
        Err(e) => {
            warn!(target: "mirror", "first connect attempt failed: {e}");
            first_outcome.post(MirrorOutcome { state: mirror.current_state() });
            server.clear_mirror();
            return;
        }
    };
    first_outcome.post(MirrorOutcome { state: MirrorState::Go });

    loop {
        match mirror.run(&server, &mut stream, finish) {
            Ok(()) => break,
            Err(e) => {
                if matches!(mirror.current_state(), MirrorState::Abandoned) {
                    break;
                }
                warn!(target: "mirror", "transfer failed, will retry: {e}");
                std::thread::sleep(RETRY_DELAY);
                mirror.reset();
                match mirror.connect() {
                    Ok(s) => stream = s,
                    Err(e) => {
                        warn!(target: "mirror", "retry connect failed, giving up: {e}");
                        break;
                    }
                }
            }
        }
    }
    info!(target: "mirror", "supervisor exiting");
    server.clear_mirror();
}

