//! Single-line, key=value status snapshot: migration fields only appear
//! while a mirror is actually running.

use crate::server::Server;
use std::fmt::Write as _;

/// A point-in-time snapshot of the export's state.
pub struct StatusSnapshot {
    pub pid: u32,
    pub size: u64,
    pub has_control: bool,
    pub is_mirroring: bool,
    pub clients_allowed: bool,
    pub num_clients: usize,
    pub mirror: Option<MirrorStatus>,
}

/// Fields only meaningful while a migration is in flight.
pub struct MirrorStatus {
    pub migration_duration: f64,
    pub migration_speed: f64,
    pub migration_speed_limit: Option<u64>,
    pub migration_seconds_left: f64,
    pub migration_bytes_left: u64,
}

/// Gather a consistent snapshot of `server`, locking the same mirror
/// lifecycle mutex `start_mirror`/`break_mirror` use so the mirror
/// fields can't be torn mid-read.
pub fn gather(server: &Server) -> StatusSnapshot {
    let _guard = server.l_mirror.lock();
    let mirror = server.mirror.lock().unwrap();
    StatusSnapshot {
        pid: std::process::id(),
        size: server.backing.size(),
        has_control: server.has_control.load(std::sync::atomic::Ordering::SeqCst),
        is_mirroring: mirror.is_some(),
        clients_allowed: server.accepting_clients(),
        num_clients: server.client_count(),
        mirror: mirror.as_ref().map(|m| {
            let speed = m.current_bps();
            let bytes_left = m.remaining_bytes();
            let seconds_left = if speed > 0.0 { bytes_left as f64 / speed } else { 0.0 };
            MirrorStatus {
                migration_duration: m.duration().unwrap_or_default().as_secs_f64(),
                migration_speed: speed,
                migration_speed_limit: m.max_bps(),
                migration_seconds_left: seconds_left,
                migration_bytes_left: bytes_left,
            }
        }),
    }
}

impl StatusSnapshot {
    /// Render as a single `key=value ...` line, the format the control
    /// socket's `status` command returns.
    pub fn format_line(&self) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "pid={} size={} has_control={} is_mirroring={} clients_allowed={} num_clients={}",
            self.pid, self.size, self.has_control, self.is_mirroring, self.clients_allowed, self.num_clients
        );
        if let Some(m) = &self.mirror {
            let _ = write!(
                out,
                " migration_duration={:.1} migration_speed={:.0}",
                m.migration_duration, m.migration_speed
            );
            if let Some(limit) = m.migration_speed_limit {
                let _ = write!(out, " migration_speed_limit={limit}");
            }
            let _ = write!(
                out,
                " migration_seconds_left={:.1} migration_bytes_left={}",
                m.migration_seconds_left, m.migration_bytes_left
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_omits_migration_fields_when_idle() {
        let snapshot = StatusSnapshot {
            pid: 1,
            size: 4096,
            has_control: true,
            is_mirroring: false,
            clients_allowed: true,
            num_clients: 0,
            mirror: None,
        };
        let line = snapshot.format_line();
        assert!(!line.contains("migration"));
        assert!(line.contains("size=4096"));
        assert!(line.contains("is_mirroring=false"));
    }

    #[test]
    fn line_includes_migration_fields_when_active() {
        let snapshot = StatusSnapshot {
            pid: 1,
            size: 4096,
            has_control: true,
            is_mirroring: true,
            clients_allowed: false,
            num_clients: 1,
            mirror: Some(MirrorStatus {
                migration_duration: 12.5,
                migration_speed: 1024.0,
                migration_speed_limit: Some(2048),
                migration_seconds_left: 3.0,
                migration_bytes_left: 3072,
            }),
        };
        let line = snapshot.format_line();
        assert!(line.contains("is_mirroring=true"));
        assert!(line.contains("migration_duration=12.5"));
        assert!(line.contains("migration_speed=1024"));
        assert!(line.contains("migration_speed_limit=2048"));
        assert!(line.contains("migration_bytes_left=3072"));
    }

    #[test]
    fn unlimited_speed_cap_omits_the_limit_field() {
        let snapshot = StatusSnapshot {
            pid: 1,
            size: 4096,
            has_control: true,
            is_mirroring: true,
            clients_allowed: false,
            num_clients: 0,
            mirror: Some(MirrorStatus {
                migration_duration: 1.0,
                migration_speed: 100.0,
                migration_speed_limit: None,
                migration_seconds_left: 1.0,
                migration_bytes_left: 100,
            }),
        };
        assert!(!snapshot.format_line().contains("migration_speed_limit"));
    }
}
