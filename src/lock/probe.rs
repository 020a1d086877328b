//! Process liveness checks used to tell live lock owners from stale ones.

use std::fmt;

/// Answers questions about processes on this machine.
///
/// The system implementation asks the OS; tests substitute a fake to simulate
/// other processes holding locks.
pub trait ProcessProbe: Send + Sync + fmt::Debug {
    /// Whether a process with `pid` currently exists.
    fn is_alive(&self, pid: u32) -> bool;

    /// An opaque start time for `pid`, if the platform exposes one.
    ///
    /// Two different processes that reuse the same pid report different values.
    fn start_time(&self, pid: u32) -> Option<u64>;

    /// Name of this machine, recorded in lock markers.
    fn host(&self) -> String;

    fn current_pid(&self) -> u32 {
        std::process::id()
    }
}

/// [`ProcessProbe`] backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        process_exists(pid)
    }

    fn start_time(&self, pid: u32) -> Option<u64> {
        process_start_time(pid)
    }

    fn host(&self) -> String {
        host_name()
    }
}

/// Check if process exists (platform-specific)
#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // The process exists but belongs to another user.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_exists(_pid: u32) -> bool {
    // Conservative: assume process exists
    true
}

/// Field 22 of `/proc/<pid>/stat`: start time in clock ticks since boot.
#[cfg(target_os = "linux")]
fn process_start_time(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_stat_start_time(&stat)
}

#[cfg(not(target_os = "linux"))]
fn process_start_time(_pid: u32) -> Option<u64> {
    None
}

/// The command name in field 2 may contain spaces and parentheses, so fields
/// are counted from the last `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_stat_start_time(stat: &str) -> Option<u64> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    // after_comm starts at field 3 (state); start time is field 22.
    after_comm.split_whitespace().nth(19)?.parse().ok()
}

#[cfg(unix)]
fn host_name() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(not(unix))]
fn host_name() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}
