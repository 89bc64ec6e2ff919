//! CPU usage of finished instances.
//!
//! A process's usage counters go away once its exit status is collected, so
//! the supervisor waits for the exit without reaping the instance, reads its
//! CPU time, and only then lets tokio reap it.
//!
//! # Platform Behavior
//! - **Linux/Android**: `waitid(WNOWAIT)` woken by `SIGCHLD`, CPU time from
//!   `/proc/<pid>/stat`
//! - **Other Unix**: plain `wait()`; the CPU time is not available

use std::io;
use std::time::Duration;
use tokio::process::Child;

/// Wait until `child` has exited, leaving it unreaped where possible.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub async fn wait_exited(child: &mut Child) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
    use nix::unistd::Pid;
    use tokio::signal::unix::{signal, SignalKind};

    let Some(pid) = child.id() else {
        // Already reaped.
        return Ok(());
    };
    let pid = Pid::from_raw(pid as i32);
    // Registered before the first check so no exit can slip in between.
    let mut sigchld = signal(SignalKind::child())?;
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT | WaitPidFlag::WNOHANG;
    loop {
        match waitid(Id::Pid(pid), flags) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(_) | Err(Errno::ECHILD) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
        if sigchld.recv().await.is_none() {
            return child.wait().await.map(drop);
        }
    }
}

/// Wait until `child` has exited, leaving it unreaped where possible.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub async fn wait_exited(child: &mut Child) -> io::Result<()> {
    child.wait().await.map(drop)
}

/// User CPU time of an exited but not yet reaped child.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub async fn cpu_time(child: &Child) -> Option<Duration> {
    use nix::unistd::{sysconf, SysconfVar};

    let pid = child.id()?;
    let stat = tokio::fs::read_to_string(format!("/proc/{}/stat", pid))
        .await
        .ok()?;
    let ticks_per_second = sysconf(SysconfVar::CLK_TCK).ok()??;
    ticks_to_duration(user_ticks(&stat)?, u64::try_from(ticks_per_second).ok()?)
}

/// User CPU time of an exited but not yet reaped child.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub async fn cpu_time(_child: &Child) -> Option<Duration> {
    None
}

/// The `utime` field of a `/proc/<pid>/stat` line.
#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
fn user_ticks(stat: &str) -> Option<u64> {
    // The command name may contain spaces and parentheses; fields resume
    // after the last ')', starting with the state (field 3).
    let fields = &stat[stat.rfind(')')? + 1..];
    fields.split_whitespace().nth(11)?.parse().ok()
}

#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
fn ticks_to_duration(ticks: u64, per_second: u64) -> Option<Duration> {
    if per_second == 0 {
        return None;
    }
    let nanos = (ticks % per_second) * 1_000_000_000 / per_second;
    Some(Duration::from_secs(ticks / per_second) + Duration::from_nanos(nanos))
}
