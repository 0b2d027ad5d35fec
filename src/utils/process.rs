//! Liveness of the sandboxed process.

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// True while `pid` exists. A process we may not signal still counts.
pub fn process_alive(pid: Pid) -> bool {
    match kill(pid, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Resolve once `pid` has exited, checking every `interval`.
pub async fn wait_for_exit(pid: Pid, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if !process_alive(pid) {
            return;
        }
    }
}
