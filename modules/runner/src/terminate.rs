//! The single way a tool process is stopped: timeout, cancellation and
//! output overflow all end up here.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, warn};

/// SIGTERM to the process group, `grace` to exit, then SIGKILL.
/// Always returns with the child reaped.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    let Some(pid) = child.id() else {
        // already reaped
        return child.wait().await;
    };
    request_stop(child, pid);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            sweep_group(pid);
            status
        }
        Err(_) => {
            warn!(pid, grace_ms = grace.as_millis() as u64, "tool ignored termination, killing");
            sweep_group(pid);
            child.kill().await?;
            child.wait().await
        }
    }
}

/// Kills whatever the tool left behind in its process group after it exited.
pub(crate) fn sweep_group(pid: u32) {
    #[cfg(unix)]
    signal_group(pid, libc::SIGKILL);
    #[cfg(not(unix))]
    let _ = pid;
}

fn request_stop(child: &mut Child, pid: u32) {
    #[cfg(unix)]
    {
        let _ = child;
        signal_group(pid, libc::SIGTERM);
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        if let Err(e) = child.start_kill() {
            debug!(error = %e, "start_kill failed");
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, sig: libc::c_int) {
    // The child was spawned as leader of its own group, so -pid reaches helpers it forked.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), sig) };
    if rc != 0 {
        debug!(pid, sig, error = %io::Error::last_os_error(), "group signal not delivered");
    }
}
