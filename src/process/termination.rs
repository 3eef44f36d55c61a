//! Graceful termination of a spawned process group.

use std::time::Duration;

use command_group::AsyncGroupChild;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

/// Sends `SIGTERM` to the group, waits up to `grace`, then sends `SIGKILL`
/// and reaps the leader.
pub(super) async fn terminate_process_group(child: &mut AsyncGroupChild, grace: Duration) {
    let Some(pid) = child.inner().id() else {
        return;
    };
    let Ok(raw) = i32::try_from(pid) else {
        tracing::warn!(pid, "process id out of range, cannot signal group");
        return;
    };
    let group = Pid::from_raw(-raw);

    if let Err(err) = signal::kill(group, Signal::SIGTERM)
        && err != Errno::ESRCH
    {
        tracing::warn!(pid, error = ?err, "SIGTERM to process group failed");
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if child.inner().try_wait().ok().flatten().is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    if let Err(err) = signal::kill(group, Signal::SIGKILL)
        && err != Errno::ESRCH
    {
        tracing::warn!(pid, error = ?err, "SIGKILL to process group failed");
    }

    if let Err(err) = child.wait().await {
        tracing::warn!(pid, error = %err, "failed to reap terminated process");
    }
}
