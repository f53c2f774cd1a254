//! File descriptor redirection for worker isolation.
//!
//! The worker uses fd 0 (stdin) for call records and fd 1 (stdout) for replies. Target
//! code that prints, reads stdin, or spawns subprocesses would otherwise corrupt the
//! channel by touching those fds directly.
//!
//! We move both pipe ends to fresh close-on-exec fds, then point fd 0 at /dev/null and
//! fd 1 at the worker's stderr. Stray output ends up on stderr, which the controller
//! inherits.
//!
//! CRITICAL: Must be called before any target code runs.
//!
//! ## Safety contracts
//!
//! All `unsafe` blocks in this module rely on these guarantees:
//! 1. Called once, early in the worker, before any task touches fds 0/1/2
//! 2. Standard fds (0, 1, 2) are guaranteed open by the OS at process startup
//! 3. `forget` on the fd 0/1 wrappers prevents closing the standard fds

use std::io;

use crate::worker::{CallStream, ReplyStream};

pub struct WorkerChannel {
    pub calls: CallStream,
    pub replies: ReplyStream,
}

/// Detach the call/reply pipes from the standard fds.
#[cfg(unix)]
pub fn redirect_fds_for_worker_isolation() -> io::Result<WorkerChannel> {
    use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd};

    use nix::unistd::dup2;

    // Safety: fds 0 and 1 are open at startup and nothing else is using them yet.
    // try_clone_to_owned dups with F_DUPFD_CLOEXEC, so subprocesses never inherit them.
    let calls_fd = unsafe { BorrowedFd::borrow_raw(0) }.try_clone_to_owned()?;
    let replies_fd = unsafe { BorrowedFd::borrow_raw(1) }.try_clone_to_owned()?;

    tracing::trace!(?calls_fd, ?replies_fd, "Duped channel fds");

    let devnull = std::fs::File::open("/dev/null")?;
    let mut target_fd0 = unsafe { OwnedFd::from_raw_fd(0) };
    let replaced_stdin = dup2(&devnull, &mut target_fd0)
        .map_err(|e| io::Error::other(format!("dup2(stdin) failed: {}", e)));
    std::mem::forget(target_fd0); // Don't close fd 0
    replaced_stdin?;

    let mut target_fd1 = unsafe { OwnedFd::from_raw_fd(1) };
    let replaced_stdout = dup2(unsafe { BorrowedFd::borrow_raw(2) }, &mut target_fd1)
        .map_err(|e| io::Error::other(format!("dup2(stdout) failed: {}", e)));
    std::mem::forget(target_fd1); // Don't close fd 1
    replaced_stdout?;

    tracing::debug!("Worker stdio isolated from channel");

    Ok(WorkerChannel {
        calls: Box::pin(tokio::fs::File::from_std(std::fs::File::from(calls_fd))),
        replies: Box::pin(tokio::fs::File::from_std(std::fs::File::from(replies_fd))),
    })
}

#[cfg(not(unix))]
pub fn redirect_fds_for_worker_isolation() -> io::Result<WorkerChannel> {
    // No fd redirection on non-Unix - stray prints will corrupt the reply stream
    Ok(WorkerChannel {
        calls: Box::pin(tokio::io::stdin()),
        replies: Box::pin(tokio::io::stdout()),
    })
}
