//! Worker process supervisor - owns the worker's lifecycle.
//!
//! Separates process management from the call path, enabling:
//! - `abort()` from any task without taking the invocation lock
//! - Respawn on a broken channel while the gateway keeps its lock
//! - At most one live worker per handle (spawn replaces whatever is recorded)

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::worker::{MAX_RECORD_BYTES_ENV, ProcessRole, ROLE_ENV};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("worker started without {0} pipe")]
    MissingPipe(&'static str),

    #[error("failed to signal worker {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("worker state lock poisoned")]
    Poisoned,
}

/// Extension point for different worker launch strategies.
///
/// Returns the base command; the supervisor wires pipes and the worker role.
pub trait WorkerSpawner: Send + Sync {
    fn command(&self) -> Result<Command, SupervisorError>;
}

/// Re-launch the running program image in worker mode.
pub struct CurrentExeSpawner;

impl WorkerSpawner for CurrentExeSpawner {
    fn command(&self) -> Result<Command, SupervisorError> {
        Ok(Command::new(std::env::current_exe()?))
    }
}

/// Launch a specific program that dispatches on `ACTIVE_OBJECT_ROLE`.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn command(&self) -> Result<Command, SupervisorError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command.envs(self.envs.iter().map(|(k, v)| (k, v)));
        Ok(command)
    }
}

/// Pipe ends wired to one worker incarnation.
pub struct WorkerPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    /// Spawn sequence number this pair belongs to.
    pub generation: u64,
}

struct WorkerProcess {
    child: Child,
    generation: u64,
}

pub struct Supervisor {
    spawner: Box<dyn WorkerSpawner>,
    max_record_bytes: usize,
    worker: StdMutex<Option<WorkerProcess>>,
    spawns: AtomicU64,
}

impl Supervisor {
    pub fn new(spawner: Box<dyn WorkerSpawner>, max_record_bytes: usize) -> Self {
        Self {
            spawner,
            max_record_bytes,
            worker: StdMutex::new(None),
            spawns: AtomicU64::new(0),
        }
    }

    /// Start a worker and record it, terminating any worker recorded before.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(&self) -> Result<WorkerPipes, SupervisorError> {
        let mut command = self.spawner.command()?;
        command
            .env(ROLE_ENV, ProcessRole::Worker.as_str())
            .env(MAX_RECORD_BYTES_ENV, self.max_record_bytes.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or(SupervisorError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SupervisorError::MissingPipe("stdout"))?;

        let generation = self.spawns.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(pid = ?child.id(), generation, "Spawned worker");

        let previous = {
            let mut guard = self.worker.lock().map_err(|_| SupervisorError::Poisoned)?;
            guard.replace(WorkerProcess { child, generation })
        };
        if let Some(previous) = previous {
            tracing::warn!(generation = previous.generation, "Replacing a live worker");
            terminate(previous)?;
        }

        Ok(WorkerPipes {
            stdin,
            stdout,
            generation,
        })
    }

    /// Terminate the recorded worker, if any. Idempotent.
    pub fn kill(&self) -> Result<(), SupervisorError> {
        let taken = {
            let mut guard = self.worker.lock().map_err(|_| SupervisorError::Poisoned)?;
            guard.take()
        };
        match taken {
            Some(worker) => terminate(worker),
            None => Ok(()),
        }
    }

    pub fn respawn(&self) -> Result<WorkerPipes, SupervisorError> {
        self.kill()?;
        self.spawn()
    }

    /// True while a worker is recorded. A crashed worker stays recorded until the
    /// gateway notices the broken channel; an explicitly killed one does not.
    pub fn is_alive(&self) -> bool {
        self.worker
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    pub fn pid(&self) -> Option<u32> {
        self.worker
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().and_then(|w| w.child.id()))
    }

    /// Generation of the recorded worker.
    pub fn generation(&self) -> Option<u64> {
        self.worker
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|w| w.generation))
    }

    /// Number of workers started over this supervisor's lifetime.
    pub fn spawn_count(&self) -> u64 {
        self.spawns.load(Ordering::SeqCst)
    }
}

/// Send SIGTERM and reap without blocking. A worker that has not exited yet is
/// handed to tokio's orphan reaper when `Child` drops.
#[cfg(unix)]
fn terminate(mut worker: WorkerProcess) -> Result<(), SupervisorError> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Some(pid) = worker.child.id() {
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => tracing::debug!(pid, generation = worker.generation, "Sent SIGTERM to worker"),
            // Already gone on its own.
            Err(Errno::ESRCH) => tracing::debug!(pid, "Worker already exited"),
            Err(e) => {
                return Err(SupervisorError::Signal {
                    pid,
                    reason: e.to_string(),
                });
            }
        }
    }
    reap(&mut worker);
    Ok(())
}

#[cfg(not(unix))]
fn terminate(mut worker: WorkerProcess) -> Result<(), SupervisorError> {
    let pid = worker.child.id().unwrap_or_default();
    match worker.child.start_kill() {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
        Err(e) => {
            return Err(SupervisorError::Signal {
                pid,
                reason: e.to_string(),
            });
        }
    }
    reap(&mut worker);
    Ok(())
}

fn reap(worker: &mut WorkerProcess) {
    match worker.child.try_wait() {
        Ok(Some(status)) => tracing::debug!(%status, "Reaped worker"),
        Ok(None) => tracing::trace!("Worker still exiting, leaving it to the reaper"),
        Err(e) => tracing::warn!(error = %e, "Failed to poll worker exit status"),
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Err(e) = self.kill() {
            tracing::warn!(error = %e, "Failed to terminate worker on drop");
        }
    }
}
