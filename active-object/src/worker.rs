//! Worker subprocess - the child side of an active object.
//!
//! The parent side (spawning, killing) is in supervisor.rs and the call path is in
//! gateway.rs.
//!
//! Architecture:
//! - Call channel (stdin): one CallRecord per invocation
//! - Reply channel (stdout): Log records and exactly one terminal reply per call
//!
//! Every outbound record goes through a single [`ReplySink`] queue drained by one
//! writer task, so a method's Log records always precede its terminal reply.

use std::any::Any;
use std::cell::RefCell;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Once;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{DEFAULT_MAX_RECORD_BYTES, JsonLinesCodec};
use crate::bridge::protocol::{CallRecord, Failure, LogEntry, ReplyRecord};
use crate::target::{TargetRegistry, captured_backtrace};

/// Selects which half of the program image runs.
pub const ROLE_ENV: &str = "ACTIVE_OBJECT_ROLE";

/// Max record size, passed from the controller so both ends agree.
pub const MAX_RECORD_BYTES_ENV: &str = "ACTIVE_OBJECT_MAX_RECORD_BYTES";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Controller,
    Worker,
}

impl ProcessRole {
    pub fn current() -> Self {
        match std::env::var(ROLE_ENV).as_deref() {
            Ok("worker") => Self::Worker,
            _ => Self::Controller,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Worker => "worker",
        }
    }
}

/// Handle for queueing records on the reply stream.
///
/// Cloned into the tracing layer so log calls made by target code become Log
/// records. Sending never blocks; records are written asynchronously in order.
#[derive(Clone)]
pub struct ReplySink {
    tx: mpsc::UnboundedSender<ReplyRecord>,
}

impl ReplySink {
    pub fn new(tx: mpsc::UnboundedSender<ReplyRecord>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ReplyRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn send_log(&self, entry: LogEntry) -> io::Result<()> {
        self.send(ReplyRecord::Log { entry })
    }

    pub fn send(&self, record: ReplyRecord) -> io::Result<()> {
        self.tx
            .send(record)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "reply channel closed"))
    }
}

pub struct WorkerConfig {
    pub max_record_bytes: usize,
    /// Move the pipes off fd 0/1 so stray prints cannot corrupt the reply stream.
    pub redirect_stdio: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            redirect_stdio: true,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(MAX_RECORD_BYTES_ENV) {
            match raw.parse() {
                Ok(n) => config.max_record_bytes = n,
                Err(e) => tracing::warn!(value = %raw, error = %e, "Ignoring invalid max record size"),
            }
        }
        config
    }
}

pub type CallStream = Pin<Box<dyn AsyncRead + Send>>;
pub type ReplyStream = Pin<Box<dyn AsyncWrite + Send>>;

/// Run the worker dispatch loop.
///
/// Reads call records until the call stream ends, answering each with exactly one
/// terminal reply. Returns when the controller closes its end.
pub async fn run_worker(
    registry: TargetRegistry,
    sink: ReplySink,
    mut outbound: mpsc::UnboundedReceiver<ReplyRecord>,
    calls: CallStream,
    replies: ReplyStream,
    config: &WorkerConfig,
) -> io::Result<()> {
    install_panic_hook();

    let mut reader = FramedRead::new(
        calls,
        JsonLinesCodec::<CallRecord>::with_max_record_bytes(config.max_record_bytes),
    );
    let mut writer = FramedWrite::new(
        replies,
        JsonLinesCodec::<ReplyRecord>::with_max_record_bytes(config.max_record_bytes),
    );

    let reply_writer = tokio::spawn(async move {
        while let Some(record) = outbound.recv().await {
            if let Err(e) = writer.send(record).await {
                tracing::warn!(error = %e, "Failed to write reply, controller gone?");
                break;
            }
        }
        tracing::trace!("Reply writer exiting");
    });

    loop {
        let call = match reader.next().await {
            Some(Ok(call)) => call,
            Some(Err(e)) => {
                tracing::error!(error = %e, "Call channel error");
                break;
            }
            None => {
                tracing::debug!("Call channel closed, exiting");
                break;
            }
        };

        tracing::debug!(target_type = %call.target_type, method = %call.method, "Dispatching call");
        let reply = dispatch_call(&registry, call).await;
        if sink.send(reply).is_err() {
            break;
        }
    }

    reply_writer.abort();
    Ok(())
}

async fn dispatch_call(registry: &TargetRegistry, call: CallRecord) -> ReplyRecord {
    let registry = registry.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        take_panic_trace();
        panic::catch_unwind(AssertUnwindSafe(|| registry.dispatch(call)))
            .unwrap_or_else(|payload| Err(panic_failure(payload.as_ref(), take_panic_trace())))
    })
    .await;

    match outcome {
        Ok(Ok((retval, state))) => ReplyRecord::Normal { retval, state },
        Ok(Err(failure)) => ReplyRecord::Failed { failure },
        Err(join_err) => ReplyRecord::Failed {
            failure: Failure::new("Panic", join_err.to_string()),
        },
    }
}

thread_local! {
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Record where each panic happened (plus a backtrace when enabled) for the
/// panicking thread, then defer to the previous hook.
fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let mut trace = info
                .location()
                .map(|location| format!("panicked at {location}"))
                .unwrap_or_default();
            if let Some(bt) = captured_backtrace() {
                trace.push('\n');
                trace.push_str(&bt);
            }
            let _ = PANIC_TRACE.try_with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn take_panic_trace() -> Option<String> {
    PANIC_TRACE.with(|slot| slot.borrow_mut().take())
}

fn panic_failure(payload: &(dyn Any + Send), trace: Option<String>) -> Failure {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "method panicked".to_string());
    Failure::new("Panic", message).with_trace(trace.unwrap_or_default())
}

/// Entry point for a program image started with `ACTIVE_OBJECT_ROLE=worker`.
///
/// Installs the log-forwarding subscriber, isolates stdio, then serves calls until
/// the controller hangs up.
pub fn run_worker_process(registry: TargetRegistry) -> io::Result<()> {
    let config = WorkerConfig::from_env();
    let (sink, outbound) = ReplySink::channel();
    crate::logging::init_worker_tracing(sink.clone());

    let (calls, replies): (CallStream, ReplyStream) = if config.redirect_stdio {
        let fds = crate::fd_redirect::redirect_fds_for_worker_isolation()?;
        (fds.calls, fds.replies)
    } else {
        (Box::pin(tokio::io::stdin()), Box::pin(tokio::io::stdout()))
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    tracing::debug!(targets = registry.len(), "Worker starting");
    runtime.block_on(run_worker(registry, sink, outbound, calls, replies, &config))
}
