//! Invocation gateway - the controller's call path.
//!
//! Flow for one invocation:
//! 1. Take the handle's lock (one call in flight per handle)
//! 2. Spawn a worker if none is recorded
//! 3. Write the call record, then read replies: replay Log records, stop at the
//!    terminal Normal/Failed record
//! 4. On a broken channel: respawn and resend the same record, up to the retry budget
//! 5. If the worker was killed on purpose while the call was outstanding, return
//!    no result and no error

use std::io;

use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonLinesCodec;
use crate::bridge::protocol::{CallRecord, Failure, LogEntry, LogLevel, ReplyRecord};
use crate::supervisor::{Supervisor, SupervisorError, WorkerPipes};
use crate::target::ActiveTarget;

/// Replay a worker's log call through the controller's subscriber, keeping the
/// worker's target and level.
pub(crate) fn emit_worker_log(entry: &LogEntry) {
    emit_log(&entry.logger, entry.level, &entry.render());
}

fn emit_log(target: &str, level: LogLevel, msg: &str) {
    use std::collections::HashMap;
    use std::sync::OnceLock;
    use tracing::{
        Level, Metadata,
        callsite::{Callsite, Identifier},
        field::FieldSet,
    };

    struct DummyCallsite;
    impl Callsite for DummyCallsite {
        fn set_interest(&self, _: tracing::subscriber::Interest) {}
        fn metadata(&self) -> &Metadata<'static> {
            unreachable!()
        }
    }

    static DUMMY: DummyCallsite = DummyCallsite;
    static CALLSITES: OnceLock<
        std::sync::Mutex<HashMap<(String, Level), &'static Metadata<'static>>>,
    > = OnceLock::new();
    static FIELDS: &[&str] = &["message"];

    let lvl = Level::from(level);

    let callsites = CALLSITES.get_or_init(|| std::sync::Mutex::new(HashMap::new()));
    let meta: &'static Metadata<'static> = {
        let mut map = match callsites.lock() {
            Ok(guard) => guard,
            Err(_poisoned) => {
                tracing::error!("Worker log callsite cache poisoned");
                return;
            }
        };
        // Leaked once per (target, level); workers log from a small fixed set.
        *map.entry((target.to_string(), lvl)).or_insert_with(|| {
            let target_static: &'static str = Box::leak(target.to_string().into_boxed_str());
            Box::leak(Box::new(Metadata::new(
                "worker_log",
                target_static,
                lvl,
                Some(file!()),
                Some(line!()),
                Some(module_path!()),
                FieldSet::new(FIELDS, Identifier(&DUMMY)),
                tracing::metadata::Kind::EVENT,
            )))
        })
    };

    tracing::dispatcher::get_default(|dispatch| {
        if dispatch.enabled(meta) {
            let fields = meta.fields();
            if let Some(field) = fields.field("message") {
                let value_array = [(&field, Some(&msg as &dyn tracing::Value))];
                let values = fields.value_set(&value_array);
                dispatch.event(&tracing::Event::new(meta, &values));
            }
        }
    });
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// The method raised inside the worker. Never retried.
    #[error("remote method failed: {0}")]
    Remote(Failure),

    /// The channel stayed broken through every respawn.
    #[error("worker channel broken after {attempts} attempts: {source}")]
    Channel {
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("failed to snapshot target: {0}")]
    Snapshot(#[source] serde_json::Error),

    #[error("failed to merge worker state: {0}")]
    State(#[source] serde_json::Error),

    #[error("unexpected return value: {0}")]
    Decode(#[source] serde_json::Error),

    /// Double-underscore names belong to the handle, not the target.
    #[error("`{0}` is reserved and cannot be invoked remotely")]
    ReservedMethod(String),
}

impl InvokeError {
    /// The worker's failure description, for `Remote` errors.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Remote(failure) => Some(failure),
            _ => None,
        }
    }
}

pub(crate) fn is_reserved(name: &str) -> bool {
    name.len() >= 4 && name.starts_with("__") && name.ends_with("__")
}

struct Channel {
    writer: FramedWrite<ChildStdin, JsonLinesCodec<CallRecord>>,
    reader: FramedRead<ChildStdout, JsonLinesCodec<ReplyRecord>>,
    generation: u64,
}

impl Channel {
    fn open(pipes: WorkerPipes, max_record_bytes: usize) -> Self {
        Self {
            writer: FramedWrite::new(
                pipes.stdin,
                JsonLinesCodec::with_max_record_bytes(max_record_bytes),
            ),
            reader: FramedRead::new(
                pipes.stdout,
                JsonLinesCodec::with_max_record_bytes(max_record_bytes),
            ),
            generation: pipes.generation,
        }
    }

    /// One request/response exchange. Any `Err` means the channel is unusable.
    async fn exchange(&mut self, call: &CallRecord) -> io::Result<Result<(Value, Value), Failure>> {
        self.writer.send(call.clone()).await?;

        loop {
            match self.reader.next().await {
                Some(Ok(ReplyRecord::Log { entry })) => emit_worker_log(&entry),
                Some(Ok(ReplyRecord::Normal { retval, state })) => return Ok(Ok((retval, state))),
                Some(Ok(ReplyRecord::Failed { failure })) => return Ok(Err(failure)),
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "worker closed the reply stream",
                    ));
                }
            }
        }
    }
}

struct GatewayState<T> {
    target: T,
    channel: Option<Channel>,
}

pub struct Gateway<T> {
    state: Mutex<GatewayState<T>>,
    supervisor: Supervisor,
    retry_budget: u32,
    max_record_bytes: usize,
}

impl<T: ActiveTarget> Gateway<T> {
    /// Wrap `target` and start its worker immediately.
    pub fn new(
        target: T,
        supervisor: Supervisor,
        retry_budget: u32,
        max_record_bytes: usize,
    ) -> Result<Self, SupervisorError> {
        let channel = Channel::open(supervisor.spawn()?, max_record_bytes);
        Ok(Self {
            state: Mutex::new(GatewayState {
                target,
                channel: Some(channel),
            }),
            supervisor,
            retry_budget,
            max_record_bytes,
        })
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Run `method` in the worker.
    ///
    /// `Ok(None)` means the call was aborted by an explicit kill.
    pub async fn invoke(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Option<Value>, InvokeError> {
        if is_reserved(method) {
            return Err(InvokeError::ReservedMethod(method.to_string()));
        }

        let mut state = self.state.lock().await;

        let snapshot = serde_json::to_value(&state.target).map_err(InvokeError::Snapshot)?;
        let call = CallRecord::new(T::type_tag(), snapshot, method, args, kwargs);

        let recorded = self.supervisor.generation();
        let mut channel = match state.channel.take() {
            Some(channel) if recorded == Some(channel.generation) => channel,
            _ => {
                tracing::debug!(method, "No live worker, spawning");
                Channel::open(self.supervisor.spawn()?, self.max_record_bytes)
            }
        };

        let mut retries = self.retry_budget;
        let mut attempts = 0;
        loop {
            attempts += 1;
            tracing::trace!(method, attempts, generation = channel.generation, "Sending call");

            match channel.exchange(&call).await {
                Ok(Ok((retval, snapshot))) => {
                    state.channel = Some(channel);
                    state
                        .target
                        .import_state(snapshot)
                        .map_err(InvokeError::State)?;
                    return Ok(Some(retval));
                }
                Ok(Err(failure)) => {
                    state.channel = Some(channel);
                    tracing::debug!(method, kind = %failure.kind, "Remote method failed");
                    return Err(InvokeError::Remote(failure));
                }
                Err(e) => {
                    if !self.supervisor.is_alive() {
                        tracing::info!(method, "Call aborted, worker was killed");
                        return Ok(None);
                    }
                    if retries == 0 {
                        tracing::error!(method, attempts, error = %e, "Worker channel broken, giving up");
                        return Err(InvokeError::Channel {
                            attempts,
                            source: e,
                        });
                    }
                    retries -= 1;
                    tracing::warn!(method, error = %e, retries_left = retries, "Worker channel broken, respawning");
                    channel = Channel::open(self.supervisor.respawn()?, self.max_record_bytes);
                }
            }
        }
    }

    /// Read the controller's copy of the target. Waits for any in-flight call.
    pub async fn inspect<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let state = self.state.lock().await;
        f(&state.target)
    }

    pub fn into_target(self) -> T {
        self.state.into_inner().target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    #[test]
    fn reserved_names_are_double_underscore_framed() {
        assert!(is_reserved("__getstate__"));
        assert!(is_reserved("__del__"));
        assert!(!is_reserved("__"));
        assert!(!is_reserved("___"));
        assert!(!is_reserved("_private"));
        assert!(!is_reserved("__init"));
        assert!(!is_reserved("fetch_item"));
    }

    #[test]
    fn remote_error_exposes_failure() {
        let err = InvokeError::Remote(Failure::new("Application", "bad md5sum"));
        assert_eq!(err.failure().map(|f| f.kind.as_str()), Some("Application"));
        assert_eq!(err.to_string(), "remote method failed: Application: bad md5sum");
        assert!(InvokeError::ReservedMethod("__x__".into()).failure().is_none());
    }

    type Seen = std::sync::Arc<std::sync::Mutex<Vec<(String, tracing::Level, String)>>>;

    struct Recorder(Seen);

    impl<S: tracing::Subscriber> Layer<S> for Recorder {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            struct Msg(String);
            impl tracing::field::Visit for Msg {
                fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
                    if field.name() == "message" {
                        self.0 = value.to_string();
                    }
                }
                fn record_debug(&mut self, _: &tracing::field::Field, _: &dyn std::fmt::Debug) {}
            }
            let mut msg = Msg(String::new());
            event.record(&mut msg);
            let meta = event.metadata();
            self.0
                .lock()
                .unwrap()
                .push((meta.target().to_string(), *meta.level(), msg.0));
        }
    }

    #[test]
    fn worker_logs_replay_with_original_target_and_level() {
        let seen = Seen::default();
        let subscriber = tracing_subscriber::registry().with(Recorder(seen.clone()));
        tracing::subscriber::with_default(subscriber, || {
            emit_worker_log(&LogEntry {
                logger: "grinder::kickstart".into(),
                level: LogLevel::Warn,
                message: "Unauthorized request".into(),
                args: vec!["status=401".into()],
            });
            emit_worker_log(&LogEntry {
                logger: "grinder::kickstart".into(),
                level: LogLevel::Warn,
                message: "retrying".into(),
                args: vec![],
            });
        });

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (
                    "grinder::kickstart".to_string(),
                    tracing::Level::WARN,
                    "Unauthorized request status=401".to_string()
                ),
                (
                    "grinder::kickstart".to_string(),
                    tracing::Level::WARN,
                    "retrying".to_string()
                ),
            ]
        );
    }
}
