//! Custom tracing layer for the worker subprocess.
//!
//! Ships tracing events over the reply stream as `Log` records, preserving target and
//! level, instead of writing them locally. Optionally mirrors events to stderr for
//! direct debugging (controlled by ACTIVE_OBJECT_WORKER_DIRECT_LOG=1).

use std::backtrace::Backtrace;
use std::io::Write;

use tracing::Subscriber;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, Layer};

use crate::bridge::protocol::{LogEntry, LogLevel};
use crate::target::captured_backtrace;
use crate::worker::ReplySink;

/// Events from the codec are never forwarded; encoding a Log record would log again.
const CODEC_TARGET: &str = "active_object::bridge::codec";

/// Field that requests a backtrace be appended to the message.
const BACKTRACE_FIELD: &str = "backtrace";

pub const DIRECT_LOG_ENV: &str = "ACTIVE_OBJECT_WORKER_DIRECT_LOG";

pub struct WorkerTracingLayer {
    sink: ReplySink,
    direct_log: bool,
}

impl WorkerTracingLayer {
    pub fn new(sink: ReplySink) -> Self {
        let direct_log = std::env::var(DIRECT_LOG_ENV).as_deref() == Ok("1");
        Self { sink, direct_log }
    }
}

impl<S> Layer<S> for WorkerTracingLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();
        if target.starts_with(CODEC_TARGET) {
            return;
        }

        let mut visitor = EntryVisitor::default();
        event.record(&mut visitor);
        let entry = visitor.finish(target, metadata.level().into());

        if self.direct_log {
            let _ = writeln!(
                std::io::stderr(),
                "worker_direct_log::{} [{}] {}",
                entry.logger,
                entry.level.as_str(),
                entry.render()
            );
        }

        // Fire and forget: the caller never waits on the controller.
        let _ = self.sink.send_log(entry);
    }
}

#[derive(Default)]
struct EntryVisitor {
    message: Option<String>,
    args: Vec<String>,
    errors: Vec<String>,
    want_backtrace: bool,
}

impl EntryVisitor {
    fn finish(self, target: &str, level: LogLevel) -> LogEntry {
        let mut errors = self.errors.into_iter();
        let mut message = match self.message {
            Some(message) => message,
            None => errors.next().unwrap_or_default(),
        };
        let mut args = self.args;
        args.extend(errors);

        if self.want_backtrace {
            message.push('\n');
            message.push_str(&Backtrace::force_capture().to_string());
        }

        LogEntry {
            logger: target.to_string(),
            level,
            message,
            args,
        }
    }
}

impl Visit for EntryVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut rendered = format!("{:?}", value);
        if rendered.len() >= 2 && rendered.starts_with('"') && rendered.ends_with('"') {
            rendered = rendered[1..rendered.len() - 1].to_string();
        }
        if field.name() == "message" {
            self.message = Some(rendered);
        } else {
            self.args.push(format!("{}={}", field.name(), rendered));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.args.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == BACKTRACE_FIELD {
            self.want_backtrace = value;
        } else {
            self.args.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        let mut rendered = value.to_string();
        let mut source = value.source();
        while let Some(cause) = source {
            rendered.push_str("\nCaused by: ");
            rendered.push_str(&cause.to_string());
            source = cause.source();
        }
        if let Some(bt) = captured_backtrace() {
            rendered.push('\n');
            rendered.push_str(&bt);
        }
        if field.name() == "message" {
            self.message = Some(rendered);
        } else {
            self.errors.push(rendered);
        }
    }
}
