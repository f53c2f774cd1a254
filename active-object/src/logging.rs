//! Tracing setup for both halves of the program image.
//!
//! Controller: fmt output on stderr, optionally JSON (`LOG_FORMAT=json`).
//! Worker: events are shipped to the controller as Log records instead.
//!
//! Filtering honours `RUST_LOG` first, then `ACTIVE_OBJECT_LOG` (debug|info|warn|error).
//! The worker inherits both variables from the controller.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::worker::ReplySink;
use crate::worker_tracing_layer::WorkerTracingLayer;

pub const LOG_LEVEL_ENV: &str = "ACTIVE_OBJECT_LOG";

fn env_filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }

    let level = match std::env::var(LOG_LEVEL_ENV).as_deref() {
        Ok("trace") => "trace",
        Ok("debug") => "debug",
        Ok("warn") | Ok("warning") => "warn",
        Ok("error") => "error",
        _ => "info",
    };
    EnvFilter::new(format!("{level},active_object::bridge=off"))
}

/// Initialize controller-side tracing. A no-op if a subscriber is already set.
pub fn init_tracing() {
    let filter = env_filter();
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Initialize worker-side tracing: every enabled event becomes a Log record.
pub fn init_worker_tracing(sink: ReplySink) {
    let subscriber = tracing_subscriber::registry()
        .with(env_filter())
        .with(WorkerTracingLayer::new(sink));
    let _ = subscriber.try_init();
}
