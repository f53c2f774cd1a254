//! active-object: run an object's methods inside a supervised worker process.
//!
//! The controller keeps a copy of the target; every call ships a snapshot of it to
//! a worker subprocess, runs the method there, and merges the resulting state back.
//! A crash in the worker breaks the channel, not the caller, and a hung call can be
//! aborted by killing the worker.
//!
//! A program image hosting active objects must also be able to act as the worker:
//!
//! ```no_run
//! use active_object::{ProcessRole, TargetRegistry, run_worker_process};
//! # #[derive(serde::Serialize, serde::Deserialize)] struct Fetcher;
//! # impl active_object::ActiveTarget for Fetcher {
//! #     fn invoke(&mut self, m: &str, _: &active_object::Arguments)
//! #         -> Result<serde_json::Value, active_object::MethodError> {
//! #         Err(active_object::MethodError::no_such_method(m))
//! #     }
//! # }
//!
//! fn main() -> std::io::Result<()> {
//!     if ProcessRole::current() == ProcessRole::Worker {
//!         return run_worker_process(TargetRegistry::new().register::<Fetcher>());
//!     }
//!     // ... controller code wrapping `Fetcher` in an `ActiveObject`
//!     Ok(())
//! }
//! ```

pub mod bridge;
mod fd_redirect;
pub mod gateway;
pub mod handle;
pub mod logging;
pub mod supervisor;
pub mod target;
#[doc(hidden)]
pub mod testing;
pub mod worker;
mod worker_tracing_layer;

pub use bridge::protocol::{Failure, LogLevel};
pub use gateway::InvokeError;
pub use handle::{ActiveObject, ActiveObjectConfig, DEFAULT_RETRY_BUDGET, Method};
pub use logging::init_tracing;
pub use supervisor::{CommandSpawner, CurrentExeSpawner, SupervisorError, WorkerSpawner};
pub use target::{ActiveTarget, Arguments, MethodError, TargetRegistry};
pub use worker::{ProcessRole, WorkerConfig, run_worker, run_worker_process};
