//! The boundary between the active object machinery and the wrapped application type.
//!
//! A wrapped type crosses the process boundary by value: the controller serializes its
//! copy into every call record, the worker deserializes a fresh instance, runs the
//! method, and ships back a state snapshot which the controller merges into its copy.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::bridge::protocol::{CallRecord, Failure, PROTOCOL_VERSION};

/// An object whose methods can run inside a worker process.
///
/// `export_state`/`import_state` default to the full serialized form. Override them
/// together to ship a smaller snapshot or to merge selectively.
pub trait ActiveTarget: Serialize + DeserializeOwned + Send + 'static {
    /// Invoke `method` on this (worker-side) instance.
    fn invoke(&mut self, method: &str, args: &Arguments) -> Result<Value, MethodError>;

    /// Key used to find this type in the worker's [`TargetRegistry`].
    fn type_tag() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Snapshot taken in the worker after a successful call.
    fn export_state(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    /// Fold a worker snapshot into the controller's copy.
    ///
    /// The default snapshot is the full serialized form, so the controller's copy is
    /// rebuilt from it wholesale; fields serde omits (skipped `None`s and the like)
    /// take the worker's value too. On error `self` is left untouched.
    fn import_state(&mut self, state: Value) -> serde_json::Result<()> {
        *self = serde_json::from_value(state)?;
        Ok(())
    }
}

/// Positional and keyword arguments of one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    args: Vec<Value>,
    kwargs: Map<String, Value>,
}

impl Arguments {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    pub fn positional(&self) -> &[Value] {
        &self.args
    }

    pub fn keywords(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    /// Required positional argument.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, MethodError> {
        let value = self.args.get(index).ok_or_else(|| {
            MethodError::invalid_arguments(format!("missing positional argument {index}"))
        })?;
        decode(value, || format!("argument {index}"))
    }

    /// Optional keyword argument.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, MethodError> {
        self.kwargs
            .get(name)
            .map(|value| decode(value, || format!("keyword argument `{name}`")))
            .transpose()
    }

    /// Argument passed either at `index` or as keyword `name`.
    pub fn param<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, MethodError> {
        if let Some(value) = self.kwarg(name)? {
            return Ok(value);
        }
        if index < self.args.len() {
            return self.arg(index);
        }
        Err(MethodError::invalid_arguments(format!(
            "missing argument `{name}`"
        )))
    }
}

fn decode<T: DeserializeOwned>(value: &Value, what: impl FnOnce() -> String) -> Result<T, MethodError> {
    T::deserialize(value).map_err(|e| MethodError::invalid_arguments(format!("{}: {}", what(), e)))
}

/// Errors a target method can report.
#[derive(Debug, thiserror::Error)]
pub enum MethodError {
    #[error("no method named `{0}`")]
    NoSuchMethod(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The method itself failed.
    #[error(transparent)]
    Application(#[from] anyhow::Error),
}

impl MethodError {
    pub fn no_such_method(name: impl Into<String>) -> Self {
        Self::NoSuchMethod(name.into())
    }

    pub fn invalid_arguments(reason: impl Into<String>) -> Self {
        Self::InvalidArguments(reason.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoSuchMethod(_) => "NoSuchMethod",
            Self::InvalidArguments(_) => "InvalidArguments",
            Self::Application(_) => "Application",
        }
    }

    pub fn into_failure(self) -> Failure {
        let kind = self.kind();
        match self {
            Self::Application(err) => {
                let mut trace: Vec<String> = err
                    .chain()
                    .skip(1)
                    .map(|cause| format!("Caused by: {cause}"))
                    .collect();
                // Captured where the error was created, not here.
                let bt = err.backtrace();
                if bt.status() == BacktraceStatus::Captured {
                    trace.push(bt.to_string());
                }
                Failure::new(kind, err.to_string()).with_trace(trace.join("\n"))
            }
            other => Failure::new(kind, other.to_string()),
        }
    }
}

/// Backtrace of the current thread, when `RUST_BACKTRACE` enables capture.
pub(crate) fn captured_backtrace() -> Option<String> {
    let bt = Backtrace::capture();
    (bt.status() == BacktraceStatus::Captured).then(|| bt.to_string())
}

type Dispatch = fn(CallRecord) -> Result<(Value, Value), Failure>;

/// Target types a worker image knows how to reconstruct.
#[derive(Default, Clone)]
pub struct TargetRegistry {
    targets: HashMap<&'static str, Dispatch>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: ActiveTarget>(mut self) -> Self {
        self.targets.insert(T::type_tag(), dispatch::<T>);
        self
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.targets.contains_key(type_tag)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Run one call record to completion.
    ///
    /// Returns `(retval, state)` on success.
    pub fn dispatch(&self, call: CallRecord) -> Result<(Value, Value), Failure> {
        if call.version != PROTOCOL_VERSION {
            return Err(Failure::new(
                "ProtocolMismatch",
                format!(
                    "call record version {} (worker speaks {})",
                    call.version, PROTOCOL_VERSION
                ),
            ));
        }
        let Some(run) = self.targets.get(call.target_type.as_str()) else {
            return Err(Failure::new(
                "UnknownTarget",
                format!("`{}` is not registered in this worker", call.target_type),
            ));
        };
        run(call)
    }
}

fn dispatch<T: ActiveTarget>(call: CallRecord) -> Result<(Value, Value), Failure> {
    let mut target: T = serde_json::from_value(call.target)
        .map_err(|e| Failure::new("InvalidSnapshot", e.to_string()))?;
    let args = Arguments::new(call.args, call.kwargs);

    let retval = target
        .invoke(&call.method, &args)
        .map_err(MethodError::into_failure)?;

    let state = target
        .export_state()
        .map_err(|e| Failure::new("StateExport", e.to_string()))?;
    Ok((retval, state))
}
