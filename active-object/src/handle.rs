//! The caller-facing handle.
//!
//! `ActiveObject<T>` owns the controller's copy of a target plus its worker.
//! Calls go through [`ActiveObject::invoke`] or a named [`Method`] stub; `abort`
//! kills the worker directly so a hung call returns without waiting for a reply.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::bridge::codec::DEFAULT_MAX_RECORD_BYTES;
use crate::gateway::{Gateway, InvokeError};
use crate::supervisor::{CurrentExeSpawner, Supervisor, SupervisorError, WorkerSpawner};
use crate::target::ActiveTarget;

pub const DEFAULT_RETRY_BUDGET: u32 = 3;

pub struct ActiveObjectConfig {
    /// Respawns allowed per call after a broken channel.
    pub retry_budget: u32,
    pub max_record_bytes: usize,
    pub spawner: Box<dyn WorkerSpawner>,
}

impl Default for ActiveObjectConfig {
    fn default() -> Self {
        Self {
            retry_budget: DEFAULT_RETRY_BUDGET,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            spawner: Box::new(CurrentExeSpawner),
        }
    }
}

impl ActiveObjectConfig {
    pub fn with_retry_budget(mut self, retry_budget: u32) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    pub fn with_max_record_bytes(mut self, max_record_bytes: usize) -> Self {
        self.max_record_bytes = max_record_bytes;
        self
    }

    pub fn with_spawner(mut self, spawner: impl WorkerSpawner + 'static) -> Self {
        self.spawner = Box::new(spawner);
        self
    }
}

/// A target whose methods run in a supervised worker process.
///
/// Calls on one handle are serialized; separate handles have separate workers and
/// run concurrently. Dropping the handle terminates its worker.
pub struct ActiveObject<T: ActiveTarget> {
    gateway: Gateway<T>,
}

impl<T: ActiveTarget> ActiveObject<T> {
    /// Wrap `target` using the running executable as the worker image.
    pub fn new(target: T) -> Result<Self, SupervisorError> {
        Self::with_config(target, ActiveObjectConfig::default())
    }

    /// Wrap `target`. The worker is started before this returns.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_config(target: T, config: ActiveObjectConfig) -> Result<Self, SupervisorError> {
        let supervisor = Supervisor::new(config.spawner, config.max_record_bytes);
        let gateway = Gateway::new(
            target,
            supervisor,
            config.retry_budget,
            config.max_record_bytes,
        )?;
        tracing::debug!(target_type = T::type_tag(), pid = ?gateway.supervisor().pid(), "Active object ready");
        Ok(Self { gateway })
    }

    /// Stub for one method of the target.
    pub fn method(&self, name: impl Into<String>) -> Method<'_, T> {
        Method {
            object: self,
            name: name.into(),
        }
    }

    /// Run `method` in the worker and merge the resulting state.
    ///
    /// Returns `Ok(None)` when the call was aborted.
    pub async fn invoke(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Option<Value>, InvokeError> {
        self.gateway.invoke(method, args, kwargs).await
    }

    /// Like [`invoke`](Self::invoke), decoding the result as `R`.
    pub async fn invoke_as<R: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Option<R>, InvokeError> {
        self.invoke(method, args, kwargs)
            .await?
            .map(serde_json::from_value)
            .transpose()
            .map_err(InvokeError::Decode)
    }

    /// Kill the worker without waiting for an in-flight call.
    ///
    /// The pending call returns `Ok(None)`; the next call starts a fresh worker.
    pub fn abort(&self) -> Result<(), SupervisorError> {
        tracing::info!(target_type = T::type_tag(), "Aborting worker");
        self.gateway.supervisor().kill()
    }

    /// Terminate the worker now. A later call would start a new one.
    pub fn dispose(&self) -> Result<(), SupervisorError> {
        self.gateway.supervisor().kill()
    }

    /// Read the controller's copy of the target after any in-flight call settles.
    pub async fn inspect<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.gateway.inspect(f).await
    }

    /// Terminate the worker and hand back the controller's copy.
    pub fn into_inner(self) -> T {
        self.gateway.into_target()
    }

    pub fn is_alive(&self) -> bool {
        self.gateway.supervisor().is_alive()
    }

    pub fn pid(&self) -> Option<u32> {
        self.gateway.supervisor().pid()
    }

    /// Workers started over this handle's lifetime, respawns included.
    pub fn spawn_count(&self) -> u64 {
        self.gateway.supervisor().spawn_count()
    }
}

/// A bound method name.
pub struct Method<'a, T: ActiveTarget> {
    object: &'a ActiveObject<T>,
    name: String,
}

impl<T: ActiveTarget> Method<'_, T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Option<Value>, InvokeError> {
        self.object.invoke(&self.name, args, kwargs).await
    }

    pub async fn call_as<R: DeserializeOwned>(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Option<R>, InvokeError> {
        self.object.invoke_as(&self.name, args, kwargs).await
    }

    /// Kill the worker, bypassing the invocation lock and retry policy.
    pub fn abort(&self) -> Result<(), SupervisorError> {
        self.object.abort()
    }
}
