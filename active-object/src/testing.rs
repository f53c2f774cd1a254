//! Sample targets used by the demo binary and the integration tests.
//!
//! Both sides must register the same types, so they live in the library. Hidden
//! from the docs: several methods exit or panic the worker on purpose.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::target::{ActiveTarget, Arguments, MethodError, TargetRegistry};

/// Every fixture type, for a worker image.
pub fn registry() -> TargetRegistry {
    TargetRegistry::new().register::<Counter>().register::<Tally>()
}

/// A counter with methods that misbehave in each way a worker can.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub count: i64,
}

impl ActiveTarget for Counter {
    fn invoke(&mut self, method: &str, args: &Arguments) -> Result<Value, MethodError> {
        match method {
            "increment" => {
                self.count += 1;
                Ok(json!(self.count))
            }
            "add" => {
                self.count += args.param::<i64>(0, "n")?;
                Ok(json!(self.count))
            }
            "get" => Ok(json!(self.count)),
            "pid" => Ok(json!(std::process::id())),
            "blob" => {
                let len = args.param::<usize>(0, "len")?;
                Ok(json!("x".repeat(len)))
            }
            "log_then_get" => {
                tracing::info!(count = self.count, "reporting count");
                tracing::warn!("about to return");
                Ok(json!(self.count))
            }
            "fail" => {
                // Never reaches the controller: failed calls merge no state.
                self.count += 100;
                let seed = std::fs::read("/nonexistent/counter-seed")
                    .context("failed to load counter seed")?;
                self.count += seed.len() as i64;
                Ok(json!(self.count))
            }
            "sleep" => {
                let ms = args.param::<u64>(0, "ms")?;
                std::thread::sleep(Duration::from_millis(ms));
                Ok(Value::Null)
            }
            "crash" => std::process::exit(3),
            "crash_once" => {
                // The marker file survives the worker, so only the first attempt dies.
                let marker = args.param::<String>(0, "marker")?;
                if std::path::Path::new(&marker).exists() {
                    self.count += 1;
                    return Ok(json!(self.count));
                }
                std::fs::write(&marker, b"crashed")
                    .with_context(|| format!("failed to write marker {marker}"))?;
                std::process::exit(3)
            }
            "panic" => panic!("counter panicked at {}", self.count),
            other => Err(MethodError::no_such_method(other)),
        }
    }
}

/// A target that ships only part of its state back.
///
/// `label` stays controller-side: the worker may change it, but the change is
/// never exported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tally {
    pub label: String,
    pub entries: Vec<String>,
}

impl ActiveTarget for Tally {
    fn invoke(&mut self, method: &str, args: &Arguments) -> Result<Value, MethodError> {
        match method {
            "record" => {
                let entry = args.param::<String>(0, "entry")?;
                tracing::debug!(%entry, "recording");
                self.entries.push(entry);
                Ok(json!(self.entries.len()))
            }
            "relabel" => {
                self.label = args.param(0, "label")?;
                Ok(json!(self.label))
            }
            "label" => Ok(json!(self.label)),
            other => Err(MethodError::no_such_method(other)),
        }
    }

    fn export_state(&self) -> serde_json::Result<Value> {
        Ok(json!({ "entries": self.entries }))
    }

    fn import_state(&mut self, state: Value) -> serde_json::Result<()> {
        #[derive(Deserialize)]
        struct Exported {
            entries: Vec<String>,
        }
        let exported: Exported = serde_json::from_value(state)?;
        self.entries = exported.entries;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run<T: ActiveTarget>(target: &mut T, method: &str, args: Vec<Value>) -> Result<Value, MethodError> {
        target.invoke(method, &Arguments::new(args, Default::default()))
    }

    #[test]
    fn counter_methods() {
        let mut counter = Counter::default();
        assert_eq!(run(&mut counter, "increment", vec![]).unwrap(), json!(1));
        assert_eq!(run(&mut counter, "add", vec![json!(4)]).unwrap(), json!(5));
        assert_eq!(run(&mut counter, "get", vec![]).unwrap(), json!(5));
    }

    #[test]
    fn counter_failure_carries_context() {
        let mut counter = Counter::default();
        let failure = run(&mut counter, "fail", vec![]).unwrap_err().into_failure();
        assert_eq!(failure.kind, "Application");
        assert_eq!(failure.message, "failed to load counter seed");
        assert!(failure.trace.starts_with("Caused by: "));
    }

    #[test]
    fn crash_once_succeeds_when_marker_exists() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        std::fs::write(&marker, b"").unwrap();

        let mut counter = Counter::default();
        let result = run(&mut counter, "crash_once", vec![json!(marker.to_str().unwrap())]);
        assert_eq!(result.unwrap(), json!(1));
    }

    #[test]
    fn tally_exports_entries_only() {
        let tally = Tally {
            label: "lorries".into(),
            entries: vec!["a".into()],
        };
        assert_eq!(tally.export_state().unwrap(), json!({"entries": ["a"]}));

        let mut local = Tally {
            label: "lorries".into(),
            entries: vec![],
        };
        local
            .import_state(json!({"entries": ["a", "b"]}))
            .unwrap();
        assert_eq!(local.label, "lorries");
        assert_eq!(local.entries, vec!["a", "b"]);
    }

    #[test]
    fn registry_knows_every_fixture() {
        let registry = registry();
        assert!(registry.contains(Counter::type_tag()));
        assert!(registry.contains(Tally::type_tag()));
        assert_eq!(registry.len(), 2);
    }
}
