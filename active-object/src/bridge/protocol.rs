//! Wire protocol types for controller-worker communication.
//!
//! One channel, two directions:
//! - **Calls** (controller stdin -> worker): one [`CallRecord`] per invocation attempt
//! - **Replies** (worker stdout -> controller): zero or more `Log` records followed by
//!   exactly one terminal `Normal` or `Failed` record

use serde::{Deserialize, Serialize};

/// Bumped whenever a record shape changes. Controller and worker are expected to be
/// the same build; a mismatch is reported as a `ProtocolMismatch` failure.
pub const PROTOCOL_VERSION: u32 = 1;

/// A single method invocation request.
///
/// Re-sent unchanged when the gateway retries after a respawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub version: u32,
    /// Registry key of the wrapped type.
    pub target_type: String,
    /// Full serialized snapshot of the controller's copy of the target.
    pub target: serde_json::Value,
    pub method: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl CallRecord {
    pub fn new(
        target_type: impl Into<String>,
        target: serde_json::Value,
        method: impl Into<String>,
        args: Vec<serde_json::Value>,
        kwargs: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            target_type: target_type.into(),
            target,
            method: method.into(),
            args,
            kwargs,
        }
    }
}

/// Numeric outcome codes, kept stable for anyone reading raw traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeCode {
    Normal = 0,
    Failed = 1,
    Log = 2,
}

/// Messages from worker to controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyRecord {
    /// Method returned; `state` is the post-call snapshot to merge back.
    Normal {
        retval: serde_json::Value,
        state: serde_json::Value,
    },

    /// Method (or its resolution) failed. Never retried by the controller.
    Failed { failure: Failure },

    /// Log call made while the method ran. Never terminal.
    Log { entry: LogEntry },
}

impl ReplyRecord {
    pub fn code(&self) -> OutcomeCode {
        match self {
            Self::Normal { .. } => OutcomeCode::Normal,
            Self::Failed { .. } => OutcomeCode::Failed,
            Self::Log { .. } => OutcomeCode::Log,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Log { .. })
    }
}

/// Formatted description of a failure inside the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trace: String,
}

impl Failure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: String::new(),
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = trace.into();
        self
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if !self.trace.is_empty() {
            write!(f, "\n{}", self.trace)?;
        }
        Ok(())
    }
}

/// A log call captured in the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Logger name (the tracing target).
    pub logger: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl LogEntry {
    /// Message with arguments appended, as the controller replays it.
    pub fn render(&self) -> String {
        if self.args.is_empty() {
            self.message.clone()
        } else {
            format!("{} {}", self.message, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warn,
            tracing::Level::ERROR => Self::Error,
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kwargs(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("kwargs must be an object"),
        }
    }

    #[test]
    fn call_record_serializes() {
        let call = CallRecord::new(
            "fetch::KickstartFetch",
            json!({"base_url": "http://satellite.example.com"}),
            "fetch_item",
            vec![json!("GPL")],
            kwargs(json!({"refresh": true})),
        );
        insta::assert_json_snapshot!(call, @r#"
        {
          "version": 1,
          "target_type": "fetch::KickstartFetch",
          "target": {
            "base_url": "http://satellite.example.com"
          },
          "method": "fetch_item",
          "args": [
            "GPL"
          ],
          "kwargs": {
            "refresh": true
          }
        }
        "#);
    }

    #[test]
    fn reply_normal_serializes() {
        let reply = ReplyRecord::Normal {
            retval: json!(3),
            state: json!({"count": 3}),
        };
        insta::assert_json_snapshot!(reply, @r#"
        {
          "type": "normal",
          "retval": 3,
          "state": {
            "count": 3
          }
        }
        "#);
    }

    #[test]
    fn reply_failed_serializes() {
        let reply = ReplyRecord::Failed {
            failure: Failure::new("Application", "checksum mismatch"),
        };
        insta::assert_json_snapshot!(reply, @r#"
        {
          "type": "failed",
          "failure": {
            "kind": "Application",
            "message": "checksum mismatch"
          }
        }
        "#);
    }

    #[test]
    fn reply_log_serializes() {
        let reply = ReplyRecord::Log {
            entry: LogEntry {
                logger: "grinder::fetch".to_string(),
                level: LogLevel::Warn,
                message: "unauthorized, refreshing credentials".to_string(),
                args: vec!["attempt=2".to_string()],
            },
        };
        insta::assert_json_snapshot!(reply, @r#"
        {
          "type": "log",
          "entry": {
            "logger": "grinder::fetch",
            "level": "warn",
            "message": "unauthorized, refreshing credentials",
            "args": [
              "attempt=2"
            ]
          }
        }
        "#);
    }

    #[test]
    fn call_record_defaults_missing_arguments() {
        let call: CallRecord = serde_json::from_value(json!({
            "version": 1,
            "target_type": "Counter",
            "target": {"count": 0},
            "method": "increment",
        }))
        .unwrap();
        assert!(call.args.is_empty());
        assert!(call.kwargs.is_empty());
    }

    #[test]
    fn outcome_codes_match_wire_numbering() {
        let normal = ReplyRecord::Normal {
            retval: json!(null),
            state: json!({}),
        };
        let failed = ReplyRecord::Failed {
            failure: Failure::new("Panic", "boom"),
        };
        let log = ReplyRecord::Log {
            entry: LogEntry {
                logger: "t".into(),
                level: LogLevel::Info,
                message: "m".into(),
                args: vec![],
            },
        };
        assert_eq!(normal.code() as u8, 0);
        assert_eq!(failed.code() as u8, 1);
        assert_eq!(log.code() as u8, 2);
        assert!(normal.is_terminal());
        assert!(failed.is_terminal());
        assert!(!log.is_terminal());
    }

    #[test]
    fn failure_display_includes_trace() {
        let failure = Failure::new("Application", "disk full").with_trace("0: write_chunk");
        assert_eq!(failure.to_string(), "Application: disk full\n0: write_chunk");
        assert_eq!(Failure::new("Panic", "boom").to_string(), "Panic: boom");
    }

    #[test]
    fn log_entry_render_appends_args() {
        let entry = LogEntry {
            logger: "t".into(),
            level: LogLevel::Debug,
            message: "processing chunk".into(),
            args: vec!["len=4096".into(), "offset=0".into()],
        };
        assert_eq!(entry.render(), "processing chunk len=4096 offset=0");
    }
}
