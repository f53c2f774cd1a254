//! IPC bridge for controller-worker communication.
//!
//! This module provides the wire protocol and codec for communication between
//! an active object handle (controller) and its worker subprocess.
//!
//! # Architecture
//!
//! - **protocol**: Record types (CallRecord, ReplyRecord, Failure, LogEntry)
//! - **codec**: Newline-delimited JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
