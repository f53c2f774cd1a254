//! Framed codec for worker communication.
//!
//! Uses LinesCodec for framing + serde_json for serialization. JSON never contains a
//! raw newline, so each record is self-delimiting without a length prefix.
//! Works over any AsyncRead/AsyncWrite (pipes, in-memory duplex streams, etc).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Default upper bound on a single encoded record.
pub const DEFAULT_MAX_RECORD_BYTES: usize = 64 * 1024 * 1024;

/// Codec that frames messages as newline-terminated JSON.
///
/// Wraps LinesCodec and adds serde_json serialization.
pub struct JsonLinesCodec<T> {
    inner: LinesCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self::with_max_record_bytes(DEFAULT_MAX_RECORD_BYTES)
    }

    pub fn with_max_record_bytes(max: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max),
            _phantom: PhantomData,
        }
    }
}

fn lines_error(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "record exceeds maximum length")
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src).map_err(lines_error)? {
            Some(line) => parse_line(&line).map(Some),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode_eof(src).map_err(lines_error)? {
            Some(line) => parse_line(&line).map(Some),
            None => Ok(None),
        }
    }
}

fn parse_line<T: DeserializeOwned>(line: &str) -> io::Result<T> {
    serde_json::from_str(line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        // WorkerTracingLayer drops this module's events; forwarding them would loop.
        tracing::trace!(json_size_bytes = json.len(), "Encoding record");
        self.inner.encode(json, dst).map_err(lines_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{CallRecord, Failure, LogEntry, LogLevel, ReplyRecord};
    use serde_json::json;

    #[test]
    fn records_are_newline_delimited() {
        let mut codec = JsonLinesCodec::<ReplyRecord>::new();
        let mut buf = BytesMut::new();

        codec
            .encode(
                ReplyRecord::Normal {
                    retval: json!("line one\nline two"),
                    state: json!({}),
                },
                &mut buf,
            )
            .unwrap();

        let text = std::str::from_utf8(&buf).unwrap();
        assert_eq!(text.matches('\n').count(), 1);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn back_to_back_records_decode_in_order() {
        let mut codec = JsonLinesCodec::<ReplyRecord>::new();
        let mut buf = BytesMut::new();

        let log = ReplyRecord::Log {
            entry: LogEntry {
                logger: "grinder::fetch".into(),
                level: LogLevel::Info,
                message: "fetching".into(),
                args: vec![],
            },
        };
        let done = ReplyRecord::Normal {
            retval: json!(1),
            state: json!({"count": 1}),
        };
        codec.encode(log.clone(), &mut buf).unwrap();
        codec.encode(done.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(log));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(done));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn partial_record_waits_for_more_bytes() {
        let mut codec = JsonLinesCodec::<CallRecord>::new();
        let mut buf = BytesMut::from(&b"{\"version\":1,\"target_type\":"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn truncated_record_at_eof_is_invalid_data() {
        let mut codec = JsonLinesCodec::<ReplyRecord>::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"normal\",\"retval\":"[..]);
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_record_is_rejected() {
        let mut codec = JsonLinesCodec::<ReplyRecord>::with_max_record_bytes(16);
        let mut buf = BytesMut::new();
        JsonLinesCodec::<ReplyRecord>::new()
            .encode(
                ReplyRecord::Failed {
                    failure: Failure::new("Application", "a message well past sixteen bytes"),
                },
                &mut buf,
            )
            .unwrap();
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
