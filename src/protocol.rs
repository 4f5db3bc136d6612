//! Protocol-level data types exchanged with the RillMQ stream broker.
//!
//! Wire encoding and framing live in the transport layer; this module only
//! carries the values the client logic reads and writes.

use bytes::Bytes;
use serde::Serialize;
use std::fmt;

/// A broker node hosting stream leaders and replicas.
///
/// Used as part of the connection pool key, so it must be cheap to clone,
/// hash and compare. A port of `-1` means the port is not resolved yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Broker {
    pub host: String,
    pub port: i32,
}

impl Broker {
    pub fn new(host: impl Into<String>, port: i32) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Topology of a stream as reported by the metadata RPC.
#[derive(Debug, Clone)]
pub struct StreamMetadata {
    pub stream: String,
    pub code: ResponseCode,
    pub leader: Option<Broker>,
    pub replicas: Vec<Broker>,
}

impl StreamMetadata {
    pub fn new(
        stream: impl Into<String>,
        code: ResponseCode,
        leader: Option<Broker>,
        replicas: Vec<Broker>,
    ) -> Self {
        Self {
            stream: stream.into(),
            code,
            leader,
            replicas,
        }
    }
}

/// Response codes returned by the broker.
///
/// Only the subset the client logic inspects is modeled; everything else
/// maps to [`ResponseCode::InternalError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Ok,
    StreamDoesNotExist,
    StreamNotAvailable,
    AccessRefused,
    NoOffset,
    InternalError,
}

impl ResponseCode {
    pub fn is_ok(self) -> bool {
        self == ResponseCode::Ok
    }

    /// Numeric value carried on the wire.
    pub fn wire_value(self) -> u16 {
        match self {
            ResponseCode::Ok => 0x01,
            ResponseCode::StreamDoesNotExist => 0x02,
            ResponseCode::StreamNotAvailable => 0x06,
            ResponseCode::AccessRefused => 0x10,
            ResponseCode::NoOffset => 0x13,
            ResponseCode::InternalError => 0x0f,
        }
    }
}

impl From<u16> for ResponseCode {
    fn from(value: u16) -> Self {
        match value {
            0x01 => ResponseCode::Ok,
            0x02 => ResponseCode::StreamDoesNotExist,
            0x06 => ResponseCode::StreamNotAvailable,
            0x10 => ResponseCode::AccessRefused,
            0x13 => ResponseCode::NoOffset,
            _ => ResponseCode::InternalError,
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResponseCode::Ok => "ok",
            ResponseCode::StreamDoesNotExist => "stream does not exist",
            ResponseCode::StreamNotAvailable => "stream not available",
            ResponseCode::AccessRefused => "access refused",
            ResponseCode::NoOffset => "no offset",
            ResponseCode::InternalError => "internal error",
        };
        write!(f, "{}", label)
    }
}

/// Outcome of a broker RPC that only carries a response code.
#[derive(Debug, Clone, Copy)]
pub struct Response {
    pub code: ResponseCode,
}

impl Response {
    pub fn new(code: ResponseCode) -> Self {
        Self { code }
    }

    pub fn ok() -> Self {
        Self {
            code: ResponseCode::Ok,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }
}

/// Outcome of a stored-offset query for a named consumer.
#[derive(Debug, Clone, Copy)]
pub struct QueryOffsetResponse {
    pub code: ResponseCode,
    pub offset: u64,
}

impl QueryOffsetResponse {
    pub fn new(code: ResponseCode, offset: u64) -> Self {
        Self { code, offset }
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }
}

/// Where a subscription starts reading in a stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OffsetSpec {
    /// The very first chunk available in the stream.
    First,
    /// The last chunk written to the stream.
    Last,
    /// The next chunk written after the subscription is created.
    #[default]
    Next,
    /// An absolute offset.
    Offset(u64),
    /// The first chunk stored at or after the given timestamp (ms).
    Timestamp(i64),
}

impl OffsetSpec {
    /// Numeric type tag carried on the wire.
    pub fn wire_value(&self) -> u16 {
        match self {
            OffsetSpec::First => 1,
            OffsetSpec::Last => 2,
            OffsetSpec::Next => 3,
            OffsetSpec::Offset(_) => 4,
            OffsetSpec::Timestamp(_) => 5,
        }
    }
}

impl fmt::Display for OffsetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OffsetSpec::First => write!(f, "first"),
            OffsetSpec::Last => write!(f, "last"),
            OffsetSpec::Next => write!(f, "next"),
            OffsetSpec::Offset(offset) => write!(f, "offset({})", offset),
            OffsetSpec::Timestamp(ts) => write!(f, "timestamp({})", ts),
        }
    }
}

/// A message delivered on a subscription.
///
/// Encoding and compression are handled by the codec layer; the client logic
/// only moves the payload around.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    payload: Bytes,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl From<Vec<u8>> for Message {
    fn from(payload: Vec<u8>) -> Self {
        Self::new(payload)
    }
}

impl From<&'static str> for Message {
    fn from(payload: &'static str) -> Self {
        Self::new(Bytes::from_static(payload.as_bytes()))
    }
}
