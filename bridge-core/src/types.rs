//! Stream identity, header lists and the error taxonomy shared by both directions.

use std::fmt;

/// Caller-supplied stream identifier. Unique for the lifetime of one exchange.
pub type StreamId = u64;

/// Response details attached to streams cancelled through the client.
pub const CANCEL_DETAILS: &str = "client cancelled stream";

/// Header names the bridge reads or writes.
pub mod names {
    pub const STATUS: &str = ":status";
    pub const ERROR_CODE: &str = "x-internal-error-code";
    pub const ERROR_MESSAGE: &str = "x-internal-error-message";
    pub const ATTEMPT_COUNT: &str = "x-envoy-attempt-count";
    pub const UPSTREAM_PROTOCOL: &str = "x-envoy-mobile-upstream-protocol";
    pub const CLUSTER: &str = "x-envoy-mobile-cluster";
}

/// Ordered header list. Names are compared case-insensitively; order and duplicates are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList(Vec<(String, String)>);

impl HeaderList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace every value of `name` with a single entry.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.push(name, value);
    }

    /// Remove every entry for `name`, returning the first removed value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let mut first = None;
        self.0.retain(|(n, v)| {
            if n.eq_ignore_ascii_case(name) {
                if first.is_none() {
                    first = Some(v.clone());
                }
                false
            } else {
                true
            }
        });
        first
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Parsed `:status`, if present and numeric.
    pub fn status(&self) -> Option<u16> {
        self.get(names::STATUS)?.trim().parse().ok()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderList {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(n, v)| (n.into(), v.into())).collect())
    }
}

/// Error codes reported through `on_error`. Values are stable across the C ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Undefined = 0,
    StreamReset = 1,
    ConnectionFailure = 2,
    BufferLimitExceeded = 3,
    RequestTimeout = 4,
}

impl ErrorCode {
    pub fn from_i32(v: i32) -> Self {
        match v {
            1 => ErrorCode::StreamReset,
            2 => ErrorCode::ConnectionFailure,
            3 => ErrorCode::BufferLimitExceeded,
            4 => ErrorCode::RequestTimeout,
            _ => ErrorCode::Undefined,
        }
    }
}

/// Why the engine (or the client) reset a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamResetReason {
    LocalReset,
    RemoteReset,
    ConnectionFailure,
    ConnectionTermination,
    Overflow,
    ProtocolError,
}

impl StreamResetReason {
    pub fn error_code(self) -> ErrorCode {
        match self {
            StreamResetReason::ConnectionFailure | StreamResetReason::ConnectionTermination => {
                ErrorCode::ConnectionFailure
            }
            StreamResetReason::Overflow => ErrorCode::BufferLimitExceeded,
            _ => ErrorCode::StreamReset,
        }
    }
}

impl fmt::Display for StreamResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamResetReason::LocalReset => "local reset",
            StreamResetReason::RemoteReset => "remote reset",
            StreamResetReason::ConnectionFailure => "connection failure",
            StreamResetReason::ConnectionTermination => "connection termination",
            StreamResetReason::Overflow => "overflow",
            StreamResetReason::ProtocolError => "protocol error",
        };
        f.write_str(s)
    }
}

/// Terminal error delivered to the caller: code, opaque message, attempt count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    pub code: ErrorCode,
    pub message: String,
    pub attempt_count: Option<u32>,
}

impl StreamError {
    pub fn from_reset(reason: StreamResetReason) -> Self {
        Self {
            code: reason.error_code(),
            message: reason.to_string(),
            attempt_count: None,
        }
    }
}
