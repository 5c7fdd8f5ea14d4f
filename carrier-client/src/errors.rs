//! Error types for carrier-client.

use std::{fmt, io};

use carrier_mtproto::SerializeError;

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// An error returned by the server in response to an RPC call.
///
/// Numeric values are stripped from the name and placed in [`RpcError::value`].
///
/// # Example
/// `FLOOD_WAIT_30` → `RpcError { code: 420, name: "FLOOD_WAIT", value: Some(30) }`
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    /// HTTP-like status code.
    pub code: i32,
    /// Error name in SCREAMING_SNAKE_CASE with digits removed.
    pub name: String,
    /// Numeric suffix extracted from the name, if any.
    pub value: Option<u32>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)?;
        if let Some(v) = self.value {
            write!(f, " (value: {v})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Parse a raw server error message like `"FLOOD_WAIT_30"`.
    pub fn from_wire(code: i32, message: &str) -> Self {
        // Numeric suffix after the last underscore, e.g. "FLOOD_WAIT_30".
        if let Some(idx) = message.rfind('_') {
            let suffix = &message[idx + 1..];
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(v) = suffix.parse::<u32>() {
                    let name = message[..idx].to_string();
                    return Self { code, name, value: Some(v) };
                }
            }
        }
        Self { code, name: message.to_string(), value: None }
    }

    /// Match on the error name, with optional wildcard prefix/suffix `'*'`.
    ///
    /// # Examples
    /// - `err.is("FLOOD_WAIT")` — exact match
    /// - `err.is("PHONE_MIGRATE_*")` — starts-with match
    /// - `err.is("*_INVALID")` — ends-with match
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }

    /// The flood-wait duration in seconds, if this is a FLOOD_WAIT error.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        if self.code == 420 && self.name == "FLOOD_WAIT" {
            self.value.map(u64::from)
        } else {
            None
        }
    }

    /// The target datacenter, if this error asks us to migrate.
    pub fn migrate_dc(&self) -> Option<i32> {
        if self.is("*_MIGRATE") {
            self.value.map(|v| v as i32)
        } else {
            None
        }
    }
}

// ─── InvocationError ──────────────────────────────────────────────────────────

/// The error type returned from any call that talks to the server.
#[derive(Debug)]
pub enum InvocationError {
    /// The server rejected the request.
    Rpc(RpcError),
    /// Network / I/O failure.
    Io(io::Error),
    /// Request serialization failed.
    Serialize(SerializeError),
    /// Response deserialization failed.
    Deserialize(String),
    /// The request was dropped (e.g. sender task shut down).
    Dropped,
    /// The caller cancelled the request.
    Cancelled,
    /// DC migration required — handled internally by the pool.
    Migrate(i32),
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e)          => write!(f, "{e}"),
            Self::Io(e)           => write!(f, "I/O error: {e}"),
            Self::Serialize(e)    => write!(f, "serialize error: {e}"),
            Self::Deserialize(s)  => write!(f, "deserialize error: {s}"),
            Self::Dropped         => write!(f, "request dropped"),
            Self::Cancelled       => write!(f, "request cancelled"),
            Self::Migrate(dc)     => write!(f, "DC migration to {dc}"),
        }
    }
}

impl std::error::Error for InvocationError {}

impl From<io::Error> for InvocationError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}

impl From<SerializeError> for InvocationError {
    fn from(e: SerializeError) -> Self { Self::Serialize(e) }
}

impl From<RpcError> for InvocationError {
    fn from(e: RpcError) -> Self {
        match e.migrate_dc() {
            Some(dc) => Self::Migrate(dc),
            None => Self::Rpc(e),
        }
    }
}

impl Clone for InvocationError {
    fn clone(&self) -> Self {
        match self {
            Self::Rpc(e)         => Self::Rpc(e.clone()),
            Self::Io(e)          => Self::Io(io::Error::new(e.kind(), e.to_string())),
            Self::Serialize(e)   => Self::Serialize(e.clone()),
            Self::Deserialize(s) => Self::Deserialize(s.clone()),
            Self::Dropped        => Self::Dropped,
            Self::Cancelled      => Self::Cancelled,
            Self::Migrate(dc)    => Self::Migrate(*dc),
        }
    }
}

impl InvocationError {
    /// Returns `true` if this is the named RPC error (supports `'*'` wildcards).
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Rpc(e) => e.is(pattern),
            _            => false,
        }
    }

    /// If this is a FLOOD_WAIT error, how many seconds to wait.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        match self {
            Self::Rpc(e) => e.flood_wait_seconds(),
            _            => None,
        }
    }
}

// ─── HandshakeError ───────────────────────────────────────────────────────────

/// Errors from connection setup and the temp-key binding handshake.
#[derive(Debug)]
pub enum HandshakeError {
    /// Network / I/O failure.
    Io(io::Error),
    /// Key exchange with the server failed.
    KeyExchange(String),
    /// The binding handshake kept failing; the permanent key is suspect.
    SecurityError(String),
    /// The server rejected the binding with an RPC error.
    Rpc(RpcError),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e)            => write!(f, "I/O error: {e}"),
            Self::KeyExchange(s)   => write!(f, "key exchange failed: {s}"),
            Self::SecurityError(s) => write!(f, "security error: {s}"),
            Self::Rpc(e)           => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for HandshakeError {}

impl From<io::Error> for HandshakeError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}
