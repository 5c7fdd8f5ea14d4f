//! The boundary to the TL serialization collaborator.
//!
//! The method catalogue (hundreds of remote calls) lives outside this
//! workspace; the transport only needs to turn a constructor name plus an
//! argument map into bytes, mirroring `serializeMethod`/`serializeObject`.

use std::collections::BTreeMap;

/// A single argument value.
#[derive(Clone, Debug, PartialEq)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Bytes(Vec<u8>),
    String(String),
    Vec(Vec<ArgValue>),
}

impl ArgValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ArgValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

/// Arguments to a method or object call, keyed by parameter name.
pub type Args = BTreeMap<String, ArgValue>;

/// Errors from the serializer collaborator.
#[derive(Clone, Debug, PartialEq)]
pub enum SerializeError {
    UnknownConstructor(String),
    BadArgument { constructor: String, argument: String },
}

impl std::fmt::Display for SerializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownConstructor(name) => write!(f, "unknown constructor {name}"),
            Self::BadArgument { constructor, argument } => {
                write!(f, "bad argument {argument} for {constructor}")
            }
        }
    }
}
impl std::error::Error for SerializeError {}

/// Serializes method and object calls into TL bytes.
pub trait Serializer: Send + Sync {
    /// Serialize a method call (something that expects a reply).
    fn serialize_method(&self, method: &str, args: &Args) -> Result<Vec<u8>, SerializeError>;

    /// Serialize a bare object (fire-and-forget, no reply expected).
    fn serialize_object(&self, object: &str, args: &Args) -> Result<Vec<u8>, SerializeError>;
}
