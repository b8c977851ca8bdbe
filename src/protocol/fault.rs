//! Protocol fault model

use thiserror::Error;

use super::{DecodeError, Member, Value};

/// Structured error carried inside a `<fault>` response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[error("fault {code}: {message}")]
pub struct Fault {
    /// Numeric fault code.
    pub code: i32,
    /// Human-readable description.
    pub message: String,
}

impl Fault {
    /// Malformed markup (tokenizer-level error).
    pub const MARKUP_ERROR: i32 = 1;
    /// Structural or serialization error.
    pub const SERIALIZATION_ERROR: i32 = 2;
    /// Scalar text does not parse as its declared type.
    pub const CONVERSION_ERROR: i32 = 3;
    /// No method resolved or the call is incomplete.
    pub const INVALID_REQUEST: i32 = 4;
    /// Fewer parameters supplied than the procedure requires.
    pub const MISSING_ARGUMENTS: i32 = 5;
    /// Method name not present in the registry.
    ///
    /// Follows the XML-RPC fault code interoperability convention.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Procedure broke its contract (panicked or misreported its state).
    pub const INTERNAL_ERROR: i32 = -32603;

    /// Create a fault with an arbitrary code.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Structural or serialization fault.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(Self::SERIALIZATION_ERROR, message)
    }

    /// Invalid request fault.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_REQUEST, message)
    }

    /// Missing arguments fault.
    #[must_use]
    pub fn missing_arguments(required: usize, supplied: usize) -> Self {
        Self::new(
            Self::MISSING_ARGUMENTS,
            format!("missing arguments: {required} required, {supplied} supplied"),
        )
    }

    /// Method-not-found fault.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    /// Internal error fault.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }

    /// The `faultCode`/`faultString` struct sent on the wire.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Struct(vec![
            Member::new("faultCode", Value::Int(self.code)),
            Member::new("faultString", Value::Str(self.message.clone())),
        ])
    }

    /// Reconstruct a fault from its wire struct.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let code = value.get("faultCode")?.as_i32()?;
        let message = value.get("faultString")?.as_str()?;
        Some(Self::new(code, message))
    }
}

impl From<DecodeError> for Fault {
    fn from(err: DecodeError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}
