//! Local decode errors and the crate-level error type

use thiserror::Error;

use super::Fault;
use crate::markup::MarkupError;

/// Errors raised while decoding a value subtree.
///
/// These never leave the dispatcher unconverted: each maps onto a
/// [`Fault`] code via [`DecodeError::code`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The tokenizer rejected the document.
    #[error("malformed markup: {0}")]
    Markup(#[from] MarkupError),

    /// Node sequence does not match the expected document shape.
    #[error("{0}")]
    Structural(String),

    /// Scalar text does not parse as its declared type.
    #[error("{0}")]
    Conversion(String),
}

impl DecodeError {
    /// Build a structural error.
    pub fn structural(message: impl Into<String>) -> Self {
        Self::Structural(message.into())
    }

    /// Build a scalar conversion error.
    pub fn conversion(message: impl Into<String>) -> Self {
        Self::Conversion(message.into())
    }

    /// Fault code this error is reported under.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::Markup(_) => Fault::MARKUP_ERROR,
            Self::Structural(_) => Fault::SERIALIZATION_ERROR,
            Self::Conversion(_) => Fault::CONVERSION_ERROR,
        }
    }
}

/// Fatal dispatcher errors.
///
/// Protocol-level problems are reported inside the response document as a
/// fault; this type covers what cannot be expressed that way.
#[derive(Error, Debug)]
pub enum Error {
    /// Reading the request or writing the response failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation was called out of sequence.
    #[error("invalid dispatcher state: expected {expected}, found {found}")]
    InvalidState {
        /// Phase the operation requires.
        expected: &'static str,
        /// Phase the dispatcher was in.
        found: &'static str,
    },

    /// A fault response, as returned by [`response_value`](super::response_value).
    #[error(transparent)]
    Fault(#[from] Fault),

    /// An unreadable response, as returned by [`response_value`](super::response_value).
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
