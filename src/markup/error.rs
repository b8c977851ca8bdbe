//! Tokenizer-level error types.

use core::fmt;

/// Malformed markup detected while tokenizing a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkupError {
    /// Input ended inside a tag or before the root element closed.
    UnexpectedEof {
        /// Byte offset at which more input was required.
        offset: usize,
    },
    /// End tag does not match the innermost open element.
    MismatchedTag {
        /// Name of the innermost open element.
        expected: String,
        /// Name found in the end tag.
        found: String,
        /// Byte offset of the end tag.
        offset: usize,
    },
    /// End tag with no open element.
    UnexpectedEndTag {
        /// Name found in the end tag.
        name: String,
        /// Byte offset of the end tag.
        offset: usize,
    },
    /// Entity or character reference that cannot be resolved.
    UnknownEntity {
        /// Entity text between `&` and `;`.
        entity: String,
        /// Byte offset of the enclosing token.
        offset: usize,
    },
    /// Token bytes are not valid UTF-8.
    InvalidUtf8 {
        /// Byte offset of the token.
        offset: usize,
    },
    /// Non-whitespace character data outside the root element.
    TextOutsideRoot {
        /// Byte offset of the text.
        offset: usize,
    },
    /// A second root element was opened.
    MultipleRoots {
        /// Byte offset of the start tag.
        offset: usize,
    },
    /// Tag syntax could not be parsed.
    MalformedTag {
        /// Byte offset of the tag.
        offset: usize,
    },
    /// A single token grew larger than the configured buffer limit.
    BufferLimit {
        /// Configured maximum number of buffered bytes.
        limit: usize,
    },
}

impl fmt::Display for MarkupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof { offset } => write!(f, "unexpected end of input at byte {offset}"),
            Self::MismatchedTag {
                expected,
                found,
                offset,
            } => write!(
                f,
                "mismatched end tag at byte {offset}: expected </{expected}>, found </{found}>"
            ),
            Self::UnexpectedEndTag { name, offset } => {
                write!(f, "unexpected end tag </{name}> at byte {offset}")
            }
            Self::UnknownEntity { entity, offset } => {
                write!(f, "unknown entity &{entity}; near byte {offset}")
            }
            Self::InvalidUtf8 { offset } => write!(f, "invalid UTF-8 at byte {offset}"),
            Self::TextOutsideRoot { offset } => {
                write!(f, "character data outside root element at byte {offset}")
            }
            Self::MultipleRoots { offset } => {
                write!(f, "second root element at byte {offset}")
            }
            Self::MalformedTag { offset } => write!(f, "malformed tag at byte {offset}"),
            Self::BufferLimit { limit } => {
                write!(f, "token exceeds buffer limit of {limit} bytes")
            }
        }
    }
}

impl std::error::Error for MarkupError {}
