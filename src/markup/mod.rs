//! Markup layer: node events, escaping, and an incremental tokenizer.
//!
//! The protocol layer never looks at raw bytes. It consumes [`Node`] events
//! from any [`NodeSource`], which lets the same decoder run against the
//! bundled [`Tokenizer`] or a pre-built node list in tests.

mod error;
mod escape;
mod node;
mod tokenizer;

pub use error::MarkupError;
pub use escape::{escape, escape_into, unescape};
pub use node::{Attribute, Node};
pub use tokenizer::{DEFAULT_MAX_BUFFERED, Tokenizer};

/// Pull source of markup node events.
pub trait NodeSource {
    /// Produce the next node in document order.
    ///
    /// `Ok(None)` means no complete node is available yet; the caller should
    /// supply more input and retry. The final node of a document is
    /// [`Node::EndDocument`].
    fn advance(&mut self) -> Result<Option<Node>, MarkupError>;
}

impl NodeSource for Tokenizer {
    fn advance(&mut self) -> Result<Option<Node>, MarkupError> {
        self.next_node()
    }
}

impl NodeSource for std::vec::IntoIter<Node> {
    fn advance(&mut self) -> Result<Option<Node>, MarkupError> {
        Ok(self.next())
    }
}
