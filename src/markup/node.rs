//! Node events delivered by a tokenizer.

/// Attribute attached to a start tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Attribute name.
    pub name: String,
    /// Unescaped attribute value.
    pub value: String,
}

/// One markup event in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Opening tag, including self-closing tags (followed by a matching end).
    StartElement {
        /// Element name.
        name: String,
        /// Attributes in source order.
        attributes: Vec<Attribute>,
    },
    /// Closing tag.
    EndElement {
        /// Element name.
        name: String,
    },
    /// Unescaped character data.
    Characters {
        /// Text content.
        text: String,
    },
    /// End of the document.
    EndDocument,
}

impl Node {
    /// Start tag without attributes.
    pub fn start(name: impl Into<String>) -> Self {
        Self::StartElement {
            name: name.into(),
            attributes: Vec::new(),
        }
    }

    /// End tag.
    pub fn end(name: impl Into<String>) -> Self {
        Self::EndElement { name: name.into() }
    }

    /// Character data.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Characters { text: text.into() }
    }

    /// Element name for start and end tags.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::StartElement { name, .. } | Self::EndElement { name } => Some(name),
            _ => None,
        }
    }

    /// Whether this is character data made only of XML whitespace.
    #[must_use]
    pub fn is_whitespace(&self) -> bool {
        match self {
            Self::Characters { text } => text.bytes().all(|b| b.is_ascii_whitespace()),
            _ => false,
        }
    }

    /// Short description used in error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::StartElement { name, .. } => format!("<{name}>"),
            Self::EndElement { name } => format!("</{name}>"),
            Self::Characters { .. } => "character data".to_owned(),
            Self::EndDocument => "end of document".to_owned(),
        }
    }
}
