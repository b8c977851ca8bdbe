//! Resumable decoder for one `<value>` subtree.
//!
//! The decoder is driven one [`Node`] at a time and keeps all of its
//! position in a flat [`DecoderState`] plus a stack of open containers. It
//! never recurses, so nesting depth is limited only by the sink.
//!
//! # Wire shape
//!
//! ```text
//! <value>
//!   <int>|<i4>|<boolean>|<double>|<string> TEXT </...>
//!   | <struct> (<member><name>N</name><value>...</value></member>)* </struct>
//!   | <array><data> (<value>...</value>)* </data></array>
//!   | TEXT
//! </value>
//! ```

use tracing::trace;

use super::{DecodeError, ValueSink};
use crate::markup::Node;

/// Position of the decoder within a value subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// Waiting for the `<value>` that opens the subtree.
    AwaitingParam,
    /// Inside `<value>`, waiting for a type tag or character data.
    AwaitingValueTag,
    /// A `</value>` was consumed; the parent decides what follows.
    ValueEnd,
    /// Inside `<struct>`, expecting `<member>` or `</struct>`.
    StructBegin,
    /// After `</struct>`, expecting `</value>`.
    StructEnd,
    /// Inside `<member>`, expecting `<name>`.
    MemberBegin,
    /// Inside `<name>`, nothing read yet.
    NameBegin,
    /// Inside `<name>`, accumulating text.
    Name,
    /// After `</name>`, expecting the member `<value>`.
    NameEnd,
    /// Inside `<boolean>`.
    BoolBody,
    /// Inside `<int>` or `<i4>`.
    IntBody,
    /// Inside `<double>`.
    DoubleBody,
    /// Inside `<string>` or an unrecognized scalar tag.
    StringBody,
    /// Scalar text received, waiting for the closing tag.
    ScalarClosing,
    /// Scalar tag closed, expecting `</value>`.
    ScalarClosed,
    /// Inside `<array>`, expecting `<data>`.
    ArrayBegin,
    /// Inside `<data>`, expecting `<value>` or `</data>`.
    DataBegin,
    /// After `</data>`, expecting `</array>`.
    DataEnd,
    /// After `</array>`, expecting `</value>`.
    ArrayEnd,
}

/// Where the decoder stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    /// Complete on the `</param>` following the value.
    Param,
    /// Complete on the outermost `</value>`.
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Struct,
    Array,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scalar {
    Bool,
    Int,
    Double,
    Str,
}

enum Transition {
    Consumed,
    Reenter,
    Complete,
}

/// Incremental value decoder.
#[derive(Debug)]
pub struct ValueDecoder {
    state: DecoderState,
    terminal: Terminal,
    containers: Vec<Container>,
    scalar: Scalar,
    tag: String,
    text: String,
    name: String,
    /// Character data directly inside `<value>`, with no type tag.
    bare: bool,
    done: bool,
}

impl Default for ValueDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueDecoder {
    /// Decoder for a `<param>` body: completes on `</param>`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_terminal(Terminal::Param)
    }

    /// Decoder for a standalone `<value>` element: completes on its `</value>`.
    #[must_use]
    pub fn for_value() -> Self {
        Self::with_terminal(Terminal::Value)
    }

    fn with_terminal(terminal: Terminal) -> Self {
        Self {
            state: DecoderState::AwaitingParam,
            terminal,
            containers: Vec::new(),
            scalar: Scalar::Str,
            tag: String::new(),
            text: String::new(),
            name: String::new(),
            bare: false,
            done: false,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> DecoderState {
        self.state
    }

    /// Number of open structs and arrays.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.containers.len()
    }

    /// Whether the subtree has been fully consumed.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.done
    }

    /// Prepare for a new subtree, keeping allocations.
    pub fn reset(&mut self) {
        self.state = DecoderState::AwaitingParam;
        self.containers.clear();
        self.scalar = Scalar::Str;
        self.tag.clear();
        self.text.clear();
        self.name.clear();
        self.bare = false;
        self.done = false;
    }

    /// Consume one node, pushing decoded events into `sink`.
    ///
    /// Returns `Ok(true)` once the subtree is complete.
    pub fn advance(&mut self, node: &Node, sink: &mut dyn ValueSink) -> Result<bool, DecodeError> {
        if self.done {
            return Err(DecodeError::structural(format!(
                "unexpected {} after value",
                node.describe()
            )));
        }

        loop {
            trace!(state = ?self.state, node = %node.describe(), "decode step");
            match self.step(node, sink)? {
                Transition::Consumed => return Ok(false),
                Transition::Reenter => {}
                Transition::Complete => {
                    self.done = true;
                    return Ok(true);
                }
            }
        }
    }

    fn step(&mut self, node: &Node, sink: &mut dyn ValueSink) -> Result<Transition, DecodeError> {
        use DecoderState as S;

        if node.is_whitespace() && self.ignores_whitespace() {
            return Ok(Transition::Consumed);
        }

        match self.state {
            S::AwaitingParam => match node {
                Node::StartElement { name, .. } if name == "value" => Ok(self.open_value()),
                other => Err(unexpected("<value>", other)),
            },
            S::AwaitingValueTag => self.value_tag(node, sink),
            S::BoolBody | S::IntBody | S::DoubleBody | S::StringBody | S::ScalarClosing => {
                self.scalar_body(node, sink)
            }
            S::ScalarClosed | S::StructEnd | S::ArrayEnd => match node {
                Node::EndElement { name } if name == "value" => Ok(self.value_closed()),
                other => Err(unexpected("</value>", other)),
            },
            S::StructBegin => match node {
                Node::StartElement { name, .. } if name == "member" => {
                    self.state = S::MemberBegin;
                    Ok(Transition::Consumed)
                }
                Node::EndElement { name } if name == "struct" => {
                    self.containers.pop();
                    self.state = S::StructEnd;
                    Ok(Transition::Consumed)
                }
                other => Err(unexpected("<member> or </struct>", other)),
            },
            S::MemberBegin => match node {
                Node::StartElement { name, .. } if name == "name" => {
                    self.name.clear();
                    self.state = S::NameBegin;
                    Ok(Transition::Consumed)
                }
                other => Err(unexpected("<name>", other)),
            },
            S::NameBegin | S::Name => match node {
                Node::Characters { text } => {
                    self.name.push_str(text);
                    self.state = S::Name;
                    Ok(Transition::Consumed)
                }
                Node::EndElement { name } if name == "name" => {
                    self.state = S::NameEnd;
                    Ok(Transition::Consumed)
                }
                other => Err(unexpected("member name", other)),
            },
            S::NameEnd => match node {
                Node::StartElement { name, .. } if name == "value" => {
                    sink.begin_member(std::mem::take(&mut self.name))?;
                    Ok(self.open_value())
                }
                other => Err(unexpected("member <value>", other)),
            },
            S::ArrayBegin => match node {
                Node::StartElement { name, .. } if name == "data" => {
                    self.state = S::DataBegin;
                    Ok(Transition::Consumed)
                }
                other => Err(unexpected("<data>", other)),
            },
            S::DataBegin => match node {
                Node::StartElement { name, .. } if name == "value" => {
                    sink.begin_element()?;
                    Ok(self.open_value())
                }
                Node::EndElement { name } if name == "data" => {
                    self.state = S::DataEnd;
                    Ok(Transition::Consumed)
                }
                other => Err(unexpected("<value> or </data>", other)),
            },
            S::DataEnd => match node {
                Node::EndElement { name } if name == "array" => {
                    self.containers.pop();
                    self.state = S::ArrayEnd;
                    Ok(Transition::Consumed)
                }
                other => Err(unexpected("</array>", other)),
            },
            S::ValueEnd => self.value_end(node, sink),
        }
    }

    /// States where whitespace-only character data carries no meaning.
    const fn ignores_whitespace(&self) -> bool {
        use DecoderState as S;
        !matches!(
            self.state,
            S::AwaitingValueTag
                | S::BoolBody
                | S::IntBody
                | S::DoubleBody
                | S::StringBody
                | S::ScalarClosing
                | S::NameBegin
                | S::Name
        )
    }

    fn open_value(&mut self) -> Transition {
        self.state = DecoderState::AwaitingValueTag;
        self.text.clear();
        self.bare = false;
        Transition::Consumed
    }

    fn value_closed(&mut self) -> Transition {
        if self.containers.is_empty() && self.terminal == Terminal::Value {
            return Transition::Complete;
        }
        self.state = DecoderState::ValueEnd;
        Transition::Consumed
    }

    fn value_tag(&mut self, node: &Node, sink: &mut dyn ValueSink) -> Result<Transition, DecodeError> {
        use DecoderState as S;

        match node {
            Node::StartElement { name, .. } => {
                // Whitespace ahead of a type tag is formatting, not content.
                self.text.clear();
                self.tag.clone_from(name);
                self.state = match name.as_str() {
                    "struct" => {
                        sink.begin_struct()?;
                        self.containers.push(Container::Struct);
                        S::StructBegin
                    }
                    "array" => {
                        sink.begin_array()?;
                        self.containers.push(Container::Array);
                        S::ArrayBegin
                    }
                    "int" | "i4" => {
                        self.scalar = Scalar::Int;
                        S::IntBody
                    }
                    "boolean" => {
                        self.scalar = Scalar::Bool;
                        S::BoolBody
                    }
                    "double" => {
                        self.scalar = Scalar::Double;
                        S::DoubleBody
                    }
                    "base64" => {
                        return Err(DecodeError::structural("base64 values are not supported"));
                    }
                    _ => {
                        self.scalar = Scalar::Str;
                        S::StringBody
                    }
                };
                Ok(Transition::Consumed)
            }
            Node::Characters { text } => {
                self.text.push_str(text);
                if !node.is_whitespace() {
                    self.bare = true;
                    self.scalar = Scalar::Str;
                    self.state = S::ScalarClosing;
                }
                Ok(Transition::Consumed)
            }
            Node::EndElement { name } if name == "value" => {
                sink.set_string(std::mem::take(&mut self.text))?;
                Ok(self.value_closed())
            }
            other => Err(unexpected("value content", other)),
        }
    }

    fn scalar_body(&mut self, node: &Node, sink: &mut dyn ValueSink) -> Result<Transition, DecodeError> {
        match node {
            Node::Characters { text } => {
                self.text.push_str(text);
                self.state = DecoderState::ScalarClosing;
                Ok(Transition::Consumed)
            }
            Node::EndElement { name } if self.bare && name == "value" => {
                sink.set_string(std::mem::take(&mut self.text))?;
                Ok(self.value_closed())
            }
            Node::EndElement { name } if !self.bare && *name == self.tag => {
                self.convert(sink)?;
                self.state = DecoderState::ScalarClosed;
                Ok(Transition::Consumed)
            }
            other => Err(unexpected("scalar text", other)),
        }
    }

    /// A child value closed; hand control back to its parent.
    fn value_end(&mut self, node: &Node, sink: &mut dyn ValueSink) -> Result<Transition, DecodeError> {
        match self.containers.last() {
            None => match node {
                Node::EndElement { name } if name == "param" => Ok(Transition::Complete),
                other => Err(unexpected("</param>", other)),
            },
            Some(Container::Struct) => match node {
                Node::EndElement { name } if name == "member" => {
                    sink.finish_member()?;
                    self.state = DecoderState::StructBegin;
                    Ok(Transition::Consumed)
                }
                other => Err(unexpected("</member>", other)),
            },
            Some(Container::Array) => {
                sink.finish_element()?;
                self.state = DecoderState::DataBegin;
                Ok(Transition::Reenter)
            }
        }
    }

    fn convert(&mut self, sink: &mut dyn ValueSink) -> Result<(), DecodeError> {
        let text = std::mem::take(&mut self.text);
        match self.scalar {
            Scalar::Bool => sink.set_bool(parse_bool(&text)?),
            Scalar::Int => sink.set_int(parse_int(&text)?),
            Scalar::Double => sink.set_double(parse_double(&text)?),
            Scalar::Str => sink.set_string(text),
        }
    }
}

fn unexpected(expected: &str, found: &Node) -> DecodeError {
    DecodeError::structural(format!("expected {expected}, found {}", found.describe()))
}

/// Parse `0`, `1`, `false` or `true`, allowing surrounding whitespace.
pub(crate) fn parse_bool(text: &str) -> Result<bool, DecodeError> {
    let token = text.trim_start_matches(|c: char| c.is_ascii_whitespace());
    let (value, rest) = if let Some(rest) = token.strip_prefix("true") {
        (true, rest)
    } else if let Some(rest) = token.strip_prefix("false") {
        (false, rest)
    } else if let Some(rest) = token.strip_prefix('1') {
        (true, rest)
    } else if let Some(rest) = token.strip_prefix('0') {
        (false, rest)
    } else {
        return Err(DecodeError::structural(format!("invalid boolean value {text:?}")));
    };

    if rest.bytes().all(|b| b.is_ascii_whitespace()) {
        Ok(value)
    } else {
        Err(DecodeError::structural(format!("invalid boolean value {text:?}")))
    }
}

pub(crate) fn parse_int(text: &str) -> Result<i32, DecodeError> {
    text.trim()
        .parse()
        .map_err(|_| DecodeError::conversion(format!("invalid int value {text:?}")))
}

pub(crate) fn parse_double(text: &str) -> Result<f64, DecodeError> {
    let trimmed = text.trim();
    let well_formed = !trimmed.is_empty()
        && trimmed
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'e' | b'E'));
    if !well_formed {
        return Err(DecodeError::conversion(format!("invalid double value {text:?}")));
    }
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|number| number.is_finite())
        .ok_or_else(|| DecodeError::conversion(format!("invalid double value {text:?}")))
}
