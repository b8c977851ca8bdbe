//! Value sinks: the push interface fed by the value decoder.

use super::{DecodeError, MAX_NESTING_DEPTH, Member, Value};

/// Receives typed events while a value tree is decoded.
///
/// Calls arrive in document order. `begin_member`/`begin_element` descend
/// into a child and `finish_member`/`finish_element` return to its parent,
/// so an implementation tracks the current position itself.
pub trait ValueSink {
    /// Set the current value to a boolean.
    fn set_bool(&mut self, value: bool) -> Result<(), DecodeError>;
    /// Set the current value to an integer.
    fn set_int(&mut self, value: i32) -> Result<(), DecodeError>;
    /// Set the current value to a double.
    fn set_double(&mut self, value: f64) -> Result<(), DecodeError>;
    /// Set the current value to a string.
    fn set_string(&mut self, value: String) -> Result<(), DecodeError>;
    /// The current value is a struct (possibly empty).
    fn begin_struct(&mut self) -> Result<(), DecodeError>;
    /// The current value is an array (possibly empty).
    fn begin_array(&mut self) -> Result<(), DecodeError>;
    /// Descend into a new struct member.
    fn begin_member(&mut self, name: String) -> Result<(), DecodeError>;
    /// Attach the finished member to its parent struct.
    fn finish_member(&mut self) -> Result<(), DecodeError>;
    /// Descend into a new array element.
    fn begin_element(&mut self) -> Result<(), DecodeError>;
    /// Attach the finished element to its parent array.
    fn finish_element(&mut self) -> Result<(), DecodeError>;
}

#[derive(Debug)]
struct Frame {
    /// `Some` for struct members, `None` for array elements.
    name: Option<String>,
    value: Value,
}

/// [`ValueSink`] that assembles an owned [`Value`] tree.
///
/// Open children live on an explicit frame stack, so nesting depth costs heap
/// rather than call stack. Depth beyond `max_depth` is rejected.
#[derive(Debug)]
pub struct ValueBuilder {
    root: Value,
    open: Vec<Frame>,
    max_depth: usize,
}

impl Default for ValueBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueBuilder {
    /// Builder with the default depth limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_depth(MAX_NESTING_DEPTH)
    }

    /// Builder rejecting trees nested deeper than `max_depth`.
    #[must_use]
    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            root: Value::Void,
            open: Vec::new(),
            max_depth,
        }
    }

    /// Number of children currently open.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.open.len()
    }

    /// The root value built so far.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.root
    }

    /// Take the root value, leaving the builder empty.
    pub fn take(&mut self) -> Value {
        self.open.clear();
        std::mem::take(&mut self.root)
    }

    /// Discard everything built so far.
    pub fn reset(&mut self) {
        self.open.clear();
        self.root = Value::Void;
    }

    fn current(&mut self) -> &mut Value {
        match self.open.last_mut() {
            Some(frame) => &mut frame.value,
            None => &mut self.root,
        }
    }

    fn set(&mut self, value: Value) -> Result<(), DecodeError> {
        *self.current() = value;
        Ok(())
    }

    fn descend(&mut self, name: Option<String>) -> Result<(), DecodeError> {
        if self.open.len() >= self.max_depth {
            return Err(DecodeError::structural(format!(
                "value nesting exceeds {} levels",
                self.max_depth
            )));
        }
        self.open.push(Frame {
            name,
            value: Value::Void,
        });
        Ok(())
    }
}

impl ValueSink for ValueBuilder {
    fn set_bool(&mut self, value: bool) -> Result<(), DecodeError> {
        self.set(Value::Bool(value))
    }

    fn set_int(&mut self, value: i32) -> Result<(), DecodeError> {
        self.set(Value::Int(value))
    }

    fn set_double(&mut self, value: f64) -> Result<(), DecodeError> {
        self.set(Value::Double(value))
    }

    fn set_string(&mut self, value: String) -> Result<(), DecodeError> {
        self.set(Value::Str(value))
    }

    fn begin_struct(&mut self) -> Result<(), DecodeError> {
        self.set(Value::Struct(Vec::new()))
    }

    fn begin_array(&mut self) -> Result<(), DecodeError> {
        self.set(Value::Array(Vec::new()))
    }

    fn begin_member(&mut self, name: String) -> Result<(), DecodeError> {
        if !matches!(self.current(), Value::Struct(_)) {
            return Err(DecodeError::structural("member outside of a struct"));
        }
        self.descend(Some(name))
    }

    fn finish_member(&mut self) -> Result<(), DecodeError> {
        let frame = match self.open.pop() {
            Some(Frame {
                name: Some(name),
                value,
            }) => Member { name, value },
            _ => return Err(DecodeError::structural("no open struct member")),
        };
        match self.current() {
            Value::Struct(members) => {
                members.push(frame);
                Ok(())
            }
            _ => Err(DecodeError::structural("member parent is not a struct")),
        }
    }

    fn begin_element(&mut self) -> Result<(), DecodeError> {
        if !matches!(self.current(), Value::Array(_)) {
            return Err(DecodeError::structural("element outside of an array"));
        }
        self.descend(None)
    }

    fn finish_element(&mut self) -> Result<(), DecodeError> {
        let value = match self.open.pop() {
            Some(Frame { name: None, value }) => value,
            _ => return Err(DecodeError::structural("no open array element")),
        };
        match self.current() {
            Value::Array(items) => {
                items.push(value);
                Ok(())
            }
            _ => Err(DecodeError::structural("element parent is not an array")),
        }
    }
}
