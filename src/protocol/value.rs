//! XML-RPC value model

use std::fmt;

/// Typed value exchanged between the codec and procedures.
///
/// Binary (`base64`) values are recognized on the wire but have no variant
/// here; decoding one fails with a serialization fault.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Value {
    /// No value. Encoded as an empty string.
    #[default]
    Void,
    /// `<boolean>`
    Bool(bool),
    /// `<int>` / `<i4>`
    Int(i32),
    /// `<double>`
    Double(f64),
    /// `<string>` or untyped character data
    Str(String),
    /// `<struct>`; members keep arrival order and may repeat.
    Struct(Vec<Member>),
    /// `<array>`
    Array(Vec<Value>),
}

/// Named struct member.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Member {
    /// Member name.
    pub name: String,
    /// Member value.
    pub value: Value,
}

impl Member {
    /// Create a member.
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Discriminant of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// [`Value::Void`]
    Void,
    /// [`Value::Bool`]
    Bool,
    /// [`Value::Int`]
    Int,
    /// [`Value::Double`]
    Double,
    /// [`Value::Str`]
    Str,
    /// [`Value::Struct`]
    Struct,
    /// [`Value::Array`]
    Array,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Void => "void",
            Self::Bool => "boolean",
            Self::Int => "int",
            Self::Double => "double",
            Self::Str => "string",
            Self::Struct => "struct",
            Self::Array => "array",
        };
        write!(f, "{name}")
    }
}

impl Value {
    /// Build a struct from `(name, value)` pairs.
    pub fn structure<N, V>(members: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<Self>,
    {
        Self::Struct(
            members
                .into_iter()
                .map(|(name, value)| Member::new(name, value))
                .collect(),
        )
    }

    /// Kind of this value.
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        match self {
            Self::Void => ValueKind::Void,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Double(_) => ValueKind::Double,
            Self::Str(_) => ValueKind::Str,
            Self::Struct(_) => ValueKind::Struct,
            Self::Array(_) => ValueKind::Array,
        }
    }

    /// Boolean payload.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Integer payload.
    #[must_use]
    pub const fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Double payload; integers widen.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Double(value) => Some(*value),
            Self::Int(value) => Some(f64::from(*value)),
            _ => None,
        }
    }

    /// String payload.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }

    /// Struct members.
    #[must_use]
    pub fn as_members(&self) -> Option<&[Member]> {
        match self {
            Self::Struct(members) => Some(members),
            _ => None,
        }
    }

    /// Array elements.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Self]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// First struct member called `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Self> {
        self.as_members()?
            .iter()
            .find(|member| member.name == name)
            .map(|member| &member.value)
    }

    /// Whether every double in the tree is finite. NaN and infinities have
    /// no XML-RPC form.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        let mut pending = vec![self];
        while let Some(value) = pending.pop() {
            match value {
                Self::Double(number) if !number.is_finite() => return false,
                Self::Struct(members) => pending.extend(members.iter().map(|member| &member.value)),
                Self::Array(items) => pending.extend(items),
                _ => {}
            }
        }
        true
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

impl From<Vec<Member>> for Value {
    fn from(members: Vec<Member>) -> Self {
        Self::Struct(members)
    }
}
