//! Bounded, resumable value encoding.
//!
//! The encoder owns the value it writes and walks it with an explicit
//! work-list. Each call to [`ValueEncoder::advance_into`] performs at most
//! `budget` steps and then returns, so a large result can be written in
//! slices between other scheduled work.

use std::fmt::Write as _;
use std::io::{self, Write};

use bytes::BytesMut;
use tracing::trace;

use super::{Fault, Member, Value, XML_DECLARATION};
use crate::markup::escape_into;

pub(crate) const NON_FINITE_RESULT: &str = "result contains a non-finite double";

/// Pending unit of output.
#[derive(Debug)]
enum Work {
    Value(Value),
    Members(std::vec::IntoIter<Member>),
    Elements(std::vec::IntoIter<Value>),
    Literal(&'static str),
}

/// Incremental encoder for one `<value>` tree.
///
/// Doubles are written with `Display`, so a tree holding NaN or an infinity
/// encodes to text no decoder accepts. Check [`Value::is_finite`] first;
/// [`ResponseEncoder::success`] does.
#[derive(Debug)]
pub struct ValueEncoder {
    work: Vec<Work>,
    steps: u64,
}

impl ValueEncoder {
    /// Encoder that will write `value`.
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self {
            work: vec![Work::Value(value)],
            steps: 0,
        }
    }

    /// Whether the whole tree has been written.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.work.is_empty()
    }

    /// Total steps performed so far.
    #[must_use]
    pub const fn steps(&self) -> u64 {
        self.steps
    }

    /// Perform at most `budget` steps into `out`. Returns `true` when done.
    ///
    /// A zero budget is treated as one step so every call makes progress.
    pub fn advance_into(&mut self, out: &mut BytesMut, budget: usize) -> bool {
        for _ in 0..budget.max(1) {
            let Some(item) = self.work.pop() else {
                break;
            };
            self.steps += 1;
            self.step(item, out);
        }
        trace!(steps = self.steps, pending = self.work.len(), "encode increment");
        self.work.is_empty()
    }

    /// Perform at most `budget` steps, writing the output to `sink`.
    pub fn advance<W: Write + ?Sized>(&mut self, sink: &mut W, budget: usize) -> io::Result<bool> {
        let mut out = BytesMut::new();
        let done = self.advance_into(&mut out, budget);
        sink.write_all(&out)?;
        Ok(done)
    }

    fn step(&mut self, item: Work, out: &mut BytesMut) {
        match item {
            Work::Literal(text) => out.extend_from_slice(text.as_bytes()),
            Work::Value(Value::Struct(members)) => {
                out.extend_from_slice(b"<value><struct>");
                self.work.push(Work::Literal("</struct></value>"));
                self.work.push(Work::Members(members.into_iter()));
            }
            Work::Value(Value::Array(items)) => {
                out.extend_from_slice(b"<value><array><data>");
                self.work.push(Work::Literal("</data></array></value>"));
                self.work.push(Work::Elements(items.into_iter()));
            }
            Work::Value(scalar) => write_scalar(out, &scalar),
            Work::Members(mut members) => {
                if let Some(member) = members.next() {
                    out.extend_from_slice(b"<member><name>");
                    escape_into(out, &member.name);
                    out.extend_from_slice(b"</name>");
                    self.work.push(Work::Members(members));
                    self.work.push(Work::Literal("</member>"));
                    self.work.push(Work::Value(member.value));
                }
            }
            Work::Elements(mut items) => {
                if let Some(item) = items.next() {
                    self.work.push(Work::Elements(items));
                    self.work.push(Work::Value(item));
                }
            }
        }
    }
}

/// Write a scalar (or [`Value::Void`]) wrapped in `<value>`.
///
/// Containers are written empty; use [`ValueEncoder`] for trees.
fn write_scalar(out: &mut BytesMut, value: &Value) {
    // Formatting into BytesMut cannot fail.
    match value {
        Value::Void => out.extend_from_slice(b"<value><string></string></value>"),
        Value::Bool(flag) => {
            let text: &[u8] = if *flag { b"1" } else { b"0" };
            out.extend_from_slice(b"<value><boolean>");
            out.extend_from_slice(text);
            out.extend_from_slice(b"</boolean></value>");
        }
        Value::Int(number) => {
            let _ = write!(out, "<value><int>{number}</int></value>");
        }
        Value::Double(number) => {
            let _ = write!(out, "<value><double>{number}</double></value>");
        }
        Value::Str(text) => {
            out.extend_from_slice(b"<value><string>");
            escape_into(out, text);
            out.extend_from_slice(b"</string></value>");
        }
        Value::Struct(_) => out.extend_from_slice(b"<value><struct></struct></value>"),
        Value::Array(_) => out.extend_from_slice(b"<value><array><data></data></array></value>"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Prologue,
    Body,
    Done,
}

/// Frames a result or fault as a complete `<methodResponse>` document.
#[derive(Debug)]
pub struct ResponseEncoder {
    body: ValueEncoder,
    fault: bool,
    stage: Stage,
}

impl ResponseEncoder {
    /// Successful response carrying `value`.
    ///
    /// A value holding a non-finite double becomes a serialization fault.
    #[must_use]
    pub fn success(value: Value) -> Self {
        if !value.is_finite() {
            return Self::fault(&Fault::serialization(NON_FINITE_RESULT));
        }
        Self {
            body: ValueEncoder::new(value),
            fault: false,
            stage: Stage::Prologue,
        }
    }

    /// Fault response.
    #[must_use]
    pub fn fault(fault: &Fault) -> Self {
        Self {
            body: ValueEncoder::new(fault.to_value()),
            fault: true,
            stage: Stage::Prologue,
        }
    }

    /// Response for an invocation outcome.
    #[must_use]
    pub fn from_outcome(outcome: Result<Value, Fault>) -> Self {
        match outcome {
            Ok(value) => Self::success(value),
            Err(fault) => Self::fault(&fault),
        }
    }

    /// Whether this encodes a fault.
    #[must_use]
    pub const fn is_fault(&self) -> bool {
        self.fault
    }

    /// Whether the closing tags have been written.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.stage == Stage::Done
    }

    /// Write the XML declaration and opening tags.
    pub fn begin(&mut self, out: &mut BytesMut) {
        if self.stage != Stage::Prologue {
            return;
        }
        out.extend_from_slice(XML_DECLARATION.as_bytes());
        if self.fault {
            out.extend_from_slice(b"<methodResponse><fault>");
        } else {
            out.extend_from_slice(b"<methodResponse><params><param>");
        }
        self.stage = Stage::Body;
    }

    /// Write at most `budget` body steps, then the closing tags once the body is done.
    pub fn advance_into(&mut self, out: &mut BytesMut, budget: usize) -> bool {
        match self.stage {
            Stage::Done => return true,
            Stage::Prologue => self.begin(out),
            Stage::Body => {}
        }
        if !self.body.advance_into(out, budget) {
            return false;
        }
        if self.fault {
            out.extend_from_slice(b"</fault></methodResponse>");
        } else {
            out.extend_from_slice(b"</param></params></methodResponse>");
        }
        self.stage = Stage::Done;
        true
    }

    /// Steps performed by the body encoder.
    #[must_use]
    pub const fn steps(&self) -> u64 {
        self.body.steps()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_all(value: Value) -> String {
        let mut out = BytesMut::new();
        let mut encoder = ValueEncoder::new(value);
        while !encoder.advance_into(&mut out, 3) {}
        String::from_utf8(out.to_vec()).unwrap()
    }

    #[test]
    fn test_scalar_shapes() {
        assert_eq!(encode_all(Value::Int(-4)), "<value><int>-4</int></value>");
        assert_eq!(encode_all(Value::Bool(true)), "<value><boolean>1</boolean></value>");
        assert_eq!(encode_all(Value::Bool(false)), "<value><boolean>0</boolean></value>");
        assert_eq!(encode_all(Value::Double(0.5)), "<value><double>0.5</double></value>");
        assert_eq!(encode_all(Value::from("<&>")), "<value><string>&lt;&amp;&gt;</string></value>");
        assert_eq!(encode_all(Value::Void), "<value><string></string></value>");
    }

    #[test]
    fn test_struct_shape() {
        let value = Value::structure([("a", Value::Int(1)), ("b<", Value::from("x"))]);
        assert_eq!(
            encode_all(value),
            "<value><struct>\
             <member><name>a</name><value><int>1</int></value></member>\
             <member><name>b&lt;</name><value><string>x</string></value></member>\
             </struct></value>"
        );
    }

    #[test]
    fn test_array_shape() {
        let value = Value::Array(vec![Value::Int(1), Value::Array(vec![])]);
        assert_eq!(
            encode_all(value),
            "<value><array><data>\
             <value><int>1</int></value>\
             <value><array><data></data></array></value>\
             </data></array></value>"
        );
    }

    #[test]
    fn test_budget_bounds_each_call() {
        let value = Value::Array((0..100).map(Value::Int).collect());
        let mut encoder = ValueEncoder::new(value);
        let mut out = BytesMut::new();
        let mut calls = 0;
        let mut previous = 0;
        loop {
            calls += 1;
            let done = encoder.advance_into(&mut out, 10);
            assert!(encoder.steps() - previous <= 10);
            previous = encoder.steps();
            if done {
                break;
            }
        }
        assert!(calls > 10);
        assert_eq!(out.iter().filter(|&&b| b == b'<').count(), 6 + 100 * 4);
    }

    #[test]
    fn test_response_framing() {
        let mut out = BytesMut::new();
        let mut response = ResponseEncoder::success(Value::Int(3));
        response.begin(&mut out);
        while !response.advance_into(&mut out, 1) {}
        assert_eq!(
            String::from_utf8(out.to_vec()).unwrap(),
            "<?xml version=\"1.0\"?>\n<methodResponse><params><param>\
             <value><int>3</int></value></param></params></methodResponse>"
        );

        let mut out = BytesMut::new();
        let mut response = ResponseEncoder::fault(&Fault::new(4, "bad"));
        assert!(response.is_fault());
        while !response.advance_into(&mut out, 10) {}
        assert_eq!(
            String::from_utf8(out.to_vec()).unwrap(),
            "<?xml version=\"1.0\"?>\n<methodResponse><fault><value><struct>\
             <member><name>faultCode</name><value><int>4</int></value></member>\
             <member><name>faultString</name><value><string>bad</string></value></member>\
             </struct></value></fault></methodResponse>"
        );
        assert!(response.is_done());
    }

    #[test]
    fn test_non_finite_success_becomes_fault() {
        for number in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let mut out = BytesMut::new();
            let mut response = ResponseEncoder::success(Value::Array(vec![Value::Double(number)]));
            assert!(response.is_fault());
            while !response.advance_into(&mut out, 10) {}
            let text = String::from_utf8(out.to_vec()).unwrap();
            assert!(text.contains("<int>2</int>"));
            assert!(!text.contains("<double>"));
        }
    }

    #[test]
    fn test_advance_to_writer() {
        let mut sink = Vec::new();
        let mut encoder = ValueEncoder::new(Value::from("hi"));
        assert!(encoder.advance(&mut sink, 10).unwrap());
        assert_eq!(sink, b"<value><string>hi</string></value>");
    }
}
