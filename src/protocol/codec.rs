//! Whole-document helpers built on the incremental decoder and encoder.
//!
//! These buffer the complete input or output and are meant for tests,
//! clients, and small payloads. Servers should drive a [`super::Dispatcher`].

use bytes::BytesMut;

use super::{DecodeError, Error, Fault, ResponseEncoder, Value, ValueBuilder, ValueDecoder, ValueEncoder};
use crate::markup::{Node, NodeSource, Tokenizer};

/// Decode a standalone `<value>` element.
///
/// # Errors
///
/// Returns the markup, structural, or conversion error that stopped decoding.
pub fn decode_value(document: &str) -> Result<Value, DecodeError> {
    let mut tokens = Tokenizer::from_bytes(document);
    let mut builder = ValueBuilder::new();
    drive(&mut tokens, ValueDecoder::for_value(), &mut builder)?;
    expect_end(&mut tokens)?;
    Ok(builder.take())
}

/// Encode `value` as a `<value>` element.
#[must_use]
pub fn encode_value(value: &Value) -> String {
    let mut out = BytesMut::new();
    let mut encoder = ValueEncoder::new(value.clone());
    while !encoder.advance_into(&mut out, usize::MAX) {}
    into_string(out)
}

/// Encode a `<methodCall>` request document.
#[must_use]
pub fn encode_call(method: &str, params: &[Value]) -> String {
    let mut out = String::from(super::XML_DECLARATION);
    out.push_str("<methodCall><methodName>");
    out.push_str(&crate::markup::escape(method));
    out.push_str("</methodName><params>");
    for param in params {
        out.push_str("<param>");
        out.push_str(&encode_value(param));
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>");
    out
}

/// Encode a complete `<methodResponse>` document.
#[must_use]
pub fn encode_response(outcome: &Result<Value, Fault>) -> String {
    let mut out = BytesMut::new();
    let mut response = ResponseEncoder::from_outcome(outcome.clone());
    response.begin(&mut out);
    while !response.advance_into(&mut out, usize::MAX) {}
    into_string(out)
}

/// Decode a `<methodResponse>` document into its result or fault.
///
/// # Errors
///
/// Returns an error if the document is not a well-formed response.
pub fn decode_response(document: &str) -> Result<Result<Value, Fault>, DecodeError> {
    let mut tokens = Tokenizer::from_bytes(document);
    expect_start(&mut tokens, "methodResponse")?;

    let (fault, decoder) = match next(&mut tokens)? {
        Node::StartElement { name, .. } if name == "params" => {
            expect_start(&mut tokens, "param")?;
            (false, ValueDecoder::new())
        }
        Node::StartElement { name, .. } if name == "fault" => (true, ValueDecoder::for_value()),
        other => return Err(unexpected("<params> or <fault>", &other)),
    };

    let mut builder = ValueBuilder::new();
    drive(&mut tokens, decoder, &mut builder)?;

    let value = builder.take();
    let outcome = if fault {
        expect_close(&mut tokens, "fault")?;
        Err(Fault::from_value(&value)
            .ok_or_else(|| DecodeError::structural("fault value lacks faultCode/faultString"))?)
    } else {
        expect_close(&mut tokens, "params")?;
        Ok(value)
    };
    expect_close(&mut tokens, "methodResponse")?;
    expect_end(&mut tokens)?;
    Ok(outcome)
}

/// Decode a `<methodResponse>` document, folding a fault response into
/// [`Error::Fault`].
///
/// # Errors
///
/// [`Error::Decode`] if the document is malformed, [`Error::Fault`] if the
/// server answered with a fault.
pub fn response_value(document: &str) -> crate::Result<Value> {
    Ok(decode_response(document)??)
}

/// Feed nodes to `decoder` until its subtree is complete.
fn drive(
    tokens: &mut Tokenizer,
    mut decoder: ValueDecoder,
    builder: &mut ValueBuilder,
) -> Result<(), DecodeError> {
    loop {
        let node = tokens
            .advance()?
            .ok_or_else(|| DecodeError::structural("document ended early"))?;
        if decoder.advance(&node, builder)? {
            return Ok(());
        }
    }
}

/// Next node that is not formatting whitespace.
fn next(tokens: &mut Tokenizer) -> Result<Node, DecodeError> {
    loop {
        match tokens.advance()? {
            Some(node) if node.is_whitespace() => {}
            Some(node) => return Ok(node),
            None => return Err(DecodeError::structural("document ended early")),
        }
    }
}

fn expect_start(tokens: &mut Tokenizer, tag: &str) -> Result<(), DecodeError> {
    match next(tokens)? {
        Node::StartElement { name, .. } if name == tag => Ok(()),
        other => Err(unexpected(&format!("<{tag}>"), &other)),
    }
}

fn expect_close(tokens: &mut Tokenizer, tag: &str) -> Result<(), DecodeError> {
    match next(tokens)? {
        Node::EndElement { name } if name == tag => Ok(()),
        other => Err(unexpected(&format!("</{tag}>"), &other)),
    }
}

fn expect_end(tokens: &mut Tokenizer) -> Result<(), DecodeError> {
    match next(tokens)? {
        Node::EndDocument => Ok(()),
        other => Err(unexpected("end of document", &other)),
    }
}

fn unexpected(expected: &str, found: &Node) -> DecodeError {
    DecodeError::structural(format!("expected {expected}, found {}", found.describe()))
}

fn into_string(out: BytesMut) -> String {
    // Every fragment written by the encoder is valid UTF-8.
    String::from_utf8(out.to_vec()).unwrap_or_else(|err| String::from_utf8_lossy(err.as_bytes()).into_owned())
}
