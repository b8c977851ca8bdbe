//! Incremental tokenizer turning document bytes into [`Node`] events.
//!
//! Input arrives in arbitrary chunks through [`Tokenizer::feed`]. A node is
//! only produced once its bytes are complete; until then
//! [`Tokenizer::next_node`] returns `Ok(None)` and keeps the partial token
//! buffered.

use std::collections::VecDeque;

use bytes::BytesMut;
use tracing::trace;

use super::{Attribute, MarkupError, Node, unescape};

/// Default cap on bytes buffered while waiting for a complete token (16 MB).
pub const DEFAULT_MAX_BUFFERED: usize = 16 * 1024 * 1024;

const CDATA_OPEN: &[u8] = b"<![CDATA[";
const COMMENT_OPEN: &[u8] = b"<!--";

/// Outcome of examining the front of the buffer.
enum Step {
    Node(Node),
    Skipped,
    Incomplete,
}

/// How far the pending token has already been searched.
///
/// Cleared whenever a token is consumed, so a token split across many feeds
/// is scanned once in total.
#[derive(Debug, Default, Clone, Copy)]
struct Scan {
    resume: usize,
    quote: Option<u8>,
    brackets: usize,
}

/// Push-fed, pull-drained markup tokenizer.
#[derive(Debug)]
pub struct Tokenizer {
    buffer: BytesMut,
    open: Vec<String>,
    queued: VecDeque<Node>,
    offset: usize,
    scan: Scan,
    examined: u64,
    max_buffered: usize,
    input_closed: bool,
    root_closed: bool,
    finished: bool,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer {
    /// Create a tokenizer with the default buffer limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_BUFFERED)
    }

    /// Create a tokenizer that rejects tokens larger than `max_buffered` bytes.
    #[must_use]
    pub fn with_limit(max_buffered: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            open: Vec::new(),
            queued: VecDeque::new(),
            offset: 0,
            scan: Scan::default(),
            examined: 0,
            max_buffered,
            input_closed: false,
            root_closed: false,
            finished: false,
        }
    }

    /// Tokenizer over a complete document.
    pub fn from_bytes(input: impl AsRef<[u8]>) -> Self {
        let mut tokenizer = Self::new();
        tokenizer.feed(input.as_ref());
        tokenizer.finish();
        tokenizer
    }

    /// Append a chunk of document bytes.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Signal that no more input will be fed.
    pub fn finish(&mut self) {
        self.input_closed = true;
    }

    /// Whether [`Node::EndDocument`] has been produced.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes currently buffered and not yet tokenized.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Number of currently open elements.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.open.len()
    }

    /// Bytes inspected while searching for token boundaries.
    #[must_use]
    pub const fn bytes_examined(&self) -> u64 {
        self.examined
    }

    /// Discard all state so the tokenizer can parse a new document.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.open.clear();
        self.queued.clear();
        self.offset = 0;
        self.scan = Scan::default();
        self.examined = 0;
        self.input_closed = false;
        self.root_closed = false;
        self.finished = false;
    }

    /// Produce the next node, or `Ok(None)` if more input is needed.
    pub fn next_node(&mut self) -> Result<Option<Node>, MarkupError> {
        if let Some(node) = self.queued.pop_front() {
            return Ok(Some(node));
        }
        if self.finished {
            return Ok(None);
        }

        loop {
            let Some(&first) = self.buffer.first() else {
                if self.input_closed {
                    return self.end_of_input().map(Some);
                }
                return Ok(None);
            };

            let step = if first == b'<' {
                self.markup()?
            } else {
                self.text()?
            };

            match step {
                Step::Node(node) => {
                    trace!(offset = self.offset, node = %node.describe(), "token");
                    return Ok(Some(node));
                }
                Step::Skipped => {}
                Step::Incomplete => return self.incomplete(),
            }
        }
    }

    fn end_of_input(&mut self) -> Result<Node, MarkupError> {
        if !self.open.is_empty() || !self.root_closed {
            return Err(MarkupError::UnexpectedEof {
                offset: self.offset,
            });
        }
        self.finished = true;
        Ok(Node::EndDocument)
    }

    fn incomplete(&self) -> Result<Option<Node>, MarkupError> {
        if self.input_closed {
            return Err(MarkupError::UnexpectedEof {
                offset: self.offset + self.buffer.len(),
            });
        }
        if self.buffer.len() > self.max_buffered {
            return Err(MarkupError::BufferLimit {
                limit: self.max_buffered,
            });
        }
        Ok(None)
    }

    fn take(&mut self, len: usize) -> BytesMut {
        self.offset += len;
        self.scan = Scan::default();
        self.buffer.split_to(len)
    }

    /// Search the unscanned tail for `needle`, remembering the progress.
    ///
    /// `floor` is the first byte the needle may start at.
    fn scan_for(&mut self, needle: &[u8], floor: usize) -> Option<usize> {
        let from = self
            .scan
            .resume
            .saturating_sub(needle.len() - 1)
            .max(floor);
        let tail = self.buffer.get(from..).unwrap_or_default();
        self.examined += tail.len() as u64;
        if let Some(at) = find(tail, needle) {
            return Some(from + at);
        }
        self.scan.resume = self.buffer.len();
        None
    }

    fn text(&mut self) -> Result<Step, MarkupError> {
        let end = match self.scan_for(b"<", 0) {
            Some(end) => end,
            None if self.input_closed => self.buffer.len(),
            None => return Ok(Step::Incomplete),
        };

        let start = self.offset;
        let raw = self.take(end);
        let text = std::str::from_utf8(&raw).map_err(|_| MarkupError::InvalidUtf8 { offset: start })?;

        if self.open.is_empty() {
            if text.bytes().all(|b| b.is_ascii_whitespace()) {
                return Ok(Step::Skipped);
            }
            return Err(MarkupError::TextOutsideRoot { offset: start });
        }

        Ok(Step::Node(Node::Characters {
            text: unescape(text, start)?,
        }))
    }

    fn markup(&mut self) -> Result<Step, MarkupError> {
        if self.buffer.len() < 2 {
            return Ok(Step::Incomplete);
        }

        match self.buffer[1] {
            b'?' => Ok(self.skip_until(b"?>")),
            b'!' => {
                let head = &self.buffer[..];
                if head.starts_with(CDATA_OPEN) {
                    self.cdata()
                } else if head.starts_with(COMMENT_OPEN) {
                    Ok(self.skip_until(b"-->"))
                } else if CDATA_OPEN.starts_with(head) || COMMENT_OPEN.starts_with(head) {
                    Ok(Step::Incomplete)
                } else {
                    Ok(self.skip_declaration())
                }
            }
            b'/' => self.end_tag(),
            _ => self.start_tag(),
        }
    }

    fn skip_until(&mut self, terminator: &[u8]) -> Step {
        match self.scan_for(terminator, 2) {
            Some(at) => {
                self.take(at + terminator.len());
                Step::Skipped
            }
            None => Step::Incomplete,
        }
    }

    /// Skip `<!DOCTYPE ...>`, including a bracketed internal subset.
    fn skip_declaration(&mut self) -> Step {
        let from = self.scan.resume.max(2);
        let mut depth = self.scan.brackets;
        for index in from..self.buffer.len() {
            self.examined += 1;
            match self.buffer[index] {
                b'[' => depth += 1,
                b']' => depth = depth.saturating_sub(1),
                b'>' if depth == 0 => {
                    self.take(index + 1);
                    return Step::Skipped;
                }
                _ => {}
            }
        }
        self.scan.resume = self.buffer.len().max(from);
        self.scan.brackets = depth;
        Step::Incomplete
    }

    fn cdata(&mut self) -> Result<Step, MarkupError> {
        let Some(close) = self.scan_for(b"]]>", CDATA_OPEN.len()) else {
            return Ok(Step::Incomplete);
        };
        let close = close - CDATA_OPEN.len();

        let start = self.offset;
        let raw = self.take(CDATA_OPEN.len() + close + 3);
        let inner = &raw[CDATA_OPEN.len()..CDATA_OPEN.len() + close];
        let text = std::str::from_utf8(inner)
            .map_err(|_| MarkupError::InvalidUtf8 { offset: start })?
            .to_owned();

        if self.open.is_empty() {
            return Err(MarkupError::TextOutsideRoot { offset: start });
        }
        Ok(Step::Node(Node::Characters { text }))
    }

    fn end_tag(&mut self) -> Result<Step, MarkupError> {
        let Some(close) = self.scan_for(b">", 2) else {
            return Ok(Step::Incomplete);
        };

        let start = self.offset;
        let raw = self.take(close + 1);
        let name = std::str::from_utf8(&raw[2..close])
            .map_err(|_| MarkupError::InvalidUtf8 { offset: start })?
            .trim()
            .to_owned();

        match self.open.pop() {
            Some(expected) if expected == name => {
                if self.open.is_empty() {
                    self.root_closed = true;
                }
                Ok(Step::Node(Node::EndElement { name }))
            }
            Some(expected) => Err(MarkupError::MismatchedTag {
                expected,
                found: name,
                offset: start,
            }),
            None => Err(MarkupError::UnexpectedEndTag {
                name,
                offset: start,
            }),
        }
    }

    fn start_tag(&mut self) -> Result<Step, MarkupError> {
        let Some(close) = self.find_tag_end() else {
            return Ok(Step::Incomplete);
        };

        let start = self.offset;
        if self.root_closed {
            return Err(MarkupError::MultipleRoots { offset: start });
        }

        let raw = self.take(close + 1);
        let content = std::str::from_utf8(&raw[1..close])
            .map_err(|_| MarkupError::InvalidUtf8 { offset: start })?;
        let (content, self_closing) = match content.strip_suffix('/') {
            Some(inner) => (inner, true),
            None => (content, false),
        };
        let (name, attributes) = parse_start_tag(content, start)?;

        if self_closing {
            self.queued.push_back(Node::EndElement { name: name.clone() });
            if self.open.is_empty() {
                self.root_closed = true;
            }
        } else {
            self.open.push(name.clone());
        }

        Ok(Step::Node(Node::StartElement { name, attributes }))
    }

    /// Index of the `>` closing a start tag, ignoring any inside quoted values.
    fn find_tag_end(&mut self) -> Option<usize> {
        let from = self.scan.resume.max(1);
        let mut quote = self.scan.quote;
        for index in from..self.buffer.len() {
            self.examined += 1;
            let byte = self.buffer[index];
            match quote {
                Some(q) if byte == q => quote = None,
                Some(_) => {}
                None if byte == b'"' || byte == b'\'' => quote = Some(byte),
                None if byte == b'>' => return Some(index),
                None => {}
            }
        }
        self.scan.resume = self.buffer.len().max(from);
        self.scan.quote = quote;
        None
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}


fn parse_start_tag(content: &str, offset: usize) -> Result<(String, Vec<Attribute>), MarkupError> {
    let malformed = || MarkupError::MalformedTag { offset };

    let content = content.trim_end();
    let name_end = content
        .find(|c: char| c.is_ascii_whitespace())
        .unwrap_or(content.len());
    let name = &content[..name_end];
    if name.is_empty() || name.contains(['<', '>', '=', '"', '\'', '/']) {
        return Err(malformed());
    }

    let mut attributes = Vec::new();
    let mut rest = content[name_end..].trim_start();
    while !rest.is_empty() {
        let eq = rest.find('=').ok_or_else(malformed)?;
        let attr_name = rest[..eq].trim_end();
        if attr_name.is_empty() || attr_name.contains(|c: char| c.is_ascii_whitespace()) {
            return Err(malformed());
        }

        let after = rest[eq + 1..].trim_start();
        let quote = after
            .chars()
            .next()
            .filter(|c| *c == '"' || *c == '\'')
            .ok_or_else(malformed)?;
        let close = after[1..].find(quote).ok_or_else(malformed)? + 1;

        attributes.push(Attribute {
            name: attr_name.to_owned(),
            value: unescape(&after[1..close], offset)?,
        });
        rest = after[close + 1..].trim_start();
    }

    Ok((name.to_owned(), attributes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(tokenizer: &mut Tokenizer) -> Vec<Node> {
        let mut nodes = Vec::new();
        while let Some(node) = tokenizer.next_node().unwrap() {
            nodes.push(node);
        }
        nodes
    }

    #[test]
    fn tokenizes_simple_document() {
        let mut tokenizer =
            Tokenizer::from_bytes("<?xml version=\"1.0\"?>\n<a><b>hi &amp; bye</b><c/></a>\n");
        assert_eq!(
            collect(&mut tokenizer),
            vec![
                Node::start("a"),
                Node::start("b"),
                Node::text("hi & bye"),
                Node::end("b"),
                Node::start("c"),
                Node::end("c"),
                Node::end("a"),
                Node::EndDocument,
            ]
        );
        assert!(tokenizer.is_finished());
    }

    #[test]
    fn parses_attributes() {
        let mut tokenizer = Tokenizer::from_bytes("<a x=\"1\" y = 'a > b'/>");
        let first = tokenizer.next_node().unwrap().unwrap();
        assert_eq!(
            first,
            Node::StartElement {
                name: "a".to_owned(),
                attributes: vec![
                    Attribute {
                        name: "x".to_owned(),
                        value: "1".to_owned()
                    },
                    Attribute {
                        name: "y".to_owned(),
                        value: "a > b".to_owned()
                    },
                ],
            }
        );
    }

    #[test]
    fn byte_at_a_time_feeding() {
        let document = "<!-- lead --><a><![CDATA[<raw>]]><b>\u{e9}</b></a>";
        let mut tokenizer = Tokenizer::new();
        let mut nodes = Vec::new();
        for byte in document.as_bytes() {
            tokenizer.feed(std::slice::from_ref(byte));
            while let Some(node) = tokenizer.next_node().unwrap() {
                nodes.push(node);
            }
        }
        tokenizer.finish();
        nodes.extend(collect(&mut tokenizer));

        assert_eq!(
            nodes,
            vec![
                Node::start("a"),
                Node::text("<raw>"),
                Node::start("b"),
                Node::text("\u{e9}"),
                Node::end("b"),
                Node::end("a"),
                Node::EndDocument,
            ]
        );
    }

    #[test]
    fn split_quotes_and_brackets_survive_resumed_scans() {
        let document = "<!DOCTYPE a [<!ELEMENT a ANY>]><a k='x > y' j=\"]]>\"><![CDATA[a]]]]><?pi ?>\
                        <!-- - -- --></a>";
        let mut tokenizer = Tokenizer::new();
        let mut nodes = Vec::new();
        for chunk in document.as_bytes().chunks(3) {
            tokenizer.feed(chunk);
            while let Some(node) = tokenizer.next_node().unwrap() {
                nodes.push(node);
            }
        }
        tokenizer.finish();
        nodes.extend(collect(&mut tokenizer));

        assert_eq!(
            nodes,
            vec![
                Node::StartElement {
                    name: "a".to_owned(),
                    attributes: vec![
                        Attribute {
                            name: "k".to_owned(),
                            value: "x > y".to_owned()
                        },
                        Attribute {
                            name: "j".to_owned(),
                            value: "]]>".to_owned()
                        },
                    ],
                },
                Node::text("a]]"),
                Node::end("a"),
                Node::EndDocument,
            ]
        );
    }

    #[test]
    fn large_text_fed_in_chunks_is_scanned_once() {
        const SIZE: usize = 1 << 20;
        let body = "x".repeat(SIZE);
        let document = format!("<a>{body}</a>");
        let mut tokenizer = Tokenizer::new();
        let mut text = None;
        for chunk in document.as_bytes().chunks(4096) {
            tokenizer.feed(chunk);
            while let Some(node) = tokenizer.next_node().unwrap() {
                if let Node::Characters { text: body } = node {
                    text = Some(body.len());
                }
            }
        }

        assert_eq!(text, Some(SIZE));
        assert!(
            tokenizer.bytes_examined() < 2 * document.len() as u64,
            "examined {} bytes for a {} byte document",
            tokenizer.bytes_examined(),
            document.len()
        );
    }

    #[test]
    fn skips_doctype_with_internal_subset() {
        let mut tokenizer = Tokenizer::from_bytes("<!DOCTYPE a [<!ELEMENT a ANY>]><a/>");
        assert_eq!(
            collect(&mut tokenizer),
            vec![Node::start("a"), Node::end("a"), Node::EndDocument]
        );
    }

    #[test]
    fn mismatched_end_tag_is_an_error() {
        let mut tokenizer = Tokenizer::from_bytes("<a><b></a>");
        tokenizer.next_node().unwrap();
        tokenizer.next_node().unwrap();
        assert!(matches!(
            tokenizer.next_node(),
            Err(MarkupError::MismatchedTag { .. })
        ));
    }

    #[test]
    fn truncated_document_is_an_error() {
        let mut tokenizer = Tokenizer::from_bytes("<a><b>text");
        tokenizer.next_node().unwrap();
        tokenizer.next_node().unwrap();
        assert!(matches!(
            tokenizer.next_node(),
            Err(MarkupError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn empty_document_is_an_error() {
        let mut tokenizer = Tokenizer::from_bytes("  ");
        assert!(matches!(
            tokenizer.next_node(),
            Err(MarkupError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn rejects_second_root_and_stray_text() {
        let mut tokenizer = Tokenizer::from_bytes("<a/><b/>");
        tokenizer.next_node().unwrap();
        tokenizer.next_node().unwrap();
        assert!(matches!(
            tokenizer.next_node(),
            Err(MarkupError::MultipleRoots { .. })
        ));

        let mut tokenizer = Tokenizer::from_bytes("junk<a/>");
        assert!(matches!(
            tokenizer.next_node(),
            Err(MarkupError::TextOutsideRoot { .. })
        ));
    }

    #[test]
    fn buffer_limit_applies_to_partial_tokens() {
        let mut tokenizer = Tokenizer::with_limit(8);
        tokenizer.feed(b"<averyveryverylongname");
        assert_eq!(
            tokenizer.next_node(),
            Err(MarkupError::BufferLimit { limit: 8 })
        );
    }

    #[test]
    fn reset_allows_reuse() {
        let mut tokenizer = Tokenizer::from_bytes("<a/>");
        collect(&mut tokenizer);
        tokenizer.reset();
        tokenizer.feed(b"<b></b>");
        tokenizer.finish();
        assert_eq!(
            collect(&mut tokenizer),
            vec![Node::start("b"), Node::end("b"), Node::EndDocument]
        );
    }
}
