//! Call dispatcher: parses a `<methodCall>`, invokes the resolved procedure,
//! and writes the `<methodResponse>`.
//!
//! A dispatcher handles one message at a time and is reused across
//! messages. Each phase is a separate call so the embedding event loop can
//! interleave the work with other tasks:
//!
//! 1. [`Dispatcher::begin_message`] attaches a byte source.
//! 2. [`Dispatcher::parse_message`] consumes input until the call is parsed
//!    or the source would block.
//! 3. [`Dispatcher::finish_parse`] starts the procedure on a [`Scheduler`].
//! 4. [`Dispatcher::end_call`] polls until the outcome is available.
//! 5. [`Dispatcher::begin_result`], [`Dispatcher::advance_result`] and
//!    [`Dispatcher::finish_result`] write the response in bounded slices.
//!
//! Protocol problems never surface as [`Error`]s: they are recorded as a
//! [`Fault`] and the remaining input is ignored, so the caller always gets a
//! well-formed response document.

use std::fmt;
use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::task::Poll;
use std::time::Instant;

use bytes::BytesMut;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use super::encoder::NON_FINITE_RESULT;
use super::metrics::Metrics;
use super::{
    Arity, DEFAULT_READ_CHUNK, DEFAULT_STEP_BUDGET, DecodeError, Error, Fault, InlineScheduler,
    MAX_MESSAGE_SIZE, MAX_NESTING_DEPTH, ProcedureHandle, Registry, ResponseEncoder, Result,
    Scheduler, Value, ValueDecoder,
};
use crate::markup::{MarkupError, Node, Tokenizer};

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Encoder steps performed per [`Dispatcher::advance_result`] call.
    pub step_budget: usize,
    /// Bytes requested from the source per read.
    pub read_chunk: usize,
    /// Deepest struct/array nesting accepted in an argument.
    ///
    /// Procedures built on [`Arguments::new`](super::Arguments::new) also cap
    /// their own nesting at [`MAX_NESTING_DEPTH`], so raising this above it
    /// only helps procedures sized with
    /// [`Arguments::with_max_depth`](super::Arguments::with_max_depth).
    pub max_depth: usize,
    /// Largest request accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            step_budget: DEFAULT_STEP_BUDGET,
            read_chunk: DEFAULT_READ_CHUNK,
            max_depth: MAX_NESTING_DEPTH,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

/// Position within the `<methodCall>` document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Nothing consumed yet.
    Start,
    /// After `<methodCall>`.
    CallOpened,
    /// After `<methodName>`.
    MethodNameOpened,
    /// Inside the method name text.
    MethodNameBody,
    /// After `</methodName>`.
    MethodNameClosed,
    /// After `<params>` or a complete `</param>`.
    ParamsOpened,
    /// Decoding a parameter value.
    ParamBody,
    /// After `</params>`.
    ParamsClosed,
    /// After `</methodCall>`.
    CallClosed,
}

/// Lifecycle phase of the message in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No message attached.
    Idle,
    /// Consuming request bytes.
    Parsing,
    /// Request parsed; invocation not started.
    Parsed,
    /// Procedure running.
    Invoking,
    /// Outcome available.
    Invoked,
    /// Response partially written.
    Responding,
    /// Response body complete; awaiting [`Dispatcher::finish_result`].
    Responded,
}

impl Phase {
    /// Lower-case phase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Parsing => "parsing",
            Self::Parsed => "parsed",
            Self::Invoking => "invoking",
            Self::Invoked => "invoked",
            Self::Responding => "responding",
            Self::Responded => "responded",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reusable request/response state machine.
pub struct Dispatcher {
    registry: Arc<Registry>,
    config: DispatcherConfig,
    phase: Phase,
    state: CallState,
    message_id: u64,
    source: Option<Box<dyn Read + Send>>,
    tokenizer: Tokenizer,
    read_buf: Vec<u8>,
    method: String,
    procedure: Option<ProcedureHandle>,
    arity: Arity,
    decoder: ValueDecoder,
    supplied: usize,
    fault: Option<Fault>,
    result: Option<Value>,
    response: Option<ResponseEncoder>,
    invoked_at: Option<Instant>,
    scratch: BytesMut,
    bytes_read: usize,
    bytes_written: usize,
}

impl Dispatcher {
    /// Dispatcher over `registry` with the default configuration.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_config(registry, DispatcherConfig::default())
    }

    /// Dispatcher over `registry` using `config`.
    #[must_use]
    pub fn with_config(registry: Arc<Registry>, config: DispatcherConfig) -> Self {
        Self {
            registry,
            tokenizer: Tokenizer::with_limit(config.max_message_size),
            read_buf: vec![0; config.read_chunk.max(1)],
            config,
            phase: Phase::Idle,
            state: CallState::Start,
            message_id: 0,
            source: None,
            method: String::new(),
            procedure: None,
            arity: Arity::NONE,
            decoder: ValueDecoder::new(),
            supplied: 0,
            fault: None,
            result: None,
            response: None,
            invoked_at: None,
            scratch: BytesMut::new(),
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// Registry methods are resolved against.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Current lifecycle phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Current position within the request document.
    #[must_use]
    pub const fn call_state(&self) -> CallState {
        self.state
    }

    /// Correlation id of the message in flight, zero when idle.
    #[must_use]
    pub const fn message_id(&self) -> u64 {
        self.message_id
    }

    /// Method name parsed so far.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Fault recorded for the message in flight.
    #[must_use]
    pub const fn fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }

    /// Parameters decoded so far.
    #[must_use]
    pub const fn supplied(&self) -> usize {
        self.supplied
    }

    /// Response bytes written for the message in flight.
    #[must_use]
    pub const fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    /// Attach the request byte source and start a new message.
    #[instrument(level = "debug", skip(self, source))]
    pub fn begin_message<R>(&mut self, source: R) -> Result<()>
    where
        R: Read + Send + 'static,
    {
        self.expect_phase(Phase::Idle)?;
        self.reset();
        self.message_id = generate_id();
        self.source = Some(Box::new(source));
        self.phase = Phase::Parsing;
        debug!(message_id = self.message_id, "message started");
        Ok(())
    }

    /// Consume input until the call is parsed.
    ///
    /// Returns `Ok(false)` when the source would block; call again once more
    /// bytes are available. A recorded fault also ends parsing.
    pub fn parse_message(&mut self) -> Result<bool> {
        self.expect_phase(Phase::Parsing)?;
        loop {
            if self.fault.is_some() || self.state == CallState::CallClosed {
                self.source = None;
                self.phase = Phase::Parsed;
                Metrics::record_parsed(self.bytes_read);
                debug!(
                    message_id = self.message_id,
                    method = %self.method,
                    params = self.supplied,
                    faulted = self.fault.is_some(),
                    "message parsed"
                );
                return Ok(true);
            }

            match self.tokenizer.next_node() {
                Ok(Some(node)) => self.on_node(&node),
                Ok(None) => {
                    if !self.fill()? {
                        return Ok(false);
                    }
                }
                Err(err) => self.record_fault(DecodeError::from(err).into()),
            }
        }
    }

    /// Start the procedure unless a fault was recorded.
    #[instrument(level = "debug", skip_all, fields(message_id = self.message_id))]
    pub fn finish_parse(&mut self, scheduler: &mut dyn Scheduler) -> Result<()> {
        self.expect_phase(Phase::Parsed)?;
        if self.fault.is_some() {
            self.phase = Phase::Invoked;
            return Ok(());
        }
        let Some(handle) = self.procedure.as_mut() else {
            self.record_fault(Fault::invalid_request("no method resolved"));
            self.phase = Phase::Invoked;
            return Ok(());
        };

        Metrics::record_invocation();
        self.invoked_at = Some(Instant::now());
        let started = panic::catch_unwind(AssertUnwindSafe(|| {
            handle.procedure().begin_invocation(scheduler)
        }));
        match started {
            Ok(Ok(())) => {
                trace!(method = %self.method, "invocation started");
                self.phase = Phase::Invoking;
            }
            Ok(Err(fault)) => {
                self.record_fault(fault);
                self.finish_invocation();
            }
            Err(_) => {
                self.record_fault(Fault::internal("procedure panicked"));
                self.finish_invocation();
            }
        }
        Ok(())
    }

    /// Poll the procedure. Returns `Ok(true)` once the outcome is available.
    pub fn end_call(&mut self) -> Result<bool> {
        if self.phase == Phase::Invoked {
            return Ok(true);
        }
        self.expect_phase(Phase::Invoking)?;
        let Some(handle) = self.procedure.as_mut() else {
            self.record_fault(Fault::internal("procedure handle missing"));
            self.finish_invocation();
            return Ok(true);
        };

        let polled = panic::catch_unwind(AssertUnwindSafe(|| handle.procedure().end_invocation()));
        match polled {
            Ok(Poll::Pending) => return Ok(false),
            Ok(Poll::Ready(Ok(value))) if value.is_finite() => self.result = Some(value),
            Ok(Poll::Ready(Ok(_))) => self.record_fault(Fault::serialization(NON_FINITE_RESULT)),
            Ok(Poll::Ready(Err(fault))) => self.record_fault(fault),
            Err(_) => self.record_fault(Fault::internal("procedure panicked")),
        }
        self.finish_invocation();
        Ok(true)
    }

    /// Write the XML declaration and opening response tags.
    pub fn begin_result<W: Write + ?Sized>(&mut self, sink: &mut W) -> Result<()> {
        self.expect_phase(Phase::Invoked)?;
        let mut response = match &self.fault {
            Some(fault) => ResponseEncoder::fault(fault),
            None => ResponseEncoder::success(self.result.take().unwrap_or_default()),
        };
        response.begin(&mut self.scratch);
        self.response = Some(response);
        self.phase = Phase::Responding;
        self.flush_scratch(sink)
    }

    /// Write at most one step budget of the response. Returns `Ok(true)` when
    /// the whole document has been written.
    pub fn advance_result<W: Write + ?Sized>(&mut self, sink: &mut W) -> Result<bool> {
        if self.phase == Phase::Responded {
            return Ok(true);
        }
        self.expect_phase(Phase::Responding)?;
        let done = match self.response.as_mut() {
            Some(response) => response.advance_into(&mut self.scratch, self.config.step_budget),
            None => true,
        };
        self.flush_scratch(sink)?;
        if done {
            self.phase = Phase::Responded;
        }
        Ok(done)
    }

    /// Write whatever remains, flush `sink`, and return to idle.
    #[instrument(level = "debug", skip_all, fields(message_id = self.message_id))]
    pub fn finish_result<W: Write + ?Sized>(&mut self, sink: &mut W) -> Result<()> {
        while self.phase == Phase::Responding {
            self.advance_result(sink)?;
        }
        self.expect_phase(Phase::Responded)?;
        sink.flush()?;
        Metrics::record_response(self.bytes_written);
        debug!(bytes = self.bytes_written, "response written");
        self.reset();
        Ok(())
    }

    /// Abandon the message in flight, returning the procedure to its pool.
    pub fn cancel(&mut self) {
        if self.phase == Phase::Idle {
            return;
        }
        if self.phase == Phase::Invoking {
            if let Some(handle) = self.procedure.as_mut() {
                let cancelled = panic::catch_unwind(AssertUnwindSafe(|| handle.procedure().cancel()));
                if cancelled.is_err() {
                    warn!(method = %self.method, "procedure panicked while cancelling");
                }
            }
        }
        debug!(message_id = self.message_id, phase = %self.phase, "message cancelled");
        Metrics::record_cancellation();
        self.reset();
    }

    /// Run one complete cycle over an in-memory request.
    ///
    /// Procedures run on an [`InlineScheduler`]; a call still pending after
    /// that is cancelled and reported as [`Error::InvalidState`].
    pub fn handle(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.begin_message(io::Cursor::new(request.to_vec()))?;
        let response = self.run_to_completion();
        if response.is_err() {
            self.cancel();
        }
        response
    }

    fn run_to_completion(&mut self) -> Result<Vec<u8>> {
        if !self.parse_message()? {
            return Err(Error::InvalidState {
                expected: Phase::Parsed.name(),
                found: Phase::Parsing.name(),
            });
        }
        self.finish_parse(&mut InlineScheduler)?;
        if !self.end_call()? {
            return Err(Error::InvalidState {
                expected: Phase::Invoked.name(),
                found: Phase::Invoking.name(),
            });
        }
        let mut out = Vec::new();
        self.begin_result(&mut out)?;
        self.finish_result(&mut out)?;
        Ok(out)
    }

    fn expect_phase(&self, expected: Phase) -> Result<()> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                expected: expected.name(),
                found: self.phase.name(),
            })
        }
    }

    fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.state = CallState::Start;
        self.message_id = 0;
        self.source = None;
        self.tokenizer.reset();
        self.method.clear();
        self.procedure = None;
        self.arity = Arity::NONE;
        self.decoder.reset();
        self.supplied = 0;
        self.fault = None;
        self.result = None;
        self.response = None;
        self.invoked_at = None;
        self.scratch.clear();
        self.bytes_read = 0;
        self.bytes_written = 0;
    }

    /// Read the next chunk into the tokenizer. Returns `Ok(false)` if the
    /// source would block.
    fn fill(&mut self) -> Result<bool> {
        loop {
            let Some(source) = self.source.as_mut() else {
                // Input is exhausted and the tokenizer has nothing left.
                self.record_fault(Fault::invalid_request("request ended before </methodCall>"));
                return Ok(true);
            };
            match source.read(&mut self.read_buf) {
                Ok(0) => {
                    trace!(bytes = self.bytes_read, "end of request input");
                    self.source = None;
                    self.tokenizer.finish();
                    return Ok(true);
                }
                Ok(read) => {
                    self.bytes_read += read;
                    if self.bytes_read > self.config.max_message_size {
                        let err = MarkupError::BufferLimit {
                            limit: self.config.max_message_size,
                        };
                        self.record_fault(DecodeError::from(err).into());
                    } else {
                        self.tokenizer.feed(&self.read_buf[..read]);
                    }
                    return Ok(true);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn on_node(&mut self, node: &Node) {
        use CallState as S;

        if self.state == S::ParamBody {
            self.param_node(node);
            return;
        }
        if let Node::EndDocument = node {
            self.record_fault(Fault::invalid_request("request ended before </methodCall>"));
            return;
        }
        let in_name = matches!(self.state, S::MethodNameOpened | S::MethodNameBody);
        if node.is_whitespace() && !in_name {
            return;
        }

        trace!(state = ?self.state, node = %node.describe(), "dispatch step");
        match (self.state, node) {
            (S::Start, Node::StartElement { name, .. }) if name == "methodCall" => {
                self.state = S::CallOpened;
            }
            (S::CallOpened, Node::StartElement { name, .. }) if name == "methodName" => {
                self.state = S::MethodNameOpened;
            }
            (S::CallOpened, Node::EndElement { name }) if name == "methodCall" => {
                self.record_fault(Fault::invalid_request("call has no <methodName>"));
            }
            (S::MethodNameOpened | S::MethodNameBody, Node::Characters { text }) => {
                self.method.push_str(text);
                self.state = S::MethodNameBody;
            }
            (S::MethodNameOpened | S::MethodNameBody, Node::EndElement { name })
                if name == "methodName" =>
            {
                self.resolve();
                self.state = S::MethodNameClosed;
            }
            (S::MethodNameClosed, Node::StartElement { name, .. }) if name == "params" => {
                self.state = S::ParamsOpened;
            }
            (S::MethodNameClosed | S::ParamsClosed, Node::EndElement { name })
                if name == "methodCall" =>
            {
                self.close_call();
            }
            (S::ParamsOpened, Node::StartElement { name, .. }) if name == "param" => {
                self.begin_param();
            }
            (S::ParamsOpened, Node::EndElement { name }) if name == "params" => {
                self.state = S::ParamsClosed;
            }
            (state, other) => {
                self.record_fault(Fault::serialization(format!(
                    "unexpected {} in {}",
                    other.describe(),
                    expected_in(state)
                )));
            }
        }
    }

    fn resolve(&mut self) {
        let trimmed = self.method.trim();
        if trimmed.len() != self.method.len() {
            self.method = trimmed.to_owned();
        }
        if self.method.is_empty() {
            self.record_fault(Fault::invalid_request("empty method name"));
            return;
        }
        match self.registry.resolve(&self.method) {
            Some(mut handle) => {
                self.arity = handle.procedure().begin_arguments();
                trace!(method = %self.method, arity = ?self.arity, "method resolved");
                self.procedure = Some(handle);
            }
            None => {
                let fault = Fault::method_not_found(&self.method);
                self.record_fault(fault);
            }
        }
    }

    fn begin_param(&mut self) {
        if self.supplied >= self.arity.declared {
            let fault = Fault::serialization(format!(
                "too many parameters for {}: accepts at most {}",
                self.method, self.arity.declared
            ));
            self.record_fault(fault);
            return;
        }
        self.decoder.reset();
        self.state = CallState::ParamBody;
    }

    fn param_node(&mut self, node: &Node) {
        let Some(handle) = self.procedure.as_mut() else {
            self.record_fault(Fault::internal("parameter without a resolved procedure"));
            return;
        };
        let Some(sink) = handle.procedure().argument(self.supplied) else {
            let fault = Fault::internal(format!(
                "procedure {} refused argument {}",
                self.method, self.supplied
            ));
            self.record_fault(fault);
            return;
        };
        match self.decoder.advance(node, sink) {
            Ok(true) => {
                self.supplied += 1;
                self.state = CallState::ParamsOpened;
            }
            Ok(false) => {
                if self.decoder.depth() > self.config.max_depth {
                    let fault = Fault::serialization(format!(
                        "value nesting exceeds {} levels",
                        self.config.max_depth
                    ));
                    self.record_fault(fault);
                }
            }
            Err(err) => self.record_fault(err.into()),
        }
    }

    fn close_call(&mut self) {
        self.state = CallState::CallClosed;
        if self.supplied < self.arity.required {
            let fault = Fault::missing_arguments(self.arity.required, self.supplied);
            self.record_fault(fault);
        }
    }

    fn finish_invocation(&mut self) {
        if let Some(started) = self.invoked_at.take() {
            Metrics::record_latency(started.elapsed());
        }
        self.phase = Phase::Invoked;
    }

    /// Keep the first fault; later ones are consequences of it.
    fn record_fault(&mut self, fault: Fault) {
        if self.fault.is_some() {
            return;
        }
        warn!(
            message_id = self.message_id,
            code = fault.code,
            message = %fault.message,
            "fault recorded"
        );
        Metrics::record_fault(fault.code);
        self.fault = Some(fault);
    }

    fn flush_scratch<W: Write + ?Sized>(&mut self, sink: &mut W) -> Result<()> {
        if self.scratch.is_empty() {
            return Ok(());
        }
        sink.write_all(&self.scratch)?;
        self.bytes_written += self.scratch.len();
        self.scratch.clear();
        Ok(())
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("phase", &self.phase)
            .field("state", &self.state)
            .field("message_id", &self.message_id)
            .field("method", &self.method)
            .field("supplied", &self.supplied)
            .field("fault", &self.fault)
            .finish_non_exhaustive()
    }
}

const fn expected_in(state: CallState) -> &'static str {
    match state {
        CallState::Start => "document start",
        CallState::CallOpened => "<methodCall>",
        CallState::MethodNameOpened | CallState::MethodNameBody => "<methodName>",
        CallState::MethodNameClosed => "call after </methodName>",
        CallState::ParamsOpened | CallState::ParamBody => "<params>",
        CallState::ParamsClosed => "call after </params>",
        CallState::CallClosed => "closed call",
    }
}

fn generate_id() -> u64 {
    let uuid = Uuid::new_v4();
    let bytes = uuid.as_bytes();
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}
