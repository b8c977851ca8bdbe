//! XML-RPC protocol core
//!
//! Value model, incremental value decoder and encoder, procedure registry,
//! and the call dispatcher that ties them together.

mod codec;
mod decoder;
mod dispatcher;
mod encoder;
mod error;
mod fault;
pub mod metrics;
mod procedure;
mod registry;
mod sink;
mod value;

pub use codec::{
    decode_response, decode_value, encode_call, encode_response, encode_value, response_value,
};
pub use decoder::{DecoderState, ValueDecoder};
pub use dispatcher::{CallState, Dispatcher, DispatcherConfig, Phase};
pub use encoder::{ResponseEncoder, ValueEncoder};
pub use error::{DecodeError, Error, Result};
pub use fault::Fault;
pub use metrics::MetricsSnapshot;
pub use procedure::{
    Arguments, Arity, DeferredProcedure, FnProcedure, InlineScheduler, Job, JobQueue, Procedure,
    Scheduler,
};
pub use registry::{DEFAULT_POOL_CAPACITY, LIST_METHODS, ProcedureFactory, ProcedureHandle, Registry};
pub use sink::{ValueBuilder, ValueSink};
pub use value::{Member, Value, ValueKind};

/// XML declaration written ahead of every response.
pub const XML_DECLARATION: &str = "<?xml version=\"1.0\"?>\n";

/// Encoder steps performed per bounded response increment.
pub const DEFAULT_STEP_BUDGET: usize = 10;

/// Deepest struct/array nesting accepted by default.
pub const MAX_NESTING_DEPTH: usize = 4096;

/// Largest request accepted by default (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Bytes requested from a request source per read.
pub const DEFAULT_READ_CHUNK: usize = 4096;
