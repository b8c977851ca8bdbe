//! xrpc - incremental XML-RPC codec and call dispatcher
//!
//! Requests are parsed from a byte stream without buffering the whole
//! message, nested values are decoded with an explicit state machine rather
//! than recursion, and responses are written in bounded increments so a
//! single large result cannot monopolize an event loop.
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use xrpc::{Arity, Dispatcher, Registry, Value};
//!
//! let registry = Arc::new(Registry::new());
//! registry.register_fn("math.add", Arity::exactly(2), |args| {
//!     let a = args[0].as_i32().unwrap_or_default();
//!     let b = args[1].as_i32().unwrap_or_default();
//!     Ok(Value::Int(a + b))
//! });
//!
//! let request = xrpc::encode_call("math.add", &[Value::Int(2), Value::Int(3)]);
//! let mut dispatcher = Dispatcher::new(registry);
//! let response = dispatcher.handle(request.as_bytes())?;
//!
//! let outcome = xrpc::decode_response(std::str::from_utf8(&response).unwrap())?;
//! assert_eq!(outcome, Ok(Value::Int(5)));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Features
//!
//! - **Incremental parsing** - bytes are pulled from any [`std::io::Read`] and
//!   `WouldBlock` suspends parsing until more input arrives
//! - **Bounded encoding** - [`Dispatcher::advance_result`] performs a fixed
//!   number of encoder steps per call
//! - **Deferred procedures** - invocation can be handed to a [`Scheduler`] and
//!   polled to completion
//! - **Structured faults** - every protocol error becomes a `<fault>` response

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod markup;
pub mod protocol;

pub use protocol::{
    Arity, DecodeError, Dispatcher, DispatcherConfig, Error, Fault, Member, Procedure, Registry,
    Result, Scheduler, Value, decode_response, decode_value, encode_call, encode_response,
    encode_value, response_value,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
