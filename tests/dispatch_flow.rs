use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use xrpc::protocol::{JobQueue, LIST_METHODS, Phase, metrics};
use xrpc::{
    Arity, Dispatcher, DispatcherConfig, Fault, Registry, Value, decode_response, encode_call,
};

/// Byte source fed by the test; reports `WouldBlock` until more bytes arrive.
#[derive(Clone, Default)]
struct Pipe {
    chunks: Arc<Mutex<VecDeque<Vec<u8>>>>,
    closed: Arc<AtomicBool>,
}

impl Pipe {
    fn push(&self, bytes: &[u8]) {
        self.chunks.lock().unwrap().push_back(bytes.to_vec());
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Read for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut chunks = self.chunks.lock().unwrap();
        let Some(mut chunk) = chunks.pop_front() else {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            chunks.push_front(chunk.split_off(n));
        }
        Ok(n)
    }
}

struct Fixture {
    registry: Arc<Registry>,
    invocations: Arc<AtomicUsize>,
}

fn fixture() -> Fixture {
    let registry = Arc::new(Registry::new());
    let invocations = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&invocations);
    registry.register_fn("math.add", Arity::exactly(2), move |args| {
        counter.fetch_add(1, Ordering::SeqCst);
        let a = args[0].as_i32().ok_or_else(|| Fault::new(10, "a must be an int"))?;
        let b = args[1].as_i32().ok_or_else(|| Fault::new(10, "b must be an int"))?;
        Ok(Value::Int(a + b))
    });
    registry.register_fn("echo", Arity::range(0, 1), |args| {
        Ok(args.first().cloned().unwrap_or_default())
    });
    registry.register_fn("nest", Arity::exactly(1), |args| {
        let depth = args[0].as_i32().unwrap_or_default();
        let mut value = Value::Int(depth);
        for _ in 0..depth {
            value = Value::Array(vec![value]);
        }
        Ok(value)
    });
    registry.register_introspection();

    Fixture {
        registry,
        invocations,
    }
}

fn outcome(response: &[u8]) -> Result<Value, Fault> {
    decode_response(std::str::from_utf8(response).unwrap()).unwrap()
}

#[test]
fn full_cycle_returns_result() {
    let fx = fixture();
    let mut dispatcher = Dispatcher::new(Arc::clone(&fx.registry));
    let request = encode_call("math.add", &[Value::Int(40), Value::Int(2)]);

    let response = dispatcher.handle(request.as_bytes()).unwrap();

    assert!(response.starts_with(b"<?xml version=\"1.0\"?>"));
    assert_eq!(outcome(&response), Ok(Value::Int(42)));
    assert_eq!(fx.invocations.load(Ordering::SeqCst), 1);
    assert_eq!(fx.registry.outstanding("math.add"), 0);
}

#[test]
fn unknown_method_faults_without_invocation() {
    let fx = fixture();
    let mut dispatcher = Dispatcher::new(Arc::clone(&fx.registry));
    let request = encode_call("math.missing", &[Value::Int(1), Value::Int(2)]);

    let fault = outcome(&dispatcher.handle(request.as_bytes()).unwrap()).unwrap_err();

    assert_eq!(fault.code, Fault::METHOD_NOT_FOUND);
    assert!(!fault.message.is_empty());
    assert_eq!(fx.invocations.load(Ordering::SeqCst), 0);
}

#[test]
fn too_many_params_is_structural_fault() {
    let fx = fixture();
    let mut dispatcher = Dispatcher::new(Arc::clone(&fx.registry));
    let request = encode_call("math.add", &[Value::Int(1), Value::Int(2), Value::Int(3)]);

    let fault = outcome(&dispatcher.handle(request.as_bytes()).unwrap()).unwrap_err();

    assert_eq!(fault.code, Fault::SERIALIZATION_ERROR);
    assert_eq!(fx.invocations.load(Ordering::SeqCst), 0);
}

#[test]
fn too_few_params_is_missing_arguments_fault() {
    let fx = fixture();
    let mut dispatcher = Dispatcher::new(Arc::clone(&fx.registry));
    let request = encode_call("math.add", &[Value::Int(1)]);

    let fault = outcome(&dispatcher.handle(request.as_bytes()).unwrap()).unwrap_err();

    assert_eq!(fault.code, Fault::MISSING_ARGUMENTS);
    assert_eq!(fx.invocations.load(Ordering::SeqCst), 0);
}

#[test]
fn procedure_fault_is_returned() {
    let fx = fixture();
    let mut dispatcher = Dispatcher::new(Arc::clone(&fx.registry));
    let request = encode_call("math.add", &[Value::from("x"), Value::Int(1)]);

    let fault = outcome(&dispatcher.handle(request.as_bytes()).unwrap()).unwrap_err();

    assert_eq!(fault, Fault::new(10, "a must be an int"));
}

#[test]
fn chunked_input_suspends_on_would_block() {
    let fx = fixture();
    let config = DispatcherConfig {
        read_chunk: 5,
        ..DispatcherConfig::default()
    };
    let mut dispatcher = Dispatcher::with_config(Arc::clone(&fx.registry), config);
    let pipe = Pipe::default();
    dispatcher.begin_message(pipe.clone()).unwrap();

    let request = encode_call(
        "echo",
        &[Value::structure([
            ("name", Value::from("chunked & split")),
            ("items", Value::Array(vec![Value::Int(1), Value::Bool(true)])),
        ])],
    );
    let mut suspensions = 0;
    let mut parsed = false;
    for chunk in request.as_bytes().chunks(7) {
        assert!(!parsed, "parse finished before the last chunk");
        pipe.push(chunk);
        if dispatcher.parse_message().unwrap() {
            parsed = true;
        } else {
            suspensions += 1;
        }
    }
    assert!(parsed);
    assert!(suspensions > 10);

    dispatcher.finish_parse(&mut xrpc::protocol::InlineScheduler).unwrap();
    assert!(dispatcher.end_call().unwrap());
    let mut out = Vec::new();
    dispatcher.begin_result(&mut out).unwrap();
    dispatcher.finish_result(&mut out).unwrap();

    let echoed = outcome(&out).unwrap();
    assert_eq!(echoed.get("name"), Some(&Value::from("chunked & split")));
    assert_eq!(
        echoed.get("items"),
        Some(&Value::Array(vec![Value::Int(1), Value::Bool(true)]))
    );
}

#[test]
fn truncated_input_is_markup_fault() {
    let fx = fixture();
    let mut dispatcher = Dispatcher::new(Arc::clone(&fx.registry));
    let pipe = Pipe::default();
    pipe.push(b"<methodCall><methodName>echo</methodName>");
    pipe.close();
    dispatcher.begin_message(pipe).unwrap();

    assert!(dispatcher.parse_message().unwrap());
    let fault = dispatcher.fault().cloned().unwrap();
    assert_eq!(fault.code, Fault::MARKUP_ERROR);
    dispatcher.cancel();
    assert_eq!(fx.registry.outstanding("echo"), 0);
}

#[test]
fn cancel_during_parse_releases_procedure() {
    let fx = fixture();
    let mut dispatcher = Dispatcher::new(Arc::clone(&fx.registry));
    let pipe = Pipe::default();
    dispatcher.begin_message(pipe.clone()).unwrap();
    pipe.push(b"<methodCall><methodName>math.add</methodName><params><param><value><int>1");

    assert!(!dispatcher.parse_message().unwrap());
    assert_eq!(fx.registry.outstanding("math.add"), 1);

    dispatcher.cancel();

    assert_eq!(dispatcher.phase(), Phase::Idle);
    assert_eq!(dispatcher.supplied(), 0);
    assert_eq!(dispatcher.method(), "");
    assert!(dispatcher.fault().is_none());
    assert_eq!(fx.registry.outstanding("math.add"), 0);
    assert_eq!(fx.invocations.load(Ordering::SeqCst), 0);
}

#[test]
fn cancel_during_invocation_abandons_job() {
    let registry = Arc::new(Registry::new());
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    registry.register_deferred("slow", Arity::NONE, move |_| {
        flag.store(true, Ordering::SeqCst);
        Ok(Value::Void)
    });
    let mut dispatcher = Dispatcher::new(Arc::clone(&registry));
    let mut queue = JobQueue::new();

    dispatcher
        .begin_message(io::Cursor::new(encode_call("slow", &[]).into_bytes()))
        .unwrap();
    assert!(dispatcher.parse_message().unwrap());
    dispatcher.finish_parse(&mut queue).unwrap();
    assert_eq!(dispatcher.phase(), Phase::Invoking);
    assert_eq!(registry.outstanding("slow"), 1);

    dispatcher.cancel();
    queue.run_pending();

    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(dispatcher.phase(), Phase::Idle);
    assert_eq!(registry.outstanding("slow"), 0);
}

#[test]
fn cancel_during_formatting_then_reuse() {
    let fx = fixture();
    let mut dispatcher = Dispatcher::new(Arc::clone(&fx.registry));
    let request = encode_call("nest", &[Value::Int(200)]);
    dispatcher
        .begin_message(io::Cursor::new(request.into_bytes()))
        .unwrap();
    assert!(dispatcher.parse_message().unwrap());
    dispatcher.finish_parse(&mut xrpc::protocol::InlineScheduler).unwrap();
    assert!(dispatcher.end_call().unwrap());

    let mut out = Vec::new();
    dispatcher.begin_result(&mut out).unwrap();
    assert!(!dispatcher.advance_result(&mut out).unwrap());
    dispatcher.cancel();

    assert_eq!(dispatcher.phase(), Phase::Idle);
    assert_eq!(dispatcher.bytes_written(), 0);
    assert_eq!(fx.registry.outstanding("nest"), 0);

    let request = encode_call("math.add", &[Value::Int(1), Value::Int(1)]);
    let response = dispatcher.handle(request.as_bytes()).unwrap();
    assert_eq!(outcome(&response), Ok(Value::Int(2)));
}

#[test]
fn deferred_invocation_completes_through_job_queue() {
    let registry = Arc::new(Registry::new());
    registry.register_deferred("greet", Arity::exactly(1), |args| {
        let name = args[0].as_str().unwrap_or("nobody");
        Ok(Value::from(format!("hello, {name}")))
    });
    let mut dispatcher = Dispatcher::new(Arc::clone(&registry));
    let mut queue = JobQueue::new();

    let request = encode_call("greet", &[Value::from("ada")]);
    dispatcher
        .begin_message(io::Cursor::new(request.into_bytes()))
        .unwrap();
    assert!(dispatcher.parse_message().unwrap());
    dispatcher.finish_parse(&mut queue).unwrap();

    assert!(!dispatcher.end_call().unwrap());
    assert!(!dispatcher.end_call().unwrap());
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.run_pending(), 1);
    assert!(dispatcher.end_call().unwrap());

    let mut out = Vec::new();
    dispatcher.begin_result(&mut out).unwrap();
    dispatcher.finish_result(&mut out).unwrap();
    assert_eq!(outcome(&out), Ok(Value::from("hello, ada")));
}

#[test]
fn dispatcher_is_reused_across_messages() {
    let fx = fixture();
    let mut dispatcher = Dispatcher::new(Arc::clone(&fx.registry));

    for n in 0..5 {
        let request = encode_call("math.add", &[Value::Int(n), Value::Int(n)]);
        let response = dispatcher.handle(request.as_bytes()).unwrap();
        assert_eq!(outcome(&response), Ok(Value::Int(n * 2)));
    }
    let faulted = dispatcher.handle(b"<methodCall><methodName>").unwrap();
    assert_eq!(outcome(&faulted).unwrap_err().code, Fault::MARKUP_ERROR);
    let response = dispatcher.handle(encode_call("echo", &[]).as_bytes()).unwrap();
    assert_eq!(outcome(&response), Ok(Value::from("")));
    assert_eq!(fx.invocations.load(Ordering::SeqCst), 5);
}

#[test]
fn deep_result_is_written_in_bounded_increments() {
    let fx = fixture();
    let mut dispatcher = Dispatcher::new(Arc::clone(&fx.registry));
    let request = encode_call("nest", &[Value::Int(1000)]);
    dispatcher
        .begin_message(io::Cursor::new(request.into_bytes()))
        .unwrap();
    assert!(dispatcher.parse_message().unwrap());
    dispatcher.finish_parse(&mut xrpc::protocol::InlineScheduler).unwrap();
    assert!(dispatcher.end_call().unwrap());

    let mut out = Vec::new();
    dispatcher.begin_result(&mut out).unwrap();
    let mut calls = 0;
    while !dispatcher.advance_result(&mut out).unwrap() {
        calls += 1;
    }
    dispatcher.finish_result(&mut out).unwrap();

    // Each nesting level costs at least two encoder steps.
    assert!(calls >= 2000 / dispatcher.config().step_budget - 1);
    let text = std::str::from_utf8(&out).unwrap();
    assert!(text.ends_with("</param></params></methodResponse>"));
    assert_eq!(text.matches("<array>").count(), 1000);
}

#[test]
fn introspection_lists_methods() {
    let fx = fixture();
    let mut dispatcher = Dispatcher::new(Arc::clone(&fx.registry));

    let response = dispatcher
        .handle(encode_call(LIST_METHODS, &[]).as_bytes())
        .unwrap();

    let names: Vec<Value> = ["echo", "math.add", "nest", LIST_METHODS]
        .into_iter()
        .map(Value::from)
        .collect();
    assert_eq!(outcome(&response), Ok(Value::Array(names)));
}

#[test]
fn metrics_track_responses() {
    let fx = fixture();
    let mut dispatcher = Dispatcher::new(Arc::clone(&fx.registry));
    let before = metrics::snapshot();

    dispatcher
        .handle(encode_call("math.missing", &[]).as_bytes())
        .unwrap();
    dispatcher
        .handle(encode_call("echo", &[Value::Int(1)]).as_bytes())
        .unwrap();

    let after = metrics::snapshot();
    assert!(after.responses >= before.responses + 2);
    assert!(after.messages_parsed >= before.messages_parsed + 2);
    assert!(after.method_not_found_faults > before.method_not_found_faults);
    assert!(after.bytes_written > before.bytes_written);
}
