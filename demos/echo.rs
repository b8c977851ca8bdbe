//! Drive one request/response cycle through the dispatcher step by step.

use std::io::{self, Cursor, Write};
use std::sync::Arc;

use xrpc::protocol::{JobQueue, metrics};
use xrpc::{Arity, Dispatcher, Fault, Registry, Value, encode_call};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("xrpc echo example");
    println!("=================\n");

    let registry = Arc::new(Registry::new());
    registry.register_fn("echo", Arity::exactly(1), |args| Ok(args[0].clone()));
    registry.register_deferred("math.sum", Arity::range(0, 16), |args| {
        args.iter()
            .try_fold(0i32, |total, arg| {
                arg.as_i32()
                    .and_then(|n| total.checked_add(n))
                    .ok_or_else(|| Fault::new(10, "math.sum expects ints that fit in i32"))
            })
            .map(Value::Int)
    });
    registry.register_introspection();

    let mut dispatcher = Dispatcher::new(Arc::clone(&registry));
    let mut queue = JobQueue::new();

    let request = encode_call("math.sum", &[Value::Int(1), Value::Int(2), Value::Int(39)]);
    println!("request:\n{request}\n");

    dispatcher.begin_message(Cursor::new(request.into_bytes()))?;
    while !dispatcher.parse_message()? {}
    dispatcher.finish_parse(&mut queue)?;

    while !dispatcher.end_call()? {
        let ran = queue.run_pending();
        println!("ran {ran} scheduled job(s)");
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "response:")?;
    dispatcher.begin_result(&mut out)?;
    let mut increments = 1;
    while !dispatcher.advance_result(&mut out)? {
        increments += 1;
    }
    dispatcher.finish_result(&mut out)?;
    writeln!(out, "\n\nwritten in {increments} increment(s)")?;

    let listing = dispatcher.handle(encode_call("system.listMethods", &[]).as_bytes())?;
    writeln!(out, "\nsystem.listMethods:\n{}", String::from_utf8_lossy(&listing))?;

    let snapshot = metrics::snapshot();
    writeln!(
        out,
        "\nparsed={} invoked={} responses={} faults={}",
        snapshot.messages_parsed, snapshot.invocations, snapshot.responses, snapshot.total_faults
    )?;

    Ok(())
}
