//! Procedures, their argument storage, and the scheduler they run on.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::Poll;

use tracing::{debug, trace};

use super::{Fault, MAX_NESTING_DEPTH, Value, ValueBuilder, ValueSink};

/// Positional argument counts accepted by a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Arity {
    /// Leading arguments that must be present.
    pub required: usize,
    /// Maximum number of arguments accepted.
    pub declared: usize,
}

impl Arity {
    /// Procedure taking no arguments.
    pub const NONE: Self = Self::exactly(0);

    /// Exactly `count` arguments.
    #[must_use]
    pub const fn exactly(count: usize) -> Self {
        Self {
            required: count,
            declared: count,
        }
    }

    /// Between `required` and `declared` arguments.
    #[must_use]
    pub const fn range(required: usize, declared: usize) -> Self {
        Self { required, declared }
    }
}

/// Unit of deferred work handed to a [`Scheduler`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// External executor that runs deferred procedure work.
pub trait Scheduler {
    /// Queue `job` for execution.
    fn schedule(&mut self, job: Job);
}

/// Scheduler running each job immediately on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineScheduler;

impl Scheduler for InlineScheduler {
    fn schedule(&mut self, job: Job) {
        job();
    }
}

/// FIFO job queue drained explicitly by the caller.
#[derive(Default)]
pub struct JobQueue {
    jobs: VecDeque<Job>,
}

impl JobQueue {
    /// Construct an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether no jobs are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Run the oldest job, if any.
    pub fn run_one(&mut self) -> bool {
        match self.jobs.pop_front() {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Run every queued job. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }
}

impl Scheduler for JobQueue {
    fn schedule(&mut self, job: Job) {
        trace!(queued = self.jobs.len() + 1, "schedule job");
        self.jobs.push_back(job);
    }
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("len", &self.jobs.len())
            .finish()
    }
}

/// A registered operation invoked by method name.
///
/// One instance serves one call at a time. The dispatcher calls
/// [`begin_arguments`](Self::begin_arguments) once per message, fills
/// arguments through [`argument`](Self::argument), then starts the call with
/// [`begin_invocation`](Self::begin_invocation) and polls
/// [`end_invocation`](Self::end_invocation) until it is ready.
pub trait Procedure: Send {
    /// Reset argument storage for a new call and report the accepted arity.
    fn begin_arguments(&mut self) -> Arity;

    /// Sink for the argument at `index`, or `None` past the declared arity.
    fn argument(&mut self, index: usize) -> Option<&mut dyn ValueSink>;

    /// Start the call. May hand work to `scheduler` and return before it completes.
    fn begin_invocation(&mut self, scheduler: &mut dyn Scheduler) -> Result<(), Fault>;

    /// Collect the outcome, or `Poll::Pending` if the call is still running.
    fn end_invocation(&mut self) -> Poll<Result<Value, Fault>>;

    /// Abandon a call in progress.
    fn cancel(&mut self) {}
}

/// Argument storage shared by the bundled procedure adapters.
#[derive(Debug)]
pub struct Arguments {
    arity: Arity,
    slots: Vec<ValueBuilder>,
    supplied: usize,
}

impl Arguments {
    /// Storage for `arity.declared` arguments.
    #[must_use]
    pub fn new(arity: Arity) -> Self {
        Self::with_max_depth(arity, MAX_NESTING_DEPTH)
    }

    /// Storage whose sinks reject nesting deeper than `max_depth`.
    #[must_use]
    pub fn with_max_depth(arity: Arity, max_depth: usize) -> Self {
        Self {
            arity,
            slots: (0..arity.declared)
                .map(|_| ValueBuilder::with_max_depth(max_depth))
                .collect(),
            supplied: 0,
        }
    }

    /// Accepted arity.
    #[must_use]
    pub const fn arity(&self) -> Arity {
        self.arity
    }

    /// Number of arguments touched since the last reset.
    #[must_use]
    pub const fn supplied(&self) -> usize {
        self.supplied
    }

    /// Clear every slot.
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(ValueBuilder::reset);
        self.supplied = 0;
    }

    /// Sink for argument `index`.
    pub fn sink(&mut self, index: usize) -> Option<&mut dyn ValueSink> {
        let slot = self.slots.get_mut(index)?;
        self.supplied = self.supplied.max(index + 1);
        Some(slot)
    }

    /// Take the supplied arguments in order, clearing the storage.
    pub fn take(&mut self) -> Vec<Value> {
        let supplied = std::mem::take(&mut self.supplied);
        self.slots[..supplied]
            .iter_mut()
            .map(ValueBuilder::take)
            .collect()
    }
}

type Handler = dyn Fn(&[Value]) -> Result<Value, Fault> + Send + Sync;

/// Procedure backed by a synchronous closure.
pub struct FnProcedure {
    arguments: Arguments,
    handler: Arc<Handler>,
    outcome: Option<Result<Value, Fault>>,
}

impl FnProcedure {
    /// Wrap `handler`, accepting arguments per `arity`.
    pub fn new<F>(arity: Arity, handler: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, Fault> + Send + Sync + 'static,
    {
        Self::from_shared(arity, Arc::new(handler))
    }

    pub(crate) fn from_shared(arity: Arity, handler: Arc<Handler>) -> Self {
        Self {
            arguments: Arguments::new(arity),
            handler,
            outcome: None,
        }
    }
}

impl fmt::Debug for FnProcedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProcedure")
            .field("arguments", &self.arguments)
            .finish_non_exhaustive()
    }
}

impl Procedure for FnProcedure {
    fn begin_arguments(&mut self) -> Arity {
        self.arguments.reset();
        self.outcome = None;
        self.arguments.arity()
    }

    fn argument(&mut self, index: usize) -> Option<&mut dyn ValueSink> {
        self.arguments.sink(index)
    }

    fn begin_invocation(&mut self, _scheduler: &mut dyn Scheduler) -> Result<(), Fault> {
        let args = self.arguments.take();
        self.outcome = Some((self.handler)(&args));
        Ok(())
    }

    fn end_invocation(&mut self) -> Poll<Result<Value, Fault>> {
        Poll::Ready(
            self.outcome
                .take()
                .unwrap_or_else(|| Err(Fault::internal("invocation was not started"))),
        )
    }
}

type DeferredHandler = dyn Fn(Vec<Value>) -> Result<Value, Fault> + Send + Sync;
type Slot = Arc<Mutex<Option<Result<Value, Fault>>>>;

#[derive(Debug)]
struct InFlight {
    slot: Slot,
    cancelled: Arc<AtomicBool>,
}

/// Procedure whose closure runs as a job on the dispatcher's scheduler.
pub struct DeferredProcedure {
    arguments: Arguments,
    handler: Arc<DeferredHandler>,
    in_flight: Option<InFlight>,
}

impl DeferredProcedure {
    /// Wrap `handler`, accepting arguments per `arity`.
    pub fn new<F>(arity: Arity, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, Fault> + Send + Sync + 'static,
    {
        Self::from_shared(arity, Arc::new(handler))
    }

    pub(crate) fn from_shared(arity: Arity, handler: Arc<DeferredHandler>) -> Self {
        Self {
            arguments: Arguments::new(arity),
            handler,
            in_flight: None,
        }
    }
}

impl fmt::Debug for DeferredProcedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredProcedure")
            .field("arguments", &self.arguments)
            .field("in_flight", &self.in_flight.is_some())
            .finish_non_exhaustive()
    }
}

impl Procedure for DeferredProcedure {
    fn begin_arguments(&mut self) -> Arity {
        self.arguments.reset();
        self.cancel();
        self.arguments.arity()
    }

    fn argument(&mut self, index: usize) -> Option<&mut dyn ValueSink> {
        self.arguments.sink(index)
    }

    fn begin_invocation(&mut self, scheduler: &mut dyn Scheduler) -> Result<(), Fault> {
        let args = self.arguments.take();
        let slot: Slot = Arc::new(Mutex::new(None));
        let cancelled = Arc::new(AtomicBool::new(false));

        let handler = Arc::clone(&self.handler);
        let job_slot = Arc::clone(&slot);
        let job_cancelled = Arc::clone(&cancelled);
        scheduler.schedule(Box::new(move || {
            if job_cancelled.load(Ordering::Acquire) {
                debug!("deferred invocation abandoned before start");
                return;
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(args)))
                .unwrap_or_else(|_| Err(Fault::internal("procedure panicked")));
            if job_cancelled.load(Ordering::Acquire) {
                return;
            }
            *job_slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        }));

        self.in_flight = Some(InFlight { slot, cancelled });
        Ok(())
    }

    fn end_invocation(&mut self) -> Poll<Result<Value, Fault>> {
        let Some(in_flight) = &self.in_flight else {
            return Poll::Ready(Err(Fault::internal("invocation was not started")));
        };
        let outcome = in_flight
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match outcome {
            Some(outcome) => {
                self.in_flight = None;
                Poll::Ready(outcome)
            }
            None => Poll::Pending,
        }
    }

    fn cancel(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.cancelled.store(true, Ordering::Release);
        }
    }
}
