//! Cooperative script threads and their scheduler.
//!
//! A script thread wraps one [`SourceProcessor`] bound to an execution
//! context.  Threads are not OS threads: the [`Scheduler`] interleaves them
//! on the host's single event-loop thread, running each until it completes,
//! suspends (asynchronous builtin, `await`), or exhausts its synchronous
//! time slice.
//!
//! Designed to integrate with a `tokio::select!` loop:
//!
//! ```rust,ignore
//! # use strand::engine::Scheduler;
//! # use std::time::Instant;
//! # use tokio::time::sleep_until;
//! # let scheduler = Scheduler::new();
//! loop {
//!     scheduler.run_ready(Instant::now());
//!     match scheduler.next_wakeup() {
//!         Some(deadline) => sleep_until(deadline.into()).await,
//!         None => break, // idle: wait for external input instead
//!     }
//! }
//! ```
//!
//! Because only one thread's state-machine step executes at any instant,
//! the shared scripting domain needs no locks; "concurrency" between
//! scripts means interleaving at suspension points, never mid-statement.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use super::context::ContextRef;
use super::cursor::SourceCursor;
use super::error::{ErrorCode, ScriptError};
use super::processor::{SourceProcessor, StepOutcome};
use super::value::ScriptValue;

// ── Scheduling parameters ─────────────────────────────────────────────────

/// Longest uninterrupted run before a thread yields back to the event loop.
const DEFAULT_SYNC_SLICE: Duration = Duration::from_millis(25);

/// Default ceiling on a thread's accumulated execution time.
const DEFAULT_MAX_RUN_TIME: Duration = Duration::from_secs(30);

// ── Handles and services ──────────────────────────────────────────────────

/// Reference to a script thread, exposed to scripts as a value usable with
/// `await` and `abort`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadHandle(u64);

impl ThreadHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Resumes one suspended thread with a delivered value.  Captured by
/// suspending builtins and fired later by a timer or another thread's
/// completion; firing after the thread finished or aborted is a no-op.
pub struct Resolver {
    thread: u64,
    state: Weak<RefCell<SchedulerState>>,
}

impl Resolver {
    fn detached() -> Self {
        Self { thread: 0, state: Weak::new() }
    }

    /// Deliver `value` and make the thread runnable again.
    pub fn resolve(self, value: ScriptValue) {
        let Some(state) = self.state.upgrade() else { return };
        let cell = state.borrow().threads.get(&self.thread).cloned();
        let Some(cell) = cell else { return };
        {
            let mut t = cell.borrow_mut();
            if t.state != ThreadState::Suspended {
                return;
            }
            t.pending_resume = Some(value);
            t.state = ThreadState::Runnable;
        }
        state.borrow_mut().run_queue.push_back(self.thread);
    }
}

/// What a running processor may ask of its surrounding thread layer:
/// forking `concurrent` blocks, registering timers, and awaiting or
/// aborting other threads.
pub trait ThreadServices {
    /// Fork a new concurrent thread over `body` (a cursor at the `{` of a
    /// scanned block), sharing `ctx`.
    fn spawn_concurrent(
        &mut self,
        body: SourceCursor,
        ctx: &ContextRef,
    ) -> Result<ThreadHandle, ScriptError>;

    /// A resolver for the currently running thread, to be fired when a
    /// suspending builtin's result is ready.
    fn resolver(&mut self) -> Resolver;

    /// Fire `resolver` (with an undefined value) after `delay`.
    fn schedule_after(&mut self, delay: Duration, resolver: Resolver);

    /// Await another thread: `Some(result)` if it already finished,
    /// otherwise `None` after registering `resolver` as a waiter.
    fn await_thread(&mut self, handle: &ThreadHandle, resolver: Resolver) -> Option<ScriptValue>;

    /// Abort a thread.  `true` if it was still pending or running.
    fn abort_thread(&mut self, handle: &ThreadHandle) -> bool;
}

/// Services for processors that run without a scheduler (synchronous
/// evaluation in unit tests).  Everything thread-related is unavailable.
pub struct NullServices;

impl ThreadServices for NullServices {
    fn spawn_concurrent(
        &mut self,
        _body: SourceCursor,
        _ctx: &ContextRef,
    ) -> Result<ThreadHandle, ScriptError> {
        Err(ScriptError::invalid("concurrent execution requires a scheduler"))
    }

    fn resolver(&mut self) -> Resolver {
        Resolver::detached()
    }

    fn schedule_after(&mut self, _delay: Duration, _resolver: Resolver) {}

    fn await_thread(&mut self, _handle: &ThreadHandle, _resolver: Resolver) -> Option<ScriptValue> {
        Some(ScriptError::invalid("await requires a scheduler").into())
    }

    fn abort_thread(&mut self, _handle: &ThreadHandle) -> bool {
        false
    }
}

// ── Run policies ──────────────────────────────────────────────────────────

/// How a new thread coordinates with threads already on the same context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPolicy {
    /// The default: fail with `Busy` when the context already runs a thread.
    #[default]
    Exclusive,
    /// Wait until no other thread runs on the context, FIFO.
    Queue,
    /// Run alongside existing threads.
    Concurrent,
    /// Abort every other thread on the context first.
    AbortRunning,
}

/// Completion callback, invoked exactly once with the final result.
pub type CompletionFn = Box<dyn FnOnce(ScriptValue)>;

/// Parameters for [`Scheduler::start`].
pub struct StartOptions {
    pub policy: RunPolicy,
    /// Keep the context's variables instead of clearing them when the
    /// thread begins.
    pub keep_vars: bool,
    /// Ceiling on accumulated execution time; exceeding it is fatal.
    pub max_run_time: Option<Duration>,
    /// Longest uninterrupted run before yielding to the event loop.
    pub sync_slice: Duration,
    pub on_complete: Option<CompletionFn>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            policy: RunPolicy::default(),
            keep_vars: false,
            max_run_time: Some(DEFAULT_MAX_RUN_TIME),
            sync_slice: DEFAULT_SYNC_SLICE,
            on_complete: None,
        }
    }
}

// ── ScriptThread ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadState {
    /// Waiting for the context to become free (queue policy).
    Queued,
    Runnable,
    Running,
    /// Parked until a resolver fires.
    Suspended,
    /// Completed or aborted; `result` is set.
    Done,
}

/// One schedulable script instance.
struct ScriptThread {
    id: u64,
    ctx: ContextRef,
    /// Taken out while the thread is stepped; `None` once finished.
    processor: Option<SourceProcessor>,
    state: ThreadState,
    /// Value delivered by a resolver, waiting to re-enter the processor.
    pending_resume: Option<ScriptValue>,
    waiters: Vec<Resolver>,
    on_complete: Option<CompletionFn>,
    result: Option<ScriptValue>,
    keep_vars: bool,
    max_run_time: Option<Duration>,
    sync_slice: Duration,
    /// Accumulated execution time across slices.
    used: Duration,
    /// Abort arrived while the thread was being stepped.
    abort_requested: bool,
}

type ThreadRef = Rc<RefCell<ScriptThread>>;

struct Timer {
    due: Instant,
    resolver: Resolver,
}

struct SchedulerState {
    threads: IndexMap<u64, ThreadRef>,
    /// Threads ready to be stepped, in wake order.
    run_queue: VecDeque<u64>,
    /// Queue-policy threads awaiting their context, in submission order.
    queued: Vec<u64>,
    timers: Vec<Timer>,
    next_id: u64,
}

// ── Scheduler ─────────────────────────────────────────────────────────────

/// Owns all script threads and interleaves them cooperatively.
///
/// Cloning is cheap and shares the same thread set; the host keeps one
/// clone, completion callbacks may keep another.
#[derive(Clone)]
pub struct Scheduler {
    state: Rc<RefCell<SchedulerState>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

enum RunEnd {
    Done(ScriptValue),
    Suspended,
    Yielded,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(SchedulerState {
                threads: IndexMap::new(),
                run_queue: VecDeque::new(),
                queued: Vec::new(),
                timers: Vec::new(),
                next_id: 1,
            })),
        }
    }

    /// Start a thread over fresh source text.  Depending on the policy it
    /// begins immediately, queues behind the context's current thread, or
    /// fails with `Busy`.
    pub fn start(
        &self,
        source: impl Into<Rc<str>>,
        ctx: &ContextRef,
        options: StartOptions,
    ) -> Result<ThreadHandle, ScriptError> {
        let processor = SourceProcessor::new(source, ctx.clone());
        self.launch(processor, ctx, options)
    }

    /// Evaluate `source` to completion on a synchronous-only processor.
    ///
    /// Suspending builtins are rejected before invocation; the context's
    /// variables are left untouched between calls.  `concurrent` blocks
    /// fork threads that run on this scheduler's next tick.
    pub fn evaluate(&self, source: &str, ctx: &ContextRef) -> ScriptValue {
        let mut services = SchedulerServices { state: Rc::clone(&self.state), current: 0 };
        let mut processor = SourceProcessor::new(source, ctx.clone()).synchronous_only();
        processor.run_to_completion(&mut services)
    }

    /// Fire due timers and step every thread that was runnable on entry.
    ///
    /// Threads waking *during* the pass run on the next call, so a thread
    /// yielding its time slice cannot starve the host loop.
    pub fn run_ready(&self, now: Instant) {
        self.fire_timers(now);
        let batch: Vec<u64> = self.state.borrow_mut().run_queue.drain(..).collect();
        for id in batch {
            self.run_thread(id);
        }
    }

    /// The next instant [`Scheduler::run_ready`] should be called: `now`
    /// when threads are runnable, the earliest timer otherwise, `None`
    /// when fully idle (threads awaiting other threads have no deadline;
    /// their wakers fire from the threads they wait on).
    pub fn next_wakeup(&self) -> Option<Instant> {
        let s = self.state.borrow();
        if !s.run_queue.is_empty() {
            return Some(Instant::now());
        }
        s.timers.iter().map(|t| t.due).min()
    }

    /// No runnable threads and no pending timers.
    pub fn is_idle(&self) -> bool {
        let s = self.state.borrow();
        s.run_queue.is_empty() && s.timers.is_empty()
    }

    /// Number of threads that have not finished.
    pub fn len(&self) -> usize {
        self.state
            .borrow()
            .threads
            .values()
            .filter(|t| t.borrow().state != ThreadState::Done)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A finished thread's result, `None` while it is still pending.
    pub fn result_of(&self, handle: &ThreadHandle) -> Option<ScriptValue> {
        let cell = self.state.borrow().threads.get(&handle.id()).cloned()?;
        let t = cell.borrow();
        t.result.clone()
    }

    /// Abort a thread: cancel its timers, discard its frame stack, and
    /// deliver an `Aborted` error to its callback and waiters.  A queued
    /// thread is removed from the queue with the same synthesized result.
    pub fn abort(&self, handle: &ThreadHandle) -> bool {
        let Some(cell) = self.cell(handle.id()) else { return false };
        let state = cell.borrow().state;
        match state {
            ThreadState::Done => false,
            ThreadState::Running => {
                // Mid-step: flag it; the step loop finishes the abort.
                cell.borrow_mut().abort_requested = true;
                self.cancel_timers(handle.id());
                true
            }
            _ => {
                self.cancel_timers(handle.id());
                self.finish(&cell, ScriptError::aborted().into());
                true
            }
        }
    }

    // ── Internals ─────────────────────────────────────────────────────────

    fn cell(&self, id: u64) -> Option<ThreadRef> {
        self.state.borrow().threads.get(&id).cloned()
    }

    fn cancel_timers(&self, id: u64) {
        self.state.borrow_mut().timers.retain(|t| t.resolver.thread != id);
    }

    /// Threads on `ctx` that have not finished (queued ones included).
    fn active_on(&self, ctx: &ContextRef) -> Vec<ThreadHandle> {
        self.state
            .borrow()
            .threads
            .values()
            .filter(|cell| {
                let t = cell.borrow();
                t.state != ThreadState::Done && Rc::ptr_eq(&t.ctx, ctx)
            })
            .map(|cell| ThreadHandle(cell.borrow().id))
            .collect()
    }

    fn launch(
        &self,
        processor: SourceProcessor,
        ctx: &ContextRef,
        options: StartOptions,
    ) -> Result<ThreadHandle, ScriptError> {
        if options.policy == RunPolicy::AbortRunning {
            for handle in self.active_on(ctx) {
                self.abort(&handle);
            }
        }
        let active = !self.active_on(ctx).is_empty();
        if options.policy == RunPolicy::Exclusive && active {
            return Err(ScriptError::new(
                ErrorCode::Busy,
                "another thread is already running on this context",
            ));
        }
        let queued = options.policy == RunPolicy::Queue && active;
        let policy = options.policy;
        let keep_vars = options.keep_vars;

        let id = {
            let mut s = self.state.borrow_mut();
            let id = s.next_id;
            s.next_id += 1;
            id
        };
        let cell = Rc::new(RefCell::new(ScriptThread {
            id,
            ctx: ctx.clone(),
            processor: Some(processor),
            state: if queued { ThreadState::Queued } else { ThreadState::Runnable },
            pending_resume: None,
            waiters: Vec::new(),
            on_complete: options.on_complete,
            result: None,
            keep_vars: options.keep_vars,
            max_run_time: options.max_run_time,
            sync_slice: options.sync_slice,
            used: Duration::ZERO,
            abort_requested: false,
        }));
        {
            let mut s = self.state.borrow_mut();
            s.threads.insert(id, cell);
            if queued {
                s.queued.push(id);
            }
        }
        if !queued {
            if !keep_vars {
                ctx.borrow_mut().clear_vars();
            }
            self.state.borrow_mut().run_queue.push_back(id);
        }
        tracing::debug!(target: "strand::engine", thread = id, ?policy, queued, "thread started");
        Ok(ThreadHandle(id))
    }

    fn fire_timers(&self, now: Instant) {
        let due: Vec<Timer> = {
            let mut s = self.state.borrow_mut();
            let (due, pending): (Vec<Timer>, Vec<Timer>) =
                s.timers.drain(..).partition(|t| t.due <= now);
            s.timers = pending;
            due
        };
        for timer in due {
            timer.resolver.resolve(ScriptValue::Null);
        }
    }

    /// Step one thread until it completes, suspends, or exhausts its slice.
    fn run_thread(&self, id: u64) {
        let Some(cell) = self.cell(id) else { return };
        let (mut processor, resume) = {
            let mut t = cell.borrow_mut();
            if t.state != ThreadState::Runnable {
                return; // aborted or resumed elsewhere since it was queued
            }
            let Some(p) = t.processor.take() else { return };
            t.state = ThreadState::Running;
            (p, t.pending_resume.take())
        };
        if let Some(value) = resume {
            processor.resume(value);
        }
        let (slice, limit, used) = {
            let t = cell.borrow();
            (t.sync_slice, t.max_run_time, t.used)
        };

        let started = Instant::now();
        let mut services = SchedulerServices { state: Rc::clone(&self.state), current: id };
        let end = loop {
            match processor.step(&mut services) {
                StepOutcome::Done(value) => break RunEnd::Done(value),
                StepOutcome::Suspended => break RunEnd::Suspended,
                StepOutcome::Continue => {}
            }
            if cell.borrow().abort_requested {
                processor.terminate(ScriptError::aborted());
                continue; // the next step reports Done with the abort result
            }
            let elapsed = started.elapsed();
            if let Some(limit) = limit {
                if used + elapsed > limit {
                    processor.terminate(ScriptError::timeout());
                    continue;
                }
            }
            if elapsed > slice {
                break RunEnd::Yielded;
            }
        };
        let elapsed = started.elapsed();

        match end {
            RunEnd::Done(value) => {
                cell.borrow_mut().used += elapsed;
                self.finish(&cell, value);
            }
            RunEnd::Suspended | RunEnd::Yielded => {
                if cell.borrow().abort_requested {
                    // Abort arrived during the very step that suspended.
                    self.finish(&cell, ScriptError::aborted().into());
                    return;
                }
                let runnable = matches!(end, RunEnd::Yielded);
                {
                    let mut t = cell.borrow_mut();
                    t.used += elapsed;
                    t.processor = Some(processor);
                    t.state = if runnable { ThreadState::Runnable } else { ThreadState::Suspended };
                }
                if runnable {
                    tracing::debug!(target: "strand::engine", thread = id, "slice exhausted, yielding");
                    self.state.borrow_mut().run_queue.push_back(id);
                }
            }
        }
    }

    /// Enter the terminal state: record the result, notify the completion
    /// callback and all waiters exactly once, then start the context's next
    /// queued thread (only after the callback has returned).
    fn finish(&self, cell: &ThreadRef, result: ScriptValue) {
        let (id, ctx, waiters, callback) = {
            let mut t = cell.borrow_mut();
            if t.state == ThreadState::Done {
                return;
            }
            t.state = ThreadState::Done;
            t.processor = None;
            t.result = Some(result.clone());
            (t.id, t.ctx.clone(), std::mem::take(&mut t.waiters), t.on_complete.take())
        };
        tracing::debug!(target: "strand::engine", thread = id, "thread finished");
        {
            let mut s = self.state.borrow_mut();
            s.timers.retain(|t| t.resolver.thread != id);
            s.queued.retain(|&q| q != id);
        }
        for waiter in waiters {
            waiter.resolve(result.clone());
        }
        if let Some(callback) = callback {
            callback(result);
        }
        self.promote_queued(&ctx);
    }

    /// Begin the first queued thread for `ctx` once nothing else runs on it.
    fn promote_queued(&self, ctx: &ContextRef) {
        let next: Option<ThreadRef> = {
            let s = self.state.borrow();
            let busy = s.threads.values().any(|cell| {
                let t = cell.borrow();
                !matches!(t.state, ThreadState::Done | ThreadState::Queued)
                    && Rc::ptr_eq(&t.ctx, ctx)
            });
            if busy {
                None
            } else {
                s.queued.iter().find_map(|id| {
                    let cell = s.threads.get(id)?;
                    Rc::ptr_eq(&cell.borrow().ctx, ctx).then(|| Rc::clone(cell))
                })
            }
        };
        let Some(cell) = next else { return };
        let id = {
            let mut t = cell.borrow_mut();
            if !t.keep_vars {
                t.ctx.borrow_mut().clear_vars();
            }
            t.state = ThreadState::Runnable;
            t.id
        };
        let mut s = self.state.borrow_mut();
        s.queued.retain(|&q| q != id);
        s.run_queue.push_back(id);
    }
}

// ── ThreadServices backed by the scheduler ────────────────────────────────

struct SchedulerServices {
    state: Rc<RefCell<SchedulerState>>,
    /// The thread currently being stepped; 0 for synchronous evaluation.
    current: u64,
}

impl SchedulerServices {
    fn scheduler(&self) -> Scheduler {
        Scheduler { state: Rc::clone(&self.state) }
    }
}

impl ThreadServices for SchedulerServices {
    fn spawn_concurrent(
        &mut self,
        body: SourceCursor,
        ctx: &ContextRef,
    ) -> Result<ThreadHandle, ScriptError> {
        let processor = SourceProcessor::for_statement(body, ctx.clone());
        self.scheduler().launch(
            processor,
            ctx,
            StartOptions {
                policy: RunPolicy::Concurrent,
                // The fork shares its parent's variables.
                keep_vars: true,
                ..StartOptions::default()
            },
        )
    }

    fn resolver(&mut self) -> Resolver {
        Resolver { thread: self.current, state: Rc::downgrade(&self.state) }
    }

    fn schedule_after(&mut self, delay: Duration, resolver: Resolver) {
        let due = Instant::now() + delay;
        self.state.borrow_mut().timers.push(Timer { due, resolver });
    }

    fn await_thread(&mut self, handle: &ThreadHandle, resolver: Resolver) -> Option<ScriptValue> {
        if handle.id() == self.current {
            return Some(ScriptError::invalid("a thread cannot await itself").into());
        }
        let cell = self.state.borrow().threads.get(&handle.id()).cloned();
        let Some(cell) = cell else {
            return Some(ScriptError::new(ErrorCode::NotFound, "unknown thread").into());
        };
        let mut t = cell.borrow_mut();
        match t.state {
            ThreadState::Done => Some(t.result.clone().unwrap_or(ScriptValue::Null)),
            _ => {
                t.waiters.push(resolver);
                None
            }
        }
    }

    fn abort_thread(&mut self, handle: &ThreadHandle) -> bool {
        self.scheduler().abort(handle)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::{ExecutionContext, ScriptingDomain};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn setup() -> (Scheduler, ContextRef) {
        let domain = ScriptingDomain::with_standard_functions();
        (Scheduler::new(), ExecutionContext::new(domain))
    }

    /// Drive the scheduler until idle, sleeping through timer gaps.
    fn drive(sched: &Scheduler) {
        loop {
            sched.run_ready(Instant::now());
            if sched.is_idle() {
                return;
            }
            if let Some(deadline) = sched.next_wakeup() {
                let now = Instant::now();
                if deadline > now {
                    std::thread::sleep(deadline - now);
                }
            }
        }
    }

    /// Collects completion order tags through callbacks.
    fn tag(log: &Rc<RefCell<Vec<&'static str>>>, name: &'static str) -> CompletionFn {
        let log = Rc::clone(log);
        Box::new(move |_| log.borrow_mut().push(name))
    }

    #[test]
    fn runs_to_completion_and_notifies() {
        let (sched, ctx) = setup();
        let log = Rc::new(RefCell::new(Vec::new()));
        let h = sched
            .start("6 * 7", &ctx, StartOptions { on_complete: Some(tag(&log, "done")), ..StartOptions::default() })
            .unwrap();
        assert!(sched.result_of(&h).is_none());
        drive(&sched);
        assert_eq!(sched.result_of(&h), Some(ScriptValue::Number(42.0)));
        assert_eq!(*log.borrow(), vec!["done"]);
        assert!(sched.is_empty());
    }

    #[test]
    fn evaluate_runs_synchronously() {
        let (sched, ctx) = setup();
        assert_eq!(sched.evaluate("12 * 3 + 7", &ctx), ScriptValue::Number(43.0));
        // Variables persist across evaluate calls.
        sched.evaluate("var x := 5", &ctx);
        assert_eq!(sched.evaluate("x + 1", &ctx), ScriptValue::Number(6.0));
    }

    #[test]
    fn exclusive_policy_reports_busy() {
        let (sched, ctx) = setup();
        let a = sched.start("delay(0.05)\n1", &ctx, StartOptions::default()).unwrap();
        sched.run_ready(Instant::now()); // A is now suspended on its timer
        let err = sched.start("2", &ctx, StartOptions::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::Busy);
        drive(&sched);
        assert_eq!(sched.result_of(&a), Some(ScriptValue::Number(1.0)));
    }

    #[test]
    fn concurrent_policy_interleaves() {
        let (sched, ctx) = setup();
        let a = sched.start("delay(0.02)\n'a'", &ctx, StartOptions::default()).unwrap();
        sched.run_ready(Instant::now());
        let b = sched
            .start(
                "delay(0.01)\n'b'",
                &ctx,
                StartOptions { policy: RunPolicy::Concurrent, keep_vars: true, ..StartOptions::default() },
            )
            .unwrap();
        drive(&sched);
        assert_eq!(sched.result_of(&a), Some(ScriptValue::text("a")));
        assert_eq!(sched.result_of(&b), Some(ScriptValue::text("b")));
    }

    #[test]
    fn queue_runs_in_submission_order_and_keeps_vars() {
        let (sched, ctx) = setup();
        let log = Rc::new(RefCell::new(Vec::new()));
        sched
            .start(
                "var x := 5\ndelay(0.01)\nx",
                &ctx,
                StartOptions { on_complete: Some(tag(&log, "a")), ..StartOptions::default() },
            )
            .unwrap();
        sched.run_ready(Instant::now());
        let b = sched
            .start(
                "x + 1",
                &ctx,
                StartOptions {
                    policy: RunPolicy::Queue,
                    keep_vars: true,
                    on_complete: Some(tag(&log, "b")),
                    ..StartOptions::default()
                },
            )
            .unwrap();
        // B has not started while A is pending.
        assert!(sched.result_of(&b).is_none());
        drive(&sched);
        assert_eq!(*log.borrow(), vec!["a", "b"]);
        // B observed the variable A left behind.
        assert_eq!(sched.result_of(&b), Some(ScriptValue::Number(6.0)));
    }

    #[test]
    fn queue_without_keep_vars_starts_clean() {
        let (sched, ctx) = setup();
        sched.start("var x := 5\ndelay(0.01)", &ctx, StartOptions::default()).unwrap();
        sched.run_ready(Instant::now());
        let b = sched
            .start("x", &ctx, StartOptions { policy: RunPolicy::Queue, ..StartOptions::default() })
            .unwrap();
        drive(&sched);
        let result = sched.result_of(&b).unwrap();
        assert_eq!(result.as_error().unwrap().code, ErrorCode::NotFound);
    }

    #[test]
    fn abort_running_policy_replaces_the_thread() {
        let (sched, ctx) = setup();
        let a = sched.start("delay(10)\n'never'", &ctx, StartOptions::default()).unwrap();
        sched.run_ready(Instant::now());
        let b = sched
            .start(
                "'winner'",
                &ctx,
                StartOptions { policy: RunPolicy::AbortRunning, ..StartOptions::default() },
            )
            .unwrap();
        // A's 10s timer was cancelled, so driving finishes immediately.
        let before = Instant::now();
        drive(&sched);
        assert!(before.elapsed() < Duration::from_secs(1));
        let a_result = sched.result_of(&a).unwrap();
        assert_eq!(a_result.as_error().unwrap().code, ErrorCode::Aborted);
        assert_eq!(sched.result_of(&b), Some(ScriptValue::text("winner")));
    }

    #[test]
    fn abort_queued_thread_removes_it() {
        let (sched, ctx) = setup();
        let a = sched.start("delay(0.01)\n1", &ctx, StartOptions::default()).unwrap();
        sched.run_ready(Instant::now());
        let log = Rc::new(RefCell::new(Vec::new()));
        let b = sched
            .start(
                "2",
                &ctx,
                StartOptions {
                    policy: RunPolicy::Queue,
                    on_complete: Some(tag(&log, "b")),
                    ..StartOptions::default()
                },
            )
            .unwrap();
        assert!(sched.abort(&b));
        // The callback fired exactly once, with the synthesized result.
        assert_eq!(*log.borrow(), vec!["b"]);
        assert!(!sched.abort(&b));
        drive(&sched);
        assert_eq!(sched.result_of(&a), Some(ScriptValue::Number(1.0)));
        let b_result = sched.result_of(&b).unwrap();
        assert_eq!(b_result.as_error().unwrap().code, ErrorCode::Aborted);
    }

    #[test]
    fn concurrent_fork_and_await() {
        let (sched, ctx) = setup();
        let h = sched
            .start("concurrent as t { delay(0.01); 7 }\nawait(t) + 1", &ctx, StartOptions::default())
            .unwrap();
        drive(&sched);
        assert_eq!(sched.result_of(&h), Some(ScriptValue::Number(8.0)));
    }

    #[test]
    fn await_delivers_error_results_too() {
        let (sched, ctx) = setup();
        let h = sched
            .start("concurrent as t { delay(0.01); 1 / 0 }\nawait(t)", &ctx, StartOptions::default())
            .unwrap();
        drive(&sched);
        let result = sched.result_of(&h).unwrap();
        assert_eq!(result.as_error().unwrap().code, ErrorCode::DivisionByZero);
    }

    #[test]
    fn script_can_abort_its_fork() {
        let (sched, ctx) = setup();
        let h = sched
            .start("concurrent as t { delay(10) }\nabort(t)", &ctx, StartOptions::default())
            .unwrap();
        let before = Instant::now();
        drive(&sched);
        // The fork's 10s timer is gone.
        assert!(before.elapsed() < Duration::from_secs(1));
        assert_eq!(sched.result_of(&h), Some(ScriptValue::Number(1.0)));
    }

    #[test]
    fn timeout_is_fatal_even_inside_try() {
        let (sched, ctx) = setup();
        let h = sched
            .start(
                "try { while (true) { } } catch 'caught'",
                &ctx,
                StartOptions {
                    max_run_time: Some(ms(20)),
                    sync_slice: ms(5),
                    ..StartOptions::default()
                },
            )
            .unwrap();
        drive(&sched);
        let result = sched.result_of(&h).unwrap();
        assert_eq!(result.as_error().unwrap().code, ErrorCode::Timeout);
    }

    #[test]
    fn slice_exhaustion_yields_instead_of_failing() {
        let (sched, ctx) = setup();
        let h = sched
            .start(
                "var i := 0\nwhile (i < 40) { i := i + 1 }\ni",
                &ctx,
                StartOptions { sync_slice: Duration::ZERO, ..StartOptions::default() },
            )
            .unwrap();
        sched.run_ready(Instant::now());
        // One tick was not enough; the thread yielded and is still pending.
        assert!(sched.result_of(&h).is_none());
        assert!(!sched.is_idle());
        drive(&sched);
        assert_eq!(sched.result_of(&h), Some(ScriptValue::Number(40.0)));
    }

    #[test]
    fn next_wakeup_tracks_timers() {
        let (sched, ctx) = setup();
        assert!(sched.next_wakeup().is_none());
        sched.start("delay(0.05)", &ctx, StartOptions::default()).unwrap();
        // Runnable thread: wake immediately.
        assert!(sched.next_wakeup().is_some());
        sched.run_ready(Instant::now());
        // Suspended on its timer: wake at the deadline.
        let wake = sched.next_wakeup().unwrap();
        let now = Instant::now();
        assert!(wake > now);
        assert!(wake <= now + ms(50));
        drive(&sched);
        assert!(sched.next_wakeup().is_none());
    }

    #[test]
    fn null_services_reject_thread_operations() {
        let mut services = NullServices;
        assert!(!services.abort_thread(&ThreadHandle(1)));
        let out = services
            .await_thread(&ThreadHandle(1), Resolver::detached())
            .unwrap();
        assert_eq!(out.as_error().unwrap().code, ErrorCode::Invalid);
    }
}
