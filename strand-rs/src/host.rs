//! Tokio host adapter.
//!
//! The engine core is synchronous and runtime-free; this module supplies
//! the event loop the scheduler expects: "run callbacks once after N
//! microseconds" becomes a `sleep_until` deadline, and the whole loop is a
//! single `tokio::select!` on a current-thread runtime.
//!
//! ```text
//!   ┌──────────────────────────────┐
//!   │  drive_thread() / repl()     │
//!   │  tokio::select! over:        │
//!   │  • sleep_until(next_wakeup)  │──► scheduler.run_ready(now)
//!   │  • stdin lines (REPL)        │──► scheduler.start(line, …)
//!   │  • ctrl-c                    │──► scheduler.abort(…)
//!   └──────────────────────────────┘
//! ```

use std::io::{self, Write};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::sleep_until;

use crate::engine::builtins::{ArgDescriptor, BuiltinOutcome, NativeFunction, Signature};
use crate::engine::context::{ContextRef, DomainRef};
use crate::engine::error::ScriptError;
use crate::engine::thread::{RunPolicy, Scheduler, StartOptions, ThreadHandle};
use crate::engine::value::{mask, ScriptValue};

// ── Host functions ────────────────────────────────────────────────────────

/// Register the functions only the CLI host provides.
pub fn register_host_functions(domain: &DomainRef) {
    const PRINT_ARGS: &[ArgDescriptor] = &[ArgDescriptor::multiple(mask::ANY)];
    domain.borrow_mut().register_function(NativeFunction::new(
        Signature {
            name: "print",
            returns: mask::NULL,
            args: PRINT_ARGS,
        },
        |call| {
            let line: Vec<String> = call.args.iter().map(ScriptValue::string_value).collect();
            println!("{}", line.join(" "));
            Ok(BuiltinOutcome::Value(ScriptValue::Null))
        },
    ));
}

// ── Driving the scheduler ─────────────────────────────────────────────────

/// Drive the scheduler until `handle` finishes, sleeping through timer
/// gaps.  Ctrl-C aborts the thread (which then finishes with an `Aborted`
/// error result).
pub async fn drive_thread(scheduler: &Scheduler, handle: &ThreadHandle) -> ScriptValue {
    loop {
        scheduler.run_ready(Instant::now());
        if let Some(result) = scheduler.result_of(handle) {
            return result;
        }
        match scheduler.next_wakeup() {
            Some(deadline) => {
                tokio::select! {
                    _ = sleep_until(deadline.into()) => {}
                    _ = tokio::signal::ctrl_c() => {
                        scheduler.abort(handle);
                    }
                }
            }
            None => {
                // No timer and nothing runnable: the thread awaits a thread
                // that can never finish.
                scheduler.abort(handle);
            }
        }
    }
}

/// Start `source` as a thread and drive it to completion.
pub async fn run_source(
    scheduler: &Scheduler,
    source: &str,
    ctx: &ContextRef,
    options: StartOptions,
) -> Result<ScriptValue, ScriptError> {
    let handle = scheduler.start(source, ctx, options)?;
    Ok(drive_thread(scheduler, &handle).await)
}

// ── REPL ──────────────────────────────────────────────────────────────────

/// Line-based read-eval-print loop.  Each line runs as its own thread on
/// `ctx` with variables kept across lines; `concurrent` forks from earlier
/// lines keep running between prompts.
pub async fn repl(
    scheduler: &Scheduler,
    ctx: &ContextRef,
    time_limit: Option<Duration>,
) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("strand> ");
        io::stdout().flush()?;
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                continue;
            }
        };
        let Some(line) = line else { break }; // EOF
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }
        let mut options = StartOptions {
            policy: RunPolicy::Concurrent,
            keep_vars: true,
            ..StartOptions::default()
        };
        if time_limit.is_some() {
            options.max_run_time = time_limit;
        }
        match scheduler.start(line, ctx, options) {
            Ok(handle) => {
                let result = drive_thread(scheduler, &handle).await;
                report_result(&result, line);
            }
            Err(e) => eprintln!("{e}"),
        }
    }
    Ok(())
}

/// Print a result the way an interactive caller expects: values on stdout,
/// errors on stderr with the offending line and a caret under the column.
pub fn report_result(result: &ScriptValue, src: &str) {
    match result {
        ScriptValue::Error(e) => {
            eprintln!("{e}");
            if let Some(caret) = e.caret(src) {
                eprintln!("{caret}");
            }
        }
        ScriptValue::Null => {}
        other => println!("{other}"),
    }
}
