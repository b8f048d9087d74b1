//! The strand scripting engine.
//!
//! A resumable, dynamically typed expression/script evaluator for
//! automation hosts, covering:
//!
//! - The [`ScriptValue`] model: null, error, number, text, structured
//!   (JSON), function and thread-handle values, with error and null
//!   propagation through every operator
//! - Control flow: `if` … `else`, `while`, `break`, `continue`, `return`,
//!   `try` … `catch`, `var`/`let`/`glob` declarations, `function`
//!   declarations, and `concurrent` forks
//! - Scheduling-domain literals: clock times (`14:30` → seconds) and
//!   calendar dates (`19.Feb` → day of year)
//! - Cooperative [`Scheduler`]-managed threads that suspend on
//!   asynchronous builtins, `await`, or time-slice exhaustion, and resume
//!   without ever blocking the host event loop
//! - ~30 built-in functions (string, numeric, type inspection, errors,
//!   threads, timing) plus host-registered natives
//!
//! # Quick start
//!
//! ```rust
//! use strand::engine::{ExecutionContext, Scheduler, ScriptValue, ScriptingDomain};
//!
//! let domain = ScriptingDomain::with_standard_functions();
//! let ctx = ExecutionContext::new(domain);
//! let scheduler = Scheduler::new();
//! let result = scheduler.evaluate("12 * 3 + 7", &ctx);
//! assert_eq!(result, ScriptValue::Number(43.0));
//! ```

pub mod builtins;
pub mod context;
pub mod cursor;
pub mod error;
pub mod processor;
pub mod thread;
pub mod value;

// Re-exports for convenience.
pub use context::{ContextRef, DomainRef, ExecutionContext, MemberLookup, ScriptingDomain};
pub use cursor::SourceCursor;
pub use error::{ErrorCode, ScriptError, SourcePos};
pub use processor::SourceProcessor;
pub use thread::{RunPolicy, Scheduler, StartOptions, ThreadHandle};
pub use value::ScriptValue;
