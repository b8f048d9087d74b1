//! strand — an embeddable, resumable scripting engine.
//!
//! End users of automation and device-control applications write small
//! programs (single expressions or full scripts with control flow) that
//! are evaluated repeatedly in response to events, and that may call back
//! into host functions completing asynchronously.  The interpreter runs as
//! an explicit state machine over the source text, so a script can suspend
//! mid-statement and resume later without ever blocking the host's
//! single-threaded event loop.
//!
//! The [`engine`] module is the embeddable core; [`host`] adapts it to a
//! tokio event loop and [`cli`] backs the `strand` binary.

pub mod cli;
pub mod engine;
pub mod host;

pub use engine::{
    ExecutionContext, Scheduler, ScriptError, ScriptValue, ScriptingDomain, SourceProcessor,
};
