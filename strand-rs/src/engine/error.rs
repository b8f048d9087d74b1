//! Script error taxonomy and source positions.
//!
//! Errors travel through the engine as ordinary values (see
//! [`ScriptValue::Error`](super::value::ScriptValue)); the distinction
//! between an error that merely *flows* and one that *unwinds* to the
//! nearest `try` is the `thrown` flag set at the raise site.

use std::fmt;

use thiserror::Error;

// ── Source position ───────────────────────────────────────────────────────

/// A position within a source string: byte offset plus the line/column pair
/// derived from it.  Lines and columns are 1-based for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourcePos {
    pub offset: usize,
    pub line: u32,
    pub column: u32,
}

impl SourcePos {
    pub const fn new(offset: usize, line: u32, column: u32) -> Self {
        Self { offset, line, column }
    }
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

// ── Error codes ───────────────────────────────────────────────────────────

/// Classification of script errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed source text.
    Syntax,
    /// Division or modulo by zero.
    DivisionByZero,
    /// Semantically wrong operand or argument.
    Invalid,
    /// Name could not be resolved.
    NotFound,
    /// Name could not be created (assignment to an undeclared variable).
    NotCreated,
    /// Write to a non-writable member.
    Immutable,
    /// Conflicting concurrent execution on the same context.
    Busy,
    /// Thread was externally cancelled.
    Aborted,
    /// Thread ran past its time budget.  Fatal: bypasses `catch`.
    Timeout,
    /// Raised by script code itself via `throw()`.
    User,
    /// Internal consistency failure.  Fatal: bypasses `catch`.
    Internal,
}

impl ErrorCode {
    /// Fatal error classes terminate the thread even inside `try`.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorCode::Timeout | ErrorCode::Internal)
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Syntax => "syntax",
            ErrorCode::DivisionByZero => "division by zero",
            ErrorCode::Invalid => "invalid",
            ErrorCode::NotFound => "not found",
            ErrorCode::NotCreated => "not created",
            ErrorCode::Immutable => "immutable",
            ErrorCode::Busy => "busy",
            ErrorCode::Aborted => "aborted",
            ErrorCode::Timeout => "timeout",
            ErrorCode::User => "user",
            ErrorCode::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── ScriptError ───────────────────────────────────────────────────────────

/// A script-level error: code, message, and (when known) the source
/// position where it was raised.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{code} error: {message}")]
pub struct ScriptError {
    pub code: ErrorCode,
    pub message: String,
    pub pos: Option<SourcePos>,
}

impl ScriptError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), pos: None }
    }

    pub fn at(mut self, pos: SourcePos) -> Self {
        self.pos = Some(pos);
        self
    }

    /// Attach a position only if none is recorded yet; the innermost
    /// (first) position is the one worth showing.
    pub fn or_at(mut self, pos: SourcePos) -> Self {
        if self.pos.is_none() {
            self.pos = Some(pos);
        }
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.code.is_fatal()
    }

    /// Render the offending source line with a caret under the column,
    /// for interactive display.  Returns `None` when no position is known
    /// or the position does not fall inside `src`.
    pub fn caret(&self, src: &str) -> Option<String> {
        let pos = self.pos?;
        let line = src.lines().nth(pos.line.saturating_sub(1) as usize)?;
        let col = (pos.column.saturating_sub(1)) as usize;
        let mut out = String::with_capacity(line.len() * 2 + 2);
        out.push_str(line);
        out.push('\n');
        // Columns are counted in characters; tabs keep their width.
        for ch in line.chars().take(col) {
            out.push(if ch == '\t' { '\t' } else { ' ' });
        }
        out.push('^');
        Some(out)
    }
}

// ── Constructors for the common cases ─────────────────────────────────────

impl ScriptError {
    pub fn syntax(message: impl Into<String>, pos: SourcePos) -> Self {
        Self::new(ErrorCode::Syntax, message).at(pos)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Invalid, message)
    }

    pub fn not_found(name: &str) -> Self {
        Self::new(ErrorCode::NotFound, format!("'{name}' not found"))
    }

    pub fn not_created(name: &str) -> Self {
        Self::new(ErrorCode::NotCreated, format!("cannot create '{name}' here"))
    }

    pub fn aborted() -> Self {
        Self::new(ErrorCode::Aborted, "aborted")
    }

    pub fn timeout() -> Self {
        Self::new(ErrorCode::Timeout, "execution time limit exceeded")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────
