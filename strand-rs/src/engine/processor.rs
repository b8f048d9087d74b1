//! The resumable interpreter core.
//!
//! [`SourceProcessor`] walks source text through a [`SourceCursor`],
//! alternating between lexing and evaluating.  It is a cooperative state
//! machine, not a recursive interpreter: the call structure lives in an
//! explicit stack of [`Frame`]s, each holding the state to resume into, so
//! the processor can stop between any two steps — for a suspending native
//! function, an `await`, or a time-slice yield — and be re-entered later
//! without ever blocking the host event loop.
//!
//! Each state handler does a bounded amount of work and then advances the
//! same frame, pushes a sub-rule frame, pops a result upward, or suspends.
//!
//! Two invariants every construct added here must keep:
//!
//! - Expressions parse by precedence climbing: a sub-expression carries a
//!   numeric floor, and an operator whose precedence is at or below the
//!   floor belongs to the enclosing expression.
//! - Skipped code is fully scanned but never executed.  Dead branches (the
//!   false side of `if`, a short-circuited operand, a scanned function
//!   body) advance the cursor exactly like live code, while all side
//!   effects funnel through chokepoints that consult the skip flag:
//!   [`SourceProcessor::read_lvalue`], [`SourceProcessor::assign_lvalue`],
//!   and [`SourceProcessor::invoke_call`].

use std::rc::Rc;

use super::builtins::{BuiltinOutcome, CallContext};
use super::context::{setflags, ContextRef, ExecutionContext};
use super::cursor::SourceCursor;
use super::error::{ErrorCode, ScriptError};
use super::thread::ThreadServices;
use super::value::{
    apply_binary, apply_unary, json_get, json_set_path, mask, BinaryOp, Executable, PathKey,
    ScriptFunction, ScriptValue, UnaryOp, UNARY_PRECEDENCE,
};

// ── States ────────────────────────────────────────────────────────────────

/// Resume points of the state machine.  Each variant has one handler in
/// [`SourceProcessor::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    // Statement level.
    Body,
    StatementEnd,
    ExprStatementDone,
    DeclAssign,
    ReturnValue,
    IfCondition,
    IfThenDone,
    IfElseDone,
    WhileCondition,
    WhileCondEvaluated,
    WhileBodyDone,
    TryBody,
    TryDone,
    CatchDone,
    ConcurrentScanned,
    FunctionDeclScanned,
    // Expression level.
    ExprTerm,
    GroupEnd,
    UnaryDone,
    OperatorScan,
    BinaryDone,
    PostfixScan,
    SubscriptKey,
    ValuePostfix,
    ValueSubscriptKey,
    AssignRhsDone,
    CallArgs,
    CallArgDone,
}

/// Frame tags used by the stack scans for `break`/`continue`, `return`,
/// and error raising.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    /// Whole-script statement list.
    Script,
    /// `{ ... }` statement list.
    Block,
    /// Exactly one statement, then pop.
    Single,
    /// One expression.
    Expr,
    /// A `while` construct; target of `break`/`continue`.
    Loop,
    /// A `try` construct; target of raised errors.
    Try,
    /// A user-function call body; barrier for `break`/`continue`, target
    /// of `return`.
    Function,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeclKind {
    Var,
    Let,
    Glob,
}

impl DeclKind {
    fn set_flags(self) -> u8 {
        match self {
            DeclKind::Var => setflags::CREATE,
            DeclKind::Let => 0,
            DeclKind::Glob => setflags::GLOBAL | setflags::ONLY_CREATE,
        }
    }
}

/// An unresolved assignment/read target: a variable name plus the member
/// path accumulated from `.name` and `[key]` postfixes.
#[derive(Debug, Clone)]
struct Lvalue {
    name: String,
    path: Vec<PathKey>,
}

// ── Frame ─────────────────────────────────────────────────────────────────

/// One entry of the explicit interpreter stack.
struct Frame {
    state: State,
    kind: FrameKind,
    /// Scan without executing.  Inherited by pushed frames.
    skipping: bool,
    /// Operator-precedence floor for Expr frames.
    precedence: u8,
    /// Expr frames at a statement's top level may turn into assignments.
    statement_level: bool,
    pending_op: Option<BinaryOp>,
    unary_op: Option<UnaryOp>,
    /// In-flight result; child frames deliver here on pop.
    result: ScriptValue,
    /// Saved left operand (or subscript base) while the right side runs.
    prev_result: ScriptValue,
    /// Identifier buffer: callee name, declaration name, thread variable.
    identifier: String,
    /// Parameter names while scanning a function declaration.
    params: Vec<String>,
    /// Collected call arguments.
    args: Vec<ScriptValue>,
    lvalue: Option<Lvalue>,
    /// Loop condition position, or a scanned block's start.
    saved_cursor: Option<SourceCursor>,
    /// Cursor to restore when this frame pops (function calls switch
    /// sources).
    return_cursor: Option<SourceCursor>,
    /// Per-call local context for Function frames.
    local_ctx: Option<ContextRef>,
    /// `if`: condition was true.
    branch_taken: bool,
    /// Loop: exit after the current body scan.  `continue` needs no flag of
    /// its own; skipping the rest of the body and re-entering the condition
    /// is the loop's normal path.
    exiting: bool,
    /// Try: the error captured for the catch block.
    caught: Option<ScriptError>,
    decl: Option<DeclKind>,
    /// The previous statement requires `;`, `}`, end of text, or a line
    /// break before the next.
    need_separator: bool,
    /// Line the previous statement ended on, for the separator check.
    statement_line: u32,
}

impl Frame {
    fn new(kind: FrameKind, state: State) -> Self {
        Self {
            state,
            kind,
            skipping: false,
            precedence: 0,
            statement_level: false,
            pending_op: None,
            unary_op: None,
            result: ScriptValue::Null,
            prev_result: ScriptValue::Null,
            identifier: String::new(),
            params: Vec::new(),
            args: Vec::new(),
            lvalue: None,
            saved_cursor: None,
            return_cursor: None,
            local_ctx: None,
            branch_taken: false,
            exiting: false,
            caught: None,
            decl: None,
            need_separator: false,
            statement_line: 0,
        }
    }
}

// ── Step outcome ──────────────────────────────────────────────────────────

/// Result of one driver step.
#[derive(Debug)]
pub enum StepOutcome {
    /// More work is available immediately.
    Continue,
    /// A handler registered a suspension; call
    /// [`SourceProcessor::resume`] with the delivered value, then step
    /// again.
    Suspended,
    /// The frame stack is empty; the value is the final result (possibly
    /// an error value).
    Done(ScriptValue),
}

enum Flow {
    Continue,
    Suspend,
}

// ── SourceProcessor ───────────────────────────────────────────────────────

/// The resumable script evaluator: one cursor, one frame stack, one
/// execution context.
pub struct SourceProcessor {
    cursor: SourceCursor,
    stack: Vec<Frame>,
    ctx: ContextRef,
    /// Reject asynchronous-capable native functions before invoking them.
    sync_only: bool,
    completed: Option<ScriptValue>,
}

impl SourceProcessor {
    /// An async-capable processor over fresh source text.
    pub fn new(source: impl Into<Rc<str>>, ctx: ContextRef) -> Self {
        Self::from_cursor(SourceCursor::new(source), ctx)
    }

    /// Processor starting at an existing cursor position, running a whole
    /// statement list up to end of text.
    pub fn from_cursor(cursor: SourceCursor, ctx: ContextRef) -> Self {
        let mut stack = Vec::with_capacity(8);
        stack.push(Frame::new(FrameKind::Script, State::Body));
        Self { cursor, stack, ctx, sync_only: false, completed: None }
    }

    /// Processor that executes exactly one statement and stops — the `{...}`
    /// body of a `concurrent` fork, which shares its parent's source buffer
    /// and must not run past the closing brace.
    pub fn for_statement(cursor: SourceCursor, ctx: ContextRef) -> Self {
        let mut stack = Vec::with_capacity(8);
        stack.push(Frame::new(FrameKind::Single, State::Body));
        Self { cursor, stack, ctx, sync_only: false, completed: None }
    }

    /// Restrict to synchronous execution: suspending native functions are
    /// rejected before invocation.
    pub fn synchronous_only(mut self) -> Self {
        self.sync_only = true;
        self
    }

    pub fn context(&self) -> &ContextRef {
        &self.ctx
    }

    pub fn source(&self) -> &Rc<str> {
        self.cursor.source()
    }

    pub fn is_done(&self) -> bool {
        self.stack.is_empty()
    }

    /// Deliver the result of a suspension into the waiting frame.
    pub fn resume(&mut self, value: ScriptValue) {
        if let Some(top) = self.stack.last_mut() {
            top.result = value;
        }
    }

    /// Discard the whole stack and finish with `err` as the result,
    /// bypassing any `try` (used for aborts and fatal errors).
    pub fn terminate(&mut self, err: ScriptError) {
        tracing::debug!(target: "strand::engine", code = %err.code, "thread terminated: {}", err.message);
        self.stack.clear();
        self.completed = Some(err.into());
    }

    // ── Driver ────────────────────────────────────────────────────────────

    /// Run one state handler.
    pub fn step(&mut self, services: &mut dyn ThreadServices) -> StepOutcome {
        let Some(frame) = self.stack.last() else {
            return StepOutcome::Done(self.completed.clone().unwrap_or(ScriptValue::Null));
        };
        let state = frame.state;
        match self.dispatch(state, services) {
            Ok(Flow::Suspend) => StepOutcome::Suspended,
            Ok(Flow::Continue) => {
                if self.stack.is_empty() {
                    StepOutcome::Done(self.completed.clone().unwrap_or(ScriptValue::Null))
                } else {
                    StepOutcome::Continue
                }
            }
            Err(e) => {
                self.raise(e);
                if self.stack.is_empty() {
                    StepOutcome::Done(self.completed.clone().unwrap_or(ScriptValue::Null))
                } else {
                    StepOutcome::Continue
                }
            }
        }
    }

    /// Step to completion, for synchronous evaluation.  Only valid on
    /// processors that cannot suspend.
    pub fn run_to_completion(&mut self, services: &mut dyn ThreadServices) -> ScriptValue {
        loop {
            match self.step(services) {
                StepOutcome::Continue => {}
                StepOutcome::Done(v) => return v,
                StepOutcome::Suspended => {
                    // Unreachable for synchronous-only processors; fail
                    // loudly instead of spinning.
                    self.terminate(ScriptError::new(
                        ErrorCode::Internal,
                        "synchronous run suspended",
                    ));
                }
            }
        }
    }

    fn dispatch(&mut self, state: State, services: &mut dyn ThreadServices) -> Result<Flow, ScriptError> {
        match state {
            State::Body => self.state_body(),
            State::StatementEnd => self.state_statement_end(),
            State::ExprStatementDone => self.state_expr_statement_done(),
            State::DeclAssign => self.state_decl_assign(),
            State::ReturnValue => self.state_return_value(),
            State::IfCondition => self.state_if_condition(),
            State::IfThenDone => self.state_if_then_done(),
            State::IfElseDone => self.state_if_else_done(),
            State::WhileCondition => self.state_while_condition(),
            State::WhileCondEvaluated => self.state_while_cond_evaluated(),
            State::WhileBodyDone => self.state_while_body_done(),
            State::TryBody => self.state_try_body(),
            State::TryDone => self.state_try_done(),
            State::CatchDone => self.state_catch_done(),
            State::ConcurrentScanned => self.state_concurrent_scanned(services),
            State::FunctionDeclScanned => self.state_function_decl_scanned(),
            State::ExprTerm => self.state_expr_term(),
            State::GroupEnd => self.state_group_end(),
            State::UnaryDone => self.state_unary_done(),
            State::OperatorScan => self.state_operator_scan(),
            State::BinaryDone => self.state_binary_done(),
            State::PostfixScan => self.state_postfix_scan(),
            State::SubscriptKey => self.state_subscript_key(),
            State::ValuePostfix => self.state_value_postfix(),
            State::ValueSubscriptKey => self.state_value_subscript_key(),
            State::AssignRhsDone => self.state_assign_rhs_done(),
            State::CallArgs => self.state_call_args(services),
            State::CallArgDone => self.state_call_arg_done(services),
        }
    }

    // ── Stack plumbing ────────────────────────────────────────────────────

    fn top(&mut self) -> &mut Frame {
        self.stack.last_mut().expect("state handlers run with a frame on the stack")
    }

    fn skipping(&self) -> bool {
        self.stack.last().map(|f| f.skipping).unwrap_or(false)
    }

    fn push_frame(&mut self, mut frame: Frame) {
        frame.skipping = frame.skipping || self.skipping();
        self.stack.push(frame);
    }

    /// Set the current frame's continuation and push a child frame.
    fn push_child(&mut self, continuation: State, frame: Frame) {
        self.top().state = continuation;
        self.push_frame(frame);
    }

    fn push_expr(&mut self, continuation: State, floor: u8, statement_level: bool, extra_skip: bool) {
        let mut f = Frame::new(FrameKind::Expr, State::ExprTerm);
        f.precedence = floor;
        f.statement_level = statement_level;
        f.skipping = extra_skip;
        self.push_child(continuation, f);
    }

    fn push_single(&mut self, continuation: State, extra_skip: bool) {
        let mut f = Frame::new(FrameKind::Single, State::Body);
        f.skipping = extra_skip;
        self.push_child(continuation, f);
    }

    /// Pop the top frame, delivering `result` to the parent (or finishing
    /// the run when the stack empties).
    fn pop_with(&mut self, result: ScriptValue) {
        let frame = self.stack.pop().expect("pop with empty stack");
        if let Some(cursor) = frame.return_cursor {
            self.cursor = cursor;
        }
        match self.stack.last_mut() {
            Some(parent) => parent.result = result,
            None => self.completed = Some(result),
        }
    }

    /// Finish the current statement: Single and Function frames pop,
    /// statement-list frames loop.
    fn statement_complete(&mut self, result: ScriptValue) {
        let top = self.top();
        match top.kind {
            FrameKind::Single | FrameKind::Function => self.pop_with(result),
            _ => {
                top.result = result;
                top.state = State::Body;
            }
        }
    }

    /// The innermost context: a Function frame's call context, or the
    /// processor's main context.
    fn effective_ctx(&self) -> ContextRef {
        for frame in self.stack.iter().rev() {
            if let Some(ctx) = &frame.local_ctx {
                return ctx.clone();
            }
        }
        self.ctx.clone()
    }

    /// The error being handled by the innermost active `catch` block.
    fn innermost_caught(&self) -> Option<ScriptValue> {
        self.stack
            .iter()
            .rev()
            .find(|f| f.kind == FrameKind::Try && f.state == State::CatchDone)
            .and_then(|f| f.caught.clone())
            .map(|e| ScriptValue::Error(Box::new(e)))
    }

    // ── Error raising ─────────────────────────────────────────────────────

    /// Raise an error: route it to the nearest enclosing `try` still
    /// awaiting its body (switching everything above to skip mode so the
    /// remaining dead source is scanned, not executed), or terminate the
    /// run.  Fatal error classes bypass `try` entirely.
    fn raise(&mut self, err: ScriptError) {
        let err = err.or_at(self.cursor.position());
        if self.skipping() {
            // The skip-scan itself failed: dead source that cannot be
            // parsed past.  No catch block can be located, so terminate.
            self.terminate(err);
            return;
        }
        if !err.is_fatal() {
            // Only live (non-skipped) try frames still awaiting their body
            // can catch; a try inside a dead branch never handles anything.
            let guarded = self.stack.iter().rposition(|f| {
                f.kind == FrameKind::Try
                    && f.state == State::TryDone
                    && f.caught.is_none()
                    && !f.skipping
            });
            if let Some(i) = guarded {
                tracing::debug!(target: "strand::engine", code = %err.code, "caught by try: {}", err.message);
                self.stack[i].caught = Some(err);
                for frame in &mut self.stack[i + 1..] {
                    frame.skipping = true;
                }
                return;
            }
        }
        self.terminate(err);
    }

    fn syntax_here(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::syntax(message, self.cursor.position())
    }

    // ── Side-effect chokepoints (skip mode funnels through here) ──────────

    fn read_lvalue(&mut self, lv: &Lvalue) -> Result<ScriptValue, ScriptError> {
        if self.skipping() {
            return Ok(ScriptValue::Null);
        }
        let base = self
            .effective_ctx()
            .borrow()
            .member_by_name(&lv.name, mask::ANY)
            .ok_or_else(|| ScriptError::not_found(&lv.name))?;
        let mut value = base;
        for key in &lv.path {
            value = match value {
                ScriptValue::Json(j) => json_get(&j, key),
                ScriptValue::Error(_) => return Ok(value),
                _ => ScriptValue::Null,
            };
        }
        Ok(value)
    }

    fn assign_lvalue(&mut self, lv: &Lvalue, value: &ScriptValue) -> Result<(), ScriptError> {
        if self.skipping() {
            return Ok(());
        }
        let stored = value.assignable();
        let ctx = self.effective_ctx();
        if lv.path.is_empty() {
            ctx.borrow_mut().set_member_by_name(&lv.name, stored, 0)?;
            return Ok(());
        }
        let base = ctx
            .borrow()
            .member_by_name(&lv.name, mask::ANY)
            .ok_or_else(|| ScriptError::not_found(&lv.name))?;
        let ScriptValue::Json(mut json) = base else {
            return Err(ScriptError::invalid(format!(
                "'{}' is not structured, cannot assign member",
                lv.name
            )));
        };
        json_set_path(&mut json, &lv.path, stored.to_json())?;
        ctx.borrow_mut().set_member_by_name(&lv.name, ScriptValue::Json(json), 0)?;
        Ok(())
    }

    fn declare(&mut self, name: &str, decl: DeclKind, value: ScriptValue) -> Result<(), ScriptError> {
        if self.skipping() {
            return Ok(());
        }
        self.effective_ctx()
            .borrow_mut()
            .set_member_by_name(name, value.assignable(), decl.set_flags())
    }

    // ── Statement-level states ────────────────────────────────────────────

    fn state_body(&mut self) -> Result<Flow, ScriptError> {
        self.cursor.skip_non_code();
        let kind = self.top().kind;
        match self.cursor.current() {
            Some(';') => {
                self.cursor.advance(1);
                self.top().need_separator = false;
                if matches!(kind, FrameKind::Single | FrameKind::Function) {
                    // An empty statement satisfies a single-statement slot.
                    self.pop_with(ScriptValue::Null);
                }
                Ok(Flow::Continue)
            }
            Some('}') => match kind {
                FrameKind::Block => {
                    self.cursor.advance(1);
                    let result = std::mem::take(&mut self.top().result);
                    self.pop_with(result);
                    Ok(Flow::Continue)
                }
                FrameKind::Script => Err(self.syntax_here("unexpected '}'")),
                _ => Err(self.syntax_here("expected statement")),
            },
            None => match kind {
                FrameKind::Script => {
                    let result = std::mem::take(&mut self.top().result);
                    self.pop_with(result);
                    Ok(Flow::Continue)
                }
                FrameKind::Block => Err(self.syntax_here("missing '}'")),
                _ => Err(self.syntax_here("expected statement")),
            },
            Some('{') => {
                if self.separator_missing() {
                    return Err(self.syntax_here("missing ';'"));
                }
                self.cursor.advance(1);
                self.push_child(State::StatementEnd, Frame::new(FrameKind::Block, State::Body));
                Ok(Flow::Continue)
            }
            _ => {
                if self.separator_missing() {
                    return Err(self.syntax_here("missing ';'"));
                }
                self.dispatch_statement()
            }
        }
    }

    /// Recognise keyword-led constructs at a statement boundary, falling
    /// back to expression parsing when no keyword matches.
    fn dispatch_statement(&mut self) -> Result<Flow, ScriptError> {
        let save = self.cursor.clone();
        let Some(word) = self.cursor.parse_identifier() else {
            self.push_expr(State::ExprStatementDone, 0, true, false);
            return Ok(Flow::Continue);
        };
        match word.as_str() {
            "if" => {
                self.cursor.skip_non_code();
                if !self.eat_char('(') {
                    return Err(self.syntax_here("expected '(' after 'if'"));
                }
                self.push_expr(State::IfCondition, 0, false, false);
                Ok(Flow::Continue)
            }
            "else" => Err(self.syntax_here("'else' without preceding 'if'")),
            "while" => {
                let mut frame = Frame::new(FrameKind::Loop, State::WhileCondition);
                frame.saved_cursor = Some(self.cursor.clone());
                self.push_child(State::StatementEnd, frame);
                Ok(Flow::Continue)
            }
            "break" => self.state_break_continue(false),
            "continue" => self.state_break_continue(true),
            "return" => {
                self.cursor.skip_non_code();
                if matches!(self.cursor.current(), None | Some(';' | '}')) {
                    return self.perform_return(ScriptValue::Null);
                }
                self.push_expr(State::ReturnValue, 0, false, false);
                Ok(Flow::Continue)
            }
            "try" => {
                self.push_child(State::StatementEnd, Frame::new(FrameKind::Try, State::TryBody));
                Ok(Flow::Continue)
            }
            "catch" => Err(self.syntax_here("'catch' without preceding 'try'")),
            "var" => self.parse_declaration(DeclKind::Var),
            "let" => self.parse_declaration(DeclKind::Let),
            "glob" => self.parse_declaration(DeclKind::Glob),
            "concurrent" => self.parse_concurrent(),
            "function" => self.parse_function_decl(),
            _ => {
                self.cursor = save;
                self.push_expr(State::ExprStatementDone, 0, true, false);
                Ok(Flow::Continue)
            }
        }
    }

    fn eat_char(&mut self, ch: char) -> bool {
        if self.cursor.current() == Some(ch) {
            self.cursor.advance(1);
            true
        } else {
            false
        }
    }

    /// The previous statement requires `;`, `}`, end of text, or a line
    /// break before the next one; call with the cursor at the would-be
    /// statement start.
    fn separator_missing(&mut self) -> bool {
        let line = self.cursor.position().line;
        let top = self.top();
        top.need_separator && top.statement_line == line
    }

    /// Mark the end of a statement whose successor needs a separator.
    fn require_separator(&mut self) {
        let line = self.cursor.position().line;
        let top = self.top();
        top.need_separator = true;
        top.statement_line = line;
    }

    fn state_statement_end(&mut self) -> Result<Flow, ScriptError> {
        let result = std::mem::take(&mut self.top().result);
        self.statement_complete(result);
        Ok(Flow::Continue)
    }

    fn state_expr_statement_done(&mut self) -> Result<Flow, ScriptError> {
        let result = std::mem::take(&mut self.top().result);
        self.require_separator();
        self.statement_complete(result);
        Ok(Flow::Continue)
    }

    // ── Declarations ──────────────────────────────────────────────────────

    fn parse_declaration(&mut self, decl: DeclKind) -> Result<Flow, ScriptError> {
        self.cursor.skip_non_code();
        let Some(name) = self.cursor.parse_identifier() else {
            return Err(self.syntax_here("expected variable name"));
        };
        self.cursor.skip_non_code();
        let save = self.cursor.clone();
        let has_initializer = match self.cursor.parse_operator() {
            Some(op) if op.is_assignment() => true,
            Some(_) => {
                self.cursor = save;
                false
            }
            None => false,
        };
        if !has_initializer {
            if decl == DeclKind::Let {
                return Err(self.syntax_here("'let' requires an initializer"));
            }
            self.declare(&name, decl, ScriptValue::Null)?;
            self.require_separator();
            self.statement_complete(ScriptValue::Null);
            return Ok(Flow::Continue);
        }
        let top = self.top();
        top.identifier = name;
        top.decl = Some(decl);
        self.push_expr(State::DeclAssign, 0, false, false);
        Ok(Flow::Continue)
    }

    fn state_decl_assign(&mut self) -> Result<Flow, ScriptError> {
        let top = self.top();
        let value = std::mem::take(&mut top.result);
        let name = std::mem::take(&mut top.identifier);
        let decl = top.decl.take().expect("declaration state without kind");
        // Continuation first, for re-entry after a raised write error.
        top.state = State::Body;
        self.require_separator();
        self.declare(&name, decl, value.clone())?;
        self.statement_complete(value);
        Ok(Flow::Continue)
    }

    // ── return / break / continue ─────────────────────────────────────────

    fn state_return_value(&mut self) -> Result<Flow, ScriptError> {
        let value = std::mem::take(&mut self.top().result);
        self.perform_return(value)
    }

    fn perform_return(&mut self, value: ScriptValue) -> Result<Flow, ScriptError> {
        if self.skipping() {
            self.require_separator();
            self.statement_complete(ScriptValue::Null);
            return Ok(Flow::Continue);
        }
        match self.stack.iter().rposition(|f| f.kind == FrameKind::Function) {
            Some(i) => {
                // Unwind to the function frame and pop it with the value.
                self.stack.truncate(i + 1);
                self.pop_with(value);
            }
            None => {
                self.stack.clear();
                self.completed = Some(value);
            }
        }
        Ok(Flow::Continue)
    }

    fn state_break_continue(&mut self, is_continue: bool) -> Result<Flow, ScriptError> {
        if self.skipping() {
            self.require_separator();
            self.statement_complete(ScriptValue::Null);
            return Ok(Flow::Continue);
        }
        // Nearest enclosing loop frame, not crossing function boundaries.
        let mut target = None;
        for (i, frame) in self.stack.iter().enumerate().rev() {
            match frame.kind {
                FrameKind::Loop => {
                    target = Some(i);
                    break;
                }
                FrameKind::Function => break,
                _ => {}
            }
        }
        let Some(i) = target else {
            let what = if is_continue { "continue" } else { "break" };
            return Err(self.syntax_here(format!("'{what}' outside of a loop")));
        };
        if !is_continue {
            self.stack[i].exiting = true;
        }
        // The rest of the loop body is scanned, not executed.  For
        // `continue` that is the whole effect: the loop frame re-enters its
        // condition once the body scan completes.
        for frame in &mut self.stack[i + 1..] {
            frame.skipping = true;
        }
        self.require_separator();
        self.statement_complete(ScriptValue::Null);
        Ok(Flow::Continue)
    }

    // ── if / else ─────────────────────────────────────────────────────────

    fn state_if_condition(&mut self) -> Result<Flow, ScriptError> {
        self.cursor.skip_non_code();
        if !self.eat_char(')') {
            return Err(self.syntax_here("expected ')' after condition"));
        }
        let top = self.top();
        let taken = std::mem::take(&mut top.result).bool_value();
        top.branch_taken = taken;
        self.push_single(State::IfThenDone, !taken);
        Ok(Flow::Continue)
    }

    fn state_if_then_done(&mut self) -> Result<Flow, ScriptError> {
        let save = self.cursor.clone();
        self.cursor.skip_non_code();
        if self.cursor.current() == Some(';') {
            self.cursor.advance(1);
            self.cursor.skip_non_code();
        }
        if self.cursor.peek_identifier().as_deref() == Some("else") {
            self.cursor.parse_identifier();
            let top = self.top();
            let taken = top.branch_taken;
            // Park the then-branch result; the scanned else branch must not
            // clobber it.
            top.prev_result = std::mem::take(&mut top.result);
            self.push_single(State::IfElseDone, taken);
            return Ok(Flow::Continue);
        }
        self.cursor = save;
        let top = self.top();
        let taken = top.branch_taken;
        let result = std::mem::take(&mut top.result);
        // An untaken branch was only scanned; its result is meaningless.
        self.statement_complete(if taken { result } else { ScriptValue::Null });
        Ok(Flow::Continue)
    }

    fn state_if_else_done(&mut self) -> Result<Flow, ScriptError> {
        let top = self.top();
        let else_result = std::mem::take(&mut top.result);
        let then_result = std::mem::take(&mut top.prev_result);
        let result = if top.branch_taken { then_result } else { else_result };
        self.statement_complete(result);
        Ok(Flow::Continue)
    }

    // ── while ─────────────────────────────────────────────────────────────

    fn state_while_condition(&mut self) -> Result<Flow, ScriptError> {
        self.cursor.skip_non_code();
        if !self.eat_char('(') {
            return Err(self.syntax_here("expected '(' after 'while'"));
        }
        self.push_expr(State::WhileCondEvaluated, 0, false, false);
        Ok(Flow::Continue)
    }

    fn state_while_cond_evaluated(&mut self) -> Result<Flow, ScriptError> {
        self.cursor.skip_non_code();
        if !self.eat_char(')') {
            return Err(self.syntax_here("expected ')' after condition"));
        }
        let top = self.top();
        let truth = std::mem::take(&mut top.result).bool_value();
        if !truth {
            top.exiting = true;
        }
        // A false condition still scans the body once so the cursor ends
        // up after the loop.
        self.push_single(State::WhileBodyDone, !truth);
        Ok(Flow::Continue)
    }

    fn state_while_body_done(&mut self) -> Result<Flow, ScriptError> {
        let top = self.top();
        if top.exiting || top.skipping {
            self.pop_with(ScriptValue::Null);
            return Ok(Flow::Continue);
        }
        let cond = top
            .saved_cursor
            .clone()
            .ok_or_else(|| ScriptError::new(ErrorCode::Internal, "loop frame lost its condition"))?;
        self.cursor = cond;
        self.top().state = State::WhileCondition;
        Ok(Flow::Continue)
    }

    // ── try / catch ───────────────────────────────────────────────────────

    fn state_try_body(&mut self) -> Result<Flow, ScriptError> {
        self.push_single(State::TryDone, false);
        Ok(Flow::Continue)
    }

    fn state_try_done(&mut self) -> Result<Flow, ScriptError> {
        let save = self.cursor.clone();
        self.cursor.skip_non_code();
        if self.cursor.current() == Some(';') {
            self.cursor.advance(1);
            self.cursor.skip_non_code();
        }
        if self.cursor.peek_identifier().as_deref() == Some("catch") {
            self.cursor.parse_identifier();
            // Optional `as <name>` binds the caught error.
            let mut errvar = None;
            let before_as = self.cursor.clone();
            self.cursor.skip_non_code();
            if self.cursor.peek_identifier().as_deref() == Some("as") {
                self.cursor.parse_identifier();
                self.cursor.skip_non_code();
                match self.cursor.parse_identifier() {
                    Some(name) => errvar = Some(name),
                    None => return Err(self.syntax_here("expected identifier after 'as'")),
                }
            } else {
                self.cursor = before_as;
            }
            let caught = self.top().caught.clone();
            let live = caught.is_some() && !self.skipping();
            if live {
                if let Some(name) = errvar {
                    let err = caught.clone().expect("live catch has an error");
                    self.effective_ctx().borrow_mut().set_member_by_name(
                        &name,
                        ScriptValue::Error(Box::new(err)),
                        setflags::CREATE,
                    )?;
                }
            }
            // Park the try-body result; the catch block is scanned either
            // way but only executes (and supplies the result) when an error
            // arrived.
            let top = self.top();
            top.prev_result = std::mem::take(&mut top.result);
            self.push_single(State::CatchDone, !live);
            return Ok(Flow::Continue);
        }
        self.cursor = save;
        // No catch clause: re-raise (the nearest outer try, or thread
        // termination), or simply finish with the body's result.
        self.top().state = State::CatchDone;
        match self.top().caught.take() {
            Some(err) => Err(err),
            None => {
                let result = std::mem::take(&mut self.top().result);
                self.pop_with(result);
                Ok(Flow::Continue)
            }
        }
    }

    fn state_catch_done(&mut self) -> Result<Flow, ScriptError> {
        let top = self.top();
        let catch_result = std::mem::take(&mut top.result);
        let try_result = std::mem::take(&mut top.prev_result);
        let result = if top.caught.is_some() { catch_result } else { try_result };
        self.pop_with(result);
        Ok(Flow::Continue)
    }

    // ── concurrent ────────────────────────────────────────────────────────

    fn parse_concurrent(&mut self) -> Result<Flow, ScriptError> {
        self.cursor.skip_non_code();
        let mut name = String::new();
        if self.cursor.peek_identifier().as_deref() == Some("as") {
            self.cursor.parse_identifier();
            self.cursor.skip_non_code();
            match self.cursor.parse_identifier() {
                Some(n) => name = n,
                None => return Err(self.syntax_here("expected identifier after 'as'")),
            }
            self.cursor.skip_non_code();
        }
        if self.cursor.current() != Some('{') {
            return Err(self.syntax_here("expected '{' after 'concurrent'"));
        }
        let saved = self.cursor.clone();
        let top = self.top();
        top.identifier = name;
        top.saved_cursor = Some(saved);
        // Scan the block without executing; the forked thread runs it.
        self.push_single(State::ConcurrentScanned, true);
        Ok(Flow::Continue)
    }

    fn state_concurrent_scanned(&mut self, services: &mut dyn ThreadServices) -> Result<Flow, ScriptError> {
        let top = self.top();
        let name = std::mem::take(&mut top.identifier);
        let body = top.saved_cursor.take();
        let mut result = ScriptValue::Null;
        if !self.skipping() {
            let body = body.ok_or_else(|| {
                ScriptError::new(ErrorCode::Internal, "concurrent frame lost its block")
            })?;
            let handle = services.spawn_concurrent(body, &self.effective_ctx())?;
            result = ScriptValue::Thread(handle);
            if !name.is_empty() {
                self.effective_ctx().borrow_mut().set_member_by_name(
                    &name,
                    result.clone(),
                    setflags::CREATE,
                )?;
            }
        }
        self.statement_complete(result);
        Ok(Flow::Continue)
    }

    // ── function declarations ─────────────────────────────────────────────

    fn parse_function_decl(&mut self) -> Result<Flow, ScriptError> {
        self.cursor.skip_non_code();
        let Some(name) = self.cursor.parse_identifier() else {
            return Err(self.syntax_here("expected function name"));
        };
        self.cursor.skip_non_code();
        if !self.eat_char('(') {
            return Err(self.syntax_here("expected '(' after function name"));
        }
        let mut params = Vec::new();
        loop {
            self.cursor.skip_non_code();
            if self.eat_char(')') {
                break;
            }
            let Some(param) = self.cursor.parse_identifier() else {
                return Err(self.syntax_here("expected parameter name"));
            };
            params.push(param);
            self.cursor.skip_non_code();
            if self.eat_char(',') {
                continue;
            }
            if self.eat_char(')') {
                break;
            }
            return Err(self.syntax_here("expected ',' or ')' in parameter list"));
        }
        self.cursor.skip_non_code();
        if self.cursor.current() != Some('{') {
            return Err(self.syntax_here("expected '{' to start function body"));
        }
        let saved = self.cursor.clone();
        let top = self.top();
        top.identifier = name;
        top.params = params;
        top.saved_cursor = Some(saved);
        // The body is scanned now and executed at call time.
        self.push_single(State::FunctionDeclScanned, true);
        Ok(Flow::Continue)
    }

    fn state_function_decl_scanned(&mut self) -> Result<Flow, ScriptError> {
        let top = self.top();
        let name = std::mem::take(&mut top.identifier);
        let params = std::mem::take(&mut top.params);
        let body = top.saved_cursor.take();
        if !self.skipping() {
            let body = body.ok_or_else(|| {
                ScriptError::new(ErrorCode::Internal, "function frame lost its body")
            })?;
            let func = ScriptValue::Executable(Executable::Script(Rc::new(ScriptFunction {
                name: name.clone(),
                params,
                body,
            })));
            self.effective_ctx()
                .borrow_mut()
                .set_member_by_name(&name, func, setflags::CREATE)?;
        }
        self.statement_complete(ScriptValue::Null);
        Ok(Flow::Continue)
    }

    // ── Expression states ─────────────────────────────────────────────────

    fn state_expr_term(&mut self) -> Result<Flow, ScriptError> {
        self.cursor.skip_non_code();
        match self.cursor.current() {
            None => Err(self.syntax_here("expected expression")),
            Some('(') => {
                self.cursor.advance(1);
                self.push_expr(State::GroupEnd, 0, false, false);
                Ok(Flow::Continue)
            }
            Some('"' | '\'') => {
                let s = self.cursor.parse_string_literal()?;
                let top = self.top();
                top.result = ScriptValue::Text(s);
                top.state = State::OperatorScan;
                Ok(Flow::Continue)
            }
            Some(c) if c.is_ascii_digit() => {
                let n = self.cursor.parse_numeric_literal()?;
                let top = self.top();
                top.result = ScriptValue::Number(n);
                top.state = State::OperatorScan;
                Ok(Flow::Continue)
            }
            Some('{' | '[') => {
                let j = self.cursor.parse_structured_literal()?;
                let top = self.top();
                top.result = ScriptValue::Json(j);
                top.state = State::ValuePostfix;
                Ok(Flow::Continue)
            }
            Some('-') => {
                self.cursor.advance(1);
                self.top().unary_op = Some(UnaryOp::Neg);
                self.push_expr(State::UnaryDone, UNARY_PRECEDENCE, false, false);
                Ok(Flow::Continue)
            }
            Some('!') => {
                self.cursor.advance(1);
                self.top().unary_op = Some(UnaryOp::Not);
                self.push_expr(State::UnaryDone, UNARY_PRECEDENCE, false, false);
                Ok(Flow::Continue)
            }
            Some(c) if c.is_ascii_alphabetic() => {
                let word = self.cursor.parse_identifier().expect("alphabetic start");
                let top = self.top();
                match word.as_str() {
                    "true" | "yes" => {
                        top.result = ScriptValue::Number(1.0);
                        top.state = State::OperatorScan;
                    }
                    "false" | "no" => {
                        top.result = ScriptValue::Number(0.0);
                        top.state = State::OperatorScan;
                    }
                    "null" | "undefined" => {
                        top.result = ScriptValue::Null;
                        top.state = State::OperatorScan;
                    }
                    _ => {
                        top.lvalue = Some(Lvalue { name: word, path: Vec::new() });
                        top.state = State::PostfixScan;
                    }
                }
                Ok(Flow::Continue)
            }
            Some(c) => Err(self.syntax_here(format!("unexpected '{c}' in expression"))),
        }
    }

    fn state_group_end(&mut self) -> Result<Flow, ScriptError> {
        self.cursor.skip_non_code();
        if !self.eat_char(')') {
            return Err(self.syntax_here("expected ')'"));
        }
        self.top().state = State::ValuePostfix;
        Ok(Flow::Continue)
    }

    fn state_unary_done(&mut self) -> Result<Flow, ScriptError> {
        let top = self.top();
        let op = top.unary_op.take().expect("unary state without operator");
        let operand = std::mem::take(&mut top.result);
        // Continuation first: a raised error re-enters this frame at the
        // operator scan, with the dead remainder scanned in skip mode.
        top.state = State::OperatorScan;
        if self.skipping() {
            return Ok(Flow::Continue);
        }
        let result = apply_unary(op, &operand)?;
        self.top().result = result;
        Ok(Flow::Continue)
    }

    /// Scan for a binary operator after a completed term.  An operator at
    /// or below the frame's precedence floor belongs to the enclosing
    /// expression, so the frame pops instead.
    fn state_operator_scan(&mut self) -> Result<Flow, ScriptError> {
        self.cursor.skip_non_code();
        let save = self.cursor.clone();
        let Some(op) = self.cursor.parse_operator() else {
            let result = std::mem::take(&mut self.top().result);
            self.pop_with(result);
            return Ok(Flow::Continue);
        };
        let Some(bop) = op.as_binary() else {
            return Err(ScriptError::syntax("assignment not allowed here", save.position()));
        };
        let floor = self.top().precedence;
        if bop.precedence() <= floor {
            self.cursor = save;
            let result = std::mem::take(&mut self.top().result);
            self.pop_with(result);
            return Ok(Flow::Continue);
        }
        let top = self.top();
        let lhs = std::mem::take(&mut top.result);
        // Short-circuiting and error propagation: the right-hand side is
        // scanned but not evaluated when its value cannot matter.
        let rhs_skip = lhs.is_error()
            || match bop {
                BinaryOp::And => !lhs.bool_value(),
                BinaryOp::Or => lhs.bool_value(),
                _ => false,
            };
        top.pending_op = Some(bop);
        top.prev_result = lhs;
        self.push_expr(State::BinaryDone, bop.precedence(), false, rhs_skip);
        Ok(Flow::Continue)
    }

    fn state_binary_done(&mut self) -> Result<Flow, ScriptError> {
        let top = self.top();
        let op = top.pending_op.take().expect("binary state without operator");
        let rhs = std::mem::take(&mut top.result);
        let lhs = std::mem::take(&mut top.prev_result);
        // Continuation first, so a raised error (division by zero, invalid
        // operands) re-enters at the operator scan in skip mode.
        top.state = State::OperatorScan;
        if self.skipping() {
            return Ok(Flow::Continue);
        }
        let result = match op {
            BinaryOp::And => {
                if lhs.is_error() {
                    lhs
                } else if !lhs.bool_value() {
                    false.into()
                } else if rhs.is_error() {
                    rhs
                } else {
                    rhs.bool_value().into()
                }
            }
            BinaryOp::Or => {
                if lhs.is_error() {
                    lhs
                } else if lhs.bool_value() {
                    true.into()
                } else if rhs.is_error() {
                    rhs
                } else {
                    rhs.bool_value().into()
                }
            }
            _ => apply_binary(op, &lhs, &rhs)?,
        };
        self.top().result = result;
        Ok(Flow::Continue)
    }

    // ── Postfix chain over an unresolved identifier ───────────────────────

    fn state_postfix_scan(&mut self) -> Result<Flow, ScriptError> {
        self.cursor.skip_non_code();
        match self.cursor.current() {
            Some('.') => {
                self.cursor.advance(1);
                let Some(field) = self.cursor.parse_identifier() else {
                    return Err(self.syntax_here("expected member name after '.'"));
                };
                let top = self.top();
                let lv = top.lvalue.as_mut().expect("postfix scan without lvalue");
                lv.path.push(PathKey::Field(field));
                Ok(Flow::Continue)
            }
            Some('[') => {
                self.cursor.advance(1);
                self.push_expr(State::SubscriptKey, 0, false, false);
                Ok(Flow::Continue)
            }
            Some('(') => {
                let top = self.top();
                let has_path = top
                    .lvalue
                    .as_ref()
                    .map(|lv| !lv.path.is_empty())
                    .unwrap_or(false);
                if has_path {
                    return Err(self.syntax_here("member functions are not supported"));
                }
                let lv = self.top().lvalue.take().expect("postfix scan without lvalue");
                self.cursor.advance(1);
                let top = self.top();
                top.identifier = lv.name;
                top.args.clear();
                top.state = State::CallArgs;
                Ok(Flow::Continue)
            }
            _ => {
                // Lookahead-then-commit: at an assignable position, an
                // assignment operator switches this term to write mode.
                let top = self.top();
                if top.statement_level && top.precedence == 0 {
                    let save = self.cursor.clone();
                    match self.cursor.parse_operator() {
                        Some(op) if op.is_assignment() => {
                            self.push_expr(State::AssignRhsDone, 0, false, false);
                            return Ok(Flow::Continue);
                        }
                        Some(_) => self.cursor = save,
                        None => {}
                    }
                }
                let lv = self.top().lvalue.take().expect("postfix scan without lvalue");
                // Continuation first: an unresolved name raises, and the
                // rest of the expression is then scanned in skip mode.
                self.top().state = State::OperatorScan;
                let value = self.read_lvalue(&lv)?;
                self.top().result = value;
                Ok(Flow::Continue)
            }
        }
    }

    fn state_subscript_key(&mut self) -> Result<Flow, ScriptError> {
        let top = self.top();
        let key = std::mem::take(&mut top.result);
        if !self.skipping() {
            let key = PathKey::from_value(&key)?;
            let top = self.top();
            let lv = top.lvalue.as_mut().expect("subscript without lvalue");
            lv.path.push(key);
        }
        self.cursor.skip_non_code();
        if self.eat_char(',') {
            self.push_expr(State::SubscriptKey, 0, false, false);
            return Ok(Flow::Continue);
        }
        if self.eat_char(']') {
            self.top().state = State::PostfixScan;
            return Ok(Flow::Continue);
        }
        Err(self.syntax_here("expected ',' or ']' in subscript"))
    }

    fn state_assign_rhs_done(&mut self) -> Result<Flow, ScriptError> {
        let top = self.top();
        let rhs = std::mem::take(&mut top.result);
        let lv = top.lvalue.take().expect("assignment without target");
        // Continuation first, for re-entry after a raised write error.
        top.state = State::OperatorScan;
        self.assign_lvalue(&lv, &rhs)?;
        self.pop_with(rhs);
        Ok(Flow::Continue)
    }

    // ── Postfix chain over a resolved value ───────────────────────────────

    fn state_value_postfix(&mut self) -> Result<Flow, ScriptError> {
        self.cursor.skip_non_code();
        match self.cursor.current() {
            Some('.') => {
                self.cursor.advance(1);
                let Some(field) = self.cursor.parse_identifier() else {
                    return Err(self.syntax_here("expected member name after '.'"));
                };
                if !self.skipping() {
                    let top = self.top();
                    let base = std::mem::take(&mut top.result);
                    top.result = match base {
                        ScriptValue::Json(j) => json_get(&j, &PathKey::Field(field)),
                        e @ ScriptValue::Error(_) => e,
                        _ => ScriptValue::Null,
                    };
                }
                Ok(Flow::Continue)
            }
            Some('[') => {
                self.cursor.advance(1);
                let top = self.top();
                top.prev_result = std::mem::take(&mut top.result);
                self.push_expr(State::ValueSubscriptKey, 0, false, false);
                Ok(Flow::Continue)
            }
            Some('(') => Err(self.syntax_here("value is not callable")),
            _ => {
                self.top().state = State::OperatorScan;
                Ok(Flow::Continue)
            }
        }
    }

    fn state_value_subscript_key(&mut self) -> Result<Flow, ScriptError> {
        let top = self.top();
        let key = std::mem::take(&mut top.result);
        let base = std::mem::take(&mut top.prev_result);
        let applied = if self.skipping() {
            ScriptValue::Null
        } else {
            let key = PathKey::from_value(&key)?;
            match base {
                ScriptValue::Json(j) => json_get(&j, &key),
                e @ ScriptValue::Error(_) => e,
                _ => ScriptValue::Null,
            }
        };
        self.cursor.skip_non_code();
        if self.eat_char(',') {
            let top = self.top();
            top.prev_result = applied;
            self.push_expr(State::ValueSubscriptKey, 0, false, false);
            return Ok(Flow::Continue);
        }
        if self.eat_char(']') {
            let top = self.top();
            top.result = applied;
            top.state = State::ValuePostfix;
            return Ok(Flow::Continue);
        }
        Err(self.syntax_here("expected ',' or ']' in subscript"))
    }

    // ── Calls ─────────────────────────────────────────────────────────────

    fn state_call_args(&mut self, services: &mut dyn ThreadServices) -> Result<Flow, ScriptError> {
        self.cursor.skip_non_code();
        if self.eat_char(')') {
            return self.invoke_call(services);
        }
        self.push_expr(State::CallArgDone, 0, false, false);
        Ok(Flow::Continue)
    }

    fn state_call_arg_done(&mut self, services: &mut dyn ThreadServices) -> Result<Flow, ScriptError> {
        let top = self.top();
        let arg = std::mem::take(&mut top.result);
        top.args.push(arg);
        self.cursor.skip_non_code();
        if self.eat_char(',') {
            self.push_expr(State::CallArgDone, 0, false, false);
            return Ok(Flow::Continue);
        }
        if self.eat_char(')') {
            return self.invoke_call(services);
        }
        Err(self.syntax_here("expected ',' or ')' in argument list"))
    }

    /// Resolve and invoke the collected call.  The frame's continuation is
    /// set first so a synchronous result, an asynchronous resume, and a
    /// user-function return all land in the same place.
    fn invoke_call(&mut self, services: &mut dyn ThreadServices) -> Result<Flow, ScriptError> {
        self.top().state = State::ValuePostfix;
        if self.skipping() {
            self.top().result = ScriptValue::Null;
            return Ok(Flow::Continue);
        }
        let name = std::mem::take(&mut self.top().identifier);
        let callee = self
            .effective_ctx()
            .borrow()
            .member_by_name(&name, mask::EXECUTABLE)
            .ok_or_else(|| {
                ScriptError::new(ErrorCode::NotFound, format!("function '{name}' not found"))
            })?;
        let ScriptValue::Executable(exec) = callee else {
            return Err(ScriptError::new(
                ErrorCode::Internal,
                "executable lookup returned a non-executable",
            ));
        };
        let args = std::mem::take(&mut self.top().args);
        match exec {
            Executable::Native(f) => {
                if f.signature.is_async() && self.sync_only {
                    return Err(ScriptError::invalid(format!(
                        "function '{name}' requires asynchronous execution"
                    )));
                }
                let mut call = CallContext {
                    args,
                    ctx: self.effective_ctx(),
                    services,
                    caught: self.innermost_caught(),
                };
                match f.invoke(&mut call)? {
                    BuiltinOutcome::Value(v) => {
                        self.top().result = v;
                        Ok(Flow::Continue)
                    }
                    BuiltinOutcome::Suspended => Ok(Flow::Suspend),
                }
            }
            Executable::Script(func) => {
                let call_ctx = ExecutionContext::new_for_call(&self.ctx, args.clone());
                for (i, param) in func.params.iter().enumerate() {
                    let v = args.get(i).cloned().unwrap_or(ScriptValue::Null);
                    call_ctx
                        .borrow_mut()
                        .set_member_by_name(param, v, setflags::CREATE)?;
                }
                let mut frame = Frame::new(FrameKind::Function, State::Body);
                frame.local_ctx = Some(call_ctx);
                frame.return_cursor = Some(self.cursor.clone());
                self.cursor = func.body.clone();
                self.push_frame(frame);
                Ok(Flow::Continue)
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::ScriptingDomain;
    use crate::engine::thread::NullServices;

    fn eval_in(src: &str, ctx: &ContextRef) -> ScriptValue {
        let mut p = SourceProcessor::new(src, ctx.clone()).synchronous_only();
        p.run_to_completion(&mut NullServices)
    }

    fn eval(src: &str) -> ScriptValue {
        let ctx = ExecutionContext::new(ScriptingDomain::with_standard_functions());
        eval_in(src, &ctx)
    }

    fn num(src: &str) -> f64 {
        match eval(src) {
            ScriptValue::Number(n) => n,
            other => panic!("{src:?} evaluated to {other:?}, expected number"),
        }
    }

    #[test]
    fn literals() {
        assert_eq!(num("42"), 42.0);
        assert_eq!(num("0x2A"), 42.0);
        assert_eq!(num("42.0"), 42.0);
        assert_eq!(eval("'hello'"), ScriptValue::text("hello"));
        assert_eq!(eval("\"a\\tb\""), ScriptValue::text("a\tb"));
        assert!(!eval("undefined").is_defined());
        assert_eq!(num("true"), 1.0);
        assert_eq!(num("false"), 0.0);
    }

    #[test]
    fn precedence_climbing() {
        assert_eq!(num("12 * 3 + 7"), 43.0);
        assert_eq!(num("12 * (3 + 7)"), 120.0);
        assert_eq!(num("2 + 3 * 4"), 14.0);
        assert_eq!(num("10 - 4 - 3"), 3.0);
        assert_eq!(num("100 / 10 / 2"), 5.0);
        assert_eq!(num("1 + 2 == 3"), 1.0);
    }

    #[test]
    fn unary_operators() {
        assert_eq!(num("-5"), -5.0);
        assert_eq!(num("-(3 + 2)"), -5.0);
        assert_eq!(num("!0"), 1.0);
        assert_eq!(num("!3"), 0.0);
        assert_eq!(num("-5 + 10"), 5.0);
    }

    #[test]
    fn logical_short_circuit_skips_side_effects() {
        let ctx = ExecutionContext::new(ScriptingDomain::with_standard_functions());
        eval_in("var hits := 0\nfunction bump() { hits := hits + 1; return true }", &ctx);
        assert_eq!(eval_in("false && bump()", &ctx), ScriptValue::Number(0.0));
        assert_eq!(eval_in("true || bump()", &ctx), ScriptValue::Number(1.0));
        assert_eq!(eval_in("hits", &ctx), ScriptValue::Number(0.0));
        assert_eq!(eval_in("true && bump()", &ctx), ScriptValue::Number(1.0));
        assert_eq!(eval_in("hits", &ctx), ScriptValue::Number(1.0));
    }

    #[test]
    fn variables_and_declarations() {
        let ctx = ExecutionContext::new(ScriptingDomain::with_standard_functions());
        assert_eq!(eval_in("var x := 5\nx + 1", &ctx), ScriptValue::Number(6.0));
        assert_eq!(eval_in("let x := 9\nx", &ctx), ScriptValue::Number(9.0));
        // let requires an existing binding.
        let e = eval_in("let nope := 1", &ctx);
        assert_eq!(e.as_error().unwrap().code, ErrorCode::NotCreated);
    }

    #[test]
    fn glob_declares_once() {
        let domain = ScriptingDomain::with_standard_functions();
        let a = ExecutionContext::new(domain.clone());
        let b = ExecutionContext::new(domain);
        eval_in("glob counter := 10", &a);
        // Visible from another context, and re-declaration keeps the value.
        assert_eq!(eval_in("glob counter := 99\ncounter", &b), ScriptValue::Number(10.0));
    }

    #[test]
    fn assignment_vs_comparison() {
        let ctx = ExecutionContext::new(ScriptingDomain::with_standard_functions());
        eval_in("var x := 1", &ctx);
        // Statement-level '=' assigns.
        assert_eq!(eval_in("x = 5\nx", &ctx), ScriptValue::Number(5.0));
        // Expression-level '=' compares.
        assert_eq!(eval_in("(x = 5)", &ctx), ScriptValue::Number(1.0));
        assert_eq!(eval_in("(x = 6)", &ctx), ScriptValue::Number(0.0));
        // '==' compares everywhere.
        assert_eq!(eval_in("x == 5", &ctx), ScriptValue::Number(1.0));
        assert_eq!(eval_in("x", &ctx), ScriptValue::Number(5.0));
    }

    #[test]
    fn assignment_to_unknown_is_not_created() {
        let out = eval("ghost := 1");
        assert_eq!(out.as_error().unwrap().code, ErrorCode::NotCreated);
    }

    #[test]
    fn if_else_branches() {
        assert_eq!(eval("var r := 0\nif (1 < 2) r := 10 else r := 20\nr"), ScriptValue::Number(10.0));
        assert_eq!(eval("var r := 0\nif (1 > 2) r := 10 else r := 20\nr"), ScriptValue::Number(20.0));
        assert_eq!(
            eval("var r := 0\nif (false) { r := 1 } else if (true) { r := 2 } else { r := 3 }\nr"),
            ScriptValue::Number(2.0)
        );
    }

    #[test]
    fn skip_mode_never_executes_dead_branch() {
        let ctx = ExecutionContext::new(ScriptingDomain::with_standard_functions());
        eval_in(
            "var calls := 0\nfunction sideEffect() { calls := calls + 1; return 1 }",
            &ctx,
        );
        let out = eval_in("var x := 7\nif (false) { x := sideEffect() }\nx", &ctx);
        assert_eq!(out, ScriptValue::Number(7.0));
        assert_eq!(eval_in("calls", &ctx), ScriptValue::Number(0.0));
    }

    #[test]
    fn skipped_branch_is_still_fully_scanned() {
        // The dead branch contains every construct; a scan bug would
        // surface as a syntax error or a wrong final result.
        let out = eval(
            "var x := 1\n\
             if (false) {\n\
                 var y := {\"a\": [1, 2]}\n\
                 while (y.a[0] < 10) { y.a[0] := y.a[0] + 1; break }\n\
                 try throw('inner') catch as e { x := 99 }\n\
             }\n\
             x + 1",
        );
        assert_eq!(out, ScriptValue::Number(2.0));
    }

    #[test]
    fn while_loops() {
        assert_eq!(
            eval("var i := 0\nvar sum := 0\nwhile (i < 5) { sum := sum + i; i := i + 1 }\nsum"),
            ScriptValue::Number(10.0)
        );
    }

    #[test]
    fn break_and_continue() {
        assert_eq!(
            eval("var i := 0\nwhile (true) { i := i + 1; if (i >= 3) break }\ni"),
            ScriptValue::Number(3.0)
        );
        assert_eq!(
            eval(
                "var i := 0\nvar sum := 0\n\
                 while (i < 5) { i := i + 1; if (i == 2) continue; sum := sum + i }\n\
                 sum"
            ),
            ScriptValue::Number(13.0)
        );
    }

    #[test]
    fn break_outside_loop_is_syntax_error() {
        let out = eval("break");
        assert_eq!(out.as_error().unwrap().code, ErrorCode::Syntax);
    }

    #[test]
    fn return_ends_script_with_value() {
        assert_eq!(eval("return 5\n99"), ScriptValue::Number(5.0));
        assert!(!eval("return").is_defined());
    }

    #[test]
    fn try_catch_division_by_zero() {
        assert_eq!(eval("try 1 / 0 catch return 'caught'"), ScriptValue::text("caught"));
    }

    #[test]
    fn uncaught_error_terminates_with_error_result() {
        let out = eval("1 / 0");
        assert_eq!(out.as_error().unwrap().code, ErrorCode::DivisionByZero);
    }

    #[test]
    fn catch_as_binds_error() {
        let out = eval("try throw('boom') catch as e errormessage(e)");
        assert_eq!(out, ScriptValue::text("boom"));
    }

    #[test]
    fn error_builtin_reads_caught_error() {
        let out = eval("try 1/0 catch errormessage(error())");
        assert_eq!(out, ScriptValue::text("division by zero"));
    }

    #[test]
    fn catch_block_is_scanned_when_no_error() {
        // The catch body must parse (cursor lands after it) but not run.
        assert_eq!(
            eval("var x := 1\ntry x := 2 catch { x := 99 }\nx"),
            ScriptValue::Number(2.0)
        );
    }

    #[test]
    fn nested_try_rethrows_to_outer() {
        let out = eval(
            "var tag := ''\n\
             try {\n\
                 try 1/0 catch as e throw(e)\n\
             } catch as outer tag := 'outer'\n\
             tag",
        );
        assert_eq!(out, ScriptValue::text("outer"));
    }

    #[test]
    fn error_values_flow_without_raising() {
        // error() makes a value; only throw() raises it.
        assert_eq!(eval("var e := error('x')\ntypename(e)"), ScriptValue::text("error"));
        // Operators propagate an error operand instead of comparing it.
        let out = eval("error('x') == 1");
        assert_eq!(out.as_error().unwrap().message, "x");
    }

    #[test]
    fn null_propagation_through_operators() {
        assert!(!eval("undefined + 1").is_defined());
        assert!(!eval("undefined < 1").is_defined());
        assert_eq!(num("undefined == undefined"), 1.0);
        assert_eq!(num("undefined == 5"), 0.0);
    }

    #[test]
    fn structured_literals_and_member_access() {
        // A statement-leading '{' is a block, so object literals at
        // statement level go through a variable or parentheses.
        assert_eq!(num("var v := {\"a\": {\"b\": 7}}\nv.a.b"), 7.0);
        assert_eq!(num("[10, 20, 30][1]"), 20.0);
        let ctx = ExecutionContext::new(ScriptingDomain::with_standard_functions());
        eval_in("var cfg := {\"limits\": {\"high\": 21.5}}", &ctx);
        assert_eq!(eval_in("cfg.limits.high", &ctx), ScriptValue::Number(21.5));
        assert_eq!(eval_in("cfg[\"limits\"][\"high\"]", &ctx), ScriptValue::Number(21.5));
        assert_eq!(eval_in("cfg[\"limits\", \"high\"]", &ctx), ScriptValue::Number(21.5));
    }

    #[test]
    fn subscript_assignment() {
        let ctx = ExecutionContext::new(ScriptingDomain::with_standard_functions());
        eval_in("var d := {\"a\": 1}", &ctx);
        eval_in("d.a := 2", &ctx);
        assert_eq!(eval_in("d.a", &ctx), ScriptValue::Number(2.0));
        eval_in("d[\"b\"] := 3", &ctx);
        assert_eq!(eval_in("d.b", &ctx), ScriptValue::Number(3.0));
    }

    #[test]
    fn assignment_deep_copies_structured_values() {
        let ctx = ExecutionContext::new(ScriptingDomain::with_standard_functions());
        eval_in("var a := {\"n\": 1}\nvar b := a\nb.n := 2", &ctx);
        assert_eq!(eval_in("a.n", &ctx), ScriptValue::Number(1.0));
        assert_eq!(eval_in("b.n", &ctx), ScriptValue::Number(2.0));
    }

    #[test]
    fn builtin_calls() {
        assert_eq!(num("strlen('hello')"), 5.0);
        assert_eq!(num("max(1, 9, 4)"), 9.0);
        assert_eq!(eval("uppercase('abc')"), ScriptValue::text("ABC"));
    }

    #[test]
    fn unknown_function_is_not_found() {
        let out = eval("noSuchFunction(1)");
        assert_eq!(out.as_error().unwrap().code, ErrorCode::NotFound);
    }

    #[test]
    fn unknown_variable_is_not_found() {
        let out = eval("mystery + 1");
        assert_eq!(out.as_error().unwrap().code, ErrorCode::NotFound);
    }

    #[test]
    fn user_functions() {
        let out = eval(
            "function double(n) { return n * 2 }\n\
             function add(a, b) { return a + b }\n\
             add(double(3), 4)",
        );
        assert_eq!(out, ScriptValue::Number(10.0));
    }

    #[test]
    fn user_function_locals_do_not_leak() {
        let out = eval(
            "var x := 1\n\
             function f() { var x := 99; return x }\n\
             f()\n\
             x",
        );
        assert_eq!(out, ScriptValue::Number(1.0));
    }

    #[test]
    fn user_function_sees_main_scope() {
        let out = eval(
            "var base := 10\n\
             function bump(n) { base := base + n; return base }\n\
             bump(5)\n\
             base",
        );
        assert_eq!(out, ScriptValue::Number(15.0));
    }

    #[test]
    fn positional_args_via_indexed_slots() {
        let out = eval("function first(a) { return a }\nfirst(42)");
        assert_eq!(out, ScriptValue::Number(42.0));
        // Missing arguments are undefined.
        let out = eval("function two(a, b) { return b }\ntwo(1)");
        assert!(!out.is_defined());
    }

    #[test]
    fn async_function_rejected_in_sync_mode() {
        let out = eval("delay(0.01)");
        assert_eq!(out.as_error().unwrap().code, ErrorCode::Invalid);
    }

    #[test]
    fn missing_semicolon_is_syntax_error() {
        let out = eval("var a := 1 var b := 2");
        assert_eq!(out.as_error().unwrap().code, ErrorCode::Syntax);
    }

    #[test]
    fn syntax_error_carries_position() {
        let out = eval("var x := ??");
        let e = out.as_error().unwrap();
        assert_eq!(e.code, ErrorCode::Syntax);
        let pos = e.pos.expect("syntax errors are positioned");
        assert_eq!(pos.line, 1);
        assert!(pos.column >= 10);
    }

    #[test]
    fn time_and_date_literals_in_expressions() {
        assert_eq!(num("14:57:42"), 53862.0);
        assert_eq!(num("19.Feb"), 49.0);
        assert_eq!(num("14:57:42 > 12:00"), 1.0);
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(num("1 + /* two */ 2 // trailing\n+ 3"), 6.0);
    }

    #[test]
    fn script_result_is_last_statement() {
        assert_eq!(eval("1 + 1;\n2 + 2"), ScriptValue::Number(4.0));
        assert!(!eval("").is_defined());
    }
}
