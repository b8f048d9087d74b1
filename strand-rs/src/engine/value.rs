//! Runtime value type for the strand scripting language.
//!
//! Scripts are dynamically typed; every intermediate result, variable and
//! function argument is a [`ScriptValue`].  Errors are ordinary values that
//! flow through the same result channel as successes, so every operator
//! checks for and propagates an error operand before computing.

use std::fmt;
use std::rc::Rc;

use serde_json::Value as JsonValue;

use super::builtins::NativeFunction;
use super::cursor::SourceCursor;
use super::error::{ErrorCode, ScriptError};
use super::thread::ThreadHandle;

// ── Type masks ────────────────────────────────────────────────────────────

/// Type-info bits.  The low byte classifies content, the high byte carries
/// orthogonal container attributes.  Used for dynamic dispatch and for the
/// declarative argument checking in builtin signatures.
pub mod mask {
    pub const NULL: u16 = 0x0001;
    pub const ERROR: u16 = 0x0002;
    pub const NUMERIC: u16 = 0x0004;
    pub const TEXT: u16 = 0x0008;
    pub const JSON: u16 = 0x0010;
    pub const EXECUTABLE: u16 = 0x0020;
    pub const THREAD: u16 = 0x0040;

    // Container attributes.
    pub const OBJECT: u16 = 0x0100;
    pub const ARRAY: u16 = 0x0200;
    pub const MUTABLE: u16 = 0x0400;
    /// On a function's return mask: the implementation may suspend and
    /// deliver its result asynchronously.
    pub const ASYNC: u16 = 0x0800;

    /// Any usable (non-null, non-error) content kind.
    pub const VALUE: u16 = NUMERIC | TEXT | JSON | EXECUTABLE | THREAD;
    /// Scalar content.
    pub const SCALAR: u16 = NUMERIC | TEXT;
    /// Anything at all.
    pub const ANY: u16 = VALUE | NULL | ERROR;
}

// ── Executable payload ────────────────────────────────────────────────────

/// A script-defined function: parameter names plus a cursor positioned at
/// the `{` of its body.
#[derive(Debug)]
pub struct ScriptFunction {
    pub name: String,
    pub params: Vec<String>,
    pub body: SourceCursor,
}

/// Callable payload of an `Executable` value.
#[derive(Clone)]
pub enum Executable {
    /// Host-supplied native function with its signature descriptor.
    Native(Rc<NativeFunction>),
    /// Function declared in script source.
    Script(Rc<ScriptFunction>),
}

impl Executable {
    pub fn name(&self) -> &str {
        match self {
            Executable::Native(f) => f.signature.name,
            Executable::Script(f) => &f.name,
        }
    }
}

impl fmt::Debug for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Executable({})", self.name())
    }
}

// ── ScriptValue ───────────────────────────────────────────────────────────

/// A script runtime value.
#[derive(Debug, Clone, Default)]
pub enum ScriptValue {
    /// Undefined.  The optional annotation says *why* (e.g. "not yet
    /// connected") and survives conversion to text.
    #[default]
    Null,
    /// Annotated null: undefined with a reason.
    NullWithReason(Rc<str>),
    /// An error travelling as a value.
    Error(Box<ScriptError>),
    Number(f64),
    Text(String),
    /// Structured (object/array) data.
    Json(JsonValue),
    Executable(Executable),
    Thread(ThreadHandle),
}

impl ScriptValue {
    pub fn text(s: impl Into<String>) -> Self {
        ScriptValue::Text(s.into())
    }

    pub fn null_with_reason(reason: impl AsRef<str>) -> Self {
        ScriptValue::NullWithReason(Rc::from(reason.as_ref()))
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ScriptValue::Error(Box::new(ScriptError::new(code, message)))
    }

    /// A value is *defined* iff it is not null.
    pub fn is_defined(&self) -> bool {
        !matches!(self, ScriptValue::Null | ScriptValue::NullWithReason(_))
    }

    /// A value is *usable* iff it is neither null nor an error.
    pub fn is_value(&self) -> bool {
        self.is_defined() && !matches!(self, ScriptValue::Error(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ScriptValue::Error(_))
    }

    pub fn as_error(&self) -> Option<&ScriptError> {
        match self {
            ScriptValue::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Type-info bitmask: content kind plus container attributes.
    pub fn type_mask(&self) -> u16 {
        match self {
            ScriptValue::Null | ScriptValue::NullWithReason(_) => mask::NULL,
            ScriptValue::Error(_) => mask::ERROR,
            ScriptValue::Number(_) => mask::NUMERIC,
            ScriptValue::Text(_) => mask::TEXT,
            ScriptValue::Json(j) => {
                let mut m = mask::JSON | mask::MUTABLE;
                match j {
                    JsonValue::Object(_) => m |= mask::OBJECT,
                    JsonValue::Array(_) => m |= mask::ARRAY,
                    _ => {}
                }
                m
            }
            ScriptValue::Executable(_) => mask::EXECUTABLE,
            ScriptValue::Thread(_) => mask::THREAD,
        }
    }

    /// Check this value against a required type mask.  `exact` additionally
    /// requires all attribute bits of the mask to be present.
    pub fn matches_mask(&self, required: u16, exact: bool) -> bool {
        let m = self.type_mask();
        if m & required & 0x00ff == 0 {
            return false;
        }
        if exact {
            let attrs = required & 0xff00;
            if m & attrs != attrs {
                return false;
            }
        }
        true
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptValue::Null | ScriptValue::NullWithReason(_) => "null",
            ScriptValue::Error(_) => "error",
            ScriptValue::Number(_) => "number",
            ScriptValue::Text(_) => "text",
            ScriptValue::Json(JsonValue::Array(_)) => "array",
            ScriptValue::Json(_) => "object",
            ScriptValue::Executable(_) => "function",
            ScriptValue::Thread(_) => "thread",
        }
    }

    // ── Coercions ─────────────────────────────────────────────────────────

    /// Boolean coercion: null, errors, zero and empty/`"0"` text are falsy.
    pub fn bool_value(&self) -> bool {
        match self {
            ScriptValue::Null | ScriptValue::NullWithReason(_) => false,
            ScriptValue::Error(_) => false,
            ScriptValue::Number(n) => *n != 0.0,
            ScriptValue::Text(s) => !s.is_empty() && s != "0",
            ScriptValue::Json(JsonValue::Bool(b)) => *b,
            ScriptValue::Json(JsonValue::Null) => false,
            ScriptValue::Json(_) => true,
            ScriptValue::Executable(_) | ScriptValue::Thread(_) => true,
        }
    }

    /// Numeric coercion where a number can genuinely be extracted.
    pub fn num_value(&self) -> Option<f64> {
        match self {
            ScriptValue::Number(n) => Some(*n),
            ScriptValue::Text(s) => s.trim().parse().ok(),
            ScriptValue::Json(JsonValue::Number(n)) => n.as_f64(),
            ScriptValue::Json(JsonValue::Bool(b)) => Some(if *b { 1.0 } else { 0.0 }),
            ScriptValue::Json(JsonValue::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Numeric coercion with a zero fallback, for lenient builtins.
    pub fn as_number(&self) -> f64 {
        self.num_value().unwrap_or(0.0)
    }

    /// Text rendering (same as `Display`).
    pub fn string_value(&self) -> String {
        self.to_string()
    }

    /// Lossless conversion into the structured-value tree.
    pub fn to_json(&self) -> JsonValue {
        match self {
            ScriptValue::Null | ScriptValue::NullWithReason(_) => JsonValue::Null,
            ScriptValue::Error(e) => JsonValue::String(e.to_string()),
            ScriptValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            ScriptValue::Text(s) => JsonValue::String(s.clone()),
            ScriptValue::Json(j) => j.clone(),
            ScriptValue::Executable(x) => JsonValue::String(format!("function {}", x.name())),
            ScriptValue::Thread(t) => JsonValue::String(format!("thread {}", t.id())),
        }
    }

    /// Convert one structured element back into a script value: leaf
    /// primitives become scalars, containers stay structured.
    pub fn from_json(j: &JsonValue) -> ScriptValue {
        match j {
            JsonValue::Null => ScriptValue::Null,
            JsonValue::Bool(b) => ScriptValue::Number(if *b { 1.0 } else { 0.0 }),
            JsonValue::Number(n) => ScriptValue::Number(n.as_f64().unwrap_or(0.0)),
            JsonValue::String(s) => ScriptValue::Text(s.clone()),
            other => ScriptValue::Json(other.clone()),
        }
    }

    /// The value stored by an assignment.  Structured payloads are deep
    /// copied so concurrent readers of the previous binding are unaffected;
    /// `JsonValue::clone` is a deep copy.
    pub fn assignable(&self) -> ScriptValue {
        self.clone()
    }
}

// ── Display ───────────────────────────────────────────────────────────────

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Null => write!(f, "undefined"),
            ScriptValue::NullWithReason(r) => write!(f, "undefined ({r})"),
            ScriptValue::Error(e) => write!(f, "{e}"),
            // f64's default formatting is the shortest representation that
            // parses back to the same value, so text round-trips.
            ScriptValue::Number(n) => write!(f, "{n}"),
            ScriptValue::Text(s) => write!(f, "{s}"),
            ScriptValue::Json(j) => write!(f, "{j}"),
            ScriptValue::Executable(x) => write!(f, "function {}", x.name()),
            ScriptValue::Thread(t) => write!(f, "thread {}", t.id()),
        }
    }
}

// ── Equality ──────────────────────────────────────────────────────────────

impl PartialEq for ScriptValue {
    /// Structural equality used by tests and by the `==` operator's defined
    /// cases: all nulls are equal regardless of annotation, errors compare
    /// by code and message, executables and threads by identity.
    fn eq(&self, other: &Self) -> bool {
        use ScriptValue::*;
        match (self, other) {
            (Null | NullWithReason(_), Null | NullWithReason(_)) => true,
            (Error(a), Error(b)) => a.code == b.code && a.message == b.message,
            (Number(a), Number(b)) => a == b,
            (Text(a), Text(b)) => a == b,
            (Number(n), Text(s)) | (Text(s), Number(n)) => {
                s.trim().parse::<f64>().map(|t| t == *n).unwrap_or(false)
            }
            (Json(a), Json(b)) => a == b,
            (Executable(a), Executable(b)) => match (a, b) {
                (self::Executable::Native(x), self::Executable::Native(y)) => Rc::ptr_eq(x, y),
                (self::Executable::Script(x), self::Executable::Script(y)) => Rc::ptr_eq(x, y),
                _ => false,
            },
            (Thread(a), Thread(b)) => a.id() == b.id(),
            _ => false,
        }
    }
}

// ── From impls ────────────────────────────────────────────────────────────

impl From<f64> for ScriptValue {
    fn from(n: f64) -> Self {
        ScriptValue::Number(n)
    }
}

impl From<bool> for ScriptValue {
    fn from(b: bool) -> Self {
        ScriptValue::Number(if b { 1.0 } else { 0.0 })
    }
}

impl From<String> for ScriptValue {
    fn from(s: String) -> Self {
        ScriptValue::Text(s)
    }
}

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        ScriptValue::Text(s.to_owned())
    }
}

impl From<JsonValue> for ScriptValue {
    fn from(j: JsonValue) -> Self {
        ScriptValue::Json(j)
    }
}

impl From<ScriptError> for ScriptValue {
    fn from(e: ScriptError) -> Self {
        ScriptValue::Error(Box::new(e))
    }
}

// ── Operators ─────────────────────────────────────────────────────────────

/// Binary operator identity.  `&&` and `||` never reach [`apply_binary`]:
/// the processor evaluates their right-hand side in skip mode for
/// short-circuiting and combines boolean coercions itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    /// Precedence for the climbing parser; higher binds tighter.
    pub fn precedence(self) -> u8 {
        use BinaryOp::*;
        match self {
            Or => 2,
            And => 3,
            Eq | Ne => 4,
            Lt | Le | Gt | Ge => 5,
            Add | Sub => 6,
            Mul | Div | Mod => 7,
        }
    }

    pub fn symbol(self) -> &'static str {
        use BinaryOp::*;
        match self {
            Or => "||",
            And => "&&",
            Eq => "==",
            Ne => "!=",
            Lt => "<",
            Le => "<=",
            Gt => ">",
            Ge => ">=",
            Add => "+",
            Sub => "-",
            Mul => "*",
            Div => "/",
            Mod => "%",
        }
    }
}

/// Precedence just above the highest binary operator, used when parsing the
/// operand of a unary operator.
pub const UNARY_PRECEDENCE: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Script-level equality: the null-tolerant exception of the operator
/// rules.  `null == null` is true, `null == <value>` is false.
pub fn values_equal(left: &ScriptValue, right: &ScriptValue) -> bool {
    left == right
}

/// Apply a binary operator to two fully evaluated operands.
///
/// `Ok` may carry a propagated `Error` *value* (the left operand's error
/// wins); `Err` means a freshly raised error (division by zero, invalid
/// operand) that the caller throws at the nearest `try`.
pub fn apply_binary(
    op: BinaryOp,
    left: &ScriptValue,
    right: &ScriptValue,
) -> Result<ScriptValue, ScriptError> {
    // Error propagation first, left operand wins.
    if left.is_error() {
        return Ok(left.clone());
    }
    if right.is_error() {
        return Ok(right.clone());
    }

    match op {
        BinaryOp::Eq => return Ok(values_equal(left, right).into()),
        BinaryOp::Ne => return Ok((!values_equal(left, right)).into()),
        _ => {}
    }

    // Null propagation: the operation is undefined on undefined input.
    if !left.is_defined() || !right.is_defined() {
        return Ok(ScriptValue::Null);
    }

    match op {
        BinaryOp::Add => {
            if let (Some(a), Some(b)) = (left.num_value(), right.num_value()) {
                Ok(ScriptValue::Number(a + b))
            } else if matches!(left, ScriptValue::Text(_))
                || matches!(right, ScriptValue::Text(_))
            {
                Ok(ScriptValue::Text(format!("{left}{right}")))
            } else {
                Err(invalid_operands(op, left, right))
            }
        }
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            let (a, b) = numeric_operands(op, left, right)?;
            match op {
                BinaryOp::Sub => Ok(ScriptValue::Number(a - b)),
                BinaryOp::Mul => Ok(ScriptValue::Number(a * b)),
                BinaryOp::Div => {
                    if b == 0.0 {
                        Err(ScriptError::new(ErrorCode::DivisionByZero, "division by zero"))
                    } else {
                        Ok(ScriptValue::Number(a / b))
                    }
                }
                BinaryOp::Mod => {
                    if b == 0.0 {
                        Err(ScriptError::new(ErrorCode::DivisionByZero, "modulo by zero"))
                    } else {
                        Ok(ScriptValue::Number(a % b))
                    }
                }
                _ => unreachable!(),
            }
        }
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ord = compare(left, right)
                .ok_or_else(|| invalid_operands(op, left, right))?;
            let res = match op {
                BinaryOp::Lt => ord == std::cmp::Ordering::Less,
                BinaryOp::Le => ord != std::cmp::Ordering::Greater,
                BinaryOp::Gt => ord == std::cmp::Ordering::Greater,
                BinaryOp::Ge => ord != std::cmp::Ordering::Less,
                _ => unreachable!(),
            };
            Ok(res.into())
        }
        BinaryOp::And | BinaryOp::Or => Err(ScriptError::new(
            ErrorCode::Internal,
            "logical operator reached value layer",
        )),
        BinaryOp::Eq | BinaryOp::Ne => unreachable!("handled above"),
    }
}

/// Apply a unary operator.  Errors and nulls propagate.
pub fn apply_unary(op: UnaryOp, v: &ScriptValue) -> Result<ScriptValue, ScriptError> {
    if v.is_error() {
        return Ok(v.clone());
    }
    if !v.is_defined() {
        return Ok(ScriptValue::Null);
    }
    match op {
        UnaryOp::Neg => match v.num_value() {
            Some(n) => Ok(ScriptValue::Number(-n)),
            None => Err(ScriptError::invalid(format!(
                "cannot negate {}",
                v.type_name()
            ))),
        },
        UnaryOp::Not => Ok((!v.bool_value()).into()),
    }
}

fn numeric_operands(
    op: BinaryOp,
    left: &ScriptValue,
    right: &ScriptValue,
) -> Result<(f64, f64), ScriptError> {
    match (left.num_value(), right.num_value()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(invalid_operands(op, left, right)),
    }
}

fn invalid_operands(op: BinaryOp, left: &ScriptValue, right: &ScriptValue) -> ScriptError {
    ScriptError::invalid(format!(
        "invalid operands for '{}': {} and {}",
        op.symbol(),
        left.type_name(),
        right.type_name()
    ))
}

/// Relational comparison: numeric when both operands coerce to numbers,
/// lexicographic when both are text, undefined otherwise.
fn compare(left: &ScriptValue, right: &ScriptValue) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (left.num_value(), right.num_value()) {
        return a.partial_cmp(&b);
    }
    if let (ScriptValue::Text(a), ScriptValue::Text(b)) = (left, right) {
        return Some(a.cmp(b));
    }
    None
}

// ── Structured-value paths ────────────────────────────────────────────────

/// One step of a member-access chain rooted at a variable.
#[derive(Debug, Clone, PartialEq)]
pub enum PathKey {
    Field(String),
    Index(usize),
}

impl PathKey {
    /// Derive a path step from a subscript key value.
    pub fn from_value(key: &ScriptValue) -> Result<PathKey, ScriptError> {
        match key {
            ScriptValue::Number(n) if *n >= 0.0 => Ok(PathKey::Index(*n as usize)),
            ScriptValue::Number(_) => Err(ScriptError::invalid("negative subscript")),
            ScriptValue::Text(s) => Ok(PathKey::Field(s.clone())),
            other => Err(ScriptError::invalid(format!(
                "subscript key must be number or text, got {}",
                other.type_name()
            ))),
        }
    }
}

/// Read one element of a structured value.
pub fn json_get(root: &JsonValue, key: &PathKey) -> ScriptValue {
    let elem = match key {
        PathKey::Field(name) => root.get(name.as_str()),
        PathKey::Index(i) => root.get(*i),
    };
    match elem {
        Some(v) => ScriptValue::from_json(v),
        None => ScriptValue::Null,
    }
}

/// Write through a path into a structured value, creating missing object
/// members along the way.  Array writes accept indices `0..=len` (the `len`
/// case appends).
pub fn json_set_path(
    root: &mut JsonValue,
    path: &[PathKey],
    value: JsonValue,
) -> Result<(), ScriptError> {
    let Some((last, prefix)) = path.split_last() else {
        *root = value;
        return Ok(());
    };

    let mut node = root;
    for key in prefix {
        node = match key {
            PathKey::Field(name) => {
                if !node.is_object() {
                    return Err(ScriptError::invalid("member access on non-object"));
                }
                node.as_object_mut()
                    .expect("checked is_object")
                    .entry(name.clone())
                    .or_insert(JsonValue::Object(serde_json::Map::new()))
            }
            PathKey::Index(i) => node
                .get_mut(*i)
                .ok_or_else(|| ScriptError::invalid(format!("index {i} out of range")))?,
        };
    }

    match last {
        PathKey::Field(name) => {
            let obj = node
                .as_object_mut()
                .ok_or_else(|| ScriptError::invalid("member access on non-object"))?;
            obj.insert(name.clone(), value);
        }
        PathKey::Index(i) => {
            let arr = node
                .as_array_mut()
                .ok_or_else(|| ScriptError::invalid("subscript on non-array"))?;
            if *i < arr.len() {
                arr[*i] = value;
            } else if *i == arr.len() {
                arr.push(value);
            } else {
                return Err(ScriptError::invalid(format!("index {i} out of range")));
            }
        }
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────
