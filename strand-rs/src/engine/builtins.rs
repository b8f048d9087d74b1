//! Native function descriptors and the standard function library.
//!
//! Every native function carries a [`Signature`]: name, return-type mask,
//! and an ordered list of argument descriptors.  The dispatcher checks all
//! supplied arguments against the descriptors before the implementation
//! runs, so implementations can lean on their declared types.
//!
//! Implementations either return a value immediately or, when their return
//! mask carries [`mask::ASYNC`], capture a [`Resolver`](super::thread::Resolver)
//! from the thread services and return [`BuiltinOutcome::Suspended`]; the
//! thread resumes when the resolver fires.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::context::ContextRef;
use super::error::{ErrorCode, ScriptError};
use super::thread::ThreadServices;
use super::value::{mask, ScriptValue};

// ── Argument descriptors ──────────────────────────────────────────────────

/// Declarative description of one argument position.
#[derive(Debug, Clone, Copy)]
pub struct ArgDescriptor {
    /// Acceptable content kinds (plus attribute bits when `exact`).
    pub types: u16,
    /// May be omitted by the caller.
    pub optional: bool,
    /// Absorbs all remaining (trailing) arguments.
    pub multiple: bool,
    /// Attribute bits of `types` must match exactly, not just content kind.
    pub exact: bool,
    /// A mismatch makes the whole call yield `undefined` instead of raising.
    pub undefined_on_mismatch: bool,
}

impl ArgDescriptor {
    pub const fn required(types: u16) -> Self {
        Self { types, optional: false, multiple: false, exact: false, undefined_on_mismatch: false }
    }

    pub const fn optional(types: u16) -> Self {
        Self { types, optional: true, multiple: false, exact: false, undefined_on_mismatch: false }
    }

    pub const fn multiple(types: u16) -> Self {
        Self { types, optional: true, multiple: true, exact: false, undefined_on_mismatch: false }
    }

    /// Required argument whose mismatch degrades the call to `undefined`.
    pub const fn soft(types: u16) -> Self {
        Self { types, optional: false, multiple: false, exact: false, undefined_on_mismatch: true }
    }
}

/// A native function's callable signature.
#[derive(Debug, Clone, Copy)]
pub struct Signature {
    pub name: &'static str,
    /// Return-type mask; include [`mask::ASYNC`] for suspending functions.
    pub returns: u16,
    pub args: &'static [ArgDescriptor],
}

impl Signature {
    /// Whether the implementation may suspend.
    pub fn is_async(&self) -> bool {
        self.returns & mask::ASYNC != 0
    }
}

// ── Invocation plumbing ───────────────────────────────────────────────────

/// What an implementation produced.
pub enum BuiltinOutcome {
    Value(ScriptValue),
    /// The implementation stored a resolver and will deliver later.
    Suspended,
}

/// Everything an implementation gets to work with.
pub struct CallContext<'a> {
    pub args: Vec<ScriptValue>,
    pub ctx: ContextRef,
    pub services: &'a mut dyn ThreadServices,
    /// Innermost caught error while executing a `catch` block.
    pub caught: Option<ScriptValue>,
}

impl CallContext<'_> {
    pub fn arg(&self, idx: usize) -> ScriptValue {
        self.args.get(idx).cloned().unwrap_or(ScriptValue::Null)
    }

    pub fn str_arg(&self, idx: usize) -> String {
        self.args.get(idx).map(ScriptValue::string_value).unwrap_or_default()
    }

    pub fn num_arg(&self, idx: usize) -> f64 {
        self.args.get(idx).map(ScriptValue::as_number).unwrap_or(0.0)
    }

    pub fn has_arg(&self, idx: usize) -> bool {
        self.args.get(idx).map(ScriptValue::is_defined).unwrap_or(false)
    }
}

type BuiltinImpl = Box<dyn Fn(&mut CallContext) -> Result<BuiltinOutcome, ScriptError>>;

/// A registered native function: signature plus implementation.
pub struct NativeFunction {
    pub signature: Signature,
    imp: BuiltinImpl,
}

impl NativeFunction {
    pub fn new(
        signature: Signature,
        imp: impl Fn(&mut CallContext) -> Result<BuiltinOutcome, ScriptError> + 'static,
    ) -> Self {
        Self { signature, imp: Box::new(imp) }
    }

    /// Check arguments and invoke.  `Ok(Value)` may be a propagated error
    /// operand or the descriptor-mandated `undefined` without the
    /// implementation ever running.
    pub fn invoke(&self, call: &mut CallContext) -> Result<BuiltinOutcome, ScriptError> {
        if let Some(short) = check_arguments(&self.signature, &call.args)? {
            return Ok(BuiltinOutcome::Value(short));
        }
        (self.imp)(call)
    }
}

/// Validate `args` against a signature.
///
/// Returns `Ok(Some(v))` to short-circuit the call with `v` (an error
/// argument propagating through, or `undefined` under the
/// undefined-on-mismatch policy), `Ok(None)` to proceed, `Err` for a
/// signature violation.
pub fn check_arguments(
    sig: &Signature,
    args: &[ScriptValue],
) -> Result<Option<ScriptValue>, ScriptError> {
    let mut di = 0usize;
    for (i, arg) in args.iter().enumerate() {
        let Some(desc) = sig.args.get(di) else {
            return Err(ScriptError::new(
                ErrorCode::Syntax,
                format!("{}: too many arguments", sig.name),
            ));
        };
        // An error argument propagates unless the function accepts errors.
        if arg.is_error() && desc.types & mask::ERROR == 0 {
            return Ok(Some(arg.clone()));
        }
        if !arg.matches_mask(desc.types, desc.exact) {
            if desc.undefined_on_mismatch {
                return Ok(Some(ScriptValue::Null));
            }
            return Err(ScriptError::new(
                ErrorCode::Syntax,
                format!(
                    "{}: argument {} has wrong type {}",
                    sig.name,
                    i + 1,
                    arg.type_name()
                ),
            ));
        }
        if !desc.multiple {
            di += 1;
        }
    }
    // Anything left must be optional.
    while let Some(desc) = sig.args.get(di) {
        if !desc.optional && !desc.multiple {
            return Err(ScriptError::new(
                ErrorCode::Syntax,
                format!("{}: missing argument {}", sig.name, di + 1),
            ));
        }
        di += 1;
    }
    Ok(None)
}

// ── Standard library ──────────────────────────────────────────────────────

const ANY_ARG: u16 = mask::ANY;

macro_rules! sig {
    ($name:literal, $returns:expr, [$($desc:expr),* $(,)?]) => {{
        const ARGS: &[ArgDescriptor] = &[$($desc),*];
        Signature { name: $name, returns: $returns, args: ARGS }
    }};
}

fn sync(
    signature: Signature,
    f: impl Fn(&mut CallContext) -> Result<ScriptValue, ScriptError> + 'static,
) -> NativeFunction {
    NativeFunction::new(signature, move |call| f(call).map(BuiltinOutcome::Value))
}

/// The standard function library registered into a fresh domain.
pub fn standard_functions() -> Vec<NativeFunction> {
    let mut fns: Vec<NativeFunction> = Vec::new();

    // ── String functions ──────────────────────────────────────────────────
    fns.push(sync(
        sig!("strlen", mask::NUMERIC, [ArgDescriptor::required(mask::SCALAR)]),
        |c| Ok(ScriptValue::Number(c.str_arg(0).chars().count() as f64)),
    ));
    fns.push(sync(
        sig!(
            "substr",
            mask::TEXT,
            [
                ArgDescriptor::required(mask::SCALAR),
                ArgDescriptor::required(mask::NUMERIC),
                ArgDescriptor::optional(mask::NUMERIC),
            ]
        ),
        |c| {
            let s = c.str_arg(0);
            let chars: Vec<char> = s.chars().collect();
            let start = (c.num_arg(1).max(0.0) as usize).min(chars.len());
            let end = if c.has_arg(2) {
                (start + c.num_arg(2).max(0.0) as usize).min(chars.len())
            } else {
                chars.len()
            };
            Ok(ScriptValue::Text(chars[start..end].iter().collect()))
        },
    ));
    fns.push(sync(
        sig!(
            "find",
            mask::NUMERIC | mask::NULL,
            [
                ArgDescriptor::required(mask::SCALAR),
                ArgDescriptor::required(mask::SCALAR),
                ArgDescriptor::optional(mask::NUMERIC),
            ]
        ),
        |c| {
            let hay = c.str_arg(0);
            let needle = c.str_arg(1);
            let from = c.num_arg(2).max(0.0) as usize;
            let chars: Vec<char> = hay.chars().collect();
            let tail: String = chars.iter().skip(from).collect();
            Ok(match tail.find(&needle) {
                Some(byte_idx) => {
                    let char_idx = tail[..byte_idx].chars().count() + from;
                    ScriptValue::Number(char_idx as f64)
                }
                None => ScriptValue::null_with_reason("not found"),
            })
        },
    ));
    fns.push(sync(
        sig!("uppercase", mask::TEXT, [ArgDescriptor::required(mask::SCALAR)]),
        |c| Ok(ScriptValue::Text(c.str_arg(0).to_uppercase())),
    ));
    fns.push(sync(
        sig!("lowercase", mask::TEXT, [ArgDescriptor::required(mask::SCALAR)]),
        |c| Ok(ScriptValue::Text(c.str_arg(0).to_lowercase())),
    ));
    fns.push(sync(
        sig!(
            "format",
            mask::TEXT,
            [ArgDescriptor::required(mask::TEXT), ArgDescriptor::multiple(ANY_ARG)]
        ),
        |c| Ok(ScriptValue::Text(format_args_list(&c.str_arg(0), &c.args[1..]))),
    ));
    fns.push(sync(
        sig!(
            "match",
            mask::TEXT | mask::NULL,
            [ArgDescriptor::required(mask::SCALAR), ArgDescriptor::required(mask::TEXT)]
        ),
        |c| {
            let re = regex::Regex::new(&c.str_arg(1))
                .map_err(|e| ScriptError::invalid(format!("match: bad pattern: {e}")))?;
            Ok(match re.find(&c.str_arg(0)) {
                Some(m) => ScriptValue::Text(m.as_str().to_owned()),
                None => ScriptValue::null_with_reason("no match"),
            })
        },
    ));

    // ── Numeric functions ─────────────────────────────────────────────────
    fns.push(sync(
        sig!("abs", mask::NUMERIC, [ArgDescriptor::required(mask::NUMERIC)]),
        |c| Ok(ScriptValue::Number(c.num_arg(0).abs())),
    ));
    fns.push(sync(
        sig!("int", mask::NUMERIC, [ArgDescriptor::required(mask::NUMERIC)]),
        |c| Ok(ScriptValue::Number(c.num_arg(0).trunc())),
    ));
    fns.push(sync(
        sig!(
            "round",
            mask::NUMERIC,
            [ArgDescriptor::required(mask::NUMERIC), ArgDescriptor::optional(mask::NUMERIC)]
        ),
        |c| {
            let v = c.num_arg(0);
            let step = if c.has_arg(1) { c.num_arg(1) } else { 1.0 };
            if step <= 0.0 {
                return Err(ScriptError::invalid("round: step must be positive"));
            }
            Ok(ScriptValue::Number((v / step).round() * step))
        },
    ));
    fns.push(sync(
        sig!(
            "min",
            mask::NUMERIC,
            [ArgDescriptor::required(mask::NUMERIC), ArgDescriptor::multiple(mask::NUMERIC)]
        ),
        |c| {
            let m = c.args.iter().map(ScriptValue::as_number).fold(f64::INFINITY, f64::min);
            Ok(ScriptValue::Number(m))
        },
    ));
    fns.push(sync(
        sig!(
            "max",
            mask::NUMERIC,
            [ArgDescriptor::required(mask::NUMERIC), ArgDescriptor::multiple(mask::NUMERIC)]
        ),
        |c| {
            let m = c.args.iter().map(ScriptValue::as_number).fold(f64::NEG_INFINITY, f64::max);
            Ok(ScriptValue::Number(m))
        },
    ));

    // ── Type inspection and conversion ────────────────────────────────────
    fns.push(sync(
        sig!("typename", mask::TEXT, [ArgDescriptor::required(ANY_ARG)]),
        |c| Ok(ScriptValue::Text(c.arg(0).type_name().to_owned())),
    ));
    fns.push(sync(
        sig!("isvalid", mask::NUMERIC, [ArgDescriptor::required(ANY_ARG)]),
        |c| Ok(c.arg(0).is_value().into()),
    ));
    fns.push(sync(
        sig!("undefined", mask::NULL, [ArgDescriptor::optional(mask::TEXT)]),
        |c| {
            Ok(if c.has_arg(0) {
                ScriptValue::null_with_reason(c.str_arg(0))
            } else {
                ScriptValue::Null
            })
        },
    ));
    fns.push(sync(
        sig!("number", mask::NUMERIC | mask::NULL, [ArgDescriptor::required(ANY_ARG)]),
        |c| {
            Ok(match c.arg(0).num_value() {
                Some(n) => ScriptValue::Number(n),
                None => ScriptValue::null_with_reason("not numeric"),
            })
        },
    ));
    fns.push(sync(
        sig!("string", mask::TEXT, [ArgDescriptor::required(ANY_ARG)]),
        |c| Ok(ScriptValue::Text(c.arg(0).string_value())),
    ));
    fns.push(sync(
        sig!("json", mask::JSON | mask::NULL, [ArgDescriptor::required(ANY_ARG)]),
        |c| {
            Ok(match c.arg(0) {
                ScriptValue::Text(s) => match serde_json::from_str(&s) {
                    Ok(j) => ScriptValue::Json(j),
                    Err(e) => ScriptValue::null_with_reason(format!("invalid json: {e}")),
                },
                other => ScriptValue::Json(other.to_json()),
            })
        },
    ));
    fns.push(sync(
        sig!("elements", mask::NUMERIC | mask::NULL, [ArgDescriptor::soft(mask::JSON)]),
        |c| {
            let ScriptValue::Json(j) = c.arg(0) else {
                return Ok(ScriptValue::Null);
            };
            Ok(match j {
                serde_json::Value::Array(a) => ScriptValue::Number(a.len() as f64),
                serde_json::Value::Object(o) => ScriptValue::Number(o.len() as f64),
                _ => ScriptValue::Null,
            })
        },
    ));

    // ── Error handling ────────────────────────────────────────────────────
    fns.push(sync(
        sig!(
            "error",
            mask::ERROR | mask::NULL,
            [ArgDescriptor::optional(mask::SCALAR | mask::ERROR)]
        ),
        |c| {
            if !c.args.is_empty() {
                return Ok(match c.arg(0) {
                    e @ ScriptValue::Error(_) => e,
                    other => ScriptValue::error(ErrorCode::User, other.string_value()),
                });
            }
            // Zero arguments: the caught error inside a catch block.
            Ok(c.caught.clone().unwrap_or(ScriptValue::Null))
        },
    ));
    fns.push(sync(
        sig!(
            "errormessage",
            mask::TEXT | mask::NULL,
            [ArgDescriptor::soft(mask::ERROR)]
        ),
        |c| {
            Ok(match c.arg(0) {
                ScriptValue::Error(e) => ScriptValue::Text(e.message.clone()),
                _ => ScriptValue::Null,
            })
        },
    ));
    fns.push(sync(
        sig!("throw", mask::NULL, [ArgDescriptor::required(mask::SCALAR | mask::ERROR)]),
        |c| {
            Err(match c.arg(0) {
                ScriptValue::Error(e) => *e,
                other => ScriptError::new(ErrorCode::User, other.string_value()),
            })
        },
    ));

    // ── Logging ───────────────────────────────────────────────────────────
    fns.push(sync(
        sig!(
            "log",
            mask::NULL,
            [ArgDescriptor::required(ANY_ARG), ArgDescriptor::optional(ANY_ARG)]
        ),
        |c| {
            if c.args.len() >= 2 {
                let level = c.num_arg(0);
                let msg = c.str_arg(1);
                if level >= 7.0 {
                    tracing::debug!(target: "strand::script", "{msg}");
                } else {
                    tracing::info!(target: "strand::script", "{msg}");
                }
            } else {
                tracing::info!(target: "strand::script", "{}", c.str_arg(0));
            }
            Ok(ScriptValue::Null)
        },
    ));

    // ── Time ──────────────────────────────────────────────────────────────
    fns.push(sync(sig!("epochtime", mask::NUMERIC, []), |_| {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Ok(ScriptValue::Number(secs))
    }));
    fns.push(NativeFunction::new(
        sig!(
            "delay",
            mask::NULL | mask::ASYNC,
            [ArgDescriptor::required(mask::NUMERIC)]
        ),
        |c| {
            let secs = c.num_arg(0).max(0.0);
            let resolver = c.services.resolver();
            c.services.schedule_after(Duration::from_secs_f64(secs), resolver);
            Ok(BuiltinOutcome::Suspended)
        },
    ));

    // ── Threads ───────────────────────────────────────────────────────────
    fns.push(NativeFunction::new(
        sig!(
            "await",
            ANY_ARG | mask::ASYNC,
            [ArgDescriptor::required(mask::THREAD)]
        ),
        |c| {
            let ScriptValue::Thread(handle) = c.arg(0) else {
                return Err(ScriptError::invalid("await: not a thread"));
            };
            let resolver = c.services.resolver();
            match c.services.await_thread(&handle, resolver) {
                Some(result) => Ok(BuiltinOutcome::Value(result)),
                None => Ok(BuiltinOutcome::Suspended),
            }
        },
    ));
    fns.push(sync(
        sig!("abort", mask::NUMERIC, [ArgDescriptor::required(mask::THREAD)]),
        |c| {
            let ScriptValue::Thread(handle) = c.arg(0) else {
                return Err(ScriptError::invalid("abort: not a thread"));
            };
            Ok(c.services.abort_thread(&handle).into())
        },
    ));

    fns
}

// ── format() helper ───────────────────────────────────────────────────────

/// Minimal printf-style formatting: `%s`, `%d`, `%f` with an optional
/// `%.Nf` precision, and `%%`.  Placeholders consume arguments in order;
/// missing arguments render as `undefined`.
fn format_args_list(fmt: &str, args: &[ScriptValue]) -> String {
    let mut out = String::with_capacity(fmt.len() + 16);
    let mut next = 0usize;
    let mut chars = fmt.chars().peekable();
    let mut take = |next: &mut usize| -> ScriptValue {
        let v = args.get(*next).cloned().unwrap_or(ScriptValue::Null);
        *next += 1;
        v
    };
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('%') => {
                chars.next();
                out.push('%');
            }
            Some('s') => {
                chars.next();
                out.push_str(&take(&mut next).string_value());
            }
            Some('d') => {
                chars.next();
                out.push_str(&format!("{}", take(&mut next).as_number().trunc() as i64));
            }
            Some('f') => {
                chars.next();
                out.push_str(&format!("{}", take(&mut next).as_number()));
            }
            Some('.') => {
                // %.Nf
                chars.next();
                let mut digits = String::new();
                while matches!(chars.peek(), Some(d) if d.is_ascii_digit()) {
                    digits.push(chars.next().expect("peeked digit"));
                }
                if chars.peek() == Some(&'f') {
                    chars.next();
                    let prec: usize = digits.parse().unwrap_or(0);
                    out.push_str(&format!("{:.*}", prec, take(&mut next).as_number()));
                } else {
                    out.push('%');
                    out.push('.');
                    out.push_str(&digits);
                }
            }
            _ => out.push('%'),
        }
    }
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::{ExecutionContext, ScriptingDomain};
    use crate::engine::thread::NullServices;

    fn call(name: &str, args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> {
        let fns = standard_functions();
        let f = fns
            .iter()
            .find(|f| f.signature.name == name)
            .unwrap_or_else(|| panic!("{name} is not a standard function"));
        let ctx = ExecutionContext::new(ScriptingDomain::new());
        let mut services = NullServices;
        let mut cc = CallContext { args, ctx, services: &mut services, caught: None };
        match f.invoke(&mut cc)? {
            BuiltinOutcome::Value(v) => Ok(v),
            BuiltinOutcome::Suspended => panic!("unexpected suspension"),
        }
    }

    fn ok(name: &str, args: Vec<ScriptValue>) -> ScriptValue {
        call(name, args).expect("call failed")
    }

    #[test]
    fn strlen() {
        assert_eq!(ok("strlen", vec!["hello".into()]), ScriptValue::Number(5.0));
    }

    #[test]
    fn substr() {
        assert_eq!(
            ok("substr", vec!["hello".into(), 1.0.into(), 3.0.into()]),
            ScriptValue::text("ell")
        );
        assert_eq!(
            ok("substr", vec!["hello".into(), 3.0.into()]),
            ScriptValue::text("lo")
        );
        assert_eq!(
            ok("substr", vec!["hello".into(), 10.0.into()]),
            ScriptValue::text("")
        );
    }

    #[test]
    fn find_returns_annotated_null_when_missing() {
        assert_eq!(
            ok("find", vec!["foobar".into(), "bar".into()]),
            ScriptValue::Number(3.0)
        );
        let miss = ok("find", vec!["foobar".into(), "xyz".into()]);
        assert!(!miss.is_defined());
    }

    #[test]
    fn case_functions() {
        assert_eq!(ok("uppercase", vec!["Hello".into()]), ScriptValue::text("HELLO"));
        assert_eq!(ok("lowercase", vec!["Hello".into()]), ScriptValue::text("hello"));
    }

    #[test]
    fn format_placeholders() {
        assert_eq!(
            ok(
                "format",
                vec!["x=%d y=%s p=%.2f %%".into(), 3.7.into(), "hi".into(), 1.5.into()]
            ),
            ScriptValue::text("x=3 y=hi p=1.50 %")
        );
    }

    #[test]
    fn regex_match() {
        assert_eq!(
            ok("match", vec!["hello42world".into(), "[0-9]+".into()]),
            ScriptValue::text("42")
        );
        assert!(!ok("match", vec!["hello".into(), "[0-9]+".into()]).is_defined());
        assert!(call("match", vec!["x".into(), "[".into()]).is_err());
    }

    #[test]
    fn numeric_functions() {
        assert_eq!(ok("abs", vec![(-7.5).into()]), ScriptValue::Number(7.5));
        assert_eq!(ok("int", vec![3.9.into()]), ScriptValue::Number(3.0));
        assert_eq!(ok("round", vec![3.6.into()]), ScriptValue::Number(4.0));
        assert_eq!(
            ok("round", vec![3.6.into(), 0.5.into()]),
            ScriptValue::Number(3.5)
        );
        assert_eq!(
            ok("min", vec![3.0.into(), 1.0.into(), 2.0.into()]),
            ScriptValue::Number(1.0)
        );
        assert_eq!(
            ok("max", vec![3.0.into(), 1.0.into(), 2.0.into()]),
            ScriptValue::Number(3.0)
        );
    }

    #[test]
    fn conversion_functions() {
        assert_eq!(ok("number", vec!["42".into()]), ScriptValue::Number(42.0));
        assert!(!ok("number", vec!["abc".into()]).is_defined());
        assert_eq!(ok("string", vec![42.0.into()]), ScriptValue::text("42"));
        assert_eq!(ok("typename", vec![42.0.into()]), ScriptValue::text("number"));
        assert_eq!(ok("isvalid", vec![ScriptValue::Null]), ScriptValue::Number(0.0));
    }

    #[test]
    fn json_parse_and_elements() {
        let j = ok("json", vec!["[1,2,3]".into()]);
        assert_eq!(ok("elements", vec![j]), ScriptValue::Number(3.0));
        // Soft descriptor: wrong type yields undefined, not an error.
        assert!(!ok("elements", vec![42.0.into()]).is_defined());
    }

    #[test]
    fn error_functions() {
        let e = ok("error", vec!["boom".into()]);
        assert_eq!(e.as_error().unwrap().code, ErrorCode::User);
        assert_eq!(ok("errormessage", vec![e.clone()]), ScriptValue::text("boom"));
        assert!(!ok("errormessage", vec![42.0.into()]).is_defined());
        let raised = call("throw", vec![e]).unwrap_err();
        assert_eq!(raised.code, ErrorCode::User);
        assert_eq!(raised.message, "boom");
    }

    #[test]
    fn error_argument_propagates_before_invocation() {
        let e = ScriptValue::error(ErrorCode::Invalid, "bad");
        let out = ok("strlen", vec![e.clone()]);
        assert_eq!(out, e);
    }

    #[test]
    fn signature_violations() {
        assert!(call("strlen", vec![]).is_err());
        assert!(call("strlen", vec!["a".into(), "b".into()]).is_err());
        let e = call("abs", vec![ScriptValue::Json(serde_json::json!({}))]).unwrap_err();
        assert_eq!(e.code, ErrorCode::Syntax);
    }

    #[test]
    fn async_functions_are_flagged() {
        let fns = standard_functions();
        let delay = fns.iter().find(|f| f.signature.name == "delay").unwrap();
        assert!(delay.signature.is_async());
        let strlen = fns.iter().find(|f| f.signature.name == "strlen").unwrap();
        assert!(!strlen.signature.is_async());
    }
}
