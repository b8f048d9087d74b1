use proptest::prelude::*;

use strand::engine::{
    ExecutionContext, Scheduler, ScriptValue, ScriptingDomain, SourceCursor,
};

fn eval(src: &str) -> ScriptValue {
    let domain = ScriptingDomain::with_standard_functions();
    let ctx = ExecutionContext::new(domain);
    Scheduler::new().evaluate(src, &ctx)
}

/// Statement bodies used for dead-branch scanning below.  None of them
/// touches `x` or raises when executed live.
const SNIPPETS: &[&str] = &[
    "var y := 5; y := y + 1",
    "'text' + 42",
    "var t := {\"a\": [1, 2]}; t.a[0] := 9",
    "var n := 3; while (n > 0) { n := n - 1 }",
    "try throw('e') catch as err { var z := errormessage(err) }",
    "function helper(a) { return a * 2 }",
];

proptest! {
    /// Formatting a number to text and re-parsing it as a script literal
    /// reproduces the original value.
    #[test]
    fn number_text_round_trip(n in proptest::num::f64::NORMAL | proptest::num::f64::ZERO) {
        let text = ScriptValue::Number(n).to_string();
        prop_assert_eq!(eval(&text), ScriptValue::Number(n));
    }
}

proptest! {
    /// The cursor's scan primitives never panic on arbitrary input; they
    /// return a value or an error, and `advance` is total.
    #[test]
    fn cursor_survives_arbitrary_input(s in "\\PC*") {
        let mut c = SourceCursor::new(s.as_str());
        c.skip_non_code();
        let _ = c.peek_identifier();
        let _ = c.clone().parse_operator();
        let _ = c.clone().parse_numeric_literal();
        let _ = c.clone().parse_string_literal();
        let _ = c.clone().parse_structured_literal();
        while !c.eof() {
            c.advance(1);
        }
        prop_assert!(c.current().is_none());
    }
}

proptest! {
    /// Evaluating arbitrary short input yields a value or an error value,
    /// never a panic.
    #[test]
    fn evaluation_survives_arbitrary_input(s in "\\PC{0,60}") {
        let _ = eval(&s);
    }
}

proptest! {
    /// A dead branch is scanned exactly like a live one: whatever statement
    /// it contains, the code after the `if` still parses and runs, and a
    /// false condition leaves surrounding state untouched.
    #[test]
    fn dead_branches_scan_like_live_ones(
        idx in 0..SNIPPETS.len(),
        taken in proptest::bool::ANY,
    ) {
        let src = format!(
            "var x := 41\nif ({}) {{ {} }}\nx + 1",
            taken, SNIPPETS[idx]
        );
        prop_assert_eq!(eval(&src), ScriptValue::Number(42.0));
    }
}
