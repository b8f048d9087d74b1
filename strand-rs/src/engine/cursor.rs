//! Position-tracking cursor over immutable script source.
//!
//! The cursor supplies the lexical primitives the processor drives:
//! whitespace/comment skipping, identifier and literal scanning, and
//! operator scanning with precedence.  Scan failures come back as
//! position-annotated syntax errors; nothing here panics on bad input.
//!
//! Numeric literals carry the scheduling-domain extension: a C-style
//! number opportunistically extends into a clock-time literal
//! (`h:m[:s]`, value in seconds) or a date literal (`dd.monthname` or
//! `dd.mm.`, value as 0-based day-of-year), so schedules read naturally
//! in scripts (`if (time() > 14:30) ...`).

use std::rc::Rc;

use serde_json::Value as JsonValue;

use super::error::{ScriptError, SourcePos};
use super::value::BinaryOp;

// ── Month table for date literals ─────────────────────────────────────────

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun",
    "jul", "aug", "sep", "oct", "nov", "dec",
];

/// Day-of-year of the first day of each month (non-leap reference year).
const MONTH_STARTS: [u32; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];

// ── SourceCursor ──────────────────────────────────────────────────────────

/// An immutable source buffer plus a mutable scan position.
///
/// Cloning is cheap (shared buffer, copied position) — the processor saves
/// and restores cursors freely for lookahead and loop re-entry.
#[derive(Debug, Clone)]
pub struct SourceCursor {
    src: Rc<str>,
    /// Byte offset of the scan position.
    pos: usize,
    /// 1-based line number of the scan position.
    line: u32,
    /// Byte offset of the beginning of the current line.
    bol: usize,
}

impl SourceCursor {
    pub fn new(src: impl Into<Rc<str>>) -> Self {
        Self { src: src.into(), pos: 0, line: 1, bol: 0 }
    }

    pub fn source(&self) -> &Rc<str> {
        &self.src
    }

    pub fn offset(&self) -> usize {
        self.pos
    }

    /// Current position as offset/line/column (columns in characters).
    pub fn position(&self) -> SourcePos {
        let column = self.src[self.bol..self.pos].chars().count() as u32 + 1;
        SourcePos::new(self.pos, self.line, column)
    }

    pub fn eof(&self) -> bool {
        self.pos >= self.src.len()
    }

    /// Character at the scan position, or `None` at end of text.
    pub fn current(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    /// Character `n` characters ahead of the scan position.
    pub fn peek(&self, n: usize) -> Option<char> {
        self.src[self.pos..].chars().nth(n)
    }

    /// Advance over `n` characters, keeping line accounting straight.
    pub fn advance(&mut self, n: usize) {
        for _ in 0..n {
            let Some(ch) = self.current() else { return };
            self.pos += ch.len_utf8();
            if ch == '\n' {
                self.line += 1;
                self.bol = self.pos;
            }
        }
    }

    fn eat(&mut self, ch: char) -> bool {
        if self.current() == Some(ch) {
            self.advance(1);
            true
        } else {
            false
        }
    }

    fn syntax(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::syntax(message, self.position())
    }

    // ── Non-code skipping ─────────────────────────────────────────────────

    /// Skip whitespace and both comment styles, re-checking after each
    /// comment in case another follows.
    pub fn skip_non_code(&mut self) {
        loop {
            while matches!(self.current(), Some(c) if c.is_whitespace()) {
                self.advance(1);
            }
            if self.current() == Some('/') && self.peek(1) == Some('/') {
                while !matches!(self.current(), None | Some('\n')) {
                    self.advance(1);
                }
                continue;
            }
            if self.current() == Some('/') && self.peek(1) == Some('*') {
                self.advance(2);
                loop {
                    match self.current() {
                        None => return,
                        Some('*') if self.peek(1) == Some('/') => {
                            self.advance(2);
                            break;
                        }
                        _ => self.advance(1),
                    }
                }
                continue;
            }
            return;
        }
    }

    // ── Identifiers ───────────────────────────────────────────────────────

    /// Scan an identifier `[A-Za-z][A-Za-z0-9_]*`.  Consumes nothing and
    /// returns `None` when the scan position does not start one.
    pub fn parse_identifier(&mut self) -> Option<String> {
        let first = self.current()?;
        if !first.is_ascii_alphabetic() {
            return None;
        }
        let mut ident = String::new();
        while let Some(c) = self.current() {
            if c.is_ascii_alphanumeric() || c == '_' {
                ident.push(c);
                self.advance(1);
            } else {
                break;
            }
        }
        Some(ident)
    }

    /// Lookahead: scan an identifier without moving the cursor.
    pub fn peek_identifier(&self) -> Option<String> {
        self.clone().parse_identifier()
    }

    // ── Numeric literals ──────────────────────────────────────────────────

    /// Parse a C-style numeric literal, then opportunistically extend it
    /// into a clock-time or date literal by peeking at what follows.
    pub fn parse_numeric_literal(&mut self) -> Result<f64, ScriptError> {
        let start = self.position();

        // Hex literal; never extends into time/date forms.
        if self.current() == Some('0') && matches!(self.peek(1), Some('x' | 'X')) {
            self.advance(2);
            let mut digits = String::new();
            while let Some(c) = self.current() {
                if c.is_ascii_hexdigit() {
                    digits.push(c);
                    self.advance(1);
                } else {
                    break;
                }
            }
            return i64::from_str_radix(&digits, 16)
                .map(|n| n as f64)
                .map_err(|_| ScriptError::syntax("invalid hex literal", start));
        }

        let mut int_part = String::new();
        while let Some(c) = self.current() {
            if c.is_ascii_digit() {
                int_part.push(c);
                self.advance(1);
            } else {
                break;
            }
        }
        if int_part.is_empty() {
            return Err(self.syntax("expected number"));
        }

        // Clock time: h:m[:s], in seconds since midnight.
        if self.current() == Some(':') && matches!(self.peek(1), Some(c) if c.is_ascii_digit()) {
            return self.parse_time_tail(&int_part, start);
        }

        // Fraction, date, or plain integer.
        let mut text = int_part.clone();
        if self.current() == Some('.') {
            // dd.monthname date literal.
            if matches!(self.peek(1), Some(c) if c.is_ascii_alphabetic()) {
                self.advance(1);
                return self.parse_month_tail(&int_part, start);
            }
            if matches!(self.peek(1), Some(c) if c.is_ascii_digit()) {
                // Could still be dd.mm. — collect the fraction digits and
                // check for the trailing dot that marks a date.
                let mut frac = String::new();
                let mut probe = self.clone();
                probe.advance(1);
                while let Some(c) = probe.current() {
                    if c.is_ascii_digit() {
                        frac.push(c);
                        probe.advance(1);
                    } else {
                        break;
                    }
                }
                if probe.current() == Some('.') {
                    probe.advance(1);
                    *self = probe;
                    return day_of_year_numeric(&int_part, &frac, start);
                }
                // Ordinary decimal fraction.
                self.advance(1 + frac.chars().count());
                text.push('.');
                text.push_str(&frac);
            }
        }

        // Exponent.
        if matches!(self.current(), Some('e' | 'E'))
            && (matches!(self.peek(1), Some(c) if c.is_ascii_digit())
                || (matches!(self.peek(1), Some('+' | '-'))
                    && matches!(self.peek(2), Some(c) if c.is_ascii_digit())))
        {
            text.push('e');
            self.advance(1);
            if matches!(self.current(), Some('+' | '-')) {
                text.push(self.current().expect("checked above"));
                self.advance(1);
            }
            while let Some(c) = self.current() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.advance(1);
                } else {
                    break;
                }
            }
        }

        text.parse()
            .map_err(|_| ScriptError::syntax("invalid numeric literal", start))
    }

    fn parse_time_tail(&mut self, hours: &str, start: SourcePos) -> Result<f64, ScriptError> {
        self.advance(1); // ':'
        let h: u32 = hours
            .parse()
            .map_err(|_| ScriptError::syntax("invalid hour in time literal", start))?;
        let m = self.parse_two_digit_field("minute", start)?;
        let mut secs = (h * 3600 + m * 60) as f64;
        if self.current() == Some(':') && matches!(self.peek(1), Some(c) if c.is_ascii_digit()) {
            self.advance(1);
            let s = self.parse_two_digit_field("second", start)?;
            secs += s as f64;
        }
        if m >= 60 {
            return Err(ScriptError::syntax("minute out of range", start));
        }
        Ok(secs)
    }

    fn parse_two_digit_field(&mut self, what: &str, start: SourcePos) -> Result<u32, ScriptError> {
        let mut digits = String::new();
        while let Some(c) = self.current() {
            if c.is_ascii_digit() {
                digits.push(c);
                self.advance(1);
            } else {
                break;
            }
        }
        digits
            .parse()
            .map_err(|_| ScriptError::syntax(format!("invalid {what} in time literal"), start))
    }

    fn parse_month_tail(&mut self, day: &str, start: SourcePos) -> Result<f64, ScriptError> {
        let mut name = String::new();
        while let Some(c) = self.current() {
            if c.is_ascii_alphabetic() {
                name.push(c.to_ascii_lowercase());
                self.advance(1);
            } else {
                break;
            }
        }
        let month = MONTH_NAMES
            .iter()
            .position(|m| name.starts_with(m))
            .ok_or_else(|| ScriptError::syntax(format!("unknown month '{name}'"), start))?;
        day_of_year(day, month as u32 + 1, start)
    }

    // ── String literals ───────────────────────────────────────────────────

    /// Parse a string literal at the scan position.
    ///
    /// Double-quoted strings take C-style backslash escapes
    /// (`\n \r \t \xHH \\ \"`, unknown escapes pass the character through);
    /// single-quoted strings have no escapes except doubling the quote.
    pub fn parse_string_literal(&mut self) -> Result<String, ScriptError> {
        let start = self.position();
        match self.current() {
            Some('"') => {
                self.advance(1);
                let mut out = String::new();
                loop {
                    match self.current() {
                        None | Some('\n') => {
                            return Err(ScriptError::syntax("unterminated string", start))
                        }
                        Some('"') => {
                            self.advance(1);
                            return Ok(out);
                        }
                        Some('\\') => {
                            self.advance(1);
                            match self.current() {
                                None => {
                                    return Err(ScriptError::syntax("unterminated string", start))
                                }
                                Some('n') => out.push('\n'),
                                Some('r') => out.push('\r'),
                                Some('t') => out.push('\t'),
                                Some('x') => {
                                    let hi = self.peek(1);
                                    let lo = self.peek(2);
                                    let (Some(hi), Some(lo)) = (hi, lo) else {
                                        return Err(ScriptError::syntax(
                                            "incomplete \\x escape",
                                            start,
                                        ));
                                    };
                                    let byte = u8::from_str_radix(&format!("{hi}{lo}"), 16)
                                        .map_err(|_| {
                                            ScriptError::syntax("invalid \\x escape", start)
                                        })?;
                                    out.push(byte as char);
                                    self.advance(2);
                                }
                                Some(c) => out.push(c),
                            }
                            self.advance(1);
                        }
                        Some(c) => {
                            out.push(c);
                            self.advance(1);
                        }
                    }
                }
            }
            Some('\'') => {
                self.advance(1);
                let mut out = String::new();
                loop {
                    match self.current() {
                        None => return Err(ScriptError::syntax("unterminated string", start)),
                        Some('\'') => {
                            self.advance(1);
                            if self.current() == Some('\'') {
                                // Doubled quote embeds one quote character.
                                out.push('\'');
                                self.advance(1);
                            } else {
                                return Ok(out);
                            }
                        }
                        Some(c) => {
                            out.push(c);
                            self.advance(1);
                        }
                    }
                }
            }
            _ => Err(self.syntax("expected string literal")),
        }
    }

    // ── Structured literals ───────────────────────────────────────────────

    /// Scan a balanced `{...}` or `[...]` structured literal and parse it
    /// as JSON.
    pub fn parse_structured_literal(&mut self) -> Result<JsonValue, ScriptError> {
        let start = self.position();
        let open = match self.current() {
            Some(c @ ('{' | '[')) => c,
            _ => return Err(self.syntax("expected structured literal")),
        };
        let begin = self.pos;
        let mut depth = 0usize;
        let mut in_string = false;
        loop {
            let Some(c) = self.current() else {
                return Err(ScriptError::syntax("unterminated structured literal", start));
            };
            if in_string {
                match c {
                    '\\' => self.advance(1),
                    '"' => in_string = false,
                    _ => {}
                }
                self.advance(1);
                continue;
            }
            match c {
                '"' => in_string = true,
                '{' | '[' => depth += 1,
                '}' | ']' => {
                    depth -= 1;
                    if depth == 0 {
                        self.advance(1);
                        let text = &self.src[begin..self.pos];
                        return serde_json::from_str(text).map_err(|e| {
                            ScriptError::syntax(format!("invalid {open}...{open} literal: {e}"), start)
                        });
                    }
                }
                _ => {}
            }
            self.advance(1);
        }
    }

    // ── Operators ─────────────────────────────────────────────────────────

    /// Scan an operator at the current position, consuming it.  Returns
    /// `None` (cursor unmoved) when no operator starts here.
    pub fn parse_operator(&mut self) -> Option<ScannedOp> {
        let op = match self.current()? {
            ':' if self.peek(1) == Some('=') => {
                self.advance(2);
                return Some(ScannedOp::Assign);
            }
            '=' => {
                if self.peek(1) == Some('=') {
                    self.advance(2);
                    return Some(ScannedOp::Binary(BinaryOp::Eq));
                }
                self.advance(1);
                return Some(ScannedOp::AssignOrEq);
            }
            '!' if self.peek(1) == Some('=') => {
                self.advance(2);
                BinaryOp::Ne
            }
            '<' => {
                if self.peek(1) == Some('=') {
                    self.advance(2);
                    BinaryOp::Le
                } else {
                    self.advance(1);
                    BinaryOp::Lt
                }
            }
            '>' => {
                if self.peek(1) == Some('=') {
                    self.advance(2);
                    BinaryOp::Ge
                } else {
                    self.advance(1);
                    BinaryOp::Gt
                }
            }
            '&' if self.peek(1) == Some('&') => {
                self.advance(2);
                BinaryOp::And
            }
            '|' if self.peek(1) == Some('|') => {
                self.advance(2);
                BinaryOp::Or
            }
            '+' => {
                self.advance(1);
                BinaryOp::Add
            }
            '-' => {
                self.advance(1);
                BinaryOp::Sub
            }
            '*' => {
                self.advance(1);
                BinaryOp::Mul
            }
            // A slash opening a comment is not an operator; skip_non_code
            // normally removes comments first, but stay safe under direct use.
            '/' if !matches!(self.peek(1), Some('/' | '*')) => {
                self.advance(1);
                BinaryOp::Div
            }
            '%' => {
                self.advance(1);
                BinaryOp::Mod
            }
            _ => return None,
        };
        Some(ScannedOp::Binary(op))
    }
}

/// Result of [`SourceCursor::parse_operator`]: operator identity with its
/// precedence available through [`ScannedOp::precedence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannedOp {
    /// `:=` — always assignment.
    Assign,
    /// `=` — assignment in assignable positions, equality elsewhere.
    AssignOrEq,
    Binary(BinaryOp),
}

impl ScannedOp {
    pub fn is_assignment(self) -> bool {
        matches!(self, ScannedOp::Assign | ScannedOp::AssignOrEq)
    }

    /// The binary operator this scan means in a non-assignable position.
    pub fn as_binary(self) -> Option<BinaryOp> {
        match self {
            ScannedOp::Binary(op) => Some(op),
            ScannedOp::AssignOrEq => Some(BinaryOp::Eq),
            ScannedOp::Assign => None,
        }
    }

    pub fn precedence(self) -> u8 {
        match self.as_binary() {
            Some(op) => op.precedence(),
            None => 0,
        }
    }
}

fn day_of_year_numeric(day: &str, month: &str, start: SourcePos) -> Result<f64, ScriptError> {
    let m: u32 = month
        .parse()
        .map_err(|_| ScriptError::syntax("invalid month in date literal", start))?;
    day_of_year(day, m, start)
}

fn day_of_year(day: &str, month: u32, start: SourcePos) -> Result<f64, ScriptError> {
    let d: u32 = day
        .parse()
        .map_err(|_| ScriptError::syntax("invalid day in date literal", start))?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&d) {
        return Err(ScriptError::syntax("date literal out of range", start));
    }
    Ok((MONTH_STARTS[month as usize - 1] + d - 1) as f64)
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn num(src: &str) -> f64 {
        let mut c = SourceCursor::new(src);
        c.parse_numeric_literal().expect("number should parse")
    }

    #[test]
    fn plain_numbers_all_forms_of_42() {
        assert_eq!(num("42"), 42.0);
        assert_eq!(num("0x2A"), 42.0);
        assert_eq!(num("42.0"), 42.0);
    }

    #[test]
    fn decimals_and_exponents() {
        assert_eq!(num("3.25"), 3.25);
        assert_eq!(num("1e3"), 1000.0);
        assert_eq!(num("2.5e-1"), 0.25);
    }

    #[test]
    fn clock_time_literals() {
        assert_eq!(num("14:57:42"), 53862.0);
        assert_eq!(num("14:57"), 53820.0);
        assert_eq!(num("0:05"), 300.0);
    }

    #[test]
    fn date_literals() {
        assert_eq!(num("19.Feb"), 49.0);
        assert_eq!(num("19.2."), 49.0);
        assert_eq!(num("1.Jan"), 0.0);
        assert_eq!(num("31.Dec"), 364.0);
        assert_eq!(num("1.August"), 212.0);
    }

    #[test]
    fn fraction_is_not_a_date_without_trailing_dot() {
        let mut c = SourceCursor::new("19.2 + 1");
        assert_eq!(c.parse_numeric_literal().unwrap(), 19.2);
        c.skip_non_code();
        assert_eq!(c.current(), Some('+'));
    }

    #[test]
    fn bad_month_is_a_syntax_error() {
        let mut c = SourceCursor::new("19.Foo");
        assert!(c.parse_numeric_literal().is_err());
    }

    #[test]
    fn double_quoted_strings() {
        let mut c = SourceCursor::new(r#""a\tb\x41\"q""#);
        assert_eq!(c.parse_string_literal().unwrap(), "a\tbA\"q");
    }

    #[test]
    fn single_quoted_strings_double_the_quote() {
        let mut c = SourceCursor::new("'it''s \\raw'");
        assert_eq!(c.parse_string_literal().unwrap(), "it's \\raw");
    }

    #[test]
    fn unterminated_string_reports_position() {
        let mut c = SourceCursor::new("\"abc");
        let e = c.parse_string_literal().unwrap_err();
        assert!(e.pos.is_some());
    }

    #[test]
    fn skip_non_code_handles_consecutive_comments() {
        let mut c = SourceCursor::new("  // one\n /* two */ // three\n  x");
        c.skip_non_code();
        assert_eq!(c.current(), Some('x'));
        assert_eq!(c.position().line, 3);
    }

    #[test]
    fn identifiers() {
        let mut c = SourceCursor::new("foo_2 bar");
        assert_eq!(c.parse_identifier().unwrap(), "foo_2");
        c.skip_non_code();
        assert_eq!(c.peek_identifier().unwrap(), "bar");
        assert_eq!(c.current(), Some('b'));

        let mut c = SourceCursor::new("_x");
        assert!(c.parse_identifier().is_none());
    }

    #[test]
    fn operators_encode_identity_and_precedence() {
        let mut c = SourceCursor::new("*");
        let op = c.parse_operator().unwrap();
        assert_eq!(op, ScannedOp::Binary(BinaryOp::Mul));
        assert_eq!(op.precedence(), 7);

        let mut c = SourceCursor::new(":=");
        assert_eq!(c.parse_operator().unwrap(), ScannedOp::Assign);

        let mut c = SourceCursor::new("==");
        assert_eq!(c.parse_operator().unwrap(), ScannedOp::Binary(BinaryOp::Eq));

        let mut c = SourceCursor::new("= 1");
        assert_eq!(c.parse_operator().unwrap(), ScannedOp::AssignOrEq);

        let mut c = SourceCursor::new("<= 1");
        assert_eq!(c.parse_operator().unwrap(), ScannedOp::Binary(BinaryOp::Le));

        // Multiplicative binds tighter than additive, which binds tighter
        // than relational.
        assert!(BinaryOp::Mul.precedence() > BinaryOp::Add.precedence());
        assert!(BinaryOp::Add.precedence() > BinaryOp::Lt.precedence());
        assert!(BinaryOp::Lt.precedence() > BinaryOp::Eq.precedence());
        assert!(BinaryOp::Eq.precedence() > BinaryOp::And.precedence());
        assert!(BinaryOp::And.precedence() > BinaryOp::Or.precedence());
    }

    #[test]
    fn comment_slash_is_not_division() {
        let mut c = SourceCursor::new("// x");
        assert!(c.parse_operator().is_none());
    }

    #[test]
    fn structured_literals() {
        let mut c = SourceCursor::new(r#"{"a": [1, "}{"], "b": {"c": 2}} rest"#);
        let j = c.parse_structured_literal().unwrap();
        assert_eq!(j["a"][1], "}{");
        assert_eq!(j["b"]["c"], 2);
        c.skip_non_code();
        assert_eq!(c.peek_identifier().unwrap(), "rest");
    }

    #[test]
    fn bad_structured_literal_is_syntax_error() {
        let mut c = SourceCursor::new("{oops}");
        assert!(c.parse_structured_literal().is_err());
    }

    #[test]
    fn position_tracks_lines_and_columns() {
        let mut c = SourceCursor::new("ab\ncd");
        c.advance(4);
        let p = c.position();
        assert_eq!(p.line, 2);
        assert_eq!(p.column, 2);
        assert_eq!(p.offset, 4);
    }
}
