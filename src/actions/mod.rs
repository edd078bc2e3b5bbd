pub mod counter;
pub mod history;
pub mod special;

use serde_json::Value;

use crate::error::ValidationError;
use crate::state::record::count_from_value;

pub use counter::Admin;
pub use history::HistoryLog;
pub use special::SpecialChannel;

// ── Ops ─────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Set,
    Add,
    Reset,
}

pub fn apply(op: Op, base: i64, n: i64) -> i64 {
    match op {
        Op::Set => n,
        Op::Add => base.saturating_add(n),
        Op::Reset => 0,
    }
}

// ── Input ───────────────────────────────────────────────────────────────────

/// Parse an amount typed into the admin panel, e.g. `4.000.000` or
/// `1.250,00 kr`.
///
/// Everything except digits, `.` and `,` is dropped. `.` is a thousands
/// separator, `,` the decimal mark. The tally is integral, so a non-zero
/// fractional part is rejected rather than rounded.
pub fn parse_amount(input: &str) -> Result<i64, ValidationError> {
    let sanitized: String = input
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    if sanitized.is_empty() {
        return Err(ValidationError::Empty);
    }

    let digits = sanitized.replace('.', "");
    let (whole, fraction) = match digits.split_once(',') {
        Some((w, f)) => (w, f),
        None => (digits.as_str(), ""),
    };
    if fraction.contains(',') || (whole.is_empty() && fraction.is_empty()) {
        return Err(ValidationError::Format);
    }
    if fraction.chars().any(|c| c != '0') {
        return Err(ValidationError::Fractional);
    }
    if whole.is_empty() {
        return Ok(0);
    }
    whole.parse::<i64>().map_err(|_| ValidationError::Format)
}

/// Accept either a JSON number or admin-panel text.
pub fn amount_from_input(v: &Value) -> Result<i64, ValidationError> {
    match v {
        Value::String(s) => parse_amount(s),
        other => count_from_value(other).ok_or(ValidationError::NotANumber),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn apply_ops() {
        assert_eq!(apply(Op::Set, 10, 3), 3);
        assert_eq!(apply(Op::Add, 10, 3), 13);
        assert_eq!(apply(Op::Add, i64::MAX, 1), i64::MAX);
        assert_eq!(apply(Op::Reset, 10, 3), 0);
    }

    #[test]
    fn parses_danish_formatted_amounts() {
        assert_eq!(parse_amount("4.000.000"), Ok(4_000_000));
        assert_eq!(parse_amount("1.250,00 kr"), Ok(1250));
        assert_eq!(parse_amount("  750 "), Ok(750));
        assert_eq!(parse_amount(",00"), Ok(0));
    }

    #[test]
    fn rejects_bad_amounts() {
        assert_eq!(parse_amount(""), Err(ValidationError::Empty));
        assert_eq!(parse_amount("abc"), Err(ValidationError::Empty));
        assert_eq!(parse_amount("12,5"), Err(ValidationError::Fractional));
        assert_eq!(parse_amount("1,2,3"), Err(ValidationError::Format));
        assert_eq!(parse_amount("."), Err(ValidationError::Format));
        assert_eq!(
            parse_amount("99999999999999999999"),
            Err(ValidationError::Format)
        );
    }

    #[test]
    fn input_accepts_numbers_and_text() {
        assert_eq!(amount_from_input(&json!(150)), Ok(150));
        assert_eq!(amount_from_input(&json!("2.500")), Ok(2500));
        assert_eq!(amount_from_input(&json!(true)), Err(ValidationError::NotANumber));
        assert_eq!(amount_from_input(&json!(1.5)), Err(ValidationError::NotANumber));
    }
}
