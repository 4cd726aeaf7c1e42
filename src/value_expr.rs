//! Value Expression Parser
//!
//! Scans raw question text for typed value expressions before generic
//! word-level tokenization: numeric comparisons ("above 50k", "between
//! 20000 and 40000"), date phrases ("last year", "in 2024"), disjunctions
//! ("texas or california") and negations ("not terminated"). Matched
//! phrases are removed from the residual text so their words are never
//! re-resolved as standalone filter values.
//!
//! Each pattern family is its own recognizer returning a tagged enum
//! variant; recognizers run in a fixed order so overlapping phrases
//! ("between X and Y" vs "above X") resolve deterministically.

use chrono::{Datelike, NaiveDate};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Comparison operator carried by a resolved term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Between,
    In,
    NotIn,
    Like,
}

impl CmpOp {
    pub fn sql(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Neq => "!=",
            CmpOp::Gt => ">",
            CmpOp::Gte => ">=",
            CmpOp::Lt => "<",
            CmpOp::Lte => "<=",
            CmpOp::Between => "BETWEEN",
            CmpOp::In => "IN",
            CmpOp::NotIn => "NOT IN",
            CmpOp::Like => "LIKE",
        }
    }
}

/// Numeric comparison extracted from the question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericExpr {
    pub op: CmpOp,
    pub value: f64,
    /// Upper bound for `Between`.
    pub upper: Option<f64>,
    /// The phrase as it appeared in the question.
    pub raw: String,
}

/// Date range extracted from a relative or absolute date phrase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateExpr {
    pub op: CmpOp,
    pub start: NaiveDate,
    /// Inclusive end of the range; None for open-ended (`since 2023`).
    pub end: Option<NaiveDate>,
    pub raw: String,
}

/// Disjunction of two plain-word operands ("texas or california").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrExpr {
    pub operands: Vec<String>,
    pub raw: String,
}

/// Negated operand ("not terminated", "excluding contractors").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegationExpr {
    pub operand: String,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueExpr {
    Numeric(NumericExpr),
    Date(DateExpr),
    Or(OrExpr),
    Negation(NegationExpr),
}

/// Result of the extraction pass: typed expressions plus the question
/// text with every matched phrase blanked out.
#[derive(Debug, Clone)]
pub struct ExtractedExpressions {
    pub expressions: Vec<ValueExpr>,
    pub residual: String,
}

lazy_static! {
    static ref RE_BETWEEN: Regex = Regex::new(
        r"(?i)\bbetween\s+\$?(\d[\d,]*(?:\.\d+)?)\s*([km])?\s+and\s+\$?(\d[\d,]*(?:\.\d+)?)\s*([km])?\b"
    )
    .unwrap();
    static ref RE_ABOVE: Regex = Regex::new(
        r"(?i)\b(above|over|more than|greater than|at least|exceeding)\s+\$?(\d[\d,]*(?:\.\d+)?)\s*([km])?\b"
    )
    .unwrap();
    static ref RE_BELOW: Regex = Regex::new(
        r"(?i)\b(below|under|less than|at most|no more than)\s+\$?(\d[\d,]*(?:\.\d+)?)\s*([km])?\b"
    )
    .unwrap();
    static ref RE_RELATIVE_DATE: Regex =
        Regex::new(r"(?i)\b(last|this|next)\s+(year|month|quarter)\b").unwrap();
    static ref RE_IN_YEAR: Regex =
        Regex::new(r"(?i)\b(?:in|for|during)\s+((?:19|20)\d{2})\b").unwrap();
    static ref RE_SINCE_YEAR: Regex =
        Regex::new(r"(?i)\bsince\s+((?:19|20)\d{2})\b").unwrap();
    static ref RE_NEGATION: Regex = Regex::new(
        r"(?i)\b(?:not|excluding|except|without)\s+([a-z][a-z_\-]*)\b"
    )
    .unwrap();
    static ref RE_OR: Regex =
        Regex::new(r"(?i)\b([a-z][a-z_\-]*)\s+or\s+([a-z][a-z_\-]*)\b").unwrap();
}

/// Scan the question for value expressions and blank their spans out of
/// the residual text. Recognizer order matters: ranges before single
/// comparisons, negations before disjunctions.
pub fn extract_value_expressions(text: &str, reference_date: NaiveDate) -> ExtractedExpressions {
    let mut residual = text.to_string();
    let mut expressions = Vec::new();

    for caps in RE_BETWEEN.captures_iter(text) {
        let low = parse_number(&caps[1], caps.get(2).map(|m| m.as_str()));
        let high = parse_number(&caps[3], caps.get(4).map(|m| m.as_str()));
        expressions.push(ValueExpr::Numeric(NumericExpr {
            op: CmpOp::Between,
            value: low.min(high),
            upper: Some(low.max(high)),
            raw: caps[0].to_string(),
        }));
        blank(&mut residual, whole_span(&caps));
    }

    let snapshot = residual.clone();
    for caps in RE_ABOVE.captures_iter(&snapshot) {
        let op = if caps[1].eq_ignore_ascii_case("at least") {
            CmpOp::Gte
        } else {
            CmpOp::Gt
        };
        expressions.push(ValueExpr::Numeric(NumericExpr {
            op,
            value: parse_number(&caps[2], caps.get(3).map(|m| m.as_str())),
            upper: None,
            raw: caps[0].to_string(),
        }));
        blank(&mut residual, whole_span(&caps));
    }

    let snapshot = residual.clone();
    for caps in RE_BELOW.captures_iter(&snapshot) {
        let keyword = caps[1].to_lowercase();
        let op = if keyword == "at most" || keyword == "no more than" {
            CmpOp::Lte
        } else {
            CmpOp::Lt
        };
        expressions.push(ValueExpr::Numeric(NumericExpr {
            op,
            value: parse_number(&caps[2], caps.get(3).map(|m| m.as_str())),
            upper: None,
            raw: caps[0].to_string(),
        }));
        blank(&mut residual, whole_span(&caps));
    }

    let snapshot = residual.clone();
    for caps in RE_RELATIVE_DATE.captures_iter(&snapshot) {
        let (start, end) = relative_range(&caps[1], &caps[2], reference_date);
        expressions.push(ValueExpr::Date(DateExpr {
            op: CmpOp::Between,
            start,
            end: Some(end),
            raw: caps[0].to_string(),
        }));
        blank(&mut residual, whole_span(&caps));
    }

    let snapshot = residual.clone();
    for caps in RE_SINCE_YEAR.captures_iter(&snapshot) {
        let year: i32 = caps[1].parse().unwrap_or(reference_date.year());
        expressions.push(ValueExpr::Date(DateExpr {
            op: CmpOp::Gte,
            start: NaiveDate::from_ymd_opt(year, 1, 1).unwrap_or(reference_date),
            end: None,
            raw: caps[0].to_string(),
        }));
        blank(&mut residual, whole_span(&caps));
    }

    let snapshot = residual.clone();
    for caps in RE_IN_YEAR.captures_iter(&snapshot) {
        let year: i32 = caps[1].parse().unwrap_or(reference_date.year());
        expressions.push(ValueExpr::Date(DateExpr {
            op: CmpOp::Between,
            start: NaiveDate::from_ymd_opt(year, 1, 1).unwrap_or(reference_date),
            end: NaiveDate::from_ymd_opt(year, 12, 31),
            raw: caps[0].to_string(),
        }));
        blank(&mut residual, whole_span(&caps));
    }

    let snapshot = residual.clone();
    for caps in RE_NEGATION.captures_iter(&snapshot) {
        expressions.push(ValueExpr::Negation(NegationExpr {
            operand: caps[1].to_lowercase(),
            raw: caps[0].to_string(),
        }));
        blank(&mut residual, whole_span(&caps));
    }

    let snapshot = residual.clone();
    for caps in RE_OR.captures_iter(&snapshot) {
        expressions.push(ValueExpr::Or(OrExpr {
            operands: vec![caps[1].to_lowercase(), caps[2].to_lowercase()],
            raw: caps[0].to_string(),
        }));
        blank(&mut residual, whole_span(&caps));
    }

    debug!(
        "Extracted {} value expressions from question",
        expressions.len()
    );

    ExtractedExpressions {
        expressions,
        residual,
    }
}

/// Parse a number with optional thousand separators and a k/m magnitude
/// suffix ("50,000", "50k", "1.2m").
fn parse_number(digits: &str, suffix: Option<&str>) -> f64 {
    let base: f64 = digits.replace(',', "").parse().unwrap_or(0.0);
    match suffix.map(|s| s.to_lowercase()) {
        Some(s) if s == "k" => base * 1_000.0,
        Some(s) if s == "m" => base * 1_000_000.0,
        _ => base,
    }
}

/// Inclusive date range for a (last|this|next) (year|month|quarter)
/// phrase, computed from the caller-supplied reference date so the
/// result is reproducible.
fn relative_range(qualifier: &str, unit: &str, reference: NaiveDate) -> (NaiveDate, NaiveDate) {
    let shift: i32 = match qualifier.to_lowercase().as_str() {
        "last" => -1,
        "next" => 1,
        _ => 0,
    };
    match unit.to_lowercase().as_str() {
        "year" => {
            let year = reference.year() + shift;
            (
                NaiveDate::from_ymd_opt(year, 1, 1).unwrap_or(reference),
                NaiveDate::from_ymd_opt(year, 12, 31).unwrap_or(reference),
            )
        }
        "month" => {
            let total = reference.year() * 12 + reference.month0() as i32 + shift;
            let year = total.div_euclid(12);
            let month = total.rem_euclid(12) as u32 + 1;
            let start = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(reference);
            (start, last_day_of_month(year, month))
        }
        _ => {
            // quarter
            let quarter0 = reference.month0() as i32 / 3 + shift;
            let year = reference.year() + quarter0.div_euclid(4);
            let q = quarter0.rem_euclid(4);
            let start_month = (q * 3) as u32 + 1;
            let start = NaiveDate::from_ymd_opt(year, start_month, 1).unwrap_or(reference);
            (start, last_day_of_month(year, start_month + 2))
        }
    }
}

fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(year, month, 28).unwrap())
}

/// Blank a matched span out of the residual text with same-width spaces,
/// so byte offsets stay valid for the remaining recognizer passes.
/// Spans come from regex matches against the text being edited; locating
/// them through a lowercased copy would shift offsets whenever a
/// character's lowercase form has a different byte length.
fn blank(residual: &mut String, span: std::ops::Range<usize>) {
    let replacement = " ".repeat(span.len());
    residual.replace_range(span, &replacement);
}

/// Byte range of a whole regex match.
fn whole_span(caps: &regex::Captures<'_>) -> std::ops::Range<usize> {
    caps.get(0).map(|m| m.range()).unwrap_or(0..0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 5, 15).unwrap()
    }

    #[test]
    fn test_above_comparison() {
        let out = extract_value_expressions("deductions above 50000", reference());
        assert_eq!(out.expressions.len(), 1);
        match &out.expressions[0] {
            ValueExpr::Numeric(n) => {
                assert_eq!(n.op, CmpOp::Gt);
                assert_eq!(n.value, 50000.0);
            }
            other => panic!("expected numeric, got {:?}", other),
        }
        assert!(!out.residual.contains("50000"));
        assert!(out.residual.contains("deductions"));
    }

    #[test]
    fn test_at_least_is_gte() {
        let out = extract_value_expressions("salary at least 80k", reference());
        match &out.expressions[0] {
            ValueExpr::Numeric(n) => {
                assert_eq!(n.op, CmpOp::Gte);
                assert_eq!(n.value, 80_000.0);
            }
            other => panic!("expected numeric, got {:?}", other),
        }
    }

    #[test]
    fn test_between_range() {
        let out = extract_value_expressions("earnings between 20000 and 40000", reference());
        match &out.expressions[0] {
            ValueExpr::Numeric(n) => {
                assert_eq!(n.op, CmpOp::Between);
                assert_eq!(n.value, 20000.0);
                assert_eq!(n.upper, Some(40000.0));
            }
            other => panic!("expected numeric, got {:?}", other),
        }
        // "and 40000" must not leak into the residual token stream
        assert!(!out.residual.contains("40000"));
    }

    #[test]
    fn test_last_year_range() {
        let out = extract_value_expressions("hired last year", reference());
        match &out.expressions[0] {
            ValueExpr::Date(d) => {
                assert_eq!(d.start, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
                assert_eq!(d.end, Some(NaiveDate::from_ymd_opt(2024, 12, 31).unwrap()));
            }
            other => panic!("expected date, got {:?}", other),
        }
    }

    #[test]
    fn test_last_quarter_crosses_year() {
        let jan = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        let out = extract_value_expressions("paid last quarter", jan);
        match &out.expressions[0] {
            ValueExpr::Date(d) => {
                assert_eq!(d.start, NaiveDate::from_ymd_opt(2024, 10, 1).unwrap());
                assert_eq!(d.end, Some(NaiveDate::from_ymd_opt(2024, 12, 31).unwrap()));
            }
            other => panic!("expected date, got {:?}", other),
        }
    }

    #[test]
    fn test_in_year() {
        let out = extract_value_expressions("terminated in 2023", reference());
        match &out.expressions[0] {
            ValueExpr::Date(d) => {
                assert_eq!(d.start, NaiveDate::from_ymd_opt(2023, 1, 1).unwrap());
                assert_eq!(d.end, Some(NaiveDate::from_ymd_opt(2023, 12, 31).unwrap()));
            }
            other => panic!("expected date, got {:?}", other),
        }
    }

    #[test]
    fn test_negation() {
        let out = extract_value_expressions("employees not terminated", reference());
        match &out.expressions[0] {
            ValueExpr::Negation(n) => assert_eq!(n.operand, "terminated"),
            other => panic!("expected negation, got {:?}", other),
        }
        assert!(!out.residual.to_lowercase().contains("terminated"));
    }

    #[test]
    fn test_disjunction() {
        let out = extract_value_expressions("employees in texas or california", reference());
        match &out.expressions[0] {
            ValueExpr::Or(o) => {
                assert_eq!(o.operands, vec!["texas".to_string(), "california".to_string()]);
            }
            other => panic!("expected or-expression, got {:?}", other),
        }
    }

    #[test]
    fn test_negation_wins_over_disjunction_span() {
        // "not full-time or part-time": negation consumes its operand first
        let out =
            extract_value_expressions("workers not contractors or interns", reference());
        let negations: Vec<_> = out
            .expressions
            .iter()
            .filter(|e| matches!(e, ValueExpr::Negation(_)))
            .collect();
        assert_eq!(negations.len(), 1);
    }

    #[test]
    fn test_multibyte_text_blanks_cleanly() {
        // 'İ' lowercases to two code points; offsets must come from the
        // text being edited, not a lowercased copy.
        let out =
            extract_value_expressions("İstanbul employees not terminated", reference());
        match &out.expressions[0] {
            ValueExpr::Negation(n) => assert_eq!(n.operand, "terminated"),
            other => panic!("expected negation, got {:?}", other),
        }
        assert!(out.residual.contains("İstanbul"));
        assert!(!out.residual.contains("terminated"));
    }

    #[test]
    fn test_determinism() {
        let a = extract_value_expressions("pay above 10k in 2024 not bonus", reference());
        let b = extract_value_expressions("pay above 10k in 2024 not bonus", reference());
        assert_eq!(a.expressions, b.expressions);
        assert_eq!(a.residual, b.residual);
    }
}
