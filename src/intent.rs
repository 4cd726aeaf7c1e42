//! Intent & Domain Classification
//!
//! Classifies a question into an operation (count/list/sum/average/
//! minimum/maximum/compare) and a coarse subject-matter domain, and
//! extracts the GROUP BY dimension phrase and the aggregation target
//! noun. Extracted phrases are blanked out of the residual text so they
//! are re-resolved as column targets, never as filter values.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Count,
    List,
    Sum,
    Average,
    Minimum,
    Maximum,
    Compare,
}

impl Operation {
    pub fn is_aggregation(&self) -> bool {
        matches!(
            self,
            Operation::Sum | Operation::Average | Operation::Minimum | Operation::Maximum
        )
    }
}

/// One per question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedIntent {
    pub operation: Operation,
    pub domain: Option<String>,
}

/// Full classification output: intent plus the extracted dimension and
/// aggregation-target phrases, and the question text with both removed.
#[derive(Debug, Clone)]
pub struct IntentExtraction {
    pub intent: ParsedIntent,
    pub group_by: Option<String>,
    pub aggregation_target: Option<String>,
    pub residual: String,
}

lazy_static! {
    static ref RE_GROUP_BY: Regex = Regex::new(
        r"(?i)\b(?:broken down by|grouped by|for each|by|per)\s+([a-z][a-z_]*)(?:\s+([a-z][a-z_]*))?"
    )
    .unwrap();
    static ref RE_AGG_TARGET: Regex = Regex::new(
        r"(?i)\b(?:average|avg|mean|total|sum|minimum|min|maximum|max|highest|lowest)\s+(?:of\s+)?([a-z][a-z_]*)(?:\s+([a-z][a-z_]*))?"
    )
    .unwrap();
    static ref STOP_WORDS: HashSet<&'static str> = [
        "a", "an", "the", "of", "in", "on", "at", "for", "to", "with", "and", "or", "is",
        "are", "was", "were", "do", "does", "did", "have", "has", "had", "how", "many",
        "much", "what", "which", "who", "whose", "all", "any", "each", "every", "our",
        "their", "there", "this", "that", "these", "those", "show", "me", "list", "count",
        "number", "give", "get", "find", "tell", "us", "per", "by",
        // operation keywords; consumed by intent detection, never filters
        "total", "sum", "average", "avg", "mean", "minimum", "min", "maximum", "max",
        "highest", "lowest", "compare",
    ]
    .into_iter()
    .collect();
}

pub fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(word.to_lowercase().as_str())
}

#[derive(Debug, Default)]
pub struct IntentClassifier;

impl IntentClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify operation + domain without phrase extraction.
    pub fn classify(&self, question: &str) -> ParsedIntent {
        let lower = question.to_lowercase();
        let operation = detect_operation(&lower);
        ParsedIntent {
            operation,
            domain: detect_domain(&lower),
        }
    }

    /// Classify and extract GROUP BY / aggregation-target phrases,
    /// blanking them out of the residual text.
    pub fn analyze(&self, question: &str) -> IntentExtraction {
        // The residual is the lowercased text so blanking can use the
        // capture byte ranges directly; lowercasing can change a
        // character's byte length, so original-string offsets would drift.
        let lower = question.to_lowercase();
        let mut residual = lower.clone();

        let mut operation = detect_operation(&lower);

        let aggregation_target = RE_AGG_TARGET.captures(&lower).and_then(|caps| {
            let phrase = capture_phrase(&caps);
            if phrase.is_empty() {
                return None;
            }
            if let Some(first) = caps.get(1) {
                blank_phrase(&mut residual, first.range());
            }
            if let Some(second) = caps.get(2) {
                if !is_stop_word(second.as_str()) {
                    blank_phrase(&mut residual, second.range());
                }
            }
            Some(phrase)
        });

        let group_by = RE_GROUP_BY.captures(&lower).and_then(|caps| {
            let phrase = capture_phrase(&caps);
            if phrase.is_empty() || Some(phrase.as_str()) == aggregation_target.as_deref() {
                return None;
            }
            if let Some(first) = caps.get(1) {
                blank_phrase(&mut residual, first.range());
            }
            if phrase.contains(' ') {
                if let Some(second) = caps.get(2) {
                    blank_phrase(&mut residual, second.range());
                }
            }
            Some(phrase)
        });

        // A detected dimension without an aggregation keyword is a count.
        if group_by.is_some() && !operation.is_aggregation() && operation != Operation::Compare {
            operation = Operation::Count;
        }

        debug!(
            "Intent: {:?}, group_by: {:?}, aggregation_target: {:?}",
            operation, group_by, aggregation_target
        );

        IntentExtraction {
            intent: ParsedIntent {
                operation,
                domain: detect_domain(&lower),
            },
            group_by,
            aggregation_target,
            residual,
        }
    }
}

/// Two-word phrases are preferred over one-word to catch compounds like
/// "job code"; a trailing stop word drops the capture back to one word.
fn capture_phrase(caps: &regex::Captures<'_>) -> String {
    let first = caps.get(1).map(|m| m.as_str()).unwrap_or("");
    if is_stop_word(first) {
        return String::new();
    }
    match caps.get(2) {
        Some(second) if !is_stop_word(second.as_str()) => {
            format!("{} {}", first, second.as_str())
        }
        _ => first.to_string(),
    }
}

fn detect_operation(lower: &str) -> Operation {
    if lower.contains("compare") || lower.contains(" versus ") || lower.contains(" vs ") {
        return Operation::Compare;
    }
    if lower.contains("average") || lower.contains("avg") || lower.contains("mean ") {
        return Operation::Average;
    }
    if lower.contains("sum of") || lower.contains("total") || lower.contains("sum ") {
        return Operation::Sum;
    }
    if lower.contains("minimum") || lower.contains("lowest") || lower.contains("smallest") {
        return Operation::Minimum;
    }
    if lower.contains("maximum") || lower.contains("highest") || lower.contains("largest") {
        return Operation::Maximum;
    }
    if lower.contains("how many") || lower.contains("count") || lower.contains("number of") {
        return Operation::Count;
    }
    if lower.starts_with("list")
        || lower.starts_with("show")
        || lower.starts_with("which")
        || lower.starts_with("who")
        || lower.starts_with("give")
    {
        return Operation::List;
    }
    Operation::Count
}

fn detect_domain(lower: &str) -> Option<String> {
    for word in lower.split_whitespace() {
        let cleaned: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
        if let Some(domain) = crate::reasoner::hint_domain(&cleaned) {
            return Some(domain.to_string());
        }
    }
    None
}

/// Blank a captured span out of the residual with same-width spaces so
/// the remaining capture offsets stay valid.
fn blank_phrase(residual: &mut String, span: std::ops::Range<usize>) {
    let replacement = " ".repeat(span.len());
    residual.replace_range(span, &replacement);
}
