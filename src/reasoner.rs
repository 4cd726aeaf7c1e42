//! Metadata Reasoner
//!
//! Fallback resolver for terms the Term Index does not know. Reasons over
//! live schema metadata in two strictly ordered passes:
//!
//! 1. Column-name matching: if the term is (a close variant of) an actual
//!    column name, return it as a selection/GROUP BY target with high
//!    confidence, preferring non-configuration tables.
//! 2. Text-content search: classify the term shape (code-like, name-like,
//!    free keyword) and search description/code/name columns within tables
//!    of a hinted domain, with confidence capped below the Term Index
//!    range so the index always wins on conflict.
//!
//! The ordering is a correctness property: a term that names the very
//! column the question groups by must never become a text-search filter.

use crate::schema::{ColumnRole, SchemaIndex, TableType};
use crate::term_index::{
    normalize_term, ColumnRef, MatchSource, MatchValue, ScalarValue, TermKind, TermMatch,
};
use crate::value_expr::CmpOp;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::Arc;
use strsim::jaro_winkler;
use tracing::debug;

/// Confidence for an exact column-name hit.
const COLUMN_NAME_EXACT: f64 = 0.95;
/// Confidence for a close-variant column-name hit.
const COLUMN_NAME_FUZZY: f64 = 0.85;
/// Similarity floor for treating a term as a column-name variant.
const FUZZY_THRESHOLD: f64 = 0.92;
/// Hard ceiling for text-search matches; must stay below the Term
/// Index's own confidence range.
const TEXT_SEARCH_CAP: f64 = 0.75;

lazy_static! {
    /// Static term -> domain hints used to scope text-content search.
    static ref DOMAIN_HINTS: HashMap<&'static str, &'static str> = {
        let mut hints = HashMap::new();
        hints.insert("salary", "earnings");
        hints.insert("pay", "earnings");
        hints.insert("wage", "earnings");
        hints.insert("bonus", "earnings");
        hints.insert("overtime", "earnings");
        hints.insert("commission", "earnings");
        hints.insert("earning", "earnings");
        hints.insert("deduction", "deductions");
        hints.insert("garnishment", "deductions");
        hints.insert("tax", "taxes");
        hints.insert("federal", "taxes");
        hints.insert("medicare", "taxes");
        hints.insert("withholding", "taxes");
        hints.insert("address", "demographics");
        hints.insert("gender", "demographics");
        hints.insert("birth", "demographics");
        hints.insert("employee", "demographics");
        hints.insert("department", "demographics");
        hints.insert("benefit", "benefits");
        hints.insert("insurance", "benefits");
        hints
    };
}

/// Shape classification for unknown terms, used to pick which column
/// roles to search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TermShape {
    CodeLike,
    NameLike,
    Keyword,
}

pub struct MetadataReasoner {
    schema: Arc<SchemaIndex>,
}

impl MetadataReasoner {
    pub fn new(schema: Arc<SchemaIndex>) -> Self {
        Self { schema }
    }

    /// Resolve a term the Term Index did not know. Returns matches in
    /// descending priority order; empty when the reasoner declines too.
    pub fn resolve_unknown(&self, term: &str, context_domain: Option<&str>) -> Vec<TermMatch> {
        let column_matches = self.match_column_name(term);
        if !column_matches.is_empty() {
            debug!(
                "Reasoner resolved '{}' as column name ({} candidates)",
                term,
                column_matches.len()
            );
            return column_matches;
        }
        self.text_content_search(term, context_domain)
    }

    /// Pass 1: the term equals (or closely resembles) a column name
    /// somewhere in the schema. Non-configuration tables outrank
    /// configuration tables exposing the same column.
    fn match_column_name(&self, term: &str) -> Vec<TermMatch> {
        let needle = normalize_term(term);
        if needle.is_empty() {
            return Vec::new();
        }

        let mut candidates: Vec<(ColumnRef, f64, bool)> = Vec::new();
        for profile in &self.schema.profiles {
            let column_norm = normalize_term(&profile.column);
            let confidence = if column_norm == needle {
                COLUMN_NAME_EXACT
            } else if jaro_winkler(&column_norm, &needle) >= FUZZY_THRESHOLD {
                COLUMN_NAME_FUZZY
            } else {
                continue;
            };
            let is_config = self.schema.is_config_table(&profile.table);
            candidates.push((
                ColumnRef::new(&profile.table, &profile.column),
                confidence,
                is_config,
            ));
        }

        // Non-config first, then by confidence, then by name for stability.
        candidates.sort_by(|a, b| {
            a.2.cmp(&b.2)
                .then(b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.0.table.cmp(&b.0.table))
        });

        candidates
            .into_iter()
            .map(|(target, confidence, _)| {
                let classification = self.schema.classification(&target.table);
                TermMatch {
                    term: term.to_string(),
                    target: Some(target),
                    operator: CmpOp::Eq,
                    match_value: MatchValue::None,
                    domain: classification.map(|c| c.domain.clone()),
                    entity: classification.map(|c| c.entity_type.clone()),
                    confidence,
                    term_kind: TermKind::Concept,
                    source: MatchSource::Reasoner,
                }
            })
            .collect()
    }

    /// Pass 2: search text-typed columns for the term, scoped to a domain
    /// inferred from the hint table (or the caller-provided context).
    fn text_content_search(&self, term: &str, context_domain: Option<&str>) -> Vec<TermMatch> {
        let shape = classify_shape(term);
        // Without a domain to scope the search the reasoner declines
        // rather than scanning every text column in the schema.
        let hinted_domain = match hint_domain(term).or(context_domain) {
            Some(domain) => domain,
            None => return Vec::new(),
        };

        let (roles, confidence): (&[ColumnRole], f64) = match shape {
            TermShape::CodeLike => (&[ColumnRole::Code], 0.7),
            TermShape::NameLike => (&[ColumnRole::Name, ColumnRole::Description], 0.65),
            TermShape::Keyword => (&[ColumnRole::Description], 0.6),
        };
        let confidence = confidence.min(TEXT_SEARCH_CAP);

        let mut matches = Vec::new();
        for profile in &self.schema.profiles {
            if !roles.contains(&profile.role) {
                continue;
            }
            let classification = self.schema.classification(&profile.table);
            match classification {
                Some(c) if c.domain.eq_ignore_ascii_case(hinted_domain)
                    && c.table_type != TableType::Config => {}
                _ => continue,
            }

            matches.push(TermMatch {
                term: term.to_string(),
                target: Some(ColumnRef::new(&profile.table, &profile.column)),
                operator: CmpOp::Like,
                match_value: MatchValue::Single(ScalarValue::Text(format!("%{}%", term))),
                domain: classification.map(|c| c.domain.clone()),
                entity: classification.map(|c| c.entity_type.clone()),
                confidence,
                term_kind: TermKind::Reasoned,
                source: MatchSource::Reasoner,
            });
        }

        matches.sort_by(|a, b| {
            a.target
                .as_ref()
                .map(|t| t.table.clone())
                .cmp(&b.target.as_ref().map(|t| t.table.clone()))
        });
        if !matches.is_empty() {
            debug!(
                "Reasoner text search for '{}' ({:?}) found {} candidates",
                term,
                shape,
                matches.len()
            );
        }
        matches
    }
}

fn classify_shape(term: &str) -> TermShape {
    let compact: String = term.chars().filter(|c| c.is_alphanumeric()).collect();
    if compact.len() <= 6 && compact.chars().any(|c| c.is_ascii_digit()) {
        return TermShape::CodeLike;
    }
    if compact.len() <= 4 && term.chars().all(|c| !c.is_whitespace()) {
        return TermShape::CodeLike;
    }
    if compact.chars().all(|c| c.is_alphabetic()) && compact.len() > 4 {
        return TermShape::NameLike;
    }
    TermShape::Keyword
}

/// Static term -> domain hint lookup, shared with intent classification.
pub fn hint_domain(term: &str) -> Option<&'static str> {
    let normalized = normalize_term(term);
    // singular-ish stem so "deductions" hits the "deduction" hint
    let stem = normalized.strip_suffix('s').unwrap_or(&normalized);
    DOMAIN_HINTS
        .get(normalized.as_str())
        .or_else(|| DOMAIN_HINTS.get(stem))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnProfile, InferredType, TableClassification};

    fn profile(table: &str, column: &str, role: ColumnRole) -> ColumnProfile {
        ColumnProfile {
            table: table.to_string(),
            column: column.to_string(),
            inferred_type: InferredType::Text,
            role,
            distinct_count: 50,
            top_values: vec![],
            filter_category: None,
        }
    }

    fn classification(table: &str, table_type: TableType, domain: &str) -> TableClassification {
        TableClassification {
            table: table.to_string(),
            table_type,
            domain: domain.to_string(),
            entity_type: "employee".to_string(),
        }
    }

    fn schema() -> Arc<SchemaIndex> {
        Arc::new(SchemaIndex::new(
            vec![
                profile("employees", "department", ColumnRole::Name),
                profile("dept_config", "department", ColumnRole::Name),
                profile("earnings", "pay_description", ColumnRole::Description),
                profile("earnings", "pay_code", ColumnRole::Code),
            ],
            vec![
                classification("employees", TableType::Master, "demographics"),
                classification("dept_config", TableType::Config, "demographics"),
                classification("earnings", TableType::Transaction, "earnings"),
            ],
            vec![],
            vec![],
            vec![],
            vec![],
        ))
    }

    #[test]
    fn test_column_name_beats_text_search() {
        let reasoner = MetadataReasoner::new(schema());
        let matches = reasoner.resolve_unknown("department", None);
        assert!(!matches.is_empty());
        assert_eq!(matches[0].term_kind, TermKind::Concept);
        assert!(matches[0].confidence >= 0.85);
    }

    #[test]
    fn test_non_config_table_ranked_first() {
        let reasoner = MetadataReasoner::new(schema());
        let matches = reasoner.resolve_unknown("department", None);
        assert_eq!(
            matches[0].target.as_ref().unwrap().table,
            "employees".to_string()
        );
    }

    #[test]
    fn test_close_variant_column_name() {
        let reasoner = MetadataReasoner::new(schema());
        let matches = reasoner.resolve_unknown("departments", None);
        assert_eq!(matches[0].term_kind, TermKind::Concept);
    }

    #[test]
    fn test_text_search_confidence_capped() {
        let reasoner = MetadataReasoner::new(schema());
        let matches = reasoner.resolve_unknown("bonus", None);
        assert!(!matches.is_empty());
        for m in &matches {
            assert!(m.confidence <= TEXT_SEARCH_CAP);
            assert_eq!(m.term_kind, TermKind::Reasoned);
            assert_eq!(m.operator, CmpOp::Like);
        }
    }

    #[test]
    fn test_domain_hint_scopes_search() {
        let reasoner = MetadataReasoner::new(schema());
        // "overtime" hints at the earnings domain
        let matches = reasoner.resolve_unknown("overtime", None);
        assert!(matches
            .iter()
            .all(|m| m.domain.as_deref() == Some("earnings")));
    }

    #[test]
    fn test_unknown_term_without_domain_declines() {
        let reasoner = MetadataReasoner::new(schema());
        // nothing in the hint table and no context domain
        assert!(reasoner.resolve_unknown("zorblex", None).is_empty());
    }
}
