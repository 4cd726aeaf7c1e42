//! Term Index
//!
//! Per-tenant, write-once/read-many map from lexical terms to candidate
//! schema locations. Built at data-load time from profiled column values,
//! synonym entries, lookup-table rows (code <-> description, reversible)
//! and hub column names. Lookup is exact or normalized-variant match;
//! unmatched terms are simply absent from the result list.
//!
//! Rebuilds swap a fresh snapshot into the `TenantIndexHandle` under a
//! write lock; concurrent resolutions read the previous snapshot until
//! the swap completes.

use crate::schema::SchemaIndex;
use crate::value_expr::CmpOp;
use chrono::NaiveDate;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Kind tag carried by every term match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermKind {
    /// Identifies a column, not a filter value (excluded from WHERE).
    Concept,
    Synonym,
    Value,
    Numeric,
    Date,
    Reasoned,
    Lookup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    TermIndex,
    Reasoner,
    Relationship,
}

/// A concrete (table, column) target. Kept as one struct so a match can
/// never carry a table without a column or vice versa.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(table: &str, column: &str) -> Self {
        Self {
            table: table.to_string(),
            column: column.to_string(),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

/// A literal value destined for the bound-parameter list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarValue {
    Text(String),
    Number(f64),
    Integer(i64),
    Date(NaiveDate),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Text(s) => write!(f, "{}", s),
            ScalarValue::Number(n) => write!(f, "{}", n),
            ScalarValue::Integer(i) => write!(f, "{}", i),
            ScalarValue::Date(d) => write!(f, "{}", d),
        }
    }
}

/// Value shape a match resolves to; drives predicate expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchValue {
    /// No literal (concept / selection-target matches).
    None,
    Single(ScalarValue),
    List(Vec<ScalarValue>),
    Range(ScalarValue, ScalarValue),
}

/// A term resolved to a candidate schema location. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermMatch {
    pub term: String,
    pub target: Option<ColumnRef>,
    pub operator: CmpOp,
    pub match_value: MatchValue,
    pub domain: Option<String>,
    pub entity: Option<String>,
    pub confidence: f64,
    pub term_kind: TermKind,
    pub source: MatchSource,
}

/// One stored index entry for a term.
#[derive(Debug, Clone)]
struct TermEntry {
    target: Option<ColumnRef>,
    value: Option<String>,
    domain: Option<String>,
    entity: Option<String>,
    confidence: f64,
    kind: TermKind,
}

/// The per-tenant lookup structure. Write-once at build, read-many after.
#[derive(Debug, Default)]
pub struct TermIndex {
    entries: HashMap<String, Vec<TermEntry>>,
}

impl TermIndex {
    /// Build the index from a schema snapshot.
    pub fn build(schema: &SchemaIndex) -> Self {
        let mut entries: HashMap<String, Vec<TermEntry>> = HashMap::new();
        let mut add = |term: &str, entry: TermEntry| {
            let key = normalize_term(term);
            if key.is_empty() {
                return;
            }
            entries.entry(key).or_default().push(entry);
        };

        // (a) profiled column values
        for profile in &schema.profiles {
            let classification = schema.classification(&profile.table);
            for value in &profile.top_values {
                add(
                    value,
                    TermEntry {
                        target: Some(ColumnRef::new(&profile.table, &profile.column)),
                        value: Some(value.clone()),
                        domain: classification.map(|c| c.domain.clone()),
                        entity: classification.map(|c| c.entity_type.clone()),
                        confidence: 0.9,
                        kind: TermKind::Value,
                    },
                );
            }
        }

        // (b) synonym seed records ("texas" -> "TX")
        for synonym in &schema.synonyms {
            let classification = schema.classification(&synonym.table);
            add(
                &synonym.term,
                TermEntry {
                    target: Some(ColumnRef::new(&synonym.table, &synonym.column)),
                    value: Some(synonym.canonical_value.clone()),
                    domain: synonym
                        .domain
                        .clone()
                        .or_else(|| classification.map(|c| c.domain.clone())),
                    entity: classification.map(|c| c.entity_type.clone()),
                    confidence: 0.85,
                    kind: TermKind::Synonym,
                },
            );
        }

        // (c) lookup tables, reversible: description -> code and code -> code
        for lookup in &schema.lookups {
            let target = ColumnRef::new(&lookup.table, &lookup.code_column);
            let entry = TermEntry {
                target: Some(target.clone()),
                value: Some(lookup.code.clone()),
                domain: lookup.domain.clone(),
                entity: None,
                confidence: 0.85,
                kind: TermKind::Lookup,
            };
            add(&lookup.description, entry.clone());
            add(&lookup.code, entry);
        }

        // (d) hub columns resolve as concepts, never as filter values
        for hub in &schema.hub_columns {
            add(
                hub,
                TermEntry {
                    target: None,
                    value: None,
                    domain: None,
                    entity: None,
                    confidence: 0.9,
                    kind: TermKind::Concept,
                },
            );
        }

        let index = Self { entries };
        info!("Built term index with {} distinct terms", index.entries.len());
        index
    }

    /// Resolve a token stream against the index. Adjacent token pairs are
    /// tried before single tokens so compound values ("job code", "new
    /// york") win over their parts; matched pairs consume both tokens.
    pub fn resolve(&self, terms: &[String]) -> Vec<TermMatch> {
        let mut matches = Vec::new();
        let mut i = 0;
        while i < terms.len() {
            if i + 1 < terms.len() {
                let bigram = format!("{} {}", terms[i], terms[i + 1]);
                let found = self.resolve_one(&bigram);
                if !found.is_empty() {
                    matches.extend(found);
                    i += 2;
                    continue;
                }
            }
            matches.extend(self.resolve_one(&terms[i]));
            i += 1;
        }
        matches
    }

    /// Resolve a single term through its normalized variants.
    pub fn resolve_one(&self, term: &str) -> Vec<TermMatch> {
        for variant in term_variants(term) {
            if let Some(entries) = self.entries.get(&variant) {
                debug!("Term '{}' matched {} index entries", term, entries.len());
                return entries
                    .iter()
                    .map(|e| TermMatch {
                        term: term.to_string(),
                        target: e.target.clone(),
                        operator: CmpOp::Eq,
                        match_value: e
                            .value
                            .as_ref()
                            .map(|v| MatchValue::Single(ScalarValue::Text(v.clone())))
                            .unwrap_or(MatchValue::None),
                        domain: e.domain.clone(),
                        entity: e.entity.clone(),
                        confidence: e.confidence,
                        term_kind: e.kind,
                        source: MatchSource::TermIndex,
                    })
                    .collect();
            }
        }
        Vec::new()
    }

    pub fn contains(&self, term: &str) -> bool {
        term_variants(term)
            .iter()
            .any(|v| self.entries.contains_key(v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Canonical key form: lowercase, hyphens/underscores as spaces,
/// collapsed whitespace.
pub fn normalize_term(term: &str) -> String {
    let lowered = term.to_lowercase().replace(['_', '-'], " ");
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized lookup variants tried in order: as-is, then with a naive
/// plural stripped.
fn term_variants(term: &str) -> Vec<String> {
    let base = normalize_term(term);
    let mut variants = vec![base.clone()];
    if let Some(stripped) = base.strip_suffix("es") {
        if stripped.len() > 2 {
            variants.push(stripped.to_string());
        }
    }
    if let Some(stripped) = base.strip_suffix('s') {
        if stripped.len() > 2 && !variants.contains(&stripped.to_string()) {
            variants.push(stripped.to_string());
        }
    }
    variants
}

/// Versioned snapshot holder for one tenant's term index.
///
/// Readers clone the `Arc` and never block each other; a rebuild swaps
/// the snapshot under the write lock (single-writer, multi-reader).
pub struct TenantIndexHandle {
    inner: RwLock<IndexSnapshot>,
}

struct IndexSnapshot {
    version: u64,
    index: Arc<TermIndex>,
}

impl TenantIndexHandle {
    pub fn new(index: TermIndex) -> Self {
        Self {
            inner: RwLock::new(IndexSnapshot {
                version: 1,
                index: Arc::new(index),
            }),
        }
    }

    /// Current snapshot; the returned handle stays valid across swaps.
    pub fn snapshot(&self) -> Arc<TermIndex> {
        self.inner
            .read()
            .expect("term index lock poisoned")
            .index
            .clone()
    }

    pub fn version(&self) -> u64 {
        self.inner.read().expect("term index lock poisoned").version
    }

    /// Replace the snapshot after an index rebuild. Returns the new version.
    pub fn swap(&self, index: TermIndex) -> u64 {
        let mut guard = self.inner.write().expect("term index lock poisoned");
        guard.version += 1;
        guard.index = Arc::new(index);
        guard.version
    }
}

/// Concurrent registry of tenant handles.
#[derive(Default)]
pub struct TenantRegistry {
    handles: DashMap<String, Arc<TenantIndexHandle>>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tenant_id: &str) -> Option<Arc<TenantIndexHandle>> {
        self.handles.get(tenant_id).map(|h| h.clone())
    }

    /// Install or replace a tenant's index; returns the handle.
    pub fn install(&self, tenant_id: &str, index: TermIndex) -> Arc<TenantIndexHandle> {
        if let Some(handle) = self.get(tenant_id) {
            handle.swap(index);
            handle
        } else {
            let handle = Arc::new(TenantIndexHandle::new(index));
            self.handles.insert(tenant_id.to_string(), handle.clone());
            handle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{
        ColumnProfile, ColumnRole, InferredType, LookupEntry, SynonymEntry, TableClassification,
        TableType,
    };

    fn schema() -> SchemaIndex {
        SchemaIndex::new(
            vec![ColumnProfile {
                table: "employees".to_string(),
                column: "status".to_string(),
                inferred_type: InferredType::Text,
                role: ColumnRole::Status,
                distinct_count: 3,
                top_values: vec!["Active".to_string(), "Terminated".to_string()],
                filter_category: Some("status".to_string()),
            }],
            vec![TableClassification {
                table: "employees".to_string(),
                table_type: TableType::Master,
                domain: "demographics".to_string(),
                entity_type: "employee".to_string(),
            }],
            vec![],
            vec![SynonymEntry {
                term: "texas".to_string(),
                table: "employees".to_string(),
                column: "work_state".to_string(),
                canonical_value: "TX".to_string(),
                domain: None,
            }],
            vec![LookupEntry {
                table: "pay_codes".to_string(),
                code_column: "pay_code".to_string(),
                description_column: "description".to_string(),
                code: "BON".to_string(),
                description: "Bonus".to_string(),
                domain: Some("earnings".to_string()),
            }],
            vec!["employee_id".to_string()],
        )
    }

    #[test]
    fn test_value_lookup() {
        let index = TermIndex::build(&schema());
        let matches = index.resolve_one("terminated");
        assert_eq!(matches.len(), 1);
        let m = &matches[0];
        assert_eq!(m.target, Some(ColumnRef::new("employees", "status")));
        assert_eq!(m.term_kind, TermKind::Value);
        assert_eq!(
            m.match_value,
            MatchValue::Single(ScalarValue::Text("Terminated".to_string()))
        );
    }

    #[test]
    fn test_synonym_maps_to_canonical_value() {
        let index = TermIndex::build(&schema());
        let matches = index.resolve_one("texas");
        assert_eq!(matches[0].term_kind, TermKind::Synonym);
        assert_eq!(
            matches[0].match_value,
            MatchValue::Single(ScalarValue::Text("TX".to_string()))
        );
    }

    #[test]
    fn test_lookup_is_reversible() {
        let index = TermIndex::build(&schema());
        let by_description = index.resolve_one("bonus");
        let by_code = index.resolve_one("bon");
        assert_eq!(by_description[0].match_value, by_code[0].match_value);
        assert_eq!(by_description[0].term_kind, TermKind::Lookup);
    }

    #[test]
    fn test_hub_column_resolves_as_concept() {
        let index = TermIndex::build(&schema());
        let matches = index.resolve_one("employee_id");
        assert_eq!(matches[0].term_kind, TermKind::Concept);
        assert!(matches[0].target.is_none());
    }

    #[test]
    fn test_unmatched_term_is_absent() {
        let index = TermIndex::build(&schema());
        assert!(index.resolve_one("zorblex").is_empty());
    }

    #[test]
    fn test_variant_matching() {
        let index = TermIndex::build(&schema());
        // underscore/space interchange via normalization
        assert!(!index.resolve_one("Employee_Id").is_empty());
        // naive plural stripping
        assert!(!index.resolve_one("bonuses").is_empty());
    }

    #[test]
    fn test_snapshot_swap_bumps_version() {
        let handle = TenantIndexHandle::new(TermIndex::build(&schema()));
        let before = handle.snapshot();
        assert_eq!(handle.version(), 1);
        handle.swap(TermIndex::default());
        assert_eq!(handle.version(), 2);
        // old snapshot still readable
        assert!(!before.is_empty());
        assert!(handle.snapshot().is_empty());
    }
}
