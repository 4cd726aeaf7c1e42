//! Schema index model
//!
//! Read-only snapshot of a tenant's profiled schema: column profiles,
//! table classifications, relationships, synonym/lookup seed records and
//! hub columns. Built offline by the ingestion/profiling pipeline; this
//! engine only reads it. Loaded from a directory of JSON files, one file
//! per record family.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::info;

/// Inferred storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferredType {
    Text,
    Numeric,
    Integer,
    Date,
    Boolean,
}

/// Semantic role a column plays, inferred during profiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    Identifier,
    Name,
    Code,
    Description,
    Amount,
    Date,
    Status,
    Other,
}

/// Per-(table, column) profile built during offline ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub table: String,
    pub column: String,
    pub inferred_type: InferredType,
    pub role: ColumnRole,
    pub distinct_count: u64,
    /// Most frequent distinct values observed during profiling.
    #[serde(default)]
    pub top_values: Vec<String>,
    /// Assigned filter category (e.g. "status", "location"), if any.
    #[serde(default)]
    pub filter_category: Option<String>,
}

/// Coarse table kind used for tiered table ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableType {
    Master,
    Transaction,
    Config,
}

/// Per-table classification from the profiling pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableClassification {
    pub table: String,
    pub table_type: TableType,
    /// Subject-matter domain, e.g. "earnings", "taxes", "demographics".
    pub domain: String,
    /// Primary entity the table describes, e.g. "employee", "company".
    pub entity_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    SelfReference,
    ForeignKey,
    Lookup,
    Hierarchy,
}

/// A known column-to-column relationship between (or within) tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnRelationship {
    pub source_table: String,
    pub source_column: String,
    pub target_table: String,
    pub target_column: String,
    pub relationship_kind: RelationshipKind,
    /// Business meaning, e.g. "manager", "department", "pay_code_lookup".
    pub semantic_meaning: String,
}

/// Synonym seed record: a spoken term mapped to a stored value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynonymEntry {
    pub term: String,
    pub table: String,
    pub column: String,
    pub canonical_value: String,
    #[serde(default)]
    pub domain: Option<String>,
}

/// Lookup-table row (code <-> description), reversible at term-index build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupEntry {
    pub table: String,
    pub code_column: String,
    pub description_column: String,
    pub code: String,
    pub description: String,
    #[serde(default)]
    pub domain: Option<String>,
}

/// Immutable snapshot of everything the engine knows about a tenant's schema.
#[derive(Debug, Clone, Default)]
pub struct SchemaIndex {
    pub profiles: Vec<ColumnProfile>,
    pub classifications: Vec<TableClassification>,
    pub relationships: Vec<ColumnRelationship>,
    pub synonyms: Vec<SynonymEntry>,
    pub lookups: Vec<LookupEntry>,
    /// Shared join-key columns (hubs); tables carrying one are its spokes.
    pub hub_columns: Vec<String>,

    classification_by_table: HashMap<String, usize>,
    profiles_by_table: HashMap<String, Vec<usize>>,
    tables_by_column: HashMap<String, Vec<String>>,
}

impl SchemaIndex {
    pub fn new(
        profiles: Vec<ColumnProfile>,
        classifications: Vec<TableClassification>,
        relationships: Vec<ColumnRelationship>,
        synonyms: Vec<SynonymEntry>,
        lookups: Vec<LookupEntry>,
        hub_columns: Vec<String>,
    ) -> Self {
        let mut index = Self {
            profiles,
            classifications,
            relationships,
            synonyms,
            lookups,
            hub_columns,
            ..Default::default()
        };
        index.rebuild_indexes();
        index
    }

    /// Load a schema index from a directory of JSON files.
    ///
    /// Expected files: `profiles.json`, `classifications.json`,
    /// `relationships.json`, `synonyms.json`, `lookups.json`, `hubs.json`.
    /// Missing synonym/lookup/hub files are treated as empty.
    pub fn load(dir: &Path) -> Result<Self> {
        let profiles: Vec<ColumnProfile> = load_json(dir, "profiles.json")?
            .ok_or_else(|| EngineError::Schema(format!("missing profiles.json in {}", dir.display())))?;
        let classifications: Vec<TableClassification> = load_json(dir, "classifications.json")?
            .ok_or_else(|| EngineError::Schema(format!("missing classifications.json in {}", dir.display())))?;
        let relationships: Vec<ColumnRelationship> =
            load_json(dir, "relationships.json")?.unwrap_or_default();
        let synonyms: Vec<SynonymEntry> = load_json(dir, "synonyms.json")?.unwrap_or_default();
        let lookups: Vec<LookupEntry> = load_json(dir, "lookups.json")?.unwrap_or_default();
        let hub_columns: Vec<String> = load_json(dir, "hubs.json")?.unwrap_or_default();

        info!(
            "Loaded schema index: {} column profiles, {} tables, {} relationships",
            profiles.len(),
            classifications.len(),
            relationships.len()
        );

        Ok(Self::new(
            profiles,
            classifications,
            relationships,
            synonyms,
            lookups,
            hub_columns,
        ))
    }

    fn rebuild_indexes(&mut self) {
        self.classification_by_table = self
            .classifications
            .iter()
            .enumerate()
            .map(|(i, c)| (c.table.clone(), i))
            .collect();

        self.profiles_by_table = HashMap::new();
        self.tables_by_column = HashMap::new();
        for (i, p) in self.profiles.iter().enumerate() {
            self.profiles_by_table
                .entry(p.table.clone())
                .or_insert_with(Vec::new)
                .push(i);
            let tables = self
                .tables_by_column
                .entry(p.column.to_lowercase())
                .or_insert_with(Vec::new);
            if !tables.contains(&p.table) {
                tables.push(p.table.clone());
            }
        }
    }

    pub fn classification(&self, table: &str) -> Option<&TableClassification> {
        self.classification_by_table
            .get(table)
            .map(|&i| &self.classifications[i])
    }

    pub fn is_config_table(&self, table: &str) -> bool {
        self.classification(table)
            .map(|c| c.table_type == TableType::Config)
            .unwrap_or(false)
    }

    pub fn profiles_for_table(&self, table: &str) -> Vec<&ColumnProfile> {
        self.profiles_by_table
            .get(table)
            .map(|ids| ids.iter().map(|&i| &self.profiles[i]).collect())
            .unwrap_or_default()
    }

    pub fn profile(&self, table: &str, column: &str) -> Option<&ColumnProfile> {
        self.profiles_for_table(table)
            .into_iter()
            .find(|p| p.column.eq_ignore_ascii_case(column))
    }

    /// All tables exposing a column with the given (case-insensitive) name.
    pub fn tables_with_column(&self, column: &str) -> Vec<String> {
        self.tables_by_column
            .get(&column.to_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    pub fn relationships_for_table(&self, table: &str) -> Vec<&ColumnRelationship> {
        self.relationships
            .iter()
            .filter(|r| r.source_table == table || r.target_table == table)
            .collect()
    }

    pub fn relationship_by_meaning(&self, meaning: &str) -> Option<&ColumnRelationship> {
        self.relationships
            .iter()
            .find(|r| r.semantic_meaning.eq_ignore_ascii_case(meaning))
    }

    pub fn tables_in_domain(&self, domain: &str) -> Vec<&TableClassification> {
        self.classifications
            .iter()
            .filter(|c| c.domain.eq_ignore_ascii_case(domain))
            .collect()
    }

    /// Hub columns shared by both tables, if any.
    pub fn shared_hubs(&self, table_a: &str, table_b: &str) -> Vec<String> {
        self.hub_columns
            .iter()
            .filter(|hub| {
                self.profile(table_a, hub).is_some() && self.profile(table_b, hub).is_some()
            })
            .cloned()
            .collect()
    }
}

fn load_json<T: serde::de::DeserializeOwned>(dir: &Path, file: &str) -> Result<Option<T>> {
    let path = dir.join(file);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)?;
    let parsed = serde_json::from_str(&content)?;
    Ok(Some(parsed))
}
