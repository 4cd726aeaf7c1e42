//! Relationship Resolver
//!
//! Detects relationship-traversal phrasings and builds self-join queries
//! from the relationship catalog. Three shapes are recognized:
//!
//! - possessive: "manager's department" (self-join, project the attribute
//!   from the joined side)
//! - named possessive: "John's manager", "Maria's team" (self-join plus a
//!   name filter)
//! - keyword: "who reports to John"
//!
//! The traversal table and join columns come from `ColumnRelationship`
//! records looked up by semantic meaning, never from naming heuristics.
//! Any catalog miss makes the resolver decline so the orchestrator can
//! fall back to the generic assembly path.

use crate::assembler::AssembledQuery;
use crate::schema::{ColumnRole, RelationshipKind, SchemaIndex};
use crate::term_index::{normalize_term, ScalarValue};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipPattern {
    Possessive,
    NamedPossessive,
    Keyword,
}

/// Detected traversal, before catalog lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipSpec {
    pub pattern: RelationshipPattern,
    /// Semantic meaning to look up in the relationship catalog.
    pub relationship_term: String,
    /// Attribute requested from the traversal target ("department").
    pub attribute: Option<String>,
    /// Person-name filter for named possessives and keyword shapes.
    pub name_filter: Option<String>,
}

lazy_static! {
    static ref RE_POSSESSIVE: Regex =
        Regex::new(r"(?i)\b([a-z]+)'s?\s+([a-z][a-z_ ]*[a-z])").unwrap();
    static ref RE_REPORTS_TO: Regex =
        Regex::new(r"(?i)\breports?\s+to\s+([a-z]+)\b").unwrap();
}

/// Possessor words that traverse the reporting relationship.
fn relationship_meaning(word: &str) -> Option<&'static str> {
    match normalize_term(word).as_str() {
        "manager" | "managers" | "supervisor" | "supervisors" | "boss" => Some("manager"),
        "team" | "reports" | "directs" => Some("manager"),
        _ => None,
    }
}

pub struct RelationshipResolver {
    schema: Arc<SchemaIndex>,
}

impl RelationshipResolver {
    pub fn new(schema: Arc<SchemaIndex>) -> Self {
        Self { schema }
    }

    /// Detect a traversal phrasing in the question. Returns None when the
    /// question has no relationship shape at all.
    pub fn detect(&self, question: &str) -> Option<RelationshipSpec> {
        if let Some(caps) = RE_REPORTS_TO.captures(question) {
            return Some(RelationshipSpec {
                pattern: RelationshipPattern::Keyword,
                relationship_term: "manager".to_string(),
                attribute: None,
                name_filter: Some(caps[1].to_string()),
            });
        }

        let caps = RE_POSSESSIVE.captures(question)?;
        let possessor = caps[1].to_string();
        let attribute = caps[2].split_whitespace().next().unwrap_or("").to_string();

        if let Some(meaning) = relationship_meaning(&possessor) {
            // "manager's department"
            return Some(RelationshipSpec {
                pattern: RelationshipPattern::Possessive,
                relationship_term: meaning.to_string(),
                attribute: Some(attribute),
                name_filter: None,
            });
        }

        if let Some(meaning) = relationship_meaning(&attribute) {
            // Capitalized possessor reads as a person name: "John's manager".
            if possessor.chars().next().map(|c| c.is_uppercase()).unwrap_or(false) {
                return Some(RelationshipSpec {
                    pattern: RelationshipPattern::NamedPossessive,
                    relationship_term: "manager".to_string(),
                    attribute: Some(attribute),
                    name_filter: Some(possessor),
                });
            }
            // "employees' manager": the traversal targets themselves.
            return Some(RelationshipSpec {
                pattern: RelationshipPattern::Possessive,
                relationship_term: meaning.to_string(),
                attribute: None,
                name_filter: None,
            });
        }

        // "John's department" is a plain filter, not a traversal.
        None
    }

    /// Build a self-join query for a detected traversal. Declines (None)
    /// on any catalog or column lookup failure.
    pub fn build_query(&self, spec: &RelationshipSpec) -> Option<AssembledQuery> {
        let rel = self
            .schema
            .relationship_by_meaning(&spec.relationship_term)
            .filter(|r| r.relationship_kind == RelationshipKind::SelfReference)?;
        if rel.source_table != rel.target_table {
            return None;
        }
        let table = rel.source_table.clone();

        let name_col = self.role_column(&table, ColumnRole::Name);
        let id_col = self.role_column(&table, ColumnRole::Identifier);

        let join = format!(
            "FROM {table} base JOIN {table} rel ON base.{src} = rel.{tgt}",
            table = table,
            src = rel.source_column,
            tgt = rel.target_column,
        );

        let mut parameters = Vec::new();
        let (select, filter) = match spec.pattern {
            RelationshipPattern::Keyword => {
                // members reporting to <name>
                let name_col = name_col?;
                let name = spec.name_filter.clone()?;
                parameters.push(ScalarValue::Text(format!("%{}%", name)));
                let projection = match &id_col {
                    Some(id) => format!("base.{}, base.{}", id, name_col),
                    None => format!("base.{}", name_col),
                };
                (projection, Some(format!("rel.{} LIKE $1", name_col)))
            }
            RelationshipPattern::NamedPossessive => {
                let name_col = name_col?;
                let name = spec.name_filter.clone()?;
                let attribute = spec.attribute.as_deref().unwrap_or("manager");
                parameters.push(ScalarValue::Text(format!("%{}%", name)));
                match normalize_term(attribute).as_str() {
                    // "Maria's team": everyone whose manager is Maria
                    "team" | "reports" | "directs" => {
                        let projection = match &id_col {
                            Some(id) => format!("base.{}, base.{}", id, name_col),
                            None => format!("base.{}", name_col),
                        };
                        (projection, Some(format!("rel.{} LIKE $1", name_col)))
                    }
                    // "John's manager": the person John reports to
                    _ => (
                        format!("rel.{}", name_col),
                        Some(format!("base.{} LIKE $1", name_col)),
                    ),
                }
            }
            RelationshipPattern::Possessive => {
                // "manager's department": the attribute on the joined side;
                // with no attribute, the traversal targets themselves.
                let attr_col = match spec.attribute.as_deref() {
                    Some(attribute) => self.find_column(&table, attribute)?,
                    None => name_col?,
                };
                (format!("DISTINCT rel.{}", attr_col), None)
            }
        };

        let mut sql = format!("SELECT {} {}", select, join);
        if let Some(f) = &filter {
            sql.push_str(&format!(" WHERE {}", f));
        }

        if Parser::parse_sql(&PostgreSqlDialect {}, &sql).is_err() {
            debug!("Relationship SQL failed validation, declining: {}", sql);
            return None;
        }

        debug!("Relationship resolver built: {}", sql);
        let filters = filter.into_iter().collect();
        Some(AssembledQuery {
            sql,
            parameters,
            tables: vec![table],
            filters,
            group_by_column: None,
            success: true,
            error: None,
        })
    }

    fn role_column(&self, table: &str, role: ColumnRole) -> Option<String> {
        self.schema
            .profiles_for_table(table)
            .into_iter()
            .find(|p| p.role == role)
            .map(|p| p.column.clone())
    }

    /// Column on the table whose normalized name matches the attribute.
    fn find_column(&self, table: &str, attribute: &str) -> Option<String> {
        let needle = normalize_term(attribute);
        let stem = needle.strip_suffix('s').unwrap_or(&needle).to_string();
        self.schema
            .profiles_for_table(table)
            .into_iter()
            .find(|p| {
                let col = normalize_term(&p.column);
                col == needle || col == stem
            })
            .map(|p| p.column.clone())
    }
}
