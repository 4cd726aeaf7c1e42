//! SQL Assembler
//!
//! Terminal stage of the resolution pipeline: given resolved term
//! matches, the parsed intent and optional GROUP BY / aggregation-target
//! candidates, selects the primary table via tiered ranking, computes a
//! join path over the relationship catalog, builds a parameterized WHERE
//! clause and emits an `AssembledQuery`. Failure is a first-class return
//! value, never an exception.
//!
//! Every literal from a resolved term is bound as a `$n` parameter; the
//! emitted SQL never contains an interpolated user value. The assembled
//! statement is parsed back with sqlparser before it is handed out.

use crate::intent::{Operation, ParsedIntent};
use crate::schema::{ColumnRole, InferredType, SchemaIndex, TableType};
use crate::term_index::{ColumnRef, MatchValue, ScalarValue, TermKind, TermMatch};
use crate::value_expr::CmpOp;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::sync::Arc;
use tracing::{debug, warn};

/// Row cap applied to list-shaped projections.
const LIST_ROW_LIMIT: usize = 100;
/// Cap on projected columns for list queries.
const LIST_COLUMN_CAP: usize = 6;

/// Terminal artifact of the pipeline; immutable, single-use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembledQuery {
    pub sql: String,
    pub parameters: Vec<ScalarValue>,
    pub tables: Vec<String>,
    /// Human-readable predicate descriptions for diagnostics.
    pub filters: Vec<String>,
    pub group_by_column: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

impl AssembledQuery {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            sql: String::new(),
            parameters: Vec::new(),
            tables: Vec::new(),
            filters: Vec::new(),
            group_by_column: None,
            success: false,
            error: Some(reason.into()),
        }
    }
}

/// One join edge in the FROM clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinEdge {
    pub left: ColumnRef,
    pub right: ColumnRef,
}

pub struct SqlAssembler {
    schema: Arc<SchemaIndex>,
}

impl SqlAssembler {
    pub fn new(schema: Arc<SchemaIndex>) -> Self {
        Self { schema }
    }

    /// Assemble a query from resolved matches.
    ///
    /// `group_by_candidates` and `agg_candidates` are concept matches for
    /// the extracted GROUP BY dimension and aggregation-target phrases,
    /// resolved independently of the filter stream.
    pub fn assemble(
        &self,
        intent: &ParsedIntent,
        matches: &[TermMatch],
        group_by_candidates: &[TermMatch],
        agg_candidates: &[TermMatch],
        subject_entity: Option<&str>,
    ) -> AssembledQuery {
        // Concepts identify columns, not filter values.
        let filter_matches: Vec<&TermMatch> = matches
            .iter()
            .filter(|m| m.term_kind != TermKind::Concept)
            .collect();

        let subject = subject_entity
            .map(|s| s.to_string())
            .or_else(|| self.majority_entity(&filter_matches));

        let primary = match self.select_primary_table(
            intent,
            &filter_matches,
            group_by_candidates,
            agg_candidates,
            subject.as_deref(),
        ) {
            Some(table) => table,
            None => return AssembledQuery::failure("no candidate table for resolved terms"),
        };

        let group_by =
            self.select_concept_column(group_by_candidates, subject.as_deref(), Some(&primary));
        if !group_by_candidates.is_empty() && group_by.is_none() {
            return AssembledQuery::failure("could not resolve group-by dimension to a column");
        }

        let agg_column = match self.resolve_aggregation_column(intent, agg_candidates, &primary) {
            Ok(col) => col,
            Err(reason) => return AssembledQuery::failure(reason),
        };

        // Tables touched by filters and selection targets.
        let mut tables: Vec<String> = vec![primary.clone()];
        for m in &filter_matches {
            if let Some(target) = &m.target {
                if !tables.contains(&target.table) {
                    tables.push(target.table.clone());
                }
            }
        }
        if let Some(g) = &group_by {
            if !tables.contains(&g.table) {
                tables.push(g.table.clone());
            }
        }
        if let Some(a) = &agg_column {
            if !tables.contains(&a.table) {
                tables.push(a.table.clone());
            }
        }

        let joins = match self.join_path(&primary, &tables) {
            Ok(joins) => joins,
            Err(reason) => return AssembledQuery::failure(reason),
        };

        let mut parameters: Vec<ScalarValue> = Vec::new();
        let mut predicates: Vec<String> = Vec::new();
        for m in &filter_matches {
            match self.build_predicate(m, &primary, &mut parameters) {
                Ok(Some(p)) => predicates.push(p),
                Ok(None) => {}
                Err(reason) => return AssembledQuery::failure(reason),
            }
        }

        let select = self.build_select(intent, &primary, &joins, group_by.as_ref(), agg_column.as_ref());

        let mut sql = format!("SELECT {} FROM {}", select, primary);
        for join in &joins {
            sql.push_str(&format!(
                " JOIN {} ON {} = {}",
                join.right.table, join.left, join.right
            ));
        }
        if !predicates.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&predicates.join(" AND "));
        }
        if let Some(g) = &group_by {
            sql.push_str(&format!(" GROUP BY {} ORDER BY {}", g, g));
        }
        if intent.operation == Operation::List {
            sql.push_str(&format!(" LIMIT {}", LIST_ROW_LIMIT));
        }

        // The assembler must never hand out SQL it cannot parse back.
        if let Err(e) = Parser::parse_sql(&PostgreSqlDialect {}, &sql) {
            warn!("Assembled SQL failed validation: {} ({})", sql, e);
            return AssembledQuery::failure(format!("assembled SQL failed validation: {}", e));
        }

        debug!("Assembled: {} with {} parameters", sql, parameters.len());

        AssembledQuery {
            sql,
            parameters,
            tables,
            filters: predicates,
            group_by_column: group_by.map(|g| g.to_string()),
            success: true,
            error: None,
        }
    }

    /// Tier for a candidate table: 0 = subject-entity match and not a
    /// configuration table, 1 = any non-configuration table, 2 =
    /// configuration tables as last resort.
    fn table_tier(&self, table: &str, subject_entity: Option<&str>) -> u8 {
        match self.schema.classification(table) {
            Some(c) if c.table_type == TableType::Config => 2,
            Some(c) => {
                if subject_entity
                    .map(|s| c.entity_type.eq_ignore_ascii_case(s))
                    .unwrap_or(false)
                {
                    0
                } else {
                    1
                }
            }
            None => 2,
        }
    }

    fn majority_entity(&self, matches: &[&TermMatch]) -> Option<String> {
        matches
            .iter()
            .filter_map(|m| m.entity.clone())
            .counts()
            .into_iter()
            .sorted_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)))
            .map(|(entity, _)| entity)
            .next()
    }

    /// Pick the primary table by tier, breaking ties by how many filter
    /// matches the table satisfies, then by name for determinism.
    fn select_primary_table(
        &self,
        intent: &ParsedIntent,
        filter_matches: &[&TermMatch],
        group_by_candidates: &[TermMatch],
        agg_candidates: &[TermMatch],
        subject_entity: Option<&str>,
    ) -> Option<String> {
        let mut candidates: Vec<String> = Vec::new();
        for m in filter_matches
            .iter()
            .copied()
            .chain(group_by_candidates.iter())
            .chain(agg_candidates.iter())
        {
            if let Some(target) = &m.target {
                if !candidates.contains(&target.table) {
                    candidates.push(target.table.clone());
                }
            }
        }

        // Domain tables always stay in contention so a lone lookup-table
        // filter cannot anchor the query on a config table.
        if let Some(domain) = &intent.domain {
            for c in self.schema.tables_in_domain(domain) {
                if !candidates.contains(&c.table) {
                    candidates.push(c.table.clone());
                }
            }
        }
        if candidates.is_empty() && subject_entity.is_some() {
            candidates = self
                .schema
                .classifications
                .iter()
                .filter(|c| {
                    c.entity_type
                        .eq_ignore_ascii_case(subject_entity.unwrap_or_default())
                })
                .map(|c| c.table.clone())
                .collect();
        }

        candidates
            .into_iter()
            .sorted_by_key(|t| {
                let satisfied = filter_matches
                    .iter()
                    .filter(|m| m.target.as_ref().map(|c| c.table == *t).unwrap_or(false))
                    .count();
                // Master tables outrank transaction tables on equal tiers:
                // the subject's master table reads as the natural anchor.
                let type_rank = match self.schema.classification(t).map(|c| c.table_type) {
                    Some(TableType::Master) => 0u8,
                    Some(TableType::Transaction) => 1,
                    _ => 2,
                };
                (
                    self.table_tier(t, subject_entity),
                    type_rank,
                    usize::MAX - satisfied,
                    t.clone(),
                )
            })
            .next()
    }

    /// Resolve a concept phrase (GROUP BY dimension) to one column using
    /// the same tiering as table selection; prefers the primary table on
    /// equal tiers.
    fn select_concept_column(
        &self,
        candidates: &[TermMatch],
        subject_entity: Option<&str>,
        primary: Option<&String>,
    ) -> Option<ColumnRef> {
        candidates
            .iter()
            .filter_map(|m| m.target.as_ref())
            .sorted_by_key(|target| {
                let on_primary = primary.map(|p| &target.table == p).unwrap_or(false);
                (
                    self.table_tier(&target.table, subject_entity),
                    if on_primary { 0u8 } else { 1u8 },
                    target.table.clone(),
                )
            })
            .next()
            .cloned()
    }

    /// Column an aggregation operates over: the resolved aggregation
    /// target if present, else the primary table's amount-role column.
    fn resolve_aggregation_column(
        &self,
        intent: &ParsedIntent,
        agg_candidates: &[TermMatch],
        primary: &str,
    ) -> Result<Option<ColumnRef>, String> {
        if !intent.operation.is_aggregation() {
            return Ok(None);
        }
        if let Some(col) = self.select_concept_column(agg_candidates, None, Some(&primary.to_string()))
        {
            return Ok(Some(col));
        }
        let amount = self
            .schema
            .profiles_for_table(primary)
            .into_iter()
            .find(|p| p.role == ColumnRole::Amount)
            .map(|p| ColumnRef::new(&p.table, &p.column));
        amount
            .map(Some)
            .ok_or_else(|| format!("no numeric column on {} to aggregate", primary))
    }

    /// Join path from the primary table to every other touched table:
    /// a cataloged relationship first, then a shared hub column. A table
    /// with neither fails the assembly.
    fn join_path(&self, primary: &str, tables: &[String]) -> Result<Vec<JoinEdge>, String> {
        let mut joins = Vec::new();
        for table in tables.iter().filter(|t| *t != primary) {
            if let Some(rel) = self
                .schema
                .relationships_for_table(primary)
                .into_iter()
                .find(|r| {
                    (r.source_table == *primary && r.target_table == *table)
                        || (r.target_table == *primary && r.source_table == *table)
                })
            {
                let (left, right) = if rel.source_table == *primary {
                    (
                        ColumnRef::new(&rel.source_table, &rel.source_column),
                        ColumnRef::new(&rel.target_table, &rel.target_column),
                    )
                } else {
                    (
                        ColumnRef::new(&rel.target_table, &rel.target_column),
                        ColumnRef::new(&rel.source_table, &rel.source_column),
                    )
                };
                joins.push(JoinEdge { left, right });
                continue;
            }

            let hubs = self.schema.shared_hubs(primary, table);
            if let Some(hub) = hubs.first() {
                joins.push(JoinEdge {
                    left: ColumnRef::new(primary, hub),
                    right: ColumnRef::new(table, hub),
                });
                continue;
            }

            return Err(format!("no join path between {} and {}", primary, table));
        }
        Ok(joins)
    }

    /// One predicate per surviving match; every literal becomes a bound
    /// parameter. Numeric/date matches without a target are bound to the
    /// primary table's amount/date-role column.
    fn build_predicate(
        &self,
        m: &TermMatch,
        primary: &str,
        parameters: &mut Vec<ScalarValue>,
    ) -> Result<Option<String>, String> {
        let target = match &m.target {
            Some(t) => t.clone(),
            None => match m.term_kind {
                TermKind::Numeric => self
                    .role_column(primary, ColumnRole::Amount)
                    .ok_or_else(|| format!("no amount column on {} for '{}'", primary, m.term))?,
                TermKind::Date => self
                    .role_column(primary, ColumnRole::Date)
                    .ok_or_else(|| format!("no date column on {} for '{}'", primary, m.term))?,
                _ => return Ok(None),
            },
        };

        let predicate = match (&m.operator, &m.match_value) {
            (CmpOp::Between, MatchValue::Range(low, high)) => {
                parameters.push(low.clone());
                let low_ph = placeholder(parameters.len());
                parameters.push(high.clone());
                let high_ph = placeholder(parameters.len());
                format!("{} BETWEEN {} AND {}", target, low_ph, high_ph)
            }
            (CmpOp::In, MatchValue::List(values)) | (CmpOp::NotIn, MatchValue::List(values)) => {
                if values.is_empty() {
                    return Err(format!("empty value list for '{}'", m.term));
                }
                let mut placeholders = Vec::new();
                for v in values {
                    parameters.push(v.clone());
                    placeholders.push(placeholder(parameters.len()));
                }
                format!("{} {} ({})", target, m.operator.sql(), placeholders.join(", "))
            }
            (op, MatchValue::Single(value)) => {
                parameters.push(value.clone());
                format!("{} {} {}", target, op.sql(), placeholder(parameters.len()))
            }
            (_, MatchValue::None) => return Ok(None),
            (op, value) => {
                return Err(format!(
                    "cannot expand operator {:?} over value {:?} for '{}'",
                    op, value, m.term
                ))
            }
        };
        Ok(Some(predicate))
    }

    fn build_select(
        &self,
        intent: &ParsedIntent,
        primary: &str,
        joins: &[JoinEdge],
        group_by: Option<&ColumnRef>,
        agg_column: Option<&ColumnRef>,
    ) -> String {
        let count_expr = if joins.is_empty() {
            "COUNT(*)".to_string()
        } else {
            // Joins can fan rows out; count distinct primary keys instead.
            match self
                .schema
                .hub_columns
                .iter()
                .find(|hub| self.schema.profile(primary, hub).is_some())
            {
                Some(hub) => format!("COUNT(DISTINCT {}.{})", primary, hub),
                None => "COUNT(*)".to_string(),
            }
        };

        let body = match intent.operation {
            Operation::Count | Operation::Compare => format!("{} AS count", count_expr),
            Operation::Sum => format!("SUM({}) AS total", self.agg_operand(agg_column)),
            Operation::Average => format!("AVG({}) AS average", self.agg_operand(agg_column)),
            Operation::Minimum => format!("MIN({}) AS minimum", self.agg_operand(agg_column)),
            Operation::Maximum => format!("MAX({}) AS maximum", self.agg_operand(agg_column)),
            Operation::List => {
                let preferred = [
                    ColumnRole::Identifier,
                    ColumnRole::Name,
                    ColumnRole::Status,
                    ColumnRole::Date,
                    ColumnRole::Amount,
                ];
                let columns: Vec<String> = self
                    .schema
                    .profiles_for_table(primary)
                    .into_iter()
                    .filter(|p| preferred.contains(&p.role))
                    .take(LIST_COLUMN_CAP)
                    .map(|p| format!("{}.{}", p.table, p.column))
                    .collect();
                if columns.is_empty() {
                    format!("{}.*", primary)
                } else {
                    columns.join(", ")
                }
            }
        };

        match group_by {
            Some(g) => format!("{}, {}", g, body),
            None => body,
        }
    }

    /// Aggregate operand expression. Numeric columns are cast to float8:
    /// Postgres returns NUMERIC for SUM/AVG over them, which the executor
    /// cannot decode as a plain double.
    fn agg_operand(&self, column: Option<&ColumnRef>) -> String {
        let expr = agg_expr(column);
        let numeric = column
            .and_then(|c| self.schema.profile(&c.table, &c.column))
            .map(|p| matches!(p.inferred_type, InferredType::Numeric | InferredType::Integer))
            .unwrap_or(false);
        if numeric {
            format!("{}::float8", expr)
        } else {
            expr
        }
    }

    fn role_column(&self, table: &str, role: ColumnRole) -> Option<ColumnRef> {
        self.schema
            .profiles_for_table(table)
            .into_iter()
            .find(|p| p.role == role)
            .map(|p| ColumnRef::new(&p.table, &p.column))
    }
}

fn agg_expr(column: Option<&ColumnRef>) -> String {
    column.map(|c| c.to_string()).unwrap_or_else(|| "1".to_string())
}

fn placeholder(n: usize) -> String {
    format!("${}", n)
}
