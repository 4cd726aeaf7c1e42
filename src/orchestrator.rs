//! Resolution Orchestrator
//!
//! Sequences the pipeline: complex-question screen, value-expression
//! extraction, intent classification, relationship detection, the
//! ordered `TermResolver` chain (Term Index first, Metadata Reasoner as
//! fallback), assembly and bounded execution. Every outcome maps to one
//! of five result statuses; a generic exception never crosses this
//! boundary — the top-level guard wraps unexpected faults into
//! `SystemError` with a sanitized message.

use crate::assembler::{AssembledQuery, SqlAssembler};
use crate::error::EngineError;
use crate::executor::{QueryExecutor, Row};
use crate::intent::{is_stop_word, IntentClassifier, ParsedIntent};
use crate::reasoner::MetadataReasoner;
use crate::relationship::RelationshipResolver;
use crate::schema::SchemaIndex;
use crate::term_index::{
    MatchSource, MatchValue, ScalarValue, TenantIndexHandle, TermIndex, TermKind, TermMatch,
};
use crate::value_expr::{extract_value_expressions, CmpOp, ValueExpr};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default bound on a single execution call.
const EXECUTION_TIMEOUT_MS: u64 = 30_000;

/// Everything a resolution needs beyond the question text. The explicit
/// reference date keeps date-phrase resolution reproducible.
#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub tenant_id: String,
    pub reference_date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Answered,
    CannotResolve,
    NeedsClarification,
    NoData,
    ComplexQuery,
    SystemError,
}

/// Diagnostic fields carried on every result; intended for logging and
/// the downstream synthesis layer, never for end-user display.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    pub matched_terms: Vec<TermMatch>,
    pub unresolved_terms: Vec<String>,
    pub tables_considered: Vec<String>,
    pub confidence: f64,
}

/// Final return value of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionResult {
    pub status: ResolutionStatus,
    pub rows: Vec<Row>,
    pub query: Option<AssembledQuery>,
    pub message: Option<String>,
    pub diagnostics: Diagnostics,
}

impl ResolutionResult {
    fn status_only(status: ResolutionStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            rows: Vec::new(),
            query: None,
            message: Some(message.into()),
            diagnostics: Diagnostics::default(),
        }
    }
}

/// One named strategy in the resolution chain.
pub trait TermResolver: Send + Sync {
    fn name(&self) -> &'static str;
    fn resolve_term(&self, term: &str, context_domain: Option<&str>) -> Vec<TermMatch>;
}

struct TermIndexResolver {
    index: Arc<TermIndex>,
}

impl TermResolver for TermIndexResolver {
    fn name(&self) -> &'static str {
        "term_index"
    }

    fn resolve_term(&self, term: &str, _context_domain: Option<&str>) -> Vec<TermMatch> {
        self.index.resolve_one(term)
    }
}

struct ReasonerResolver {
    reasoner: MetadataReasoner,
}

impl TermResolver for ReasonerResolver {
    fn name(&self) -> &'static str {
        "metadata_reasoner"
    }

    fn resolve_term(&self, term: &str, context_domain: Option<&str>) -> Vec<TermMatch> {
        self.reasoner.resolve_unknown(term, context_domain)
    }
}

pub struct Orchestrator {
    schema: Arc<SchemaIndex>,
    index_handle: Arc<TenantIndexHandle>,
    classifier: IntentClassifier,
    assembler: SqlAssembler,
    relationships: RelationshipResolver,
    executor: Arc<dyn QueryExecutor>,
    timeout_ms: u64,
}

impl Orchestrator {
    pub fn new(
        schema: Arc<SchemaIndex>,
        index_handle: Arc<TenantIndexHandle>,
        executor: Arc<dyn QueryExecutor>,
    ) -> Self {
        Self {
            assembler: SqlAssembler::new(schema.clone()),
            relationships: RelationshipResolver::new(schema.clone()),
            classifier: IntentClassifier::new(),
            schema,
            index_handle,
            executor,
            timeout_ms: EXECUTION_TIMEOUT_MS,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Sole entry point. Never returns an error; unexpected faults are
    /// wrapped into a `SystemError` result.
    pub async fn resolve_question(&self, text: &str, ctx: &ResolutionContext) -> ResolutionResult {
        info!("Resolving question for tenant {}: {}", ctx.tenant_id, text);
        match self.resolve_inner(text, ctx).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Resolution failed unexpectedly: {}", e);
                ResolutionResult::status_only(ResolutionStatus::SystemError, sanitize(&e))
            }
        }
    }

    async fn resolve_inner(
        &self,
        text: &str,
        ctx: &ResolutionContext,
    ) -> crate::error::Result<ResolutionResult> {
        if is_complex_question(text) {
            return Ok(ResolutionResult::status_only(
                ResolutionStatus::ComplexQuery,
                "question requires explanatory reasoning beyond deterministic resolution",
            ));
        }

        let snapshot = self.index_handle.snapshot();
        let resolvers: Vec<Box<dyn TermResolver>> = vec![
            Box::new(TermIndexResolver {
                index: snapshot.clone(),
            }),
            Box::new(ReasonerResolver {
                reasoner: MetadataReasoner::new(self.schema.clone()),
            }),
        ];

        // Relationship traversal bypasses generic assembly entirely.
        if let Some(spec) = self.relationships.detect(text) {
            if let Some(query) = self.relationships.build_query(&spec) {
                debug!("Relationship resolver handled question ({:?})", spec.pattern);
                let mut matched = vec![TermMatch {
                    term: spec.relationship_term.clone(),
                    target: None,
                    operator: CmpOp::Eq,
                    match_value: MatchValue::None,
                    domain: None,
                    entity: None,
                    confidence: 1.0,
                    term_kind: TermKind::Concept,
                    source: MatchSource::Relationship,
                }];
                if let Some(name) = &spec.name_filter {
                    matched.push(TermMatch {
                        term: name.clone(),
                        target: None,
                        operator: CmpOp::Like,
                        match_value: MatchValue::Single(ScalarValue::Text(format!(
                            "%{}%",
                            name
                        ))),
                        domain: None,
                        entity: None,
                        confidence: 1.0,
                        term_kind: TermKind::Value,
                        source: MatchSource::Relationship,
                    });
                }
                let diagnostics = Diagnostics {
                    confidence: mean_confidence(&matched),
                    matched_terms: matched,
                    unresolved_terms: Vec::new(),
                    tables_considered: query.tables.clone(),
                };
                return Ok(self.execute_and_wrap(query, diagnostics).await);
            }
        }

        let extracted = extract_value_expressions(text, ctx.reference_date);
        let analysis = self.classifier.analyze(&extracted.residual);
        let intent = analysis.intent.clone();
        let domain = intent.domain.as_deref();

        let mut matches: Vec<TermMatch> = Vec::new();
        let mut unresolved: Vec<String> = Vec::new();

        // Typed value expressions become matches directly; OR/negation
        // operands go back through the resolver chain.
        for expr in &extracted.expressions {
            match expr {
                ValueExpr::Numeric(n) => matches.push(numeric_match(n)),
                ValueExpr::Date(d) => matches.push(date_match(d)),
                ValueExpr::Negation(neg) => {
                    match best_match(&resolvers, &neg.operand, domain) {
                        Some(mut m) => {
                            m.operator = match m.operator {
                                CmpOp::In => CmpOp::NotIn,
                                _ => CmpOp::Neq,
                            };
                            m.term = neg.raw.clone();
                            matches.push(m);
                        }
                        None => unresolved.push(neg.operand.clone()),
                    }
                }
                ValueExpr::Or(or) => {
                    let resolved: Vec<Option<TermMatch>> = or
                        .operands
                        .iter()
                        .map(|op| best_match(&resolvers, op, domain))
                        .collect();
                    if resolved.iter().any(|m| m.is_none()) {
                        for (operand, m) in or.operands.iter().zip(&resolved) {
                            if m.is_none() {
                                unresolved.push(operand.clone());
                            }
                        }
                        continue;
                    }
                    let resolved: Vec<TermMatch> = resolved.into_iter().flatten().collect();
                    matches.extend(merge_disjunction(&or.raw, resolved));
                }
            }
        }

        // GROUP BY dimension and aggregation target re-resolve as column
        // targets, never as filter values.
        let group_by_candidates = match &analysis.group_by {
            Some(phrase) => {
                let candidates = concept_candidates(&resolvers, phrase, domain);
                if candidates.is_empty() {
                    unresolved.push(phrase.clone());
                }
                candidates
            }
            None => Vec::new(),
        };
        let agg_candidates = match &analysis.aggregation_target {
            Some(phrase) => concept_candidates(&resolvers, phrase, domain),
            None => Vec::new(),
        };

        // Residual word-level terms through the chain, bigrams first.
        let tokens = tokenize(&analysis.residual);
        let subject_entity = self.detect_subject(&tokens);
        let mut i = 0;
        while i < tokens.len() {
            if i + 1 < tokens.len() {
                // Compound values live in the term index; the reasoner
                // only sees single tokens.
                let bigram = format!("{} {}", tokens[i], tokens[i + 1]);
                if let Some(m) = best_match(&resolvers[..1], &bigram, domain) {
                    matches.push(m);
                    i += 2;
                    continue;
                }
            }
            let token = &tokens[i];
            i += 1;
            if Some(token.as_str()) == subject_entity.as_deref()
                || subject_entity
                    .as_deref()
                    .map(|s| singular(token) == s)
                    .unwrap_or(false)
            {
                // The subject noun scopes table choice; it is not a filter.
                continue;
            }
            match best_match(&resolvers, token, domain) {
                Some(m) => matches.push(m),
                None => {
                    // A token that names the question's own domain scopes
                    // table choice ("deductions above 50k"), it is not a
                    // filter value.
                    if domain.is_some() && crate::reasoner::hint_domain(token) == domain {
                        continue;
                    }
                    unresolved.push(token.clone());
                }
            }
        }

        if let Some(clarification) = self.check_ambiguity(&resolvers, &matches, &intent) {
            return Ok(clarification);
        }

        let diagnostics = Diagnostics {
            matched_terms: matches.clone(),
            unresolved_terms: unresolved.clone(),
            tables_considered: Vec::new(),
            confidence: mean_confidence(&matches),
        };

        if !unresolved.is_empty() {
            info!("Cannot resolve terms: {:?}", unresolved);
            return Ok(ResolutionResult {
                status: ResolutionStatus::CannotResolve,
                rows: Vec::new(),
                query: None,
                message: Some(format!("could not resolve: {}", unresolved.join(", "))),
                diagnostics,
            });
        }

        if matches.is_empty() && group_by_candidates.is_empty() && agg_candidates.is_empty() {
            return Ok(ResolutionResult {
                status: ResolutionStatus::CannotResolve,
                rows: Vec::new(),
                query: None,
                message: Some("no resolvable terms in question".to_string()),
                diagnostics,
            });
        }

        let query = self.assembler.assemble(
            &intent,
            &matches,
            &group_by_candidates,
            &agg_candidates,
            subject_entity.as_deref(),
        );

        let mut diagnostics = diagnostics;
        diagnostics.tables_considered = query.tables.clone();

        if !query.success {
            let reason = query.error.clone().unwrap_or_else(|| "assembly failed".to_string());
            return Ok(ResolutionResult {
                status: ResolutionStatus::CannotResolve,
                rows: Vec::new(),
                query: Some(query),
                message: Some(reason),
                diagnostics,
            });
        }

        Ok(self.execute_and_wrap(query, diagnostics).await)
    }

    /// Bounded execution; maps timeout and storage failures to
    /// `SystemError`, empty result sets to `NoData`.
    async fn execute_and_wrap(
        &self,
        query: AssembledQuery,
        diagnostics: Diagnostics,
    ) -> ResolutionResult {
        let execution = tokio::time::timeout(
            Duration::from_millis(self.timeout_ms),
            self.executor.execute(&query.sql, &query.parameters),
        )
        .await;

        let outcome = match execution {
            Err(_) => Err(EngineError::Timeout(self.timeout_ms)),
            Ok(inner) => inner,
        };

        match outcome {
            Ok(rows) => {
                let status = if rows.is_empty() {
                    ResolutionStatus::NoData
                } else {
                    ResolutionStatus::Answered
                };
                ResolutionResult {
                    status,
                    rows,
                    query: Some(query),
                    message: None,
                    diagnostics,
                }
            }
            Err(e) => {
                warn!("Execution failed: {}", e);
                ResolutionResult {
                    status: ResolutionStatus::SystemError,
                    rows: Vec::new(),
                    query: Some(query),
                    message: Some(sanitize(&e)),
                    diagnostics,
                }
            }
        }
    }

    /// An unscoped status-category term matching distinct columns across
    /// tables has no single default; ask instead of guessing.
    fn check_ambiguity(
        &self,
        resolvers: &[Box<dyn TermResolver>],
        matches: &[TermMatch],
        intent: &ParsedIntent,
    ) -> Option<ResolutionResult> {
        if intent.domain.is_some() {
            return None;
        }
        for m in matches {
            if m.term_kind != TermKind::Value {
                continue;
            }
            let Some(target) = m.target.as_ref() else {
                continue;
            };
            let Some(profile) = self.schema.profile(&target.table, &target.column) else {
                continue;
            };
            if profile.filter_category.as_deref() != Some("status") {
                continue;
            }
            // Re-resolve the term to see how many status columns claim it.
            let all = resolvers
                .first()
                .map(|r| r.resolve_term(&m.term, None))
                .unwrap_or_default();
            let distinct_targets: std::collections::HashSet<String> = all
                .iter()
                .filter_map(|c| c.target.as_ref())
                .filter(|t| {
                    self.schema
                        .profile(&t.table, &t.column)
                        .map(|p| p.filter_category.as_deref() == Some("status"))
                        .unwrap_or(false)
                })
                .map(|t| t.to_string())
                .collect();
            if distinct_targets.len() > 1 {
                return Some(ResolutionResult::status_only(
                    ResolutionStatus::NeedsClarification,
                    format!(
                        "'{}' is a status value in multiple places ({}); which one is meant?",
                        m.term,
                        distinct_targets.into_iter().collect::<Vec<_>>().join(", ")
                    ),
                ));
            }
        }
        None
    }

    /// The question's primary subject: a token whose singular form names
    /// a classified entity type ("employees" -> employee).
    fn detect_subject(&self, tokens: &[String]) -> Option<String> {
        for token in tokens {
            let candidate = singular(token);
            if self
                .schema
                .classifications
                .iter()
                .any(|c| c.entity_type.eq_ignore_ascii_case(&candidate))
            {
                return Some(candidate);
            }
        }
        None
    }
}

/// Explanatory/compliance questions need a heavier pipeline.
fn is_complex_question(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.starts_with("why")
        || lower.contains(" why ")
        || lower.starts_with("explain")
        || lower.contains("compliance")
        || lower.contains("compliant")
        || lower.contains("what is the reason")
        || lower.contains("should we")
}

fn tokenize(residual: &str) -> Vec<String> {
    residual
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|w| !w.is_empty() && !is_stop_word(w) && w.len() > 1)
        .collect()
}

fn singular(word: &str) -> String {
    let lower = word.to_lowercase();
    if let Some(stripped) = lower.strip_suffix("ies") {
        return format!("{}y", stripped);
    }
    if let Some(stripped) = lower.strip_suffix("es") {
        if stripped.len() > 2 {
            return stripped.to_string();
        }
    }
    if let Some(stripped) = lower.strip_suffix('s') {
        if stripped.len() > 2 {
            return stripped.to_string();
        }
    }
    lower
}

/// First resolver with a hit wins; within a resolver the most confident
/// match (then table name) wins. Returns None when the whole chain
/// declines.
fn best_match(
    resolvers: &[Box<dyn TermResolver>],
    term: &str,
    context_domain: Option<&str>,
) -> Option<TermMatch> {
    for resolver in resolvers {
        let mut found = resolver.resolve_term(term, context_domain);
        if found.is_empty() {
            continue;
        }
        debug!("'{}' resolved by {}", term, resolver.name());
        found.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    a.target
                        .as_ref()
                        .map(|t| t.table.clone())
                        .cmp(&b.target.as_ref().map(|t| t.table.clone()))
                })
        });
        return found.into_iter().next();
    }
    None
}

/// Column-target candidates for a GROUP BY / aggregation phrase: concept
/// matches only, index first then reasoner.
fn concept_candidates(
    resolvers: &[Box<dyn TermResolver>],
    phrase: &str,
    context_domain: Option<&str>,
) -> Vec<TermMatch> {
    for resolver in resolvers {
        let found: Vec<TermMatch> = resolver
            .resolve_term(phrase, context_domain)
            .into_iter()
            .filter(|m| m.term_kind == TermKind::Concept && m.target.is_some())
            .collect();
        if !found.is_empty() {
            return found;
        }
    }
    Vec::new()
}

fn numeric_match(n: &crate::value_expr::NumericExpr) -> TermMatch {
    let match_value = match (n.op, n.upper) {
        (CmpOp::Between, Some(upper)) => {
            MatchValue::Range(ScalarValue::Number(n.value), ScalarValue::Number(upper))
        }
        _ => MatchValue::Single(ScalarValue::Number(n.value)),
    };
    TermMatch {
        term: n.raw.clone(),
        target: None,
        operator: n.op,
        match_value,
        domain: None,
        entity: None,
        confidence: 0.95,
        term_kind: TermKind::Numeric,
        source: crate::term_index::MatchSource::TermIndex,
    }
}

fn date_match(d: &crate::value_expr::DateExpr) -> TermMatch {
    let match_value = match d.end {
        Some(end) => MatchValue::Range(ScalarValue::Date(d.start), ScalarValue::Date(end)),
        None => MatchValue::Single(ScalarValue::Date(d.start)),
    };
    let operator = if d.end.is_some() { CmpOp::Between } else { d.op };
    TermMatch {
        term: d.raw.clone(),
        target: None,
        operator,
        match_value,
        domain: None,
        entity: None,
        confidence: 0.95,
        term_kind: TermKind::Date,
        source: crate::term_index::MatchSource::TermIndex,
    }
}

/// OR operands landing on one column collapse to a single IN-list match;
/// operands on different columns stay separate predicates.
fn merge_disjunction(raw: &str, resolved: Vec<TermMatch>) -> Vec<TermMatch> {
    let same_target = resolved
        .windows(2)
        .all(|pair| pair[0].target == pair[1].target);
    if !same_target || resolved.is_empty() {
        return resolved;
    }
    let mut values = Vec::new();
    for m in &resolved {
        match &m.match_value {
            MatchValue::Single(v) => values.push(v.clone()),
            MatchValue::List(list) => values.extend(list.iter().cloned()),
            _ => return resolved.clone(),
        }
    }
    let first = &resolved[0];
    vec![TermMatch {
        term: raw.to_string(),
        target: first.target.clone(),
        operator: CmpOp::In,
        match_value: MatchValue::List(values),
        domain: first.domain.clone(),
        entity: first.entity.clone(),
        confidence: resolved.iter().map(|m| m.confidence).fold(1.0, f64::min),
        term_kind: first.term_kind,
        source: first.source,
    }]
}

fn mean_confidence(matches: &[TermMatch]) -> f64 {
    if matches.is_empty() {
        return 0.0;
    }
    matches.iter().map(|m| m.confidence).sum::<f64>() / matches.len() as f64
}

/// Bounded, stack-free diagnostic for end-of-pipe errors. The cut must
/// land on a char boundary or truncation itself would panic.
fn sanitize(e: &EngineError) -> String {
    let mut message = e.to_string().replace('\n', " ");
    if message.len() > 200 {
        let mut cut = 200;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    message
}
