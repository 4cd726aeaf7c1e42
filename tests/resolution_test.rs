//! End-to-end resolution tests over a payroll-shaped fixture schema.

use askdb::executor::{MockExecutor, QueryExecutor, Row};
use askdb::orchestrator::{Orchestrator, ResolutionContext, ResolutionStatus};
use askdb::schema::{
    ColumnProfile, ColumnRelationship, ColumnRole, InferredType, LookupEntry, RelationshipKind,
    SchemaIndex, SynonymEntry, TableClassification, TableType,
};
use askdb::term_index::{ScalarValue, TenantIndexHandle, TermIndex};
use chrono::NaiveDate;
use std::sync::Arc;

fn profile(
    table: &str,
    column: &str,
    role: ColumnRole,
    inferred: InferredType,
    top_values: &[&str],
    filter_category: Option<&str>,
) -> ColumnProfile {
    ColumnProfile {
        table: table.to_string(),
        column: column.to_string(),
        inferred_type: inferred,
        role,
        distinct_count: top_values.len().max(10) as u64,
        top_values: top_values.iter().map(|v| v.to_string()).collect(),
        filter_category: filter_category.map(|c| c.to_string()),
    }
}

fn classification(table: &str, table_type: TableType, domain: &str, entity: &str) -> TableClassification {
    TableClassification {
        table: table.to_string(),
        table_type,
        domain: domain.to_string(),
        entity_type: entity.to_string(),
    }
}

fn fk(source: &str, src_col: &str, target: &str, tgt_col: &str, meaning: &str) -> ColumnRelationship {
    ColumnRelationship {
        source_table: source.to_string(),
        source_column: src_col.to_string(),
        target_table: target.to_string(),
        target_column: tgt_col.to_string(),
        relationship_kind: RelationshipKind::ForeignKey,
        semantic_meaning: meaning.to_string(),
    }
}

fn fixture_schema() -> Arc<SchemaIndex> {
    let profiles = vec![
        profile("employees", "employee_id", ColumnRole::Identifier, InferredType::Text, &[], None),
        profile("employees", "full_name", ColumnRole::Name, InferredType::Text, &[], None),
        profile(
            "employees",
            "status",
            ColumnRole::Status,
            InferredType::Text,
            &["Active", "Terminated", "Pending"],
            Some("status"),
        ),
        profile("employees", "department", ColumnRole::Name, InferredType::Text, &[], None),
        profile(
            "employees",
            "work_state",
            ColumnRole::Code,
            InferredType::Text,
            &["TX", "CA", "NY"],
            Some("location"),
        ),
        profile("employees", "hire_date", ColumnRole::Date, InferredType::Date, &[], None),
        profile("earnings", "employee_id", ColumnRole::Identifier, InferredType::Text, &[], None),
        profile("earnings", "amount", ColumnRole::Amount, InferredType::Numeric, &[], None),
        profile("earnings", "pay_date", ColumnRole::Date, InferredType::Date, &[], None),
        profile("earnings", "pay_code", ColumnRole::Code, InferredType::Text, &[], None),
        profile("deductions", "employee_id", ColumnRole::Identifier, InferredType::Text, &[], None),
        profile("deductions", "amount", ColumnRole::Amount, InferredType::Numeric, &[], None),
        profile("deductions", "deduction_code", ColumnRole::Code, InferredType::Text, &[], None),
        profile(
            "benefits",
            "status",
            ColumnRole::Status,
            InferredType::Text,
            &["Pending", "Waived"],
            Some("status"),
        ),
        profile("benefits", "employee_id", ColumnRole::Identifier, InferredType::Text, &[], None),
        profile("pay_codes", "pay_code", ColumnRole::Code, InferredType::Text, &[], None),
        profile("pay_codes", "description", ColumnRole::Description, InferredType::Text, &[], None),
        profile("dept_config", "department", ColumnRole::Name, InferredType::Text, &[], None),
        profile(
            "island_metrics",
            "metric_name",
            ColumnRole::Name,
            InferredType::Text,
            &["velocity"],
            None,
        ),
    ];

    let classifications = vec![
        classification("employees", TableType::Master, "demographics", "employee"),
        classification("earnings", TableType::Transaction, "earnings", "employee"),
        classification("deductions", TableType::Transaction, "deductions", "employee"),
        classification("benefits", TableType::Transaction, "benefits", "employee"),
        classification("pay_codes", TableType::Config, "earnings", "pay_code"),
        classification("dept_config", TableType::Config, "demographics", "department"),
        classification("island_metrics", TableType::Transaction, "misc", "metric"),
    ];

    let relationships = vec![
        fk("earnings", "employee_id", "employees", "employee_id", "earnings_owner"),
        fk("deductions", "employee_id", "employees", "employee_id", "deductions_owner"),
        fk("benefits", "employee_id", "employees", "employee_id", "benefits_owner"),
        ColumnRelationship {
            source_table: "employees".to_string(),
            source_column: "manager_id".to_string(),
            target_table: "employees".to_string(),
            target_column: "employee_id".to_string(),
            relationship_kind: RelationshipKind::SelfReference,
            semantic_meaning: "manager".to_string(),
        },
        ColumnRelationship {
            source_table: "earnings".to_string(),
            source_column: "pay_code".to_string(),
            target_table: "pay_codes".to_string(),
            target_column: "pay_code".to_string(),
            relationship_kind: RelationshipKind::Lookup,
            semantic_meaning: "pay_code_lookup".to_string(),
        },
    ];

    let synonyms = vec![
        SynonymEntry {
            term: "texas".to_string(),
            table: "employees".to_string(),
            column: "work_state".to_string(),
            canonical_value: "TX".to_string(),
            domain: Some("demographics".to_string()),
        },
        SynonymEntry {
            term: "california".to_string(),
            table: "employees".to_string(),
            column: "work_state".to_string(),
            canonical_value: "CA".to_string(),
            domain: Some("demographics".to_string()),
        },
    ];

    let lookups = vec![
        LookupEntry {
            table: "pay_codes".to_string(),
            code_column: "pay_code".to_string(),
            description_column: "description".to_string(),
            code: "BON".to_string(),
            description: "Bonus".to_string(),
            domain: Some("earnings".to_string()),
        },
        LookupEntry {
            table: "pay_codes".to_string(),
            code_column: "pay_code".to_string(),
            description_column: "description".to_string(),
            code: "OT".to_string(),
            description: "Overtime".to_string(),
            domain: Some("earnings".to_string()),
        },
    ];

    Arc::new(SchemaIndex::new(
        profiles,
        classifications,
        relationships,
        synonyms,
        lookups,
        vec!["employee_id".to_string(), "pay_code".to_string()],
    ))
}

fn engine_with(executor: Arc<dyn QueryExecutor>) -> Orchestrator {
    let schema = fixture_schema();
    let handle = Arc::new(TenantIndexHandle::new(TermIndex::build(&schema)));
    Orchestrator::new(schema, handle, executor)
}

fn engine() -> Orchestrator {
    let row: Row = [("count".to_string(), serde_json::json!(42))].into_iter().collect();
    engine_with(Arc::new(MockExecutor::returning(vec![row])))
}

fn ctx() -> ResolutionContext {
    ResolutionContext {
        tenant_id: "acme".to_string(),
        reference_date: NaiveDate::from_ymd_opt(2025, 5, 15).unwrap(),
    }
}

#[tokio::test]
async fn resolution_is_deterministic() {
    let engine = engine();
    let a = engine.resolve_question("how many employees in texas", &ctx()).await;
    let b = engine.resolve_question("how many employees in texas", &ctx()).await;
    let qa = a.query.expect("query");
    let qb = b.query.expect("query");
    assert_eq!(qa.sql, qb.sql);
    assert_eq!(qa.parameters, qb.parameters);
}

#[tokio::test]
async fn synonym_filter_is_parameterized() {
    let engine = engine();
    let result = engine.resolve_question("how many employees in texas", &ctx()).await;
    assert_eq!(result.status, ResolutionStatus::Answered);
    let query = result.query.expect("query");
    assert_eq!(
        query.sql,
        "SELECT COUNT(*) AS count FROM employees WHERE employees.work_state = $1"
    );
    assert_eq!(query.parameters, vec![ScalarValue::Text("TX".to_string())]);
    assert!(!query.sql.contains("TX"));
}

#[tokio::test]
async fn numeric_comparison_binds_amount() {
    let engine = engine();
    let result = engine.resolve_question("deductions above 50000", &ctx()).await;
    let query = result.query.expect("query");
    assert!(query.success, "{:?}", query.error);
    assert!(query.sql.contains("deductions.amount > $1"), "sql: {}", query.sql);
    assert_eq!(query.parameters, vec![ScalarValue::Number(50000.0)]);
}

#[tokio::test]
async fn numeric_range_becomes_between() {
    let engine = engine();
    let result = engine
        .resolve_question("deductions between 20000 and 40000", &ctx())
        .await;
    let query = result.query.expect("query");
    assert!(query.success, "{:?}", query.error);
    assert!(
        query.sql.contains("deductions.amount BETWEEN $1 AND $2"),
        "sql: {}",
        query.sql
    );
    assert_eq!(
        query.parameters,
        vec![ScalarValue::Number(20000.0), ScalarValue::Number(40000.0)]
    );
}

#[tokio::test]
async fn total_deductions_uses_sum() {
    let engine = engine();
    let result = engine
        .resolve_question("total deductions above 50000", &ctx())
        .await;
    let query = result.query.expect("query");
    assert!(query.success, "{:?}", query.error);
    assert!(
        query.sql.starts_with("SELECT SUM(deductions.amount)::float8 AS total"),
        "sql: {}",
        query.sql
    );
}

#[tokio::test]
async fn negation_is_not_a_text_search() {
    let engine = engine();
    let result = engine
        .resolve_question("employees not terminated", &ctx())
        .await;
    let query = result.query.expect("query");
    assert!(query.success, "{:?}", query.error);
    assert!(query.sql.contains("employees.status != $1"), "sql: {}", query.sql);
    assert!(!query.sql.to_uppercase().contains("LIKE"));
    assert_eq!(query.parameters, vec![ScalarValue::Text("Terminated".to_string())]);
}

#[tokio::test]
async fn disjunction_becomes_in_list() {
    let engine = engine();
    let result = engine
        .resolve_question("employees in texas or california", &ctx())
        .await;
    let query = result.query.expect("query");
    assert!(query.success, "{:?}", query.error);
    assert!(query.sql.contains("employees.work_state IN ($1, $2)"), "sql: {}", query.sql);
    assert_eq!(
        query.parameters,
        vec![
            ScalarValue::Text("TX".to_string()),
            ScalarValue::Text("CA".to_string())
        ]
    );
}

#[tokio::test]
async fn date_phrase_filters_hire_date() {
    let engine = engine();
    let result = engine
        .resolve_question("how many employees last year", &ctx())
        .await;
    let query = result.query.expect("query");
    assert!(query.success, "{:?}", query.error);
    assert!(
        query.sql.contains("employees.hire_date BETWEEN $1 AND $2"),
        "sql: {}",
        query.sql
    );
    assert_eq!(
        query.parameters,
        vec![
            ScalarValue::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
            ScalarValue::Date(NaiveDate::from_ymd_opt(2024, 12, 31).unwrap())
        ]
    );
}

#[tokio::test]
async fn group_by_targets_non_config_table() {
    let engine = engine();
    let result = engine
        .resolve_question("how many employees by department", &ctx())
        .await;
    let query = result.query.expect("query");
    assert!(query.success, "{:?}", query.error);
    assert_eq!(query.group_by_column.as_deref(), Some("employees.department"));
    assert!(query.sql.contains("GROUP BY employees.department"), "sql: {}", query.sql);
    assert!(!query.sql.contains("dept_config"));
}

#[tokio::test]
async fn lookup_description_joins_to_transactions() {
    let engine = engine();
    let result = engine
        .resolve_question("how many bonus earnings above 1000", &ctx())
        .await;
    let query = result.query.expect("query");
    assert!(query.success, "{:?}", query.error);
    // "bonus" resolves through the pay_codes lookup to a code filter,
    // but the transaction table stays the anchor.
    assert!(
        query.sql.contains("FROM earnings JOIN pay_codes ON earnings.pay_code = pay_codes.pay_code"),
        "sql: {}",
        query.sql
    );
    assert!(query.sql.contains("pay_codes.pay_code = $2"), "sql: {}", query.sql);
    assert_eq!(
        query.parameters,
        vec![ScalarValue::Number(1000.0), ScalarValue::Text("BON".to_string())]
    );
    assert!(!query.sql.to_lowercase().contains("'bon'"));
}

#[tokio::test]
async fn unresolvable_term_fails_honestly() {
    let engine = engine();
    let result = engine.resolve_question("count of zorblex", &ctx()).await;
    assert_eq!(result.status, ResolutionStatus::CannotResolve);
    assert!(result
        .diagnostics
        .unresolved_terms
        .contains(&"zorblex".to_string()));
}

#[tokio::test]
async fn missing_join_path_fails_assembly() {
    let engine = engine();
    let result = engine
        .resolve_question("active employees with velocity", &ctx())
        .await;
    assert_eq!(result.status, ResolutionStatus::CannotResolve);
    let query = result.query.expect("failed query is still returned");
    assert!(!query.success);
    assert!(
        query.error.as_deref().unwrap_or("").contains("no join path"),
        "error: {:?}",
        query.error
    );
}

#[tokio::test]
async fn ambiguous_status_value_asks_for_clarification() {
    let engine = engine();
    // "Pending" is a status value on both employees and benefits; with
    // nothing scoping the question, the engine must ask, not guess.
    let result = engine.resolve_question("how many pending", &ctx()).await;
    assert_eq!(result.status, ResolutionStatus::NeedsClarification);
}

#[tokio::test]
async fn why_question_routes_to_complex() {
    let engine = engine();
    let result = engine
        .resolve_question("why did total deductions change last month", &ctx())
        .await;
    assert_eq!(result.status, ResolutionStatus::ComplexQuery);
}

#[tokio::test]
async fn empty_result_set_is_no_data() {
    let engine = engine_with(Arc::new(MockExecutor::returning(Vec::new())));
    let result = engine.resolve_question("employees in texas", &ctx()).await;
    assert_eq!(result.status, ResolutionStatus::NoData);
}

#[tokio::test]
async fn multibyte_question_text_resolves_cleanly() {
    let engine = engine();
    // 'İ' lowercases to a longer byte sequence; phrase blanking and
    // tokenization must stay aligned instead of panicking.
    let result = engine
        .resolve_question("İstanbul employees not terminated", &ctx())
        .await;
    assert_eq!(result.status, ResolutionStatus::Answered);
    let query = result.query.expect("query");
    assert!(query.sql.contains("employees.status != $1"), "sql: {}", query.sql);
}

#[tokio::test]
async fn long_accented_error_message_truncates_on_char_boundary() {
    let message = format!("{}{}", "x".repeat(182), "é".repeat(20));
    let engine = engine_with(Arc::new(MockExecutor::failing(&message)));
    let result = engine.resolve_question("employees in texas", &ctx()).await;
    assert_eq!(result.status, ResolutionStatus::SystemError);
    let out = result.message.unwrap_or_default();
    assert!(out.len() <= 200, "message not bounded: {} bytes", out.len());
    assert!(out.contains("xxx"));
}

#[tokio::test]
async fn executor_failure_is_system_error() {
    let engine = engine_with(Arc::new(MockExecutor::failing("connection refused")));
    let result = engine.resolve_question("employees in texas", &ctx()).await;
    assert_eq!(result.status, ResolutionStatus::SystemError);
    let message = result.message.unwrap_or_default();
    assert!(message.contains("connection refused"));
    assert!(!message.contains('\n'));
}

#[tokio::test]
async fn slow_executor_times_out_as_system_error() {
    let schema = fixture_schema();
    let handle = Arc::new(TenantIndexHandle::new(TermIndex::build(&schema)));
    let engine = Orchestrator::new(schema, handle, Arc::new(MockExecutor::stalling(500)))
        .with_timeout_ms(50);
    let result = engine.resolve_question("employees in texas", &ctx()).await;
    assert_eq!(result.status, ResolutionStatus::SystemError);
    assert!(result.message.unwrap_or_default().contains("timed out"));
}

#[tokio::test]
async fn reports_to_builds_self_join() {
    let engine = engine();
    let result = engine.resolve_question("who reports to John", &ctx()).await;
    let query = result.query.expect("query");
    assert!(query.success, "{:?}", query.error);
    assert!(
        query
            .sql
            .contains("JOIN employees rel ON base.manager_id = rel.employee_id"),
        "sql: {}",
        query.sql
    );
    assert_eq!(query.parameters, vec![ScalarValue::Text("%John%".to_string())]);
    // the traversal path reports diagnostics too
    assert_eq!(result.diagnostics.tables_considered, vec!["employees".to_string()]);
    assert!(result
        .diagnostics
        .matched_terms
        .iter()
        .any(|m| m.term == "John"));
}

#[tokio::test]
async fn index_rebuild_does_not_break_inflight_snapshot() {
    let schema = fixture_schema();
    let handle = Arc::new(TenantIndexHandle::new(TermIndex::build(&schema)));
    let snapshot = handle.snapshot();
    handle.swap(TermIndex::default());
    // the old snapshot still resolves
    assert!(!snapshot.resolve_one("texas").is_empty());
    assert_eq!(handle.version(), 2);
}
