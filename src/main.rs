use anyhow::Result;
use askdb::executor::{MockExecutor, PgExecutor, QueryExecutor};
use askdb::orchestrator::{Orchestrator, ResolutionContext, ResolutionStatus};
use askdb::schema::SchemaIndex;
use askdb::term_index::{TenantRegistry, TermIndex};
use chrono::{NaiveDate, Utc};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "askdb")]
#[command(about = "Deterministic term-resolution and SQL-assembly engine")]
struct Args {
    /// The analytic question in natural language
    question: String,

    /// Path to the schema index directory (default: ./schema_index)
    #[arg(short, long, default_value = "schema_index")]
    schema_dir: PathBuf,

    /// Tenant identifier
    #[arg(short, long, default_value = "default")]
    tenant: String,

    /// Reference date for relative date phrases (default: today, UTC)
    #[arg(long)]
    reference_date: Option<NaiveDate>,

    /// Postgres connection string; omit for a dry run that only prints
    /// the assembled SQL and parameters
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    info!("Loading schema index from {}", args.schema_dir.display());
    let schema = Arc::new(SchemaIndex::load(&args.schema_dir)?);

    let registry = TenantRegistry::new();
    let handle = registry.install(&args.tenant, TermIndex::build(&schema));

    let executor: Arc<dyn QueryExecutor> = match &args.database_url {
        Some(url) => Arc::new(PgExecutor::connect(url).await?),
        None => Arc::new(MockExecutor::returning(Vec::new())),
    };
    let dry_run = args.database_url.is_none();

    let orchestrator = Orchestrator::new(schema, handle, executor);
    let ctx = ResolutionContext {
        tenant_id: args.tenant.clone(),
        reference_date: args
            .reference_date
            .unwrap_or_else(|| Utc::now().date_naive()),
    };

    let result = orchestrator.resolve_question(&args.question, &ctx).await;

    println!("status: {:?}", result.status);
    if let Some(message) = &result.message {
        println!("message: {}", message);
    }
    if let Some(query) = &result.query {
        println!("sql: {}", query.sql);
        for (i, p) in query.parameters.iter().enumerate() {
            println!("  ${} = {}", i + 1, p);
        }
    }
    if result.status == ResolutionStatus::Answered {
        println!("rows: {}", serde_json::to_string_pretty(&result.rows)?);
    } else if dry_run && result.status == ResolutionStatus::NoData {
        println!("(dry run: no database attached)");
    }
    println!(
        "diagnostics: {} matched, {} unresolved, confidence {:.2}",
        result.diagnostics.matched_terms.len(),
        result.diagnostics.unresolved_terms.len(),
        result.diagnostics.confidence
    );

    Ok(())
}
