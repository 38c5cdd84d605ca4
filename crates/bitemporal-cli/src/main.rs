use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use bitemporal_core::{
    Attributes, EntityId, EntitySchema, Selector, TemporalRecord, TemporalRepository, VersionId,
};
use bitemporal_store_sqlite::{SqliteConfig, SqliteStore};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "BITEMPORAL_LOG";

#[derive(Debug, Parser)]
#[command(name = "btr")]
#[command(about = "Bitemporal records CLI")]
struct Cli {
    #[arg(long, default_value = "./bitemporal.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value_t = 5_000)]
    busy_timeout_ms: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Entity {
        #[command(subcommand)]
        command: Box<EntityCommand>,
    },
    Query {
        #[command(subcommand)]
        command: Box<QueryCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct SchemaArgs {
    /// JSON file holding the entity schema (`kind` plus `fields`).
    #[arg(long)]
    schema: PathBuf,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct SelectorArgs {
    #[arg(long)]
    entity: Option<String>,
    #[arg(long)]
    version: Option<String>,
    /// JSON object of attribute values that must all match.
    #[arg(long = "match")]
    matching: Option<String>,
}

#[derive(Debug, Subcommand)]
enum EntityCommand {
    Create(CreateArgs),
    Supersede(SupersedeArgs),
    Correct(CorrectArgs),
}

#[derive(Debug, Args)]
struct CreateArgs {
    #[command(flatten)]
    schema: SchemaArgs,
    /// JSON object with the first version's attributes.
    #[arg(long)]
    attrs: String,
    #[arg(long)]
    entity_id: Option<String>,
    #[arg(long)]
    valid_from: Option<String>,
}

#[derive(Debug, Args)]
struct SupersedeArgs {
    #[command(flatten)]
    schema: SchemaArgs,
    #[command(flatten)]
    selector: SelectorArgs,
    /// JSON object of attribute overrides.
    #[arg(long, default_value = "{}")]
    set: String,
    #[arg(long)]
    cutoff: Option<String>,
}

#[derive(Debug, Args)]
struct CorrectArgs {
    #[command(flatten)]
    schema: SchemaArgs,
    #[command(flatten)]
    selector: SelectorArgs,
    #[arg(long, default_value = "{}")]
    set: String,
}

#[derive(Debug, Subcommand)]
enum QueryCommand {
    Current(QueryArgs),
    AsOf(AsOfArgs),
    AsOfKnowledge(AsOfKnowledgeArgs),
    History(QueryArgs),
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[command(flatten)]
    schema: SchemaArgs,
    #[command(flatten)]
    selector: SelectorArgs,
}

#[derive(Debug, Args)]
struct AsOfArgs {
    #[command(flatten)]
    schema: SchemaArgs,
    #[command(flatten)]
    selector: SelectorArgs,
    #[arg(long)]
    valid_at: String,
}

#[derive(Debug, Args)]
struct AsOfKnowledgeArgs {
    #[command(flatten)]
    schema: SchemaArgs,
    #[command(flatten)]
    selector: SelectorArgs,
    #[arg(long)]
    valid_at: String,
    #[arg(long)]
    tx_at: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SqliteConfig { busy_timeout_ms: cli.busy_timeout_ms, ..SqliteConfig::default() };
    let mut store = SqliteStore::open_with_config(&cli.db, &config)?;

    match cli.command {
        Command::Db { command } => run_db(command, &mut store),
        Command::Entity { command } => {
            store.migrate()?;
            run_entity(*command, store)
        }
        Command::Query { command } => {
            store.migrate()?;
            run_query(*command, store)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.is_up_to_date()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }))?;
        return Ok(());
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.is_up_to_date()
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::json!({
        "healthy": report.is_healthy(),
        "report": report
    }))
}

fn run_entity(command: EntityCommand, store: SqliteStore) -> Result<()> {
    match command {
        EntityCommand::Create(args) => {
            let mut repo = repository(store, &args.schema)?;
            let attributes = parse_attributes(&args.attrs, "--attrs")?;
            let valid_start = args.valid_from.as_deref().map(parse_time).transpose()?;
            let record = match args.entity_id.as_deref() {
                Some(raw) => repo.create_with_id(EntityId::parse(raw)?, attributes, valid_start)?,
                None => repo.create(attributes, valid_start)?,
            };
            emit_record(&record)
        }
        EntityCommand::Supersede(args) => {
            let mut repo = repository(store, &args.schema)?;
            let selector = parse_selector(&args.selector)?;
            let overrides = parse_attributes(&args.set, "--set")?;
            let cutoff = args.cutoff.as_deref().map(parse_time).transpose()?;
            let record = repo.supersede(&selector, overrides, cutoff)?;
            emit_record(&record)
        }
        EntityCommand::Correct(args) => {
            let mut repo = repository(store, &args.schema)?;
            let selector = parse_selector(&args.selector)?;
            let overrides = parse_attributes(&args.set, "--set")?;
            let record = repo.correct(&selector, overrides)?;
            emit_record(&record)
        }
    }
}

fn run_query(command: QueryCommand, store: SqliteStore) -> Result<()> {
    let (records, query) = match command {
        QueryCommand::Current(args) => {
            let repo = repository(store, &args.schema)?;
            (repo.current(&parse_selector(&args.selector)?)?, "current")
        }
        QueryCommand::AsOf(args) => {
            let repo = repository(store, &args.schema)?;
            let valid_at = parse_time(&args.valid_at)?;
            (repo.as_of(&parse_selector(&args.selector)?, valid_at)?, "as_of")
        }
        QueryCommand::AsOfKnowledge(args) => {
            let repo = repository(store, &args.schema)?;
            let valid_at = parse_time(&args.valid_at)?;
            let tx_at = parse_time(&args.tx_at)?;
            (repo.as_of_knowledge(&parse_selector(&args.selector)?, valid_at, tx_at)?, "as_of_knowledge")
        }
        QueryCommand::History(args) => {
            let repo = repository(store, &args.schema)?;
            (repo.history(&parse_selector(&args.selector)?)?, "history")
        }
    };

    emit_json(serde_json::json!({
        "query": query,
        "count": records.len(),
        "records": records
    }))
}

fn emit_record(record: &TemporalRecord) -> Result<()> {
    emit_json(serde_json::json!({ "record": record }))
}

fn repository(store: SqliteStore, args: &SchemaArgs) -> Result<TemporalRepository<SqliteStore>> {
    let schema = load_schema(&args.schema)?;
    Ok(TemporalRepository::new(store, schema)?)
}

fn load_schema(path: &Path) -> Result<EntitySchema> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read schema file {}", path.display()))?;
    let schema: EntitySchema = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse schema file {}", path.display()))?;
    debug!(kind = %schema.kind, fields = schema.fields.len(), "loaded entity schema");
    Ok(schema)
}

fn parse_selector(args: &SelectorArgs) -> Result<Selector> {
    if let Some(raw) = args.entity.as_deref() {
        return Ok(Selector::Entity(EntityId::parse(raw)?));
    }
    if let Some(raw) = args.version.as_deref() {
        return Ok(Selector::Version(VersionId::parse(raw)?));
    }
    if let Some(raw) = args.matching.as_deref() {
        return Ok(Selector::Attributes(parse_attributes(raw, "--match")?));
    }
    Err(anyhow!("one of --entity, --version or --match is required"))
}

fn parse_attributes(raw: &str, flag: &str) -> Result<Attributes> {
    serde_json::from_str::<Attributes>(raw)
        .with_context(|| format!("{flag} must be a JSON object: {raw}"))
}

fn parse_time(raw: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339).with_context(|| format!("invalid RFC3339 timestamp: {raw}"))
}
