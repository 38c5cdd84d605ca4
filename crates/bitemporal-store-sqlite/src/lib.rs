use std::path::Path;

use anyhow::{anyhow, Context, Result};
use bitemporal_core::{
    from_unix_nanos, unix_nanos, BitemporalError, EntityId, RecordFilter, Selector,
    StorageFailure, TemporalRecord, TxView, VersionId, VersionStore, WriteTransaction,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

// Timestamps are UTC nanoseconds since the Unix epoch; NULL ends are open.
const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS temporal_records (
  version_id TEXT PRIMARY KEY,
  entity_kind TEXT NOT NULL CHECK (length(entity_kind) > 0),
  entity_id TEXT NOT NULL,
  valid_start INTEGER NOT NULL,
  valid_end INTEGER CHECK (valid_end IS NULL OR valid_end > valid_start),
  tx_start INTEGER NOT NULL,
  tx_end INTEGER CHECK (tx_end IS NULL OR tx_end > tx_start),
  attributes_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_temporal_records_entity
  ON temporal_records(entity_kind, entity_id, tx_start);
CREATE INDEX IF NOT EXISTS idx_temporal_records_valid
  ON temporal_records(entity_kind, valid_start, valid_end);
CREATE INDEX IF NOT EXISTS idx_temporal_records_tx
  ON temporal_records(entity_kind, tx_start, tx_end);
CREATE UNIQUE INDEX IF NOT EXISTS idx_temporal_records_head
  ON temporal_records(entity_kind, entity_id)
  WHERE valid_end IS NULL AND tx_end IS NULL;
";

const MIGRATION_002_SQL: &str = r"
CREATE TRIGGER IF NOT EXISTS temporal_records_no_delete
BEFORE DELETE ON temporal_records
BEGIN
  SELECT RAISE(ABORT, 'temporal_records is append-only');
END;

CREATE TRIGGER IF NOT EXISTS temporal_records_close_only
BEFORE UPDATE ON temporal_records
WHEN NEW.version_id IS NOT OLD.version_id
  OR NEW.entity_kind IS NOT OLD.entity_kind
  OR NEW.entity_id IS NOT OLD.entity_id
  OR NEW.valid_start IS NOT OLD.valid_start
  OR NEW.tx_start IS NOT OLD.tx_start
  OR NEW.attributes_json IS NOT OLD.attributes_json
  OR (OLD.valid_end IS NOT NULL AND NEW.valid_end IS NOT OLD.valid_end)
  OR (OLD.tx_end IS NOT NULL AND NEW.tx_end IS NOT OLD.tx_end)
BEGIN
  SELECT RAISE(ABORT, 'temporal_records only allows closing an open valid_end or tx_end');
END;
";

const MIGRATIONS: [(i64, &str); 2] = [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)];

const SELECT_RECORD_COLUMNS: &str = "SELECT version_id, entity_id, valid_start, valid_end, \
     tx_start, tx_end, attributes_json FROM temporal_records";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    #[default]
    Wal,
    Delete,
    Truncate,
    Memory,
}

impl JournalMode {
    #[must_use]
    pub fn as_pragma(self) -> &'static str {
        match self {
            Self::Wal => "WAL",
            Self::Delete => "DELETE",
            Self::Truncate => "TRUNCATE",
            Self::Memory => "MEMORY",
        }
    }
}

/// Connection settings applied as pragmas on open.
///
/// `busy_timeout_ms` is the whole lock-wait policy: a writer blocked on a
/// competing write unit waits at most this long before failing with a
/// storage error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SqliteConfig {
    pub busy_timeout_ms: u32,
    pub journal_mode: JournalMode,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self { busy_timeout_ms: 5_000, journal_mode: JournalMode::Wal }
    }
}

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl SchemaStatus {
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending_versions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    MultipleHeads,
    InvertedValidInterval,
    InvertedTxInterval,
    NonIncreasingTxStart,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvariantViolation {
    pub kind: ViolationKind,
    pub entity_kind: String,
    pub entity_id: String,
    pub version_id: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub violations: Vec<InvariantViolation>,
    pub schema_status: SchemaStatus,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.quick_check_ok && self.violations.is_empty()
    }
}

impl SqliteStore {
    /// Open a SQLite-backed bitemporal store with the default configuration.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(path, &SqliteConfig::default())
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_with_config(path: &Path, config: &SqliteConfig) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        Self::configure(conn, config)
    }

    /// # Errors
    /// Returns an error when the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite database")?;
        Self::configure(conn, &SqliteConfig::default())
    }

    fn configure(conn: Connection, config: &SqliteConfig) -> Result<Self> {
        conn.execute_batch(&format!(
            "PRAGMA busy_timeout = {};
             PRAGMA journal_mode = {};
             PRAGMA foreign_keys = ON;",
            config.busy_timeout_ms,
            config.journal_mode.as_pragma()
        ))
        .context("failed to configure sqlite pragmas")?;
        debug!(
            journal_mode = config.journal_mode.as_pragma(),
            busy_timeout_ms = config.busy_timeout_ms,
            "sqlite store configured"
        );

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when the database is newer than this build or any
    /// migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        for (target, sql) in MIGRATIONS.iter().filter(|(target, _)| *target > version) {
            let tx = self
                .conn
                .transaction()
                .with_context(|| format!("failed to start migration v{target} transaction"))?;
            tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{target}"))?;
            record_schema_version(&tx, *target)?;
            tx.commit().with_context(|| format!("failed to commit migration v{target}"))?;
            info!(version = *target, "applied bitemporal schema migration");
        }

        Ok(())
    }

    /// Run quick-check, schema status and bitemporal invariant probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let violations = if table_exists(&self.conn, "temporal_records")? {
            let mut violations = multiple_heads(&self.conn)?;
            violations.extend(inverted_intervals(&self.conn)?);
            violations.extend(non_increasing_tx_start(&self.conn)?);
            violations
        } else {
            Vec::new()
        };
        if !violations.is_empty() {
            warn!(count = violations.len(), "bitemporal invariant violations found");
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            violations,
            schema_status,
        })
    }
}

impl VersionStore for SqliteStore {
    fn select(&self, filter: &RecordFilter) -> Result<Vec<TemporalRecord>, BitemporalError> {
        query_records(&self.conn, filter)
    }

    fn atomically<T, F>(&mut self, operation: F) -> Result<T, BitemporalError>
    where
        F: FnOnce(&mut dyn WriteTransaction) -> Result<T, BitemporalError>,
    {
        // IMMEDIATE takes the database write lock up front, so the re-reads
        // made by the operation see every previously committed unit.
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage("failed to begin write transaction"))?;
        let mut unit = SqliteWrite { tx };
        let value = operation(&mut unit)?;
        unit.tx.commit().map_err(storage("failed to commit write transaction"))?;
        Ok(value)
    }
}

struct SqliteWrite<'conn> {
    tx: Transaction<'conn>,
}

impl WriteTransaction for SqliteWrite<'_> {
    fn lock_entity(
        &mut self,
        kind: &str,
        entity_id: EntityId,
    ) -> Result<Vec<TemporalRecord>, BitemporalError> {
        let filter = RecordFilter::new(kind, Selector::Entity(entity_id)).tx_view(TxView::All);
        query_records(&self.tx, &filter)
    }

    fn close_valid_time(
        &mut self,
        kind: &str,
        version_id: VersionId,
        at: OffsetDateTime,
    ) -> Result<bool, BitemporalError> {
        let changed = self
            .tx
            .execute(
                "UPDATE temporal_records SET valid_end = ?3
                 WHERE entity_kind = ?1 AND version_id = ?2 AND valid_end IS NULL",
                params![kind, version_id.to_string(), unix_nanos(at)?],
            )
            .map_err(storage("failed to close valid time"))?;
        Ok(changed == 1)
    }

    fn close_transaction_time(
        &mut self,
        kind: &str,
        version_id: VersionId,
        at: OffsetDateTime,
    ) -> Result<bool, BitemporalError> {
        let changed = self
            .tx
            .execute(
                "UPDATE temporal_records SET tx_end = ?3
                 WHERE entity_kind = ?1 AND version_id = ?2 AND tx_end IS NULL",
                params![kind, version_id.to_string(), unix_nanos(at)?],
            )
            .map_err(storage("failed to close transaction time"))?;
        Ok(changed == 1)
    }

    fn insert(&mut self, kind: &str, record: &TemporalRecord) -> Result<(), BitemporalError> {
        let attributes_json = serde_json::to_string(&record.attributes).map_err(|err| {
            BitemporalError::Storage(StorageFailure::new("failed to encode attributes", err))
        })?;

        self.tx
            .execute(
                "INSERT INTO temporal_records(
                    version_id, entity_kind, entity_id, valid_start, valid_end,
                    tx_start, tx_end, attributes_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.version_id.to_string(),
                    kind,
                    record.entity_id.to_string(),
                    unix_nanos(record.valid_start)?,
                    record.valid_end.map(unix_nanos).transpose()?,
                    unix_nanos(record.tx_start)?,
                    record.tx_end.map(unix_nanos).transpose()?,
                    attributes_json,
                ],
            )
            .map_err(storage("failed to insert temporal record"))?;
        Ok(())
    }
}

fn storage(context: &'static str) -> impl Fn(rusqlite::Error) -> BitemporalError {
    move |err| BitemporalError::Storage(StorageFailure::new(context, err))
}

struct StoredRow {
    version_id: String,
    entity_id: String,
    valid_start: i64,
    valid_end: Option<i64>,
    tx_start: i64,
    tx_end: Option<i64>,
    attributes_json: String,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRow> {
    Ok(StoredRow {
        version_id: row.get(0)?,
        entity_id: row.get(1)?,
        valid_start: row.get(2)?,
        valid_end: row.get(3)?,
        tx_start: row.get(4)?,
        tx_end: row.get(5)?,
        attributes_json: row.get(6)?,
    })
}

fn decode(row: StoredRow) -> Result<TemporalRecord, BitemporalError> {
    let attributes = serde_json::from_str(&row.attributes_json).map_err(|err| {
        BitemporalError::Storage(StorageFailure::new(
            format!("corrupt attributes_json for version {}", row.version_id),
            err,
        ))
    })?;

    Ok(TemporalRecord {
        version_id: VersionId::parse(&row.version_id)?,
        entity_id: EntityId::parse(&row.entity_id)?,
        valid_start: from_unix_nanos(row.valid_start)?,
        valid_end: row.valid_end.map(from_unix_nanos).transpose()?,
        tx_start: from_unix_nanos(row.tx_start)?,
        tx_end: row.tx_end.map(from_unix_nanos).transpose()?,
        attributes,
    })
}

/// Translate `filter` into indexed predicates over the temporal columns.
/// Attribute equality is applied after decoding.
fn query_records(
    conn: &Connection,
    filter: &RecordFilter,
) -> Result<Vec<TemporalRecord>, BitemporalError> {
    let mut sql = format!("{SELECT_RECORD_COLUMNS} WHERE entity_kind = ?");
    let mut values = vec![SqlValue::Text(filter.kind.clone())];

    match &filter.selector {
        Selector::Entity(entity_id) => {
            sql.push_str(" AND entity_id = ?");
            values.push(SqlValue::Text(entity_id.to_string()));
        }
        Selector::Version(version_id) => {
            sql.push_str(" AND version_id = ?");
            values.push(SqlValue::Text(version_id.to_string()));
        }
        Selector::Attributes(_) => {}
    }

    if let Some(instant) = filter.valid_at {
        let at = unix_nanos(instant)?;
        sql.push_str(" AND valid_start <= ? AND (valid_end IS NULL OR valid_end > ?)");
        values.extend([SqlValue::Integer(at), SqlValue::Integer(at)]);
    }

    match filter.tx_view {
        TxView::Current => sql.push_str(" AND tx_end IS NULL"),
        TxView::AsOf(instant) => {
            let at = unix_nanos(instant)?;
            sql.push_str(" AND tx_start <= ? AND (tx_end IS NULL OR tx_end > ?)");
            values.extend([SqlValue::Integer(at), SqlValue::Integer(at)]);
        }
        TxView::All => {}
    }
    sql.push_str(" ORDER BY tx_start ASC, version_id ASC");

    let mut stmt = conn.prepare_cached(&sql).map_err(storage("failed to prepare temporal query"))?;
    let rows = stmt
        .query_map(params_from_iter(values), read_row)
        .map_err(storage("failed to run temporal query"))?;

    let mut records = Vec::new();
    for row in rows {
        let record = decode(row.map_err(storage("failed to read temporal record"))?)?;
        if filter.selector.matches(&record) {
            records.push(record);
        }
    }
    Ok(records)
}

fn multiple_heads(conn: &Connection) -> Result<Vec<InvariantViolation>> {
    let mut stmt = conn.prepare(
        "SELECT entity_kind, entity_id, COUNT(*) FROM temporal_records
         WHERE valid_end IS NULL AND tx_end IS NULL
         GROUP BY entity_kind, entity_id
         HAVING COUNT(*) > 1
         ORDER BY entity_kind, entity_id",
    )?;
    let rows = stmt.query_map([], |row| {
        let heads: i64 = row.get(2)?;
        Ok(InvariantViolation {
            kind: ViolationKind::MultipleHeads,
            entity_kind: row.get(0)?,
            entity_id: row.get(1)?,
            version_id: None,
            detail: format!("{heads} versions have both valid_end and tx_end open"),
        })
    })?;

    let mut violations = Vec::new();
    for row in rows {
        violations.push(row?);
    }
    Ok(violations)
}

fn inverted_intervals(conn: &Connection) -> Result<Vec<InvariantViolation>> {
    let mut stmt = conn.prepare(
        "SELECT entity_kind, entity_id, version_id,
                valid_end IS NOT NULL AND valid_end <= valid_start,
                tx_end IS NOT NULL AND tx_end <= tx_start
         FROM temporal_records
         WHERE (valid_end IS NOT NULL AND valid_end <= valid_start)
            OR (tx_end IS NOT NULL AND tx_end <= tx_start)
         ORDER BY rowid",
    )?;
    let mut rows = stmt.query([])?;

    let mut violations = Vec::new();
    while let Some(row) = rows.next()? {
        let entity_kind: String = row.get(0)?;
        let entity_id: String = row.get(1)?;
        let version_id: String = row.get(2)?;
        if row.get::<_, bool>(3)? {
            violations.push(InvariantViolation {
                kind: ViolationKind::InvertedValidInterval,
                entity_kind: entity_kind.clone(),
                entity_id: entity_id.clone(),
                version_id: Some(version_id.clone()),
                detail: "valid_end does not follow valid_start".to_string(),
            });
        }
        if row.get::<_, bool>(4)? {
            violations.push(InvariantViolation {
                kind: ViolationKind::InvertedTxInterval,
                entity_kind,
                entity_id,
                version_id: Some(version_id),
                detail: "tx_end does not follow tx_start".to_string(),
            });
        }
    }
    Ok(violations)
}

/// Along insertion order every version of an entity must be recorded after
/// the one before it.
fn non_increasing_tx_start(conn: &Connection) -> Result<Vec<InvariantViolation>> {
    let mut stmt = conn.prepare(
        "SELECT entity_kind, entity_id, version_id, tx_start, previous_tx_start FROM (
            SELECT entity_kind, entity_id, version_id, tx_start, rowid AS seq,
                   LAG(tx_start) OVER (
                       PARTITION BY entity_kind, entity_id ORDER BY rowid
                   ) AS previous_tx_start
            FROM temporal_records
         )
         WHERE previous_tx_start IS NOT NULL AND tx_start <= previous_tx_start
         ORDER BY seq",
    )?;
    let rows = stmt.query_map([], |row| {
        let tx_start: i64 = row.get(3)?;
        let previous: i64 = row.get(4)?;
        Ok(InvariantViolation {
            kind: ViolationKind::NonIncreasingTxStart,
            entity_kind: row.get(0)?,
            entity_id: row.get(1)?,
            version_id: Some(row.get(2)?),
            detail: format!("tx_start {tx_start} does not follow predecessor tx_start {previous}"),
        })
    })?;

    let mut violations = Vec::new();
    for row in rows {
        violations.push(row?);
    }
    Ok(violations)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}
