//! Bitemporal records tracked along valid time and transaction time.
//!
//! Versions are append-and-close-only: a supersede closes the outgoing
//! version's `valid_end`, a correction closes its `tx_end`, and both insert a
//! successor inside one atomic unit of the storage collaborator.

use std::error::Error as StdError;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod clock;
pub mod interval;
pub mod memory;
pub mod query;
pub mod record;
pub mod repository;
pub mod schema;
pub mod selector;
pub mod store;
pub mod supersede;

pub use clock::{Clock, ManualClock, SystemClock};
pub use interval::{contains, overlaps, Interval};
pub use memory::MemoryStore;
pub use record::{Attributes, SuccessorBuilder, TemporalRecord};
pub use repository::TemporalRepository;
pub use schema::{EntitySchema, FieldKind, FieldSpec, RESERVED_FIELDS};
pub use selector::{RecordFilter, Selector, TxView};
pub use store::{VersionStore, WriteTransaction};

/// Failures reported by the query and supersede engines.
///
/// Everything except [`BitemporalError::Storage`] is a logical conflict or a
/// caller mistake; none of them are retried by the engine.
#[derive(Debug, thiserror::Error)]
pub enum BitemporalError {
    #[error(
        "bitemporal object {} (entity {}) is already superseded and can no longer be superseded",
        .0.version_id,
        .0.entity_id
    )]
    AlreadySuperseded(Box<TemporalRecord>),
    #[error(
        "bitemporal object {} (entity {}) is already supplanted and can no longer be superseded",
        .0.version_id,
        .0.entity_id
    )]
    AlreadySupplanted(Box<TemporalRecord>),
    #[error("no current version matches selector {0}")]
    NoCurrentVersion(Selector),
    #[error(
        "cutoff {cutoff} precedes valid_start {} of version {}",
        .record.valid_start,
        .record.version_id
    )]
    InvalidCutoff { cutoff: OffsetDateTime, record: Box<TemporalRecord> },
    #[error("invalid interval: end {end} must be after start {start}")]
    InvalidInterval { start: OffsetDateTime, end: OffsetDateTime },
    #[error("selector {selector} is ambiguous: it matched {matches} versions")]
    AmbiguousSelector { selector: Selector, matches: usize },
    #[error("entity {0} already exists")]
    EntityExists(EntityId),
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Storage(#[from] StorageFailure),
}

impl BitemporalError {
    /// True for logical conflicts the caller must resolve, e.g. by refetching.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::AlreadySuperseded(_)
                | Self::AlreadySupplanted(_)
                | Self::NoCurrentVersion(_)
                | Self::InvalidCutoff { .. }
                | Self::AmbiguousSelector { .. }
                | Self::EntityExists(_)
        )
    }
}

/// A failure raised by the storage collaborator, carried unchanged.
#[derive(Debug, thiserror::Error)]
#[error("storage failure: {context}")]
pub struct StorageFailure {
    context: String,
    #[source]
    source: Box<dyn StdError + Send + Sync + 'static>,
}

impl StorageFailure {
    pub fn new(
        context: impl Into<String>,
        source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
    ) -> Self {
        Self { context: context.into(), source: source.into() }
    }

    #[must_use]
    pub fn context(&self) -> &str {
        &self.context
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntityId(pub Ulid);

impl EntityId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse the canonical ULID string form.
    ///
    /// # Errors
    /// Returns [`BitemporalError::Validation`] when `raw` is not a ULID.
    pub fn parse(raw: &str) -> Result<Self, BitemporalError> {
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|err| BitemporalError::Validation(format!("invalid entity id {raw}: {err}")))
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VersionId(pub Ulid);

impl VersionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse the canonical ULID string form.
    ///
    /// # Errors
    /// Returns [`BitemporalError::Validation`] when `raw` is not a ULID.
    pub fn parse(raw: &str) -> Result<Self, BitemporalError> {
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|err| BitemporalError::Validation(format!("invalid version id {raw}: {err}")))
    }
}

impl Default for VersionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for VersionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Nanoseconds since the Unix epoch, the persisted timestamp form.
///
/// # Errors
/// Returns [`BitemporalError::Validation`] when `value` falls outside the
/// signed 64-bit nanosecond range.
pub fn unix_nanos(value: OffsetDateTime) -> Result<i64, BitemporalError> {
    i64::try_from(value.unix_timestamp_nanos()).map_err(|_| {
        BitemporalError::Validation(format!("timestamp {value} is outside the storable range"))
    })
}

/// Inverse of [`unix_nanos`]; the result is always in UTC.
///
/// # Errors
/// Returns [`BitemporalError::Validation`] when `raw` is not a valid instant.
pub fn from_unix_nanos(raw: i64) -> Result<OffsetDateTime, BitemporalError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(raw))
        .map_err(|err| BitemporalError::Validation(format!("invalid stored timestamp {raw}: {err}")))
}

pub(crate) fn utc(value: OffsetDateTime) -> OffsetDateTime {
    value.to_offset(UtcOffset::UTC)
}
