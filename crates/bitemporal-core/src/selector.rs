use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::record::{Attributes, TemporalRecord};
use crate::{EntityId, VersionId};

/// Which versions an operation addresses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum Selector {
    /// Every version of one logical entity; writes target its head.
    Entity(EntityId),
    /// One specific version, possibly a stale reference.
    Version(VersionId),
    /// Versions whose attributes equal every given pair.
    Attributes(Attributes),
}

impl Selector {
    #[must_use]
    pub fn matches(&self, record: &TemporalRecord) -> bool {
        match self {
            Self::Entity(entity_id) => record.entity_id == *entity_id,
            Self::Version(version_id) => record.version_id == *version_id,
            Self::Attributes(expected) => expected
                .iter()
                .all(|(name, value)| record.attributes.get(name) == Some(value)),
        }
    }

    /// Whether a write should lock and consider `record`. Entity and attribute
    /// selectors only reach head versions; a version selector reaches its
    /// version regardless of state so stale references can be reported.
    #[must_use]
    pub fn targets_for_write(&self, record: &TemporalRecord) -> bool {
        match self {
            Self::Version(_) => self.matches(record),
            Self::Entity(_) | Self::Attributes(_) => record.is_head() && self.matches(record),
        }
    }
}

impl Display for Selector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entity(entity_id) => write!(f, "entity:{entity_id}"),
            Self::Version(version_id) => write!(f, "version:{version_id}"),
            Self::Attributes(attributes) => {
                let pairs = attributes
                    .iter()
                    .map(|(name, value)| format!("{name}={value}"))
                    .collect::<Vec<_>>();
                write!(f, "attributes:{{{}}}", pairs.join(","))
            }
        }
    }
}

/// The transaction-time slice a read observes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "view", content = "at", rename_all = "snake_case")]
pub enum TxView {
    /// `tx_end` open: as currently known.
    Current,
    /// `[tx_start, tx_end)` contains the instant.
    AsOf(#[serde(with = "time::serde::rfc3339")] OffsetDateTime),
    /// Every version ever recorded.
    All,
}

/// A read request handed to the storage collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordFilter {
    pub kind: String,
    pub selector: Selector,
    pub valid_at: Option<OffsetDateTime>,
    pub tx_view: TxView,
}

impl RecordFilter {
    #[must_use]
    pub fn new(kind: impl Into<String>, selector: Selector) -> Self {
        Self { kind: kind.into(), selector, valid_at: None, tx_view: TxView::Current }
    }

    #[must_use]
    pub fn valid_at(mut self, instant: OffsetDateTime) -> Self {
        self.valid_at = Some(instant);
        self
    }

    #[must_use]
    pub fn tx_view(mut self, tx_view: TxView) -> Self {
        self.tx_view = tx_view;
        self
    }

    /// The reference predicate every store must agree with. The kind is
    /// checked by the store, which owns that column.
    #[must_use]
    pub fn matches(&self, record: &TemporalRecord) -> bool {
        if !self.selector.matches(record) {
            return false;
        }

        if let Some(instant) = self.valid_at {
            if !record.valid_interval().contains(instant) {
                return false;
            }
        }

        match self.tx_view {
            TxView::Current => record.is_current_knowledge(),
            TxView::AsOf(instant) => record.tx_interval().contains(instant),
            TxView::All => true,
        }
    }
}

/// Order used by every query result: `tx_start`, then `version_id`.
pub fn sort_by_recording(records: &mut [TemporalRecord]) {
    records.sort_by(|lhs, rhs| {
        lhs.tx_start.cmp(&rhs.tx_start).then_with(|| lhs.version_id.cmp(&rhs.version_id))
    });
}
