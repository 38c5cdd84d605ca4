use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime};

use crate::interval::Interval;
use crate::schema::RESERVED_FIELDS;
use crate::{unix_nanos, utc, BitemporalError, EntityId, VersionId};

/// Domain attributes of one version, keyed by field name.
pub type Attributes = BTreeMap<String, Value>;

/// One version of a logical entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemporalRecord {
    pub version_id: VersionId,
    pub entity_id: EntityId,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_start: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub valid_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub tx_start: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub tx_end: Option<OffsetDateTime>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl TemporalRecord {
    /// The first version of a new logical entity: both end fields open.
    #[must_use]
    pub fn first_version(
        entity_id: EntityId,
        valid_start: OffsetDateTime,
        tx_start: OffsetDateTime,
        attributes: Attributes,
    ) -> Self {
        Self {
            version_id: VersionId::new(),
            entity_id,
            valid_start: utc(valid_start),
            valid_end: None,
            tx_start: utc(tx_start),
            tx_end: None,
            attributes,
        }
    }

    /// Start building the version that replaces this one.
    #[must_use]
    pub fn successor(&self) -> SuccessorBuilder<'_> {
        SuccessorBuilder {
            predecessor: self,
            overrides: Attributes::new(),
            valid_start: None,
            recorded_at: None,
        }
    }

    #[must_use]
    pub fn valid_interval(&self) -> Interval {
        Interval::from_parts(self.valid_start, self.valid_end)
    }

    #[must_use]
    pub fn tx_interval(&self) -> Interval {
        Interval::from_parts(self.tx_start, self.tx_end)
    }

    /// `tx_end` is open: this version is part of the current record of knowledge.
    #[must_use]
    pub fn is_current_knowledge(&self) -> bool {
        self.tx_end.is_none()
    }

    /// `valid_end` is open: still valid going forward.
    #[must_use]
    pub fn is_forward_valid(&self) -> bool {
        self.valid_end.is_none()
    }

    /// The version a supersede on this entity would close.
    #[must_use]
    pub fn is_head(&self) -> bool {
        self.is_current_knowledge() && self.is_forward_valid()
    }

    /// Check interval bounds, storable timestamps and attribute names.
    ///
    /// # Errors
    /// Returns [`BitemporalError::InvalidInterval`] for an empty or inverted
    /// window, or [`BitemporalError::Validation`] for unstorable timestamps
    /// and reserved attribute names.
    pub fn validate(&self) -> Result<(), BitemporalError> {
        Interval::new(self.valid_start, self.valid_end)?;
        Interval::new(self.tx_start, self.tx_end)?;

        for instant in [Some(self.valid_start), self.valid_end, Some(self.tx_start), self.tx_end]
            .into_iter()
            .flatten()
        {
            unix_nanos(instant)?;
        }

        if let Some(name) = self.attributes.keys().find(|name| RESERVED_FIELDS.contains(&name.as_str()))
        {
            return Err(BitemporalError::Validation(format!(
                "attribute name {name} is reserved for temporal bookkeeping"
            )));
        }

        Ok(())
    }
}

/// Construct a successor from a predecessor plus an override set, without
/// touching the predecessor.
#[derive(Debug, Clone)]
pub struct SuccessorBuilder<'a> {
    predecessor: &'a TemporalRecord,
    overrides: Attributes,
    valid_start: Option<OffsetDateTime>,
    recorded_at: Option<OffsetDateTime>,
}

impl SuccessorBuilder<'_> {
    #[must_use]
    pub fn overrides(mut self, overrides: Attributes) -> Self {
        self.overrides.extend(overrides);
        self
    }

    #[must_use]
    pub fn set(mut self, name: impl Into<String>, value: Value) -> Self {
        self.overrides.insert(name.into(), value);
        self
    }

    /// Defaults to the predecessor's `valid_start`.
    #[must_use]
    pub fn valid_from(mut self, valid_start: OffsetDateTime) -> Self {
        self.valid_start = Some(valid_start);
        self
    }

    /// Defaults to the current wall clock.
    #[must_use]
    pub fn recorded_at(mut self, recorded_at: OffsetDateTime) -> Self {
        self.recorded_at = Some(recorded_at);
        self
    }

    #[must_use]
    pub fn build(self) -> TemporalRecord {
        let mut attributes = self.predecessor.attributes.clone();
        attributes.extend(self.overrides);

        let recorded_at = self.recorded_at.unwrap_or_else(OffsetDateTime::now_utc);
        TemporalRecord {
            version_id: VersionId::new(),
            entity_id: self.predecessor.entity_id,
            valid_start: utc(self.valid_start.unwrap_or(self.predecessor.valid_start)),
            valid_end: None,
            tx_start: next_tx_start(self.predecessor, recorded_at),
            tx_end: None,
            attributes,
        }
    }
}

/// `tx_start` strictly increases along a chain even when the clock does not.
#[must_use]
pub fn next_tx_start(predecessor: &TemporalRecord, now: OffsetDateTime) -> OffsetDateTime {
    let floor = predecessor.tx_start + Duration::nanoseconds(1);
    utc(if now < floor { floor } else { now })
}
