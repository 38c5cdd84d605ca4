use std::sync::Arc;

use time::OffsetDateTime;

use crate::clock::{Clock, SystemClock};
use crate::record::{Attributes, TemporalRecord};
use crate::schema::EntitySchema;
use crate::selector::Selector;
use crate::store::VersionStore;
use crate::{query, supersede, BitemporalError, EntityId};

/// One entity kind's bitemporal API over a storage collaborator.
///
/// Reads never lock; writes go through the supersede protocol. Transaction
/// time always comes from the repository's clock.
pub struct TemporalRepository<S> {
    store: S,
    schema: EntitySchema,
    clock: Arc<dyn Clock>,
}

impl<S: VersionStore> TemporalRepository<S> {
    /// # Errors
    /// Returns [`BitemporalError::Validation`] when `schema` is malformed.
    pub fn new(store: S, schema: EntitySchema) -> Result<Self, BitemporalError> {
        Self::with_clock(store, schema, Arc::new(SystemClock))
    }

    /// # Errors
    /// Returns [`BitemporalError::Validation`] when `schema` is malformed.
    pub fn with_clock(
        store: S,
        schema: EntitySchema,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BitemporalError> {
        schema.validate()?;
        Ok(Self { store, schema, clock })
    }

    #[must_use]
    pub fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    #[must_use]
    pub fn into_store(self) -> S {
        self.store
    }

    fn kind(&self) -> &str {
        &self.schema.kind
    }

    /// Create a new logical entity valid from `valid_start` (default: now).
    ///
    /// # Errors
    /// See [`supersede::create`].
    pub fn create(
        &mut self,
        attributes: Attributes,
        valid_start: Option<OffsetDateTime>,
    ) -> Result<TemporalRecord, BitemporalError> {
        self.create_with_id(EntityId::new(), attributes, valid_start)
    }

    /// # Errors
    /// See [`supersede::create`].
    pub fn create_with_id(
        &mut self,
        entity_id: EntityId,
        attributes: Attributes,
        valid_start: Option<OffsetDateTime>,
    ) -> Result<TemporalRecord, BitemporalError> {
        let now = self.clock.now();
        supersede::create(
            &mut self.store,
            &self.schema,
            entity_id,
            attributes,
            valid_start.unwrap_or(now),
            now,
        )
    }

    /// # Errors
    /// Propagates [`BitemporalError::Storage`].
    pub fn current(&self, selector: &Selector) -> Result<Vec<TemporalRecord>, BitemporalError> {
        query::currently_valid(&self.store, self.kind(), selector, self.clock.now())
    }

    /// # Errors
    /// Propagates [`BitemporalError::Storage`].
    pub fn as_of(
        &self,
        selector: &Selector,
        instant: OffsetDateTime,
    ) -> Result<Vec<TemporalRecord>, BitemporalError> {
        query::valid_as_of(&self.store, self.kind(), selector, instant)
    }

    /// # Errors
    /// Propagates [`BitemporalError::Storage`].
    pub fn as_of_knowledge(
        &self,
        selector: &Selector,
        valid_instant: OffsetDateTime,
        tx_instant: OffsetDateTime,
    ) -> Result<Vec<TemporalRecord>, BitemporalError> {
        query::valid_as_of_knowledge(&self.store, self.kind(), selector, valid_instant, tx_instant)
    }

    /// # Errors
    /// See [`query::history`].
    pub fn history(&self, selector: &Selector) -> Result<Vec<TemporalRecord>, BitemporalError> {
        query::history(&self.store, self.kind(), selector)
    }

    /// # Errors
    /// See [`supersede::supersede`].
    pub fn supersede(
        &mut self,
        selector: &Selector,
        overrides: Attributes,
        cutoff: Option<OffsetDateTime>,
    ) -> Result<TemporalRecord, BitemporalError> {
        let now = self.clock.now();
        supersede::supersede(&mut self.store, &self.schema, selector, overrides, cutoff, now)
    }

    /// # Errors
    /// See [`supersede::correct`].
    pub fn correct(
        &mut self,
        selector: &Selector,
        overrides: Attributes,
    ) -> Result<TemporalRecord, BitemporalError> {
        let now = self.clock.now();
        supersede::correct(&mut self.store, &self.schema, selector, overrides, now)
    }
}
