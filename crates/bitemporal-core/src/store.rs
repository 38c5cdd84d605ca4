//! The storage collaborator consumed by the query and supersede engines.

use time::OffsetDateTime;

use crate::record::TemporalRecord;
use crate::selector::RecordFilter;
use crate::{BitemporalError, EntityId, VersionId};

/// Read access plus an atomic write scope over persisted versions.
pub trait VersionStore {
    /// Every stored version of `filter.kind` satisfying [`RecordFilter::matches`],
    /// ordered by `tx_start` then `version_id`.
    ///
    /// # Errors
    /// Returns [`BitemporalError::Storage`] when the backing store fails.
    fn select(&self, filter: &RecordFilter) -> Result<Vec<TemporalRecord>, BitemporalError>;

    /// Run `operation` as one all-or-nothing unit. Writes made through the
    /// transaction are committed only when `operation` returns `Ok`.
    ///
    /// # Errors
    /// Returns the operation's own error after rolling back, or
    /// [`BitemporalError::Storage`] when begin or commit fails.
    fn atomically<T, F>(&mut self, operation: F) -> Result<T, BitemporalError>
    where
        F: FnOnce(&mut dyn WriteTransaction) -> Result<T, BitemporalError>;
}

/// Writes available inside [`VersionStore::atomically`].
///
/// Locks taken here are held until the enclosing unit commits or rolls back.
/// Taking one may block until a competing unit on the same entity finishes.
pub trait WriteTransaction {
    /// Lock one logical entity and return every version it has, as committed
    /// by the time the lock was granted.
    ///
    /// # Errors
    /// Returns [`BitemporalError::Storage`] when the lock or read fails.
    fn lock_entity(
        &mut self,
        kind: &str,
        entity_id: EntityId,
    ) -> Result<Vec<TemporalRecord>, BitemporalError>;

    /// Set `valid_end = at` on a version whose `valid_end` is still open.
    /// Returns `false` when no such open version exists.
    ///
    /// # Errors
    /// Returns [`BitemporalError::Storage`] when the update fails.
    fn close_valid_time(
        &mut self,
        kind: &str,
        version_id: VersionId,
        at: OffsetDateTime,
    ) -> Result<bool, BitemporalError>;

    /// Set `tx_end = at` on a version whose `tx_end` is still open.
    /// Returns `false` when no such open version exists.
    ///
    /// # Errors
    /// Returns [`BitemporalError::Storage`] when the update fails.
    fn close_transaction_time(
        &mut self,
        kind: &str,
        version_id: VersionId,
        at: OffsetDateTime,
    ) -> Result<bool, BitemporalError>;

    /// # Errors
    /// Returns [`BitemporalError::Storage`] when the insert fails, including
    /// a duplicate `version_id`.
    fn insert(&mut self, kind: &str, record: &TemporalRecord) -> Result<(), BitemporalError>;
}
