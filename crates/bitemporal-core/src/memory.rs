//! In-process [`VersionStore`] with per-entity pessimistic locks.
//!
//! Clones share the same rows, so one store can be handed to many threads.
//! Writes are staged on the transaction and applied only at commit.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};

use time::OffsetDateTime;

use crate::record::TemporalRecord;
use crate::selector::{sort_by_recording, RecordFilter};
use crate::store::{VersionStore, WriteTransaction};
use crate::{utc, BitemporalError, EntityId, StorageFailure, VersionId};

type LockKey = (String, EntityId);

#[derive(Debug, Clone)]
struct StoredRow {
    kind: String,
    record: TemporalRecord,
}

#[derive(Debug, Default)]
struct Shared {
    rows: RwLock<Vec<StoredRow>>,
    locked: Mutex<HashSet<LockKey>>,
    released: Condvar,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored versions across every kind.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.rows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl VersionStore for MemoryStore {
    fn select(&self, filter: &RecordFilter) -> Result<Vec<TemporalRecord>, BitemporalError> {
        let rows = self.shared.rows.read().unwrap_or_else(PoisonError::into_inner);
        let mut records = rows
            .iter()
            .filter(|row| row.kind == filter.kind && filter.matches(&row.record))
            .map(|row| row.record.clone())
            .collect::<Vec<_>>();
        drop(rows);

        sort_by_recording(&mut records);
        Ok(records)
    }

    fn atomically<T, F>(&mut self, operation: F) -> Result<T, BitemporalError>
    where
        F: FnOnce(&mut dyn WriteTransaction) -> Result<T, BitemporalError>,
    {
        let mut tx = MemoryTransaction { shared: &self.shared, held: Vec::new(), staged: Vec::new() };
        let value = operation(&mut tx)?;
        tx.commit();
        Ok(value)
    }
}

struct MemoryTransaction<'a> {
    shared: &'a Shared,
    held: Vec<LockKey>,
    staged: Vec<StoredRow>,
}

impl MemoryTransaction<'_> {
    /// Lock `entities` in addition to those already held. A unit never waits
    /// while holding a lock: anything held is given back and the whole set is
    /// taken in one step once none of it is locked elsewhere.
    fn acquire(&mut self, kind: &str, entities: &BTreeSet<EntityId>) {
        let wanted = entities
            .iter()
            .map(|entity_id| (kind.to_string(), *entity_id))
            .filter(|key| !self.held.contains(key))
            .collect::<Vec<_>>();
        if wanted.is_empty() {
            return;
        }

        let mut locked = self.shared.locked.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.held.is_empty() {
            for key in &self.held {
                locked.remove(key);
            }
            self.shared.released.notify_all();
        }

        let mut all = std::mem::take(&mut self.held);
        all.extend(wanted);
        while all.iter().any(|key| locked.contains(key)) {
            locked = self.shared.released.wait(locked).unwrap_or_else(PoisonError::into_inner);
        }
        for key in &all {
            locked.insert(key.clone());
        }
        self.held = all;
    }

    /// Committed rows of `kind` with this transaction's staged writes applied.
    fn view(&self, kind: &str) -> Vec<TemporalRecord> {
        let rows = self.shared.rows.read().unwrap_or_else(PoisonError::into_inner);
        let mut view = rows
            .iter()
            .filter(|row| row.kind == kind)
            .map(|row| row.record.clone())
            .collect::<Vec<_>>();
        drop(rows);

        for row in self.staged.iter().filter(|row| row.kind == kind) {
            match view.iter_mut().find(|record| record.version_id == row.record.version_id) {
                Some(slot) => *slot = row.record.clone(),
                None => view.push(row.record.clone()),
            }
        }
        view
    }

    fn stage(&mut self, kind: &str, record: TemporalRecord) {
        match self
            .staged
            .iter_mut()
            .find(|row| row.kind == kind && row.record.version_id == record.version_id)
        {
            Some(row) => row.record = record,
            None => self.staged.push(StoredRow { kind: kind.to_string(), record }),
        }
    }

    fn version_exists(&self, version_id: VersionId) -> bool {
        let rows = self.shared.rows.read().unwrap_or_else(PoisonError::into_inner);
        rows.iter().any(|row| row.record.version_id == version_id)
            || self.staged.iter().any(|row| row.record.version_id == version_id)
    }

    fn commit(mut self) {
        let mut rows = self.shared.rows.write().unwrap_or_else(PoisonError::into_inner);
        for staged in std::mem::take(&mut self.staged) {
            match rows.iter_mut().find(|row| {
                row.kind == staged.kind && row.record.version_id == staged.record.version_id
            }) {
                Some(row) => *row = staged,
                None => rows.push(staged),
            }
        }
    }
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let mut locked = self.shared.locked.lock().unwrap_or_else(PoisonError::into_inner);
        for key in self.held.drain(..) {
            locked.remove(&key);
        }
        drop(locked);
        self.shared.released.notify_all();
    }
}

fn constraint(message: String) -> BitemporalError {
    BitemporalError::Storage(StorageFailure::new("memory store constraint violated", message))
}

impl WriteTransaction for MemoryTransaction<'_> {
    fn lock_entity(
        &mut self,
        kind: &str,
        entity_id: EntityId,
    ) -> Result<Vec<TemporalRecord>, BitemporalError> {
        self.acquire(kind, &BTreeSet::from([entity_id]));
        let mut versions = self
            .view(kind)
            .into_iter()
            .filter(|record| record.entity_id == entity_id)
            .collect::<Vec<_>>();
        sort_by_recording(&mut versions);
        Ok(versions)
    }

    fn close_valid_time(
        &mut self,
        kind: &str,
        version_id: VersionId,
        at: OffsetDateTime,
    ) -> Result<bool, BitemporalError> {
        let Some(mut record) = self
            .view(kind)
            .into_iter()
            .find(|record| record.version_id == version_id && record.valid_end.is_none())
        else {
            return Ok(false);
        };
        if at <= record.valid_start {
            return Err(constraint(format!("valid_end {at} must follow valid_start {}", record.valid_start)));
        }

        record.valid_end = Some(utc(at));
        self.stage(kind, record);
        Ok(true)
    }

    fn close_transaction_time(
        &mut self,
        kind: &str,
        version_id: VersionId,
        at: OffsetDateTime,
    ) -> Result<bool, BitemporalError> {
        let Some(mut record) = self
            .view(kind)
            .into_iter()
            .find(|record| record.version_id == version_id && record.tx_end.is_none())
        else {
            return Ok(false);
        };
        if at <= record.tx_start {
            return Err(constraint(format!("tx_end {at} must follow tx_start {}", record.tx_start)));
        }

        record.tx_end = Some(utc(at));
        self.stage(kind, record);
        Ok(true)
    }

    fn insert(&mut self, kind: &str, record: &TemporalRecord) -> Result<(), BitemporalError> {
        if kind.is_empty() {
            return Err(constraint("entity kind must be non-empty".to_string()));
        }
        if self.version_exists(record.version_id) {
            return Err(constraint(format!("duplicate version_id {}", record.version_id)));
        }
        if record.is_head()
            && self
                .view(kind)
                .iter()
                .any(|existing| existing.entity_id == record.entity_id && existing.is_head())
        {
            return Err(constraint(format!("entity {} already has a head version", record.entity_id)));
        }

        self.stage(kind, record.clone());
        Ok(())
    }
}
