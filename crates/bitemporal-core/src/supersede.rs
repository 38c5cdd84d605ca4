//! The write protocol: create, supersede and correct.
//!
//! The selector is resolved to one concrete version before the write starts.
//! Inside one [`VersionStore::atomically`] unit that version's entity is then
//! locked and the version re-read, so two writers racing on one entity
//! serialize and the loser finds the version it resolved already closed.

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::record::{Attributes, TemporalRecord};
use crate::schema::EntitySchema;
use crate::selector::{RecordFilter, Selector, TxView};
use crate::store::{VersionStore, WriteTransaction};
use crate::{unix_nanos, utc, BitemporalError, EntityId};

/// Insert the first version of a new logical entity.
///
/// # Errors
/// Returns [`BitemporalError::Validation`] for attributes the schema rejects,
/// [`BitemporalError::EntityExists`] when the entity already has versions,
/// or [`BitemporalError::Storage`].
pub fn create<S: VersionStore>(
    store: &mut S,
    schema: &EntitySchema,
    entity_id: EntityId,
    attributes: Attributes,
    valid_start: OffsetDateTime,
    now: OffsetDateTime,
) -> Result<TemporalRecord, BitemporalError> {
    schema.validate_attributes(&attributes)?;
    let record = TemporalRecord::first_version(entity_id, valid_start, now, attributes);
    record.validate()?;

    let kind = schema.kind.as_str();
    let outcome = store.atomically(|tx| {
        if !tx.lock_entity(kind, entity_id)?.is_empty() {
            return Err(BitemporalError::EntityExists(entity_id));
        }
        tx.insert(kind, &record)?;
        Ok(record)
    });

    report(kind, "create", outcome)
}

/// Close the selected version's valid time at `cutoff` and open a successor
/// carrying its attributes plus `overrides`.
///
/// A `cutoff` equal to the version's `valid_start` would leave it an empty
/// factual window, so the version is supplanted as in [`correct`] instead.
///
/// # Errors
/// Returns [`BitemporalError::NoCurrentVersion`],
/// [`BitemporalError::AmbiguousSelector`],
/// [`BitemporalError::AlreadySuperseded`],
/// [`BitemporalError::AlreadySupplanted`],
/// [`BitemporalError::InvalidCutoff`], [`BitemporalError::Validation`] or
/// [`BitemporalError::Storage`]. None of them leave partial state behind.
pub fn supersede<S: VersionStore>(
    store: &mut S,
    schema: &EntitySchema,
    selector: &Selector,
    overrides: Attributes,
    cutoff: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> Result<TemporalRecord, BitemporalError> {
    schema.validate_overrides(&overrides)?;
    let cutoff = utc(cutoff.unwrap_or(now));
    unix_nanos(cutoff)?;

    let kind = schema.kind.as_str();
    let outcome = locked_write(store, kind, selector, |tx, current| {
        if cutoff < current.valid_start {
            return Err(BitemporalError::InvalidCutoff { cutoff, record: Box::new(current) });
        }

        let successor = current
            .successor()
            .overrides(overrides)
            .valid_from(cutoff)
            .recorded_at(now)
            .build();
        schema.validate_attributes(&successor.attributes)?;
        successor.validate()?;

        if cutoff == current.valid_start {
            debug!(version_id = %current.version_id, "cutoff equals valid_start; supplanting");
            if !tx.close_transaction_time(kind, current.version_id, successor.tx_start)? {
                return Err(BitemporalError::AlreadySupplanted(Box::new(current)));
            }
        } else if !tx.close_valid_time(kind, current.version_id, cutoff)? {
            return Err(BitemporalError::AlreadySuperseded(Box::new(current)));
        }

        tx.insert(kind, &successor)?;
        Ok(successor)
    });

    report(kind, "supersede", outcome)
}

/// Supplant the selected version: close its `tx_end` and record a successor
/// over the same valid window. Valid time is left untouched.
///
/// # Errors
/// Same as [`supersede`] apart from [`BitemporalError::InvalidCutoff`].
pub fn correct<S: VersionStore>(
    store: &mut S,
    schema: &EntitySchema,
    selector: &Selector,
    overrides: Attributes,
    now: OffsetDateTime,
) -> Result<TemporalRecord, BitemporalError> {
    schema.validate_overrides(&overrides)?;

    let kind = schema.kind.as_str();
    let outcome = locked_write(store, kind, selector, |tx, current| {
        let successor = current.successor().overrides(overrides).recorded_at(now).build();
        schema.validate_attributes(&successor.attributes)?;
        successor.validate()?;

        if !tx.close_transaction_time(kind, current.version_id, successor.tx_start)? {
            return Err(BitemporalError::AlreadySupplanted(Box::new(current)));
        }
        tx.insert(kind, &successor)?;
        Ok(successor)
    });

    report(kind, "correct", outcome)
}

/// Resolve `selector` to one version, then within one atomic unit lock its
/// entity and hand `write` that version as re-read under the lock.
fn locked_write<S, F>(
    store: &mut S,
    kind: &str,
    selector: &Selector,
    write: F,
) -> Result<TemporalRecord, BitemporalError>
where
    S: VersionStore,
    F: FnOnce(&mut dyn WriteTransaction, TemporalRecord) -> Result<TemporalRecord, BitemporalError>,
{
    let target = resolve_target(store, kind, selector)?;
    store.atomically(|tx| {
        let current = lock_open_version(tx, kind, selector, &target)?;
        write(tx, current)
    })
}

/// The one version `selector` addresses for a write, read without locking.
fn resolve_target<S: VersionStore>(
    store: &S,
    kind: &str,
    selector: &Selector,
) -> Result<TemporalRecord, BitemporalError> {
    let filter = RecordFilter::new(kind, selector.clone()).tx_view(TxView::All);
    let mut targets = store
        .select(&filter)?
        .into_iter()
        .filter(|record| selector.targets_for_write(record))
        .collect::<Vec<_>>();
    if targets.len() > 1 {
        return Err(BitemporalError::AmbiguousSelector {
            selector: selector.clone(),
            matches: targets.len(),
        });
    }
    targets.pop().ok_or_else(|| BitemporalError::NoCurrentVersion(selector.clone()))
}

/// Lock the entity of `target`, re-read `target` and confirm both of its ends
/// are still open.
fn lock_open_version(
    tx: &mut dyn WriteTransaction,
    kind: &str,
    selector: &Selector,
    target: &TemporalRecord,
) -> Result<TemporalRecord, BitemporalError> {
    let Some(current) = tx
        .lock_entity(kind, target.entity_id)?
        .into_iter()
        .find(|record| record.version_id == target.version_id)
    else {
        return Err(BitemporalError::NoCurrentVersion(selector.clone()));
    };

    if current.valid_end.is_some() {
        return Err(BitemporalError::AlreadySuperseded(Box::new(current)));
    }
    if current.tx_end.is_some() {
        return Err(BitemporalError::AlreadySupplanted(Box::new(current)));
    }
    Ok(current)
}

fn report(
    kind: &str,
    operation: &'static str,
    outcome: Result<TemporalRecord, BitemporalError>,
) -> Result<TemporalRecord, BitemporalError> {
    match &outcome {
        Ok(record) => info!(
            kind,
            operation,
            entity_id = %record.entity_id,
            version_id = %record.version_id,
            "bitemporal write committed"
        ),
        Err(err) if err.is_conflict() => warn!(kind, operation, error = %err, "bitemporal write rejected"),
        Err(err) => debug!(kind, operation, error = %err, "bitemporal write failed"),
    }
    outcome
}
