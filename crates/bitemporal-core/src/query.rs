//! Read-only bitemporal queries. None of them lock.

use std::collections::BTreeSet;

use time::OffsetDateTime;
use tracing::debug;

use crate::record::TemporalRecord;
use crate::selector::{RecordFilter, Selector, TxView};
use crate::store::VersionStore;
use crate::BitemporalError;

/// Versions valid at `now` under the current knowledge view.
///
/// # Errors
/// Propagates [`BitemporalError::Storage`] from the store.
pub fn currently_valid<S: VersionStore>(
    store: &S,
    kind: &str,
    selector: &Selector,
    now: OffsetDateTime,
) -> Result<Vec<TemporalRecord>, BitemporalError> {
    valid_as_of(store, kind, selector, now)
}

/// Versions whose valid interval contains `instant`, with `tx_end` open.
///
/// # Errors
/// Propagates [`BitemporalError::Storage`] from the store.
pub fn valid_as_of<S: VersionStore>(
    store: &S,
    kind: &str,
    selector: &Selector,
    instant: OffsetDateTime,
) -> Result<Vec<TemporalRecord>, BitemporalError> {
    let filter = RecordFilter::new(kind, selector.clone()).valid_at(instant);
    run(store, &filter)
}

/// Full bitemporal query: what was believed at `tx_instant` to be true at
/// `valid_instant`.
///
/// # Errors
/// Propagates [`BitemporalError::Storage`] from the store.
pub fn valid_as_of_knowledge<S: VersionStore>(
    store: &S,
    kind: &str,
    selector: &Selector,
    valid_instant: OffsetDateTime,
    tx_instant: OffsetDateTime,
) -> Result<Vec<TemporalRecord>, BitemporalError> {
    let filter = RecordFilter::new(kind, selector.clone())
        .valid_at(valid_instant)
        .tx_view(TxView::AsOf(tx_instant));
    run(store, &filter)
}

/// Every version ever recorded for the selected logical entity, ordered by
/// `tx_start`. The result is a snapshot taken at call time.
///
/// # Errors
/// Returns [`BitemporalError::AmbiguousSelector`] when an attribute selector
/// spans several entities, or propagates [`BitemporalError::Storage`].
pub fn history<S: VersionStore>(
    store: &S,
    kind: &str,
    selector: &Selector,
) -> Result<Vec<TemporalRecord>, BitemporalError> {
    let matched = run(store, &RecordFilter::new(kind, selector.clone()).tx_view(TxView::All))?;

    if matches!(selector, Selector::Entity(_)) {
        return Ok(matched);
    }

    let mut entities = matched.iter().map(|record| record.entity_id).collect::<BTreeSet<_>>();
    if entities.len() > 1 {
        return Err(BitemporalError::AmbiguousSelector {
            selector: selector.clone(),
            matches: entities.len(),
        });
    }
    let Some(entity_id) = entities.pop_first() else {
        return Ok(Vec::new());
    };
    run(store, &RecordFilter::new(kind, Selector::Entity(entity_id)).tx_view(TxView::All))
}

fn run<S: VersionStore>(
    store: &S,
    filter: &RecordFilter,
) -> Result<Vec<TemporalRecord>, BitemporalError> {
    let records = store.select(filter)?;
    debug!(
        kind = %filter.kind,
        selector = %filter.selector,
        valid_at = ?filter.valid_at,
        tx_view = ?filter.tx_view,
        matched = records.len(),
        "bitemporal query"
    );
    Ok(records)
}
