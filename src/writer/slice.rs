//! Materializing trajectory columns from reference rings.
//!
//! A flat node names the cells it wants with negative `(start, stop, step)`
//! indices; this module resolves those indices against a column's ring and
//! packages the selected references into a [`TrajectoryColumn`].

use crate::config::FlatNode;
use crate::error::{Result, WriterError};
use crate::sink::{CellRef, TrajectoryColumn};
use crate::writer::ring::ReferenceRing;

/// Resolve `node` against `ring` into one trajectory column.
///
/// Selection semantics:
/// - `start` unset: the single element at index `stop`, squeezed.
/// - `start` set: `start, start + step, ...` strictly below `stop` (unset
///   `stop` is one past the newest), with a leading axis even when only one
///   element is selected.
///
/// Every selected reference is checked to be alive; the caller's
/// buffer-length gate makes a failure here a precondition violation.
pub(crate) fn materialize_column<T>(
    node: &FlatNode,
    ring: &ReferenceRing<T>,
) -> Result<TrajectoryColumn<T>> {
    let column = node.flat_source_index.unsigned_abs() as usize;
    let mut refs = Vec::new();

    match node.start {
        None => {
            let index = i64::from(node.stop.unwrap_or(-1));
            refs.push(select(ring, index, column)?);
        }
        Some(start) => {
            let stop = i64::from(node.stop.unwrap_or(0));
            let step = i64::from(node.step.unwrap_or(1));
            let mut index = i64::from(start);
            while index < stop {
                refs.push(select(ring, index, column)?);
                index += step;
            }
        }
    }

    Ok(TrajectoryColumn::new(refs, node.squeezed()))
}

fn select<T>(ring: &ReferenceRing<T>, index: i64, column: usize) -> Result<CellRef<T>> {
    let cell = ring
        .at(index)
        .ok_or(WriterError::StaleReference { column })?;
    if !cell.is_alive() {
        return Err(WriterError::StaleReference { column });
    }
    Ok(cell.clone())
}
