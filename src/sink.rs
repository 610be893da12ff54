//! The column-writer sink contract and the reference types exchanged with it.
//!
//! The structured writer never owns or inspects appended data. The sink hands
//! back a weak [`CellRef`] for every value it stores, the writer buffers those
//! references, and finished items travel back to the sink as
//! [`TrajectoryColumn`]s of references plus a squeezed flag. The sink performs
//! the final dereference and assembly.
//!
//! The [`ColumnWriter`] trait is the minimal interface the writer relies on,
//! which also makes it easy to supply recording fakes in tests.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Cell references
// ---------------------------------------------------------------------------

/// Weak handle naming one previously appended datum.
///
/// Created by the sink on append, buffered by the writer, and dereferenced
/// again by the sink when an item is assembled. Holding a `CellRef` does not
/// extend the lifetime of the underlying cell; [`CellRef::upgrade`] fails once
/// the sink has reclaimed it.
pub struct CellRef<T> {
    cell: Weak<T>,
}

impl<T> CellRef<T> {
    /// Create a weak handle to `cell`.
    pub fn new(cell: &Arc<T>) -> Self {
        Self {
            cell: Arc::downgrade(cell),
        }
    }

    /// Dereference the handle, returning `None` if the cell was reclaimed.
    pub fn upgrade(&self) -> Option<Arc<T>> {
        self.cell.upgrade()
    }

    /// Whether the underlying cell is still retained by the sink.
    pub fn is_alive(&self) -> bool {
        self.cell.strong_count() > 0
    }
}

impl<T> Clone for CellRef<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Weak::clone(&self.cell),
        }
    }
}

impl<T> fmt::Debug for CellRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellRef")
            .field("alive", &self.is_alive())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Trajectory columns
// ---------------------------------------------------------------------------

/// One column of a finished trajectory item: an ordered list of cell
/// references plus the squeezed flag.
///
/// A squeezed column holds exactly one reference and represents the
/// underlying datum unchanged; an unsqueezed column represents its references
/// stacked along a new leading axis, even when there is only one.
#[derive(Debug)]
pub struct TrajectoryColumn<T> {
    refs: Vec<CellRef<T>>,
    squeezed: bool,
}

impl<T> TrajectoryColumn<T> {
    pub fn new(refs: Vec<CellRef<T>>, squeezed: bool) -> Self {
        Self { refs, squeezed }
    }

    pub fn refs(&self) -> &[CellRef<T>] {
        &self.refs
    }

    pub fn squeezed(&self) -> bool {
        self.squeezed
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Upgrade every reference in the column, in order.
    ///
    /// Returns `None` if any cell has been reclaimed. Sinks call this while
    /// assembling an item to pin the cells for the duration of the write.
    pub fn lock(&self) -> Option<Vec<Arc<T>>> {
        self.refs.iter().map(CellRef::upgrade).collect()
    }
}

// ---------------------------------------------------------------------------
// Column writer
// ---------------------------------------------------------------------------

/// The downstream sink the structured writer dispatches to.
///
/// Implementations own cell storage, retention, and transport. Every method
/// may block the caller; the writer itself never retries, so errors returned
/// here reach the producer unchanged.
pub trait ColumnWriter {
    /// The per-cell datum type. The writer treats it as fully opaque.
    type Data;

    /// Push a whole step of optional values, one slot per column, and return
    /// a parallel list of weak references. Advances the sink's step counter.
    fn append(
        &mut self,
        step: Vec<Option<Self::Data>>,
    ) -> anyhow::Result<Vec<Option<CellRef<Self::Data>>>>;

    /// Like [`ColumnWriter::append`] but without advancing the sink's step
    /// counter; used when multiple calls assemble one logical step.
    fn append_partial(
        &mut self,
        step: Vec<Option<Self::Data>>,
    ) -> anyhow::Result<Vec<Option<CellRef<Self::Data>>>>;

    /// Enqueue one item for `table` with `priority`.
    fn create_item(
        &mut self,
        table: &str,
        priority: f64,
        trajectory: Vec<TrajectoryColumn<Self::Data>>,
    ) -> anyhow::Result<()>;

    /// Terminate the current episode, optionally dropping unreferenced
    /// buffered data. `None` means wait without bound.
    fn end_episode(&mut self, clear_buffers: bool, timeout: Option<Duration>) -> anyhow::Result<()>;

    /// Block until the number of unconfirmed sent items is within the
    /// sink's inflight cap.
    fn flush(&mut self, ignore_last_num_items: usize, timeout: Option<Duration>)
        -> anyhow::Result<()>;
}
