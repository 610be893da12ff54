//! The structured writer: pattern dispatch over a column-writer sink.
//!
//! [`StructuredWriter`] drives the full emission loop by repeatedly:
//!   1. forwarding each appended step to the sink and buffering the returned
//!      cell references per source column,
//!   2. asking every pattern's condition set whether it holds for this step,
//!   3. materializing the flat nodes of firing patterns into trajectory
//!      columns and handing them to the sink as one item.
//!
//! Items are produced strictly in append order and, within one append, in
//! pattern declaration order. The writer holds no locks and spawns no tasks;
//! the only blocking points are the sink calls themselves.

use std::time::Duration;

use crate::config::{validate_config, StructuredWriterConfig};
use crate::error::Result;
use crate::sink::ColumnWriter;
use crate::writer::conditions::{CompiledCondition, EvalContext};
use crate::writer::ring::ReferenceRing;
use crate::writer::slice::materialize_column;

// ---------------------------------------------------------------------------
// Pattern state
// ---------------------------------------------------------------------------

/// One validated pattern plus its per-episode dispatch state.
#[derive(Debug)]
struct PatternState {
    config: StructuredWriterConfig,
    conditions: Vec<CompiledCondition>,
    /// Distinct source columns the pattern references, ascending.
    columns: Vec<usize>,
    /// Appends in the current episode since this pattern last emitted.
    steps_since_applied: i64,
}

impl PatternState {
    fn new(config: StructuredWriterConfig) -> Result<Self> {
        validate_config(&config)?;
        let conditions = config
            .conditions
            .iter()
            .map(CompiledCondition::compile)
            .collect::<Result<Vec<_>>>()?;

        let mut columns: Vec<usize> = config
            .flat
            .iter()
            .map(|node| node.flat_source_index.unsigned_abs() as usize)
            .collect();
        columns.sort_unstable();
        columns.dedup();

        Ok(Self {
            config,
            conditions,
            columns,
            steps_since_applied: 0,
        })
    }

    fn fires_at_end_of_episode(&self) -> bool {
        self.conditions
            .iter()
            .any(CompiledCondition::requires_end_of_episode)
    }
}

// ---------------------------------------------------------------------------
// Structured writer
// ---------------------------------------------------------------------------

/// Turns appended steps into trajectory items according to a fixed list of
/// validated patterns.
///
/// Patterns carrying an `is_end_episode` condition are evaluated only during
/// [`StructuredWriter::end_episode`]; all others are evaluated on every
/// completed [`StructuredWriter::append`].
#[derive(Debug)]
pub struct StructuredWriter<W: ColumnWriter> {
    sink: W,
    step_patterns: Vec<PatternState>,
    episode_end_patterns: Vec<PatternState>,
    rings: Vec<ReferenceRing<W::Data>>,
    /// Retention depth per column, from the deepest reach of any pattern.
    histories: Vec<usize>,
    /// Columns already written by `append_partial` for the step in assembly.
    pending_columns: Vec<bool>,
    episode_id: u64,
    /// Appends completed in the current episode.
    episode_steps: i64,
}

impl<W: ColumnWriter> StructuredWriter<W> {
    /// Validate `configs` and build a writer dispatching to `sink`.
    ///
    /// Rejects with the validator's diagnostic on the first invalid config;
    /// a rejected writer never touches the sink.
    pub fn new(sink: W, configs: Vec<StructuredWriterConfig>) -> Result<Self> {
        let mut histories: Vec<usize> = Vec::new();
        let mut step_patterns = Vec::new();
        let mut episode_end_patterns = Vec::new();

        for config in configs {
            let state = PatternState::new(config)?;
            for node in &state.config.flat {
                let column = node.flat_source_index.unsigned_abs() as usize;
                if histories.len() <= column {
                    histories.resize(column + 1, 0);
                }
                histories[column] = histories[column].max(node.history_depth());
            }
            if state.fires_at_end_of_episode() {
                episode_end_patterns.push(state);
            } else {
                step_patterns.push(state);
            }
        }

        Ok(Self {
            sink,
            step_patterns,
            episode_end_patterns,
            rings: Vec::new(),
            histories,
            pending_columns: Vec::new(),
            episode_id: 0,
            episode_steps: 0,
        })
    }

    /// The episode counter, incremented by every [`StructuredWriter::end_episode`].
    pub fn episode_id(&self) -> u64 {
        self.episode_id
    }

    /// Read access to the sink, e.g. to inspect a recording fake in tests.
    pub fn sink(&self) -> &W {
        &self.sink
    }

    /// Consume the writer, returning the sink.
    pub fn into_sink(self) -> W {
        self.sink
    }

    /// Append a completed step and evaluate every per-step pattern.
    ///
    /// `step` holds one optional slot per source column; empty slots are
    /// invisible to the buffers. A pattern is only considered when this step
    /// (including any preceding `append_partial` calls) supplied a value for
    /// every column it references.
    pub fn append(&mut self, step: Vec<Option<W::Data>>) -> Result<()> {
        let provided = self.push_step(step, true)?;

        self.episode_steps += 1;
        for state in self
            .step_patterns
            .iter_mut()
            .chain(self.episode_end_patterns.iter_mut())
        {
            state.steps_since_applied += 1;
        }

        for i in 0..self.step_patterns.len() {
            let state = &self.step_patterns[i];
            if !state
                .columns
                .iter()
                .all(|&column| provided.get(column).copied().unwrap_or(false))
            {
                continue;
            }

            let ctx = EvalContext {
                step_index: self.episode_steps - 1,
                steps_since_applied: state.steps_since_applied,
                buffer_length: buffer_length(&self.rings, &state.columns),
                end_of_episode: false,
            };
            if state.conditions.iter().all(|c| c.holds(&ctx)) {
                apply_pattern(&mut self.sink, &self.rings, &mut self.step_patterns[i])?;
            }
        }

        Ok(())
    }

    /// Push part of the step currently in assembly without completing it.
    ///
    /// Buffers the returned references and remembers which columns were
    /// provided, but advances no counters and evaluates no patterns; the
    /// completing [`StructuredWriter::append`] sees the union of presence.
    pub fn append_partial(&mut self, step: Vec<Option<W::Data>>) -> Result<()> {
        self.push_step(step, false)?;
        Ok(())
    }

    /// Run the end-of-episode evaluation batch, forward to the sink, and
    /// reset per-episode state.
    ///
    /// Only patterns carrying an `is_end_episode` condition are evaluated
    /// here, with no new data and no counter advancement. With
    /// `clear_buffers` every ring is emptied and every pattern's
    /// `steps_since_applied` is reset; without it the buffered references
    /// survive into the next episode.
    pub fn end_episode(&mut self, clear_buffers: bool, timeout: Option<Duration>) -> Result<()> {
        for i in 0..self.episode_end_patterns.len() {
            let state = &self.episode_end_patterns[i];
            let ctx = EvalContext {
                step_index: self.episode_steps - 1,
                steps_since_applied: state.steps_since_applied,
                buffer_length: buffer_length(&self.rings, &state.columns),
                end_of_episode: true,
            };
            if state.conditions.iter().all(|c| c.holds(&ctx)) {
                apply_pattern(
                    &mut self.sink,
                    &self.rings,
                    &mut self.episode_end_patterns[i],
                )?;
            }
        }

        self.sink.end_episode(clear_buffers, timeout)?;
        tracing::debug!(
            episode_id = self.episode_id,
            steps = self.episode_steps,
            clear_buffers,
            "episode ended"
        );

        if clear_buffers {
            for ring in &mut self.rings {
                ring.clear();
            }
            for state in self
                .step_patterns
                .iter_mut()
                .chain(self.episode_end_patterns.iter_mut())
            {
                state.steps_since_applied = 0;
            }
        }
        self.episode_id += 1;
        self.episode_steps = 0;
        // A half-assembled step does not survive the episode boundary.
        self.pending_columns.iter_mut().for_each(|p| *p = false);

        Ok(())
    }

    /// Forward a flush to the sink unchanged.
    pub fn flush(&mut self, ignore_last_num_items: usize, timeout: Option<Duration>) -> Result<()> {
        self.sink.flush(ignore_last_num_items, timeout)?;
        Ok(())
    }

    /// Forward `step` to the sink and buffer the returned references.
    ///
    /// Returns the per-column presence of the completed step, or an empty
    /// vector for a partial push. A sink error leaves the rings untouched.
    fn push_step(&mut self, step: Vec<Option<W::Data>>, complete: bool) -> Result<Vec<bool>> {
        let refs = if complete {
            self.sink.append(step)?
        } else {
            self.sink.append_partial(step)?
        };

        for column in self.rings.len()..refs.len() {
            let history = self.histories.get(column).copied().unwrap_or(0);
            self.rings.push(ReferenceRing::with_history(history));
        }
        if self.pending_columns.len() < refs.len() {
            self.pending_columns.resize(refs.len(), false);
        }

        for (column, cell) in refs.into_iter().enumerate() {
            if let Some(cell) = cell {
                self.rings[column].push(cell);
                self.pending_columns[column] = true;
            }
        }

        if !complete {
            return Ok(Vec::new());
        }
        let provided = self.pending_columns.clone();
        self.pending_columns.iter_mut().for_each(|p| *p = false);
        Ok(provided)
    }
}

/// Minimum logical ring length across `columns`; 0 for never-written columns.
fn buffer_length<T>(rings: &[ReferenceRing<T>], columns: &[usize]) -> i64 {
    columns
        .iter()
        .map(|&column| rings.get(column).map_or(0, ReferenceRing::len))
        .min()
        .unwrap_or(0) as i64
}

/// Materialize every flat node of `state` and hand the item to the sink.
fn apply_pattern<W: ColumnWriter>(
    sink: &mut W,
    rings: &[ReferenceRing<W::Data>],
    state: &mut PatternState,
) -> Result<()> {
    let mut trajectory = Vec::with_capacity(state.config.flat.len());
    for node in &state.config.flat {
        let ring = &rings[node.flat_source_index.unsigned_abs() as usize];
        trajectory.push(materialize_column(node, ring)?);
    }

    tracing::debug!(
        table = %state.config.table,
        priority = state.config.priority,
        columns = trajectory.len(),
        "creating trajectory item"
    );
    sink.create_item(&state.config.table, state.config.priority, trajectory)?;
    state.steps_since_applied = 0;
    Ok(())
}
