//! Condition evaluation against dynamic writer state.
//!
//! The validator guarantees every accepted condition has both a `left`
//! selector and a `cmp` relation; [`CompiledCondition`] encodes that
//! guarantee in the type so evaluation never has to re-check presence.

use crate::config::{CmpOp, Condition, ConditionLeft};
use crate::error::{Result, WriterError};

/// Snapshot of the writer state one emission decision is made against.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EvalContext {
    /// Index of the append just processed within the current episode.
    pub step_index: i64,
    /// Appends since the pattern under evaluation last emitted.
    pub steps_since_applied: i64,
    /// Minimum buffered length across the pattern's referenced columns.
    pub buffer_length: i64,
    /// Whether this is the end-of-episode evaluation batch.
    pub end_of_episode: bool,
}

/// A condition whose selector and relation are known to be present.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CompiledCondition {
    left: ConditionLeft,
    cmp: CmpOp,
}

impl CompiledCondition {
    pub fn compile(condition: &Condition) -> Result<Self> {
        match (condition.left, condition.cmp) {
            (Some(left), Some(cmp)) => Ok(Self { left, cmp }),
            (None, _) => Err(WriterError::InvalidArgument(
                "Conditions must specify a value for `left`.".to_string(),
            )),
            (_, None) => Err(WriterError::InvalidArgument(
                "Conditions must specify a value for `cmp`.".to_string(),
            )),
        }
    }

    /// Whether this condition pins its pattern to the end-of-episode batch.
    pub fn requires_end_of_episode(&self) -> bool {
        self.left == ConditionLeft::IsEndEpisode
    }

    pub fn holds(&self, ctx: &EvalContext) -> bool {
        let left = match self.left {
            ConditionLeft::StepIndex => ctx.step_index,
            ConditionLeft::StepsSinceApplied => ctx.steps_since_applied,
            ConditionLeft::BufferLength => ctx.buffer_length,
            ConditionLeft::IsEndEpisode => i64::from(ctx.end_of_episode),
        };
        match self.cmp {
            CmpOp::Eq(v) => left == v,
            CmpOp::Ne(v) => left != v,
            CmpOp::Ge(v) => left >= v,
            CmpOp::Le(v) => left <= v,
            CmpOp::Gt(v) => left > v,
            CmpOp::Lt(v) => left < v,
            CmpOp::ModEq { modulus, eq } => left % modulus == eq,
        }
    }
}
