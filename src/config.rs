//! Pattern configuration for the structured writer.
//!
//! A [`StructuredWriterConfig`] is a full trajectory recipe: an ordered list
//! of [`FlatNode`]s describing the output columns, a set of [`Condition`]s
//! deciding when an item is created, and the destination table/priority the
//! sink receives opaquely.
//!
//! [`validate_config`] is a pure function that rejects malformed configs
//! before any data flows. Its diagnostics are stable; callers (and the tests
//! below) match on their content.

use serde::{Deserialize, Serialize};

use crate::error::{Result, WriterError};

// ---------------------------------------------------------------------------
// Flat nodes
// ---------------------------------------------------------------------------

/// One column of an output trajectory.
///
/// The node selects cells from the source column `flat_source_index` using
/// negative indices relative to the newest appended value:
///
/// - `start` unset: the single element at index `stop` (the column is
///   *squeezed*, i.e. emitted without an added leading axis).
/// - `start` set: the elements `start, start + step, ...` strictly below
///   `stop` (unset `stop` means one past the newest, so the newest value is
///   included).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlatNode {
    /// The source column this node reads from.
    pub flat_source_index: i32,
    /// Oldest selected index (negative). Unset selects a single element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<i32>,
    /// One past the newest selected index when `start` is set; the selected
    /// index itself otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<i32>,
    /// Stride between selected indices. Only valid together with `start`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<i32>,
}

impl FlatNode {
    /// Whether the node emits a single dereferenced value with no added
    /// leading axis.
    pub fn squeezed(&self) -> bool {
        self.start.is_none()
    }

    /// Deepest negative index the node can reach, as a buffer depth.
    pub(crate) fn history_depth(&self) -> usize {
        self.start
            .unwrap_or(0)
            .min(self.stop.unwrap_or(0))
            .unsigned_abs() as usize
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// The writer-state quantity a condition compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionLeft {
    /// Index of the append just processed within the current episode.
    StepIndex,
    /// Appends in the current episode since this pattern last emitted.
    StepsSinceApplied,
    /// Minimum buffered length across the columns the pattern references.
    BufferLength,
    /// 1 during the end-of-episode evaluation batch, 0 otherwise.
    IsEndEpisode,
}

/// The comparison applied to the selected quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq(i64),
    Ne(i64),
    Ge(i64),
    Le(i64),
    Gt(i64),
    Lt(i64),
    /// `left mod modulus == eq`.
    ModEq {
        #[serde(rename = "mod")]
        modulus: i64,
        eq: i64,
    },
}

/// A single predicate over dynamic writer state.
///
/// Both fields are optional so that partially specified configs can be
/// represented and rejected with a precise diagnostic; after validation both
/// are always present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<ConditionLeft>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmp: Option<CmpOp>,
}

impl Condition {
    pub fn new(left: ConditionLeft, cmp: CmpOp) -> Self {
        Self {
            left: Some(left),
            cmp: Some(cmp),
        }
    }

    /// The gate every config must carry: at least `length` values buffered in
    /// every referenced column.
    pub fn buffer_length_ge(length: i64) -> Self {
        Self::new(ConditionLeft::BufferLength, CmpOp::Ge(length))
    }

    /// Restrict a pattern to the end-of-episode evaluation batch.
    pub fn end_of_episode() -> Self {
        Self::new(ConditionLeft::IsEndEpisode, CmpOp::Eq(1))
    }
}

// ---------------------------------------------------------------------------
// Writer config
// ---------------------------------------------------------------------------

/// A full trajectory recipe: output columns, emission conditions, and the
/// destination forwarded opaquely to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredWriterConfig {
    /// Ordered, non-empty list of output columns.
    pub flat: Vec<FlatNode>,
    /// Predicates combined by logical AND. Must include a `buffer_length`
    /// condition covering the deepest index any flat node reaches.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Destination table identifier.
    pub table: String,
    /// Item priority, non-negative.
    pub priority: f64,
}

impl StructuredWriterConfig {
    /// The buffered depth required before every flat node can be resolved.
    pub(crate) fn required_buffer_length(&self) -> i64 {
        self.flat
            .iter()
            .map(FlatNode::history_depth)
            .max()
            .unwrap_or(0) as i64
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Statically check `config`, returning the first violation found.
///
/// Called by the writer before a config is accepted; a rejected config never
/// observes any data.
pub fn validate_config(config: &StructuredWriterConfig) -> Result<()> {
    if config.flat.is_empty() {
        return invalid("`flat` must not be empty.".to_string());
    }
    for node in &config.flat {
        validate_flat_node(node)?;
    }
    for condition in &config.conditions {
        validate_condition(condition)?;
    }
    if config.table.is_empty() {
        return invalid("`table` must not be empty.".to_string());
    }
    if config.priority < 0.0 {
        return invalid(format!(
            "`priority` must be >= 0 but got {:?}.",
            config.priority
        ));
    }

    let required = config.required_buffer_length();
    let has_gate = config.conditions.iter().any(|c| {
        matches!(c.left, Some(ConditionLeft::BufferLength))
            && matches!(c.cmp, Some(CmpOp::Ge(v)) if v >= required)
    });
    if !has_gate {
        return invalid(format!(
            "Config does not contain required buffer length condition; expected a \
             `buffer_length` condition with `ge` of at least {required}."
        ));
    }

    Ok(())
}

fn validate_flat_node(node: &FlatNode) -> Result<()> {
    if node.flat_source_index < 0 {
        return invalid(format!(
            "`flat_source_index` must be >= 0 but got {}.",
            node.flat_source_index
        ));
    }
    if node.start.is_none() && node.stop.is_none() {
        return invalid("At least one of `start` and `stop` must be specified.".to_string());
    }
    if let Some(start) = node.start {
        if start >= 0 {
            return invalid(format!("`start` must be < 0 but got {start}."));
        }
    }
    if let Some(stop) = node.stop {
        if stop > 0 {
            return invalid(format!("`stop` must be <= 0 but got {stop}."));
        }
        if node.start.is_none() && stop == 0 {
            return invalid("`stop` must be < 0 when `start` isn't set but got 0.".to_string());
        }
        if let Some(start) = node.start {
            if stop <= start {
                return invalid(format!(
                    "`stop` ({stop}) must be > `start` ({start}) when both are specified."
                ));
            }
        }
    }
    if let Some(step) = node.step {
        if node.start.is_none() {
            return invalid("`step` must only be set when `start` is set.".to_string());
        }
        if step <= 0 {
            return invalid(format!("`step` must be > 0 but got {step}."));
        }
    }
    Ok(())
}

fn validate_condition(condition: &Condition) -> Result<()> {
    let Some(left) = condition.left else {
        return invalid("Conditions must specify a value for `left`.".to_string());
    };
    let Some(cmp) = condition.cmp else {
        return invalid("Conditions must specify a value for `cmp`.".to_string());
    };
    if let CmpOp::ModEq { modulus, eq } = cmp {
        if modulus <= 0 {
            return invalid(format!("`mod_eq.mod` must be > 0 but got {modulus}."));
        }
        if eq < 0 {
            return invalid(format!("`mod_eq.eq` must be >= 0 but got {eq}."));
        }
    }
    if left == ConditionLeft::IsEndEpisode && cmp != CmpOp::Eq(1) {
        return invalid("Condition must use `eq=1` when using `is_end_episode`.".to_string());
    }
    Ok(())
}

fn invalid(message: String) -> Result<()> {
    Err(WriterError::InvalidArgument(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(index: i32, start: Option<i32>, stop: Option<i32>, step: Option<i32>) -> FlatNode {
        FlatNode {
            flat_source_index: index,
            start,
            stop,
            step,
        }
    }

    fn config(flat: Vec<FlatNode>, conditions: Vec<Condition>) -> StructuredWriterConfig {
        StructuredWriterConfig {
            flat,
            conditions,
            table: "table".to_string(),
            priority: 1.0,
        }
    }

    fn expect_invalid(config: &StructuredWriterConfig, needle: &str) {
        match validate_config(config) {
            Err(WriterError::InvalidArgument(message)) => assert!(
                message.contains(needle),
                "expected {needle:?} in {message:?}"
            ),
            other => panic!("expected InvalidArgument containing {needle:?}, got {other:?}"),
        }
    }

    // ------------------------------------------------------------------
    // Accepted configs
    // ------------------------------------------------------------------

    #[test]
    fn valid_no_start() {
        let c = config(
            vec![node(0, None, Some(-1), None)],
            vec![Condition::buffer_length_ge(1)],
        );
        validate_config(&c).unwrap();
    }

    #[test]
    fn valid_with_start_and_stop() {
        let c = config(
            vec![node(0, Some(-2), Some(-1), None)],
            vec![Condition::buffer_length_ge(2)],
        );
        validate_config(&c).unwrap();
    }

    #[test]
    fn valid_with_start_and_no_stop() {
        let c = config(
            vec![node(0, Some(-2), None, None)],
            vec![Condition::buffer_length_ge(2)],
        );
        validate_config(&c).unwrap();
    }

    #[test]
    fn valid_with_larger_buffer_length_than_required() {
        let c = config(
            vec![node(0, None, Some(-2), None)],
            vec![Condition::buffer_length_ge(3)],
        );
        validate_config(&c).unwrap();

        let c = config(
            vec![node(0, None, Some(-2), None), node(0, None, Some(-1), None)],
            vec![Condition::buffer_length_ge(3)],
        );
        validate_config(&c).unwrap();
    }

    #[test]
    fn valid_end_of_episode_condition() {
        let c = config(
            vec![node(0, None, Some(-2), None)],
            vec![Condition::buffer_length_ge(2), Condition::end_of_episode()],
        );
        validate_config(&c).unwrap();
    }

    // ------------------------------------------------------------------
    // Flat node rejections
    // ------------------------------------------------------------------

    #[test]
    fn rejects_empty_flat() {
        expect_invalid(&config(vec![], vec![]), "`flat` must not be empty.");
    }

    #[test]
    fn rejects_negative_flat_source_index() {
        expect_invalid(
            &config(vec![node(-1, None, None, None)], vec![]),
            "`flat_source_index` must be >= 0 but got -1.",
        );
    }

    #[test]
    fn rejects_missing_start_and_stop() {
        expect_invalid(
            &config(vec![node(0, None, None, None)], vec![]),
            "At least one of `start` and `stop` must be specified.",
        );
    }

    #[test]
    fn rejects_non_negative_start() {
        expect_invalid(
            &config(vec![node(0, Some(0), None, None)], vec![]),
            "`start` must be < 0 but got 0.",
        );
        expect_invalid(
            &config(vec![node(0, Some(1), None, None)], vec![]),
            "`start` must be < 0 but got 1.",
        );
    }

    #[test]
    fn rejects_positive_stop() {
        expect_invalid(
            &config(vec![node(0, Some(-1), Some(1), None)], vec![]),
            "`stop` must be <= 0 but got 1.",
        );
    }

    #[test]
    fn rejects_zero_stop_without_start() {
        expect_invalid(
            &config(vec![node(0, None, Some(0), None)], vec![]),
            "`stop` must be < 0 when `start` isn't set but got 0.",
        );
    }

    #[test]
    fn rejects_stop_not_greater_than_start() {
        expect_invalid(
            &config(vec![node(0, Some(-2), Some(-2), None)], vec![]),
            "`stop` (-2) must be > `start` (-2) when both are specified.",
        );
        expect_invalid(
            &config(vec![node(0, Some(-2), Some(-3), None)], vec![]),
            "`stop` (-3) must be > `start` (-2) when both are specified.",
        );
    }

    #[test]
    fn rejects_step_without_start() {
        expect_invalid(
            &config(
                vec![node(0, None, Some(-3), Some(2))],
                vec![Condition::buffer_length_ge(3)],
            ),
            "`step` must only be set when `start` is set.",
        );
    }

    #[test]
    fn rejects_non_positive_step() {
        expect_invalid(
            &config(
                vec![node(0, Some(-3), None, Some(-1))],
                vec![Condition::buffer_length_ge(3)],
            ),
            "`step` must be > 0 but got -1.",
        );
        expect_invalid(
            &config(
                vec![node(0, Some(-3), None, Some(0))],
                vec![Condition::buffer_length_ge(3)],
            ),
            "`step` must be > 0 but got 0.",
        );
    }

    // ------------------------------------------------------------------
    // Condition rejections
    // ------------------------------------------------------------------

    #[test]
    fn rejects_condition_without_left() {
        let c = config(
            vec![node(0, None, Some(-2), None)],
            vec![Condition {
                left: None,
                cmp: Some(CmpOp::Ge(2)),
            }],
        );
        expect_invalid(&c, "Conditions must specify a value for `left`");
    }

    #[test]
    fn rejects_condition_without_cmp() {
        let c = config(
            vec![node(0, None, Some(-2), None)],
            vec![Condition {
                left: Some(ConditionLeft::StepIndex),
                cmp: None,
            }],
        );
        expect_invalid(&c, "Conditions must specify a value for `cmp`.");
    }

    #[test]
    fn rejects_non_positive_modulus() {
        for modulus in [-2, 0] {
            let c = config(
                vec![node(0, None, Some(-2), None)],
                vec![Condition::new(
                    ConditionLeft::StepIndex,
                    CmpOp::ModEq { modulus, eq: 0 },
                )],
            );
            expect_invalid(&c, &format!("`mod_eq.mod` must be > 0 but got {modulus}."));
        }
    }

    #[test]
    fn rejects_negative_modulus_remainder() {
        let c = config(
            vec![node(0, None, Some(-2), None)],
            vec![Condition::new(
                ConditionLeft::StepIndex,
                CmpOp::ModEq { modulus: 2, eq: -1 },
            )],
        );
        expect_invalid(&c, "`mod_eq.eq` must be >= 0 but got -1.");
    }

    #[test]
    fn rejects_end_of_episode_not_using_eq_one() {
        for cmp in [CmpOp::Ge(1), CmpOp::Eq(0), CmpOp::Eq(2), CmpOp::Le(1)] {
            let c = config(
                vec![node(0, None, Some(-2), None)],
                vec![
                    Condition::buffer_length_ge(2),
                    Condition::new(ConditionLeft::IsEndEpisode, cmp),
                ],
            );
            expect_invalid(&c, "Condition must use `eq=1` when using `is_end_episode`");
        }
    }

    // ------------------------------------------------------------------
    // Table, priority, buffer-length gate
    // ------------------------------------------------------------------

    #[test]
    fn rejects_empty_table() {
        let mut c = config(
            vec![node(0, None, Some(-2), None)],
            vec![Condition::buffer_length_ge(2)],
        );
        c.table = String::new();
        expect_invalid(&c, "`table` must not be empty.");
    }

    #[test]
    fn rejects_negative_priority() {
        let mut c = config(
            vec![node(0, None, Some(-2), None)],
            vec![Condition::buffer_length_ge(2)],
        );
        c.priority = -1.0;
        expect_invalid(&c, "`priority` must be >= 0 but got -1.0");
    }

    #[test]
    fn rejects_missing_buffer_length_condition() {
        expect_invalid(
            &config(vec![node(0, None, Some(-1), None)], vec![]),
            "Config does not contain required buffer length condition;",
        );
    }

    #[test]
    fn rejects_too_small_buffer_length_condition() {
        // Single node reaching two steps back.
        expect_invalid(
            &config(
                vec![node(0, None, Some(-2), None)],
                vec![Condition::buffer_length_ge(1)],
            ),
            "Config does not contain required buffer length condition;",
        );
        // The deepest node across the whole pattern sets the requirement.
        expect_invalid(
            &config(
                vec![node(0, None, Some(-2), None), node(0, Some(-3), None, None)],
                vec![Condition::buffer_length_ge(2)],
            ),
            "Config does not contain required buffer length condition;",
        );
    }

    #[test]
    fn validation_is_deterministic() {
        let c = config(vec![node(0, Some(-2), Some(-2), None)], vec![]);
        let first = validate_config(&c).unwrap_err().to_string();
        let second = validate_config(&c).unwrap_err().to_string();
        assert_eq!(first, second);
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    #[test]
    fn config_round_trips_through_json() {
        let c = config(
            vec![
                node(0, None, Some(-1), None),
                node(1, Some(-4), Some(-1), Some(2)),
            ],
            vec![
                Condition::buffer_length_ge(4),
                Condition::new(
                    ConditionLeft::StepIndex,
                    CmpOp::ModEq { modulus: 3, eq: 1 },
                ),
            ],
        );

        let encoded = serde_json::to_string(&c).unwrap();
        let decoded: StructuredWriterConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(c, decoded);
        validate_config(&decoded).unwrap();
    }
}
