//! Trawl: a structured trajectory writer.
//!
//! Turns a stream of timestepped, multi-column observations into trajectory
//! items emitted to a downstream column-writer sink. Each item is assembled
//! by applying a declarative pattern ([`StructuredWriterConfig`]) whenever its
//! condition set holds, referencing cells the sink already stores.

pub mod config;
pub mod error;
pub mod sink;
pub mod writer;

pub use config::{
    validate_config, CmpOp, Condition, ConditionLeft, FlatNode, StructuredWriterConfig,
};
pub use error::{Result, WriterError};
pub use sink::{CellRef, ColumnWriter, TrajectoryColumn};
pub use writer::StructuredWriter;
