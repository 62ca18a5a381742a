//! The remapping engine.
//!
//! Exported source rows are rewritten into destination rows in two passes.
//! The first pass ([`transform`]) walks tables in [`scheduler`] order,
//! allocating offset ids, merging rows that already exist in the destination
//! and recording every id translation in the shared [`state`]. The second
//! pass ([`postprocess`]) rewrites foreign keys and polymorphic references
//! once that state is complete. [`processor`] drives both over a work
//! directory.

pub mod columns;
pub mod postprocess;
pub mod processor;
pub mod scheduler;
pub mod snapshot;
pub mod state;
pub mod transform;

pub use columns::{resolve_target_columns, TargetColumns};
pub use postprocess::{PostprocessStats, Postprocessor, RowOutcome};
pub use processor::{ProcessOutcome, Processor, ProcessorOptions};
pub use scheduler::{order_tables, schedule, DiscriminatorDeps};
pub use snapshot::{ExistingRow, ExistingSnapshot, Snapshot};
pub use state::{
    ForeignKeyMap, MovedTableMap, PolymorphicRef, ProcessStats, ReferenceRegistry, RemapState,
};
pub use transform::{Emitted, RowTransformer, Stream, StreamWriters};
