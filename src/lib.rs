//! Multi-resolution grid snapshots and deltas over UK property transactions.

pub mod config;
pub mod delta;
pub mod error;
pub mod grid;
pub mod ingest;
pub mod month;
pub mod output;
pub mod pipeline;
pub mod postcode_index;
pub mod ranking;
pub mod reproject;
pub mod resolve;
pub mod rollup;
pub mod segment;
pub mod transaction;

pub use config::{load_config, EngineConfig, FileConfig};
pub use delta::{delta, delta_map, overall_deltas, DeltaRow, OverallDeltas};
pub use error::{ConfigError, IngestError, IntegrityError, OutputError};
pub use grid::{bin, Cell, CellSet, Resolution};
pub use month::Month;
pub use resolve::{resolve, resolve_map, Backfill, MonthSelector, Resolved};
pub use rollup::{build_snapshots, RollupConfig, SnapshotRow, SnapshotTable};
pub use segment::{NewBuild, PropertyType, Segment};
pub use transaction::Transaction;
