use std::{io, path::PathBuf};

use crate::{grid::Cell, month::Month, segment::Segment};

/// Caller bugs detected before any aggregation runs.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown grid resolution {0}, expected one of 1000, 5000, 10000, 25000")]
    UnknownResolution(u32),

    #[error("unknown grid `{0}`, expected 1km, 5km, 10km or 25km")]
    UnknownResolutionLabel(String),

    #[error("grid resolution {0} configured more than once")]
    DuplicateResolution(u32),

    #[error("no grid resolutions configured")]
    NoResolutions,

    #[error("{field} must be at least 1, got {value}")]
    NonPositive { field: &'static str, value: u32 },

    #[error("source `{0}` sets align_to_latest but is not a scotland feed")]
    AlignmentNotSupported(String),

    #[error("unknown {dimension} code `{code}`")]
    UnknownCategory { dimension: &'static str, code: String },

    #[error("failed to read config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse config {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
}

/// A roll-up produced two rows for the same (cell, segment, end_month). This
/// is a construction bug, never a business condition.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("duplicate snapshot row for cell {} segment {segment} at {end_month}", cell.key())]
pub struct IntegrityError {
    pub cell: Cell,
    pub segment: Segment,
    pub end_month: Month,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("source `{source_name}` I/O error: {error}")]
    Io { source_name: String, error: io::Error },

    #[error("source `{source_name}` CSV error: {error}")]
    Csv { source_name: String, error: csv::Error },

    #[error("source `{source_name}` has no column `{column}`")]
    MissingColumn { source_name: String, column: String },
}

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("artifact I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("artifact CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("artifact JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
