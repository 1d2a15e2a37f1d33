use std::{
    cmp::Ordering,
    collections::{hash_map::Entry, HashMap},
};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::{
    error::IntegrityError,
    grid::{Cell, Resolution},
    month::Month,
    resolve::{resolve, Backfill},
    rollup::{SnapshotRow, SnapshotTable},
    segment::{NewBuild, PropertyType, Segment},
};

/// Change in median price for one cell and segment between two anchors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaRow {
    pub resolution: Resolution,
    pub gx: i64,
    pub gy: i64,
    pub property_type: PropertyType,
    pub new_build: NewBuild,
    pub end_month_t0: Month,
    pub end_month_t1: Month,
    pub price_at_t0: f64,
    pub sales_at_t0: u32,
    pub price_at_t1: f64,
    pub sales_at_t1: u32,
    pub delta_abs: f64,
    /// Missing when the t0 price is not positive.
    pub delta_pct: Option<f64>,
    pub years_between: i32,
}

impl DeltaRow {
    fn between(t0: &SnapshotRow, t1: &SnapshotRow) -> Self {
        let delta_pct = if t0.median_price_12m > 0.0 {
            Some((t1.median_price_12m / t0.median_price_12m - 1.0) * 100.0)
        } else {
            None
        };
        Self {
            resolution: t0.resolution,
            gx: t0.gx,
            gy: t0.gy,
            property_type: t0.property_type,
            new_build: t0.new_build,
            end_month_t0: t0.end_month,
            end_month_t1: t1.end_month,
            price_at_t0: t0.median_price_12m,
            sales_at_t0: t0.sales_12m,
            price_at_t1: t1.median_price_12m,
            sales_at_t1: t1.sales_12m,
            delta_abs: t1.median_price_12m - t0.median_price_12m,
            delta_pct,
            years_between: t1.end_month.year() - t0.end_month.year(),
        }
    }

    pub fn cell(&self) -> Cell {
        Cell {
            resolution: self.resolution,
            gx: self.gx,
            gy: self.gy,
        }
    }

    pub fn segment(&self) -> Segment {
        Segment::new(self.property_type, self.new_build)
    }
}

/// Delta for one cell and segment. Both months are matched exactly.
pub fn delta(
    table: &SnapshotTable,
    cell: Cell,
    segment: Segment,
    t0: Month,
    t1: Month,
    min_sales: u32,
) -> Result<Option<DeltaRow>, IntegrityError> {
    let before = resolve(table, cell, segment, t0, Backfill::EXACT)?;
    let after = resolve(table, cell, segment, t1, Backfill::EXACT)?;
    let (Some(before), Some(after)) = (before, after) else {
        return Ok(None);
    };
    if before.row.sales_12m < min_sales || after.row.sales_12m < min_sales {
        return Ok(None);
    }
    Ok(Some(DeltaRow::between(before.row, after.row)))
}

type Keyed<'a> = HashMap<(Cell, Segment), &'a SnapshotRow>;

fn rows_at<'a, I>(rows: I, month: Month, min_sales: u32) -> Result<Keyed<'a>, IntegrityError>
where
    I: Iterator<Item = &'a SnapshotRow>,
{
    let mut out = HashMap::new();
    for row in rows.filter(|r| r.end_month == month && r.sales_12m >= min_sales) {
        match out.entry((row.cell(), row.segment())) {
            Entry::Occupied(_) => {
                return Err(IntegrityError {
                    cell: row.cell(),
                    segment: row.segment(),
                    end_month: month,
                })
            }
            Entry::Vacant(v) => {
                v.insert(row);
            }
        }
    }
    Ok(out)
}

fn join(before: &Keyed<'_>, after: &Keyed<'_>) -> Vec<DeltaRow> {
    before
        .iter()
        .filter_map(|(key, t0)| after.get(key).map(|t1| DeltaRow::between(t0, t1)))
        .collect()
}

/// Deltas for every cell of one segment present at both months.
#[instrument(skip(table), fields(resolution = %table.resolution()))]
pub fn delta_map(
    table: &SnapshotTable,
    segment: Segment,
    t0: Month,
    t1: Month,
    min_sales: u32,
) -> Result<Vec<DeltaRow>, IntegrityError> {
    let before = rows_at(table.segment_rows(segment), t0, min_sales)?;
    let after = rows_at(table.segment_rows(segment), t1, min_sales)?;
    let mut rows = join(&before, &after);
    rows.sort_by_key(|r| r.cell());
    info!(rows = rows.len(), "segment deltas computed");
    Ok(rows)
}

/// Outcome of [`overall_deltas`].
#[derive(Debug, Clone, PartialEq)]
pub enum OverallDeltas {
    Computed {
        earliest: Month,
        latest: Month,
        rows: Vec<DeltaRow>,
    },
    /// Every qualifying row sits on one end month.
    SingleMonth(Month),
    /// No row meets the sample threshold.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaMetadata {
    pub earliest: Month,
    pub latest: Month,
    pub rows: usize,
}

impl OverallDeltas {
    pub fn rows(&self) -> &[DeltaRow] {
        match self {
            Self::Computed { rows, .. } => rows,
            _ => &[],
        }
    }

    pub fn metadata(&self) -> Option<DeltaMetadata> {
        match self {
            Self::Computed { earliest, latest, rows } => Some(DeltaMetadata {
                earliest: *earliest,
                latest: *latest,
                rows: rows.len(),
            }),
            _ => None,
        }
    }
}

/// Highest percentage first; rows without a percentage go last.
fn by_pct_desc(a: &DeltaRow, b: &DeltaRow) -> Ordering {
    match (a.delta_pct, b.delta_pct) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| (a.cell(), a.segment()).cmp(&(b.cell(), b.segment())))
}

/// Deltas between the earliest and latest end months of the table, across
/// every segment. Only rows with at least `min_sales` sales take part, both
/// when picking the two months and when joining.
#[instrument(skip(table), fields(resolution = %table.resolution()))]
pub fn overall_deltas(table: &SnapshotTable, min_sales: u32) -> Result<OverallDeltas, IntegrityError> {
    let qualifying = || table.rows().iter().filter(|r| r.sales_12m >= min_sales);

    let (Some(earliest), Some(latest)) = (
        qualifying().map(|r| r.end_month).min(),
        qualifying().map(|r| r.end_month).max(),
    ) else {
        warn!("no rows meet the sample threshold");
        return Ok(OverallDeltas::Empty);
    };
    if earliest == latest {
        warn!(%earliest, "only one end month, no delta computable");
        return Ok(OverallDeltas::SingleMonth(earliest));
    }

    let before = rows_at(qualifying(), earliest, min_sales)?;
    let after = rows_at(qualifying(), latest, min_sales)?;
    let mut rows = join(&before, &after);
    rows.sort_by(by_pct_desc);

    info!(%earliest, %latest, rows = rows.len(), "overall deltas computed");
    Ok(OverallDeltas::Computed { earliest, latest, rows })
}
