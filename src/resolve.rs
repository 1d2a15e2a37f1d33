use std::{
    cmp::Ordering,
    collections::{hash_map::Entry, HashMap},
    fmt,
    str::FromStr,
};

use tracing::{debug, instrument};

use crate::{
    error::IntegrityError,
    grid::Cell,
    month::{Month, ParseMonthError},
    rollup::{SnapshotRow, SnapshotTable},
    segment::Segment,
};

/// Backfill settings for a map request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backfill {
    pub fill_gaps: bool,
    pub lookback_years: u32,
}

impl Backfill {
    pub const EXACT: Backfill = Backfill {
        fill_gaps: false,
        lookback_years: 0,
    };

    pub fn within(lookback_years: u32) -> Self {
        Self {
            fill_gaps: true,
            lookback_years,
        }
    }

    fn accepts(&self, end_month: Month, target: Month) -> bool {
        if self.fill_gaps {
            end_month <= target && end_month >= target.minus_years(self.lookback_years)
        } else {
            end_month == target
        }
    }
}

/// The snapshot served for a request, and how stale it is.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<'a> {
    pub row: &'a SnapshotRow,
    pub target_month: Month,
    /// Calendar-year distance between target and the row used.
    pub years_stale: i32,
}

impl<'a> Resolved<'a> {
    fn new(row: &'a SnapshotRow, target_month: Month) -> Self {
        Self {
            row,
            target_month,
            years_stale: target_month.year() - row.end_month.year(),
        }
    }
}

/// Either a concrete month or the table's newest one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonthSelector {
    Latest,
    Exact(Month),
}

impl MonthSelector {
    pub fn select(&self, table: &SnapshotTable) -> Option<Month> {
        match self {
            Self::Latest => table.latest_end_month(),
            Self::Exact(m) => Some(*m),
        }
    }
}

impl FromStr for MonthSelector {
    type Err = ParseMonthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("latest") {
            Ok(Self::Latest)
        } else {
            s.parse().map(Self::Exact)
        }
    }
}

impl fmt::Display for MonthSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("LATEST"),
            Self::Exact(m) => m.fmt(f),
        }
    }
}

/// Keeps the newest accepted row. Two rows on the same month is an integrity
/// failure.
fn newest<'a>(current: &mut Option<&'a SnapshotRow>, row: &'a SnapshotRow) -> Result<(), IntegrityError> {
    match current.map(|best| row.end_month.cmp(&best.end_month)) {
        None | Some(Ordering::Greater) => *current = Some(row),
        Some(Ordering::Less) => {}
        Some(Ordering::Equal) => {
            return Err(IntegrityError {
                cell: row.cell(),
                segment: row.segment(),
                end_month: row.end_month,
            })
        }
    }
    Ok(())
}

/// Serves one cell for one segment at `target_month`.
pub fn resolve(
    table: &SnapshotTable,
    cell: Cell,
    segment: Segment,
    target_month: Month,
    backfill: Backfill,
) -> Result<Option<Resolved<'_>>, IntegrityError> {
    let mut best = None;
    for row in table
        .segment_rows(segment)
        .filter(|r| r.cell() == cell && backfill.accepts(r.end_month, target_month))
    {
        newest(&mut best, row)?;
    }
    Ok(best.map(|row| Resolved::new(row, target_month)))
}

/// Serves every cell of a segment for a map render. Cells with nothing in
/// the accepted window are simply absent.
#[instrument(skip(table), fields(resolution = %table.resolution()))]
pub fn resolve_map(
    table: &SnapshotTable,
    segment: Segment,
    target_month: Month,
    backfill: Backfill,
) -> Result<Vec<Resolved<'_>>, IntegrityError> {
    let mut best: HashMap<Cell, Option<&SnapshotRow>> = HashMap::new();
    for row in table
        .segment_rows(segment)
        .filter(|r| backfill.accepts(r.end_month, target_month))
    {
        match best.entry(row.cell()) {
            Entry::Occupied(mut e) => newest(e.get_mut(), row)?,
            Entry::Vacant(e) => {
                e.insert(Some(row));
            }
        }
    }

    let mut out: Vec<Resolved<'_>> = best
        .into_values()
        .flatten()
        .map(|row| Resolved::new(row, target_month))
        .collect();
    out.sort_by_key(|r| r.row.cell());
    debug!(cells = out.len(), "map resolved");
    Ok(out)
}

/// Rows of one segment at exactly the selected month.
pub fn cells_at<'a>(
    table: &'a SnapshotTable,
    segment: Segment,
    month: MonthSelector,
) -> Option<(Month, Vec<&'a SnapshotRow>)> {
    let month = month.select(table)?;
    let rows = table
        .segment_rows(segment)
        .filter(|r| r.end_month == month)
        .collect();
    Some((month, rows))
}
