use std::collections::{BTreeSet, HashMap, HashSet};

use itertools::Itertools;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::{
    error::IntegrityError,
    grid::{Cell, Resolution},
    month::Month,
    postcode_index::LocatedTransaction,
    segment::{NewBuild, PropertyType, RollupLevel, Segment},
};

/// Length of the trailing aggregation window, in months, including the anchor.
pub const WINDOW_MONTHS: i64 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupConfig {
    /// Rows with fewer sales are dropped. 1 disables the filter.
    pub min_sales: u32,
    /// Yearly anchors kept before the latest one.
    pub years_back: u32,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            min_sales: 3,
            years_back: 10,
        }
    }
}

/// Trailing 12-month statistics for one cell and segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub resolution: Resolution,
    pub gx: i64,
    pub gy: i64,
    pub property_type: PropertyType,
    pub new_build: NewBuild,
    pub end_month: Month,
    pub median_price_12m: f64,
    pub sales_12m: u32,
}

impl SnapshotRow {
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

/// Earliest/latest anchor and anchor count of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridMetadata {
    pub earliest: Month,
    pub latest: Month,
    pub available_months: usize,
}

/// All snapshot rows of one resolution. Row order carries no meaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotTable {
    resolution: Resolution,
    rows: Vec<SnapshotRow>,
}

impl SnapshotTable {
    /// Wraps rows read back from an artifact. Rows at other resolutions are
    /// ignored.
    pub fn new(resolution: Resolution, rows: Vec<SnapshotRow>) -> Self {
        let rows = rows.into_iter().filter(|r| r.resolution == resolution).collect();
        Self { resolution, rows }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn rows(&self) -> &[SnapshotRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<SnapshotRow> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn end_months(&self) -> BTreeSet<Month> {
        self.rows.iter().map(|r| r.end_month).collect()
    }

    pub fn latest_end_month(&self) -> Option<Month> {
        self.rows.iter().map(|r| r.end_month).max()
    }

    /// Recomputed from the rows on every call; no builder state involved.
    pub fn metadata(&self) -> Option<GridMetadata> {
        let months = self.end_months();
        Some(GridMetadata {
            earliest: *months.first()?,
            latest: *months.last()?,
            available_months: months.len(),
        })
    }

    /// Rows for exactly this segment. `ALL` must be asked for explicitly.
    pub fn segment_rows(&self, segment: Segment) -> impl Iterator<Item = &SnapshotRow> {
        self.rows.iter().filter(move |r| r.segment() == segment)
    }

    /// Fails on the first repeated (cell, segment, end_month).
    pub fn check_integrity(&self) -> Result<(), IntegrityError> {
        let mut seen = HashSet::with_capacity(self.rows.len());
        for row in &self.rows {
            if !seen.insert((row.cell(), row.segment(), row.end_month)) {
                return Err(IntegrityError {
                    cell: row.cell(),
                    segment: row.segment(),
                    end_month: row.end_month,
                });
            }
        }
        Ok(())
    }
}

/// Yearly anchors walking back from the latest month: stops after
/// `years_back` extra anchors or before going earlier than the first month.
/// The latest month is always included.
pub fn anchor_months<I>(months: I, years_back: u32) -> Vec<Month>
where
    I: IntoIterator<Item = Month>,
{
    let Some((min, max)) = months.into_iter().minmax().into_option() else {
        return Vec::new();
    };

    let mut anchors = vec![max];
    let mut cursor = max.minus_years(1);
    while cursor >= min && anchors.len() < years_back as usize + 1 {
        anchors.push(cursor);
        cursor = cursor.minus_years(1);
    }
    anchors
}

/// Statistical median; the mean of the middle pair for even counts.
pub fn median(prices: &mut [u64]) -> Option<f64> {
    if prices.is_empty() {
        return None;
    }
    prices.sort_unstable();
    let mid = prices.len() / 2;
    if prices.len() % 2 == 1 {
        Some(prices[mid] as f64)
    } else {
        Some((prices[mid - 1] as f64 + prices[mid] as f64) / 2.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Sale {
    cell: Cell,
    month: Month,
    property_type: PropertyType,
    new_build: NewBuild,
    price: u64,
}

/// Every level is grouped straight from the window's sales, so no level's
/// median is derived from another level's output.
fn aggregate_window(sales: &[Sale], end_month: Month) -> Vec<SnapshotRow> {
    let start = end_month.offset(-(WINDOW_MONTHS - 1));
    let mut groups: HashMap<(Cell, Segment), Vec<u64>> = HashMap::new();
    let mut window_rows = 0usize;

    for sale in sales.iter().filter(|s| s.month >= start && s.month <= end_month) {
        window_rows += 1;
        for level in RollupLevel::ALL {
            let segment = level.project(sale.property_type, sale.new_build);
            groups.entry((sale.cell, segment)).or_default().push(sale.price);
        }
    }

    debug!(%end_month, window_rows, groups = groups.len(), "window aggregated");

    groups
        .into_iter()
        .filter_map(|((cell, segment), mut prices)| {
            let sales_12m = prices.len() as u32;
            Some(SnapshotRow {
                resolution: cell.resolution,
                gx: cell.gx,
                gy: cell.gy,
                property_type: segment.property_type,
                new_build: segment.new_build,
                end_month,
                median_price_12m: median(&mut prices)?,
                sales_12m,
            })
        })
        .collect()
}

/// Builds the snapshot table for one resolution. Anchors are aggregated in
/// parallel; each is a pure function of the shared read-only input.
#[instrument(skip(located, config))]
pub fn build_snapshots(
    located: &[LocatedTransaction],
    resolution: Resolution,
    config: &RollupConfig,
) -> SnapshotTable {
    let sales: Vec<Sale> = located
        .iter()
        .filter_map(|l| {
            Some(Sale {
                cell: l.cell(resolution)?,
                month: l.transaction.month,
                property_type: l.transaction.property_type,
                new_build: l.transaction.new_build,
                price: l.transaction.price,
            })
        })
        .collect();

    let anchors = anchor_months(sales.iter().map(|s| s.month), config.years_back);

    let mut rows: Vec<SnapshotRow> = anchors
        .par_iter()
        .map(|end| aggregate_window(&sales, *end))
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect();

    let before = rows.len();
    if config.min_sales > 1 {
        rows.retain(|r| r.sales_12m >= config.min_sales);
    }

    rows.sort_by(|a, b| {
        b.end_month
            .cmp(&a.end_month)
            .then_with(|| (a.gx, a.gy, a.segment()).cmp(&(b.gx, b.gy, b.segment())))
    });

    info!(
        sales = sales.len(),
        anchors = anchors.len(),
        rows = rows.len(),
        below_min_sales = before - rows.len(),
        "snapshot table built"
    );

    SnapshotTable { resolution, rows }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::{grid::CellSet, transaction::Transaction};

    fn m(s: &str) -> Month {
        s.parse().unwrap()
    }

    fn located(x: f64, date: (i32, u32), price: u64, pt: PropertyType, nb: NewBuild) -> LocatedTransaction {
        let d = NaiveDate::from_ymd_opt(date.0, date.1, 15).unwrap();
        LocatedTransaction {
            transaction: Transaction::new("t", price, d, "A1 1AA", pt, nb),
            cells: CellSet::bin_all(x, 100.0, &Resolution::ALL),
        }
    }

    #[test]
    fn anchors_step_back_yearly() {
        let months = [m("2020-05"), m("2024-02"), m("2023-03")];
        assert_eq!(anchor_months(months, 10), vec![m("2024-02"), m("2023-02"), m("2022-02"), m("2021-02")]);
        assert_eq!(anchor_months(months, 1), vec![m("2024-02"), m("2023-02")]);
        assert_eq!(anchor_months([m("2024-02")], 5), vec![m("2024-02")]);
        assert!(anchor_months(Vec::new(), 5).is_empty());
    }

    #[test]
    fn median_of_known_lists() {
        assert_eq!(median(&mut [300, 100, 200]), Some(200.0));
        assert_eq!(median(&mut [100, 400]), Some(250.0));
        assert_eq!(median(&mut []), None);
    }

    #[test]
    fn emits_four_levels_per_cell() {
        let txs = vec![
            located(10.0, (2024, 1), 100, PropertyType::Detached, NewBuild::No),
            located(20.0, (2024, 1), 200, PropertyType::Flat, NewBuild::Yes),
            located(30.0, (2024, 1), 300, PropertyType::Flat, NewBuild::No),
        ];
        let cfg = RollupConfig { min_sales: 1, years_back: 0 };
        let table = build_snapshots(&txs, Resolution::Km1, &cfg);
        table.check_integrity().unwrap();

        let all: Vec<_> = table.segment_rows(Segment::ALL).collect();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].median_price_12m, 200.0);
        assert_eq!(all[0].sales_12m, 3);

        let flats = Segment::new(PropertyType::Flat, NewBuild::All);
        let row = table.segment_rows(flats).next().unwrap();
        assert_eq!((row.median_price_12m, row.sales_12m), (250.0, 2));

        // 3 type+build, 2 type+ALL, 2 ALL+build, 1 ALL+ALL
        assert_eq!(table.len(), 8);
    }

    #[test]
    fn window_covers_twelve_months_inclusive() {
        let txs = vec![
            located(10.0, (2023, 2), 100, PropertyType::Terraced, NewBuild::No),
            located(10.0, (2023, 1), 900, PropertyType::Terraced, NewBuild::No),
            located(10.0, (2024, 1), 300, PropertyType::Terraced, NewBuild::No),
        ];
        let cfg = RollupConfig { min_sales: 1, years_back: 0 };
        let table = build_snapshots(&txs, Resolution::Km1, &cfg);
        let row = table.segment_rows(Segment::ALL).next().unwrap();
        assert_eq!(row.end_month, m("2024-01"));
        assert_eq!(row.sales_12m, 2);
        assert_eq!(row.median_price_12m, 200.0);
    }

    #[test]
    fn min_sales_filter_and_unlocated_rows() {
        let mut txs = vec![
            located(10.0, (2024, 1), 100, PropertyType::Detached, NewBuild::No),
            located(10.0, (2024, 1), 200, PropertyType::Detached, NewBuild::No),
            located(10.0, (2024, 1), 300, PropertyType::Flat, NewBuild::No),
        ];
        let mut orphan = located(10.0, (2024, 1), 5, PropertyType::Flat, NewBuild::No);
        orphan.cells = None;
        txs.push(orphan);

        let cfg = RollupConfig { min_sales: 2, years_back: 0 };
        let table = build_snapshots(&txs, Resolution::Km5, &cfg);
        assert!(table.rows().iter().all(|r| r.sales_12m >= 2));
        assert!(table
            .segment_rows(Segment::new(PropertyType::Flat, NewBuild::No))
            .next()
            .is_none());
        let all = table.segment_rows(Segment::ALL).next().unwrap();
        assert_eq!(all.sales_12m, 3);
    }

    #[test]
    fn metadata_and_integrity() {
        let txs = vec![
            located(10.0, (2022, 6), 100, PropertyType::Detached, NewBuild::No),
            located(10.0, (2024, 6), 200, PropertyType::Detached, NewBuild::No),
        ];
        let cfg = RollupConfig { min_sales: 1, years_back: 5 };
        let table = build_snapshots(&txs, Resolution::Km25, &cfg);
        let meta = table.metadata().unwrap();
        assert_eq!(meta.earliest, m("2022-06"));
        assert_eq!(meta.latest, m("2024-06"));
        assert_eq!(meta.available_months, 2);

        let mut rows = table.clone().into_rows();
        rows.push(rows[0].clone());
        let broken = SnapshotTable::new(Resolution::Km25, rows);
        assert!(broken.check_integrity().is_err());
    }
}
