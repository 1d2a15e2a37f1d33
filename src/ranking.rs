use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, instrument};

use crate::{
    grid::Resolution,
    month::Month,
    postcode_index::OutcodeLookup,
    resolve::{cells_at, MonthSelector},
    rollup::SnapshotTable,
    segment::{NewBuild, PropertyType, Segment},
};

pub const DEFAULT_RANK_SIZE: usize = 10;

/// Running weighted mean; zero weights are ignored.
#[derive(Debug, Clone, Copy, Default)]
struct WeightedMean {
    sum: f64,
    weight: u64,
}

impl WeightedMean {
    fn add(&mut self, value: f64, weight: u64) {
        if weight > 0 {
            self.sum += value * weight as f64;
            self.weight += weight;
        }
    }

    fn mean(&self) -> Option<f64> {
        (self.weight > 0).then(|| self.sum / self.weight as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcodeRank {
    pub outcode: String,
    /// Sales-weighted mean of the medians of the cells the outcode touches.
    pub median: f64,
    pub weight: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcodeRanking {
    pub resolution: Resolution,
    pub property_type: PropertyType,
    pub new_build: NewBuild,
    pub end_month: Month,
    pub count: usize,
    /// Most expensive first.
    pub top: Vec<OutcodeRank>,
    /// Cheapest first.
    pub bottom: Vec<OutcodeRank>,
}

/// Ranks outcodes by the cells they intersect at one end month. `None` when
/// the table has no end month to select.
#[instrument(skip(table, lookup), fields(resolution = %table.resolution()))]
pub fn rank_outcodes(
    table: &SnapshotTable,
    lookup: &OutcodeLookup,
    segment: Segment,
    month: MonthSelector,
    size: usize,
) -> Option<OutcodeRanking> {
    let (end_month, rows) = cells_at(table, segment, month)?;
    let outcodes_by_cell = lookup.outcodes_by_cell(table.resolution());

    let mut totals: HashMap<&str, WeightedMean> = HashMap::new();
    for row in rows.iter().filter(|r| r.sales_12m > 0 && r.median_price_12m.is_finite()) {
        let Some(outcodes) = outcodes_by_cell.get(&row.cell()) else {
            continue;
        };
        for outcode in outcodes {
            totals
                .entry(outcode.as_str())
                .or_default()
                .add(row.median_price_12m, u64::from(row.sales_12m));
        }
    }

    let mut items: Vec<OutcodeRank> = totals
        .into_iter()
        .filter_map(|(outcode, mean)| {
            Some(OutcodeRank {
                outcode: outcode.to_owned(),
                median: mean.mean()?,
                weight: mean.weight,
            })
        })
        .collect();
    items.sort_by(|a, b| a.median.total_cmp(&b.median).then_with(|| a.outcode.cmp(&b.outcode)));

    debug!(%end_month, outcodes = items.len(), "outcodes ranked");

    let bottom = items.iter().take(size).cloned().collect();
    let top = items.iter().rev().take(size).cloned().collect();
    Some(OutcodeRanking {
        resolution: table.resolution(),
        property_type: segment.property_type,
        new_build: segment.new_build,
        end_month,
        count: items.len(),
        top,
        bottom,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        postcode_index::{build_index, CentroidRecord},
        rollup::SnapshotRow,
    };

    fn row(gx: i64, end: &str, price: f64, sales: u32) -> SnapshotRow {
        SnapshotRow {
            resolution: Resolution::Km1,
            gx,
            gy: 0,
            property_type: PropertyType::All,
            new_build: NewBuild::All,
            end_month: end.parse().unwrap(),
            median_price_12m: price,
            sales_12m: sales,
        }
    }

    fn centroid(pc: &str, x: f64) -> CentroidRecord {
        CentroidRecord {
            postcode: pc.to_owned(),
            x: Some(x),
            y: Some(10.0),
        }
    }

    #[test]
    fn weights_cell_medians_by_sales() {
        let (_, lookup, _) = build_index(
            vec![
                centroid("AA1 1AA", 10.0),
                centroid("AA1 2AA", 1_010.0),
                centroid("BB1 1AA", 1_020.0),
                centroid("CC1 1AA", 5_000.0),
            ],
            &[Resolution::Km1],
        );
        let table = SnapshotTable::new(
            Resolution::Km1,
            vec![
                row(0, "2024-01", 100.0, 1),
                row(1_000, "2024-01", 400.0, 3),
                row(0, "2023-01", 1.0, 1),
            ],
        );

        let ranking = rank_outcodes(&table, &lookup, Segment::ALL, MonthSelector::Latest, 10).unwrap();
        assert_eq!(ranking.end_month, "2024-01".parse().unwrap());
        assert_eq!(ranking.count, 2);
        assert_eq!(ranking.bottom[0].outcode, "AA1");
        assert_eq!(ranking.bottom[0].median, 325.0);
        assert_eq!(ranking.bottom[0].weight, 4);
        assert_eq!(ranking.top[0].outcode, "BB1");
        assert_eq!(ranking.top[0].median, 400.0);
    }

    #[test]
    fn truncates_to_size() {
        let records = (0..5).map(|i| centroid(&format!("Z{i} 1AA"), 1_000.0 * i as f64 + 1.0));
        let (_, lookup, _) = build_index(records, &[Resolution::Km1]);
        let rows = (0..5).map(|i| row(1_000 * i, "2024-01", 100.0 * (i + 1) as f64, 2)).collect();
        let table = SnapshotTable::new(Resolution::Km1, rows);

        let ranking = rank_outcodes(&table, &lookup, Segment::ALL, MonthSelector::Latest, 2).unwrap();
        assert_eq!(ranking.count, 5);
        let top: Vec<_> = ranking.top.iter().map(|r| r.outcode.as_str()).collect();
        let bottom: Vec<_> = ranking.bottom.iter().map(|r| r.outcode.as_str()).collect();
        assert_eq!(top, ["Z4", "Z3"]);
        assert_eq!(bottom, ["Z0", "Z1"]);
    }

    #[test]
    fn empty_table_has_no_month() {
        let table = SnapshotTable::new(Resolution::Km1, Vec::new());
        let lookup = OutcodeLookup::default();
        assert!(rank_outcodes(&table, &lookup, Segment::ALL, MonthSelector::Latest, 10).is_none());
    }
}
