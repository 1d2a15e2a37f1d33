use std::collections::{HashMap, HashSet};

use brickgrid::{
    bin,
    grid::CellSet,
    postcode_index::LocatedTransaction,
    rollup::{build_snapshots, RollupConfig},
    segment::RollupLevel,
    Cell, Month, NewBuild, PropertyType, Resolution, SnapshotRow, Transaction,
};
use proptest::prelude::*;

const TYPES: [PropertyType; 5] = [
    PropertyType::Detached,
    PropertyType::SemiDetached,
    PropertyType::Terraced,
    PropertyType::Flat,
    PropertyType::Other,
];

fn arb_resolution() -> impl Strategy<Value = Resolution> {
    prop_oneof![
        Just(Resolution::Km1),
        Just(Resolution::Km5),
        Just(Resolution::Km10),
        Just(Resolution::Km25),
    ]
}

fn arb_sale() -> impl Strategy<Value = LocatedTransaction> {
    (0.0..60_000.0f64, 0.0..60_000.0f64, 0i64..40, 1u64..2_000_000, 0usize..5, any::<bool>()).prop_map(
        |(x, y, month, price, pt, nb)| {
            let date = Month::new(2019, 1).unwrap().offset(month).first_day();
            let nb = if nb { NewBuild::Yes } else { NewBuild::No };
            LocatedTransaction {
                transaction: Transaction::new("p", price, date, "P1 1PP", TYPES[pt], nb),
                cells: CellSet::bin_all(x, y, &Resolution::ALL),
            }
        },
    )
}

fn as_set(rows: &[SnapshotRow]) -> HashSet<String> {
    rows.iter().map(|r| format!("{r:?}")).collect()
}

proptest! {
    #[test]
    fn binning_stays_inside_the_cell(x in -1.0e7..1.0e7f64, y in -1.0e7..1.0e7f64, res in arb_resolution()) {
        let cell = bin(x, y, res).unwrap();
        let size = i64::from(res.meters());
        prop_assert_eq!(cell.gx % size, 0);
        prop_assert_eq!(cell.gy % size, 0);
        prop_assert!(cell.gx as f64 <= x && x < (cell.gx + size) as f64);
        prop_assert!(cell.gy as f64 <= y && y < (cell.gy + size) as f64);
        prop_assert!(cell.contains(x, y));
    }

    #[test]
    fn levels_agree_on_sales_counts(sales in prop::collection::vec(arb_sale(), 1..120), res in arb_resolution()) {
        let cfg = RollupConfig { min_sales: 1, years_back: 3 };
        let table = build_snapshots(&sales, res, &cfg);
        table.check_integrity().unwrap();

        let mut totals: HashMap<(Cell, Month, RollupLevel), u32> = HashMap::new();
        for row in table.rows() {
            *totals.entry((row.cell(), row.end_month, row.segment().level())).or_default() += row.sales_12m;
        }
        for ((cell, month, level), sum) in &totals {
            let all = totals[&(*cell, *month, RollupLevel::AllAll)];
            prop_assert_eq!(*sum, all, "level {:?} disagrees", level);
        }
    }

    #[test]
    fn rebuilding_is_set_equal(sales in prop::collection::vec(arb_sale(), 0..80), res in arb_resolution()) {
        let cfg = RollupConfig { min_sales: 2, years_back: 4 };
        let first = build_snapshots(&sales, res, &cfg);
        let mut reversed = sales.clone();
        reversed.reverse();
        let second = build_snapshots(&reversed, res, &cfg);
        prop_assert_eq!(as_set(first.rows()), as_set(second.rows()));
    }
}
