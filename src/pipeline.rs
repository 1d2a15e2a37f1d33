//! Batch build: sources -> history window -> postcode index -> join ->
//! per-resolution rollup -> overall deltas.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::{
    config::EngineConfig,
    delta::{overall_deltas, DeltaMetadata, OverallDeltas},
    error::{IngestError, IntegrityError, OutputError},
    grid::Resolution,
    ingest::{apply_history_window, ExclusionCounts, SourceAdapter},
    output::Artifacts,
    postcode_index::{build_index, locate, CentroidRecord, IndexReport, OutcodeLookup},
    reproject::Reproject,
    rollup::{build_snapshots, GridMetadata, SnapshotTable},
    transaction::Transaction,
};

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub name: String,
    pub exclusions: ExclusionCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct GridReport {
    pub resolution: Resolution,
    pub rows: usize,
    pub metadata: Option<GridMetadata>,
    pub deltas: Option<DeltaMetadata>,
}

/// Data-quality counts for one build.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    pub sources: Vec<SourceReport>,
    pub outside_history: usize,
    pub index: IndexReport,
    pub unmatched_postcodes: usize,
    pub grids: Vec<GridReport>,
}

#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub tables: Vec<SnapshotTable>,
    pub outcodes: OutcodeLookup,
    pub deltas: Vec<(Resolution, OverallDeltas)>,
    pub report: BuildReport,
}

impl BuildOutput {
    pub fn table(&self, resolution: Resolution) -> Option<&SnapshotTable> {
        self.tables.iter().find(|t| t.resolution() == resolution)
    }
}

/// Loads every adapter in parallel and concatenates their streams in
/// adapter order.
#[instrument(skip_all)]
pub fn load_sources(adapters: &[Box<dyn SourceAdapter>]) -> Result<(Vec<Transaction>, Vec<SourceReport>), IngestError> {
    let batches = adapters
        .par_iter()
        .map(|a| a.load().map(|batch| (a.name().to_owned(), batch)))
        .collect::<Result<Vec<_>, _>>()?;

    let mut transactions = Vec::new();
    let mut reports = Vec::with_capacity(batches.len());
    for (name, batch) in batches {
        transactions.extend(batch.transactions);
        reports.push(SourceReport {
            name,
            exclusions: batch.exclusions,
        });
    }
    Ok((transactions, reports))
}

/// Runs the aggregation over already-loaded inputs. Resolutions are built in
/// parallel from the same read-only joined stream.
#[instrument(skip_all)]
pub fn run(
    config: &EngineConfig,
    transactions: Vec<Transaction>,
    centroids: Vec<CentroidRecord>,
) -> Result<BuildOutput, IntegrityError> {
    let mut report = BuildReport::default();

    let transactions = match config.history_years {
        Some(years) => {
            let (kept, dropped) = apply_history_window(transactions, years);
            report.outside_history = dropped;
            kept
        }
        None => transactions,
    };

    let resolutions = config.resolutions();
    let (index, outcodes, index_report) = build_index(centroids, &resolutions);
    report.index = index_report;

    let (located, unmatched) = locate(transactions, &index);
    report.unmatched_postcodes = unmatched;
    if unmatched > 0 {
        warn!(unmatched, "transactions without a located postcode are excluded");
    }
    drop(index);

    let tables: Vec<SnapshotTable> = config
        .grids
        .par_iter()
        .map(|g| build_snapshots(&located, g.resolution, &g.rollup))
        .collect();
    drop(located);

    let mut deltas = Vec::with_capacity(tables.len());
    for table in &tables {
        table.check_integrity()?;
        let overall = overall_deltas(table, config.delta_min_sales)?;
        report.grids.push(GridReport {
            resolution: table.resolution(),
            rows: table.len(),
            metadata: table.metadata(),
            deltas: overall.metadata(),
        });
        deltas.push((table.resolution(), overall));
    }

    info!(grids = tables.len(), "build finished");
    Ok(BuildOutput {
        tables,
        outcodes,
        deltas,
        report,
    })
}

/// Writes every artifact of a build into `artifacts`.
#[instrument(skip_all, fields(dir = %artifacts.dir().display()))]
pub fn write_artifacts(
    output: &BuildOutput,
    artifacts: &Artifacts,
    reproject: Option<&dyn Reproject>,
) -> Result<(), OutputError> {
    for table in &output.tables {
        artifacts.write_snapshots(table)?;
    }
    artifacts.write_grid_metadata(&output.tables)?;

    let resolutions: Vec<Resolution> = output.tables.iter().map(|t| t.resolution()).collect();
    artifacts.write_outcodes(&output.outcodes, &resolutions)?;

    let mut delta_meta = BTreeMap::new();
    for (resolution, overall) in &output.deltas {
        artifacts.write_deltas(*resolution, overall.rows(), reproject)?;
        if let Some(meta) = overall.metadata() {
            delta_meta.insert(resolution.label(), meta);
        }
    }
    artifacts.write_delta_metadata(&delta_meta)?;

    crate::output::write_json(artifacts.report_path(), &output.report)?;
    info!("artifacts written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::{
        config::FileConfig,
        ingest::MemorySource,
        segment::{NewBuild, PropertyType},
    };

    fn tx(id: &str, pc: &str, (y, m): (i32, u32), price: u64) -> Transaction {
        let d = NaiveDate::from_ymd_opt(y, m, 10).unwrap();
        Transaction::new(id, price, d, pc, PropertyType::SemiDetached, NewBuild::No)
    }

    fn centroid(pc: &str, x: f64, y: f64) -> CentroidRecord {
        CentroidRecord {
            postcode: pc.to_owned(),
            x: Some(x),
            y: Some(y),
        }
    }

    #[test]
    fn unmatched_and_old_transactions_are_counted() {
        let file: FileConfig = toml::from_str(
            "history_years = 2\ndelta_min_sales = 1\n[[grid]]\nsize = 5000\nmin_sales = 1\n",
        )
        .unwrap();
        let config = EngineConfig::try_from(file).unwrap();

        let adapters: Vec<Box<dyn SourceAdapter>> = vec![Box::new(MemorySource {
            name: "mem".into(),
            transactions: vec![
                tx("a", "S1 1AA", (2024, 3), 100),
                tx("b", "S1 1AA", (2023, 3), 80),
                tx("c", "S1 1AA", (2015, 3), 10),
                tx("d", "NOWHERE", (2024, 3), 999),
            ],
        })];
        let (transactions, sources) = load_sources(&adapters).unwrap();
        assert_eq!(sources[0].exclusions.kept, 4);

        let out = run(&config, transactions, vec![centroid("S1 1AA", 12.0, 7_000.0)]).unwrap();
        assert_eq!(out.report.outside_history, 1);
        assert_eq!(out.report.unmatched_postcodes, 1);

        let table = out.table(Resolution::Km5).unwrap();
        let latest = table.latest_end_month().unwrap();
        assert_eq!(latest, "2024-03".parse().unwrap());
        assert_eq!(out.report.grids[0].metadata.as_ref().unwrap().available_months, 2);

        let (_, overall) = &out.deltas[0];
        let OverallDeltas::Computed { rows, .. } = overall else {
            panic!("expected deltas");
        };
        // 4 levels, one cell
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.delta_pct == Some(25.0)));
    }
}
