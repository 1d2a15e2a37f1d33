use std::{
    env,
    fs::File,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use brickgrid::{
    config::{load_config, EngineConfig, FileConfig},
    delta::{delta, delta_map, overall_deltas, DeltaRow, OverallDeltas},
    grid::{Cell, Resolution},
    month::Month,
    output::{Artifacts, DeltaExport},
    pipeline::{load_sources, run, write_artifacts},
    postcode_index::{build_index, read_centroids, CentroidSchema},
    ranking::{rank_outcodes, DEFAULT_RANK_SIZE},
    reproject::Reproject,
    resolve::{cells_at, resolve_map, Backfill, MonthSelector},
    rollup::SnapshotRow,
    segment::{NewBuild, PropertyType, Segment},
};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "brickgrid: gridded house price snapshots and deltas", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ingest sources and write snapshot, delta and lookup artifacts
    Build(BuildArgs),
    /// Snapshot rows of one grid for a segment and month
    Cells(CellsArgs),
    /// Deltas between two months for a segment
    Delta(DeltaArgs),
    /// Earliest to latest deltas across every segment
    OverallDeltas(OverallArgs),
    /// Outcodes ranked by sales-weighted cell median
    Outcodes(OutcodesArgs),
    /// Postcodes whose centroid falls in a cell
    Postcodes(PostcodesArgs),
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// TOML config; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,
    /// Artifact directory
    #[arg(long, default_value = "out")]
    out: PathBuf,
}

#[derive(Args, Debug)]
struct GridArgs {
    /// Artifact directory written by `build`
    #[arg(long, default_value = "out")]
    artifacts: PathBuf,
    #[arg(long, default_value = "25km")]
    grid: Resolution,
}

#[derive(Args, Debug, Clone, Copy)]
struct SegmentArgs {
    #[arg(long, default_value = "ALL")]
    property_type: PropertyType,
    #[arg(long, default_value = "ALL")]
    new_build: NewBuild,
}

impl SegmentArgs {
    fn segment(&self) -> Segment {
        Segment::new(self.property_type, self.new_build)
    }
}

#[derive(Args, Debug)]
struct CellsArgs {
    #[command(flatten)]
    grid: GridArgs,
    #[command(flatten)]
    segment: SegmentArgs,
    /// YYYY-MM or LATEST
    #[arg(long, default_value = "LATEST")]
    month: MonthSelector,
    /// Serve the most recent snapshot at or before the month
    #[arg(long)]
    fill_gaps: bool,
    #[arg(long, default_value_t = 10)]
    lookback_years: u32,
}

#[derive(Args, Debug)]
struct DeltaArgs {
    #[command(flatten)]
    grid: GridArgs,
    #[command(flatten)]
    segment: SegmentArgs,
    #[arg(long)]
    from: Month,
    #[arg(long)]
    to: Month,
    /// Restrict to one cell, given as its `gx_gy` key
    #[arg(long)]
    cell: Option<String>,
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    min_sales: u32,
}

#[derive(Args, Debug)]
struct OverallArgs {
    #[command(flatten)]
    grid: GridArgs,
    /// Keep only this property type
    #[arg(long)]
    property_type: Option<PropertyType>,
    /// Keep only this new-build flag
    #[arg(long)]
    new_build: Option<NewBuild>,
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    min_sales: u32,
}

impl OverallArgs {
    fn keeps(&self, row: &DeltaRow) -> bool {
        self.property_type.map_or(true, |p| row.property_type == p)
            && self.new_build.map_or(true, |n| row.new_build == n)
    }
}

#[derive(Args, Debug)]
struct OutcodesArgs {
    #[command(flatten)]
    grid: GridArgs,
    #[command(flatten)]
    segment: SegmentArgs,
    #[arg(long, default_value = "LATEST")]
    month: MonthSelector,
    #[arg(long, default_value_t = DEFAULT_RANK_SIZE)]
    size: usize,
}

#[derive(Args, Debug)]
struct PostcodesArgs {
    /// Centroid CSV
    #[arg(long)]
    centroids: PathBuf,
    #[arg(long, default_value = "25km")]
    grid: Resolution,
    /// Cell key, `gx_gy`
    #[arg(long)]
    cell: String,
    #[arg(long, default_value_t = 0)]
    offset: usize,
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

#[derive(Serialize)]
struct CellOut {
    key: String,
    gx: i64,
    gy: i64,
    end_month: Month,
    median_price_12m: f64,
    sales_12m: u32,
    years_stale: i32,
}

impl CellOut {
    fn new(row: &SnapshotRow, years_stale: i32) -> Self {
        Self {
            key: row.cell().key(),
            gx: row.gx,
            gy: row.gy,
            end_month: row.end_month,
            median_price_12m: row.median_price_12m,
            sales_12m: row.sales_12m,
            years_stale,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("BRICKGRID_LOG").unwrap_or_else(|_| EnvFilter::new("brickgrid=info,warn"));
    let format = env::var("BRICKGRID_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    // Logs go to stderr; stdout carries query results.
    let registry = tracing_subscriber::registry().with(filter);
    match format.as_str() {
        "json" => registry
            .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
            .init(),
        _ => registry.with(fmt::layer().compact().with_writer(std::io::stderr)).init(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_cell(resolution: Resolution, key: &str) -> Result<Cell> {
    match Cell::from_key(resolution, key) {
        Some(cell) => Ok(cell),
        None => bail!("`{key}` is not a {resolution} cell key"),
    }
}

fn open_snapshots(args: &GridArgs) -> Result<brickgrid::SnapshotTable> {
    let artifacts = Artifacts::new(&args.artifacts);
    artifacts
        .read_snapshots(args.grid)
        .with_context(|| format!("Failed to read {}", artifacts.snapshot_path(args.grid).display()))
}

#[cfg(feature = "proj")]
fn reprojector() -> Option<Box<dyn Reproject>> {
    match brickgrid::reproject::BritishNationalGrid::new() {
        Ok(r) => Some(Box::new(r)),
        Err(e) => {
            warn!("reprojection unavailable, lon/lat left empty: {}", e);
            None
        }
    }
}

#[cfg(not(feature = "proj"))]
fn reprojector() -> Option<Box<dyn Reproject>> {
    None
}

fn run_build(args: &BuildArgs) -> Result<()> {
    let file = match &args.config {
        Some(path) => load_config(path)?,
        None => FileConfig::default(),
    };
    let config = EngineConfig::try_from(file)?;

    let Some(centroid_cfg) = &config.centroids else {
        bail!("no [centroids] source configured");
    };
    if config.sources.is_empty() {
        bail!("no [[source]] configured");
    }

    let (transactions, source_reports) = load_sources(&config.adapters())?;
    let centroids = read_centroids(open(&centroid_cfg.path)?, &centroid_cfg.schema())?;

    let mut output = run(&config, transactions, centroids)?;
    output.report.sources = source_reports;

    let artifacts = Artifacts::create(&args.out)
        .with_context(|| format!("Failed to create {}", args.out.display()))?;
    let reproject = reprojector();
    write_artifacts(&output, &artifacts, reproject.as_deref())?;

    info!(out = %args.out.display(), "build complete");
    Ok(())
}

fn run_cells(args: &CellsArgs) -> Result<()> {
    let table = open_snapshots(&args.grid)?;
    let segment = args.segment.segment();

    let rows: Vec<CellOut> = match (args.fill_gaps, args.month.select(&table)) {
        (_, None) => Vec::new(),
        (true, Some(month)) => resolve_map(&table, segment, month, Backfill::within(args.lookback_years))?
            .iter()
            .map(|r| CellOut::new(r.row, r.years_stale))
            .collect(),
        (false, Some(_)) => cells_at(&table, segment, args.month)
            .map(|(_, rows)| rows.into_iter().map(|r| CellOut::new(r, 0)).collect())
            .unwrap_or_default(),
    };
    if rows.is_empty() {
        warn!(segment = %segment, month = %args.month, "no rows");
    }
    print_json(&rows)
}

fn run_delta(args: &DeltaArgs) -> Result<()> {
    let table = open_snapshots(&args.grid)?;
    let segment = args.segment.segment();
    let rows = match &args.cell {
        Some(key) => {
            let cell = parse_cell(args.grid.grid, key)?;
            delta(&table, cell, segment, args.from, args.to, args.min_sales)?
                .into_iter()
                .collect()
        }
        None => delta_map(&table, segment, args.from, args.to, args.min_sales)?,
    };
    let reproject = reprojector();
    let out: Vec<DeltaExport> = rows.iter().map(|r| DeltaExport::new(r, reproject.as_deref())).collect();
    print_json(&out)
}

fn run_overall(args: &OverallArgs) -> Result<()> {
    let table = open_snapshots(&args.grid)?;
    match overall_deltas(&table, args.min_sales)? {
        OverallDeltas::Computed { earliest, latest, rows } => {
            info!(%earliest, %latest, rows = rows.len(), "overall deltas");
            let reproject = reprojector();
            let out: Vec<DeltaExport> = rows
                .iter()
                .filter(|r| args.keeps(r))
                .map(|r| DeltaExport::new(r, reproject.as_deref()))
                .collect();
            print_json(&out)
        }
        OverallDeltas::SingleMonth(month) => bail!("only {month} present, no delta computable"),
        OverallDeltas::Empty => bail!("no rows with at least {} sales", args.min_sales),
    }
}

fn run_outcodes(args: &OutcodesArgs) -> Result<()> {
    let table = open_snapshots(&args.grid)?;
    let artifacts = Artifacts::new(&args.grid.artifacts);
    let lookup = artifacts
        .read_outcodes()
        .with_context(|| format!("Failed to read {}", artifacts.outcode_path().display()))?;
    match rank_outcodes(&table, &lookup, args.segment.segment(), args.month, args.size) {
        Some(ranking) => print_json(&ranking),
        None => bail!("{} grid has no snapshots", args.grid.grid),
    }
}

fn run_postcodes(args: &PostcodesArgs) -> Result<()> {
    let cell = parse_cell(args.grid, &args.cell)?;
    let records = read_centroids(open(&args.centroids)?, &CentroidSchema::default())?;
    let (index, _, _) = build_index(records, &[args.grid]);
    print_json(&index.page(cell, args.offset, args.limit))
}

fn open(path: &Path) -> Result<File> {
    File::open(path).with_context(|| format!("Failed to open {}", path.display()))
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match &cli.command {
        Commands::Build(args) => run_build(args),
        Commands::Cells(args) => run_cells(args),
        Commands::Delta(args) => run_delta(args),
        Commands::OverallDeltas(args) => run_overall(args),
        Commands::Outcodes(args) => run_outcodes(args),
        Commands::Postcodes(args) => run_postcodes(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("brickgrid").chain(args.iter().copied()))
    }

    #[test]
    fn zero_min_sales_is_rejected() {
        assert!(parse(&["delta", "--from", "2023-01", "--to", "2024-01", "--min-sales", "0"]).is_err());
        assert!(parse(&["overall-deltas", "--min-sales", "0"]).is_err());
        assert!(parse(&["overall-deltas", "--min-sales", "1"]).is_ok());
    }

    #[test]
    fn overall_deltas_filter_by_segment() {
        let cli = parse(&["overall-deltas", "--property-type", "D"]).unwrap();
        let Commands::OverallDeltas(args) = cli.command else {
            panic!("expected overall-deltas");
        };
        assert_eq!(args.new_build, None);

        let row = |property_type, new_build| DeltaRow {
            resolution: Resolution::Km25,
            gx: 0,
            gy: 0,
            property_type,
            new_build,
            end_month_t0: "2023-01".parse().unwrap(),
            end_month_t1: "2024-01".parse().unwrap(),
            price_at_t0: 100.0,
            sales_at_t0: 5,
            price_at_t1: 110.0,
            sales_at_t1: 5,
            delta_abs: 10.0,
            delta_pct: Some(10.0),
            years_between: 1,
        };
        assert!(args.keeps(&row(PropertyType::Detached, NewBuild::Yes)));
        assert!(args.keeps(&row(PropertyType::Detached, NewBuild::All)));
        assert!(!args.keeps(&row(PropertyType::Flat, NewBuild::No)));
        assert!(!args.keeps(&row(PropertyType::All, NewBuild::All)));
    }
}
