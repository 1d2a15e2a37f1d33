//! Artifact files. Everything the pipeline produces lands in one directory:
//!
//! - `grid_<label>_annual.csv` snapshot rows per resolution
//! - `grid_metadata.json` earliest/latest/count per resolution
//! - `outcode_lookup.csv` outcode to cell per resolution
//! - `grid_<label>_overall_deltas.csv` earliest to latest deltas
//! - `delta_metadata.json`
//! - `build_report.json`

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use csv::{ReaderBuilder, Writer};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    delta::{DeltaMetadata, DeltaRow},
    error::OutputError,
    grid::{Cell, Resolution},
    month::Month,
    postcode_index::{OutcodeLookup, OutcodeRow},
    reproject::{cell_centre, Reproject},
    rollup::{GridMetadata, SnapshotRow, SnapshotTable},
    segment::{NewBuild, PropertyType},
};

/// Delta row as exported, with the cell centre attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaExport {
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
    pub delta_pct: Option<f64>,
    pub years_between: i32,
    pub centre_x: f64,
    pub centre_y: f64,
    pub lon: Option<f64>,
    pub lat: Option<f64>,
}

impl DeltaExport {
    pub fn new(row: &DeltaRow, reproject: Option<&dyn Reproject>) -> Self {
        let centre = cell_centre(row.cell());
        let display = reproject.and_then(|r| r.to_display(centre.x, centre.y));
        Self {
            resolution: row.resolution,
            gx: row.gx,
            gy: row.gy,
            property_type: row.property_type,
            new_build: row.new_build,
            end_month_t0: row.end_month_t0,
            end_month_t1: row.end_month_t1,
            price_at_t0: row.price_at_t0,
            sales_at_t0: row.sales_at_t0,
            price_at_t1: row.price_at_t1,
            sales_at_t1: row.sales_at_t1,
            delta_abs: row.delta_abs,
            delta_pct: row.delta_pct,
            years_between: row.years_between,
            centre_x: centre.x,
            centre_y: centre.y,
            lon: display.map(|d| d.0),
            lat: display.map(|d| d.1),
        }
    }
}

pub fn write_csv<P: AsRef<Path>, T: Serialize>(path: P, rows: impl IntoIterator<Item = T>) -> Result<usize, OutputError> {
    let mut writer = Writer::from_path(path.as_ref())?;
    let mut n = 0;
    for row in rows {
        writer.serialize(row)?;
        n += 1;
    }
    writer.flush()?;
    debug!(path = %path.as_ref().display(), rows = n, "csv written");
    Ok(n)
}

pub fn read_csv<P: AsRef<Path>, T: DeserializeOwned>(path: P) -> Result<Vec<T>, OutputError> {
    let mut rdr = ReaderBuilder::new().from_path(path)?;
    let rows = rdr.deserialize::<T>().collect::<Result<Vec<T>, _>>()?;
    Ok(rows)
}

pub fn write_json<P: AsRef<Path>, T: Serialize + ?Sized>(path: P, value: &T) -> Result<(), OutputError> {
    let file = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}

pub fn read_json<P: AsRef<Path>, T: DeserializeOwned>(path: P) -> Result<T, OutputError> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Outcode lookup in wide form: one `cell_<metres>` column per resolution.
pub fn write_outcodes<P: AsRef<Path>>(path: P, lookup: &OutcodeLookup, resolutions: &[Resolution]) -> Result<usize, OutputError> {
    let mut writer = Writer::from_path(path)?;
    let mut header = vec!["outcode".to_owned()];
    header.extend(resolutions.iter().map(|r| format!("cell_{}", r.meters())));
    writer.write_record(&header)?;

    for row in lookup.rows() {
        let mut record = vec![row.outcode.clone()];
        for res in resolutions {
            let key = row.cells.iter().find(|c| c.resolution == *res).map(Cell::key);
            record.push(key.unwrap_or_default());
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(lookup.rows().len())
}

/// Reads [`write_outcodes`] output. Columns that are not `cell_<metres>` of a
/// known resolution are ignored.
pub fn read_outcodes<P: AsRef<Path>>(path: P) -> Result<OutcodeLookup, OutputError> {
    let mut rdr = ReaderBuilder::new().from_path(path)?;
    let headers = rdr.headers()?.clone();
    let columns: Vec<(usize, Resolution)> = headers
        .iter()
        .enumerate()
        .filter_map(|(i, h)| {
            let metres = h.strip_prefix("cell_")?.parse::<u32>().ok()?;
            Some((i, Resolution::try_from(metres).ok()?))
        })
        .collect();

    let mut rows = Vec::new();
    for record in rdr.records() {
        let record = record?;
        let Some(outcode) = record.get(0) else { continue };
        let cells = columns
            .iter()
            .filter_map(|(i, res)| Cell::from_key(*res, record.get(*i)?))
            .collect();
        rows.push(OutcodeRow {
            outcode: outcode.to_owned(),
            cells,
        });
    }
    Ok(OutcodeLookup::from_rows(rows))
}

/// A directory of artifacts.
#[derive(Debug, Clone)]
pub struct Artifacts {
    dir: PathBuf,
}

impl Artifacts {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn create(dir: impl Into<PathBuf>) -> Result<Self, OutputError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_path(&self, resolution: Resolution) -> PathBuf {
        self.dir.join(format!("grid_{}_annual.csv", resolution.label()))
    }

    pub fn delta_path(&self, resolution: Resolution) -> PathBuf {
        self.dir.join(format!("grid_{}_overall_deltas.csv", resolution.label()))
    }

    pub fn outcode_path(&self) -> PathBuf {
        self.dir.join("outcode_lookup.csv")
    }

    pub fn grid_metadata_path(&self) -> PathBuf {
        self.dir.join("grid_metadata.json")
    }

    pub fn delta_metadata_path(&self) -> PathBuf {
        self.dir.join("delta_metadata.json")
    }

    pub fn report_path(&self) -> PathBuf {
        self.dir.join("build_report.json")
    }

    pub fn write_snapshots(&self, table: &SnapshotTable) -> Result<usize, OutputError> {
        let n = write_csv(self.snapshot_path(table.resolution()), table.rows())?;
        info!(resolution = %table.resolution(), rows = n, "snapshot table written");
        Ok(n)
    }

    pub fn read_snapshots(&self, resolution: Resolution) -> Result<SnapshotTable, OutputError> {
        let rows: Vec<SnapshotRow> = read_csv(self.snapshot_path(resolution))?;
        Ok(SnapshotTable::new(resolution, rows))
    }

    /// Keyed by resolution label; tables without rows are left out.
    pub fn write_grid_metadata<'a>(&self, tables: impl IntoIterator<Item = &'a SnapshotTable>) -> Result<(), OutputError> {
        let meta: BTreeMap<&str, GridMetadata> = tables
            .into_iter()
            .filter_map(|t| Some((t.resolution().label(), t.metadata()?)))
            .collect();
        write_json(self.grid_metadata_path(), &meta)
    }

    pub fn read_grid_metadata(&self) -> Result<BTreeMap<String, GridMetadata>, OutputError> {
        read_json(self.grid_metadata_path())
    }

    pub fn write_outcodes(&self, lookup: &OutcodeLookup, resolutions: &[Resolution]) -> Result<usize, OutputError> {
        write_outcodes(self.outcode_path(), lookup, resolutions)
    }

    pub fn read_outcodes(&self) -> Result<OutcodeLookup, OutputError> {
        read_outcodes(self.outcode_path())
    }

    pub fn write_deltas(
        &self,
        resolution: Resolution,
        rows: &[DeltaRow],
        reproject: Option<&dyn Reproject>,
    ) -> Result<usize, OutputError> {
        write_csv(
            self.delta_path(resolution),
            rows.iter().map(|r| DeltaExport::new(r, reproject)),
        )
    }

    pub fn read_deltas(&self, resolution: Resolution) -> Result<Vec<DeltaExport>, OutputError> {
        read_csv(self.delta_path(resolution))
    }

    pub fn write_delta_metadata(&self, meta: &BTreeMap<&str, DeltaMetadata>) -> Result<(), OutputError> {
        write_json(self.delta_metadata_path(), meta)
    }
}
