use std::{
    collections::{hash_map::Entry, BTreeSet, HashMap, HashSet},
    io::Read,
};

use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::{
    error::IngestError,
    grid::{Cell, CellSet, Resolution},
    transaction::{normalize_postcode, outcode, Transaction},
};

/// Largest page served by [`PostcodeIndex::page`].
pub const MAX_PAGE: usize = 100;

/// One row of the centroid source, in the fixed planar projection.
#[derive(Debug, Clone, PartialEq)]
pub struct CentroidRecord {
    pub postcode: String,
    pub x: Option<f64>,
    pub y: Option<f64>,
}

/// Header names of the centroid CSV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CentroidSchema {
    pub postcode: String,
    pub x: String,
    pub y: String,
}

impl Default for CentroidSchema {
    fn default() -> Self {
        Self {
            postcode: "PCDS".to_owned(),
            x: "x".to_owned(),
            y: "y".to_owned(),
        }
    }
}

/// Reads centroid rows. Unparseable coordinates become `None` and are
/// excluded later by [`build_index`]. Rows the CSV reader cannot decode are
/// kept as empty records so the index report still counts them as unlocated.
pub fn read_centroids<R: Read>(reader: R, schema: &CentroidSchema) -> Result<Vec<CentroidRecord>, IngestError> {
    let name = "centroids";
    let csv_err = |error| IngestError::Csv {
        source_name: name.to_owned(),
        error,
    };

    let mut rdr = ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = rdr.headers().map_err(csv_err)?.clone();
    let col = |wanted: &str| {
        headers
            .iter()
            .position(|h| h.trim() == wanted)
            .ok_or_else(|| IngestError::MissingColumn {
                source_name: name.to_owned(),
                column: wanted.to_owned(),
            })
    };
    let (pc, x, y) = (col(&schema.postcode)?, col(&schema.x)?, col(&schema.y)?);

    let mut out = Vec::new();
    for result in rdr.records() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                debug!("{}: unreadable row: {}", name, e);
                out.push(CentroidRecord {
                    postcode: String::new(),
                    x: None,
                    y: None,
                });
                continue;
            }
        };
        let coord = |i: usize| record.get(i).and_then(|v| v.trim().parse::<f64>().ok());
        out.push(CentroidRecord {
            postcode: record.get(pc).unwrap_or_default().to_owned(),
            x: coord(x),
            y: coord(y),
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    /// Postcode as it appeared in the source.
    pub postcode: String,
    pub x: f64,
    pub y: f64,
    pub cells: CellSet,
}

/// Immutable postcode key -> location lookup.
#[derive(Debug, Clone, Default)]
pub struct PostcodeIndex {
    resolutions: Vec<Resolution>,
    entries: HashMap<String, IndexEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutcodeRow {
    pub outcode: String,
    pub cells: Vec<Cell>,
}

/// Outcode -> distinct cell combinations, for coarse drilldown.
#[derive(Debug, Clone, Default)]
pub struct OutcodeLookup {
    rows: Vec<OutcodeRow>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub read: usize,
    pub indexed: usize,
    pub duplicates: usize,
    pub unlocated: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostcodePage {
    pub cell: String,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub has_more: bool,
    pub postcodes: Vec<String>,
}

/// Builds the postcode index and the outcode lookup in one pass. The first
/// occurrence of a postcode key wins; records without finite coordinates are
/// left out of both tables.
#[instrument(skip(records))]
pub fn build_index<I>(records: I, resolutions: &[Resolution]) -> (PostcodeIndex, OutcodeLookup, IndexReport)
where
    I: IntoIterator<Item = CentroidRecord>,
{
    let mut report = IndexReport::default();
    let mut entries: HashMap<String, IndexEntry> = HashMap::new();
    let mut seen_outcodes: HashSet<(String, CellSet)> = HashSet::new();
    let mut outcode_rows = Vec::new();

    for record in records {
        report.read += 1;
        let cells = match (record.x, record.y) {
            (Some(x), Some(y)) => CellSet::bin_all(x, y, resolutions).map(|c| (x, y, c)),
            _ => None,
        };
        let Some((x, y, cells)) = cells else {
            report.unlocated += 1;
            continue;
        };

        if let Some(oc) = outcode(&record.postcode) {
            let key = (oc, cells.clone());
            if !seen_outcodes.contains(&key) {
                outcode_rows.push(OutcodeRow {
                    outcode: key.0.clone(),
                    cells: key.1.iter().copied().collect(),
                });
                seen_outcodes.insert(key);
            }
        }

        let key = normalize_postcode(&record.postcode);
        if key.is_empty() {
            report.unlocated += 1;
            continue;
        }
        match entries.entry(key) {
            Entry::Occupied(_) => report.duplicates += 1,
            Entry::Vacant(v) => {
                v.insert(IndexEntry {
                    postcode: record.postcode,
                    x,
                    y,
                    cells,
                });
                report.indexed += 1;
            }
        }
    }

    info!(
        read = report.read,
        indexed = report.indexed,
        duplicates = report.duplicates,
        unlocated = report.unlocated,
        outcode_rows = outcode_rows.len(),
        "postcode index built"
    );

    (
        PostcodeIndex {
            resolutions: resolutions.to_vec(),
            entries,
        },
        OutcodeLookup { rows: outcode_rows },
        report,
    )
}

impl PostcodeIndex {
    pub fn resolutions(&self) -> &[Resolution] {
        &self.resolutions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up by any spelling of the postcode.
    pub fn get(&self, postcode: &str) -> Option<&IndexEntry> {
        self.entries.get(&normalize_postcode(postcode))
    }

    /// Sorted postcodes whose centroid falls in `cell`.
    pub fn postcodes_in(&self, cell: Cell) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .entries
            .values()
            .filter(|e| e.cells.get(cell.resolution) == Some(cell))
            .map(|e| e.postcode.as_str())
            .collect();
        out.sort_unstable();
        out
    }

    /// A window of [`Self::postcodes_in`]; `limit` is clamped to `1..=MAX_PAGE`.
    pub fn page(&self, cell: Cell, offset: usize, limit: usize) -> PostcodePage {
        let limit = limit.clamp(1, MAX_PAGE);
        let all = self.postcodes_in(cell);
        let postcodes = all.iter().skip(offset).take(limit).map(|s| s.to_string()).collect();
        PostcodePage {
            cell: cell.key(),
            total: all.len(),
            offset,
            limit,
            has_more: offset.saturating_add(limit) < all.len(),
            postcodes,
        }
    }
}

impl OutcodeLookup {
    /// Wraps rows read back from an artifact.
    pub fn from_rows(rows: Vec<OutcodeRow>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[OutcodeRow] {
        &self.rows
    }

    pub fn cells_for(&self, outcode: &str, resolution: Resolution) -> BTreeSet<Cell> {
        let wanted = outcode.trim().to_uppercase();
        self.rows
            .iter()
            .filter(|r| r.outcode == wanted)
            .flat_map(|r| r.cells.iter().copied())
            .filter(|c| c.resolution == resolution)
            .collect()
    }

    /// Inverts the lookup at one resolution: cell -> outcodes touching it.
    pub fn outcodes_by_cell(&self, resolution: Resolution) -> HashMap<Cell, BTreeSet<String>> {
        let mut out: HashMap<Cell, BTreeSet<String>> = HashMap::new();
        for row in &self.rows {
            for cell in row.cells.iter().filter(|c| c.resolution == resolution) {
                out.entry(*cell).or_default().insert(row.outcode.clone());
            }
        }
        out
    }
}

/// A transaction after the left join; `cells` is `None` when its postcode is
/// not in the index.
#[derive(Debug, Clone, PartialEq)]
pub struct LocatedTransaction {
    pub transaction: Transaction,
    pub cells: Option<CellSet>,
}

impl LocatedTransaction {
    pub fn cell(&self, resolution: Resolution) -> Option<Cell> {
        self.cells.as_ref().and_then(|c| c.get(resolution))
    }
}

/// Left-joins transactions onto the index by postcode key. Returns the joined
/// rows and the number that found no location.
#[instrument(skip_all)]
pub fn locate(transactions: Vec<Transaction>, index: &PostcodeIndex) -> (Vec<LocatedTransaction>, usize) {
    let mut unmatched = 0;
    let located: Vec<LocatedTransaction> = transactions
        .into_iter()
        .map(|transaction| {
            let cells = index.entries.get(&transaction.postcode_key).map(|e| e.cells.clone());
            if cells.is_none() {
                unmatched += 1;
            }
            LocatedTransaction { transaction, cells }
        })
        .collect();
    info!(rows = located.len(), unmatched, "transactions located");
    (located, unmatched)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(pc: &str, x: Option<f64>, y: Option<f64>) -> CentroidRecord {
        CentroidRecord {
            postcode: pc.to_owned(),
            x,
            y,
        }
    }

    #[test]
    fn first_occurrence_wins() {
        let (index, _, report) = build_index(
            vec![
                rec("AB1 2CD", Some(1_500.0), Some(2_500.0)),
                rec("ab12cd", Some(90_000.0), Some(90_000.0)),
            ],
            &Resolution::ALL,
        );
        assert_eq!(index.len(), 1);
        assert_eq!(report.duplicates, 1);
        let e = index.get("AB12CD").unwrap();
        assert_eq!((e.x, e.y), (1_500.0, 2_500.0));
        assert_eq!(e.cells.get(Resolution::Km1).unwrap().key(), "1000_2000");
    }

    #[test]
    fn undecodable_centroid_rows_are_counted() {
        let mut csv = b"PCDS,x,y\nAB1 2CD,1500,2500\n".to_vec();
        csv.extend_from_slice(b"AB1 \xFF3EF,1600,2600\n");
        csv.extend_from_slice(b"AB1 4GH,1700,2700\n");

        let records = read_centroids(csv.as_slice(), &CentroidSchema::default()).unwrap();
        assert_eq!(records.len(), 3);
        let (index, _, report) = build_index(records, &[Resolution::Km1]);
        assert_eq!(report.read, 3);
        assert_eq!(report.indexed, 2);
        assert_eq!(report.unlocated, 1);
        assert!(index.get("AB14GH").is_some());
    }

    #[test]
    fn unlocated_postcodes_are_absent() {
        let (index, outcodes, report) = build_index(
            vec![rec("ZZ1 1ZZ", None, Some(1.0)), rec("ZZ1 2ZZ", Some(f64::NAN), Some(1.0))],
            &Resolution::ALL,
        );
        assert!(index.get("ZZ1 1ZZ").is_none());
        assert!(index.is_empty());
        assert!(outcodes.rows().is_empty());
        assert_eq!(report.unlocated, 2);
    }

    #[test]
    fn outcode_rows_dedupe_by_cell_combination() {
        let (_, outcodes, _) = build_index(
            vec![
                rec("M1 1AA", Some(100.0), Some(100.0)),
                rec("M1 1AB", Some(200.0), Some(200.0)),
                rec("M1 2AA", Some(1_100.0), Some(100.0)),
                rec("M2 1AA", Some(100.0), Some(100.0)),
            ],
            &[Resolution::Km1, Resolution::Km25],
        );
        assert_eq!(outcodes.rows().len(), 3);
        let cells = outcodes.cells_for("m1", Resolution::Km1);
        assert_eq!(cells.len(), 2);
        let by_cell = outcodes.outcodes_by_cell(Resolution::Km25);
        let origin = Cell::from_key(Resolution::Km25, "0_0").unwrap();
        assert_eq!(by_cell[&origin].len(), 2);
    }

    #[test]
    fn pages_postcodes_in_cell() {
        let records = (0..15).map(|i| rec(&format!("B{i:02} 1AA"), Some(10.0 * i as f64), Some(5.0)));
        let (index, _, _) = build_index(records, &[Resolution::Km1]);
        let cell = Cell::from_key(Resolution::Km1, "0_0").unwrap();

        let page = index.page(cell, 10, 10);
        assert_eq!(page.total, 15);
        assert_eq!(page.postcodes.len(), 5);
        assert!(!page.has_more);
        assert_eq!(page.postcodes[0], "B10 1AA");

        let page = index.page(cell, 0, 0);
        assert_eq!(page.limit, 1);
        assert!(page.has_more);
    }

    #[test]
    fn reads_centroid_csv() {
        let data = "x,y,PCDS\n530000.5,180000,SW1A 1AA\nbad,1,SW1A 2AA\n";
        let rows = read_centroids(data.as_bytes(), &CentroidSchema::default()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].x, Some(530_000.5));
        assert_eq!(rows[1].x, None);
    }
}
