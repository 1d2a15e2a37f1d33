//! Source adapters. Each adapter turns one raw feed into a stream of validated
//! [`Transaction`]s plus counts of what it had to drop.

use std::{
    fs::File,
    io::Read,
    ops::AddAssign,
    path::PathBuf,
};

use chrono::{NaiveDate, NaiveDateTime};
use csv::{ReaderBuilder, StringRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    error::IngestError,
    month::Month,
    segment::{NewBuild, PropertyType},
    transaction::{normalize_postcode, Transaction},
};

/// Record status that marks a current (non-deleted, non-amended) entry.
pub const CURRENT_STATUS: &str = "A";

/// Where a field lives in a raw row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Column {
    Index(usize),
    Name(String),
}

/// Declared mapping from transaction fields to raw columns. Resolved once
/// against the header row; there is no guessing between candidate names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMapping {
    pub id: Column,
    pub price: Column,
    pub date: Column,
    pub postcode: Column,
    pub property_type: Column,
    pub new_build: Column,
    /// Feeds without a status column are treated as all-current.
    #[serde(default)]
    pub record_status: Option<Column>,
}

impl SchemaMapping {
    /// Headerless 16-column England & Wales price-paid layout.
    pub fn price_paid() -> Self {
        Self {
            id: Column::Index(0),
            price: Column::Index(1),
            date: Column::Index(2),
            postcode: Column::Index(3),
            property_type: Column::Index(4),
            new_build: Column::Index(5),
            record_status: Some(Column::Index(15)),
        }
    }

    fn resolve(&self, source_name: &str, headers: Option<&StringRecord>) -> Result<ResolvedSchema, IngestError> {
        let find = |col: &Column| -> Result<usize, IngestError> {
            match col {
                Column::Index(i) => Ok(*i),
                Column::Name(name) => headers
                    .and_then(|h| h.iter().position(|f| f.trim() == name))
                    .ok_or_else(|| IngestError::MissingColumn {
                        source_name: source_name.to_owned(),
                        column: name.clone(),
                    }),
            }
        };

        Ok(ResolvedSchema {
            id: find(&self.id)?,
            price: find(&self.price)?,
            date: find(&self.date)?,
            postcode: find(&self.postcode)?,
            property_type: find(&self.property_type)?,
            new_build: find(&self.new_build)?,
            record_status: self.record_status.as_ref().map(find).transpose()?,
        })
    }
}

struct ResolvedSchema {
    id: usize,
    price: usize,
    date: usize,
    postcode: usize,
    property_type: usize,
    new_build: usize,
    record_status: Option<usize>,
}

/// Why records were dropped, for data-quality auditing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionCounts {
    pub read: usize,
    pub kept: usize,
    pub malformed_row: usize,
    pub not_current: usize,
    pub bad_date: usize,
    pub bad_price: usize,
    pub bad_category: usize,
    pub missing_postcode: usize,
}

impl ExclusionCounts {
    pub fn excluded(&self) -> usize {
        self.malformed_row
            + self.not_current
            + self.bad_date
            + self.bad_price
            + self.bad_category
            + self.missing_postcode
    }
}

impl AddAssign for ExclusionCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.read += rhs.read;
        self.kept += rhs.kept;
        self.malformed_row += rhs.malformed_row;
        self.not_current += rhs.not_current;
        self.bad_date += rhs.bad_date;
        self.bad_price += rhs.bad_price;
        self.bad_category += rhs.bad_category;
        self.missing_postcode += rhs.missing_postcode;
    }
}

/// Output of one adapter.
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub transactions: Vec<Transaction>,
    pub exclusions: ExclusionCounts,
}

/// Anything that can produce a conforming transaction stream.
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn load(&self) -> Result<SourceBatch, IngestError>;
}

/// England & Wales price-paid style CSV feed.
#[derive(Debug, Clone)]
pub struct CsvSource {
    pub name: String,
    pub path: PathBuf,
    pub mapping: SchemaMapping,
    pub has_headers: bool,
}

impl CsvSource {
    pub fn price_paid(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            mapping: SchemaMapping::price_paid(),
            has_headers: false,
        }
    }
}

impl SourceAdapter for CsvSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self) -> Result<SourceBatch, IngestError> {
        let file = File::open(&self.path).map_err(|error| IngestError::Io {
            source_name: self.name.clone(),
            error,
        })?;
        read_transactions(&self.name, file, &self.mapping, self.has_headers)
    }
}

/// Scotland feed: same parsing as [`CsvSource`], optionally followed by
/// [`align_to_month`].
#[derive(Debug, Clone)]
pub struct ScotlandSource {
    pub csv: CsvSource,
    pub align_to: Option<Month>,
}

impl SourceAdapter for ScotlandSource {
    fn name(&self) -> &str {
        &self.csv.name
    }

    fn load(&self) -> Result<SourceBatch, IngestError> {
        let mut batch = self.csv.load()?;
        if let Some(target) = self.align_to {
            batch.transactions = align_to_month(batch.transactions, target);
        }
        Ok(batch)
    }
}

/// An already-normalized stream supplied by an external collaborator.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    pub name: String,
    pub transactions: Vec<Transaction>,
}

impl SourceAdapter for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self) -> Result<SourceBatch, IngestError> {
        let n = self.transactions.len();
        Ok(SourceBatch {
            transactions: self.transactions.clone(),
            exclusions: ExclusionCounts {
                read: n,
                kept: n,
                ..Default::default()
            },
        })
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    for fmt in ["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt.date());
        }
    }
    ["%Y-%m-%d", "%d/%m/%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

/// Positive whole amount in minor units. Fractional or non-finite values are
/// rejected rather than rounded.
fn parse_price(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Ok(p) = raw.parse::<u64>() {
        return (p > 0).then_some(p);
    }
    let f = raw.parse::<f64>().ok()?;
    (f.is_finite() && f > 0.0 && f.fract() == 0.0 && f < u64::MAX as f64).then_some(f as u64)
}

enum Rejection {
    Malformed,
    NotCurrent,
    Date,
    Price,
    Category,
    Postcode,
}

fn parse_row(record: &StringRecord, schema: &ResolvedSchema) -> Result<Transaction, Rejection> {
    let field = |i: usize| record.get(i).ok_or(Rejection::Malformed);

    if let Some(i) = schema.record_status {
        if field(i)?.trim() != CURRENT_STATUS {
            return Err(Rejection::NotCurrent);
        }
    }

    let date = parse_date(field(schema.date)?).ok_or(Rejection::Date)?;
    let price = parse_price(field(schema.price)?).ok_or(Rejection::Price)?;

    let property_type = field(schema.property_type)?
        .parse::<PropertyType>()
        .map_err(|_| Rejection::Category)?;
    let new_build = field(schema.new_build)?
        .parse::<NewBuild>()
        .map_err(|_| Rejection::Category)?;
    // Wildcards are roll-up labels, never transaction values.
    if property_type == PropertyType::All || new_build == NewBuild::All {
        return Err(Rejection::Category);
    }

    let postcode = field(schema.postcode)?;
    if normalize_postcode(postcode).is_empty() {
        return Err(Rejection::Postcode);
    }

    let id = field(schema.id)?.trim().trim_matches(|c| c == '{' || c == '}');
    Ok(Transaction::new(id, price, date, postcode, property_type, new_build))
}

/// Parses and validates a CSV feed. Row-level defects are counted and
/// skipped; only source-level failures are errors.
#[instrument(skip(reader, mapping))]
pub fn read_transactions<R: Read>(
    source_name: &str,
    reader: R,
    mapping: &SchemaMapping,
    has_headers: bool,
) -> Result<SourceBatch, IngestError> {
    let csv_err = |error| IngestError::Csv {
        source_name: source_name.to_owned(),
        error,
    };

    let mut rdr = ReaderBuilder::new()
        .has_headers(has_headers)
        .flexible(true)
        .from_reader(reader);

    let headers = if has_headers {
        Some(rdr.headers().map_err(csv_err)?.clone())
    } else {
        None
    };
    let schema = mapping.resolve(source_name, headers.as_ref())?;

    let mut batch = SourceBatch::default();
    let counts = &mut batch.exclusions;

    for result in rdr.records() {
        counts.read += 1;
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                debug!("{}: unreadable row: {}", source_name, e);
                counts.malformed_row += 1;
                continue;
            }
        };

        match parse_row(&record, &schema) {
            Ok(tx) => {
                counts.kept += 1;
                batch.transactions.push(tx);
            }
            Err(Rejection::Malformed) => counts.malformed_row += 1,
            Err(Rejection::NotCurrent) => counts.not_current += 1,
            Err(Rejection::Date) => counts.bad_date += 1,
            Err(Rejection::Price) => counts.bad_price += 1,
            Err(Rejection::Category) => counts.bad_category += 1,
            Err(Rejection::Postcode) => counts.missing_postcode += 1,
        }
    }

    info!(
        source = source_name,
        read = counts.read,
        kept = counts.kept,
        excluded = counts.excluded(),
        "source parsed"
    );
    Ok(batch)
}

/// Moves every date by the month offset between the feed's latest month and
/// `target`, clamping the day to the target month's length.
pub fn align_to_month(transactions: Vec<Transaction>, target: Month) -> Vec<Transaction> {
    let Some(latest) = transactions.iter().map(|t| t.month).max() else {
        return transactions;
    };
    let offset = latest.months_until(&target);
    if offset == 0 {
        return transactions;
    }
    warn!(%latest, %target, offset, "shifting source dates onto target calendar");

    transactions
        .into_iter()
        .map(|mut t| {
            t.date = Month::shift_date(t.date, offset);
            t.month = Month::from_date(t.date);
            t
        })
        .collect()
}

/// Keeps months at or after `latest - years`, where `latest` is the newest
/// month present.
pub fn apply_history_window(transactions: Vec<Transaction>, years: u32) -> (Vec<Transaction>, usize) {
    let Some(latest) = transactions.iter().map(|t| t.month).max() else {
        return (transactions, 0);
    };
    let cutoff = latest.minus_years(years);
    let before = transactions.len();
    let kept: Vec<Transaction> = transactions.into_iter().filter(|t| t.month >= cutoff).collect();
    let dropped = before - kept.len();
    info!(%cutoff, dropped, "history window applied");
    (kept, dropped)
}
