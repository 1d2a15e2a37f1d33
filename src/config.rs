use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    grid::Resolution,
    ingest::{CsvSource, SchemaMapping, ScotlandSource, SourceAdapter},
    month::Month,
    postcode_index::CentroidSchema,
    rollup::RollupConfig,
};

/// The file as written. Everything is optional; see [`EngineConfig`] for the
/// validated form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    /// Keep only months at or after the latest month minus this many years.
    #[serde(default)]
    pub history_years: Option<u32>,
    #[serde(default = "default_delta_min_sales")]
    pub delta_min_sales: u32,
    #[serde(default = "default_grids", rename = "grid")]
    pub grids: Vec<GridConfig>,
    #[serde(default, rename = "source")]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub centroids: Option<CentroidConfig>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            history_years: None,
            delta_min_sales: default_delta_min_sales(),
            grids: default_grids(),
            sources: Vec::new(),
            centroids: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    pub size: u32,
    /// Defaults to 1 for the 1km grid and 10 otherwise.
    #[serde(default)]
    pub years_back: Option<u32>,
    #[serde(default = "default_min_sales")]
    pub min_sales: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    PricePaid,
    Scotland,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub path: PathBuf,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub has_headers: bool,
    #[serde(default)]
    pub align_to_latest: Option<Month>,
    /// Defaults to the headerless price-paid layout.
    #[serde(default)]
    pub columns: Option<SchemaMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentroidConfig {
    pub path: PathBuf,
    #[serde(default = "default_postcode_column")]
    pub postcode: String,
    #[serde(default = "default_x_column")]
    pub x: String,
    #[serde(default = "default_y_column")]
    pub y: String,
}

impl CentroidConfig {
    pub fn schema(&self) -> CentroidSchema {
        CentroidSchema {
            postcode: self.postcode.clone(),
            x: self.x.clone(),
            y: self.y.clone(),
        }
    }
}

fn default_delta_min_sales() -> u32 {
    5
}

fn default_min_sales() -> u32 {
    RollupConfig::default().min_sales
}

fn default_grids() -> Vec<GridConfig> {
    Resolution::ALL
        .iter()
        .map(|r| GridConfig {
            size: r.meters(),
            years_back: None,
            min_sales: default_min_sales(),
        })
        .collect()
}

fn default_postcode_column() -> String {
    CentroidSchema::default().postcode
}

fn default_x_column() -> String {
    CentroidSchema::default().x
}

fn default_y_column() -> String {
    CentroidSchema::default().y
}

fn default_years_back(resolution: Resolution) -> u32 {
    match resolution {
        Resolution::Km1 => 1,
        _ => RollupConfig::default().years_back,
    }
}

/// Reads a TOML config. A missing file is an error; use
/// [`FileConfig::default`] to run without one.
pub fn load_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridSpec {
    pub resolution: Resolution,
    pub rollup: RollupConfig,
}

/// Validated configuration. Building one is the only check; nothing
/// downstream re-validates.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub history_years: Option<u32>,
    pub delta_min_sales: u32,
    pub grids: Vec<GridSpec>,
    pub sources: Vec<SourceConfig>,
    pub centroids: Option<CentroidConfig>,
}

impl TryFrom<FileConfig> for EngineConfig {
    type Error = ConfigError;

    fn try_from(file: FileConfig) -> Result<Self, Self::Error> {
        if file.grids.is_empty() {
            return Err(ConfigError::NoResolutions);
        }
        if file.delta_min_sales == 0 {
            return Err(ConfigError::NonPositive {
                field: "delta_min_sales",
                value: 0,
            });
        }

        let mut seen = HashSet::new();
        let mut grids = Vec::with_capacity(file.grids.len());
        for grid in &file.grids {
            let resolution = Resolution::try_from(grid.size)?;
            if !seen.insert(resolution) {
                return Err(ConfigError::DuplicateResolution(grid.size));
            }
            if grid.min_sales == 0 {
                return Err(ConfigError::NonPositive {
                    field: "min_sales",
                    value: 0,
                });
            }
            grids.push(GridSpec {
                resolution,
                rollup: RollupConfig {
                    min_sales: grid.min_sales,
                    years_back: grid.years_back.unwrap_or_else(|| default_years_back(resolution)),
                },
            });
        }

        for source in &file.sources {
            if source.kind != SourceKind::Scotland && source.align_to_latest.is_some() {
                return Err(ConfigError::AlignmentNotSupported(source_name(source)));
            }
        }

        Ok(Self {
            history_years: file.history_years,
            delta_min_sales: file.delta_min_sales,
            grids,
            sources: file.sources,
            centroids: file.centroids,
        })
    }
}

fn source_name(source: &SourceConfig) -> String {
    source.name.clone().unwrap_or_else(|| {
        source
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| source.path.display().to_string())
    })
}

impl EngineConfig {
    pub fn resolutions(&self) -> Vec<Resolution> {
        self.grids.iter().map(|g| g.resolution).collect()
    }

    pub fn grid(&self, resolution: Resolution) -> Option<&GridSpec> {
        self.grids.iter().find(|g| g.resolution == resolution)
    }

    /// One adapter per `[[source]]`, in file order.
    pub fn adapters(&self) -> Vec<Box<dyn SourceAdapter>> {
        self.sources
            .iter()
            .map(|source| {
                let csv = CsvSource {
                    name: source_name(source),
                    path: source.path.clone(),
                    mapping: source.columns.clone().unwrap_or_else(SchemaMapping::price_paid),
                    has_headers: source.has_headers,
                };
                match source.kind {
                    SourceKind::PricePaid => Box::new(csv) as Box<dyn SourceAdapter>,
                    SourceKind::Scotland => Box::new(ScotlandSource {
                        csv,
                        align_to: source.align_to_latest,
                    }),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::Column;

    fn engine(toml: &str) -> Result<EngineConfig, ConfigError> {
        let file: FileConfig = toml::from_str(toml).unwrap();
        EngineConfig::try_from(file)
    }

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = engine("").unwrap();
        assert_eq!(cfg.resolutions(), Resolution::ALL.to_vec());
        assert_eq!(cfg.history_years, None);
        assert_eq!(cfg.delta_min_sales, 5);
        assert_eq!(cfg.grid(Resolution::Km1).unwrap().rollup.years_back, 1);
        assert_eq!(cfg.grid(Resolution::Km25).unwrap().rollup, RollupConfig::default());
    }

    #[test]
    fn parses_sources_and_centroids() {
        let cfg = engine(
            r#"
            history_years = 5

            [[grid]]
            size = 5000
            years_back = 3
            min_sales = 1

            [[source]]
            kind = "price_paid"
            path = "data/pp-complete.txt"

            [[source]]
            kind = "scotland"
            name = "ros"
            path = "data/scotland.csv"
            has_headers = true
            align_to_latest = "2025-12"
            [source.columns]
            id = "Ref"
            price = "Price"
            date = "Date"
            postcode = "Postcode"
            property_type = "Type"
            new_build = 4

            [centroids]
            path = "data/onspd.csv"
            x = "EAST1M"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.history_years, Some(5));
        assert_eq!(cfg.grids.len(), 1);
        assert_eq!(cfg.grids[0].rollup, RollupConfig { min_sales: 1, years_back: 3 });
        let scot = &cfg.sources[1];
        assert_eq!(scot.align_to_latest, Some("2025-12".parse().unwrap()));
        let cols = scot.columns.as_ref().unwrap();
        assert_eq!(cols.price, Column::Name("Price".into()));
        assert_eq!(cols.new_build, Column::Index(4));

        let adapters = cfg.adapters();
        assert_eq!(adapters[0].name(), "pp-complete");
        assert_eq!(adapters[1].name(), "ros");

        let schema = cfg.centroids.as_ref().unwrap().schema();
        assert_eq!(schema.x, "EAST1M");
        assert_eq!(schema.postcode, "PCDS");
    }

    #[test]
    fn rejects_bad_grids() {
        assert!(matches!(
            engine("[[grid]]\nsize = 2000\n"),
            Err(ConfigError::UnknownResolution(2000))
        ));
        assert!(matches!(
            engine("[[grid]]\nsize = 1000\n[[grid]]\nsize = 1000\n"),
            Err(ConfigError::DuplicateResolution(1000))
        ));
        assert!(matches!(
            engine("[[grid]]\nsize = 1000\nmin_sales = 0\n"),
            Err(ConfigError::NonPositive { field: "min_sales", .. })
        ));
        assert!(matches!(
            engine("grid = []\n"),
            Err(ConfigError::NoResolutions)
        ));
        assert!(matches!(
            engine("delta_min_sales = 0\n"),
            Err(ConfigError::NonPositive { field: "delta_min_sales", .. })
        ));
    }

    #[test]
    fn negative_lookback_does_not_parse() {
        assert!(toml::from_str::<FileConfig>("[[grid]]\nsize = 1000\nyears_back = -1\n").is_err());
    }

    #[test]
    fn alignment_is_scotland_only() {
        let err = engine("[[source]]\nkind = \"price_paid\"\npath = \"a.csv\"\nalign_to_latest = \"2024-01\"\n");
        assert!(matches!(err, Err(ConfigError::AlignmentNotSupported(name)) if name == "a"));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
