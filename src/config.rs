//! Run configuration.
//!
//! Every stage receives the same explicit `PipelineConfig`; nothing is read from
//! ambient state. The indicator schema (source column, output name, orientation,
//! missing-value rule) is declared here and validated once at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Legacy output formats cap indicator column names at this many characters.
pub const MAX_INDICATOR_NAME: usize = 8;

/// Ranking direction of an indicator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    /// Higher raw value is worse; the largest value ranks highest.
    #[default]
    Ascending,
    /// Higher raw value is better (tree canopy); the smallest value ranks highest.
    Descending,
}

/// What an absent source row means for an indicator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissingValue {
    /// Missing data, kept as null.
    #[default]
    Null,
    /// The measurement is legitimately zero when no row exists (flood extent, sea-level coverage).
    Zero,
}

/// Which unit column a source table joins on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKey {
    /// The unit's own identifier (block-group level sources).
    Unit,
    /// The parent identifier (tract level sources joined onto block groups).
    Parent,
}

/// Spatial join match rule passed through to the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchOption {
    #[default]
    LargestOverlap,
    FirstIntersect,
}

/// How the engine merges joined fields when several features overlap one unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "rule")]
pub enum MergeRule {
    #[default]
    First,
    Join { delimiter: String },
}

/// How a group rule compares a unit's label.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    #[default]
    Exact,
    Contains,
}

impl MatchRule {
    pub fn matches(self, pattern: &str, label: &str) -> bool {
        match self {
            MatchRule::Exact => label == pattern,
            MatchRule::Contains => label.contains(pattern),
        }
    }
}

/// Null handling for a percentile scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NullPolicy {
    /// Units with no raw value get a null score.
    #[default]
    Reinstate,
    /// Units with no raw value keep the zero they were ranked with.
    ZeroFill,
}

/// One indicator produced by a source.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndicatorSpec {
    /// Output column name (at most 8 characters).
    pub name: String,
    /// Source column, when it differs from `name` (tabular sources only).
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub orientation: Orientation,
    #[serde(default)]
    pub missing: MissingValue,
}

impl IndicatorSpec {
    pub fn new(name: &str, orientation: Orientation) -> Self {
        Self {
            name: name.to_string(),
            column: None,
            orientation,
            missing: MissingValue::Null,
        }
    }

    /// Column to read from the source file.
    pub fn source_column(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.name)
    }
}

/// CSV filtered to the region's states, metric columns renamed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableSource {
    pub path: PathBuf,
    pub key_column: String,
    pub key: JoinKey,
    #[serde(default)]
    pub state_column: Option<String>,
    /// Numeric columns carried into the output without ranking (e.g. ACSTOTPOP).
    #[serde(default)]
    pub keep_columns: Vec<String>,
    pub indicators: Vec<IndicatorSpec>,
}

/// Bucketed risk counts averaged into a single score (First Street flood/heat).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RiskFactorSource {
    pub path: PathBuf,
    /// Lowercase metric stem: reads `count_<metric>factor1..10`.
    pub metric: String,
    #[serde(default = "default_fips")]
    pub key_column: String,
    #[serde(default = "default_parent_key")]
    pub key: JoinKey,
    #[serde(default)]
    pub state_column: Option<String>,
    pub indicator: IndicatorSpec,
}

/// Zonal mean of a 0-100 raster, discounted by land fraction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RasterSource {
    pub raster: String,
    #[serde(default = "default_valid_min")]
    pub valid_min: f64,
    #[serde(default = "default_valid_max")]
    pub valid_max: f64,
    pub indicator: IndicatorSpec,
}

/// Interpolated inundation fraction for a target sea-level rise.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeaLevelSource {
    /// Depth layers are named `<layer_prefix>_<depth>ft`.
    pub layer_prefix: String,
    pub target_depth_ft: f64,
    pub indicator: IndicatorSpec,
}

/// Adapter-specific part of a source declaration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Adapter {
    Table(TableSource),
    RiskFactor(RiskFactorSource),
    Raster(RasterSource),
    SeaLevel(SeaLevelSource),
}

fn default_fips() -> String {
    "fips".to_string()
}

fn default_parent_key() -> JoinKey {
    JoinKey::Parent
}

fn default_valid_min() -> f64 {
    0.0
}

fn default_valid_max() -> f64 {
    100.0
}

/// A declared input dataset.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// Citation appended to the `DataSource` column.
    pub data_source: String,
    /// Citation year(s) appended to the `SourceYear` column.
    pub source_year: String,
    #[serde(flatten)]
    pub adapter: Adapter,
}

impl SourceConfig {
    /// Indicators this source produces, in declaration order.
    pub fn indicators(&self) -> Vec<&IndicatorSpec> {
        match &self.adapter {
            Adapter::Table(table) => table.indicators.iter().collect(),
            Adapter::RiskFactor(risk) => vec![&risk.indicator],
            Adapter::Raster(raster) => vec![&raster.indicator],
            Adapter::SeaLevel(slr) => vec![&slr.indicator],
        }
    }

    /// Carried, unranked columns.
    pub fn keep_columns(&self) -> &[String] {
        match &self.adapter {
            Adapter::Table(table) => &table.keep_columns,
            _ => &[],
        }
    }
}

/// Reporting region.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegionConfig {
    pub states: Vec<String>,
    /// Digits in a unit id (12 for block groups, 11 for tracts).
    #[serde(default = "default_unit_width")]
    pub unit_id_width: usize,
    /// Drop units with zero land area.
    #[serde(default)]
    pub clip_to_land: bool,
    /// Unit ids removed from the keyspace.
    #[serde(default)]
    pub exclude_units: Vec<String>,
}

fn default_unit_width() -> usize {
    12
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            states: vec![
                "Rhode Island".to_string(),
                "Connecticut".to_string(),
                "Massachusetts".to_string(),
            ],
            unit_id_width: 12,
            clip_to_land: true,
            exclude_units: Vec::new(),
        }
    }
}

/// Boundary layer and the field names used to resolve unit attributes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BoundaryConfig {
    pub layer: String,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default = "default_land_field")]
    pub land_field: String,
    #[serde(default = "default_water_field")]
    pub water_field: String,
    #[serde(default = "default_state_field")]
    pub state_field: String,
    #[serde(default = "default_town_field")]
    pub town_field: String,
    #[serde(default = "default_study_area_field")]
    pub study_area_field: String,
    pub data_source: String,
    pub source_year: String,
}

fn default_id_field() -> String {
    "GEOID".to_string()
}

fn default_land_field() -> String {
    "ALAND".to_string()
}

fn default_water_field() -> String {
    "AWATER".to_string()
}

fn default_state_field() -> String {
    "State".to_string()
}

fn default_town_field() -> String {
    "Town".to_string()
}

fn default_study_area_field() -> String {
    "Study_Area".to_string()
}

/// A spatial join applied to the boundary layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpatialJoinConfig {
    pub layer: String,
    #[serde(default)]
    pub match_option: MatchOption,
    #[serde(default)]
    pub merge_rule: MergeRule,
    pub fields: Vec<String>,
    pub data_source: String,
    pub source_year: String,
}

/// Study-area membership and its percentile scheme.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StudyAreaConfig {
    /// Label given to units that fall in no study area.
    #[serde(default = "default_outside_label")]
    pub outside_label: String,
    pub members: Vec<String>,
    #[serde(default)]
    pub match_rule: MatchRule,
    #[serde(default)]
    pub nulls: NullPolicy,
}

fn default_outside_label() -> String {
    "Outside Study Area".to_string()
}

impl StudyAreaConfig {
    /// Whether a unit's study-area label selects it as a member.
    pub fn contains(&self, label: &str) -> bool {
        self.members
            .iter()
            .any(|member| self.match_rule.matches(member, label))
    }
}

/// Which percentile schemes to compute and how their columns are prefixed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PercentileConfig {
    #[serde(default = "default_true")]
    pub state: bool,
    #[serde(default = "default_true")]
    pub study_area: bool,
    #[serde(default = "default_state_prefix")]
    pub state_prefix: String,
    #[serde(default = "default_study_area_prefix")]
    pub study_area_prefix: String,
}

fn default_true() -> bool {
    true
}

fn default_state_prefix() -> String {
    "P_".to_string()
}

fn default_study_area_prefix() -> String {
    "N_".to_string()
}

impl Default for PercentileConfig {
    fn default() -> Self {
        Self {
            state: true,
            study_area: true,
            state_prefix: default_state_prefix(),
            study_area_prefix: default_study_area_prefix(),
        }
    }
}

/// Output file format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Csv,
    Tsv,
    Json,
}

/// Which assembled table a target writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportScope {
    Region,
    StudyArea,
}

/// One output file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportTarget {
    pub file: String,
    pub scope: ExportScope,
    pub format: ExportFormat,
    /// Text written in place of null (`NoData`, `999999`). Absent means the format's own null.
    #[serde(default)]
    pub null_sentinel: Option<String>,
}

/// Output directory, table layout and provenance columns.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub targets: Vec<ExportTarget>,
    #[serde(default = "default_year_column")]
    pub year_column: String,
    pub reporting_year: i32,
    /// Joined attributes (beyond State/Town) copied into the output.
    #[serde(default)]
    pub attribute_columns: Vec<String>,
    /// File name for the list of study-area towns.
    #[serde(default)]
    pub town_list: Option<String>,
    /// Overrides the accumulated `DataSource` citation.
    #[serde(default)]
    pub data_source: Option<String>,
    /// Overrides the accumulated `SourceYear` citation.
    #[serde(default)]
    pub source_year: Option<String>,
    /// Write a JSON metadata sidecar next to each target.
    #[serde(default = "default_true")]
    pub metadata_sidecar: bool,
}

fn default_year_column() -> String {
    "NBEPYear".to_string()
}

/// Descriptive metadata written alongside each output.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_title_prefix")]
    pub title_prefix: String,
    pub program: String,
    /// Year of the primary indicator release (EJSCREEN).
    pub indicator_year: i32,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub credits: String,
    #[serde(default)]
    pub access_constraints: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_title_prefix() -> String {
    "EJMETRICS".to_string()
}

/// Where the engine finds the tables exported from the desktop GIS.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    pub exports_dir: PathBuf,
}

/// Complete configuration for one run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub region: RegionConfig,
    pub boundary: BoundaryConfig,
    #[serde(default)]
    pub joins: Vec<SpatialJoinConfig>,
    pub sources: Vec<SourceConfig>,
    pub study_area: StudyAreaConfig,
    #[serde(default)]
    pub percentiles: PercentileConfig,
    pub output: OutputConfig,
    pub metadata: MetadataConfig,
    pub engine: EngineConfig,
}

impl PipelineConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&text).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })?;
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the declared schema before any data is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.region.states.is_empty() {
            return Err(ConfigError::Invalid("region.states is empty".to_string()));
        }
        if !(2..=19).contains(&self.region.unit_id_width) {
            return Err(ConfigError::Invalid(
                "region.unit_id_width must be between 2 and 19".to_string(),
            ));
        }
        if self.sources.is_empty() {
            return Err(ConfigError::Invalid("no sources declared".to_string()));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            let indicators = source.indicators();
            if indicators.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "source '{}' declares no indicators",
                    source.name
                )));
            }
            for indicator in indicators {
                let name = indicator.name.as_str();
                if name.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "source '{}' has an unnamed indicator",
                        source.name
                    )));
                }
                if name.chars().count() > MAX_INDICATOR_NAME {
                    return Err(ConfigError::NameTooLong(name.to_string()));
                }
                if !seen.insert(name.to_string()) {
                    return Err(ConfigError::DuplicateIndicator(name.to_string()));
                }
            }
            for column in source.keep_columns() {
                if !seen.insert(column.clone()) {
                    return Err(ConfigError::DuplicateIndicator(column.clone()));
                }
            }
            match &source.adapter {
                Adapter::SeaLevel(slr) => {
                    if !slr.target_depth_ft.is_finite() || slr.target_depth_ft < 0.0 {
                        return Err(ConfigError::Invalid(format!(
                            "source '{}': target_depth_ft must be a non-negative number",
                            source.name
                        )));
                    }
                }
                Adapter::Raster(raster) => {
                    if raster.valid_min > raster.valid_max {
                        return Err(ConfigError::Invalid(format!(
                            "source '{}': valid_min is above valid_max",
                            source.name
                        )));
                    }
                }
                Adapter::RiskFactor(risk) => {
                    if risk.metric.is_empty() {
                        return Err(ConfigError::Invalid(format!(
                            "source '{}': metric is empty",
                            source.name
                        )));
                    }
                }
                Adapter::Table(_) => {}
            }
        }

        if self.study_area.members.is_empty() {
            return Err(ConfigError::Invalid("study_area.members is empty".to_string()));
        }
        if self.percentiles.state_prefix == self.percentiles.study_area_prefix {
            return Err(ConfigError::Invalid(
                "state and study-area percentile prefixes must differ".to_string(),
            ));
        }
        if self.output.year_column.is_empty() {
            return Err(ConfigError::Invalid("output.year_column is empty".to_string()));
        }
        if self.output.targets.is_empty() {
            return Err(ConfigError::Invalid("no export targets declared".to_string()));
        }
        let mut files = HashSet::new();
        for target in &self.output.targets {
            if !files.insert(target.file.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "export target '{}' is declared twice",
                    target.file
                )));
            }
        }
        Ok(())
    }

    /// All indicators in declaration order, paired with their source.
    pub fn indicators(&self) -> Vec<(&SourceConfig, &IndicatorSpec)> {
        self.sources
            .iter()
            .flat_map(|s| s.indicators().into_iter().map(move |i| (s, i)))
            .collect()
    }

    /// Write the annotated default configuration to `path`.
    pub fn write_default(path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| ConfigError::Write(e.to_string()))?;
            }
        }
        fs::write(path, DEFAULT_CONFIG).map_err(|e| ConfigError::Write(e.to_string()))
    }
}

/// Annotated configuration reproducing the 2023 Narragansett Bay run.
pub const DEFAULT_CONFIG: &str = r#"# ejmetrics pipeline configuration

[region]
states = ["Rhode Island", "Connecticut", "Massachusetts"]
unit_id_width = 12
clip_to_land = true
exclude_units = []

[boundary]
layer = "block_groups"
id_field = "GEOID"
land_field = "ALAND"
water_field = "AWATER"
data_source = "Census"
source_year = "2022"

[[joins]]
layer = "towns"
match_option = "largest_overlap"
fields = ["Town", "State"]
data_source = "MassGIS; RIGIS; CTDEEP"
source_year = "2013, 2014, 2020; 2016, 2014; 2005, 2006"

[[joins]]
layer = "watersheds"
match_option = "largest_overlap"
fields = ["huc10", "name"]
data_source = "USGS WBD"
source_year = "2023"

[[joins]]
layer = "study_areas"
match_option = "largest_overlap"
fields = ["Study_Area"]
data_source = "NBEP"
source_year = "2017"

[[sources]]
name = "epa"
kind = "table"
data_source = "EPA"
source_year = "2016-2020, 2022"
path = "tabular_data/source_data/EJSCREEN_2022_StatePct_with_AS_CNMI_GU_VI.csv"
key_column = "ID"
key = "unit"
state_column = "STATE_NAME"
keep_columns = ["ACSTOTPOP"]
indicators = [
    { name = "MINORPCT" },
    { name = "LWINCPCT", column = "LOWINCPCT" },
    { name = "UNEMPPCT" },
    { name = "LNGISPCT", column = "LINGISOPCT" },
    { name = "LESHSPCT", column = "LESSHSPCT" },
    { name = "UNDR5PCT", column = "UNDER5PCT" },
    { name = "OVR64PCT", column = "OVER64PCT" },
    { name = "PM25" },
    { name = "OZONE" },
    { name = "DSLPM" },
    { name = "PTRAF" },
    { name = "LDPNT", column = "PRE1960PCT" },
    { name = "PNPL" },
    { name = "PRMP" },
    { name = "PTSDF" },
    { name = "UST" },
    { name = "PWDIS" },
]

[[sources]]
name = "cdc"
kind = "table"
data_source = "CDC"
source_year = "2019, 2020"
path = "tabular_data/source_data/PLACES__Census_Tract_Data__GIS_Friendly_Format___2022_release.csv"
key_column = "TractFIPS"
key = "parent"
state_column = "StateDesc"
indicators = [
    { name = "ASTHMA", column = "CASTHMA_CrudePrev" },
    { name = "BPHIGH", column = "BPHIGH_CrudePrev" },
    { name = "CANCER", column = "CANCER_CrudePrev" },
    { name = "DIABE", column = "DIABETES_CrudePrev" },
    { name = "MHEALTH", column = "MHLTH_CrudePrev" },
]

[[sources]]
name = "nlcd_tree"
kind = "raster"
data_source = "NLCD, USFS"
source_year = "2016"
raster = "nlcd_2016_treecanopy"
indicator = { name = "TREE", orientation = "descending" }

[[sources]]
name = "nlcd_impervious"
kind = "raster"
data_source = "NLCD"
source_year = "2019"
raster = "nlcd_2019_impervious"
indicator = { name = "IMPER" }

[[sources]]
name = "noaa_slr"
kind = "sea_level"
data_source = "NOAA"
source_year = "2019"
layer_prefix = "noaa_slr_depth"
target_depth_ft = 1.6
indicator = { name = "SLR", missing = "zero" }

[[sources]]
name = "first_street_flood"
kind = "risk_factor"
data_source = "First Street"
source_year = "2022"
path = "tabular_data/source_data/flood_v2.1_summary_fsf_flood_tract_summary.csv"
metric = "flood"
indicator = { name = "FLOOD" }

[[sources]]
name = "first_street_heat"
kind = "risk_factor"
data_source = "First Street"
source_year = "2022"
path = "tabular_data/source_data/heat_v1.1_summary_fsf_heat_tract_summary.csv"
metric = "heat"
indicator = { name = "HEAT" }

[study_area]
outside_label = "Outside Study Area"
members = [
    "Narragansett Bay Watershed",
    "Little Narragansett Bay Watershed",
    "Southwest Coastal Ponds Watershed",
]
match_rule = "exact"
# "reinstate" nulls study-area scores for units with no raw value, as the state scheme does.
nulls = "reinstate"

[percentiles]
state = true
study_area = true
state_prefix = "P_"
study_area_prefix = "N_"

[output]
dir = "tabular_data/final_data"
year_column = "NBEPYear"
reporting_year = 2023
town_list = "study_area_towns.csv"

[[output.targets]]
file = "regional_EJdata.csv"
scope = "region"
format = "csv"
null_sentinel = "NoData"

[[output.targets]]
file = "NBEP_EJdata.csv"
scope = "study_area"
format = "csv"
null_sentinel = "NoData"

[[output.targets]]
file = "EJMETRICS_2023_NBEP2023.tsv"
scope = "study_area"
format = "tsv"
null_sentinel = "999999"

[metadata]
title_prefix = "EJMETRICS"
program = "NBEP"
indicator_year = 2023
summary = "Environmental justice metrics in the Narragansett Bay region at the U.S. Census block group scale."
description = "Data from the U.S. EPA EJSCREEN is supplemented with data from CDC PLACES, NLCD, First Street Foundation, and NOAA. State and regional percentiles were calculated for each indicator. This data is intended for general planning, graphic display, and GIS analysis."
credits = "U.S. EPA EJSCREEN; CDC PLACES; National Land Cover Database; First Street Foundation; NOAA; Narragansett Bay Estuary Program"
access_constraints = "This dataset is provided as is, under the CC BY-NC-SA 4.0 license."
tags = ["environmental justice", "EJSCREEN", "population vulnerability"]

[engine]
exports_dir = "gis_data/exports"
"#;
