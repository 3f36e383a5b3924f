//! One run: keyspace, ingestion, merge, percentiles, export.
//!
//! Stages run in order and fully materialize their output. Any error aborts the
//! run; outputs are only written after every stage before export succeeded.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::info;

use crate::assemble;
use crate::config::PipelineConfig;
use crate::engine::GeoEngine;
use crate::error::PipelineError;
use crate::export::{self, Written};
use crate::ingest::{self, IngestContext};
use crate::keyspace::Keyspace;
use crate::percentile;

/// Paths a run resolves against.
#[derive(Clone, Debug)]
pub struct RunPaths {
    /// Directory relative source paths are resolved against (the config file's directory).
    pub base_dir: PathBuf,
    /// Output directory; overrides `output.dir` when set.
    pub output_dir: Option<PathBuf>,
}

impl RunPaths {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            output_dir: None,
        }
    }

    fn out_dir(&self, config: &PipelineConfig) -> PathBuf {
        match &self.output_dir {
            Some(dir) => dir.clone(),
            None if config.output.dir.is_absolute() => config.output.dir.clone(),
            None => self.base_dir.join(&config.output.dir),
        }
    }
}

/// What a run produced.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub units: usize,
    pub indicators: usize,
    pub study_area_units: usize,
    pub towns: usize,
    pub written: Vec<Written>,
}

pub fn run(
    config: &PipelineConfig,
    engine: &dyn GeoEngine,
    paths: &RunPaths,
) -> Result<RunSummary, PipelineError> {
    let start = Instant::now();
    config.validate()?;

    info!("stage 1/4: building keyspace");
    let keyspace = Keyspace::build(config, engine)?;

    info!("stage 2/4: ingesting {} sources", config.sources.len());
    let ctx = IngestContext {
        config,
        keyspace: &keyspace,
        engine,
        base_dir: &paths.base_dir,
    };
    let tables = ingest::ingest_all(&ctx)?;
    let merged = assemble::merge(config, &keyspace, &tables);
    drop(tables);

    info!("stage 3/4: computing percentiles");
    let percentiles = percentile::compute_percentiles(config, &keyspace, &merged)?;

    info!("stage 4/4: assembling and exporting");
    let region = assemble::region_table(config, &keyspace, &merged, &percentiles)?;
    let study_area = assemble::study_area_table(config, &keyspace, &region);
    let towns = keyspace.study_area_towns(&config.study_area);

    let out_dir = paths.out_dir(config);
    let mut written = export::write_targets(config, &out_dir, &region, &study_area)?;
    if let Some(file) = &config.output.town_list {
        written.push(export::write_town_list(&towns, &out_dir.join(file))?);
    }

    info!(
        units = keyspace.len(),
        files = written.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "run complete"
    );
    Ok(RunSummary {
        units: keyspace.len(),
        indicators: config.indicators().len(),
        study_area_units: study_area.len(),
        towns: towns.len(),
        written,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CONFIG;
    use crate::engine::mock::MockEngine;
    use crate::error::{IngestError, PercentileError};
    use crate::table::{Cell, Table};
    use std::fs;

    const UNITS: [&str; 4] = ["440070001001", "440070001002", "250050001001", "090010101001"];

    fn write_sources(dir: &Path, config: &PipelineConfig) {
        let src = dir.join("tabular_data/source_data");
        fs::create_dir_all(&src).unwrap();

        let epa_cols: Vec<String> = config.sources[0]
            .indicators()
            .iter()
            .map(|i| i.source_column().to_string())
            .collect();
        let mut epa = format!("ID,STATE_NAME,ACSTOTPOP,{}\n", epa_cols.join(","));
        let states = ["Rhode Island", "Rhode Island", "Massachusetts", "Connecticut"];
        for (n, (id, state)) in UNITS.iter().zip(states).enumerate() {
            // Source ids lost their leading zeros.
            let id = id.trim_start_matches('0');
            let values: Vec<String> = (0..epa_cols.len()).map(|c| format!("{}", n * 10 + c)).collect();
            epa.push_str(&format!("{},{},{},{}\n", id, state, 1000 + n, values.join(",")));
        }
        fs::write(src.join("EJSCREEN_2022_StatePct_with_AS_CNMI_GU_VI.csv"), epa).unwrap();

        fs::write(
            src.join("PLACES__Census_Tract_Data__GIS_Friendly_Format___2022_release.csv"),
            "TractFIPS,StateDesc,CASTHMA_CrudePrev,BPHIGH_CrudePrev,CANCER_CrudePrev,DIABETES_CrudePrev,MHLTH_CrudePrev\n\
             44007000100,Rhode Island,10.1,30.2,6.3,9.4,15.5\n\
             25005000100,Massachusetts,11.1,31.2,7.3,10.4,16.5\n\
             9001010100,Connecticut,,29.2,5.3,8.4,14.5\n",
        )
        .unwrap();

        for metric in ["flood", "heat"] {
            let header: Vec<String> = (1..=10).map(|i| format!("count_{}factor{}", metric, i)).collect();
            let body = format!(
                "fips,count_property,{}\n\
                 44007000100,10,10,0,0,0,0,0,0,0,0,0\n\
                 25005000100,4,0,2,0,0,0,0,0,0,0,2\n\
                 9001010100,0,0,0,0,0,0,0,0,0,0,0\n",
                header.join(",")
            );
            let file = if metric == "flood" {
                "flood_v2.1_summary_fsf_flood_tract_summary.csv"
            } else {
                "heat_v1.1_summary_fsf_heat_tract_summary.csv"
            };
            fs::write(src.join(file), body).unwrap();
        }
    }

    fn engine() -> MockEngine {
        let mut engine = MockEngine::default();
        for id in UNITS {
            engine = engine
                .unit(id, 200.0, 50.0)
                .zonal("nlcd_2016_treecanopy", id, 40.0)
                .zonal("nlcd_2019_impervious", id, 10.0);
        }
        engine
            .join("towns", "440070001001", &[("Town", "Providence"), ("State", "Rhode Island")])
            .join("towns", "440070001002", &[("Town", "Providence"), ("State", "Rhode Island")])
            .join("towns", "250050001001", &[("Town", "Fall River"), ("State", "Massachusetts")])
            .join("towns", "090010101001", &[("Town", "Greenwich"), ("State", "Connecticut")])
            .join("study_areas", "440070001001", &[("Study_Area", "Narragansett Bay Watershed")])
            .join("study_areas", "250050001001", &[("Study_Area", "Narragansett Bay Watershed")])
            .band("noaa_slr_depth_1ft", "440070001001", 40.0)
            .band("noaa_slr_depth_2ft", "440070001001", 60.0)
    }

    #[test]
    fn test_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::from_toml(DEFAULT_CONFIG).unwrap();
        write_sources(dir.path(), &config);

        let summary = run(&config, &engine(), &RunPaths::new(dir.path())).unwrap();
        assert_eq!(summary.units, 4);
        assert_eq!(summary.indicators, 27);
        assert_eq!(summary.towns, 2);
        // Providence (both units) and Fall River.
        assert_eq!(summary.study_area_units, 3);
        // Three targets, three sidecars, the town list.
        assert_eq!(summary.written.len(), 7);

        let out = dir.path().join("tabular_data/final_data");
        let region = Table::read_delimited(&out.join("regional_EJdata.csv"), b',', Some("NoData"), &["ID"]).unwrap();
        assert_eq!(region.len(), 4);

        // Leading zeros survive the round trip.
        assert_eq!(region.get(3, "ID"), Some(&Cell::Text("090010101001".to_string())));
        assert_eq!(region.get(0, "ACSTOTPOP"), Some(&Cell::Number(1000.0)));

        // SLR: (40 + 0.6 × 60) / 200; absent units are zero.
        let slr = region.get(0, "SLR").and_then(Cell::as_number).unwrap();
        assert!((slr - 0.38).abs() < 1e-9);
        assert_eq!(region.get(1, "SLR"), Some(&Cell::Number(0.0)));

        // Tract values reach both block groups; missing tract value stays null.
        assert_eq!(region.get(1, "ASTHMA"), Some(&Cell::Number(10.1)));
        assert_eq!(region.get(3, "ASTHMA"), Some(&Cell::Null));
        assert_eq!(region.get(3, "P_ASTHMA"), Some(&Cell::Null));

        // Zero properties gives a null risk score.
        assert_eq!(region.get(0, "FLOOD"), Some(&Cell::Number(1.0)));
        assert_eq!(region.get(3, "FLOOD"), Some(&Cell::Null));

        // Rhode Island has two units; the larger PM25 gets 100.
        assert_eq!(region.get(1, "P_PM25"), Some(&Cell::Number(100.0)));
        assert_eq!(region.get(0, "P_PM25"), Some(&Cell::Number(50.0)));
        // Outside the study area: no study-area percentile.
        assert_eq!(region.get(1, "N_PM25"), Some(&Cell::Null));
        assert_eq!(region.get(2, "N_PM25"), Some(&Cell::Number(100.0)));

        assert_eq!(region.get(0, "NBEPYear"), Some(&Cell::Integer(2023)));
        assert_eq!(
            region.get(0, "Study_Area"),
            Some(&Cell::Text("Narragansett Bay Watershed".to_string()))
        );

        let tsv = fs::read_to_string(out.join("EJMETRICS_2023_NBEP2023.tsv")).unwrap();
        assert!(tsv.contains("999999"));
        assert!(!tsv.contains("NoData"));

        let towns = fs::read_to_string(out.join("study_area_towns.csv")).unwrap();
        assert!(towns.contains("MassachusettsFall River"));
    }

    #[test]
    fn test_output_dir_override() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::from_toml(DEFAULT_CONFIG).unwrap();
        write_sources(dir.path(), &config);
        let out = dir.path().join("override");
        let paths = RunPaths {
            base_dir: dir.path().to_path_buf(),
            output_dir: Some(out.clone()),
        };
        run(&config, &engine(), &paths).unwrap();
        assert!(out.join("NBEP_EJdata.csv").exists());
    }

    #[test]
    fn test_missing_source_aborts_before_export() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::from_toml(DEFAULT_CONFIG).unwrap();
        let err = run(&config, &engine(), &RunPaths::new(dir.path())).unwrap_err();
        assert!(matches!(err, PipelineError::Ingest(IngestError::MissingFile { .. })));
        assert!(!dir.path().join("tabular_data/final_data").exists());
    }

    #[test]
    fn test_missing_indicator_is_percentile_error() {
        let config = PipelineConfig::from_toml(DEFAULT_CONFIG).unwrap();
        let keyspace = Keyspace::build(&config, &engine()).unwrap();
        let merged = assemble::merge(&config, &keyspace, &[]);
        let err = percentile::compute_percentiles(&config, &keyspace, &merged).unwrap_err();
        assert!(matches!(err, PercentileError::MissingIndicator(_)));
    }
}
