//! Unit keyspace: one row per census geographic unit.
//!
//! Built once per run from the boundary layer plus the configured spatial joins.
//! Rows are never added or removed after construction; later stages only append
//! columns aligned to `Keyspace::units()`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use tracing::{debug, info, warn};

use crate::config::{PipelineConfig, StudyAreaConfig};
use crate::engine::{GeoEngine, SpatialJoinRequest};
use crate::error::KeyspaceError;

/// Longest identifier whose numeric value fits in a `u64`.
pub const MAX_UNIT_ID_WIDTH: usize = 19;

/// Fixed-width numeric census identifier.
///
/// The text (with its leading zeros) is what gets exported. The numeric value is
/// only used to match source tables whose identifiers lost their leading zeros.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UnitId {
    text: String,
    key: u64,
}

impl UnitId {
    pub fn parse(raw: &str, width: usize) -> Result<Self, KeyspaceError> {
        let text = raw.trim();
        let invalid = || KeyspaceError::InvalidUnitId {
            id: raw.to_string(),
            width,
        };
        if width > MAX_UNIT_ID_WIDTH
            || text.len() != width
            || !text.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }
        let key = text.parse::<u64>().map_err(|_| invalid())?;
        Ok(Self {
            text: text.to_string(),
            key,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Numeric join key.
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Identifier of the enclosing unit: the id without its final digit.
    pub fn parent(&self) -> ParentId {
        // Width is at least 2, so the remainder is a non-empty digit string.
        ParentId(self.key / 10)
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Numeric identifier of the enclosing tract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParentId(pub u64);

/// Parse a join key from a source table.
///
/// Accepts plain digits and the float rendering spreadsheet tools produce
/// (`44007010100.0`). Anything else is not a key.
pub fn numeric_key(raw: &str) -> Option<u64> {
    let text = raw.trim();
    let digits = match text.split_once('.') {
        Some((int, frac)) if frac.bytes().all(|b| b == b'0') => int,
        Some(_) => return None,
        None => text,
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// One census geographic unit.
#[derive(Clone, Debug, PartialEq)]
pub struct GeoUnit {
    pub id: UnitId,
    pub parent: ParentId,
    pub state: String,
    pub town: String,
    pub study_area: String,
    pub land_area: f64,
    pub water_area: f64,
    /// Other joined attributes (watershed name, huc10, ...).
    pub attributes: BTreeMap<String, String>,
}

impl GeoUnit {
    pub fn new(id: UnitId, state: &str, town: &str, study_area: &str, land_area: f64, water_area: f64) -> Self {
        Self {
            parent: id.parent(),
            id,
            state: state.to_string(),
            town: town.to_string(),
            study_area: study_area.to_string(),
            land_area,
            water_area,
            attributes: BTreeMap::new(),
        }
    }

    /// `state ⧺ town`, the key used to select study-area towns.
    pub fn town_code(&self) -> String {
        format!("{}{}", self.state, self.town)
    }

    /// Share of the unit's area that is land. `None` when the unit has no area.
    pub fn land_fraction(&self) -> Option<f64> {
        let total = self.land_area + self.water_area;
        (total > 0.0).then(|| self.land_area / total)
    }
}

/// A town that has at least one unit inside the study area.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct StudyAreaTown {
    pub state: String,
    pub town: String,
}

impl StudyAreaTown {
    pub fn code(&self) -> String {
        format!("{}{}", self.state, self.town)
    }
}

/// All units of a run, with lookup by unit and parent key.
#[derive(Clone, Debug, Default)]
pub struct Keyspace {
    units: Vec<GeoUnit>,
    by_unit: HashMap<u64, usize>,
    by_parent: HashMap<u64, Vec<usize>>,
}

impl Keyspace {
    /// Index a list of units, rejecting duplicate ids.
    pub fn from_units(units: Vec<GeoUnit>) -> Result<Self, KeyspaceError> {
        let mut by_unit = HashMap::with_capacity(units.len());
        let mut by_parent: HashMap<u64, Vec<usize>> = HashMap::new();
        for (idx, unit) in units.iter().enumerate() {
            if by_unit.insert(unit.id.key(), idx).is_some() {
                return Err(KeyspaceError::DuplicateUnit(unit.id.to_string()));
            }
            by_parent.entry(unit.parent.0).or_default().push(idx);
        }
        Ok(Self {
            units,
            by_unit,
            by_parent,
        })
    }

    /// Resolve the boundary layer and spatial joins into the run's keyspace.
    pub fn build(config: &PipelineConfig, engine: &dyn GeoEngine) -> Result<Self, KeyspaceError> {
        let boundary = &config.boundary;
        let width = config.region.unit_id_width;

        info!(layer = %boundary.layer, "reading boundary layer");
        let records = engine.boundary(boundary)?;
        if records.is_empty() {
            return Err(KeyspaceError::Empty);
        }

        let mut attributes: HashMap<u64, BTreeMap<String, String>> = HashMap::new();
        for join in &config.joins {
            info!(layer = %join.layer, match_option = ?join.match_option, "adding spatial join");
            let joined = engine.spatial_join(&SpatialJoinRequest {
                target: &boundary.layer,
                join: &join.layer,
                id_field: &boundary.id_field,
                match_option: join.match_option,
                merge_rule: &join.merge_rule,
                fields: &join.fields,
            })?;
            let mut unmatched = 0usize;
            for record in joined {
                match numeric_key(&record.unit_id) {
                    Some(key) => attributes.entry(key).or_default().extend(record.fields),
                    None => unmatched += 1,
                }
            }
            if unmatched > 0 {
                warn!(layer = %join.layer, unmatched, "join rows with unreadable unit ids were ignored");
            }
        }

        let excluded: HashSet<&str> = config.region.exclude_units.iter().map(|s| s.trim()).collect();
        let mut units = Vec::with_capacity(records.len());
        let mut dropped_water = 0usize;
        let mut missing_area = 0usize;
        for record in records {
            let id = UnitId::parse(&record.unit_id, width)?;
            if excluded.contains(id.as_str()) {
                debug!(unit = %id, "excluded by configuration");
                continue;
            }
            if record.land_area.is_none() || record.water_area.is_none() {
                missing_area += 1;
            }
            let land_area = record.land_area.unwrap_or(0.0);
            let water_area = record.water_area.unwrap_or(0.0);
            if config.region.clip_to_land && land_area <= 0.0 {
                dropped_water += 1;
                continue;
            }

            let mut attrs = attributes.remove(&id.key()).unwrap_or_default();
            let state = attrs.remove(&boundary.state_field).unwrap_or_default();
            let town = attrs.remove(&boundary.town_field).unwrap_or_default();
            let study_area = attrs
                .remove(&boundary.study_area_field)
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| config.study_area.outside_label.clone());

            let mut unit = GeoUnit::new(id, &state, &town, &study_area, land_area, water_area);
            unit.attributes = attrs;
            units.push(unit);
        }

        if missing_area > 0 {
            warn!(missing_area, "units with no land or water area were treated as zero");
        }
        if dropped_water > 0 {
            info!(dropped_water, "dropped units with no land area");
        }

        let keyspace = Self::from_units(units)?;
        if keyspace.is_empty() {
            return Err(KeyspaceError::Empty);
        }

        let states: HashSet<&str> = config.region.states.iter().map(String::as_str).collect();
        let outside = keyspace
            .units
            .iter()
            .filter(|u| !states.contains(u.state.as_str()))
            .count();
        if outside > 0 {
            warn!(outside, "units outside the configured states will have no state percentiles");
        }

        info!(units = keyspace.len(), "keyspace ready");
        Ok(keyspace)
    }

    pub fn units(&self) -> &[GeoUnit] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Row index of a unit by numeric key.
    pub fn position(&self, key: u64) -> Option<usize> {
        self.by_unit.get(&key).copied()
    }

    /// Row indices of all units sharing a parent.
    pub fn children(&self, parent: u64) -> &[usize] {
        self.by_parent.get(&parent).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Towns with at least one unit in a member study area, sorted and distinct.
    pub fn study_area_towns(&self, study_area: &StudyAreaConfig) -> Vec<StudyAreaTown> {
        let towns: BTreeSet<StudyAreaTown> = self
            .units
            .iter()
            .filter(|u| study_area.contains(&u.study_area))
            .map(|u| StudyAreaTown {
                state: u.state.clone(),
                town: u.town.clone(),
            })
            .collect();
        towns.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CONFIG;
    use crate::engine::mock::MockEngine;
    use crate::error::EngineError;

    fn config() -> PipelineConfig {
        PipelineConfig::from_toml(DEFAULT_CONFIG).unwrap()
    }

    #[test]
    fn test_unit_id_validation() {
        let id = UnitId::parse("090010101001", 12).unwrap();
        assert_eq!(id.as_str(), "090010101001");
        assert_eq!(id.key(), 90010101001);
        assert_eq!(id.parent(), ParentId(9001010100));

        assert!(UnitId::parse("90010101001", 12).is_err());
        assert!(UnitId::parse("09001010100A", 12).is_err());
        assert!(UnitId::parse("", 12).is_err());
    }

    #[test]
    fn test_numeric_key() {
        assert_eq!(numeric_key("9001010100"), Some(9001010100));
        assert_eq!(numeric_key("09001010100"), Some(9001010100));
        assert_eq!(numeric_key("44007010100.0"), Some(44007010100));
        assert_eq!(numeric_key("44007010100.5"), None);
        assert_eq!(numeric_key("n/a"), None);
        assert_eq!(numeric_key(""), None);
    }

    #[test]
    fn test_land_fraction() {
        let id = UnitId::parse("440070001001", 12).unwrap();
        let unit = GeoUnit::new(id.clone(), "Rhode Island", "Providence", "x", 75.0, 25.0);
        assert_eq!(unit.land_fraction(), Some(0.75));
        let empty = GeoUnit::new(id, "Rhode Island", "Providence", "x", 0.0, 0.0);
        assert_eq!(empty.land_fraction(), None);
    }

    #[test]
    fn test_duplicate_unit_rejected() {
        let id = UnitId::parse("440070001001", 12).unwrap();
        let units = vec![
            GeoUnit::new(id.clone(), "Rhode Island", "A", "x", 1.0, 0.0),
            GeoUnit::new(id, "Rhode Island", "B", "x", 1.0, 0.0),
        ];
        assert!(matches!(
            Keyspace::from_units(units),
            Err(KeyspaceError::DuplicateUnit(_))
        ));
    }

    #[test]
    fn test_build_resolves_joins_and_clips() {
        let engine = MockEngine::default()
            .unit("440070001001", 100.0, 0.0)
            .unit("440070001002", 0.0, 50.0)
            .unit("090010101001", 80.0, 20.0)
            .join("towns", "440070001001", &[("Town", "Providence"), ("State", "Rhode Island")])
            .join("towns", "90010101001", &[("Town", "Greenwich"), ("State", "Connecticut")])
            .join("watersheds", "440070001001", &[("name", "Seekonk River"), ("huc10", "0109000404")])
            .join("study_areas", "440070001001", &[("Study_Area", "Narragansett Bay Watershed")]);

        let keyspace = Keyspace::build(&config(), &engine).unwrap();
        assert_eq!(keyspace.len(), 2);

        let ri = &keyspace.units()[0];
        assert_eq!(ri.town, "Providence");
        assert_eq!(ri.study_area, "Narragansett Bay Watershed");
        assert_eq!(ri.attributes["name"], "Seekonk River");

        // Join matched despite the missing leading zero; export text keeps it.
        let ct = &keyspace.units()[1];
        assert_eq!(ct.id.as_str(), "090010101001");
        assert_eq!(ct.state, "Connecticut");
        assert_eq!(ct.study_area, "Outside Study Area");

        assert_eq!(keyspace.children(ct.parent.0), &[1]);
    }

    #[test]
    fn test_build_rejects_bad_id() {
        let engine = MockEngine::default().unit("4400700010", 1.0, 0.0);
        assert!(matches!(
            Keyspace::build(&config(), &engine),
            Err(KeyspaceError::InvalidUnitId { .. })
        ));
    }

    #[test]
    fn test_engine_failure_surfaces() {
        let mut engine = MockEngine::default().unit("440070001001", 1.0, 0.0);
        engine.fail_join = Some("watersheds".to_string());
        assert!(matches!(
            Keyspace::build(&config(), &engine),
            Err(KeyspaceError::Engine(EngineError::Operation { .. }))
        ));
    }

    #[test]
    fn test_study_area_towns() {
        let mk = |id: &str, state: &str, town: &str, area: &str| {
            GeoUnit::new(UnitId::parse(id, 12).unwrap(), state, town, area, 1.0, 0.0)
        };
        let keyspace = Keyspace::from_units(vec![
            mk("440070001001", "Rhode Island", "Providence", "Narragansett Bay Watershed"),
            mk("440070001002", "Rhode Island", "Providence", "Narragansett Bay Watershed"),
            mk("250050001001", "Massachusetts", "Fall River", "Narragansett Bay Watershed"),
            mk("090010101001", "Connecticut", "Greenwich", "Outside Study Area"),
        ])
        .unwrap();

        let towns = keyspace.study_area_towns(&config().study_area);
        let codes: Vec<String> = towns.iter().map(StudyAreaTown::code).collect();
        assert_eq!(codes, vec!["MassachusettsFall River", "Rhode IslandProvidence"]);
    }

    #[test]
    fn test_non_member_study_area_town_excluded() {
        let mk = |id: &str, town: &str, area: &str| {
            GeoUnit::new(UnitId::parse(id, 12).unwrap(), "Massachusetts", town, area, 1.0, 0.0)
        };
        let keyspace = Keyspace::from_units(vec![
            mk("250050001001", "Fall River", "Narragansett Bay Watershed"),
            mk("250230001001", "Wareham", "Buzzards Bay Watershed"),
        ])
        .unwrap();

        let towns = keyspace.study_area_towns(&config().study_area);
        let codes: Vec<String> = towns.iter().map(StudyAreaTown::code).collect();
        assert_eq!(codes, vec!["MassachusettsFall River"]);
    }
}
