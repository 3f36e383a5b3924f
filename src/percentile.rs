//! Percentile ranking.
//!
//! Scores are fractional average-tie ranks scaled to 0..=100 and truncated, so
//! they match historical outputs exactly. A scheme partitions units into groups
//! (one per state, or the single study-area group); each unit is ranked only
//! against the other members of its group.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::config::{MatchRule, NullPolicy, Orientation, PipelineConfig};
use crate::error::PercentileError;
use crate::keyspace::{GeoUnit, Keyspace};

/// Fractional rank in `(0, 1]` for each value, ties sharing their average rank.
///
/// `Ascending` gives the largest value 1.0, `Descending` the smallest.
pub fn pct_rank(values: &[f64], orientation: Orientation) -> Vec<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        let cmp = values[a].total_cmp(&values[b]);
        match orientation {
            Orientation::Ascending => cmp,
            Orientation::Descending => cmp.reverse(),
        }
    });

    let mut ranks = vec![0.0; n];
    let mut start = 0;
    while start < n {
        let mut end = start + 1;
        while end < n && values[order[end]] == values[order[start]] {
            end += 1;
        }
        // Positions start+1..=end share the mean of their 1-based ranks.
        let average = (start + 1 + end) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = average / n as f64;
        }
        start = end;
    }
    ranks
}

/// `trunc(100 × rank)`.
pub fn scale(rank: f64) -> f64 {
    (100.0 * rank).trunc()
}

/// Maps a unit's label to a group.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupRule {
    pub pattern: String,
    pub rule: MatchRule,
    pub group: usize,
}

impl GroupRule {
    pub fn matches(&self, label: &str) -> bool {
        self.rule.matches(&self.pattern, label)
    }
}

/// Exclusive group assignment for every unit of a scheme.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Grouping {
    pub groups: Vec<Option<usize>>,
    pub group_count: usize,
    /// Units matching no rule.
    pub unmatched: usize,
    /// Units matching rules of more than one group; they keep the first.
    pub ambiguous: usize,
}

impl Grouping {
    pub fn assign<'a, I>(labels: I, rules: &[GroupRule]) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let group_count = rules.iter().map(|r| r.group + 1).max().unwrap_or(0);
        let mut grouping = Grouping {
            group_count,
            ..Default::default()
        };
        for label in labels {
            let mut matched = rules.iter().filter(|r| r.matches(label)).map(|r| r.group);
            let first = matched.next();
            if let Some(group) = first {
                if matched.any(|other| other != group) {
                    grouping.ambiguous += 1;
                }
            } else {
                grouping.unmatched += 1;
            }
            grouping.groups.push(first);
        }
        grouping
    }

    pub fn members(&self, group: usize) -> Vec<usize> {
        self.groups
            .iter()
            .enumerate()
            .filter(|(_, g)| **g == Some(group))
            .map(|(idx, _)| idx)
            .collect()
    }
}

/// A grouping plus the rules for scoring inside it.
#[derive(Clone, Debug)]
pub struct Scheme {
    pub name: &'static str,
    pub prefix: String,
    pub grouping: Grouping,
    pub nulls: NullPolicy,
}

impl Scheme {
    /// One group per configured state, matched exactly on `GeoUnit::state`.
    pub fn by_state(config: &PipelineConfig, units: &[GeoUnit]) -> Self {
        let rules: Vec<GroupRule> = config
            .region
            .states
            .iter()
            .enumerate()
            .map(|(group, state)| GroupRule {
                pattern: state.clone(),
                rule: MatchRule::Exact,
                group,
            })
            .collect();
        Self {
            name: "state",
            prefix: config.percentiles.state_prefix.clone(),
            grouping: Grouping::assign(units.iter().map(|u| u.state.as_str()), &rules),
            nulls: NullPolicy::Reinstate,
        }
    }

    /// A single group of units whose study area matches any configured member.
    pub fn study_area(config: &PipelineConfig, units: &[GeoUnit]) -> Self {
        let study_area = &config.study_area;
        let rules: Vec<GroupRule> = study_area
            .members
            .iter()
            .map(|member| GroupRule {
                pattern: member.clone(),
                rule: study_area.match_rule,
                group: 0,
            })
            .collect();
        Self {
            name: "study_area",
            prefix: config.percentiles.study_area_prefix.clone(),
            grouping: Grouping::assign(units.iter().map(|u| u.study_area.as_str()), &rules),
            nulls: study_area.nulls,
        }
    }

    /// Score one indicator column aligned with the scheme's units.
    ///
    /// Per-group contributions are accumulated into a zeroed column; the
    /// exclusive assignment means each unit receives exactly one.
    pub fn score(&self, raw: &[Option<f64>], orientation: Orientation) -> Vec<Option<f64>> {
        let mut scores: Vec<Option<f64>> = self
            .grouping
            .groups
            .iter()
            .map(|g| g.map(|_| 0.0))
            .collect();

        for group in 0..self.grouping.group_count {
            let members = self.grouping.members(group);
            let ranked: Vec<usize> = members.iter().copied().filter(|&i| raw[i].is_some()).collect();
            if ranked.is_empty() {
                debug!(scheme = self.name, group, members = members.len(), "no values to rank");
                continue;
            }
            let values: Vec<f64> = ranked.iter().filter_map(|&i| raw[i]).collect();
            for (&idx, rank) in ranked.iter().zip(pct_rank(&values, orientation)) {
                if let Some(score) = scores[idx].as_mut() {
                    *score += scale(rank);
                }
            }
        }

        if self.nulls == NullPolicy::Reinstate {
            for (score, value) in scores.iter_mut().zip(raw) {
                if value.is_none() {
                    *score = None;
                }
            }
        }
        scores
    }
}

/// Percentile columns for every indicator in one scheme, named `<prefix><indicator>`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SchemeColumns {
    pub columns: Vec<(String, Vec<Option<f64>>)>,
}

/// Raw indicator columns aligned with the keyspace.
pub trait IndicatorColumns {
    fn indicator(&self, name: &str) -> Option<&[Option<f64>]>;
}

impl IndicatorColumns for HashMap<String, Vec<Option<f64>>> {
    fn indicator(&self, name: &str) -> Option<&[Option<f64>]> {
        self.get(name).map(Vec::as_slice)
    }
}

/// Compute every enabled scheme for every declared indicator.
///
/// Fails before ranking anything if an indicator is absent or misaligned.
pub fn compute_percentiles(
    config: &PipelineConfig,
    keyspace: &Keyspace,
    raw: &dyn IndicatorColumns,
) -> Result<Vec<SchemeColumns>, PercentileError> {
    let indicators = config.indicators();
    for (_, indicator) in &indicators {
        let column = raw
            .indicator(&indicator.name)
            .ok_or_else(|| PercentileError::MissingIndicator(indicator.name.clone()))?;
        if column.len() != keyspace.len() {
            return Err(PercentileError::LengthMismatch {
                name: indicator.name.clone(),
                expected: keyspace.len(),
                actual: column.len(),
            });
        }
    }

    let mut schemes = Vec::new();
    if config.percentiles.state {
        schemes.push(Scheme::by_state(config, keyspace.units()));
    }
    if config.percentiles.study_area {
        schemes.push(Scheme::study_area(config, keyspace.units()));
    }

    let mut results = Vec::with_capacity(schemes.len());
    for scheme in &schemes {
        let grouping = &scheme.grouping;
        if grouping.unmatched > 0 {
            warn!(scheme = scheme.name, units = grouping.unmatched, "units in no group get null percentiles");
        }
        if grouping.ambiguous > 0 {
            warn!(scheme = scheme.name, units = grouping.ambiguous, "units matching several groups were assigned to the first");
        }
        info!(scheme = scheme.name, groups = grouping.group_count, indicators = indicators.len(), "computing percentiles");

        let mut columns = SchemeColumns::default();
        for (_, indicator) in &indicators {
            let values = raw.indicator(&indicator.name).unwrap_or(&[]);
            let scores = scheme.score(values, indicator.orientation);
            columns.columns.push((format!("{}{}", scheme.prefix, indicator.name), scores));
        }
        results.push(columns);
    }
    Ok(results)
}
