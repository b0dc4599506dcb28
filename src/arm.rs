//! Arms: candidate inference parameter sets and the trust region around a baseline.

use serde::{Deserialize, Serialize};

/// Id of the baseline arm in every generated grid.
pub const BASELINE_ARM_ID: &str = "baseline";

const TEMPERATURE_RANGE: (f64, f64) = (0.0, 2.0);
const PENALTY_RANGE: (f64, f64) = (-2.0, 2.0);
const FLOAT_TOL: f64 = 1e-9;

/// Inference parameters handed to the model client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub temperature: f64,
    /// Nucleus threshold. `None` means the client default (treated as `1.0`).
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub frequency_penalty: f64,
    #[serde(default)]
    pub presence_penalty: f64,
    pub max_tokens: u32,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for ParameterSet {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: Some(0.9),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            max_tokens: 1000,
            stop_sequences: Vec::new(),
            seed: None,
        }
    }
}

impl ParameterSet {
    pub fn effective_top_p(&self) -> f64 {
        self.top_p.unwrap_or(1.0)
    }

    /// All numeric fields are finite and inside their valid ranges.
    pub fn is_well_formed(&self) -> bool {
        let in_range = |v: f64, (lo, hi): (f64, f64)| v.is_finite() && v >= lo && v <= hi;
        in_range(self.temperature, TEMPERATURE_RANGE)
            && self
                .top_p
                .map(|p| p.is_finite() && p > 0.0 && p <= 1.0)
                .unwrap_or(true)
            && in_range(self.frequency_penalty, PENALTY_RANGE)
            && in_range(self.presence_penalty, PENALTY_RANGE)
            && self.max_tokens > 0
    }

    fn same_numeric(&self, other: &ParameterSet) -> bool {
        (self.temperature - other.temperature).abs() <= FLOAT_TOL
            && (self.effective_top_p() - other.effective_top_p()).abs() <= FLOAT_TOL
            && (self.frequency_penalty - other.frequency_penalty).abs() <= FLOAT_TOL
            && (self.presence_penalty - other.presence_penalty).abs() <= FLOAT_TOL
            && self.max_tokens == other.max_tokens
    }
}

/// A named candidate the bandit may choose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arm {
    pub id: String,
    pub params: ParameterSet,
}

impl Arm {
    pub fn new(id: impl Into<String>, params: ParameterSet) -> Self {
        Self {
            id: id.into(),
            params,
        }
    }

    pub fn baseline(params: ParameterSet) -> Self {
        Self::new(BASELINE_ARM_ID, params)
    }

    pub fn is_baseline(&self) -> bool {
        self.id == BASELINE_ARM_ID
    }
}

/// Ids of `arms`, in order.
pub fn arm_ids(arms: &[Arm]) -> Vec<String> {
    arms.iter().map(|a| a.id.clone()).collect()
}

/// Candidate grid around a baseline: the cartesian product of per-parameter deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidateGrid {
    pub temperature_deltas: Vec<f64>,
    pub max_tokens_deltas: Vec<i64>,
    pub top_p_deltas: Vec<f64>,
}

impl Default for CandidateGrid {
    fn default() -> Self {
        Self {
            temperature_deltas: vec![-0.1, 0.0, 0.1],
            max_tokens_deltas: vec![-100, 0, 100],
            top_p_deltas: vec![0.0],
        }
    }
}

impl CandidateGrid {
    /// Expand the grid around `baseline`.
    ///
    /// The baseline always comes first with id [`BASELINE_ARM_ID`]. Values are clamped
    /// to valid ranges and arms that collapse onto an earlier arm after clamping are
    /// dropped, so ids are unique and parameter sets distinct.
    pub fn expand(&self, baseline: &ParameterSet) -> Vec<Arm> {
        let mut arms = vec![Arm::baseline(baseline.clone())];
        let or_zero = |v: &[f64]| if v.is_empty() { vec![0.0] } else { v.to_vec() };
        let temps = or_zero(&self.temperature_deltas);
        let top_ps = or_zero(&self.top_p_deltas);
        let tokens = if self.max_tokens_deltas.is_empty() {
            vec![0]
        } else {
            self.max_tokens_deltas.clone()
        };

        for &dt in &temps {
            for &dn in &tokens {
                for &dp in &top_ps {
                    if !(dt.is_finite() && dp.is_finite()) {
                        continue;
                    }
                    let mut p = baseline.clone();
                    p.temperature =
                        (baseline.temperature + dt).clamp(TEMPERATURE_RANGE.0, TEMPERATURE_RANGE.1);
                    p.max_tokens = (i64::from(baseline.max_tokens) + dn).clamp(1, i64::from(u32::MAX))
                        as u32;
                    if dp != 0.0 {
                        p.top_p = Some((baseline.effective_top_p() + dp).clamp(0.01, 1.0));
                    }
                    if arms.iter().any(|a| a.params.same_numeric(&p)) {
                        continue;
                    }
                    let id = format!("t{dt:+.2}_n{dn:+}_p{dp:+.2}");
                    arms.push(Arm::new(id, p));
                }
            }
        }
        arms
    }
}

/// Maximum absolute deltas from the baseline for each numeric parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustRegion {
    pub max_delta_temperature: f64,
    pub max_delta_top_p: f64,
    pub max_delta_penalty: f64,
    pub max_delta_max_tokens: u32,
}

impl Default for TrustRegion {
    fn default() -> Self {
        Self {
            max_delta_temperature: 0.2,
            max_delta_top_p: 0.1,
            max_delta_penalty: 0.2,
            max_delta_max_tokens: 200,
        }
    }
}

/// One parameter outside the trust region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustViolation {
    pub parameter: String,
    pub delta: f64,
    pub max_delta: f64,
}

impl TrustRegion {
    /// Every numeric parameter of `candidate` that is farther from `baseline` than allowed.
    pub fn violations(&self, baseline: &ParameterSet, candidate: &ParameterSet) -> Vec<TrustViolation> {
        let checks = [
            (
                "temperature",
                (candidate.temperature - baseline.temperature).abs(),
                self.max_delta_temperature,
            ),
            (
                "top_p",
                (candidate.effective_top_p() - baseline.effective_top_p()).abs(),
                self.max_delta_top_p,
            ),
            (
                "frequency_penalty",
                (candidate.frequency_penalty - baseline.frequency_penalty).abs(),
                self.max_delta_penalty,
            ),
            (
                "presence_penalty",
                (candidate.presence_penalty - baseline.presence_penalty).abs(),
                self.max_delta_penalty,
            ),
            (
                "max_tokens",
                (f64::from(candidate.max_tokens) - f64::from(baseline.max_tokens)).abs(),
                f64::from(self.max_delta_max_tokens),
            ),
        ];
        checks
            .into_iter()
            .filter(|&(_, delta, max)| !delta.is_finite() || delta > max + FLOAT_TOL)
            .map(|(name, delta, max)| TrustViolation {
                parameter: name.to_string(),
                delta,
                max_delta: max,
            })
            .collect()
    }

    pub fn contains(&self, baseline: &ParameterSet, candidate: &ParameterSet) -> bool {
        self.violations(baseline, candidate).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_grid_has_nine_distinct_arms_with_baseline_first() {
        let arms = CandidateGrid::default().expand(&ParameterSet::default());
        assert_eq!(arms.len(), 9);
        assert!(arms[0].is_baseline());
        let mut ids = arm_ids(&arms);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 9, "ids must be unique");
    }

    #[test]
    fn clamping_collapses_duplicates() {
        let base = ParameterSet {
            temperature: 0.0,
            ..ParameterSet::default()
        };
        let arms = CandidateGrid::default().expand(&base);
        // temperature -0.1 clamps onto 0.0 and duplicates the 0.0 row.
        assert_eq!(arms.len(), 6);
        assert!(arms.iter().all(|a| a.params.temperature >= 0.0));
    }

    #[test]
    fn trust_region_flags_each_parameter() {
        let base = ParameterSet::default();
        let far = ParameterSet {
            temperature: 1.5,
            max_tokens: 2000,
            ..base.clone()
        };
        let v = TrustRegion::default().violations(&base, &far);
        let names: Vec<_> = v.iter().map(|x| x.parameter.as_str()).collect();
        assert_eq!(names, vec!["temperature", "max_tokens"]);
    }

    #[test]
    fn missing_top_p_compares_as_one() {
        let base = ParameterSet {
            top_p: None,
            ..ParameterSet::default()
        };
        let cand = ParameterSet {
            top_p: Some(0.95),
            ..base.clone()
        };
        assert!(TrustRegion::default().contains(&base, &cand));
    }

    proptest! {
        #[test]
        fn grid_inside_default_region_when_deltas_are_small(
            temp in 0.0f64..2.0,
            tokens in 1u32..4000,
        ) {
            let base = ParameterSet { temperature: temp, max_tokens: tokens, ..ParameterSet::default() };
            let tr = TrustRegion::default();
            for arm in CandidateGrid::default().expand(&base) {
                prop_assert!(tr.contains(&base, &arm.params), "arm {} escaped", arm.id);
                prop_assert!(arm.params.is_well_formed());
            }
        }
    }
}
