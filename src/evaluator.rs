//! Offline evaluation of a candidate policy from logged decisions.
//!
//! For logged decision `i` with context `x`, served arm `a`, logged propensity `p` and
//! reward `r`, and a target policy `π`:
//!
//! ```text
//!   w      = min(π(a|x) / p, clip)
//!   IPS_i  = w * r
//!   DR_i   = Σ_a' π(a'|x) q(x, a')  +  w * (r - q(x, a))
//! ```
//!
//! where `q` is a direct reward model fit on the same logs. Promotion compares the
//! candidate against the frozen baseline on the paired per-decision difference
//! `DR_i(candidate) - DR_i(baseline)`; the lower confidence bound is a percentile
//! bootstrap over decisions.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::arm::Arm;
use crate::error::Result;
use crate::features::{context_bucket, ContextBucketConfig, TaskFeatures};
use crate::policy::{BaselinePolicy, TargetPolicy};
use crate::store::LoggedDecision;
use crate::utils::{mean, normal_quantile, percentile};

/// Promotion-gate settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
    /// One-sided significance level of the lower confidence bound.
    pub alpha: f64,
    /// Usable decisions required before a verdict other than `Inconclusive`.
    pub min_samples: usize,
    pub bootstrap_resamples: usize,
    /// Upper clip on importance weights.
    pub weight_clip: f64,
    /// Mean candidate probability mass on arms seen in the logs, below which the
    /// estimate is extrapolation and the verdict is `Inconclusive`.
    pub min_support: f64,
    pub seed: u64,
    /// Context bucketing for the direct reward model.
    pub bucket: ContextBucketConfig,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            min_samples: 1_000,
            bootstrap_resamples: 500,
            weight_clip: 20.0,
            min_support: 0.8,
            seed: 0,
            bucket: ContextBucketConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    /// Not enough usable data. Never treated as a pass.
    Inconclusive,
}

/// Why a report came out `Inconclusive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shortfall {
    TooFewSamples,
    /// The candidate mostly picks arms the logs never served.
    LowSupport,
    /// Importance weights concentrate on too few decisions.
    LowEffectiveSamples,
    DeadlineExceeded,
}

/// A point estimate with its bootstrap interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub estimate: f64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub verdict: Verdict,
    /// Decisions that entered the estimators.
    pub samples: usize,
    /// Decisions skipped (no outcome, invalid propensity, unknown arm).
    pub excluded: usize,
    pub ips_candidate: f64,
    pub ips_baseline: f64,
    pub dr_candidate: f64,
    pub dr_baseline: f64,
    /// Paired DR improvement of candidate over baseline.
    pub improvement: Interval,
    /// Normal-approximation lower bound of `improvement`, for comparison.
    pub normal_lower: f64,
    /// Share of decisions whose candidate weight hit the clip.
    pub clipped_fraction: f64,
    /// Mean candidate probability on arms that appear in the logs.
    pub support: f64,
    /// Kish effective sample size of the candidate weights, `(Σw)² / Σw²`.
    pub effective_samples: f64,
    pub shortfall: Option<Shortfall>,
    pub alpha: f64,
}

impl EvaluationReport {
    fn inconclusive(shortfall: Shortfall, samples: usize, excluded: usize, alpha: f64) -> Self {
        Self {
            verdict: Verdict::Inconclusive,
            samples,
            excluded,
            ips_candidate: f64::NAN,
            ips_baseline: f64::NAN,
            dr_candidate: f64::NAN,
            dr_baseline: f64::NAN,
            improvement: Interval {
                estimate: f64::NAN,
                lower: f64::NAN,
                upper: f64::NAN,
            },
            normal_lower: f64::NAN,
            clipped_fraction: 0.0,
            support: 0.0,
            effective_samples: 0.0,
            shortfall: Some(shortfall),
            alpha,
        }
    }
}

/// Tabular direct model: mean reward per (context bucket, arm), falling back to the
/// per-arm mean and then the global mean.
#[derive(Debug, Clone, Default)]
pub struct RewardModel {
    by_bucket: HashMap<(u64, String), (f64, u64)>,
    by_arm: HashMap<String, (f64, u64)>,
    global: (f64, u64),
}

fn add(acc: &mut (f64, u64), r: f64) {
    acc.0 += r;
    acc.1 += 1;
}

fn avg(acc: &(f64, u64)) -> Option<f64> {
    (acc.1 > 0).then(|| acc.0 / acc.1 as f64)
}

impl RewardModel {
    pub fn fit<'a>(rows: impl IntoIterator<Item = (u64, &'a str, f64)>) -> Self {
        let mut m = Self::default();
        for (bucket, arm, r) in rows {
            add(m.by_bucket.entry((bucket, arm.to_string())).or_default(), r);
            add(m.by_arm.entry(arm.to_string()).or_default(), r);
            add(&mut m.global, r);
        }
        m
    }

    /// Whether any logged decision served `arm`.
    pub fn observed(&self, arm: &str) -> bool {
        self.by_arm.get(arm).is_some_and(|acc| acc.1 > 0)
    }

    pub fn predict(&self, bucket: u64, arm: &str) -> f64 {
        self.by_bucket
            .get(&(bucket, arm.to_string()))
            .and_then(avg)
            .or_else(|| self.by_arm.get(arm).and_then(avg))
            .or_else(|| avg(&self.global))
            .unwrap_or(0.0)
    }
}

struct Row<'a> {
    d: &'a LoggedDecision,
    reward: f64,
    bucket: u64,
    arms: Vec<Arm>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineEvaluator {
    cfg: PromotionConfig,
}

impl OfflineEvaluator {
    pub fn new(cfg: PromotionConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &PromotionConfig {
        &self.cfg
    }

    /// Arms eligible for `d`, resolved against `catalog`.
    fn arms_for(d: &LoggedDecision, catalog: &[Arm]) -> Vec<Arm> {
        let eligible: Vec<Arm> = catalog
            .iter()
            .filter(|a| d.eligible_arms.iter().any(|id| *id == a.id))
            .cloned()
            .collect();
        if eligible.is_empty() {
            catalog.to_vec()
        } else {
            eligible
        }
    }

    fn usable<'a>(&self, decisions: &'a [LoggedDecision], catalog: &[Arm]) -> Vec<Row<'a>> {
        decisions
            .iter()
            .filter_map(|d| {
                // Degraded rows were forced to the baseline outside the routed
                // mixture; their logged propensity is not the serving probability.
                if d.degraded {
                    return None;
                }
                let reward = d.outcome.as_ref()?.reward;
                let p_ok = d.propensity.is_finite() && d.propensity > 0.0 && d.propensity <= 1.0;
                if !(p_ok && reward.is_finite()) {
                    return None;
                }
                let arms = Self::arms_for(d, catalog);
                if !arms.iter().any(|a| a.id == d.arm_id) {
                    return None;
                }
                Some(Row {
                    d,
                    reward,
                    bucket: context_bucket(&d.features, self.cfg.bucket),
                    arms,
                })
            })
            .collect()
    }

    /// Estimate the value of `candidate` against the frozen baseline on `decisions`.
    ///
    /// `catalog` is the task type's arm set; each decision's eligible subset is
    /// resolved from it.
    pub fn evaluate(
        &self,
        decisions: &[LoggedDecision],
        candidate: &dyn TargetPolicy,
        catalog: &[Arm],
    ) -> Result<EvaluationReport> {
        self.evaluate_until(decisions, candidate, catalog, None)
    }

    /// [`evaluate`](Self::evaluate), giving up with `Inconclusive` once `deadline`
    /// passes.
    pub fn evaluate_until(
        &self,
        decisions: &[LoggedDecision],
        candidate: &dyn TargetPolicy,
        catalog: &[Arm],
        deadline: Option<Instant>,
    ) -> Result<EvaluationReport> {
        let rows = self.usable(decisions, catalog);
        let n = rows.len();
        let excluded = decisions.len() - n;
        let alpha = self.cfg.alpha;
        if n == 0 {
            let r = EvaluationReport::inconclusive(Shortfall::TooFewSamples, 0, excluded, alpha);
            return Ok(r);
        }
        let expired = || deadline.is_some_and(|d| Instant::now() >= d);

        let model =
            RewardModel::fit(rows.iter().map(|r| (r.bucket, r.d.arm_id.as_str(), r.reward)));
        let clip = if self.cfg.weight_clip > 0.0 {
            self.cfg.weight_clip
        } else {
            f64::INFINITY
        };

        // Distributions depend only on (features, eligible set); cache per pair.
        type Probs = BTreeMap<String, f64>;
        let mut cache: HashMap<(String, Vec<String>), (Probs, Probs)> = HashMap::new();
        let mut probs_for = |features: &TaskFeatures, arms: &[Arm]| -> Result<(Probs, Probs)> {
            let key = (
                features.fingerprint(),
                arms.iter().map(|a| a.id.clone()).collect::<Vec<_>>(),
            );
            if let Some(hit) = cache.get(&key) {
                return Ok(hit.clone());
            }
            let pc = candidate.action_probabilities(features, arms)?;
            let pb = BaselinePolicy.action_probabilities(features, arms)?;
            cache.insert(key, (pc.clone(), pb.clone()));
            Ok((pc, pb))
        };

        let mut ips_c = Vec::with_capacity(n);
        let mut ips_b = Vec::with_capacity(n);
        let mut dr_c = Vec::with_capacity(n);
        let mut dr_b = Vec::with_capacity(n);
        let mut weights = Vec::with_capacity(n);
        let mut clipped = 0usize;
        let mut supported = 0.0;
        for (i, row) in rows.iter().enumerate() {
            if i % 256 == 0 && expired() {
                return Ok(EvaluationReport::inconclusive(
                    Shortfall::DeadlineExceeded,
                    n,
                    excluded,
                    alpha,
                ));
            }
            let (pc, pb) = probs_for(&row.d.features, &row.arms)?;
            supported += pc
                .iter()
                .filter(|(id, _)| model.observed(id))
                .map(|(_, p)| p)
                .sum::<f64>();
            let a = row.d.arm_id.as_str();
            let q_a = model.predict(row.bucket, a);
            let raw_c = pc.get(a).copied().unwrap_or(0.0) / row.d.propensity;
            if raw_c > clip {
                clipped += 1;
            }
            let w_c = raw_c.min(clip);
            weights.push(w_c);
            let w_b = (pb.get(a).copied().unwrap_or(0.0) / row.d.propensity).min(clip);
            let dm = |pi: &Probs| -> f64 {
                pi.iter()
                    .map(|(id, p)| p * model.predict(row.bucket, id))
                    .sum()
            };
            ips_c.push(w_c * row.reward);
            ips_b.push(w_b * row.reward);
            dr_c.push(dm(&pc) + w_c * (row.reward - q_a));
            dr_b.push(dm(&pb) + w_b * (row.reward - q_a));
        }

        if expired() {
            return Ok(EvaluationReport::inconclusive(
                Shortfall::DeadlineExceeded,
                n,
                excluded,
                alpha,
            ));
        }
        let support = supported / n as f64;
        let effective_samples = {
            let (s, s2) = weights
                .iter()
                .fold((0.0f64, 0.0f64), |(s, s2), &w| (s + w, s2 + w * w));
            if s2 > 0.0 {
                s * s / s2
            } else {
                0.0
            }
        };

        let diffs: Vec<f64> = dr_c.iter().zip(&dr_b).map(|(c, b)| c - b).collect();
        let estimate = mean(&diffs);
        let (lower, upper) = self.bootstrap(&diffs);
        let sd = {
            let var = diffs.iter().map(|d| (d - estimate).powi(2)).sum::<f64>()
                / (n.saturating_sub(1).max(1)) as f64;
            var.sqrt()
        };
        let normal_lower =
            estimate - normal_quantile(1.0 - self.cfg.alpha) * sd / (n as f64).sqrt();

        let shortfall = if n < self.cfg.min_samples {
            Some(Shortfall::TooFewSamples)
        } else if support < self.cfg.min_support {
            Some(Shortfall::LowSupport)
        } else if effective_samples < self.cfg.min_samples as f64 {
            Some(Shortfall::LowEffectiveSamples)
        } else {
            None
        };
        let verdict = match shortfall {
            Some(_) => Verdict::Inconclusive,
            None if lower >= 0.0 => Verdict::Pass,
            None => Verdict::Fail,
        };

        Ok(EvaluationReport {
            verdict,
            samples: n,
            excluded,
            ips_candidate: mean(&ips_c),
            ips_baseline: mean(&ips_b),
            dr_candidate: mean(&dr_c),
            dr_baseline: mean(&dr_b),
            improvement: Interval {
                estimate,
                lower,
                upper,
            },
            normal_lower,
            clipped_fraction: clipped as f64 / n as f64,
            support,
            effective_samples,
            shortfall,
            alpha,
        })
    }

    /// One-sided percentile bootstrap bounds `(alpha, 1 - alpha)` of the mean of `xs`.
    pub fn bootstrap(&self, xs: &[f64]) -> (f64, f64) {
        if xs.is_empty() {
            return (f64::NAN, f64::NAN);
        }
        let b = self.cfg.bootstrap_resamples.max(1);
        let mut rng = StdRng::seed_from_u64(self.cfg.seed);
        let n = xs.len();
        let mut means: Vec<f64> = (0..b)
            .map(|_| {
                let s: f64 = (0..n).map(|_| xs[rng.random_range(0..n)]).sum();
                s / n as f64
            })
            .collect();
        let alpha = self.cfg.alpha.clamp(0.0, 0.5);
        let lower = percentile(&mut means, alpha);
        let upper = percentile(&mut means, 1.0 - alpha);
        (lower, upper)
    }
}
