//! Gaussian Thompson sampling over (context bucket, arm) cells.
//!
//! Each cell holds a conjugate Normal posterior over the arm's mean reward with known
//! observation noise. Selection:
//! - draw `mc_samples` joint posterior samples and count how often each arm wins,
//! - Laplace-smooth the win counts into a distribution (every arm gets `> 0`),
//! - sample the served arm from that distribution.
//!
//! The logged propensity is exactly the probability the arm was drawn with, so
//! offline estimators see the real logging distribution.
//!
//! Notes:
//! - Draws are seeded from `(seed, context fingerprint, update epoch)`: with no
//!   intervening update the same context always gets the same arm.
//! - Unobserved cells read as the prior and are never materialized by `select`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::alloc::sample_from;
use crate::arm::Arm;
use crate::decision::{PolicyKind, SelectionNote, SelectionResult};
use crate::error::{Result, TuneError};
use crate::features::{context_bucket, ContextBucketConfig, TaskFeatures};
use crate::keyed::KeyedCells;
use crate::policy::{check_reward, BanditPolicy, PolicySnapshot, TargetPolicy};
use crate::stable_hash::mix_seed;

/// Configuration for [`ThompsonGaussian`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThompsonGaussianConfig {
    pub prior_mean: f64,
    /// Prior precision (1 / variance), must be > 0.
    pub prior_precision: f64,
    /// Known observation-noise precision, must be > 0.
    pub noise_precision: f64,
    /// Monte Carlo draws used to estimate win probabilities.
    pub mc_samples: u32,
    pub seed: u64,
    pub bucket: ContextBucketConfig,
}

impl Default for ThompsonGaussianConfig {
    fn default() -> Self {
        Self {
            prior_mean: 0.0,
            prior_precision: 1.0,
            noise_precision: 1.0,
            mc_samples: 256,
            seed: 0,
            bucket: ContextBucketConfig::default(),
        }
    }
}

/// Normal posterior over an arm's mean reward.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaussianPosterior {
    pub mean: f64,
    pub precision: f64,
    pub uses: u64,
}

impl GaussianPosterior {
    pub fn prior(cfg: &ThompsonGaussianConfig) -> Self {
        let precision = if cfg.prior_precision.is_finite() && cfg.prior_precision > 0.0 {
            cfg.prior_precision
        } else {
            1.0
        };
        let mean = if cfg.prior_mean.is_finite() {
            cfg.prior_mean
        } else {
            0.0
        };
        Self {
            mean,
            precision,
            uses: 0,
        }
    }

    pub fn variance(&self) -> f64 {
        1.0 / self.precision
    }

    /// Precision-weighted blend of the current mean and the observation.
    pub fn observe(&mut self, reward: f64, noise_precision: f64) {
        let tau = if noise_precision.is_finite() && noise_precision > 0.0 {
            noise_precision
        } else {
            1.0
        };
        let precision = self.precision + tau;
        self.mean = (self.precision * self.mean + tau * reward) / precision;
        self.precision = precision;
        self.uses = self.uses.saturating_add(1);
    }

    fn is_valid(&self) -> bool {
        self.mean.is_finite() && self.precision.is_finite() && self.precision > 0.0
    }
}

/// One persisted cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThompsonCell {
    pub bucket: u64,
    pub arm: String,
    pub posterior: GaussianPosterior,
}

/// Serializable [`ThompsonGaussian`] state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThompsonSnapshot {
    pub updates: u64,
    pub cells: Vec<ThompsonCell>,
}

/// Seedable, concurrently shareable Gaussian Thompson sampler.
#[derive(Debug)]
pub struct ThompsonGaussian {
    cfg: ThompsonGaussianConfig,
    cells: KeyedCells<(u64, String), GaussianPosterior>,
    updates: AtomicU64,
}

impl ThompsonGaussian {
    pub fn new(cfg: ThompsonGaussianConfig) -> Self {
        Self {
            cfg,
            cells: KeyedCells::new(),
            updates: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ThompsonGaussianConfig {
        &self.cfg
    }

    /// Current posterior for `arm_id` at `features` (the prior if unobserved).
    pub fn posterior(&self, features: &TaskFeatures, arm_id: &str) -> GaussianPosterior {
        let bucket = context_bucket(features, self.cfg.bucket);
        let prior = GaussianPosterior::prior(&self.cfg);
        self.cells
            .read(&(bucket, arm_id.to_string()), None, |p| p.copied().unwrap_or(prior))
            .unwrap_or(prior)
    }

    fn posteriors(
        &self,
        bucket: u64,
        arms: &[Arm],
        deadline: Option<Instant>,
    ) -> Result<Vec<GaussianPosterior>> {
        let prior = GaussianPosterior::prior(&self.cfg);
        arms.iter()
            .map(|a| {
                self.cells
                    .read(&(bucket, a.id.clone()), deadline, |p| p.copied().unwrap_or(prior))
            })
            .collect()
    }

    fn rng_for(&self, features: &TaskFeatures, epoch: u64) -> StdRng {
        StdRng::seed_from_u64(mix_seed(&[self.cfg.seed, features.fingerprint_u64(), epoch]))
    }

    /// Smoothed Monte Carlo win rates, plus the RNG positioned after the MC draws.
    fn win_rates(
        &self,
        features: &TaskFeatures,
        arms: &[Arm],
        deadline: Option<Instant>,
    ) -> Result<(BTreeMap<String, f64>, Vec<GaussianPosterior>, StdRng)> {
        if arms.is_empty() {
            return Err(TuneError::EmptyArmSet);
        }
        let epoch = self.updates.load(Ordering::Acquire);
        let bucket = context_bucket(features, self.cfg.bucket);
        let posts = self.posteriors(bucket, arms, deadline)?;
        let mut rng = self.rng_for(features, epoch);

        let m = self.cfg.mc_samples.max(1);
        let mut wins = vec![0u32; arms.len()];
        for _ in 0..m {
            let mut best = 0usize;
            let mut best_draw = f64::NEG_INFINITY;
            for (i, p) in posts.iter().enumerate() {
                let z: f64 = rng.sample(StandardNormal);
                let x = p.mean + p.variance().sqrt() * z;
                if x > best_draw || (x == best_draw && arms[i].id < arms[best].id) {
                    best = i;
                    best_draw = x;
                }
            }
            wins[best] += 1;
        }

        let denom = f64::from(m) + arms.len() as f64;
        let probs = arms
            .iter()
            .zip(&wins)
            .map(|(a, &w)| (a.id.clone(), (f64::from(w) + 1.0) / denom))
            .collect();
        Ok((probs, posts, rng))
    }
}

impl Default for ThompsonGaussian {
    fn default() -> Self {
        Self::new(ThompsonGaussianConfig::default())
    }
}

impl TargetPolicy for ThompsonGaussian {
    fn action_probabilities(
        &self,
        features: &TaskFeatures,
        arms: &[Arm],
    ) -> Result<BTreeMap<String, f64>> {
        self.win_rates(features, arms, None).map(|(p, _, _)| p)
    }
}

impl BanditPolicy for ThompsonGaussian {
    fn kind(&self) -> PolicyKind {
        PolicyKind::ThompsonGaussian
    }

    fn version(&self) -> &str {
        PolicyKind::ThompsonGaussian.version_tag()
    }

    fn select_by(
        &self,
        features: &TaskFeatures,
        arms: &[Arm],
        deadline: Option<Instant>,
    ) -> Result<SelectionResult> {
        let (probs, posts, mut rng) = self.win_rates(features, arms, deadline)?;
        let u: f64 = rng.random();
        let total: f64 = probs.values().sum();
        let mut notes = vec![SelectionNote::SampledPosteriorWinRate {
            mc_samples: self.cfg.mc_samples.max(1),
        }];
        if u >= total {
            notes.push(SelectionNote::NumericalFallbackToLastArm);
        }
        let chosen_id = sample_from(&probs, u).ok_or(TuneError::EmptyArmSet)?;
        let idx = arms
            .iter()
            .position(|a| a.id == chosen_id)
            .ok_or(TuneError::EmptyArmSet)?;
        let propensity = probs.get(chosen_id).copied().unwrap_or(0.0);
        Ok(SelectionResult {
            policy: PolicyKind::ThompsonGaussian,
            policy_version: self.version().to_string(),
            arm: arms[idx].clone(),
            propensity,
            expected_reward: posts[idx].mean,
            probs,
            notes,
        })
    }

    fn update(&self, features: &TaskFeatures, arm_id: &str, reward: f64) -> Result<()> {
        check_reward(reward)?;
        let bucket = context_bucket(features, self.cfg.bucket);
        let prior = GaussianPosterior::prior(&self.cfg);
        let tau = self.cfg.noise_precision;
        self.cells
            .update((bucket, arm_id.to_string()), || prior, |p| p.observe(reward, tau));
        self.updates.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn expected_reward(&self, features: &TaskFeatures, arm_id: &str) -> f64 {
        self.posterior(features, arm_id).mean
    }

    fn observations(&self) -> u64 {
        self.updates.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> PolicySnapshot {
        let mut cells: Vec<ThompsonCell> = self
            .cells
            .snapshot()
            .into_iter()
            .map(|((bucket, arm), posterior)| ThompsonCell {
                bucket,
                arm,
                posterior,
            })
            .collect();
        cells.sort_by(|a, b| a.bucket.cmp(&b.bucket).then_with(|| a.arm.cmp(&b.arm)));
        PolicySnapshot::ThompsonGaussian(ThompsonSnapshot {
            updates: self.observations(),
            cells,
        })
    }

    fn restore(&self, snapshot: PolicySnapshot) -> Result<()> {
        #[allow(irrefutable_let_patterns)]
        let PolicySnapshot::ThompsonGaussian(snap) = snapshot
        else {
            return Err(TuneError::Config(
                "snapshot kind does not match thompson_gaussian".into(),
            ));
        };
        if let Some(bad) = snap.cells.iter().find(|c| !c.posterior.is_valid()) {
            return Err(TuneError::Config(format!(
                "corrupt posterior for arm `{}` in bucket {}",
                bad.arm, bad.bucket
            )));
        }
        self.cells.replace_all(
            snap.cells
                .into_iter()
                .map(|c| ((c.bucket, c.arm), c.posterior)),
        );
        self.updates.store(snap.updates, Ordering::Release);
        Ok(())
    }
}
