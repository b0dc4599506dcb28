//! Linear contextual bandit (LinUCB) with an epsilon-greedy propensity floor.
//!
//! Each arm keeps ridge-regression sufficient statistics over the task context vector
//! ([`TaskFeatures::context_vector`]). The score is `theta^T x + alpha * sqrt(x^T A^{-1} x)`.
//!
//! Arg-max alone is deterministic, which leaves logged propensities of 0 for every
//! other arm and breaks importance weighting. The policy therefore mixes in a uniform
//! exploration branch:
//!
//! ```text
//!   p(a | x) = eps / K + (1 - eps) * 1[a = argmax_a ucb(a, x)]
//! ```
//!
//! so every arm in the candidate set has probability at least `eps / K`.
//!
//! State is per arm, behind [`KeyedCells`]: updates to one arm never block another, and
//! `select` only takes shared locks. Updates use Sherman-Morrison on `A^{-1}`, with
//! optional exponential forgetting (`decay`).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::alloc::argmax_stable;
use crate::arm::Arm;
use crate::decision::{PolicyKind, SelectionNote, SelectionResult};
use crate::error::{Result, TuneError};
use crate::features::{TaskFeatures, CONTEXT_DIM};
use crate::keyed::KeyedCells;
use crate::policy::{check_reward, BanditPolicy, PolicySnapshot, TargetPolicy};
use crate::stable_hash::mix_seed;

/// Per-arm score tuple: `(ucb, mean, bonus)`.
pub type LinUcbScore = (f64, f64, f64);

/// Configuration for [`LinUcb`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinUcbConfig {
    /// Feature dimension (defaults to [`CONTEXT_DIM`]).
    pub dim: usize,
    /// Ridge regularization (finite, > 0).
    pub lambda: f64,
    /// Exploration bonus scale (finite, >= 0).
    pub alpha: f64,
    /// Uniform exploration mass in `(0, 1]`.
    pub epsilon: f64,
    pub seed: u64,
    /// Forgetting factor in `(0, 1]`; `1.0` keeps everything.
    ///
    /// With `d < 1` each update applies `A <- d*A + x x^T`, `b <- d*b + r x`. Since
    /// `A^{-1}` is stored, it is first scaled by `1/d`.
    pub decay: f64,
}

impl Default for LinUcbConfig {
    fn default() -> Self {
        Self {
            dim: CONTEXT_DIM,
            lambda: 1.0,
            alpha: 1.0,
            epsilon: 0.05,
            seed: 0,
            decay: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
struct ArmState {
    // A^{-1} (d x d, row-major).
    a_inv: Vec<f64>,
    b: Vec<f64>,
    uses: u64,
}

impl ArmState {
    fn new(dim: usize, lambda: f64) -> Self {
        let mut a_inv = vec![0.0; dim * dim];
        let diag = if lambda.is_finite() && lambda > 0.0 {
            1.0 / lambda
        } else {
            1.0
        };
        for i in 0..dim {
            a_inv[i * dim + i] = diag;
        }
        Self {
            a_inv,
            b: vec![0.0; dim],
            uses: 0,
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn mat_vec(a: &[f64], dim: usize, x: &[f64]) -> Vec<f64> {
    (0..dim)
        .map(|i| dot(&a[i * dim..(i + 1) * dim], x))
        .collect()
}

/// Seedable LinUCB shared across concurrent callers.
#[derive(Debug)]
pub struct LinUcb {
    cfg: LinUcbConfig,
    arms: KeyedCells<String, ArmState>,
    updates: AtomicU64,
}

impl LinUcb {
    pub fn new(cfg: LinUcbConfig) -> Self {
        Self {
            cfg,
            arms: KeyedCells::new(),
            updates: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &LinUcbConfig {
        &self.cfg
    }

    fn dim(&self) -> usize {
        self.cfg.dim.max(1)
    }

    fn epsilon(&self) -> f64 {
        if self.cfg.epsilon.is_finite() {
            self.cfg.epsilon.clamp(1e-6, 1.0)
        } else {
            LinUcbConfig::default().epsilon
        }
    }

    fn context(&self, features: &TaskFeatures) -> Vec<f64> {
        let raw = features.context_vector();
        (0..self.dim())
            .map(|i| raw.get(i).copied().filter(|v| v.is_finite()).unwrap_or(0.0))
            .collect()
    }

    fn score(&self, st: &ArmState, x: &[f64]) -> LinUcbScore {
        let d = self.dim();
        let theta = mat_vec(&st.a_inv, d, &st.b);
        let mean = dot(&theta, x);
        let ax = mat_vec(&st.a_inv, d, x);
        let var = dot(x, &ax).max(0.0);
        let alpha = if self.cfg.alpha.is_finite() && self.cfg.alpha >= 0.0 {
            self.cfg.alpha
        } else {
            0.0
        };
        let bonus = alpha * var.sqrt();
        (mean + bonus, mean, bonus)
    }

    fn scores_by(
        &self,
        features: &TaskFeatures,
        arms: &[Arm],
        deadline: Option<Instant>,
    ) -> Result<Vec<LinUcbScore>> {
        let x = self.context(features);
        let fresh = ArmState::new(self.dim(), self.cfg.lambda);
        arms.iter()
            .map(|a| {
                self.arms.read(&a.id, deadline, |st| {
                    self.score(st.unwrap_or(&fresh), &x)
                })
            })
            .collect()
    }

    /// Per-arm `(ucb, mean, bonus)` for `features`.
    pub fn scores(&self, features: &TaskFeatures, arms: &[Arm]) -> Result<BTreeMap<String, LinUcbScore>> {
        let s = self.scores_by(features, arms, None)?;
        Ok(arms.iter().map(|a| a.id.clone()).zip(s).collect())
    }

    fn greedy<'a>(arms: &'a [Arm], scores: &[LinUcbScore]) -> Option<&'a str> {
        argmax_stable(arms.iter().zip(scores).map(|(a, s)| (a.id.as_str(), s.0)))
    }

    fn distribution(&self, arms: &[Arm], greedy: &str) -> BTreeMap<String, f64> {
        let eps = self.epsilon();
        let floor = eps / arms.len() as f64;
        arms.iter()
            .map(|a| {
                let p = if a.id == greedy { floor + 1.0 - eps } else { floor };
                (a.id.clone(), p)
            })
            .collect()
    }
}

impl Default for LinUcb {
    fn default() -> Self {
        Self::new(LinUcbConfig::default())
    }
}

impl TargetPolicy for LinUcb {
    fn action_probabilities(
        &self,
        features: &TaskFeatures,
        arms: &[Arm],
    ) -> Result<BTreeMap<String, f64>> {
        if arms.is_empty() {
            return Err(TuneError::EmptyArmSet);
        }
        let scores = self.scores_by(features, arms, None)?;
        let greedy = Self::greedy(arms, &scores).ok_or(TuneError::EmptyArmSet)?;
        Ok(self.distribution(arms, greedy))
    }
}

impl BanditPolicy for LinUcb {
    fn kind(&self) -> PolicyKind {
        PolicyKind::LinUcb
    }

    fn version(&self) -> &str {
        PolicyKind::LinUcb.version_tag()
    }

    fn select_by(
        &self,
        features: &TaskFeatures,
        arms: &[Arm],
        deadline: Option<Instant>,
    ) -> Result<SelectionResult> {
        if arms.is_empty() {
            return Err(TuneError::EmptyArmSet);
        }
        let epoch = self.updates.load(Ordering::Acquire);
        let scores = self.scores_by(features, arms, deadline)?;
        let greedy = Self::greedy(arms, &scores).ok_or(TuneError::EmptyArmSet)?;
        let probs = self.distribution(arms, greedy);

        let eps = self.epsilon();
        let mut rng =
            StdRng::seed_from_u64(mix_seed(&[self.cfg.seed, features.fingerprint_u64(), epoch]));
        let explore: f64 = rng.random();
        let (idx, note) = if explore < eps {
            let i = ((rng.random::<f64>() * arms.len() as f64) as usize).min(arms.len() - 1);
            (i, SelectionNote::UniformExploration { epsilon: eps })
        } else {
            let i = arms
                .iter()
                .position(|a| a.id == greedy)
                .ok_or(TuneError::EmptyArmSet)?;
            (i, SelectionNote::GreedyUpperBound)
        };

        let arm = arms[idx].clone();
        let propensity = probs.get(&arm.id).copied().unwrap_or(eps / arms.len() as f64);
        Ok(SelectionResult {
            policy: PolicyKind::LinUcb,
            policy_version: self.version().to_string(),
            expected_reward: scores[idx].1,
            arm,
            propensity,
            probs,
            notes: vec![note],
        })
    }

    fn update(&self, features: &TaskFeatures, arm_id: &str, reward: f64) -> Result<()> {
        check_reward(reward)?;
        let d = self.dim();
        let x = self.context(features);
        let decay = if self.cfg.decay.is_finite() && self.cfg.decay > 0.0 {
            self.cfg.decay.clamp(1.0e-6, 1.0)
        } else {
            1.0
        };
        let lambda = self.cfg.lambda;

        self.arms.update(
            arm_id.to_string(),
            || ArmState::new(d, lambda),
            |st| {
                if decay < 1.0 {
                    for v in &mut st.b {
                        *v *= decay;
                    }
                    for v in &mut st.a_inv {
                        *v /= decay;
                    }
                }

                // A^{-1} <- A^{-1} - (A^{-1} x x^T A^{-1}) / (1 + x^T A^{-1} x)
                let ax = mat_vec(&st.a_inv, d, &x);
                let denom = 1.0 + dot(&x, &ax);
                if denom.is_finite() && denom > 1e-12 {
                    for i in 0..d {
                        for j in 0..d {
                            st.a_inv[i * d + j] -= (ax[i] * ax[j]) / denom;
                        }
                    }
                }
                for (bi, xi) in st.b.iter_mut().zip(&x) {
                    *bi += reward * xi;
                }
                st.uses = st.uses.saturating_add(1);
            },
        );
        self.updates.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn expected_reward(&self, features: &TaskFeatures, arm_id: &str) -> f64 {
        let x = self.context(features);
        let fresh = ArmState::new(self.dim(), self.cfg.lambda);
        self.arms
            .read(&arm_id.to_string(), None, |st| self.score(st.unwrap_or(&fresh), &x).1)
            .unwrap_or(0.0)
    }

    fn observations(&self) -> u64 {
        self.updates.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> PolicySnapshot {
        let arms = self
            .arms
            .snapshot()
            .into_iter()
            .map(|(name, st)| {
                (
                    name,
                    LinUcbArmState {
                        a_inv: st.a_inv,
                        b: st.b,
                        uses: st.uses,
                    },
                )
            })
            .collect();
        PolicySnapshot::LinUcb(LinUcbState {
            dim: self.dim(),
            updates: self.observations(),
            arms,
        })
    }

    /// Arms whose stored dimension disagrees with the config, or whose statistics are
    /// not finite, are skipped and start fresh.
    fn restore(&self, snapshot: PolicySnapshot) -> Result<()> {
        let PolicySnapshot::LinUcb(st) = snapshot else {
            return Err(TuneError::Config(
                "snapshot kind does not match linucb".into(),
            ));
        };
        let dim = self.dim();
        let mut kept = Vec::new();
        for (name, arm) in st.arms {
            if arm.a_inv.len() != dim * dim || arm.b.len() != dim {
                tracing::warn!(arm = %name, "linucb restore: dimension mismatch, arm reset");
                continue;
            }
            if !arm.a_inv.iter().chain(&arm.b).all(|v| v.is_finite()) {
                tracing::warn!(arm = %name, "linucb restore: non-finite state, arm reset");
                continue;
            }
            kept.push((
                name,
                ArmState {
                    a_inv: arm.a_inv,
                    b: arm.b,
                    uses: arm.uses,
                },
            ));
        }
        self.arms.replace_all(kept);
        self.updates.store(st.updates, Ordering::Release);
        Ok(())
    }
}

/// Serializable per-arm statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinUcbArmState {
    /// Inverse design matrix (d x d, row-major).
    pub a_inv: Vec<f64>,
    /// Reward-weighted feature sum (d).
    pub b: Vec<f64>,
    pub uses: u64,
}

/// Serializable [`LinUcb`] state. RNG state is not stored; draws are re-derived from the seed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinUcbState {
    pub dim: usize,
    #[serde(default)]
    pub updates: u64,
    pub arms: BTreeMap<String, LinUcbArmState>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::ParameterSet;
    use proptest::prelude::*;

    fn two_arms() -> Vec<Arm> {
        vec![
            Arm::new("small", ParameterSet::default()),
            Arm::new(
                "big",
                ParameterSet {
                    max_tokens: 1100,
                    ..ParameterSet::default()
                },
            ),
        ]
    }

    fn ctx(risk: u8) -> TaskFeatures {
        TaskFeatures {
            risk_tier: risk,
            ..TaskFeatures::default()
        }
    }

    #[test]
    fn propensities_have_epsilon_floor() {
        let p = LinUcb::new(LinUcbConfig {
            epsilon: 0.1,
            ..LinUcbConfig::default()
        });
        let arms = two_arms();
        let probs = p.action_probabilities(&ctx(1), &arms).expect("probs");
        let sum: f64 = probs.values().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!(probs.values().all(|&v| v >= 0.05 - 1e-12), "{probs:?}");
        assert!(probs.values().any(|&v| (v - 0.95).abs() < 1e-12));
    }

    #[test]
    fn single_arm_has_propensity_one() {
        let p = LinUcb::default();
        let arms = vec![Arm::baseline(ParameterSet::default())];
        let s = p.select(&ctx(0), &arms).expect("select");
        assert!((s.propensity - 1.0).abs() < 1e-12);
    }

    #[test]
    fn learns_context_dependent_preference() {
        let p = LinUcb::new(LinUcbConfig {
            alpha: 0.2,
            ..LinUcbConfig::default()
        });
        let arms = two_arms();
        for _ in 0..200 {
            // Low risk: "small" is better. High risk: "big" is better.
            p.update(&ctx(0), "small", 1.0).expect("update");
            p.update(&ctx(0), "big", 0.0).expect("update");
            p.update(&ctx(3), "small", 0.0).expect("update");
            p.update(&ctx(3), "big", 1.0).expect("update");
        }
        let lo = p.action_probabilities(&ctx(0), &arms).expect("probs");
        let hi = p.action_probabilities(&ctx(3), &arms).expect("probs");
        assert!(lo["small"] > lo["big"], "{lo:?}");
        assert!(hi["big"] > hi["small"], "{hi:?}");
        assert!(p.expected_reward(&ctx(3), "big") > p.expected_reward(&ctx(3), "small"));
    }

    #[test]
    fn selection_is_reproducible_without_updates() {
        let p = LinUcb::new(LinUcbConfig {
            seed: 9,
            ..LinUcbConfig::default()
        });
        let arms = two_arms();
        p.update(&ctx(2), "big", 0.7).expect("update");
        let first = p.select(&ctx(2), &arms).expect("select");
        for _ in 0..500 {
            assert_eq!(p.select(&ctx(2), &arms).expect("select").arm, first.arm);
        }
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let a = LinUcb::default();
        let arms = two_arms();
        for t in 0..50u8 {
            a.update(&ctx(t % 4), if t % 3 == 0 { "small" } else { "big" }, f64::from(t) / 50.0)
                .expect("update");
        }
        let b = LinUcb::default();
        b.restore(a.snapshot()).expect("restore");
        for r in 0..4 {
            let sa = a.scores(&ctx(r), &arms).expect("scores");
            let sb = b.scores(&ctx(r), &arms).expect("scores");
            for arm in &arms {
                assert!((sa[&arm.id].0 - sb[&arm.id].0).abs() < 1e-12);
            }
        }
        assert_eq!(a.select(&ctx(1), &arms).expect("a").arm, b.select(&ctx(1), &arms).expect("b").arm);
    }

    #[test]
    fn restore_skips_mismatched_dimensions() {
        let p = LinUcb::default();
        let mut arms = BTreeMap::new();
        arms.insert(
            "small".to_string(),
            LinUcbArmState {
                a_inv: vec![1.0; 4],
                b: vec![0.0; 2],
                uses: 3,
            },
        );
        p.restore(PolicySnapshot::LinUcb(LinUcbState {
            dim: 2,
            updates: 3,
            arms,
        }))
        .expect("restore");
        let PolicySnapshot::LinUcb(st) = p.snapshot() else {
            panic!("wrong snapshot kind");
        };
        assert!(st.arms.is_empty());
    }

    #[test]
    fn wrong_snapshot_kind_is_rejected() {
        let t = crate::ThompsonGaussian::default();
        assert!(LinUcb::default().restore(t.snapshot()).is_err());
    }

    #[test]
    fn concurrent_selects_and_updates_stay_consistent() {
        let p = LinUcb::new(LinUcbConfig {
            epsilon: 0.1,
            ..LinUcbConfig::default()
        });
        let arms = two_arms();
        std::thread::scope(|s| {
            for t in 0..8usize {
                let (p, arms) = (&p, &arms);
                s.spawn(move || {
                    // Half the writers share one arm, the rest alternate.
                    for i in 0..400 {
                        let arm = if t < 4 { &arms[0] } else { &arms[(t + i) % 2] };
                        p.update(&ctx((i % 4) as u8), &arm.id, (i % 5) as f64 / 5.0)
                            .expect("update");
                    }
                });
            }
            for t in 0..4u8 {
                let (p, arms) = (&p, &arms);
                s.spawn(move || {
                    for _ in 0..200 {
                        let deadline = Instant::now() + std::time::Duration::from_secs(5);
                        let sel = p.select_by(&ctx(t), arms, Some(deadline)).expect("select");
                        assert_eq!(sel.probs.len(), arms.len());
                        assert!(sel.probs.values().all(|&v| v >= 0.05 - 1e-12));
                        let sum: f64 = sel.probs.values().sum();
                        assert!((sum - 1.0).abs() < 1e-9);
                    }
                });
            }
        });
        assert_eq!(p.observations(), 8 * 400);
        let PolicySnapshot::LinUcb(st) = p.snapshot() else {
            panic!("linucb snapshot");
        };
        let uses: u64 = st.arms.values().map(|a| a.uses).sum();
        assert_eq!(uses, 8 * 400);
        for a in st.arms.values() {
            assert!(a.a_inv.iter().chain(&a.b).all(|v| v.is_finite()));
        }
        let scores = p.scores(&ctx(2), &arms).expect("scores");
        assert!(scores.values().all(|s| s.0.is_finite() && s.1.is_finite()));
    }

    proptest! {
        #[test]
        fn state_stays_finite_and_symmetric(
            decay in 0.5f64..1.0,
            alpha in 0.0f64..3.0,
            lambda in 1.0e-3f64..10.0,
            steps in proptest::collection::vec((0u8..4, any::<bool>(), -10.0f64..10.0), 0..120),
        ) {
            let p = LinUcb::new(LinUcbConfig { decay, alpha, lambda, ..LinUcbConfig::default() });
            let arms = two_arms();
            for (risk, big, r) in steps {
                p.update(&ctx(risk), if big { "big" } else { "small" }, r).expect("update");
            }
            let s = p.select(&ctx(1), &arms).expect("select");
            prop_assert!(s.propensity > 0.0 && s.propensity <= 1.0);
            let snap = p.snapshot();
            prop_assert!(matches!(snap, PolicySnapshot::LinUcb(_)));
            if let PolicySnapshot::LinUcb(st) = snap {
                let d = st.dim;
                for arm in st.arms.values() {
                    prop_assert!(arm.a_inv.iter().chain(&arm.b).all(|v| v.is_finite()));
                    for i in 0..d {
                        for j in 0..d {
                            prop_assert!((arm.a_inv[i * d + j] - arm.a_inv[j * d + i]).abs() < 1e-6);
                        }
                    }
                }
            }
        }
    }
}
