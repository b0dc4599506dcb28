//! Selection envelope returned by bandit policies.
//!
//! A [`SelectionResult`] is what gets logged: the chosen arm, the probability the
//! policy assigned to it, the full action distribution, and typed notes explaining
//! how the choice was made.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::arm::Arm;

/// Which algorithm produced a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    ThompsonGaussian,
    LinUcb,
    /// The frozen baseline (deterministic).
    Baseline,
}

impl PolicyKind {
    /// Version tag recorded with every logged decision.
    pub fn version_tag(self) -> &'static str {
        match self {
            PolicyKind::ThompsonGaussian => "thompson_gaussian@1.0.0",
            PolicyKind::LinUcb => "linucb@1.0.0",
            PolicyKind::Baseline => "baseline@1.0.0",
        }
    }
}

/// Audit notes attached to a selection.
///
/// Small and typed. Add variants rather than changing the meaning of existing ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "note", rename_all = "snake_case")]
pub enum SelectionNote {
    /// Sampled from Monte Carlo win frequencies of per-arm posterior draws.
    SampledPosteriorWinRate { mc_samples: u32 },
    /// Deterministic arg-max of upper confidence bounds.
    GreedyUpperBound,
    /// Uniform exploration branch of an epsilon-greedy rule.
    UniformExploration { epsilon: f64 },
    /// Policy had no observations; served the baseline.
    ColdStart,
    /// Inverse-CDF sampling ran off the end; last arm used.
    NumericalFallbackToLastArm,
}

/// One policy decision over a candidate arm set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionResult {
    pub policy: PolicyKind,
    pub policy_version: String,
    pub arm: Arm,
    /// Probability the policy assigned to `arm` in its current state. Always in `(0, 1]`.
    pub propensity: f64,
    /// Full action distribution over the arm set (sums to 1).
    pub probs: BTreeMap<String, f64>,
    /// Posterior (or model) mean reward of the chosen arm.
    pub expected_reward: f64,
    pub notes: Vec<SelectionNote>,
}

impl SelectionResult {
    /// Arm ids ordered by descending probability, excluding the chosen one.
    pub fn alternatives(&self, k: usize) -> Vec<String> {
        let mut rest: Vec<(&String, f64)> = self
            .probs
            .iter()
            .filter(|(id, _)| **id != self.arm.id)
            .map(|(id, &p)| (id, p))
            .collect();
        rest.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        rest.into_iter().take(k).map(|(id, _)| id.clone()).collect()
    }
}
