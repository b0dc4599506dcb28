//! Policy traits.
//!
//! [`TargetPolicy`] is the read-only view the offline evaluator needs: an action
//! distribution over arms for a context. [`BanditPolicy`] adds selection and learning
//! for policies that run on the live path.
//!
//! Both live implementations ([`ThompsonGaussian`](crate::ThompsonGaussian) and
//! [`LinUcb`](crate::LinUcb)) synchronize internally, so a single instance is shared
//! behind an `Arc` and every method takes `&self`.
//!
//! # Example
//!
//! ```rust
//! use tunemux::{BanditPolicy, CandidateGrid, ParameterSet, TaskFeatures, ThompsonGaussian, ThompsonGaussianConfig};
//!
//! let arms = CandidateGrid::default().expand(&ParameterSet::default());
//! let policy = ThompsonGaussian::new(ThompsonGaussianConfig::default());
//! let features = TaskFeatures::default();
//!
//! let s = policy.select(&features, &arms).unwrap();
//! assert!(s.propensity > 0.0 && s.propensity <= 1.0);
//! policy.update(&features, &s.arm.id, 0.8).unwrap();
//! ```

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::arm::{Arm, BASELINE_ARM_ID};
use crate::decision::{PolicyKind, SelectionResult};
use crate::error::{Result, TuneError};
use crate::features::TaskFeatures;
use crate::thompson::ThompsonSnapshot;

/// Action distribution for a context.
pub trait TargetPolicy {
    /// Probability of each arm in `arms` for `features`. Sums to 1; keys are exactly the
    /// ids of `arms`.
    fn action_probabilities(
        &self,
        features: &TaskFeatures,
        arms: &[Arm],
    ) -> Result<BTreeMap<String, f64>>;
}

/// Stateful contextual bandit shared by concurrent callers.
pub trait BanditPolicy: TargetPolicy + Send + Sync {
    fn kind(&self) -> PolicyKind;

    /// Version tag written into every logged decision.
    fn version(&self) -> &str;

    /// Select an arm, giving up with [`TuneError::DeadlineExceeded`] if state cannot be
    /// read before `deadline`.
    ///
    /// An empty `arms` slice is a caller bug and returns [`TuneError::EmptyArmSet`].
    fn select_by(
        &self,
        features: &TaskFeatures,
        arms: &[Arm],
        deadline: Option<Instant>,
    ) -> Result<SelectionResult>;

    fn select(&self, features: &TaskFeatures, arms: &[Arm]) -> Result<SelectionResult> {
        self.select_by(features, arms, None)
    }

    /// Learn from an observed reward. Non-finite rewards are rejected without touching state.
    fn update(&self, features: &TaskFeatures, arm_id: &str, reward: f64) -> Result<()>;

    /// Model mean reward for `arm_id` at `features` (prior mean when unobserved).
    fn expected_reward(&self, features: &TaskFeatures, arm_id: &str) -> f64;

    /// Total accepted updates since construction or last restore.
    fn observations(&self) -> u64;

    fn snapshot(&self) -> PolicySnapshot;

    fn restore(&self, snapshot: PolicySnapshot) -> Result<()>;
}

/// Serializable policy state, for persistence across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicySnapshot {
    ThompsonGaussian(ThompsonSnapshot),
    #[cfg(feature = "contextual")]
    LinUcb(crate::contextual::LinUcbState),
}

/// Reject rewards that would poison a posterior.
pub(crate) fn check_reward(reward: f64) -> Result<()> {
    if reward.is_finite() {
        Ok(())
    } else {
        Err(TuneError::InvalidReward { value: reward })
    }
}

/// The frozen baseline: always the baseline arm.
///
/// If the arm set has no baseline arm the first arm stands in for it.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaselinePolicy;

impl TargetPolicy for BaselinePolicy {
    fn action_probabilities(
        &self,
        _features: &TaskFeatures,
        arms: &[Arm],
    ) -> Result<BTreeMap<String, f64>> {
        let first = arms.first().ok_or(TuneError::EmptyArmSet)?;
        let chosen = arms
            .iter()
            .find(|a| a.id == BASELINE_ARM_ID)
            .unwrap_or(first);
        Ok(arms
            .iter()
            .map(|a| (a.id.clone(), if a.id == chosen.id { 1.0 } else { 0.0 }))
            .collect())
    }
}

/// Uniform over the arm set. Handy as a logging policy in simulations.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformPolicy;

impl TargetPolicy for UniformPolicy {
    fn action_probabilities(
        &self,
        _features: &TaskFeatures,
        arms: &[Arm],
    ) -> Result<BTreeMap<String, f64>> {
        if arms.is_empty() {
            return Err(TuneError::EmptyArmSet);
        }
        let p = 1.0 / arms.len() as f64;
        Ok(arms.iter().map(|a| (a.id.clone(), p)).collect())
    }
}

impl<P: TargetPolicy + ?Sized> TargetPolicy for std::sync::Arc<P> {
    fn action_probabilities(
        &self,
        features: &TaskFeatures,
        arms: &[Arm],
    ) -> Result<BTreeMap<String, f64>> {
        (**self).action_probabilities(features, arms)
    }
}
