//! Task outcomes and the reward function.
//!
//! The reward is a pure function of `(outcome, constraints, weights)`:
//!
//! ```text
//!   r = w_quality * quality - w_latency * latency_ms / 1000 - w_tokens * tokens / 1000
//! ```
//!
//! Any hard violation (declared failure, compliance flag, exceeding the caller's latency
//! or token limits) replaces the weighted sum with `-violation_penalty`.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TuneError};

/// What happened when a recommended parameter set was used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    /// Quality score in `[0, 1]`.
    pub quality: f64,
    pub latency_ms: u64,
    pub tokens_used: u32,
    /// Declared constraint violations (e.g. `"compliance:pii"`).
    #[serde(default)]
    pub violations: Vec<String>,
}

impl TaskOutcome {
    /// Reject malformed outcomes. Nothing is coerced.
    pub fn validate(&self) -> Result<()> {
        if !self.quality.is_finite() {
            return Err(TuneError::InvalidOutcome(format!(
                "quality must be finite, got {}",
                self.quality
            )));
        }
        if !(0.0..=1.0).contains(&self.quality) {
            return Err(TuneError::InvalidOutcome(format!(
                "quality must be in [0, 1], got {}",
                self.quality
            )));
        }
        Ok(())
    }

    /// Counts as an error for SLO error-rate purposes.
    pub fn is_error(&self) -> bool {
        !self.success
    }
}

/// Weights for the scalar reward.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectiveWeights {
    pub w_quality: f64,
    /// Per second of latency.
    pub w_latency: f64,
    /// Per thousand tokens.
    pub w_tokens: f64,
    /// Magnitude of the reward assigned on a hard violation.
    pub violation_penalty: f64,
}

impl Default for ObjectiveWeights {
    fn default() -> Self {
        Self {
            w_quality: 1.0,
            w_latency: 0.1,
            w_tokens: 0.05,
            violation_penalty: 1.0,
        }
    }
}

/// Caller-side hard limits checked against the outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardConstraints {
    pub max_latency_ms: Option<u64>,
    pub max_tokens: Option<u32>,
}

/// Why an outcome received the violation penalty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Violation {
    TaskFailed,
    Declared(String),
    LatencyLimit { limit_ms: u64, observed_ms: u64 },
    TokenLimit { limit: u32, observed: u32 },
}

/// Reward with its breakdown, for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub reward: f64,
    pub quality_term: f64,
    pub latency_term: f64,
    pub token_term: f64,
    pub violations: Vec<Violation>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardFunction {
    pub weights: ObjectiveWeights,
}

impl RewardFunction {
    pub fn new(weights: ObjectiveWeights) -> Self {
        Self { weights }
    }

    pub fn reward(&self, outcome: &TaskOutcome, constraints: &RewardConstraints) -> Result<f64> {
        self.breakdown(outcome, constraints).map(|b| b.reward)
    }

    pub fn breakdown(
        &self,
        outcome: &TaskOutcome,
        constraints: &RewardConstraints,
    ) -> Result<RewardBreakdown> {
        outcome.validate()?;
        let w = self.weights;

        let mut violations = Vec::new();
        if !outcome.success {
            violations.push(Violation::TaskFailed);
        }
        violations.extend(outcome.violations.iter().cloned().map(Violation::Declared));
        if let Some(limit) = constraints.max_latency_ms {
            if outcome.latency_ms > limit {
                violations.push(Violation::LatencyLimit {
                    limit_ms: limit,
                    observed_ms: outcome.latency_ms,
                });
            }
        }
        if let Some(limit) = constraints.max_tokens {
            if outcome.tokens_used > limit {
                violations.push(Violation::TokenLimit {
                    limit,
                    observed: outcome.tokens_used,
                });
            }
        }

        let quality_term = w.w_quality * outcome.quality;
        let latency_term = -w.w_latency * outcome.latency_ms as f64 / 1000.0;
        let token_term = -w.w_tokens * f64::from(outcome.tokens_used) / 1000.0;
        let reward = if violations.is_empty() {
            quality_term + latency_term + token_term
        } else {
            -w.violation_penalty.abs()
        };
        if !reward.is_finite() {
            return Err(TuneError::InvalidReward { value: reward });
        }
        Ok(RewardBreakdown {
            reward,
            quality_term,
            latency_term,
            token_term,
            violations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ok(quality: f64, latency_ms: u64, tokens_used: u32) -> TaskOutcome {
        TaskOutcome {
            success: true,
            quality,
            latency_ms,
            tokens_used,
            violations: vec![],
        }
    }

    #[test]
    fn default_weights_match_formula() {
        let r = RewardFunction::default()
            .reward(&ok(0.9, 2000, 1000), &RewardConstraints::default())
            .expect("reward");
        // 0.9 - 0.1 * 2.0 - 0.05 * 1.0
        assert!((r - 0.65).abs() < 1e-12, "r={r}");
    }

    #[test]
    fn violations_take_the_penalty() {
        let f = RewardFunction::default();
        let none = RewardConstraints::default();
        let failed = TaskOutcome {
            success: false,
            ..ok(0.9, 10, 10)
        };
        assert_eq!(f.reward(&failed, &none).expect("reward"), -1.0);

        let flagged = TaskOutcome {
            violations: vec!["compliance:pii".into()],
            ..ok(0.9, 10, 10)
        };
        let b = f.breakdown(&flagged, &none).expect("breakdown");
        assert_eq!(b.reward, -1.0);
        assert_eq!(b.violations, vec![Violation::Declared("compliance:pii".into())]);

        let slow = RewardConstraints {
            max_latency_ms: Some(100),
            max_tokens: None,
        };
        assert_eq!(f.reward(&ok(1.0, 150, 10), &slow).expect("reward"), -1.0);
    }

    #[test]
    fn malformed_quality_is_rejected() {
        let f = RewardFunction::default();
        let none = RewardConstraints::default();
        assert!(matches!(
            f.reward(&ok(f64::NAN, 1, 1), &none),
            Err(TuneError::InvalidOutcome(_))
        ));
        assert!(f.reward(&ok(1.5, 1, 1), &none).is_err());
    }

    proptest! {
        #[test]
        fn reward_is_deterministic_and_bounded(
            quality in 0.0f64..=1.0,
            latency in 0u64..60_000,
            tokens in 0u32..10_000,
            success in any::<bool>(),
        ) {
            let f = RewardFunction::default();
            let o = TaskOutcome { success, ..ok(quality, latency, tokens) };
            let c = RewardConstraints::default();
            let a = f.reward(&o, &c).expect("reward");
            let b = f.reward(&o, &c).expect("reward");
            prop_assert_eq!(a, b);
            prop_assert!(a <= 1.0);
            prop_assert!(a >= -1.0 - 6.0 - 0.5);
        }
    }
}
