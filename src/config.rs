//! Typed configuration, loaded from TOML.
//!
//! Every field has a serde default, so a partial file (or an empty one) is valid:
//!
//! ```toml
//! seed = 7
//!
//! [policy]
//! kind = "thompson_gaussian"
//! mc_samples = 512
//!
//! [logger]
//! queue_capacity = 2048
//! backpressure = { policy = "drop_low_priority" }
//!
//! [task_types.summarize.baseline]
//! temperature = 0.4
//! max_tokens = 800
//!
//! [task_types.summarize.compliance]
//! cap = 2000000.0
//! waiver = 50000.0
//! ```
//!
//! A task type's config is fixed for the life of a rollout phase; changes go through
//! [`ParameterOptimizer::stage_config`](crate::ParameterOptimizer::stage_config) and apply
//! at the next control cycle.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::arm::{Arm, CandidateGrid, ParameterSet, TrustRegion};
use crate::budget::ComplianceConfig;
use crate::error::{Result, TuneError};
use crate::evaluator::PromotionConfig;
use crate::guardrail::QualityFloorConfig;
use crate::logger::{BackpressurePolicy, LoggerConfig};
use crate::monitor::SloConfig;
use crate::policy::BanditPolicy;
use crate::reward::ObjectiveWeights;
use crate::rollout::{PhasePlan, RolloutConfig};
use crate::stable_hash::mix_seed;
use crate::thompson::{ThompsonGaussian, ThompsonGaussianConfig};

#[cfg(feature = "contextual")]
use crate::contextual::{LinUcb, LinUcbConfig};

/// Which bandit runs for every task type, with its knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyConfig {
    ThompsonGaussian(ThompsonGaussianConfig),
    #[cfg(feature = "contextual")]
    #[serde(rename = "linucb")]
    LinUcb(LinUcbConfig),
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig::ThompsonGaussian(ThompsonGaussianConfig::default())
    }
}

impl PolicyConfig {
    /// Build a fresh policy whose seed is mixed with `stream` (one stream per task type).
    pub fn build(&self, stream: u64) -> std::sync::Arc<dyn BanditPolicy> {
        match *self {
            PolicyConfig::ThompsonGaussian(mut c) => {
                c.seed = mix_seed(&[c.seed, stream]);
                std::sync::Arc::new(ThompsonGaussian::new(c))
            }
            #[cfg(feature = "contextual")]
            PolicyConfig::LinUcb(mut c) => {
                c.seed = mix_seed(&[c.seed, stream]);
                std::sync::Arc::new(LinUcb::new(c))
            }
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            PolicyConfig::ThompsonGaussian(c) => {
                positive("policy.prior_precision", c.prior_precision)?;
                positive("policy.noise_precision", c.noise_precision)?;
                finite("policy.prior_mean", c.prior_mean)?;
                if c.mc_samples == 0 {
                    return Err(TuneError::Config("policy.mc_samples must be > 0".into()));
                }
            }
            #[cfg(feature = "contextual")]
            PolicyConfig::LinUcb(c) => {
                positive("policy.lambda", c.lambda)?;
                non_negative("policy.alpha", c.alpha)?;
                if !(c.epsilon.is_finite() && c.epsilon > 0.0 && c.epsilon <= 1.0) {
                    return Err(TuneError::Config(format!(
                        "policy.epsilon must be in (0, 1], got {}",
                        c.epsilon
                    )));
                }
                if !(c.decay.is_finite() && c.decay > 0.0 && c.decay <= 1.0) {
                    return Err(TuneError::Config(format!(
                        "policy.decay must be in (0, 1], got {}",
                        c.decay
                    )));
                }
                if c.dim == 0 {
                    return Err(TuneError::Config("policy.dim must be > 0".into()));
                }
            }
        }
        Ok(())
    }
}

/// Background control loop timing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub cycle_interval_ms: u64,
    /// Wall-clock budget of one cycle; task types not reached are picked up next cycle.
    pub cycle_budget_ms: u64,
    /// Window of logged decisions the promotion evaluation reads.
    pub evaluation_lookback_secs: i64,
    /// Reservations without an outcome after this long are released.
    pub reservation_ttl_secs: i64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 30_000,
            cycle_budget_ms: 5_000,
            evaluation_lookback_secs: 7 * 86_400,
            reservation_ttl_secs: 3_600,
        }
    }
}

/// Everything configurable for one task type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskTypeConfig {
    pub baseline: ParameterSet,
    pub grid: CandidateGrid,
    pub trust_region: TrustRegion,
    pub quality_floor: QualityFloorConfig,
    pub compliance: ComplianceConfig,
    pub slo: SloConfig,
    pub phases: PhasePlan,
    pub promotion: PromotionConfig,
    pub reward: ObjectiveWeights,
}

impl TaskTypeConfig {
    /// The candidate arm catalog, baseline first.
    pub fn arms(&self) -> Vec<Arm> {
        self.grid.expand(&self.baseline)
    }

    pub fn rollout_config(&self, evaluation_lookback_secs: i64) -> RolloutConfig {
        RolloutConfig {
            phases: self.phases,
            slo: self.slo,
            promotion: self.promotion,
            evaluation_lookback_secs,
        }
    }

    pub fn validate(&self, task_type: &str) -> Result<()> {
        let at = |field: &str| format!("task_types.{task_type}.{field}");
        if !self.baseline.is_well_formed() {
            return Err(TuneError::Config(format!(
                "{}: parameters out of range",
                at("baseline")
            )));
        }
        for &v in self.grid.temperature_deltas.iter().chain(&self.grid.top_p_deltas) {
            finite(&at("grid"), v)?;
        }
        let tr = &self.trust_region;
        non_negative(&at("trust_region.max_delta_temperature"), tr.max_delta_temperature)?;
        non_negative(&at("trust_region.max_delta_top_p"), tr.max_delta_top_p)?;
        non_negative(&at("trust_region.max_delta_penalty"), tr.max_delta_penalty)?;

        let q = &self.quality_floor;
        if !(q.min_quality.is_finite() && (0.0..=1.0).contains(&q.min_quality)) {
            return Err(TuneError::Config(format!(
                "{} must be in [0, 1], got {}",
                at("quality_floor.min_quality"),
                q.min_quality
            )));
        }
        if q.window == 0 {
            return Err(TuneError::Config(format!("{} must be > 0", at("quality_floor.window"))));
        }

        let c = &self.compliance;
        non_negative(&at("compliance.cap"), c.cap)?;
        non_negative(&at("compliance.waiver"), c.waiver)?;
        non_negative(&at("compliance.cost_per_token"), c.cost_per_token)?;

        if self.slo.window == 0 || self.slo.min_samples == 0 {
            return Err(TuneError::Config(format!(
                "{}: window and min_samples must be > 0",
                at("slo")
            )));
        }
        if self.slo.max_staleness_secs <= 0 {
            return Err(TuneError::Config(format!(
                "{} must be > 0",
                at("slo.max_staleness_secs")
            )));
        }
        let r = &self.slo.requirements;
        non_negative(&at("slo.requirements.max_latency_p99_ms"), r.max_latency_p99_ms)?;
        finite(&at("slo.requirements.min_quality"), r.min_quality)?;
        non_negative(&at("slo.requirements.max_error_rate"), r.max_error_rate)?;

        self.phases.validate()?;

        let p = &self.promotion;
        if !(p.alpha.is_finite() && p.alpha > 0.0 && p.alpha < 1.0) {
            return Err(TuneError::Config(format!(
                "{} must be in (0, 1), got {}",
                at("promotion.alpha"),
                p.alpha
            )));
        }
        if p.bootstrap_resamples == 0 {
            return Err(TuneError::Config(format!(
                "{} must be > 0",
                at("promotion.bootstrap_resamples")
            )));
        }
        positive(&at("promotion.weight_clip"), p.weight_clip)?;
        if !(0.0..=1.0).contains(&p.min_support) {
            return Err(TuneError::Config(format!(
                "{} must be in [0, 1], got {}",
                at("promotion.min_support"),
                p.min_support
            )));
        }

        let w = &self.reward;
        for (name, v) in [
            ("reward.w_quality", w.w_quality),
            ("reward.w_latency", w.w_latency),
            ("reward.w_tokens", w.w_tokens),
            ("reward.violation_penalty", w.violation_penalty),
        ] {
            finite(&at(name), v)?;
        }
        Ok(())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Root seed; per-task policy and routing seeds derive from it.
    pub seed: u64,
    pub policy: PolicyConfig,
    pub logger: LoggerConfig,
    pub control: ControlConfig,
    pub task_types: BTreeMap<String, TaskTypeConfig>,
}

impl OptimizerConfig {
    /// Parse and validate.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: OptimizerConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "loading optimizer config");
        Self::from_toml_str(&s)
    }

    /// Add (or replace) one task type.
    pub fn with_task_type(mut self, task_type: impl Into<String>, cfg: TaskTypeConfig) -> Self {
        self.task_types.insert(task_type.into(), cfg);
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;
        let l = &self.logger;
        if l.queue_capacity == 0 || l.batch_size == 0 || l.flush_interval_ms == 0 {
            return Err(TuneError::Config(
                "logger.queue_capacity, batch_size and flush_interval_ms must be > 0".into(),
            ));
        }
        if let BackpressurePolicy::SampleLowPriority { keep_one_in: 0 } = l.backpressure {
            return Err(TuneError::Config(
                "logger.backpressure.keep_one_in must be > 0".into(),
            ));
        }
        let c = &self.control;
        if c.cycle_interval_ms == 0 || c.cycle_budget_ms == 0 {
            return Err(TuneError::Config(
                "control.cycle_interval_ms and cycle_budget_ms must be > 0".into(),
            ));
        }
        if c.evaluation_lookback_secs <= 0 || c.reservation_ttl_secs <= 0 {
            return Err(TuneError::Config(
                "control.evaluation_lookback_secs and reservation_ttl_secs must be > 0".into(),
            ));
        }
        for (name, t) in &self.task_types {
            if name.trim().is_empty() {
                return Err(TuneError::Config("task type names must be non-empty".into()));
            }
            t.validate(name)?;
        }
        Ok(())
    }
}

fn finite(field: &str, v: f64) -> Result<()> {
    if v.is_finite() {
        Ok(())
    } else {
        Err(TuneError::Config(format!("{field} must be finite, got {v}")))
    }
}

fn non_negative(field: &str, v: f64) -> Result<()> {
    if v.is_finite() && v >= 0.0 {
        Ok(())
    } else {
        Err(TuneError::Config(format!(
            "{field} must be finite and >= 0, got {v}"
        )))
    }
}

fn positive(field: &str, v: f64) -> Result<()> {
    if v.is_finite() && v > 0.0 {
        Ok(())
    } else {
        Err(TuneError::Config(format!(
            "{field} must be finite and > 0, got {v}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let cfg = OptimizerConfig::from_toml_str("").expect("parse");
        assert_eq!(cfg, OptimizerConfig::default());
        assert!(cfg.task_types.is_empty());
    }

    #[test]
    fn partial_task_config_fills_defaults() {
        let cfg = OptimizerConfig::from_toml_str(
            r#"
            seed = 7

            [policy]
            kind = "thompson_gaussian"
            mc_samples = 64

            [logger]
            backpressure = { policy = "drop_low_priority" }

            [task_types.summarize.baseline]
            temperature = 0.4
            max_tokens = 800

            [task_types.summarize.compliance]
            cap = 1000.0
            waiver = 10.0

            [task_types.summarize.phases.canary]
            traffic_fraction = 0.1
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.seed, 7);
        assert!(matches!(
            cfg.policy,
            PolicyConfig::ThompsonGaussian(ThompsonGaussianConfig { mc_samples: 64, .. })
        ));
        assert_eq!(cfg.logger.backpressure, BackpressurePolicy::DropLowPriority);
        let t = &cfg.task_types["summarize"];
        assert_eq!(t.baseline.temperature, 0.4);
        assert_eq!(t.baseline.top_p, None);
        assert_eq!(t.compliance.waiver, 10.0);
        assert_eq!(t.phases.canary.traffic_fraction, 0.1);
        assert_eq!(t.phases.guarded.traffic_fraction, 0.25);
        assert_eq!(t.arms().first().map(|a| a.id.as_str()), Some("baseline"));
    }

    #[cfg(feature = "contextual")]
    #[test]
    fn linucb_kind_parses() {
        let cfg = OptimizerConfig::from_toml_str(
            r#"
            [policy]
            kind = "linucb"
            epsilon = 0.1
            "#,
        )
        .expect("parse");
        assert!(matches!(cfg.policy, PolicyConfig::LinUcb(c) if c.epsilon == 0.1));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let bad_phase = r#"
            [task_types.t.phases.canary]
            traffic_fraction = 1.5
        "#;
        assert!(matches!(
            OptimizerConfig::from_toml_str(bad_phase),
            Err(TuneError::Config(_))
        ));

        let bad_alpha = r#"
            [task_types.t.promotion]
            alpha = 0.0
        "#;
        assert!(matches!(
            OptimizerConfig::from_toml_str(bad_alpha),
            Err(TuneError::Config(_))
        ));

        let bad_support = r#"
            [task_types.t.promotion]
            min_support = 1.5
        "#;
        assert!(matches!(
            OptimizerConfig::from_toml_str(bad_support),
            Err(TuneError::Config(_))
        ));

        let bad_baseline = r#"
            [task_types.t.baseline]
            temperature = 3.5
            max_tokens = 100
        "#;
        assert!(matches!(
            OptimizerConfig::from_toml_str(bad_baseline),
            Err(TuneError::Config(_))
        ));
    }

    #[test]
    fn syntax_errors_surface_as_parse_errors() {
        assert!(matches!(
            OptimizerConfig::from_toml_str("seed = ["),
            Err(TuneError::ConfigParse(_))
        ));
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tunemux.toml");
        std::fs::write(&path, "seed = 3\n[task_types.classify]\n").expect("write");
        let cfg = OptimizerConfig::load(&path).expect("load");
        assert_eq!(cfg.seed, 3);
        assert!(cfg.task_types.contains_key("classify"));
    }

    #[test]
    fn built_policy_matches_kind() {
        let p = PolicyConfig::default().build(1);
        assert_eq!(p.version(), "thompson_gaussian@1.0.0");
        assert_eq!(p.observations(), 0);
    }
}
