//! Quality gate: filters the candidate arm set before the bandit sees it.
//!
//! Three hard filters, in order:
//! 1. trust region around the baseline parameters,
//! 2. quality floor over a sliding window of observed quality (plus explicit flags),
//! 3. compliance headroom for the arm's estimated cost.
//!
//! If every arm is filtered out the gate returns the baseline alone with
//! `fallback_used = true`. The result is never empty.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::arm::{Arm, TrustRegion, TrustViolation};
use crate::budget::ComplianceBudget;
use crate::error::{Result, TuneError};

/// Quality-floor settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityFloorConfig {
    /// Arms whose windowed mean quality is below this are excluded.
    pub min_quality: f64,
    /// Observations required before the floor applies to an arm.
    pub min_samples: usize,
    /// Sliding window length per arm.
    pub window: usize,
}

impl Default for QualityFloorConfig {
    fn default() -> Self {
        Self {
            min_quality: 0.5,
            min_samples: 20,
            window: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Why an arm was excluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    Malformed,
    TrustRegion { violations: Vec<TrustViolation> },
    QualityFloor { mean: f64, floor: f64, samples: usize },
    Flagged { note: String },
    ComplianceHeadroom { cost: f64, headroom: f64, waiver: f64 },
}

impl RejectReason {
    pub fn severity(&self) -> Severity {
        match self {
            RejectReason::Malformed | RejectReason::TrustRegion { .. } => Severity::Error,
            RejectReason::QualityFloor { .. } | RejectReason::Flagged { .. } => Severity::Warning,
            RejectReason::ComplianceHeadroom { .. } => Severity::Info,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmRejection {
    pub arm_id: String,
    pub reason: RejectReason,
    pub severity: Severity,
}

/// Output of [`QualityGateValidator::filter`].
#[derive(Debug, Clone)]
pub struct GateReport {
    /// Arms the bandit may choose from. Never empty.
    pub eligible: Vec<Arm>,
    pub rejected: Vec<ArmRejection>,
    /// The filters removed everything and the baseline was substituted.
    pub fallback_used: bool,
}

/// Single-arm verdict, for pre-deployment checks outside the request path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ValidationResult {
    Approved {
        /// Windowed mean quality minus the baseline's, when both are known.
        quality_delta: Option<f64>,
        token_delta: i64,
        /// `1 - normalized distance` from the baseline inside the trust region.
        confidence_score: f64,
    },
    Rejected {
        reason: RejectReason,
        severity: Severity,
    },
}

#[derive(Debug, Clone, Default)]
struct QualityWindow {
    values: VecDeque<f64>,
    sum: f64,
}

impl QualityWindow {
    fn push(&mut self, q: f64, cap: usize) {
        let cap = cap.max(1);
        self.values.push_back(q);
        self.sum += q;
        while self.values.len() > cap {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
            }
        }
    }

    fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            None
        } else {
            Some(self.sum / self.values.len() as f64)
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ArmHistory {
    quality: HashMap<String, QualityWindow>,
    flagged: HashMap<String, String>,
}

/// Per-task-type gate over the candidate arms.
#[derive(Debug)]
pub struct QualityGateValidator {
    baseline: Arm,
    trust: TrustRegion,
    floor: QualityFloorConfig,
    history: RwLock<ArmHistory>,
}

impl QualityGateValidator {
    pub fn new(baseline: Arm, trust: TrustRegion, floor: QualityFloorConfig) -> Self {
        Self {
            baseline,
            trust,
            floor,
            history: RwLock::new(ArmHistory::default()),
        }
    }

    /// Keep the quality windows and flags of `previous` (config reloads).
    pub fn with_history_of(self, previous: &QualityGateValidator) -> Self {
        let carried = previous.history.read().clone();
        *self.history.write() = carried;
        self
    }

    pub fn baseline(&self) -> &Arm {
        &self.baseline
    }

    pub fn trust_region(&self) -> &TrustRegion {
        &self.trust
    }

    /// Feed an observed quality score for `arm_id`. Non-finite values are dropped.
    pub fn record_quality(&self, arm_id: &str, quality: f64) {
        if !quality.is_finite() {
            return;
        }
        let cap = self.floor.window;
        self.history
            .write()
            .quality
            .entry(arm_id.to_string())
            .or_default()
            .push(quality.clamp(0.0, 1.0), cap);
    }

    /// Exclude an arm until [`unflag_arm`](Self::unflag_arm) (e.g. after a failed evaluation).
    pub fn flag_arm(&self, arm_id: &str, note: impl Into<String>) {
        self.history
            .write()
            .flagged
            .insert(arm_id.to_string(), note.into());
    }

    pub fn unflag_arm(&self, arm_id: &str) -> bool {
        self.history.write().flagged.remove(arm_id).is_some()
    }

    /// `(windowed mean, samples)` for an arm.
    pub fn quality_summary(&self, arm_id: &str) -> Option<(f64, usize)> {
        let h = self.history.read();
        let w = h.quality.get(arm_id)?;
        Some((w.mean()?, w.values.len()))
    }

    fn static_check(&self, arm: &Arm, history: &ArmHistory) -> Option<RejectReason> {
        if !arm.params.is_well_formed() {
            return Some(RejectReason::Malformed);
        }
        let violations = self.trust.violations(&self.baseline.params, &arm.params);
        if !violations.is_empty() {
            return Some(RejectReason::TrustRegion { violations });
        }
        if let Some(note) = history.flagged.get(&arm.id) {
            return Some(RejectReason::Flagged { note: note.clone() });
        }
        if let Some(w) = history.quality.get(&arm.id) {
            if w.values.len() >= self.floor.min_samples.max(1) {
                if let Some(mean) = w.mean() {
                    if mean < self.floor.min_quality {
                        return Some(RejectReason::QualityFloor {
                            mean,
                            floor: self.floor.min_quality,
                            samples: w.values.len(),
                        });
                    }
                }
            }
        }
        None
    }

    /// Filter `arms` for the request path.
    ///
    /// Takes only shared locks; with a deadline, gives up with
    /// [`TuneError::DeadlineExceeded`] rather than wait.
    pub fn filter(
        &self,
        arms: &[Arm],
        budget: &ComplianceBudget,
        now: DateTime<Utc>,
        deadline: Option<Instant>,
    ) -> Result<GateReport> {
        let history = match deadline {
            Some(d) => self
                .history
                .try_read_until(d)
                .ok_or(TuneError::DeadlineExceeded)?,
            None => self.history.read(),
        };
        let (headroom, cost_cfg) = budget.headroom_before(now, deadline)?;
        let waiver = cost_cfg.waiver;

        let mut eligible = Vec::with_capacity(arms.len());
        let mut rejected = Vec::new();
        for arm in arms {
            let reason = self.static_check(arm, &history).or_else(|| {
                let cost = cost_cfg.cost_of_tokens(arm.params.max_tokens);
                (headroom - cost < -waiver).then_some(RejectReason::ComplianceHeadroom {
                    cost,
                    headroom,
                    waiver,
                })
            });
            match reason {
                None => eligible.push(arm.clone()),
                Some(reason) => rejected.push(ArmRejection {
                    arm_id: arm.id.clone(),
                    severity: reason.severity(),
                    reason,
                }),
            }
        }
        drop(history);

        let fallback_used = eligible.is_empty();
        if fallback_used {
            eligible.push(self.baseline.clone());
        }
        Ok(GateReport {
            eligible,
            rejected,
            fallback_used,
        })
    }

    /// Check one arm against the trust region, flags, and quality floor.
    pub fn validate(&self, arm: &Arm) -> ValidationResult {
        let history = self.history.read();
        if let Some(reason) = self.static_check(arm, &history) {
            return ValidationResult::Rejected {
                severity: reason.severity(),
                reason,
            };
        }
        let mean_of = |id: &str| history.quality.get(id).and_then(QualityWindow::mean);
        let quality_delta = match (mean_of(&arm.id), mean_of(&self.baseline.id)) {
            (Some(a), Some(b)) => Some(a - b),
            _ => None,
        };
        let b = &self.baseline.params;
        let p = &arm.params;
        let t = &self.trust;
        let ratio = |delta: f64, max: f64| if max > 0.0 { (delta / max).min(1.0) } else { 0.0 };
        let distance = [
            ratio((p.temperature - b.temperature).abs(), t.max_delta_temperature),
            ratio((p.effective_top_p() - b.effective_top_p()).abs(), t.max_delta_top_p),
            ratio(
                (f64::from(p.max_tokens) - f64::from(b.max_tokens)).abs(),
                f64::from(t.max_delta_max_tokens),
            ),
        ]
        .into_iter()
        .fold(0.0f64, f64::max);
        ValidationResult::Approved {
            quality_delta,
            token_delta: i64::from(p.max_tokens) - i64::from(b.max_tokens),
            confidence_score: 1.0 - distance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::{CandidateGrid, ParameterSet};
    use crate::budget::{Attribution, ComplianceConfig};

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_default()
    }

    fn gate(trust: TrustRegion) -> (QualityGateValidator, Vec<Arm>) {
        let base = ParameterSet::default();
        let arms = CandidateGrid::default().expand(&base);
        let v = QualityGateValidator::new(
            Arm::baseline(base),
            trust,
            QualityFloorConfig {
                min_quality: 0.6,
                min_samples: 5,
                window: 50,
            },
        );
        (v, arms)
    }

    fn roomy_budget() -> ComplianceBudget {
        ComplianceBudget::new("t", ComplianceConfig::default(), now())
    }

    #[test]
    fn everything_passes_default_region() {
        let (v, arms) = gate(TrustRegion::default());
        let r = v.filter(&arms, &roomy_budget(), now(), None).expect("filter");
        assert_eq!(r.eligible.len(), arms.len());
        assert!(!r.fallback_used);
    }

    #[test]
    fn tight_trust_region_keeps_only_small_moves() {
        let (v, arms) = gate(TrustRegion {
            max_delta_temperature: 0.05,
            ..TrustRegion::default()
        });
        let r = v.filter(&arms, &roomy_budget(), now(), None).expect("filter");
        assert!(r
            .eligible
            .iter()
            .all(|a| (a.params.temperature - 0.7).abs() <= 0.05 + 1e-9));
        assert_eq!(r.eligible.len(), 3);
        assert!(r.rejected.iter().all(|x| x.severity == Severity::Error));
    }

    #[test]
    fn quality_floor_excludes_after_min_samples() {
        let (v, arms) = gate(TrustRegion::default());
        let bad = arms[3].id.clone();
        for _ in 0..4 {
            v.record_quality(&bad, 0.1);
        }
        let r = v.filter(&arms, &roomy_budget(), now(), None).expect("filter");
        assert!(r.eligible.iter().any(|a| a.id == bad), "below min_samples");
        v.record_quality(&bad, 0.1);
        let r = v.filter(&arms, &roomy_budget(), now(), None).expect("filter");
        assert!(r.eligible.iter().all(|a| a.id != bad));
        assert!(matches!(
            r.rejected[0].reason,
            RejectReason::QualityFloor { samples: 5, .. }
        ));
    }

    #[test]
    fn exhausted_budget_falls_back_to_baseline() {
        let (v, arms) = gate(TrustRegion::default());
        let budget = ComplianceBudget::new(
            "t",
            ComplianceConfig {
                cap: 950.0,
                waiver: 0.0,
                period_secs: None,
                cost_per_token: 1.0,
            },
            now(),
        );
        let r = v.filter(&arms, &budget, now(), None).expect("filter");
        // Only 900-token arms fit under 950.
        assert!(r.eligible.iter().all(|a| a.params.max_tokens == 900));

        budget
            .reserve(900.0, &Attribution::default(), now())
            .expect("reserve");
        let r = v.filter(&arms, &budget, now(), None).expect("filter");
        assert!(r.fallback_used);
        assert_eq!(r.eligible.len(), 1);
        assert!(r.eligible[0].is_baseline());
    }

    #[test]
    fn flagged_arm_is_excluded_until_unflagged() {
        let (v, arms) = gate(TrustRegion::default());
        v.flag_arm(&arms[1].id, "failed offline evaluation");
        assert!(matches!(
            v.validate(&arms[1]),
            ValidationResult::Rejected {
                severity: Severity::Warning,
                ..
            }
        ));
        assert!(v.unflag_arm(&arms[1].id));
        assert!(matches!(v.validate(&arms[1]), ValidationResult::Approved { .. }));
    }

    #[test]
    fn validate_reports_distance_as_confidence() {
        let (v, arms) = gate(TrustRegion::default());
        let ValidationResult::Approved {
            confidence_score, ..
        } = v.validate(&arms[0])
        else {
            panic!("baseline must validate");
        };
        assert_eq!(confidence_score, 1.0);
    }
}
