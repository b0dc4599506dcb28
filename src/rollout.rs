//! Phased rollout: `Shadow -> Canary -> Guarded -> General`.
//!
//! The manager owns, per task type, the current phase and whether the candidate policy
//! is enabled. Routing reads that state under shared locks; only
//! [`RolloutManager::evaluate_cycle`] (and explicit operator calls) write it.
//!
//! Per cycle and task type:
//! - SLO breach: roll back exactly one phase, or disable the candidate in `Shadow`.
//! - SLO unknown: hold.
//! - SLO healthy and the phase's observation window elapsed: run the offline
//!   evaluator and advance one phase on `Pass`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::arm::Arm;
use crate::error::{Result, TuneError};
use crate::evaluator::{EvaluationReport, OfflineEvaluator, PromotionConfig, Verdict};
use crate::events::{AuditEvent, EventSink};
use crate::monitor::{RegressionThresholds, SloBreach, SloConfig, SloMonitor, SloSample, SloStatus};
use crate::policy::TargetPolicy;
use crate::stable_hash::{mix_seed, stable_hash64, stable_unit};
use crate::store::DecisionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Shadow,
    Canary,
    Guarded,
    General,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Shadow, Phase::Canary, Phase::Guarded, Phase::General];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn next(self) -> Option<Phase> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn previous(self) -> Option<Phase> {
        self.index().checked_sub(1).map(|i| Self::ALL[i])
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Shadow => "shadow",
            Phase::Canary => "canary",
            Phase::Guarded => "guarded",
            Phase::General => "general",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which policy served a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Frozen baseline parameters.
    Baseline,
    /// Bandit-selected parameters.
    Candidate,
}

/// Settings for one phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    /// Fraction of requests routed to the candidate.
    pub traffic_fraction: f64,
    /// Minimum time in the phase before promotion is considered.
    pub min_observation_secs: i64,
    pub thresholds: RegressionThresholds,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            traffic_fraction: 0.0,
            min_observation_secs: 3_600,
            thresholds: RegressionThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhasePlan {
    pub shadow: PhaseConfig,
    pub canary: PhaseConfig,
    pub guarded: PhaseConfig,
    pub general: PhaseConfig,
}

impl Default for PhasePlan {
    fn default() -> Self {
        let with = |traffic_fraction, min_observation_secs| PhaseConfig {
            traffic_fraction,
            min_observation_secs,
            ..PhaseConfig::default()
        };
        Self {
            shadow: with(0.0, 3_600),
            canary: with(0.05, 3_600),
            guarded: with(0.25, 7_200),
            general: with(1.0, 0),
        }
    }
}

impl PhasePlan {
    pub fn get(&self, phase: Phase) -> &PhaseConfig {
        match phase {
            Phase::Shadow => &self.shadow,
            Phase::Canary => &self.canary,
            Phase::Guarded => &self.guarded,
            Phase::General => &self.general,
        }
    }

    /// Fractions in `[0, 1]` and non-decreasing; thresholds finite and non-negative.
    pub fn validate(&self) -> Result<()> {
        let mut prev = 0.0;
        for phase in Phase::ALL {
            let p = self.get(phase);
            let f = p.traffic_fraction;
            if !(f.is_finite() && (0.0..=1.0).contains(&f)) {
                return Err(TuneError::Config(format!(
                    "{phase}: traffic_fraction must be in [0, 1], got {f}"
                )));
            }
            if f < prev {
                return Err(TuneError::Config(format!(
                    "{phase}: traffic_fraction {f} is below the previous phase's {prev}"
                )));
            }
            prev = f;
            if p.min_observation_secs < 0 {
                return Err(TuneError::Config(format!(
                    "{phase}: min_observation_secs must be >= 0"
                )));
            }
            let t = &p.thresholds;
            for (name, v) in [
                ("max_latency_regression", t.max_latency_regression),
                ("max_quality_regression", t.max_quality_regression),
                ("max_error_rate_regression", t.max_error_rate_regression),
            ] {
                if !(v.is_finite() && v >= 0.0) {
                    return Err(TuneError::Config(format!(
                        "{phase}: {name} must be finite and >= 0, got {v}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Rollout settings for one task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    pub phases: PhasePlan,
    pub slo: SloConfig,
    pub promotion: PromotionConfig,
    /// Only decisions this recent feed the promotion evaluation.
    pub evaluation_lookback_secs: i64,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            phases: PhasePlan::default(),
            slo: SloConfig::default(),
            promotion: PromotionConfig::default(),
            evaluation_lookback_secs: 7 * 86_400,
        }
    }
}

/// Routing decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub phase: Phase,
    /// Effective candidate fraction (0 when the candidate is disabled).
    pub traffic_fraction: f64,
    pub route: Route,
    pub candidate_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum TransitionCause {
    Promoted { ci_lower: f64, ci_upper: f64 },
    SloBreach { breaches: Vec<SloBreach> },
    Operator { note: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub task_type: String,
    pub at: DateTime<Utc>,
    pub from: Phase,
    /// `None` when the candidate was disabled.
    pub to: Option<Phase>,
    pub cause: TransitionCause,
}

/// Point-in-time view of one task type's rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutStatus {
    pub phase: Phase,
    pub entered_at: DateTime<Utc>,
    pub candidate_enabled: bool,
    pub traffic_fraction: f64,
    pub last_slo: Option<SloStatus>,
    pub last_evaluation: Option<EvaluationReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub evaluated: Vec<String>,
    /// Task types not reached before the cycle deadline.
    pub skipped: Vec<String>,
    pub transitions: Vec<Transition>,
}

#[derive(Debug)]
struct TaskState {
    phase: Phase,
    entered_at: DateTime<Utc>,
    enabled: bool,
    last_slo: Option<SloStatus>,
    last_evaluation: Option<EvaluationReport>,
    history: Vec<Transition>,
}

struct TaskRollout {
    task_type: String,
    state: RwLock<TaskState>,
    cfg: RwLock<RolloutConfig>,
    staged: Mutex<Option<RolloutConfig>>,
    monitor: SloMonitor,
    candidate: Arc<dyn TargetPolicy + Send + Sync>,
    policy_version: String,
    arms: RwLock<Vec<Arm>>,
}

impl TaskRollout {
    fn fraction(&self, phase: Phase, enabled: bool) -> f64 {
        if enabled {
            self.cfg.read().phases.get(phase).traffic_fraction
        } else {
            0.0
        }
    }
}

/// Per-task-type rollout state machines.
pub struct RolloutManager {
    seed: u64,
    store: Arc<dyn DecisionStore>,
    events: Arc<dyn EventSink>,
    tasks: RwLock<BTreeMap<String, Arc<TaskRollout>>>,
    cursor: AtomicUsize,
}

impl std::fmt::Debug for RolloutManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RolloutManager")
            .field("seed", &self.seed)
            .field("tasks", &self.tasks.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl RolloutManager {
    pub fn new(seed: u64, store: Arc<dyn DecisionStore>, events: Arc<dyn EventSink>) -> Self {
        Self {
            seed,
            store,
            events,
            tasks: RwLock::new(BTreeMap::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Start tracking `task_type` in `Shadow` with the candidate enabled.
    pub fn register(
        &self,
        task_type: impl Into<String>,
        cfg: RolloutConfig,
        candidate: Arc<dyn TargetPolicy + Send + Sync>,
        policy_version: impl Into<String>,
        arms: Vec<Arm>,
        now: DateTime<Utc>,
    ) {
        let task_type = task_type.into();
        let t = TaskRollout {
            task_type: task_type.clone(),
            state: RwLock::new(TaskState {
                phase: Phase::Shadow,
                entered_at: now,
                enabled: true,
                last_slo: None,
                last_evaluation: None,
                history: Vec::new(),
            }),
            monitor: SloMonitor::new(cfg.slo, Phase::Shadow),
            cfg: RwLock::new(cfg),
            staged: Mutex::new(None),
            candidate,
            policy_version: policy_version.into(),
            arms: RwLock::new(arms),
        };
        self.tasks.write().insert(task_type, Arc::new(t));
    }

    fn task(&self, task_type: &str) -> Result<Arc<TaskRollout>> {
        self.tasks
            .read()
            .get(task_type)
            .cloned()
            .ok_or_else(|| TuneError::NoPolicyConfigured {
                task_type: task_type.to_string(),
            })
    }

    pub fn task_types(&self) -> Vec<String> {
        self.tasks.read().keys().cloned().collect()
    }

    /// Coin flip for one request: candidate with the phase's traffic fraction.
    ///
    /// The flip is a stable hash of the request id, independent of any bandit
    /// randomness.
    pub fn route(&self, task_type: &str, request_id: &Uuid) -> Option<RouteDecision> {
        let t = self.tasks.read().get(task_type).cloned()?;
        let (phase, enabled) = {
            let s = t.state.read();
            (s.phase, s.enabled)
        };
        let traffic_fraction = t.fraction(phase, enabled);
        let seed = mix_seed(&[self.seed, stable_hash64(0, task_type)]);
        let u = stable_unit(seed, &request_id.to_string());
        let route = if u < traffic_fraction {
            Route::Candidate
        } else {
            Route::Baseline
        };
        Some(RouteDecision {
            phase,
            traffic_fraction,
            route,
            candidate_enabled: enabled,
        })
    }

    pub fn phase(&self, task_type: &str) -> Option<Phase> {
        let t = self.tasks.read().get(task_type).cloned()?;
        let phase = t.state.read().phase;
        Some(phase)
    }

    pub fn traffic_fraction(&self, task_type: &str) -> Option<f64> {
        let t = self.tasks.read().get(task_type).cloned()?;
        let (phase, enabled) = {
            let s = t.state.read();
            (s.phase, s.enabled)
        };
        Some(t.fraction(phase, enabled))
    }

    pub fn status(&self, task_type: &str) -> Option<RolloutStatus> {
        let t = self.tasks.read().get(task_type).cloned()?;
        let s = t.state.read();
        Some(RolloutStatus {
            phase: s.phase,
            entered_at: s.entered_at,
            candidate_enabled: s.enabled,
            traffic_fraction: t.fraction(s.phase, s.enabled),
            last_slo: s.last_slo.clone(),
            last_evaluation: s.last_evaluation.clone(),
        })
    }

    pub fn history(&self, task_type: &str) -> Vec<Transition> {
        self.tasks
            .read()
            .get(task_type)
            .map(|t| t.state.read().history.clone())
            .unwrap_or_default()
    }

    /// Feed a live measurement to the task type's SLO monitor.
    pub fn record_sample(&self, task_type: &str, route: Route, sample: SloSample) {
        if let Some(t) = self.tasks.read().get(task_type) {
            t.monitor.record(route, sample);
        }
    }

    /// Queue a config change; it takes effect at the start of the next cycle.
    pub fn stage_config(&self, task_type: &str, cfg: RolloutConfig) -> Result<()> {
        cfg.phases.validate()?;
        let t = self.task(task_type)?;
        *t.staged.lock() = Some(cfg);
        Ok(())
    }

    /// Replace the arm catalog used for promotion evaluation.
    pub fn set_arms(&self, task_type: &str, arms: Vec<Arm>) -> Result<()> {
        let t = self.task(task_type)?;
        *t.arms.write() = arms;
        Ok(())
    }

    /// Operator action: re-enable a disabled candidate, starting again from `Shadow`.
    pub fn enable_candidate(&self, task_type: &str, now: DateTime<Utc>) -> Result<()> {
        let t = self.task(task_type)?;
        {
            let mut s = t.state.write();
            if s.enabled {
                return Ok(());
            }
            s.enabled = true;
            s.phase = Phase::Shadow;
            s.entered_at = now;
            s.last_evaluation = None;
        }
        t.monitor.enter_phase(Phase::Shadow);
        self.events.emit(&AuditEvent::CandidateEnabled {
            at: now,
            task_type: t.task_type.clone(),
            policy_version: t.policy_version.clone(),
            phase: Phase::Shadow,
        });
        Ok(())
    }

    /// Operator action: force a phase.
    pub fn override_phase(&self, task_type: &str, phase: Phase, now: DateTime<Utc>) -> Result<()> {
        let t = self.task(task_type)?;
        let from = {
            let mut s = t.state.write();
            let from = s.phase;
            s.phase = phase;
            s.entered_at = now;
            s.history.push(Transition {
                task_type: t.task_type.clone(),
                at: now,
                from,
                to: Some(phase),
                cause: TransitionCause::Operator {
                    note: "phase override".to_string(),
                },
            });
            from
        };
        t.monitor.enter_phase(phase);
        self.events.emit(&AuditEvent::ConfigApplied {
            at: now,
            task_type: t.task_type.clone(),
            detail: format!("phase override {from} -> {phase}"),
        });
        Ok(())
    }

    /// One monitoring cycle over every task type.
    ///
    /// Stops starting new task types once `deadline` passes; the next cycle resumes
    /// where this one stopped.
    pub fn evaluate_cycle(&self, now: DateTime<Utc>, deadline: Instant) -> CycleReport {
        let tasks: Vec<Arc<TaskRollout>> = self.tasks.read().values().cloned().collect();
        let mut report = CycleReport::default();
        if tasks.is_empty() {
            return report;
        }
        let start = self.cursor.load(Ordering::Relaxed) % tasks.len();
        let mut done = 0usize;
        for i in 0..tasks.len() {
            let t = &tasks[(start + i) % tasks.len()];
            if Instant::now() >= deadline {
                report.skipped.push(t.task_type.clone());
                continue;
            }
            if let Some(tr) = self.evaluate_task(t, now, deadline) {
                report.transitions.push(tr);
            }
            report.evaluated.push(t.task_type.clone());
            done += 1;
        }
        self.cursor.store(start + done, Ordering::Relaxed);
        if !report.skipped.is_empty() {
            tracing::warn!(
                skipped = report.skipped.len(),
                "rollout cycle hit its deadline"
            );
        }
        report
    }

    fn apply_staged(&self, t: &TaskRollout, now: DateTime<Utc>) {
        let Some(cfg) = t.staged.lock().take() else {
            return;
        };
        t.monitor.reconfigure(cfg.slo);
        *t.cfg.write() = cfg;
        self.events.emit(&AuditEvent::ConfigApplied {
            at: now,
            task_type: t.task_type.clone(),
            detail: "rollout config".to_string(),
        });
    }

    fn evaluate_task(
        &self,
        t: &TaskRollout,
        now: DateTime<Utc>,
        deadline: Instant,
    ) -> Option<Transition> {
        self.apply_staged(t, now);
        let cfg = t.cfg.read().clone();
        let (phase, entered_at, enabled) = {
            let s = t.state.read();
            (s.phase, s.entered_at, s.enabled)
        };
        if !enabled {
            return None;
        }
        let pc = cfg.phases.get(phase);
        let slo = t.monitor.check(phase, &pc.thresholds, now);
        t.state.write().last_slo = Some(slo.clone());

        match slo {
            SloStatus::Breach { breaches, .. } => {
                let to = phase.previous();
                self.transition(t, &cfg, phase, to, now, TransitionCause::SloBreach { breaches })
            }
            SloStatus::Unknown { reason } => {
                tracing::debug!(task_type = %t.task_type, %phase, %reason, "SLO unknown; holding");
                None
            }
            SloStatus::Healthy { .. } => {
                let next = phase.next()?;
                if now - entered_at < Duration::seconds(pc.min_observation_secs) {
                    return None;
                }
                let report = match self.evaluate_candidate(t, &cfg, now, deadline) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(task_type = %t.task_type, error = %e, "promotion evaluation failed");
                        return None;
                    }
                };
                self.events.emit(&AuditEvent::EvaluationCompleted {
                    at: now,
                    task_type: t.task_type.clone(),
                    policy_version: t.policy_version.clone(),
                    phase,
                    verdict: report.verdict,
                    samples: report.samples,
                    improvement: report.improvement.estimate,
                    ci_lower: report.improvement.lower,
                    ci_upper: report.improvement.upper,
                });
                let verdict = report.verdict;
                let cause = TransitionCause::Promoted {
                    ci_lower: report.improvement.lower,
                    ci_upper: report.improvement.upper,
                };
                t.state.write().last_evaluation = Some(report);
                if verdict == Verdict::Pass {
                    self.transition(t, &cfg, phase, Some(next), now, cause)
                } else {
                    None
                }
            }
        }
    }

    fn evaluate_candidate(
        &self,
        t: &TaskRollout,
        cfg: &RolloutConfig,
        now: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<EvaluationReport> {
        let since = now - Duration::seconds(cfg.evaluation_lookback_secs.max(0));
        let decisions = self.store.fetch_completed(&t.task_type, Some(since))?;
        let arms = t.arms.read().clone();
        OfflineEvaluator::new(cfg.promotion).evaluate_until(
            &decisions,
            &*t.candidate,
            &arms,
            Some(deadline),
        )
    }

    fn transition(
        &self,
        t: &TaskRollout,
        cfg: &RolloutConfig,
        from: Phase,
        to: Option<Phase>,
        now: DateTime<Utc>,
        cause: TransitionCause,
    ) -> Option<Transition> {
        let tr = Transition {
            task_type: t.task_type.clone(),
            at: now,
            from,
            to,
            cause,
        };
        {
            let mut s = t.state.write();
            // An operator call may have moved the phase since this cycle read it.
            if s.phase != from || !s.enabled {
                return None;
            }
            match to {
                Some(p) => {
                    s.phase = p;
                    s.entered_at = now;
                }
                None => s.enabled = false,
            }
            s.history.push(tr.clone());
        }
        let policy_version = t.policy_version.clone();
        let task_type = t.task_type.clone();
        match (to, &tr.cause) {
            (Some(to), TransitionCause::Promoted { ci_lower, ci_upper }) => {
                t.monitor.enter_phase(to);
                tracing::info!(%task_type, %from, %to, ci_lower, "phase advanced");
                self.events.emit(&AuditEvent::PhaseAdvanced {
                    at: now,
                    task_type,
                    policy_version,
                    from,
                    to,
                    traffic_fraction: cfg.phases.get(to).traffic_fraction,
                    ci_lower: Some(*ci_lower),
                    ci_upper: Some(*ci_upper),
                });
            }
            (Some(to), cause) => {
                t.monitor.enter_phase(to);
                let breaches = match cause {
                    TransitionCause::SloBreach { breaches } => breaches.clone(),
                    _ => Vec::new(),
                };
                tracing::warn!(%task_type, %from, %to, "rolled back");
                self.events.emit(&AuditEvent::RolledBack {
                    at: now,
                    task_type,
                    policy_version,
                    from,
                    to,
                    traffic_fraction: cfg.phases.get(to).traffic_fraction,
                    breaches,
                });
            }
            (None, cause) => {
                let breaches = match cause {
                    TransitionCause::SloBreach { breaches } => breaches.clone(),
                    _ => Vec::new(),
                };
                tracing::error!(%task_type, %from, "candidate disabled");
                self.events.emit(&AuditEvent::CandidateDisabled {
                    at: now,
                    task_type,
                    policy_version,
                    phase: from,
                    breaches,
                });
            }
        }
        Some(tr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::{CandidateGrid, ParameterSet, BASELINE_ARM_ID};
    use crate::evaluator::Shortfall;
    use crate::events::MemorySink;
    use crate::policy::UniformPolicy;
    use crate::store::testing::{decision, outcome, t0};
    use crate::store::MemoryStore;
    use proptest::prelude::*;

    struct Fixture {
        mgr: RolloutManager,
        store: Arc<MemoryStore>,
        sink: Arc<MemorySink>,
        arms: Vec<Arm>,
    }

    fn cfg() -> RolloutConfig {
        let mut phases = PhasePlan::default();
        for p in [&mut phases.shadow, &mut phases.canary, &mut phases.guarded] {
            p.min_observation_secs = 0;
        }
        RolloutConfig {
            phases,
            slo: SloConfig {
                window: 200,
                min_samples: 10,
                max_staleness_secs: 600,
                ..SloConfig::default()
            },
            promotion: PromotionConfig {
                min_samples: 500,
                bootstrap_resamples: 200,
                ..PromotionConfig::default()
            },
            evaluation_lookback_secs: 86_400,
        }
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::new());
        let arms = CandidateGrid::default().expand(&ParameterSet::default());
        let mgr = RolloutManager::new(7, store.clone(), sink.clone());
        mgr.register("summarize", cfg(), Arc::new(UniformPolicy), "uniform@0", arms.clone(), t0());
        Fixture {
            mgr,
            store,
            sink,
            arms,
        }
    }

    fn seed_logs(f: &Fixture, n: usize, lift: f64) {
        let p = 1.0 / f.arms.len() as f64;
        let logs: Vec<_> = (0..n)
            .map(|i| {
                let arm = &f.arms[i % f.arms.len()];
                let mut d = decision("summarize", &arm.id, p);
                let mut o = outcome(0.5);
                let jitter = ((i * 37) % 11) as f64 / 100.0 - 0.05;
                o.reward = if arm.id == BASELINE_ARM_ID { 0.5 } else { 0.5 + lift } + jitter;
                d.outcome = Some(o);
                d
            })
            .collect();
        f.store.append_decisions(&logs).expect("append");
    }

    fn samples(f: &Fixture, route: Route, n: usize, latency_ms: f64) {
        for _ in 0..n {
            f.mgr.record_sample(
                "summarize",
                route,
                SloSample {
                    at: t0(),
                    latency_ms,
                    quality: 0.8,
                    error: false,
                },
            );
        }
    }

    fn cycle(f: &Fixture) -> CycleReport {
        f.mgr
            .evaluate_cycle(t0(), Instant::now() + std::time::Duration::from_secs(30))
    }

    #[test]
    fn phase_order() {
        assert_eq!(Phase::Shadow.next(), Some(Phase::Canary));
        assert_eq!(Phase::General.next(), None);
        assert_eq!(Phase::Canary.previous(), Some(Phase::Shadow));
        assert_eq!(Phase::Shadow.previous(), None);
    }

    #[test]
    fn unknown_slo_holds_the_phase() {
        let f = fixture();
        seed_logs(&f, 1_000, 0.1);
        let r = cycle(&f);
        assert!(r.transitions.is_empty());
        assert_eq!(f.mgr.phase("summarize"), Some(Phase::Shadow));
        assert!(matches!(
            f.mgr.status("summarize").and_then(|s| s.last_slo),
            Some(SloStatus::Unknown { .. })
        ));
    }

    #[test]
    fn inconclusive_evaluation_blocks_promotion() {
        let f = fixture();
        seed_logs(&f, 100, 0.1);
        samples(&f, Route::Baseline, 20, 500.0);
        cycle(&f);
        assert_eq!(f.mgr.phase("summarize"), Some(Phase::Shadow));
        let s = f.mgr.status("summarize").expect("status");
        assert_eq!(
            s.last_evaluation.map(|e| e.verdict),
            Some(Verdict::Inconclusive)
        );
        assert_eq!(f.sink.count("evaluation_completed"), 1);
    }

    #[test]
    fn baseline_only_logs_hold_the_candidate_in_shadow() {
        let f = fixture();
        let logs: Vec<_> = (0..2_000)
            .map(|i| {
                let mut d = decision("summarize", BASELINE_ARM_ID, 1.0);
                let mut o = outcome(0.5);
                o.reward = 0.5 + ((i * 37) % 11) as f64 / 100.0;
                d.outcome = Some(o);
                d
            })
            .collect();
        f.store.append_decisions(&logs).expect("append");
        samples(&f, Route::Baseline, 20, 500.0);
        let r = cycle(&f);
        assert!(r.transitions.is_empty());
        assert_eq!(f.mgr.phase("summarize"), Some(Phase::Shadow));
        let e = f
            .mgr
            .status("summarize")
            .and_then(|s| s.last_evaluation)
            .expect("evaluated");
        assert_eq!(e.verdict, Verdict::Inconclusive);
        assert_eq!(e.shortfall, Some(Shortfall::LowSupport));
    }

    #[test]
    fn pass_advances_one_phase_and_breach_rolls_back_one() {
        let f = fixture();
        seed_logs(&f, 2_000, 0.1);
        samples(&f, Route::Baseline, 20, 500.0);
        let r = cycle(&f);
        assert_eq!(r.transitions.len(), 1);
        assert_eq!(f.mgr.phase("summarize"), Some(Phase::Canary));
        assert_eq!(f.mgr.traffic_fraction("summarize"), Some(0.05));

        samples(&f, Route::Candidate, 20, 5_000.0);
        let r = cycle(&f);
        assert_eq!(r.transitions[0].to, Some(Phase::Shadow));
        assert_eq!(f.mgr.phase("summarize"), Some(Phase::Shadow));
        assert_eq!(f.mgr.traffic_fraction("summarize"), Some(0.0));
        assert_eq!(f.sink.count("rolled_back"), 1);
    }

    #[test]
    fn shadow_breach_disables_candidate_until_reenabled() {
        let f = fixture();
        samples(&f, Route::Baseline, 20, 60_000.0);
        cycle(&f);
        let s = f.mgr.status("summarize").expect("status");
        assert!(!s.candidate_enabled);
        assert_eq!(s.traffic_fraction, 0.0);
        assert_eq!(f.sink.count("candidate_disabled"), 1);
        for _ in 0..50 {
            let d = f.mgr.route("summarize", &Uuid::new_v4()).expect("route");
            assert_eq!(d.route, Route::Baseline);
        }

        f.mgr.enable_candidate("summarize", t0()).expect("enable");
        assert!(f.mgr.status("summarize").expect("status").candidate_enabled);
        assert_eq!(f.sink.count("candidate_enabled"), 1);
    }

    #[test]
    fn routing_matches_traffic_fraction() {
        let f = fixture();
        f.mgr
            .override_phase("summarize", Phase::Guarded, t0())
            .expect("override");
        let n = 20_000;
        let hits = (0..n)
            .filter(|_| {
                f.mgr
                    .route("summarize", &Uuid::new_v4())
                    .map(|d| d.route == Route::Candidate)
                    .unwrap_or(false)
            })
            .count();
        let share = hits as f64 / f64::from(n);
        assert!((share - 0.25).abs() < 0.02, "share={share}");

        let id = Uuid::new_v4();
        assert_eq!(f.mgr.route("summarize", &id), f.mgr.route("summarize", &id));
    }

    #[test]
    fn staged_config_applies_next_cycle() {
        let f = fixture();
        let mut next = cfg();
        next.phases.shadow.traffic_fraction = 0.0;
        next.phases.canary.traffic_fraction = 0.10;
        f.mgr.stage_config("summarize", next).expect("stage");
        f.mgr
            .override_phase("summarize", Phase::Canary, t0())
            .expect("override");
        assert_eq!(f.mgr.traffic_fraction("summarize"), Some(0.05));
        cycle(&f);
        assert_eq!(f.mgr.traffic_fraction("summarize"), Some(0.10));
    }

    #[test]
    fn expired_deadline_skips_everything() {
        let f = fixture();
        let r = f.mgr.evaluate_cycle(t0(), Instant::now());
        assert!(r.evaluated.is_empty());
        assert_eq!(r.skipped, vec!["summarize".to_string()]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn breach_rolls_back_exactly_one_phase(start in 1usize..4) {
            let f = fixture();
            let phase = Phase::ALL[start];
            f.mgr.override_phase("summarize", phase, t0()).expect("override");
            samples(&f, Route::Baseline, 20, 500.0);
            samples(&f, Route::Candidate, 20, 10_000.0);
            cycle(&f);
            let prev = Phase::ALL[start - 1];
            prop_assert_eq!(f.mgr.phase("summarize"), Some(prev));
            prop_assert_eq!(
                f.mgr.traffic_fraction("summarize"),
                Some(cfg().phases.get(prev).traffic_fraction)
            );
        }
    }
}
