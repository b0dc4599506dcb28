//! Parameter optimizer: the public entry point.
//!
//! `recommend` is synchronous and never fails. Per request it:
//! 1. asks the rollout manager for the route (candidate or frozen baseline),
//! 2. filters the catalog through the quality gate,
//! 3. asks the bandit for its choice over the safe set (computed on both routes, so the
//!    logged propensity is the exact probability under the routed mixture),
//! 4. reserves compliance budget for candidate-routed spend,
//! 5. hands the decision to the counterfactual logger and returns.
//!
//! Any failure along the way (deadline, budget denial, missing config) serves the
//! baseline and sets [`Recommendation::degraded`].
//!
//! `record_outcome` resolves the decision through the logger (pending or persisted),
//! scores it, attaches it with an atomic check in the store, and only on a first attach
//! updates the bandit, the quality gate, the SLO monitor and the budget.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::arm::{arm_ids, Arm, ParameterSet, BASELINE_ARM_ID};
use crate::budget::{Attribution, ComplianceBudget, LedgerSink, ReservationId, ReserveDecision};
use crate::config::{ControlConfig, OptimizerConfig, PolicyConfig, TaskTypeConfig};
use crate::decision::PolicyKind;
use crate::error::{ErrorKind, Result, TuneError};
use crate::events::{AuditEvent, EventSink, TracingSink};
use crate::features::TaskFeatures;
use crate::guardrail::{QualityGateValidator, ValidationResult};
use crate::logger::{CounterfactualLogger, LoggerStats, Priority};
use crate::monitor::SloSample;
use crate::policy::{BanditPolicy, PolicySnapshot, TargetPolicy};
use crate::reward::{RewardConstraints, RewardFunction, TaskOutcome};
use crate::rollout::{CycleReport, Phase, RolloutManager, Route, RouteDecision};
use crate::stable_hash::stable_hash64;
use crate::store::{DecisionStore, LoggedDecision, OutcomeRecord, OutcomeStatus};
use crate::utils::{Clock, SystemClock};

/// Number of runner-up arms reported with a recommendation.
const ALTERNATIVES: usize = 3;

/// Why a recommendation fell back to the baseline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DegradedReason {
    /// Unknown task type; the caller's default was served.
    NoPolicyConfigured,
    DeadlineExceeded,
    BudgetDenied,
    /// The gate returned nothing, not even the baseline.
    EmptySafeSet,
    Internal { detail: String },
}

impl DegradedReason {
    fn from_error(e: &TuneError) -> Self {
        match e {
            TuneError::NoPolicyConfigured { .. } => DegradedReason::NoPolicyConfigured,
            TuneError::DeadlineExceeded => DegradedReason::DeadlineExceeded,
            TuneError::BudgetDenied { .. } => DegradedReason::BudgetDenied,
            TuneError::EmptySafeSet { .. } | TuneError::EmptyArmSet => DegradedReason::EmptySafeSet,
            other => DegradedReason::Internal {
                detail: other.to_string(),
            },
        }
    }
}

/// Input to [`ParameterOptimizer::recommend`].
#[derive(Debug, Clone)]
pub struct RecommendRequest {
    pub task_type: String,
    pub features: TaskFeatures,
    pub constraints: RewardConstraints,
    /// Past this instant the baseline is served instead of waiting on contended state.
    pub deadline: Option<Instant>,
    /// Served when the task type has no configuration.
    pub default_arm: Option<ParameterSet>,
    /// Caller-chosen id; a random one is generated when absent.
    pub request_id: Option<Uuid>,
}

impl RecommendRequest {
    pub fn new(task_type: impl Into<String>, features: TaskFeatures) -> Self {
        Self {
            task_type: task_type.into(),
            features,
            constraints: RewardConstraints::default(),
            deadline: None,
            default_arm: None,
            request_id: None,
        }
    }

    pub fn with_constraints(mut self, constraints: RewardConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: StdDuration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_default_arm(mut self, params: ParameterSet) -> Self {
        self.default_arm = Some(params);
        self
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }
}

/// What the caller should run with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub request_id: Uuid,
    pub task_type: String,
    pub arm_id: String,
    pub parameters: ParameterSet,
    /// Logged probability of this arm under the routed mixture.
    pub propensity: f64,
    pub policy_version: String,
    /// `None` for unknown task types.
    pub phase: Option<Phase>,
    pub route: Route,
    /// Bandit selection probability of the served arm.
    pub confidence: f64,
    pub expected_reward: Option<f64>,
    pub alternatives: Vec<String>,
    pub degraded: Option<DegradedReason>,
    pub budget_denied: bool,
}

impl Recommendation {
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

/// Per task type state. Replaced wholesale when a staged config is applied; the policy
/// and budget instances carry over.
struct TaskContext {
    task_type: String,
    cfg: TaskTypeConfig,
    arms: Vec<Arm>,
    policy: Arc<dyn BanditPolicy>,
    gate: QualityGateValidator,
    budget: Arc<ComplianceBudget>,
    reward: RewardFunction,
}

/// How one request is served, before logging.
struct Served {
    arm: Arm,
    route: Route,
    propensity: f64,
    confidence: f64,
    expected_reward: Option<f64>,
    alternatives: Vec<String>,
    eligible: Vec<String>,
    reservation: Option<ReservationId>,
    degraded: Option<DegradedReason>,
    budget_denied: bool,
}

impl Served {
    /// Baseline, deterministically.
    fn baseline(task: &TaskContext, degraded: Option<DegradedReason>) -> Self {
        let arm = task.gate.baseline().clone();
        Self {
            eligible: vec![arm.id.clone()],
            arm,
            route: Route::Baseline,
            propensity: 1.0,
            confidence: 1.0,
            expected_reward: None,
            alternatives: Vec::new(),
            reservation: None,
            degraded,
            budget_denied: false,
        }
    }
}

/// Stops a running control loop.
#[derive(Debug)]
pub struct ControlLoop {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl ControlLoop {
    /// Signal the loop and wait for the in-flight cycle to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.handle
            .await
            .map_err(|e| TuneError::Task(e.to_string()))
    }
}

/// Ledger entries are period-aligned to the Unix epoch so restarts agree on periods.
fn ledger_origin() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

/// Coordinator for recommendation, outcome recording and the control loop.
pub struct ParameterOptimizer {
    seed: u64,
    control: ControlConfig,
    policy_cfg: PolicyConfig,
    store: Arc<dyn DecisionStore>,
    logger: Arc<CounterfactualLogger>,
    rollout: RolloutManager,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    tasks: RwLock<BTreeMap<String, Arc<TaskContext>>>,
    staged: Mutex<BTreeMap<String, TaskTypeConfig>>,
}

impl std::fmt::Debug for ParameterOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterOptimizer")
            .field("seed", &self.seed)
            .field("control", &self.control)
            .field("tasks", &self.task_types())
            .finish_non_exhaustive()
    }
}

impl ParameterOptimizer {
    /// Build with audit events going to `tracing` and the system clock.
    ///
    /// Must be called from within a Tokio runtime (the logger's writer task is spawned).
    pub fn new(cfg: OptimizerConfig, store: Arc<dyn DecisionStore>) -> Result<Self> {
        Self::with_parts(cfg, store, Arc::new(TracingSink), Arc::new(SystemClock))
    }

    pub fn with_parts(
        cfg: OptimizerConfig,
        store: Arc<dyn DecisionStore>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        cfg.validate()?;
        let logger = Arc::new(CounterfactualLogger::spawn(Arc::clone(&store), cfg.logger));
        let rollout = RolloutManager::new(cfg.seed, Arc::clone(&store), Arc::clone(&events));
        let opt = Self {
            seed: cfg.seed,
            control: cfg.control,
            policy_cfg: cfg.policy,
            store,
            logger,
            rollout,
            events,
            clock,
            tasks: RwLock::new(BTreeMap::new()),
            staged: Mutex::new(BTreeMap::new()),
        };
        let now = opt.clock.now();
        for (task_type, t) in cfg.task_types {
            opt.install(&task_type, t, now)?;
        }
        tracing::info!(
            task_types = opt.tasks.read().len(),
            seed = opt.seed,
            "parameter optimizer ready"
        );
        Ok(opt)
    }

    /// Create or replace the context for `task_type`.
    fn install(&self, task_type: &str, cfg: TaskTypeConfig, now: DateTime<Utc>) -> Result<()> {
        let arms = cfg.arms();
        let baseline = arms.first().cloned().ok_or(TuneError::EmptyArmSet)?;
        let gate = QualityGateValidator::new(baseline, cfg.trust_region, cfg.quality_floor);
        let rollout_cfg = cfg.rollout_config(self.control.evaluation_lookback_secs);
        let existing = self.tasks.read().get(task_type).cloned();

        let ctx = match existing {
            Some(prev) => {
                self.rollout.stage_config(task_type, rollout_cfg)?;
                self.rollout.set_arms(task_type, arms.clone())?;
                prev.budget.reconfigure(cfg.compliance);
                TaskContext {
                    task_type: task_type.to_string(),
                    reward: RewardFunction::new(cfg.reward),
                    gate: gate.with_history_of(&prev.gate),
                    policy: Arc::clone(&prev.policy),
                    budget: Arc::clone(&prev.budget),
                    arms,
                    cfg,
                }
            }
            None => {
                let policy = self.policy_cfg.build(stable_hash64(self.seed, task_type));
                let entries = self.store.ledger_entries(task_type)?;
                let replayed = entries.len();
                let sink: Arc<dyn LedgerSink> = Arc::clone(&self.logger) as Arc<dyn LedgerSink>;
                let budget =
                    ComplianceBudget::replay(task_type, cfg.compliance, ledger_origin(), entries)
                        .with_sink(sink);
                let candidate: Arc<dyn TargetPolicy + Send + Sync> = Arc::new(Arc::clone(&policy));
                self.rollout.register(
                    task_type,
                    rollout_cfg,
                    candidate,
                    policy.version(),
                    arms.clone(),
                    now,
                );
                tracing::debug!(%task_type, arms = arms.len(), replayed, "task type registered");
                TaskContext {
                    task_type: task_type.to_string(),
                    reward: RewardFunction::new(cfg.reward),
                    gate,
                    policy,
                    budget: Arc::new(budget),
                    arms,
                    cfg,
                }
            }
        };
        self.tasks
            .write()
            .insert(task_type.to_string(), Arc::new(ctx));
        Ok(())
    }

    fn task(&self, task_type: &str) -> Option<Arc<TaskContext>> {
        self.tasks.read().get(task_type).cloned()
    }

    pub fn task_types(&self) -> Vec<String> {
        self.tasks.read().keys().cloned().collect()
    }

    /// Choose parameters for one request. Never fails.
    pub fn recommend(&self, req: RecommendRequest) -> Recommendation {
        let now = self.clock.now();
        let request_id = req.request_id.unwrap_or_else(Uuid::new_v4);
        let Some(task) = self.task(&req.task_type) else {
            return self.unconfigured(&req, request_id, now);
        };
        let route = self
            .rollout
            .route(&req.task_type, &request_id)
            .unwrap_or(RouteDecision {
                phase: Phase::Shadow,
                traffic_fraction: 0.0,
                route: Route::Baseline,
                candidate_enabled: false,
            });

        let served = match self.decide(&task, &req, request_id, route, now) {
            Ok(s) => s,
            Err(e) => {
                let reason = DegradedReason::from_error(&e);
                if e.kind() == ErrorKind::Configuration {
                    tracing::error!(task_type = %task.task_type, error = %e, "serving baseline");
                } else {
                    tracing::warn!(task_type = %task.task_type, error = %e, "serving baseline");
                }
                Served::baseline(&task, Some(reason))
            }
        };
        self.serve(&task, &req, request_id, route, served, now)
    }

    fn decide(
        &self,
        task: &TaskContext,
        req: &RecommendRequest,
        request_id: Uuid,
        rd: RouteDecision,
        now: DateTime<Utc>,
    ) -> Result<Served> {
        if req.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(TuneError::DeadlineExceeded);
        }
        let report = task.gate.filter(&task.arms, &task.budget, now, req.deadline)?;
        if report.eligible.is_empty() {
            return Err(TuneError::EmptySafeSet {
                task_type: task.task_type.clone(),
            });
        }
        if report.fallback_used {
            tracing::debug!(
                task_type = %task.task_type,
                rejected = report.rejected.len(),
                "quality gate left only the baseline"
            );
        }
        let eligible = arm_ids(&report.eligible);
        let baseline = task.gate.baseline();

        if task.policy.observations() == 0 {
            return Ok(Served {
                eligible,
                route: rd.route,
                expected_reward: Some(task.policy.expected_reward(&req.features, &baseline.id)),
                ..Served::baseline(task, None)
            });
        }

        let sel = task
            .policy
            .select_by(&req.features, &report.eligible, req.deadline)?;
        let f = rd.traffic_fraction;
        let arm = match rd.route {
            Route::Candidate => sel.arm.clone(),
            Route::Baseline => baseline.clone(),
        };
        let pi = sel.probs.get(&arm.id).copied().unwrap_or(0.0);
        let base_mass = if arm.id == baseline.id { 1.0 - f } else { 0.0 };
        let propensity = (base_mass + f * pi).min(1.0);
        debug_assert!(propensity > 0.0, "served arm must have positive propensity");

        let mut reservation = None;
        if rd.route == Route::Candidate {
            let cost = task.budget.config().cost_of_tokens(arm.params.max_tokens);
            let who = Attribution {
                request_id: Some(request_id),
                policy_version: Some(task.policy.version().to_string()),
            };
            match task.budget.reserve_before(cost, &who, now, req.deadline)? {
                ReserveDecision::Allowed(id) => reservation = Some(id),
                ReserveDecision::Denied {
                    requested,
                    headroom,
                } => {
                    self.events.emit(&AuditEvent::BudgetDenied {
                        at: now,
                        task_type: task.task_type.clone(),
                        request_id,
                        requested,
                        headroom,
                    });
                    return Ok(Served {
                        budget_denied: true,
                        ..Served::baseline(task, Some(DegradedReason::BudgetDenied))
                    });
                }
            }
        }

        Ok(Served {
            expected_reward: Some(task.policy.expected_reward(&req.features, &arm.id)),
            alternatives: sel.alternatives(ALTERNATIVES),
            route: rd.route,
            confidence: pi,
            propensity,
            eligible,
            reservation,
            arm,
            degraded: None,
            budget_denied: false,
        })
    }

    /// Log and return.
    fn serve(
        &self,
        task: &TaskContext,
        req: &RecommendRequest,
        request_id: Uuid,
        rd: RouteDecision,
        s: Served,
        now: DateTime<Utc>,
    ) -> Recommendation {
        let policy_version = task.policy.version().to_string();
        let decision = LoggedDecision {
            request_id,
            task_type: task.task_type.clone(),
            timestamp: now,
            context_fingerprint: req.features.fingerprint(),
            features: req.features.clone(),
            arm_id: s.arm.id.clone(),
            parameters: s.arm.params.clone(),
            propensity: s.propensity,
            policy_version: policy_version.clone(),
            phase: rd.phase,
            route: s.route,
            eligible_arms: s.eligible,
            degraded: s.degraded.is_some(),
            reservation: s.reservation,
            constraints: req.constraints,
            outcome: None,
        };
        let priority = if s.route == Route::Candidate || s.degraded.is_some() {
            Priority::High
        } else {
            Priority::Low
        };
        self.logger.record(decision, priority);

        self.events.emit(&AuditEvent::DecisionMade {
            at: now,
            request_id,
            task_type: task.task_type.clone(),
            arm_id: s.arm.id.clone(),
            propensity: s.propensity,
            policy_version: policy_version.clone(),
            phase: Some(rd.phase),
            route: s.route,
            degraded: s.degraded.clone(),
            budget_denied: s.budget_denied,
        });

        Recommendation {
            request_id,
            task_type: task.task_type.clone(),
            arm_id: s.arm.id,
            parameters: s.arm.params,
            propensity: s.propensity,
            policy_version,
            phase: Some(rd.phase),
            route: s.route,
            confidence: s.confidence,
            expected_reward: s.expected_reward,
            alternatives: s.alternatives,
            degraded: s.degraded,
            budget_denied: s.budget_denied,
        }
    }

    fn unconfigured(
        &self,
        req: &RecommendRequest,
        request_id: Uuid,
        now: DateTime<Utc>,
    ) -> Recommendation {
        tracing::warn!(task_type = %req.task_type, "no policy configured; serving caller default");
        let policy_version = PolicyKind::Baseline.version_tag().to_string();
        self.events.emit(&AuditEvent::DecisionMade {
            at: now,
            request_id,
            task_type: req.task_type.clone(),
            arm_id: BASELINE_ARM_ID.to_string(),
            propensity: 1.0,
            policy_version: policy_version.clone(),
            phase: None,
            route: Route::Baseline,
            degraded: Some(DegradedReason::NoPolicyConfigured),
            budget_denied: false,
        });
        Recommendation {
            request_id,
            task_type: req.task_type.clone(),
            arm_id: BASELINE_ARM_ID.to_string(),
            parameters: req.default_arm.clone().unwrap_or_default(),
            propensity: 1.0,
            policy_version,
            phase: None,
            route: Route::Baseline,
            confidence: 1.0,
            expected_reward: None,
            alternatives: Vec::new(),
            degraded: Some(DegradedReason::NoPolicyConfigured),
            budget_denied: false,
        }
    }

    /// Attach an outcome and learn from it.
    ///
    /// Safe to call late, out of order, and more than once: only the first attach of a
    /// given request changes any state. A different second outcome is filed as a
    /// correction and reported as [`OutcomeStatus::Conflict`].
    pub async fn record_outcome(
        &self,
        request_id: Uuid,
        outcome: TaskOutcome,
    ) -> Result<OutcomeStatus> {
        let now = self.clock.now();
        if let Err(e) = outcome.validate() {
            self.reject(request_id, None, &e, now);
            return Err(e);
        }
        let decision = match self.logger.fetch_decision(request_id).await {
            Ok(Some(d)) => d,
            Ok(None) => {
                let e = TuneError::DecisionNotFound { request_id };
                self.reject(request_id, None, &e, now);
                return Err(e);
            }
            Err(e) => {
                self.reject(request_id, None, &e, now);
                return Err(e);
            }
        };
        let task = self.task(&decision.task_type);
        let reward_fn = task.as_ref().map(|t| t.reward).unwrap_or_default();
        let reward = match reward_fn.reward(&outcome, &decision.constraints) {
            Ok(r) => r,
            Err(e) => {
                self.reject(request_id, Some(decision.task_type.as_str()), &e, now);
                return Err(e);
            }
        };
        let record = OutcomeRecord {
            outcome: outcome.clone(),
            reward,
            recorded_at: now,
        };
        let status = self.logger.attach_outcome(request_id, record).await?;

        match status {
            OutcomeStatus::Attached => {
                if let Some(task) = &task {
                    self.learn(task, &decision, &outcome, reward, now);
                }
            }
            OutcomeStatus::Duplicate => {
                tracing::debug!(%request_id, "duplicate outcome ignored");
            }
            OutcomeStatus::Conflict => {
                tracing::warn!(%request_id, "conflicting outcome filed as a correction");
                self.events.emit(&AuditEvent::DataQualityFault {
                    at: now,
                    task_type: Some(decision.task_type.clone()),
                    request_id: Some(request_id),
                    detail: "conflicting outcome filed as a correction".to_string(),
                });
            }
        }
        self.events.emit(&AuditEvent::OutcomeRecorded {
            at: now,
            request_id,
            task_type: decision.task_type.clone(),
            arm_id: decision.arm_id.clone(),
            reward,
            policy_version: decision.policy_version.clone(),
            phase: decision.phase,
            status,
        });
        Ok(status)
    }

    fn learn(
        &self,
        task: &TaskContext,
        d: &LoggedDecision,
        outcome: &TaskOutcome,
        reward: f64,
        now: DateTime<Utc>,
    ) {
        if let Err(e) = task.policy.update(&d.features, &d.arm_id, reward) {
            tracing::warn!(request_id = %d.request_id, error = %e, "policy update rejected");
            self.events.emit(&AuditEvent::DataQualityFault {
                at: now,
                task_type: Some(d.task_type.clone()),
                request_id: Some(d.request_id),
                detail: e.to_string(),
            });
        }
        task.gate.record_quality(&d.arm_id, outcome.quality);
        self.rollout.record_sample(
            &d.task_type,
            d.route,
            SloSample {
                at: now,
                latency_ms: outcome.latency_ms as f64,
                quality: outcome.quality,
                error: outcome.is_error(),
            },
        );
        if let Some(reservation) = d.reservation {
            let cost = task.budget.config().cost_of_tokens(outcome.tokens_used);
            let who = Attribution {
                request_id: Some(d.request_id),
                policy_version: Some(d.policy_version.clone()),
            };
            let detail = match task.budget.commit(reservation, cost, &who, now) {
                Ok(Some(receipt)) if receipt.late => Some(format!(
                    "outcome arrived after reservation {} was released; charged {} directly",
                    reservation.0, receipt.charged
                )),
                Ok(Some(_)) => None,
                Ok(None) => Some(format!(
                    "reservation {} unknown to the ledger; cost {cost} not charged",
                    reservation.0
                )),
                Err(e) => {
                    tracing::warn!(request_id = %d.request_id, error = %e, "budget commit failed");
                    None
                }
            };
            if let Some(detail) = detail {
                self.events.emit(&AuditEvent::DataQualityFault {
                    at: now,
                    task_type: Some(d.task_type.clone()),
                    request_id: Some(d.request_id),
                    detail,
                });
            }
        }
    }

    fn reject(&self, request_id: Uuid, task_type: Option<&str>, e: &TuneError, now: DateTime<Utc>) {
        let kind = e.kind();
        tracing::warn!(%request_id, error = %e, "outcome rejected");
        self.events.emit(&AuditEvent::OutcomeRejected {
            at: now,
            request_id,
            task_type: task_type.map(str::to_string),
            kind: Some(kind),
            reason: e.to_string(),
        });
        if kind == ErrorKind::DataQuality {
            self.events.emit(&AuditEvent::DataQualityFault {
                at: now,
                task_type: task_type.map(str::to_string),
                request_id: Some(request_id),
                detail: e.to_string(),
            });
        }
    }

    /// Queue a config for `task_type` (new or existing). Applied at the next cycle.
    pub fn stage_config(&self, task_type: &str, cfg: TaskTypeConfig) -> Result<()> {
        cfg.validate(task_type)?;
        self.staged.lock().insert(task_type.to_string(), cfg);
        Ok(())
    }

    fn apply_staged(&self, now: DateTime<Utc>) {
        let staged = std::mem::take(&mut *self.staged.lock());
        for (task_type, cfg) in staged {
            match self.install(&task_type, cfg, now) {
                Ok(()) => self.events.emit(&AuditEvent::ConfigApplied {
                    at: now,
                    task_type,
                    detail: "task config".to_string(),
                }),
                Err(e) => {
                    tracing::error!(%task_type, error = %e, "staged config could not be applied")
                }
            }
        }
    }

    /// One control cycle: apply staged config, release stale reservations, then run the
    /// time-boxed rollout evaluation.
    ///
    /// Reads the decision store, so call it off the async executor (the control loop
    /// uses the blocking pool).
    pub fn run_cycle(&self) -> CycleReport {
        let now = self.clock.now();
        let deadline = Instant::now() + StdDuration::from_millis(self.control.cycle_budget_ms);
        self.apply_staged(now);
        let ttl = Duration::seconds(self.control.reservation_ttl_secs);
        let tasks: Vec<Arc<TaskContext>> = self.tasks.read().values().cloned().collect();
        for t in tasks {
            let released = t.budget.release_stale(ttl, now);
            if released > 0 {
                tracing::info!(task_type = %t.task_type, released, "released stale reservations");
            }
        }
        self.rollout.evaluate_cycle(now, deadline)
    }

    /// Run [`run_cycle`](Self::run_cycle) every `control.cycle_interval_ms`.
    ///
    /// Missed ticks are skipped rather than replayed, so an outage never causes a burst
    /// of catch-up cycles.
    pub fn spawn_control_loop(self: &Arc<Self>) -> ControlLoop {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let me = Arc::clone(self);
        let period = StdDuration::from_millis(self.control.cycle_interval_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let opt = Arc::clone(&me);
                        match tokio::task::spawn_blocking(move || opt.run_cycle()).await {
                            Ok(report) if !report.transitions.is_empty() => {
                                tracing::info!(transitions = report.transitions.len(), "control cycle");
                            }
                            Ok(_) => {}
                            Err(e) => tracing::error!(error = %e, "control cycle panicked"),
                        }
                    }
                    _ = &mut stopped => break,
                }
            }
            tracing::debug!("control loop stopped");
        });
        ControlLoop {
            stop: Some(stop),
            handle,
        }
    }

    /// Operator access to phases, history and candidate enable/override.
    pub fn rollout(&self) -> &RolloutManager {
        &self.rollout
    }

    pub fn phase(&self, task_type: &str) -> Option<Phase> {
        self.rollout.phase(task_type)
    }

    pub fn policy(&self, task_type: &str) -> Option<Arc<dyn BanditPolicy>> {
        self.task(task_type).map(|t| Arc::clone(&t.policy))
    }

    pub fn config(&self, task_type: &str) -> Option<TaskTypeConfig> {
        self.task(task_type).map(|t| t.cfg.clone())
    }

    pub fn snapshot_policies(&self) -> BTreeMap<String, PolicySnapshot> {
        self.tasks
            .read()
            .iter()
            .map(|(k, t)| (k.clone(), t.policy.snapshot()))
            .collect()
    }

    pub fn restore_policy(&self, task_type: &str, snapshot: PolicySnapshot) -> Result<()> {
        let t = self.task(task_type).ok_or_else(|| TuneError::NoPolicyConfigured {
            task_type: task_type.to_string(),
        })?;
        t.policy.restore(snapshot)
    }

    pub fn headroom(&self, task_type: &str) -> Option<f64> {
        let now = self.clock.now();
        self.task(task_type).map(|t| t.budget.headroom(now))
    }

    /// Check one arm against the task type's gate.
    pub fn validate_arm(&self, task_type: &str, arm: &Arm) -> Option<ValidationResult> {
        self.task(task_type).map(|t| t.gate.validate(arm))
    }

    /// Exclude an arm from selection (e.g. after a failed review).
    pub fn flag_arm(&self, task_type: &str, arm_id: &str, note: &str) -> Result<()> {
        let t = self.task(task_type).ok_or_else(|| TuneError::NoPolicyConfigured {
            task_type: task_type.to_string(),
        })?;
        t.gate.flag_arm(arm_id, note);
        Ok(())
    }

    pub fn logger_stats(&self) -> LoggerStats {
        self.logger.stats()
    }

    /// Wait until every decision recorded so far is durable.
    pub async fn flush(&self) -> Result<()> {
        self.logger.flush().await
    }

    /// Drain the logger. The control loop, if any, is stopped through its own handle.
    pub async fn shutdown(&self) -> Result<()> {
        self.logger.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::ComplianceConfig;
    use crate::events::MemorySink;
    use crate::store::testing::t0;
    use crate::store::MemoryStore;
    use crate::utils::ManualClock;

    struct Fixture {
        opt: ParameterOptimizer,
        store: Arc<MemoryStore>,
        events: Arc<MemorySink>,
    }

    fn fixture(task: TaskTypeConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(MemorySink::new());
        let cfg = OptimizerConfig {
            seed: 11,
            ..OptimizerConfig::default()
        }
        .with_task_type("summarize", task);
        let opt = ParameterOptimizer::with_parts(
            cfg,
            store.clone(),
            events.clone(),
            Arc::new(ManualClock::new(t0())),
        )
        .expect("optimizer");
        Fixture { opt, store, events }
    }

    fn req() -> RecommendRequest {
        RecommendRequest::new("summarize", TaskFeatures::default())
    }

    fn good(quality: f64) -> TaskOutcome {
        TaskOutcome {
            success: true,
            quality,
            latency_ms: 200,
            tokens_used: 300,
            violations: vec![],
        }
    }

    #[tokio::test]
    async fn cold_start_serves_baseline() {
        let f = fixture(TaskTypeConfig::default());
        let rec = f.opt.recommend(req());
        assert_eq!(rec.arm_id, BASELINE_ARM_ID);
        assert_eq!(rec.parameters, ParameterSet::default());
        assert_eq!(rec.propensity, 1.0);
        assert_eq!(rec.phase, Some(Phase::Shadow));
        assert!(!rec.is_degraded());
        assert_eq!(f.events.count("decision_made"), 1);
    }

    #[tokio::test]
    async fn unknown_task_type_serves_caller_default() {
        let f = fixture(TaskTypeConfig::default());
        let default = ParameterSet {
            temperature: 0.2,
            ..ParameterSet::default()
        };
        let rec = f.opt.recommend(
            RecommendRequest::new("translate", TaskFeatures::default())
                .with_default_arm(default.clone()),
        );
        assert_eq!(rec.parameters, default);
        assert_eq!(rec.degraded, Some(DegradedReason::NoPolicyConfigured));
        assert_eq!(rec.phase, None);
    }

    #[tokio::test]
    async fn expired_deadline_falls_back_to_baseline() {
        let f = fixture(TaskTypeConfig::default());
        let rec = f.opt.recommend(req().with_deadline(Instant::now()));
        assert_eq!(rec.arm_id, BASELINE_ARM_ID);
        assert_eq!(rec.degraded, Some(DegradedReason::DeadlineExceeded));
        f.opt.flush().await.expect("flush");
        let logged = f.store.fetch_decision(rec.request_id).expect("fetch").expect("logged");
        assert!(logged.degraded);
        assert_eq!(logged.propensity, 1.0);
    }

    #[tokio::test]
    async fn outcome_updates_policy_exactly_once() {
        let f = fixture(TaskTypeConfig::default());
        let rec = f.opt.recommend(req());
        let policy = f.opt.policy("summarize").expect("policy");

        let first = f.opt.record_outcome(rec.request_id, good(0.8)).await.expect("first");
        assert_eq!(first, OutcomeStatus::Attached);
        assert_eq!(policy.observations(), 1);

        let again = f.opt.record_outcome(rec.request_id, good(0.8)).await.expect("again");
        assert_eq!(again, OutcomeStatus::Duplicate);
        assert_eq!(policy.observations(), 1);

        let other = f.opt.record_outcome(rec.request_id, good(0.1)).await.expect("other");
        assert_eq!(other, OutcomeStatus::Conflict);
        assert_eq!(policy.observations(), 1);
        assert_eq!(f.store.corrections().expect("corrections").len(), 1);
    }

    #[tokio::test]
    async fn malformed_outcome_is_rejected_without_state_change() {
        let f = fixture(TaskTypeConfig::default());
        let rec = f.opt.recommend(req());
        let bad = TaskOutcome {
            quality: f64::NAN,
            ..good(0.5)
        };
        assert!(matches!(
            f.opt.record_outcome(rec.request_id, bad).await,
            Err(TuneError::InvalidOutcome(_))
        ));
        assert_eq!(f.opt.policy("summarize").expect("policy").observations(), 0);
        assert_eq!(f.events.count("outcome_rejected"), 1);
        assert_eq!(f.events.count("data_quality_fault"), 1);

        assert!(matches!(
            f.opt.record_outcome(Uuid::new_v4(), good(0.5)).await,
            Err(TuneError::DecisionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn exhausted_budget_denies_candidate_spend() {
        let f = fixture(TaskTypeConfig {
            compliance: ComplianceConfig {
                cap: 0.0,
                waiver: 0.0,
                period_secs: None,
                cost_per_token: 1.0,
            },
            ..TaskTypeConfig::default()
        });
        let warm = f.opt.recommend(req());
        f.opt.record_outcome(warm.request_id, good(0.7)).await.expect("warm");
        f.opt
            .rollout()
            .override_phase("summarize", Phase::General, t0())
            .expect("override");

        let rec = f.opt.recommend(req());
        assert_eq!(rec.route, Route::Baseline);
        assert_eq!(rec.arm_id, BASELINE_ARM_ID);
        assert!(rec.budget_denied);
        assert_eq!(rec.degraded, Some(DegradedReason::BudgetDenied));
        assert_eq!(f.events.count("budget_denied"), 1);
        assert!(f.opt.headroom("summarize").expect("headroom") >= 0.0);
    }

    #[tokio::test]
    async fn candidate_spend_is_reserved_then_committed() {
        let f = fixture(TaskTypeConfig::default());
        let warm = f.opt.recommend(req());
        f.opt.record_outcome(warm.request_id, good(0.7)).await.expect("warm");
        f.opt
            .rollout()
            .override_phase("summarize", Phase::General, t0())
            .expect("override");
        let cap = ComplianceConfig::default().cap;

        let rec = f.opt.recommend(req());
        assert_eq!(rec.route, Route::Candidate);
        assert!(rec.propensity > 0.0 && rec.propensity <= 1.0);
        let reserved = cap - f.opt.headroom("summarize").expect("headroom");
        assert_eq!(reserved, f64::from(rec.parameters.max_tokens));

        f.opt.record_outcome(rec.request_id, good(0.9)).await.expect("record");
        let spent = cap - f.opt.headroom("summarize").expect("headroom");
        assert_eq!(spent, 300.0);
    }

    #[tokio::test]
    async fn outcome_after_stale_release_is_still_charged() {
        let clock = Arc::new(ManualClock::new(t0()));
        let events = Arc::new(MemorySink::new());
        let cfg = OptimizerConfig::default().with_task_type("summarize", TaskTypeConfig::default());
        let opt = ParameterOptimizer::with_parts(
            cfg,
            Arc::new(MemoryStore::new()),
            events.clone(),
            clock.clone(),
        )
        .expect("optimizer");
        let warm = opt.recommend(req());
        opt.record_outcome(warm.request_id, good(0.7)).await.expect("warm");
        opt.rollout()
            .override_phase("summarize", Phase::General, t0())
            .expect("override");
        let cap = ComplianceConfig::default().cap;

        let rec = opt.recommend(req());
        assert_eq!(rec.route, Route::Candidate);
        clock.advance(Duration::seconds(3_601));
        opt.run_cycle();
        assert_eq!(opt.headroom("summarize"), Some(cap));

        let status = opt.record_outcome(rec.request_id, good(0.9)).await.expect("late");
        assert_eq!(status, OutcomeStatus::Attached);
        assert_eq!(opt.headroom("summarize"), Some(cap - 300.0));
        assert_eq!(events.count("data_quality_fault"), 1);
    }

    #[tokio::test]
    async fn staged_config_waits_for_the_next_cycle() {
        let f = fixture(TaskTypeConfig::default());
        let changed = TaskTypeConfig {
            baseline: ParameterSet {
                temperature: 0.3,
                ..ParameterSet::default()
            },
            ..TaskTypeConfig::default()
        };
        f.opt.stage_config("summarize", changed).expect("stage");
        assert_eq!(f.opt.recommend(req()).parameters.temperature, 0.7);

        f.opt.run_cycle();
        assert_eq!(f.opt.recommend(req()).parameters.temperature, 0.3);
        assert!(f.events.count("config_applied") >= 1);
    }

    #[tokio::test]
    async fn invalid_staged_config_is_refused() {
        let f = fixture(TaskTypeConfig::default());
        let mut bad = TaskTypeConfig::default();
        bad.promotion.alpha = 2.0;
        assert!(matches!(
            f.opt.stage_config("summarize", bad),
            Err(TuneError::Config(_))
        ));
    }

    #[tokio::test]
    async fn policy_snapshots_round_trip_through_the_optimizer() {
        let f = fixture(TaskTypeConfig::default());
        let rec = f.opt.recommend(req());
        f.opt.record_outcome(rec.request_id, good(0.6)).await.expect("record");
        let snaps = f.opt.snapshot_policies();
        let snap = snaps.get("summarize").cloned().expect("snapshot");

        let g = fixture(TaskTypeConfig::default());
        g.opt.restore_policy("summarize", snap).expect("restore");
        assert_eq!(g.opt.policy("summarize").expect("policy").observations(), 1);
    }
}
