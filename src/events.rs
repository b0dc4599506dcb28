//! Structured audit events.
//!
//! Every decision, outcome, evaluation, phase transition, and rollback is emitted as an
//! [`AuditEvent`] through an [`EventSink`]. Each event carries enough context (policy
//! version, phase, confidence bounds) to reconstruct the audit trail on its own.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::evaluator::Verdict;
use crate::monitor::SloBreach;
use crate::optimizer::DegradedReason;
use crate::rollout::{Phase, Route};
use crate::store::OutcomeStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    DecisionMade {
        at: DateTime<Utc>,
        request_id: Uuid,
        task_type: String,
        arm_id: String,
        propensity: f64,
        policy_version: String,
        phase: Option<Phase>,
        route: Route,
        degraded: Option<DegradedReason>,
        budget_denied: bool,
    },
    OutcomeRecorded {
        at: DateTime<Utc>,
        request_id: Uuid,
        task_type: String,
        arm_id: String,
        reward: f64,
        policy_version: String,
        phase: Phase,
        status: OutcomeStatus,
    },
    OutcomeRejected {
        at: DateTime<Utc>,
        request_id: Uuid,
        task_type: Option<String>,
        kind: Option<ErrorKind>,
        reason: String,
    },
    EvaluationCompleted {
        at: DateTime<Utc>,
        task_type: String,
        policy_version: String,
        phase: Phase,
        verdict: Verdict,
        samples: usize,
        improvement: f64,
        ci_lower: f64,
        ci_upper: f64,
    },
    PhaseAdvanced {
        at: DateTime<Utc>,
        task_type: String,
        policy_version: String,
        from: Phase,
        to: Phase,
        traffic_fraction: f64,
        ci_lower: Option<f64>,
        ci_upper: Option<f64>,
    },
    RolledBack {
        at: DateTime<Utc>,
        task_type: String,
        policy_version: String,
        from: Phase,
        to: Phase,
        traffic_fraction: f64,
        breaches: Vec<SloBreach>,
    },
    CandidateDisabled {
        at: DateTime<Utc>,
        task_type: String,
        policy_version: String,
        phase: Phase,
        breaches: Vec<SloBreach>,
    },
    CandidateEnabled {
        at: DateTime<Utc>,
        task_type: String,
        policy_version: String,
        phase: Phase,
    },
    BudgetDenied {
        at: DateTime<Utc>,
        task_type: String,
        request_id: Uuid,
        requested: f64,
        headroom: f64,
    },
    DataQualityFault {
        at: DateTime<Utc>,
        task_type: Option<String>,
        request_id: Option<Uuid>,
        detail: String,
    },
    ConfigApplied {
        at: DateTime<Utc>,
        task_type: String,
        detail: String,
    },
}

impl AuditEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AuditEvent::DecisionMade { .. } => "decision_made",
            AuditEvent::OutcomeRecorded { .. } => "outcome_recorded",
            AuditEvent::OutcomeRejected { .. } => "outcome_rejected",
            AuditEvent::EvaluationCompleted { .. } => "evaluation_completed",
            AuditEvent::PhaseAdvanced { .. } => "phase_advanced",
            AuditEvent::RolledBack { .. } => "rolled_back",
            AuditEvent::CandidateDisabled { .. } => "candidate_disabled",
            AuditEvent::CandidateEnabled { .. } => "candidate_enabled",
            AuditEvent::BudgetDenied { .. } => "budget_denied",
            AuditEvent::DataQualityFault { .. } => "data_quality_fault",
            AuditEvent::ConfigApplied { .. } => "config_applied",
        }
    }

    pub fn task_type(&self) -> Option<&str> {
        match self {
            AuditEvent::DecisionMade { task_type, .. }
            | AuditEvent::OutcomeRecorded { task_type, .. }
            | AuditEvent::EvaluationCompleted { task_type, .. }
            | AuditEvent::PhaseAdvanced { task_type, .. }
            | AuditEvent::RolledBack { task_type, .. }
            | AuditEvent::CandidateDisabled { task_type, .. }
            | AuditEvent::CandidateEnabled { task_type, .. }
            | AuditEvent::BudgetDenied { task_type, .. }
            | AuditEvent::ConfigApplied { task_type, .. } => Some(task_type),
            AuditEvent::OutcomeRejected { task_type, .. }
            | AuditEvent::DataQualityFault { task_type, .. } => task_type.as_deref(),
        }
    }

    /// Events an operator should look at.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            AuditEvent::OutcomeRejected { .. }
                | AuditEvent::RolledBack { .. }
                | AuditEvent::CandidateDisabled { .. }
                | AuditEvent::BudgetDenied { .. }
                | AuditEvent::DataQualityFault { .. }
        )
    }
}

/// Destination for audit events. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &AuditEvent);
}

/// Forwards events to `tracing` under the `tunemux::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &AuditEvent) {
        let payload = serde_json::to_string(event).unwrap_or_default();
        let name = event.name();
        let task_type = event.task_type().unwrap_or("-");
        if event.is_warning() {
            tracing::warn!(target: "tunemux::audit", event = name, task_type, %payload);
        } else {
            tracing::info!(target: "tunemux::audit", event = name, task_type, %payload);
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(AuditEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &AuditEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Sends each event to every inner sink, in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl std::fmt::Debug for FanoutSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &AuditEvent) {
        for s in &self.sinks {
            s.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fault() -> AuditEvent {
        AuditEvent::DataQualityFault {
            at: DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_default(),
            task_type: Some("summarize".into()),
            request_id: None,
            detail: "reward is NaN".into(),
        }
    }

    #[test]
    fn events_serialize_with_tag() {
        let v = serde_json::to_value(fault()).expect("serialize");
        assert_eq!(v["event"], "data_quality_fault");
        assert_eq!(v["task_type"], "summarize");
        let back: AuditEvent = serde_json::from_value(v).expect("deserialize");
        assert_eq!(back, fault());
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let fan = FanoutSink::new(vec![a.clone(), b.clone(), Arc::new(TracingSink)]);
        fan.emit(&fault());
        assert_eq!(a.count("data_quality_fault"), 1);
        assert_eq!(b.names(), vec!["data_quality_fault"]);
        assert!(fault().is_warning());
    }
}
