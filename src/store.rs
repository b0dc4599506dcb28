//! Durable decision store.
//!
//! The store is the system of record for logged decisions, their outcomes, corrections,
//! and compliance ledger entries. Late outcomes are resolved against it, not against
//! in-memory state.
//!
//! Records are append-only. A decision gets at most one outcome; a second, different
//! outcome becomes a [`Correction`] record and the original stays as written.
//!
//! Two implementations:
//! - [`MemoryStore`]: process-local, for tests and embedding.
//! - [`JsonlStore`]: one JSON object per line, index rebuilt on open.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::arm::ParameterSet;
use crate::budget::{LedgerEntry, ReservationId};
use crate::error::{Result, TuneError};
use crate::features::TaskFeatures;
use crate::reward::{RewardConstraints, TaskOutcome};
use crate::rollout::{Phase, Route};

/// Observed outcome plus the reward computed from it at attach time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub outcome: TaskOutcome,
    pub reward: f64,
    pub recorded_at: DateTime<Utc>,
}

/// One served decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedDecision {
    pub request_id: Uuid,
    pub task_type: String,
    pub timestamp: DateTime<Utc>,
    pub context_fingerprint: String,
    pub features: TaskFeatures,
    pub arm_id: String,
    pub parameters: ParameterSet,
    /// Marginal probability of `arm_id` under the routed mixture. In `(0, 1]`.
    pub propensity: f64,
    pub policy_version: String,
    pub phase: Phase,
    pub route: Route,
    /// Arms the gate let through for this request.
    #[serde(default)]
    pub eligible_arms: Vec<String>,
    #[serde(default)]
    pub degraded: bool,
    /// Compliance reservation to settle when the outcome arrives.
    #[serde(default)]
    pub reservation: Option<ReservationId>,
    /// Caller limits in force for this request; reused when a late outcome is scored.
    #[serde(default)]
    pub constraints: RewardConstraints,
    #[serde(default)]
    pub outcome: Option<OutcomeRecord>,
}

impl LoggedDecision {
    pub fn is_complete(&self) -> bool {
        self.outcome.is_some()
    }
}

/// Result of attaching an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// First outcome for this decision.
    Attached,
    /// Same outcome already recorded; nothing changed.
    Duplicate,
    /// A different outcome was already recorded; the new one was filed as a correction.
    Conflict,
}

/// A rejected second outcome, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub request_id: Uuid,
    pub at: DateTime<Utc>,
    pub existing: OutcomeRecord,
    pub submitted: OutcomeRecord,
}

/// Narrow read/write interface to durable storage.
///
/// Calls may block on I/O; the logger invokes them off the request path.
pub trait DecisionStore: Send + Sync {
    fn append_decisions(&self, decisions: &[LoggedDecision]) -> Result<()>;

    /// Attach an outcome, atomically checking for an existing one.
    ///
    /// Unknown request ids return [`TuneError::DecisionNotFound`]. A conflicting outcome
    /// is recorded as a [`Correction`] by the store itself.
    fn attach_outcome(&self, request_id: Uuid, record: OutcomeRecord) -> Result<OutcomeStatus>;

    fn append_ledger(&self, entries: &[LedgerEntry]) -> Result<()>;

    fn fetch_decision(&self, request_id: Uuid) -> Result<Option<LoggedDecision>>;

    /// Outcome-complete decisions for `task_type` logged at or after `since`, oldest first.
    fn fetch_completed(
        &self,
        task_type: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<LoggedDecision>>;

    /// Ledger entries for `task_type`, in append order.
    fn ledger_entries(&self, task_type: &str) -> Result<Vec<LedgerEntry>>;

    fn corrections(&self) -> Result<Vec<Correction>>;
}

/// One line of a [`JsonlStore`] file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreRecord {
    Decision(LoggedDecision),
    Outcome {
        request_id: Uuid,
        record: OutcomeRecord,
    },
    Correction(Correction),
    Ledger(LedgerEntry),
}

/// In-memory index shared by both stores.
#[derive(Debug, Default)]
struct Index {
    decisions: HashMap<Uuid, LoggedDecision>,
    order: Vec<Uuid>,
    corrections: Vec<Correction>,
    ledger: Vec<LedgerEntry>,
    ledger_seqs: HashSet<(String, u64)>,
}

/// Outcome of checking an attach against the index.
enum AttachPlan {
    Attach,
    Duplicate,
    Correct(Correction),
}

impl Index {
    fn insert_decision(&mut self, d: LoggedDecision) {
        // Re-delivery of an already stored decision keeps the first copy.
        if self.decisions.contains_key(&d.request_id) {
            return;
        }
        self.order.push(d.request_id);
        self.decisions.insert(d.request_id, d);
    }

    fn has_ledger(&self, e: &LedgerEntry) -> bool {
        self.ledger_seqs.contains(&(e.task_type.clone(), e.seq))
    }

    /// Ledger entries are unique per `(task_type, seq)`; re-deliveries are dropped.
    fn insert_ledger(&mut self, e: LedgerEntry) {
        if self.ledger_seqs.insert((e.task_type.clone(), e.seq)) {
            self.ledger.push(e);
        }
    }

    fn plan_attach(&self, request_id: Uuid, record: &OutcomeRecord) -> Result<AttachPlan> {
        let d = self
            .decisions
            .get(&request_id)
            .ok_or(TuneError::DecisionNotFound { request_id })?;
        Ok(match &d.outcome {
            None => AttachPlan::Attach,
            Some(existing) if existing.outcome == record.outcome => AttachPlan::Duplicate,
            Some(existing) => AttachPlan::Correct(Correction {
                request_id,
                at: record.recorded_at,
                existing: existing.clone(),
                submitted: record.clone(),
            }),
        })
    }

    fn apply(&mut self, rec: StoreRecord) {
        match rec {
            StoreRecord::Decision(d) => self.insert_decision(d),
            StoreRecord::Outcome { request_id, record } => {
                if let Some(d) = self.decisions.get_mut(&request_id) {
                    if d.outcome.is_none() {
                        d.outcome = Some(record);
                    }
                }
            }
            StoreRecord::Correction(c) => self.corrections.push(c),
            StoreRecord::Ledger(e) => self.insert_ledger(e),
        }
    }

    fn completed(&self, task_type: &str, since: Option<DateTime<Utc>>) -> Vec<LoggedDecision> {
        self.order
            .iter()
            .filter_map(|id| self.decisions.get(id))
            .filter(|d| d.task_type == task_type && d.is_complete())
            .filter(|d| since.map_or(true, |t| d.timestamp >= t))
            .cloned()
            .collect()
    }

    fn ledger_for(&self, task_type: &str) -> Vec<LedgerEntry> {
        self.ledger
            .iter()
            .filter(|e| e.task_type == task_type)
            .cloned()
            .collect()
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Index>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DecisionStore for MemoryStore {
    fn append_decisions(&self, decisions: &[LoggedDecision]) -> Result<()> {
        let mut idx = self.inner.lock();
        for d in decisions {
            idx.insert_decision(d.clone());
        }
        Ok(())
    }

    fn attach_outcome(&self, request_id: Uuid, record: OutcomeRecord) -> Result<OutcomeStatus> {
        let mut idx = self.inner.lock();
        match idx.plan_attach(request_id, &record)? {
            AttachPlan::Attach => {
                idx.apply(StoreRecord::Outcome { request_id, record });
                Ok(OutcomeStatus::Attached)
            }
            AttachPlan::Duplicate => Ok(OutcomeStatus::Duplicate),
            AttachPlan::Correct(c) => {
                idx.apply(StoreRecord::Correction(c));
                Ok(OutcomeStatus::Conflict)
            }
        }
    }

    fn append_ledger(&self, entries: &[LedgerEntry]) -> Result<()> {
        let mut idx = self.inner.lock();
        for e in entries {
            idx.insert_ledger(e.clone());
        }
        Ok(())
    }

    fn fetch_decision(&self, request_id: Uuid) -> Result<Option<LoggedDecision>> {
        Ok(self.inner.lock().decisions.get(&request_id).cloned())
    }

    fn fetch_completed(
        &self,
        task_type: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<LoggedDecision>> {
        Ok(self.inner.lock().completed(task_type, since))
    }

    fn ledger_entries(&self, task_type: &str) -> Result<Vec<LedgerEntry>> {
        Ok(self.inner.lock().ledger_for(task_type))
    }

    fn corrections(&self) -> Result<Vec<Correction>> {
        Ok(self.inner.lock().corrections.clone())
    }
}

struct JsonlInner {
    index: Index,
    w: BufWriter<File>,
}

/// Append-only JSON Lines file.
///
/// Every write is flushed before returning, so a returned `Ok` means the record reached
/// the OS. On open, existing lines are folded into an in-memory index; a torn final line
/// (crash mid-write) is skipped with a warning.
pub struct JsonlStore {
    path: PathBuf,
    inner: Mutex<JsonlInner>,
}

impl std::fmt::Debug for JsonlStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl JsonlStore {
    /// Open (or create) a store file and rebuild its index.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut index = Index::default();
        let mut torn_tail = false;
        if path.exists() {
            let mut reader = BufReader::new(File::open(&path)?);
            let mut line = String::new();
            let mut lineno = 0usize;
            loop {
                line.clear();
                if reader.read_line(&mut line)? == 0 {
                    break;
                }
                lineno += 1;
                torn_tail = !line.ends_with('\n');
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<StoreRecord>(line.trim_end()) {
                    Ok(rec) => index.apply(rec),
                    Err(e) => tracing::warn!(
                        path = %path.display(),
                        line = lineno,
                        error = %e,
                        "skipping unreadable store record"
                    ),
                }
            }
        }
        let f = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut w = BufWriter::new(f);
        if torn_tail {
            // Terminate the partial line so the next record starts clean.
            w.write_all(b"\n")?;
            w.flush()?;
        }
        Ok(Self {
            path,
            inner: Mutex::new(JsonlInner { index, w }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_all(w: &mut BufWriter<File>, records: &[StoreRecord]) -> Result<()> {
        for rec in records {
            let line = serde_json::to_string(rec)?;
            w.write_all(line.as_bytes())?;
            w.write_all(b"\n")?;
        }
        w.flush()?;
        Ok(())
    }

    /// Persist then index.
    fn commit(inner: &mut JsonlInner, records: Vec<StoreRecord>) -> Result<()> {
        Self::write_all(&mut inner.w, &records)?;
        for rec in records {
            inner.index.apply(rec);
        }
        Ok(())
    }
}

impl DecisionStore for JsonlStore {
    fn append_decisions(&self, decisions: &[LoggedDecision]) -> Result<()> {
        let mut inner = self.inner.lock();
        let fresh: Vec<StoreRecord> = decisions
            .iter()
            .filter(|d| !inner.index.decisions.contains_key(&d.request_id))
            .cloned()
            .map(StoreRecord::Decision)
            .collect();
        Self::commit(&mut inner, fresh)
    }

    fn attach_outcome(&self, request_id: Uuid, record: OutcomeRecord) -> Result<OutcomeStatus> {
        let mut inner = self.inner.lock();
        match inner.index.plan_attach(request_id, &record)? {
            AttachPlan::Attach => {
                Self::commit(&mut inner, vec![StoreRecord::Outcome { request_id, record }])?;
                Ok(OutcomeStatus::Attached)
            }
            AttachPlan::Duplicate => Ok(OutcomeStatus::Duplicate),
            AttachPlan::Correct(c) => {
                Self::commit(&mut inner, vec![StoreRecord::Correction(c)])?;
                Ok(OutcomeStatus::Conflict)
            }
        }
    }

    fn append_ledger(&self, entries: &[LedgerEntry]) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut batch = HashSet::new();
        let recs = entries
            .iter()
            .filter(|e| !inner.index.has_ledger(e) && batch.insert((e.task_type.as_str(), e.seq)))
            .cloned()
            .map(StoreRecord::Ledger)
            .collect();
        Self::commit(&mut inner, recs)
    }

    fn fetch_decision(&self, request_id: Uuid) -> Result<Option<LoggedDecision>> {
        Ok(self.inner.lock().index.decisions.get(&request_id).cloned())
    }

    fn fetch_completed(
        &self,
        task_type: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<LoggedDecision>> {
        Ok(self.inner.lock().index.completed(task_type, since))
    }

    fn ledger_entries(&self, task_type: &str) -> Result<Vec<LedgerEntry>> {
        Ok(self.inner.lock().index.ledger_for(task_type))
    }

    fn corrections(&self) -> Result<Vec<Correction>> {
        Ok(self.inner.lock().index.corrections.clone())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_default()
    }

    pub(crate) fn decision(task_type: &str, arm_id: &str, propensity: f64) -> LoggedDecision {
        let features = TaskFeatures::default();
        LoggedDecision {
            request_id: Uuid::new_v4(),
            task_type: task_type.to_string(),
            timestamp: t0(),
            context_fingerprint: features.fingerprint(),
            features,
            arm_id: arm_id.to_string(),
            parameters: ParameterSet::default(),
            propensity,
            policy_version: "test@0".to_string(),
            phase: Phase::Canary,
            route: Route::Candidate,
            eligible_arms: vec![],
            degraded: false,
            reservation: None,
            constraints: RewardConstraints::default(),
            outcome: None,
        }
    }

    pub(crate) fn outcome(quality: f64) -> OutcomeRecord {
        OutcomeRecord {
            outcome: TaskOutcome {
                success: true,
                quality,
                latency_ms: 100,
                tokens_used: 100,
                violations: vec![],
            },
            reward: quality,
            recorded_at: t0(),
        }
    }
}
