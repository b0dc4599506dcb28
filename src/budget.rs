//! Compliance budget: an append-only ledger of resource spend against a cap.
//!
//! Every mutation is a [`LedgerEntry`]; the running totals are a fold over the
//! entries (see [`ComplianceBudget::replay`]). All operations take one lock, so a
//! `reserve` and a concurrent `commit` always see each other's effect.
//!
//! Invariant: `headroom() >= -waiver` after every operation.
//! - `reserve` refuses any amount that would cross the floor.
//! - `commit` releases its reservation and charges the actual cost, capped at what the
//!   floor allows; the uncharged remainder is recorded on the entry as `unbilled`.
//!   A commit for a reservation already released as stale is charged the same way,
//!   with nothing held back to offset it.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TuneError};

/// Budget settings for one task type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceConfig {
    /// Spend cap per period, in cost units.
    pub cap: f64,
    /// Allowed overshoot below zero headroom.
    pub waiver: f64,
    /// Fixed period length. `None` means one period for the tracker's lifetime.
    pub period_secs: Option<u64>,
    /// Cost units per token.
    pub cost_per_token: f64,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            cap: 5_000_000.0,
            waiver: 0.0,
            period_secs: Some(86_400),
            cost_per_token: 1.0,
        }
    }
}

impl ComplianceConfig {
    pub fn cost_of_tokens(&self, tokens: u32) -> f64 {
        f64::from(tokens) * self.cost_per_token
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReservationId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ReserveDecision {
    Allowed(ReservationId),
    Denied { requested: f64, headroom: f64 },
}

impl ReserveDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ReserveDecision::Allowed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerOp {
    Reserve {
        reservation: ReservationId,
        amount: f64,
    },
    Commit {
        reservation: ReservationId,
        actual: f64,
        charged: f64,
        unbilled: f64,
    },
    Release {
        reservation: ReservationId,
    },
    PeriodStart {
        period: u64,
    },
}

/// One ledger line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub task_type: String,
    #[serde(default)]
    pub request_id: Option<Uuid>,
    #[serde(default)]
    pub policy_version: Option<String>,
    pub op: LedgerOp,
}

/// Receives every ledger entry as it is appended (e.g. for durable mirroring).
pub trait LedgerSink: Send + Sync {
    fn append(&self, entry: &LedgerEntry);
}

/// Attribution carried onto ledger entries.
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    pub request_id: Option<Uuid>,
    pub policy_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub charged: f64,
    pub unbilled: f64,
    pub headroom: f64,
    /// The reservation had already been released when the cost arrived.
    pub late: bool,
}

/// Entries kept in memory for [`ComplianceBudget::entries`]. The full ledger lives in
/// the mirror sink.
const RETAINED_ENTRIES: usize = 4_096;

#[derive(Debug, Default)]
struct Totals {
    period: u64,
    committed: f64,
    outstanding: BTreeMap<ReservationId, (f64, DateTime<Utc>)>,
    /// Released without a commit; a late commit is still charged.
    released: BTreeSet<ReservationId>,
    next_reservation: u64,
    next_seq: u64,
}

impl Totals {
    fn outstanding_total(&self) -> f64 {
        self.outstanding.values().map(|(a, _)| a).sum()
    }

    fn apply(&mut self, entry: &LedgerEntry) {
        self.next_seq = self.next_seq.max(entry.seq + 1);
        match &entry.op {
            LedgerOp::Reserve {
                reservation,
                amount,
            } => {
                self.outstanding.insert(*reservation, (*amount, entry.at));
                self.next_reservation = self.next_reservation.max(reservation.0 + 1);
            }
            LedgerOp::Commit {
                reservation,
                charged,
                ..
            } => {
                self.outstanding.remove(reservation);
                self.released.remove(reservation);
                self.committed += charged;
            }
            LedgerOp::Release { reservation } => {
                if self.outstanding.remove(reservation).is_some() {
                    self.released.insert(*reservation);
                }
            }
            LedgerOp::PeriodStart { period } => {
                self.period = *period;
                self.committed = 0.0;
            }
        }
    }
}

#[derive(Debug)]
struct Ledger {
    cfg: ComplianceConfig,
    totals: Totals,
    /// Current period only, newest `RETAINED_ENTRIES` at most.
    recent: VecDeque<LedgerEntry>,
}

impl Ledger {
    fn new(cfg: ComplianceConfig) -> Self {
        Self {
            cfg,
            totals: Totals::default(),
            recent: VecDeque::new(),
        }
    }

    fn record(&mut self, entry: LedgerEntry) {
        self.totals.apply(&entry);
        if matches!(entry.op, LedgerOp::PeriodStart { .. }) {
            self.recent.clear();
        }
        if self.recent.len() == RETAINED_ENTRIES {
            self.recent.pop_front();
        }
        self.recent.push_back(entry);
    }
}

/// Per-task-type compliance budget tracker.
pub struct ComplianceBudget {
    task_type: String,
    origin: DateTime<Utc>,
    ledger: Mutex<Ledger>,
    sink: Option<Arc<dyn LedgerSink>>,
}

impl std::fmt::Debug for ComplianceBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComplianceBudget")
            .field("task_type", &self.task_type)
            .field("cfg", &self.config())
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

fn check_amount(amount: f64) -> Result<()> {
    if amount.is_finite() && amount >= 0.0 {
        Ok(())
    } else {
        Err(TuneError::InvalidOutcome(format!(
            "cost must be finite and non-negative, got {amount}"
        )))
    }
}

impl ComplianceBudget {
    pub fn new(task_type: impl Into<String>, cfg: ComplianceConfig, origin: DateTime<Utc>) -> Self {
        Self {
            task_type: task_type.into(),
            origin,
            ledger: Mutex::new(Ledger::new(cfg)),
            sink: None,
        }
    }

    /// Mirror every appended entry to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn LedgerSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Rebuild a tracker by folding previously recorded entries.
    ///
    /// Entries are folded in `seq` order; a `seq` seen twice (an at-least-once
    /// re-delivery) is folded once.
    pub fn replay(
        task_type: impl Into<String>,
        cfg: ComplianceConfig,
        origin: DateTime<Utc>,
        entries: impl IntoIterator<Item = LedgerEntry>,
    ) -> Self {
        let budget = Self::new(task_type, cfg, origin);
        let mut entries: Vec<LedgerEntry> = entries.into_iter().collect();
        entries.sort_by_key(|e| e.seq);
        entries.dedup_by_key(|e| e.seq);
        {
            let mut ledger = budget.ledger.lock();
            for e in entries {
                ledger.record(e);
            }
        }
        budget
    }

    pub fn config(&self) -> ComplianceConfig {
        self.ledger.lock().cfg
    }

    /// Swap the cap, waiver, period or unit cost. Outstanding reservations and the
    /// current period's spend carry over.
    pub fn reconfigure(&self, cfg: ComplianceConfig) {
        self.ledger.lock().cfg = cfg;
    }

    fn period_of(&self, cfg: &ComplianceConfig, now: DateTime<Utc>) -> u64 {
        match cfg.period_secs {
            Some(secs) if secs > 0 => {
                let elapsed = (now - self.origin).num_seconds().max(0) as u64;
                elapsed / secs
            }
            _ => 0,
        }
    }

    fn append(&self, ledger: &mut Ledger, at: DateTime<Utc>, who: &Attribution, op: LedgerOp) {
        let entry = LedgerEntry {
            seq: ledger.totals.next_seq,
            at,
            task_type: self.task_type.clone(),
            request_id: who.request_id,
            policy_version: who.policy_version.clone(),
            op,
        };
        if let Some(sink) = &self.sink {
            sink.append(&entry);
        }
        ledger.record(entry);
    }

    fn roll(&self, ledger: &mut Ledger, now: DateTime<Utc>) {
        let period = self.period_of(&ledger.cfg, now);
        if period > ledger.totals.period {
            self.append(
                ledger,
                now,
                &Attribution::default(),
                LedgerOp::PeriodStart { period },
            );
        }
    }

    fn headroom_locked(&self, ledger: &Ledger) -> f64 {
        ledger.cfg.cap - ledger.totals.committed - ledger.totals.outstanding_total()
    }

    /// Remaining budget in the current period (negative down to `-waiver`).
    pub fn headroom(&self, now: DateTime<Utc>) -> f64 {
        let mut ledger = self.ledger.lock();
        self.roll(&mut ledger, now);
        self.headroom_locked(&ledger)
    }

    /// Headroom and the config it was computed under, read in one lock acquisition.
    ///
    /// Gives up with [`TuneError::DeadlineExceeded`] once `deadline` passes.
    pub fn headroom_before(
        &self,
        now: DateTime<Utc>,
        deadline: Option<Instant>,
    ) -> Result<(f64, ComplianceConfig)> {
        let mut ledger = match deadline {
            Some(d) => self
                .ledger
                .try_lock_until(d)
                .ok_or(TuneError::DeadlineExceeded)?,
            None => self.ledger.lock(),
        };
        self.roll(&mut ledger, now);
        Ok((self.headroom_locked(&ledger), ledger.cfg))
    }

    pub fn waiver(&self) -> f64 {
        self.ledger.lock().cfg.waiver
    }

    /// Would reserving `amount` stay above the floor? Does not record anything.
    pub fn can_afford(&self, amount: f64, now: DateTime<Utc>) -> bool {
        if !(amount.is_finite() && amount >= 0.0) {
            return false;
        }
        let mut ledger = self.ledger.lock();
        self.roll(&mut ledger, now);
        self.headroom_locked(&ledger) - amount >= -ledger.cfg.waiver
    }

    pub fn reserve(&self, amount: f64, who: &Attribution, now: DateTime<Utc>) -> Result<ReserveDecision> {
        self.reserve_before(amount, who, now, None)
    }

    /// Like [`reserve`](Self::reserve), but gives up once `deadline` passes.
    pub fn reserve_before(
        &self,
        amount: f64,
        who: &Attribution,
        now: DateTime<Utc>,
        deadline: Option<Instant>,
    ) -> Result<ReserveDecision> {
        check_amount(amount)?;
        let mut ledger = match deadline {
            Some(d) => self
                .ledger
                .try_lock_until(d)
                .ok_or(TuneError::DeadlineExceeded)?,
            None => self.ledger.lock(),
        };
        self.roll(&mut ledger, now);
        let headroom = self.headroom_locked(&ledger);
        if headroom - amount < -ledger.cfg.waiver {
            return Ok(ReserveDecision::Denied {
                requested: amount,
                headroom,
            });
        }
        let id = ReservationId(ledger.totals.next_reservation);
        self.append(
            &mut ledger,
            now,
            who,
            LedgerOp::Reserve {
                reservation: id,
                amount,
            },
        );
        Ok(ReserveDecision::Allowed(id))
    }

    /// Settle a reservation with the actual cost.
    ///
    /// A reservation already released as stale is charged directly and the receipt
    /// is marked `late`. Reservations never issued, or already committed, return `None`.
    pub fn commit(
        &self,
        reservation: ReservationId,
        actual: f64,
        who: &Attribution,
        now: DateTime<Utc>,
    ) -> Result<Option<CommitReceipt>> {
        check_amount(actual)?;
        let mut ledger = self.ledger.lock();
        self.roll(&mut ledger, now);
        let (reserved, late) = match ledger.totals.outstanding.get(&reservation) {
            Some(&(reserved, _)) => (reserved, false),
            None if ledger.totals.released.contains(&reservation) => (0.0, true),
            None => {
                tracing::warn!(
                    task_type = %self.task_type,
                    reservation = reservation.0,
                    "commit for unknown reservation ignored"
                );
                return Ok(None);
            }
        };
        if late {
            tracing::warn!(
                task_type = %self.task_type,
                reservation = reservation.0,
                actual,
                "commit after the reservation was released; charging directly"
            );
        }
        let allowance = (self.headroom_locked(&ledger) + reserved + ledger.cfg.waiver).max(0.0);
        let charged = actual.min(allowance);
        let unbilled = actual - charged;
        if unbilled > 0.0 {
            tracing::warn!(
                task_type = %self.task_type,
                actual,
                charged,
                "commit exceeds waiver floor; remainder recorded as unbilled"
            );
        }
        self.append(
            &mut ledger,
            now,
            who,
            LedgerOp::Commit {
                reservation,
                actual,
                charged,
                unbilled,
            },
        );
        Ok(Some(CommitReceipt {
            charged,
            unbilled,
            headroom: self.headroom_locked(&ledger),
            late,
        }))
    }

    /// Drop a reservation without charging it.
    pub fn release(&self, reservation: ReservationId, who: &Attribution, now: DateTime<Utc>) -> bool {
        let mut ledger = self.ledger.lock();
        if !ledger.totals.outstanding.contains_key(&reservation) {
            return false;
        }
        self.append(&mut ledger, now, who, LedgerOp::Release { reservation });
        true
    }

    /// Release reservations older than `ttl` (outcomes that never arrived).
    pub fn release_stale(&self, ttl: Duration, now: DateTime<Utc>) -> usize {
        let mut ledger = self.ledger.lock();
        let stale: Vec<ReservationId> = ledger
            .totals
            .outstanding
            .iter()
            .filter(|(_, (_, at))| now - *at > ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.append(
                &mut ledger,
                now,
                &Attribution::default(),
                LedgerOp::Release { reservation: *id },
            );
        }
        stale.len()
    }

    /// Recent entries of the current period. The mirror sink holds the full ledger.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.ledger.lock().recent.iter().cloned().collect()
    }

    pub fn outstanding(&self) -> usize {
        self.ledger.lock().totals.outstanding.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_default()
    }

    fn budget(cap: f64, waiver: f64) -> ComplianceBudget {
        ComplianceBudget::new(
            "summarize",
            ComplianceConfig {
                cap,
                waiver,
                period_secs: None,
                cost_per_token: 1.0,
            },
            t0(),
        )
    }

    #[test]
    fn reserve_commit_moves_headroom() {
        let b = budget(1000.0, 0.0);
        let who = Attribution::default();
        let ReserveDecision::Allowed(id) = b.reserve(400.0, &who, t0()).expect("reserve") else {
            panic!("expected allowance");
        };
        assert_eq!(b.headroom(t0()), 600.0);
        let receipt = b.commit(id, 250.0, &who, t0()).expect("commit").expect("known");
        assert_eq!(receipt.charged, 250.0);
        assert_eq!(b.headroom(t0()), 750.0);
        assert_eq!(b.outstanding(), 0);
    }

    #[test]
    fn waiver_allows_bounded_overshoot() {
        let b = budget(100.0, 50.0);
        let who = Attribution::default();
        assert!(b.reserve(140.0, &who, t0()).expect("reserve").is_allowed());
        assert_eq!(b.headroom(t0()), -40.0);
        let denied = b.reserve(20.0, &who, t0()).expect("reserve");
        assert_eq!(
            denied,
            ReserveDecision::Denied {
                requested: 20.0,
                headroom: -40.0
            }
        );
    }

    #[test]
    fn commit_above_floor_is_capped_and_recorded() {
        let b = budget(100.0, 10.0);
        let who = Attribution::default();
        let ReserveDecision::Allowed(id) = b.reserve(100.0, &who, t0()).expect("reserve") else {
            panic!("expected allowance");
        };
        let r = b.commit(id, 500.0, &who, t0()).expect("commit").expect("known");
        assert_eq!(r.charged, 110.0);
        assert_eq!(r.unbilled, 390.0);
        assert_eq!(b.headroom(t0()), -10.0);
    }

    #[test]
    fn period_roll_resets_committed_spend() {
        let b = ComplianceBudget::new(
            "t",
            ComplianceConfig {
                cap: 100.0,
                waiver: 0.0,
                period_secs: Some(60),
                cost_per_token: 1.0,
            },
            t0(),
        );
        let who = Attribution::default();
        let ReserveDecision::Allowed(id) = b.reserve(80.0, &who, t0()).expect("reserve") else {
            panic!("expected allowance");
        };
        b.commit(id, 80.0, &who, t0()).expect("commit");
        assert_eq!(b.headroom(t0()), 20.0);
        assert_eq!(b.headroom(t0() + Duration::seconds(61)), 100.0);
    }

    #[test]
    fn replay_reproduces_totals() {
        let b = budget(1000.0, 0.0);
        let who = Attribution::default();
        for i in 0..10 {
            if let ReserveDecision::Allowed(id) = b.reserve(50.0, &who, t0()).expect("reserve") {
                if i % 3 == 0 {
                    b.release(id, &who, t0());
                } else {
                    b.commit(id, 30.0, &who, t0()).expect("commit");
                }
            }
        }
        let replayed = ComplianceBudget::replay("summarize", b.config(), t0(), b.entries());
        assert_eq!(replayed.headroom(t0()), b.headroom(t0()));
    }

    #[test]
    fn stale_reservations_are_released() {
        let b = budget(100.0, 0.0);
        let who = Attribution::default();
        b.reserve(60.0, &who, t0()).expect("reserve");
        assert_eq!(b.release_stale(Duration::seconds(30), t0() + Duration::seconds(31)), 1);
        assert_eq!(b.headroom(t0()), 100.0);
    }

    #[test]
    fn late_commit_after_stale_release_is_charged() {
        let b = budget(1000.0, 0.0);
        let who = Attribution::default();
        let ReserveDecision::Allowed(id) = b.reserve(400.0, &who, t0()).expect("reserve") else {
            panic!("expected allowance");
        };
        let later = t0() + Duration::hours(2);
        assert_eq!(b.release_stale(Duration::hours(1), later), 1);
        assert_eq!(b.headroom(later), 1000.0);

        let r = b.commit(id, 900.0, &who, later).expect("commit").expect("charged");
        assert!(r.late);
        assert_eq!(r.charged, 900.0);
        assert_eq!(b.headroom(later), 100.0);

        // Settled now; a second commit is unknown.
        assert_eq!(b.commit(id, 900.0, &who, later).expect("commit"), None);
        let replayed = ComplianceBudget::replay("summarize", b.config(), t0(), b.entries());
        assert_eq!(replayed.headroom(later), 100.0);
    }

    #[test]
    fn late_commit_respects_the_waiver_floor() {
        let b = budget(100.0, 10.0);
        let who = Attribution::default();
        let ReserveDecision::Allowed(id) = b.reserve(50.0, &who, t0()).expect("reserve") else {
            panic!("expected allowance");
        };
        b.release(id, &who, t0());
        let r = b.commit(id, 500.0, &who, t0()).expect("commit").expect("charged");
        assert_eq!(r.charged, 110.0);
        assert_eq!(r.unbilled, 390.0);
        assert_eq!(b.headroom(t0()), -10.0);
    }

    #[test]
    fn redelivered_entries_replay_once() {
        let b = budget(1000.0, 0.0);
        let who = Attribution::default();
        let ReserveDecision::Allowed(id) = b.reserve(300.0, &who, t0()).expect("reserve") else {
            panic!("expected allowance");
        };
        b.commit(id, 300.0, &who, t0()).expect("commit");
        let mut twice = b.entries();
        twice.extend(b.entries());
        let replayed = ComplianceBudget::replay("summarize", b.config(), t0(), twice);
        assert_eq!(b.headroom(t0()), 700.0);
        assert_eq!(replayed.headroom(t0()), 700.0);
        assert_eq!(replayed.entries().len(), 2);
    }

    #[test]
    fn retained_entries_are_bounded() {
        let b = ComplianceBudget::new(
            "t",
            ComplianceConfig {
                cap: 1e12,
                waiver: 0.0,
                period_secs: Some(60),
                cost_per_token: 1.0,
            },
            t0(),
        );
        let who = Attribution::default();
        for _ in 0..RETAINED_ENTRIES {
            if let ReserveDecision::Allowed(id) = b.reserve(1.0, &who, t0()).expect("reserve") {
                b.commit(id, 1.0, &who, t0()).expect("commit");
            }
        }
        assert_eq!(b.entries().len(), RETAINED_ENTRIES);
        assert_eq!(b.headroom(t0()), 1e12 - RETAINED_ENTRIES as f64);

        // A new period starts a fresh view.
        let next = t0() + Duration::seconds(61);
        assert_eq!(b.headroom(next), 1e12);
        let entries = b.entries();
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0].op, LedgerOp::PeriodStart { period: 1 }));
    }

    #[test]
    fn reserve_before_gives_up_when_contended() {
        let b = budget(100.0, 0.0);
        let who = Attribution::default();
        let _held = b.ledger.lock();
        let past = Instant::now();
        assert!(matches!(
            b.reserve_before(10.0, &who, t0(), Some(past)),
            Err(TuneError::DeadlineExceeded)
        ));
    }

    #[test]
    fn reconfigure_keeps_outstanding_reservations() {
        let b = budget(100.0, 0.0);
        let who = Attribution::default();
        assert!(b.reserve(80.0, &who, t0()).expect("reserve").is_allowed());
        b.reconfigure(ComplianceConfig {
            cap: 200.0,
            ..b.config()
        });
        assert_eq!(b.headroom(t0()), 120.0);
        assert_eq!(b.outstanding(), 1);
    }

    #[test]
    fn negative_cost_is_rejected() {
        let b = budget(100.0, 0.0);
        assert!(b.reserve(-1.0, &Attribution::default(), t0()).is_err());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Reserve(f64),
        Commit(usize, f64),
        Release(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0.0f64..300.0).prop_map(Op::Reserve),
            (0usize..16, 0.0f64..600.0).prop_map(|(i, a)| Op::Commit(i, a)),
            (0usize..16).prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn headroom_never_below_negative_waiver(
            cap in 0.0f64..1000.0,
            waiver in 0.0f64..200.0,
            ops in proptest::collection::vec(op(), 0..80),
        ) {
            let b = budget(cap, waiver);
            let who = Attribution::default();
            let mut ids = Vec::new();
            for o in ops {
                match o {
                    Op::Reserve(a) => {
                        if let ReserveDecision::Allowed(id) = b.reserve(a, &who, t0()).expect("reserve") {
                            ids.push(id);
                        }
                    }
                    Op::Commit(i, a) => {
                        if let Some(id) = ids.get(i).copied() {
                            b.commit(id, a, &who, t0()).expect("commit");
                        }
                    }
                    Op::Release(i) => {
                        if let Some(id) = ids.get(i).copied() {
                            b.release(id, &who, t0());
                        }
                    }
                }
                prop_assert!(b.headroom(t0()) >= -waiver - 1e-9, "headroom={}", b.headroom(t0()));
            }
        }
    }
}
