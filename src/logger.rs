//! Counterfactual logger: bounded asynchronous hand-off from the request path to the
//! decision store.
//!
//! `record` never blocks and never fails the caller. Records go onto a bounded channel
//! drained by a single writer task, which batches them and writes through
//! [`DecisionStore`] on the blocking pool.
//!
//! When the channel is full the [`BackpressurePolicy`] decides:
//! - high-priority records (bandit-routed decisions, ledger entries) go to a bounded
//!   overflow buffer the writer drains on its next tick,
//! - low-priority records (baseline-routed decisions) are sampled or dropped,
//! - anything that still does not fit is shed and counted.
//!
//! Until a decision is persisted it stays in an in-memory pending map, so late outcome
//! lookups see it either way. Writes are at-least-once: a failed batch is re-queued and
//! the store de-duplicates decisions by request id.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::budget::{LedgerEntry, LedgerSink};
use crate::error::{Result, TuneError};
use crate::store::{DecisionStore, LoggedDecision, OutcomeRecord, OutcomeStatus};

/// What to do with records that arrive while the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Keep one in every `keep_one_in` overflowing low-priority records; shed the rest.
    SampleLowPriority { keep_one_in: u32 },
    /// Shed every overflowing low-priority record.
    DropLowPriority,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        BackpressurePolicy::SampleLowPriority { keep_one_in: 10 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub queue_capacity: usize,
    pub overflow_capacity: usize,
    pub backpressure: BackpressurePolicy,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4_096,
            overflow_capacity: 16_384,
            backpressure: BackpressurePolicy::default(),
            batch_size: 128,
            flush_interval_ms: 250,
        }
    }
}

/// Where a record ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Queued,
    Spilled,
    Shed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggerStats {
    pub enqueued: u64,
    pub spilled: u64,
    pub shed: u64,
    pub persisted: u64,
    pub write_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    spilled: AtomicU64,
    shed: AtomicU64,
    persisted: AtomicU64,
    write_errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> LoggerStats {
        LoggerStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            spilled: self.spilled.load(Ordering::Relaxed),
            shed: self.shed.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
enum Item {
    Decision(LoggedDecision),
    Ledger(LedgerEntry),
}

type Ack = oneshot::Sender<std::result::Result<(), String>>;

enum Command {
    Write(Item),
    Flush(Ack),
    Shutdown(Ack),
}

struct Shared {
    cfg: LoggerConfig,
    store: Arc<dyn DecisionStore>,
    spill: Mutex<VecDeque<Item>>,
    pending: Mutex<HashMap<Uuid, LoggedDecision>>,
    counters: Counters,
    low_overflow: AtomicU64,
}

impl Shared {
    fn shed(&self, item: &Item, priority: Priority) {
        self.counters.shed.fetch_add(1, Ordering::Relaxed);
        match item {
            Item::Decision(d) => {
                self.pending.lock().remove(&d.request_id);
                if priority == Priority::High {
                    tracing::warn!(request_id = %d.request_id, "log queue saturated; decision shed");
                }
            }
            Item::Ledger(e) => {
                tracing::warn!(task_type = %e.task_type, seq = e.seq, "log queue saturated; ledger entry shed");
            }
        }
    }

    /// Try the overflow buffer. Returns the item back if it does not fit.
    fn spill(&self, item: Item) -> std::result::Result<(), Item> {
        let mut spill = self.spill.lock();
        if spill.len() < self.cfg.overflow_capacity {
            spill.push_back(item);
            self.counters.spilled.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            Err(item)
        }
    }

    fn overflow(&self, item: Item, priority: Priority) -> RecordStatus {
        let keep = match (priority, self.cfg.backpressure) {
            (Priority::High, _) => true,
            (Priority::Low, BackpressurePolicy::SampleLowPriority { keep_one_in }) => {
                let k = u64::from(keep_one_in.max(1));
                self.low_overflow.fetch_add(1, Ordering::Relaxed) % k == 0
            }
            (Priority::Low, BackpressurePolicy::DropLowPriority) => false,
        };
        if keep {
            match self.spill(item) {
                Ok(()) => return RecordStatus::Spilled,
                Err(item) => self.shed(&item, priority),
            }
        } else {
            self.shed(&item, priority);
        }
        RecordStatus::Shed
    }

    fn drain_spill(&self, batch: &mut Vec<Item>) {
        batch.extend(self.spill.lock().drain(..));
    }

    /// Persist `batch` through the store on the blocking pool.
    async fn write(self: &Arc<Self>, batch: &mut Vec<Item>) -> std::result::Result<(), String> {
        if batch.is_empty() {
            return Ok(());
        }
        let items = std::mem::take(batch);
        let shared = Arc::clone(self);
        let joined = tokio::task::spawn_blocking(move || {
            let mut decisions = Vec::new();
            let mut ledger = Vec::new();
            for item in &items {
                match item {
                    Item::Decision(d) => decisions.push(d.clone()),
                    Item::Ledger(e) => ledger.push(e.clone()),
                }
            }
            let res = shared
                .store
                .append_decisions(&decisions)
                .and_then(|()| shared.store.append_ledger(&ledger));
            (items, res)
        })
        .await;

        match joined {
            Ok((items, Ok(()))) => {
                let mut pending = self.pending.lock();
                for item in &items {
                    if let Item::Decision(d) = item {
                        pending.remove(&d.request_id);
                    }
                }
                self.counters
                    .persisted
                    .fetch_add(items.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            Ok((items, Err(e))) => {
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, records = items.len(), "decision store write failed; re-queueing");
                for item in items {
                    if let Err(item) = self.spill(item) {
                        self.shed(&item, Priority::High);
                    }
                }
                Err(e.to_string())
            }
            Err(e) => {
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "decision store writer panicked; batch lost");
                Err(e.to_string())
            }
        }
    }
}

/// Handle to the logging pipeline. Cheap to share behind an `Arc`.
pub struct CounterfactualLogger {
    tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CounterfactualLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterfactualLogger")
            .field("cfg", &self.shared.cfg)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl CounterfactualLogger {
    /// Start the writer task. Must be called from within a Tokio runtime.
    pub fn spawn(store: Arc<dyn DecisionStore>, cfg: LoggerConfig) -> Self {
        let (tx, rx) = mpsc::channel(cfg.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            cfg,
            store,
            spill: Mutex::new(VecDeque::new()),
            pending: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            low_overflow: AtomicU64::new(0),
        });
        let worker = tokio::spawn(run_writer(Arc::clone(&shared), rx));
        Self {
            tx,
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn config(&self) -> &LoggerConfig {
        &self.shared.cfg
    }

    fn offer(&self, item: Item, priority: Priority) -> RecordStatus {
        match self.tx.try_send(Command::Write(item)) {
            Ok(()) => {
                self.shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                RecordStatus::Queued
            }
            Err(TrySendError::Full(Command::Write(item))) => self.shared.overflow(item, priority),
            Err(TrySendError::Closed(Command::Write(item))) => {
                self.shared.shed(&item, priority);
                RecordStatus::Shed
            }
            Err(_) => RecordStatus::Shed,
        }
    }

    /// Hand a decision to the writer. Never blocks.
    pub fn record(&self, decision: LoggedDecision, priority: Priority) -> RecordStatus {
        self.shared
            .pending
            .lock()
            .insert(decision.request_id, decision.clone());
        self.offer(Item::Decision(decision), priority)
    }

    /// Wait until everything recorded before this call has been written.
    pub async fn flush(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Command::Flush(ack))
            .await
            .map_err(|_| TuneError::LoggerClosed)?;
        done.await
            .map_err(|_| TuneError::LoggerClosed)?
            .map_err(TuneError::Task)
    }

    /// Look up a decision, pending or persisted.
    pub async fn fetch_decision(&self, request_id: Uuid) -> Result<Option<LoggedDecision>> {
        if let Some(d) = self.shared.pending.lock().get(&request_id) {
            return Ok(Some(d.clone()));
        }
        let store = Arc::clone(&self.shared.store);
        tokio::task::spawn_blocking(move || store.fetch_decision(request_id))
            .await
            .map_err(|e| TuneError::Task(e.to_string()))?
    }

    /// Attach an outcome through the store's atomic check-and-append.
    ///
    /// A decision still in flight is flushed first.
    pub async fn attach_outcome(
        &self,
        request_id: Uuid,
        record: OutcomeRecord,
    ) -> Result<OutcomeStatus> {
        let in_flight = self.shared.pending.lock().contains_key(&request_id);
        if in_flight {
            self.flush().await?;
        }
        let store = Arc::clone(&self.shared.store);
        tokio::task::spawn_blocking(move || store.attach_outcome(request_id, record))
            .await
            .map_err(|e| TuneError::Task(e.to_string()))?
    }

    pub fn stats(&self) -> LoggerStats {
        self.shared.counters.snapshot()
    }

    /// Decisions recorded but not yet persisted.
    pub fn pending(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Drain everything and stop the writer.
    pub async fn shutdown(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        let sent = self.tx.send(Command::Shutdown(ack)).await.is_ok();
        let res = if sent {
            done.await
                .map_err(|_| TuneError::LoggerClosed)?
                .map_err(TuneError::Task)
        } else {
            Ok(())
        };
        let worker = self.worker.lock().take();
        if let Some(h) = worker {
            h.await.map_err(|e| TuneError::Task(e.to_string()))?;
        }
        res
    }
}

impl LedgerSink for CounterfactualLogger {
    fn append(&self, entry: &LedgerEntry) {
        self.offer(Item::Ledger(entry.clone()), Priority::High);
    }
}

async fn run_writer(shared: Arc<Shared>, mut rx: mpsc::Receiver<Command>) {
    let batch_size = shared.cfg.batch_size.max(1);
    let mut batch: Vec<Item> = Vec::with_capacity(batch_size);
    let mut tick = tokio::time::interval(Duration::from_millis(shared.cfg.flush_interval_ms.max(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Write(item)) => {
                    batch.push(item);
                    if batch.len() >= batch_size {
                        let _ = shared.write(&mut batch).await;
                    }
                }
                Some(Command::Flush(ack)) => {
                    shared.drain_spill(&mut batch);
                    let res = shared.write(&mut batch).await;
                    let _ = ack.send(res);
                }
                Some(Command::Shutdown(ack)) => {
                    rx.close();
                    let mut acks = vec![ack];
                    while let Ok(cmd) = rx.try_recv() {
                        match cmd {
                            Command::Write(item) => batch.push(item),
                            Command::Flush(a) | Command::Shutdown(a) => acks.push(a),
                        }
                    }
                    shared.drain_spill(&mut batch);
                    let res = shared.write(&mut batch).await;
                    for a in acks {
                        let _ = a.send(res.clone());
                    }
                    break;
                }
                None => {
                    shared.drain_spill(&mut batch);
                    let _ = shared.write(&mut batch).await;
                    break;
                }
            },
            _ = tick.tick() => {
                shared.drain_spill(&mut batch);
                let _ = shared.write(&mut batch).await;
            }
        }
    }
    tracing::debug!("counterfactual logger stopped");
}
