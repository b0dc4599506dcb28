//! Per-key locked state for bandit posteriors.
//!
//! Two lock levels:
//! - the outer map lock is held only long enough to find (or insert) a cell,
//! - each cell has its own `RwLock`, so updates to different keys never contend.
//!
//! Reads only ever take shared locks and never insert; a missing key reads as `None`
//! and the caller substitutes its prior.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::error::{Result, TuneError};

/// Map of independently locked cells.
#[derive(Debug)]
pub struct KeyedCells<K, V> {
    map: RwLock<HashMap<K, Arc<RwLock<V>>>>,
}

impl<K, V> Default for KeyedCells<K, V> {
    fn default() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V> KeyedCells<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, key: &K, deadline: Option<Instant>) -> Result<Option<Arc<RwLock<V>>>> {
        let guard = match deadline {
            Some(d) => self
                .map
                .try_read_until(d)
                .ok_or(TuneError::DeadlineExceeded)?,
            None => self.map.read(),
        };
        Ok(guard.get(key).cloned())
    }

    /// Run `f` against the current value for `key` under a shared lock.
    ///
    /// With a deadline, gives up with [`TuneError::DeadlineExceeded`] instead of waiting
    /// past it.
    pub fn read<R>(
        &self,
        key: &K,
        deadline: Option<Instant>,
        f: impl FnOnce(Option<&V>) -> R,
    ) -> Result<R> {
        let Some(cell) = self.cell(key, deadline)? else {
            return Ok(f(None));
        };
        let guard = match deadline {
            Some(d) => cell.try_read_until(d).ok_or(TuneError::DeadlineExceeded)?,
            None => cell.read(),
        };
        Ok(f(Some(&*guard)))
    }

    /// Mutate the value for `key`, creating it with `init` if absent.
    ///
    /// Serialized per key only.
    pub fn update<R>(&self, key: K, init: impl FnOnce() -> V, f: impl FnOnce(&mut V) -> R) -> R {
        let existing = self.map.read().get(&key).cloned();
        let cell = match existing {
            Some(c) => c,
            None => self
                .map
                .write()
                .entry(key)
                .or_insert_with(|| Arc::new(RwLock::new(init())))
                .clone(),
        };
        let mut guard = cell.write();
        f(&mut guard)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Copy of every cell. Each cell is read independently, so the copy is not a
    /// single atomic cut across keys.
    pub fn snapshot(&self) -> Vec<(K, V)>
    where
        V: Clone,
    {
        let cells: Vec<(K, Arc<RwLock<V>>)> = self
            .map
            .read()
            .iter()
            .map(|(k, c)| (k.clone(), Arc::clone(c)))
            .collect();
        cells
            .into_iter()
            .map(|(k, c)| {
                let v = c.read().clone();
                (k, v)
            })
            .collect()
    }

    /// Replace all cells.
    pub fn replace_all(&self, entries: impl IntoIterator<Item = (K, V)>) {
        let fresh: HashMap<K, Arc<RwLock<V>>> = entries
            .into_iter()
            .map(|(k, v)| (k, Arc::new(RwLock::new(v))))
            .collect();
        *self.map.write() = fresh;
    }
}
