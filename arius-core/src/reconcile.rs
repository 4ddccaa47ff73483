//! At-most-once creation per hash across concurrent producers.

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};

use anyhow::Result;

use crate::error::ArchiveError;
use crate::hash::Hash;

/// Outcome of [`ExistenceReconciler::claim_or_wait`].
#[derive(Debug, PartialEq, Eq)]
pub enum Claim<T> {
    /// Already present; the item is handed straight back.
    AlreadyExists(T),
    /// The caller is the sole producer and must eventually call `complete`.
    Claimed,
    /// Another producer owns the creation; the item is parked until it completes.
    Waiting,
}

struct Ledger<T> {
    created: HashSet<Hash>,
    creating: HashMap<Hash, Vec<T>>,
    probing: HashSet<Hash>,
}

/// Ledger of `not seen → creating → created` transitions for one entity kind.
///
/// Both maps live behind one lock so no two producers can observe a hash as
/// unseen at the same time. Repository probes run outside the lock; a hash
/// being probed is marked so later arrivals block on `probed` instead of
/// probing again.
pub struct ExistenceReconciler<T> {
    kind: &'static str,
    ledger: Mutex<Ledger<T>>,
    probed: Condvar,
}

/// Clears a probing mark if the probe unwinds.
struct ProbeMark<'a, T> {
    rec: &'a ExistenceReconciler<T>,
    hash: Hash,
    armed: bool,
}

impl<T> Drop for ProbeMark<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            let mut ledger = self.rec.ledger.lock().unwrap();
            ledger.probing.remove(&self.hash);
            self.rec.probed.notify_all();
        }
    }
}

impl<T> ExistenceReconciler<T> {
    pub fn new(kind: &'static str) -> Self {
        let ledger = Ledger { created: HashSet::new(), creating: HashMap::new(), probing: HashSet::new() };
        Self { kind, ledger: Mutex::new(ledger), probed: Condvar::new() }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Claim creation of `hash`, or queue `item` behind the current claimant.
    ///
    /// `probe` asks the repository whether `hash` already exists. It runs
    /// without holding the ledger lock, at most once per hash unless it
    /// fails; concurrent callers for the same hash wait for its answer.
    pub fn claim_or_wait<F>(&self, hash: Hash, item: T, probe: F) -> Result<Claim<T>>
    where
        F: FnOnce(&Hash) -> Result<bool>,
    {
        let mut ledger = self.ledger.lock().unwrap();
        while ledger.probing.contains(&hash) {
            ledger = self.probed.wait(ledger).unwrap();
        }
        if ledger.created.contains(&hash) {
            return Ok(Claim::AlreadyExists(item));
        }
        if let Some(waiters) = ledger.creating.get_mut(&hash) {
            waiters.push(item);
            return Ok(Claim::Waiting);
        }
        ledger.probing.insert(hash);
        drop(ledger);

        let mut mark = ProbeMark { rec: self, hash, armed: true };
        let found = probe(&hash);
        let mut ledger = self.ledger.lock().unwrap();
        mark.armed = false;
        ledger.probing.remove(&hash);
        self.probed.notify_all();
        if found? {
            ledger.created.insert(hash);
            return Ok(Claim::AlreadyExists(item));
        }
        ledger.creating.insert(hash, vec![item]);
        Ok(Claim::Claimed)
    }

    /// Mark `hash` created and release the claimant's item followed by every
    /// waiter, in arrival order.
    pub fn complete(&self, hash: &Hash) -> Result<Vec<T>> {
        let mut ledger = self.ledger.lock().unwrap();
        let Some(released) = ledger.creating.remove(hash) else {
            return Err(ArchiveError::ReconcilerNotClaimed(*hash).into());
        };
        ledger.created.insert(*hash);
        Ok(released)
    }

    /// Drop an unfinished claim without marking it created, returning the
    /// parked items. A later claim starts over.
    pub fn abandon(&self, hash: &Hash) -> Vec<T> {
        self.ledger.lock().unwrap().creating.remove(hash).unwrap_or_default()
    }

    pub fn is_created(&self, hash: &Hash) -> bool {
        self.ledger.lock().unwrap().created.contains(hash)
    }

    /// Hashes currently claimed but not completed.
    pub fn in_flight(&self) -> usize {
        self.ledger.lock().unwrap().creating.len()
    }

    /// Error if any claim is still open once all producers have finished.
    pub fn ensure_drained(&self) -> Result<()> {
        match self.in_flight() {
            0 => Ok(()),
            count => Err(ArchiveError::StrandedWaiters { kind: self.kind, count }.into()),
        }
    }
}
