//! Stage completion barriers and the shared fault latch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use anyhow::Result;
use tracing::error;

/// Countdown per named stage. A stage is done once all of its workers have
/// arrived; waiters block on the AND of any set of stages.
pub struct AndJoin {
    remaining: Mutex<HashMap<&'static str, usize>>,
    changed: Condvar,
}

impl AndJoin {
    /// `stages` lists each stage with its worker count.
    pub fn new(stages: &[(&'static str, usize)]) -> Self {
        Self { remaining: Mutex::new(stages.iter().copied().collect()), changed: Condvar::new() }
    }

    /// One worker of `stage` finished. Returns `true` for the last one.
    pub fn arrive(&self, stage: &'static str) -> bool {
        let mut rem = self.remaining.lock().unwrap();
        let n = rem.entry(stage).or_insert(0);
        *n = n.saturating_sub(1);
        let last = *n == 0;
        if last {
            self.changed.notify_all();
        }
        last
    }

    /// Arrives on drop, so a worker that bails with `?` still counts down.
    pub fn guard(&self, stage: &'static str) -> ArrivalGuard<'_> {
        ArrivalGuard { join: self, stage }
    }

    pub fn is_done(&self, stage: &str) -> bool {
        self.remaining.lock().unwrap().get(stage).copied().unwrap_or(0) == 0
    }

    /// Block until every stage in `stages` is done.
    pub fn wait_for(&self, stages: &[&str]) {
        let mut rem = self.remaining.lock().unwrap();
        while stages.iter().any(|s| rem.get(s).copied().unwrap_or(0) > 0) {
            rem = self.changed.wait(rem).unwrap();
        }
    }
}

pub struct ArrivalGuard<'a> {
    join: &'a AndJoin,
    stage: &'static str,
}

impl Drop for ArrivalGuard<'_> {
    fn drop(&mut self) {
        self.join.arrive(self.stage);
    }
}

/// First-error latch. Once tripped, stages stop admitting new work.
#[derive(Default)]
pub struct Fault {
    tripped: AtomicBool,
    first: Mutex<Option<anyhow::Error>>,
}

impl Fault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Record `err`; only the first error is kept.
    pub fn trip(&self, err: anyhow::Error) {
        let mut first = self.first.lock().unwrap();
        if first.is_none() {
            error!("{err:#}");
            *first = Some(err);
        }
        self.tripped.store(true, Ordering::Release);
    }

    /// Run `f`, tripping the latch on error.
    pub fn capture<T>(&self, f: impl FnOnce() -> Result<T>) -> Option<T> {
        match f() {
            Ok(v) => Some(v),
            Err(e) => {
                self.trip(e);
                None
            }
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self.first.into_inner().unwrap() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
