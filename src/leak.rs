//! Sampling leak detector
//!
//! Debug aid for arrays that are never released explicitly or by a scope.
//! One allocation in `sample_every` is tracked together with the backtrace of
//! the call that created it. Each [`LeakDetector::advance_epoch`] (one per
//! `model_iteration`) ages the tracked set; anything still live after
//! `report_after` epochs is logged once.

use log::warn;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

struct Tracked {
    born: u64,
    reported: bool,
    origin: Backtrace,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeakReport {
    pub id: u64,
    pub age: u64,
}

pub struct LeakDetector {
    sample_every: u64,
    report_after: u64,
    allocations: AtomicU64,
    epoch: AtomicU64,
    live: Mutex<HashMap<u64, Tracked>>,
}

impl std::fmt::Debug for LeakDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeakDetector")
            .field("sample_every", &self.sample_every)
            .field("report_after", &self.report_after)
            .field("epoch", &self.epoch())
            .field("tracked", &self.tracked())
            .finish()
    }
}

impl LeakDetector {
    #[must_use]
    pub fn new(sample_every: u32, report_after: u64) -> Self {
        Self {
            sample_every: u64::from(sample_every.max(1)),
            report_after: report_after.max(1),
            allocations: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Count an allocation; returns `true` when it was sampled
    pub fn track(&self, id: u64) -> bool {
        let n = self.allocations.fetch_add(1, Ordering::Relaxed);
        if n % self.sample_every != 0 {
            return false;
        }
        let tracked = Tracked {
            born: self.epoch(),
            reported: false,
            origin: Backtrace::force_capture(),
        };
        self.live
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id, tracked);
        true
    }

    pub fn untrack(&self, id: u64) {
        self.live
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&id);
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Number of sampled allocations still live
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.live
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Start a new epoch and report allocations that outlived the threshold
    ///
    /// Each allocation is reported at most once.
    pub fn advance_epoch(&self) -> Vec<LeakReport> {
        let now = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let mut live = self
            .live
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut reports = Vec::new();
        for (&id, tracked) in live.iter_mut() {
            let age = now - tracked.born;
            if age >= self.report_after && !tracked.reported {
                tracked.reported = true;
                warn!(
                    "array buffer {id} still live after {age} epochs; allocated at:\n{}",
                    tracked.origin
                );
                reports.push(LeakReport { id, age });
            }
        }
        reports.sort_by_key(|r| r.id);
        reports
    }
}
