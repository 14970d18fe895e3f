//! Completion tracking for a run
//!
//! The fraction counts keys resumed from a previous run as already done, so it
//! starts at `previously_done / total` and reaches exactly 1.0 once every
//! outcome has been persisted.

use kestrel_common::ResolutionOutcome;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

#[derive(Debug)]
pub struct ProgressReporter {
    total: usize,
    previously_done: usize,
    interval: usize,
    persisted: AtomicUsize,
    matched: AtomicUsize,
    missed: AtomicUsize,
}

impl ProgressReporter {
    pub fn new(total: usize, previously_done: usize, interval: usize) -> Self {
        Self {
            total,
            previously_done: previously_done.min(total),
            interval: interval.max(1),
            persisted: AtomicUsize::new(0),
            matched: AtomicUsize::new(0),
            missed: AtomicUsize::new(0),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn previously_done(&self) -> usize {
        self.previously_done
    }

    /// Outcomes persisted in this run
    pub fn persisted(&self) -> usize {
        self.persisted.load(Ordering::Relaxed)
    }

    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        let done = (self.previously_done + self.persisted()).min(self.total);
        done as f64 / self.total as f64
    }

    /// Count one persisted outcome; returns the new completion fraction
    pub fn record(&self, outcome: &ResolutionOutcome) -> f64 {
        match outcome {
            ResolutionOutcome::Matched { .. } => {
                self.matched.fetch_add(1, Ordering::Relaxed);
            }
            ResolutionOutcome::Missed { .. } => {
                self.missed.fetch_add(1, Ordering::Relaxed);
            }
            ResolutionOutcome::Rejected { .. } => {}
        }
        let current = self.persisted.fetch_add(1, Ordering::Relaxed) + 1;
        let fraction = self.fraction();

        if current % self.interval == 0 || fraction >= 1.0 {
            info!(
                progress = format!("{:.1}%", fraction * 100.0),
                matched = self.matched.load(Ordering::Relaxed),
                missed = self.missed.load(Ordering::Relaxed),
                "Search progress"
            );
        }
        fraction
    }
}
