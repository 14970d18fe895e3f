//! Concurrent resolution of the filtered query set
//!
//! [`WorkerPool`] runs the resolver chain for many queries at once and funnels
//! every outcome through one writer thread; [`ProgressReporter`] tracks how
//! much of the input is accounted for.

use std::num::NonZeroUsize;

pub mod pool;
pub mod progress;

pub use pool::{PoolRun, WorkerPool};
pub use progress::ProgressReporter;

/// Worker count: the requested value clamped to the host's parallelism
///
/// `None` or `Some(0)` means "use every available core".
pub fn effective_concurrency(requested: Option<usize>) -> usize {
    let available = std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    match requested {
        Some(n) if n > 0 => n.min(available),
        _ => available,
    }
}
