//! Worker pool with a single serialized writer
//!
//! Queries are resolved as an unordered parallel map
//! (`futures::stream::buffer_unordered`). Outcomes cross a bounded channel to
//! a blocking writer thread that owns the [`OutputStateManager`]; workers never
//! touch the stores. Cancellation stops new queries from starting, lets
//! in-flight chains finish, and drains the channel before returning.

use super::progress::ProgressReporter;
use crate::resolver::ResolverChain;
use crate::store::{OutputStateManager, Tally};
use futures::stream::{self, StreamExt};
use kestrel_common::{Error, Query, ResolutionOutcome, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcomes buffered between workers and the writer
const CHANNEL_CAPACITY: usize = 64;

/// Result of one pool run; hands the stores back for the next stage
pub struct PoolRun {
    pub store: OutputStateManager,
    /// Outcomes written by this pool run only
    pub tally: Tally,
    pub cancelled: bool,
}

pub struct WorkerPool {
    concurrency: usize,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Resolve every query and persist exactly one outcome for each
    ///
    /// Only a store write failure is returned as an error; per-query lookup
    /// failures are already folded into `Missed` by the chain.
    pub async fn run(
        &self,
        queries: Vec<Query>,
        chain: Arc<ResolverChain>,
        store: OutputStateManager,
        progress: Arc<ProgressReporter>,
    ) -> Result<PoolRun> {
        let submitted = queries.len();
        let before = store.tally();
        info!(
            queries = submitted,
            workers = self.concurrency,
            "Starting worker pool"
        );

        let (tx, mut rx) = mpsc::channel::<ResolutionOutcome>(CHANNEL_CAPACITY);
        let writer_progress = Arc::clone(&progress);
        let writer = tokio::task::spawn_blocking(move || -> Result<OutputStateManager> {
            let mut store = store;
            while let Some(outcome) = rx.blocking_recv() {
                store.append(&outcome)?;
                writer_progress.record(&outcome);
            }
            Ok(store)
        });

        let mut outcomes = stream::iter(queries)
            .map(|query| {
                let chain = Arc::clone(&chain);
                let cancel = self.cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    debug!(key = %query.normalized_key, "Worker resolving query");
                    Some(chain.resolve(&query).await)
                }
            })
            .buffer_unordered(self.concurrency);

        while let Some(result) = outcomes.next().await {
            let Some(outcome) = result else {
                continue;
            };
            if tx.send(outcome).await.is_err() {
                // Writer has stopped; its error is reported below
                break;
            }
        }
        drop(outcomes);
        drop(tx);

        let store = writer
            .await
            .map_err(|e| Error::Internal(format!("store writer task failed: {}", e)))??;

        let after = store.tally();
        let tally = Tally {
            matched: after.matched - before.matched,
            missed: after.missed - before.missed,
            rejected: after.rejected - before.rejected,
        };
        let cancelled = self.cancel.is_cancelled();
        if cancelled {
            warn!(
                persisted = tally.total(),
                skipped = submitted - tally.total(),
                "Worker pool cancelled"
            );
        } else {
            info!(
                matched = tally.matched,
                missed = tally.missed,
                "Worker pool finished"
            );
        }

        Ok(PoolRun {
            store,
            tally,
            cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{PartialRecord, SourceAdapter, SourceError};
    use crate::store::OutputPaths;
    use async_trait::async_trait;
    use kestrel_common::{NameKind, Rank, Ranks, SourceId};
    use std::collections::HashSet;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Resolves `taxon N` unless N is a multiple of three
    struct ModuloSource(SourceId);

    #[async_trait]
    impl SourceAdapter for ModuloSource {
        fn source(&self) -> SourceId {
            self.0
        }

        fn lookup_timeout(&self) -> Duration {
            Duration::from_secs(5)
        }

        async fn lookup(
            &self,
            key: &str,
            _kind: NameKind,
        ) -> std::result::Result<PartialRecord, SourceError> {
            let n: u64 = key
                .rsplit(' ')
                .next()
                .and_then(|n| n.parse().ok())
                .ok_or(SourceError::NotFound)?;
            tokio::time::sleep(Duration::from_micros((n * 37) % 500)).await;
            if n % 3 == 0 {
                return Err(SourceError::NotFound);
            }
            let mut ranks = Ranks::new();
            match self.0 {
                SourceId::Ncbi => ranks.set(Rank::Genus, format!("Genus{}", n)),
                _ => ranks.set(Rank::Species, format!("Genus{} epithet{}", n, n)),
            }
            Ok(PartialRecord { ranks, url: None })
        }
    }

    fn queries(n: usize) -> Vec<Query> {
        (0..n).map(|i| Query::new(format!("Taxon {}", i))).collect()
    }

    fn chain() -> Arc<ResolverChain> {
        Arc::new(ResolverChain::new(vec![
            Arc::new(ModuloSource(SourceId::Ncbi)),
            Arc::new(ModuloSource(SourceId::Gbif)),
        ]))
    }

    async fn run_in(dir: &Path, concurrency: usize, n: usize) -> PoolRun {
        let paths = OutputPaths::in_dir(dir);
        let store = OutputStateManager::open(&paths).unwrap();
        let progress = Arc::new(ProgressReporter::new(n, 0, 100));
        let run = WorkerPool::new(concurrency)
            .run(queries(n), chain(), store, Arc::clone(&progress))
            .await
            .unwrap();
        assert_eq!(progress.fraction(), 1.0);
        run
    }

    fn sorted_lines(path: &Path) -> Vec<String> {
        let mut lines: Vec<String> = std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        lines.sort();
        lines
    }

    #[tokio::test]
    async fn test_concurrency_does_not_change_rows() {
        let serial = TempDir::new().unwrap();
        let parallel = TempDir::new().unwrap();

        let one = run_in(serial.path(), 1, 500).await;
        let eight = run_in(parallel.path(), 8, 500).await;

        assert_eq!(one.tally, eight.tally);
        assert_eq!(one.tally.matched, 333);
        assert_eq!(one.tally.missed, 167);

        let a = OutputPaths::in_dir(serial.path());
        let b = OutputPaths::in_dir(parallel.path());
        assert_eq!(sorted_lines(&a.matched), sorted_lines(&b.matched));
        assert_eq!(sorted_lines(&a.missed), sorted_lines(&b.missed));
    }

    #[tokio::test]
    async fn test_every_key_persisted_once() {
        let dir = TempDir::new().unwrap();
        run_in(dir.path(), 8, 200).await;

        let paths = OutputPaths::in_dir(dir.path());
        let mut keys = crate::store::read_keys(&paths.matched).unwrap();
        keys.extend(crate::store::read_keys(&paths.missed).unwrap());

        let distinct: HashSet<&String> = keys.iter().collect();
        assert_eq!(keys.len(), 200);
        assert_eq!(distinct.len(), 200);
    }

    #[tokio::test]
    async fn test_cancelled_pool_starts_nothing() {
        let dir = TempDir::new().unwrap();
        let paths = OutputPaths::in_dir(dir.path());
        let store = OutputStateManager::open(&paths).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let run = WorkerPool::new(4)
            .with_cancel(cancel)
            .run(
                queries(50),
                chain(),
                store,
                Arc::new(ProgressReporter::new(50, 0, 10)),
            )
            .await
            .unwrap();

        assert!(run.cancelled);
        assert_eq!(run.tally.total(), 0);
        assert!(crate::store::read_keys(&paths.matched).unwrap().is_empty());
    }
}
