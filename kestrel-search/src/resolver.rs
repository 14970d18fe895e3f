//! Resolver chain: one query against the ordered adapter list
//!
//! # Architecture
//! - Adapters are consulted in fixed priority order
//! - Each partial record is merged fill-only-if-empty: a field set by a
//!   higher-priority source is never overwritten
//! - Once Genus and Species are both present the remaining sources are skipped
//! - Source failures are recorded in a [`ChainReport`] and never abort the chain
//! - A multi-word term that misses entirely is retried with its leading word
//!   dropped (`gray kit fox` → `kit fox` → `fox`)

use crate::sources::{SourceAdapter, SourceError};
use kestrel_common::{NameKind, Query, ResolutionOutcome, SourceId, TaxonomyRecord};
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-query telemetry: what each source did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainReport {
    /// Term the final record was resolved with
    pub term: String,
    /// Sources that contributed at least one field
    pub hits: Vec<SourceId>,
    /// Sources that answered but had nothing new (or nothing at all)
    pub misses: Vec<SourceId>,
    /// Sources that failed transiently, with the reason
    pub failures: Vec<(SourceId, String)>,
    /// Sources not consulted because the record was already complete
    pub skipped: Vec<SourceId>,
}

/// Ordered list of source adapters with the fill-only merge policy
pub struct ResolverChain {
    sources: Vec<Arc<dyn SourceAdapter>>,
    relax_terms: bool,
}

impl ResolverChain {
    pub fn new(sources: Vec<Arc<dyn SourceAdapter>>) -> Self {
        Self {
            sources,
            relax_terms: true,
        }
    }

    /// Enable or disable leading-word relaxation on a miss
    pub fn with_relaxation(mut self, relax_terms: bool) -> Self {
        self.relax_terms = relax_terms;
        self
    }

    pub fn sources(&self) -> impl Iterator<Item = SourceId> + '_ {
        self.sources.iter().map(|s| s.source())
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Resolve one query to exactly one outcome
    pub async fn resolve(&self, query: &Query) -> ResolutionOutcome {
        let (record, report) = self.resolve_with_report(query).await;
        if record.is_match() {
            ResolutionOutcome::Matched {
                query: query.clone(),
                record,
            }
        } else {
            if !report.failures.is_empty() {
                debug!(
                    key = %query.normalized_key,
                    failures = report.failures.len(),
                    "Missed with transient source failures"
                );
            }
            ResolutionOutcome::missed(query.clone())
        }
    }

    /// Resolve and return the merged record with its telemetry
    ///
    /// Terms are tried from the full key down to its last word when
    /// relaxation is on; the first term yielding any provenance wins.
    pub async fn resolve_with_report(&self, query: &Query) -> (TaxonomyRecord, ChainReport) {
        let terms = self.candidate_terms(&query.normalized_key);
        let mut last = (TaxonomyRecord::new(), ChainReport::default());

        for (attempt, term) in terms.iter().enumerate() {
            if attempt > 0 {
                debug!(key = %query.normalized_key, term = %term, "Relaxing search term");
            }
            let (record, report) = self.run_chain(term, query.kind).await;
            let matched = record.is_match();
            last = (record, report);
            if matched {
                break;
            }
        }

        debug!(
            key = %query.normalized_key,
            term = %last.1.term,
            hits = ?last.1.hits,
            misses = ?last.1.misses,
            failures = ?last.1.failures,
            skipped = ?last.1.skipped,
            "Chain finished"
        );
        last
    }

    fn candidate_terms(&self, key: &str) -> Vec<String> {
        let words: Vec<&str> = key.split_whitespace().collect();
        if words.is_empty() {
            return Vec::new();
        }
        if !self.relax_terms {
            return vec![words.join(" ")];
        }
        (0..words.len()).map(|i| words[i..].join(" ")).collect()
    }

    async fn run_chain(&self, term: &str, kind: NameKind) -> (TaxonomyRecord, ChainReport) {
        let mut record = TaxonomyRecord::new();
        let mut report = ChainReport {
            term: term.to_string(),
            ..Default::default()
        };

        for (position, adapter) in self.sources.iter().enumerate() {
            if record.is_complete_enough() {
                report
                    .skipped
                    .extend(self.sources[position..].iter().map(|s| s.source()));
                break;
            }

            let source = adapter.source();
            let budget = adapter.lookup_timeout();
            let result = match tokio::time::timeout(budget, adapter.lookup(term, kind)).await {
                Ok(result) => result,
                Err(_) => Err(SourceError::Unavailable(format!(
                    "lookup timed out after {:?}",
                    budget
                ))),
            };

            match result {
                Ok(partial) => {
                    let filled = record.fill_from(source, &partial.ranks);
                    if filled > 0 {
                        debug!(
                            source = %source,
                            term,
                            filled,
                            url = partial.url.as_deref().unwrap_or_default(),
                            "Source contributed fields"
                        );
                        report.hits.push(source);
                    } else {
                        report.misses.push(source);
                    }
                }
                Err(SourceError::NotFound) => {
                    debug!(source = %source, term, "Source has no record");
                    report.misses.push(source);
                }
                Err(e) => {
                    warn!(source = %source, term, error = %e, "Source lookup failed");
                    report.failures.push((source, e.to_string()));
                }
            }
        }

        (record, report)
    }
}
