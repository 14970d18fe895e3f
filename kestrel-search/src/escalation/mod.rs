//! Escalation Stage
//!
//! Second, slower pass over the queries the structured sources missed. Each
//! missed term is run through a general search engine; the first Wikipedia,
//! Wikispecies or ITIS result whose taxobox yields Genus and Species becomes a
//! matched row with `WebSearch` provenance.
//!
//! # Commit
//! A matched row for a missed key is the per-key marker that the miss is
//! superseded. After the pass, if any missed key is superseded, the still
//! unresolved rows are copied to the no-match store and only then is the
//! intermediate missed store deleted. With nothing superseded, both files are
//! left untouched. Re-running after a crash anywhere in between finds the
//! markers and completes the commit without duplicating rows.

use crate::sources::normalize::normalize_ranks;
use crate::sources::taxobox::parse_page;
use crate::store::{
    matched_header, matched_row, read_keys, read_missed, MissedRow, OutputPaths, StoreWriter,
    MISSED_HEADER,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use kestrel_common::model::NO_SEARCH_MATCH;
use kestrel_common::{Result, SourceId, TaxonomyRecord};
use reqwest::Url;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod backend;
pub mod candidates;

pub use backend::{build_backend, HttpSearchBackend, WebDriverSearchBackend};
pub use candidates::{extract_candidates, Candidate};

/// Appended to every term sent to the search engine
const QUERY_SUFFIX: &str = " taxonomy";

/// Results page plus at most one candidate page per page kind
const FETCHES_PER_TERM: u32 = 4;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EscalationError {
    #[error("search backend error: {0}")]
    Backend(String),

    #[error("no candidate page yielded a taxonomy")]
    NoCandidate,
}

/// Fetches search results and candidate pages
#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Base for resolving relative links on a results page
    fn search_url(&self) -> &Url;

    async fn fetch_results(&self, query: &str) -> std::result::Result<String, EscalationError>;

    async fn fetch_page(&self, url: &str) -> std::result::Result<String, EscalationError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EscalationReport {
    pub attempted: usize,
    pub newly_matched: usize,
    pub still_unresolved: usize,
    /// Missed store was retired in favour of the no-match store
    pub committed: bool,
    pub cancelled: bool,
}

pub struct EscalationStage {
    backend: Arc<dyn SearchBackend>,
    concurrency: usize,
    timeout: Duration,
    cancel: CancellationToken,
}

impl EscalationStage {
    pub fn new(backend: Arc<dyn SearchBackend>) -> Self {
        Self {
            backend,
            concurrency: 1,
            timeout: Duration::from_secs(30),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Budget for a single page fetch; a whole term gets one per fetch it may make
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn term_timeout(&self) -> Duration {
        self.timeout * FETCHES_PER_TERM
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Search for one term; at most one candidate record comes back
    pub async fn resolve_term(&self, term: &str) -> std::result::Result<TaxonomyRecord, EscalationError> {
        let query = format!("{}{}", term, QUERY_SUFFIX);
        let html = match tokio::time::timeout(self.timeout, self.backend.fetch_results(&query)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(EscalationError::Backend(format!(
                    "search results timed out after {:?}",
                    self.timeout
                )))
            }
        };
        let candidates = extract_candidates(&html, self.backend.search_url());
        debug!(term, candidates = candidates.len(), "Search results parsed");

        for candidate in candidates {
            let page = match tokio::time::timeout(self.timeout, self.backend.fetch_page(&candidate.url)).await {
                Ok(Ok(page)) => page,
                Ok(Err(e)) => {
                    debug!(term, url = %candidate.url, error = %e, "Candidate page fetch failed");
                    continue;
                }
                Err(_) => {
                    debug!(term, url = %candidate.url, "Candidate page fetch timed out");
                    continue;
                }
            };

            let ranks = normalize_ranks(&parse_page(candidate.kind, &page));
            if ranks.has_genus_and_species() {
                debug!(term, page = candidate.kind.label(), url = %candidate.url, "Candidate accepted");
                let mut record = TaxonomyRecord::new();
                record.fill_from(SourceId::WebSearch, &ranks);
                return Ok(record);
            }
        }
        Err(EscalationError::NoCandidate)
    }

    async fn attempt(&self, row: &MissedRow) -> Option<TaxonomyRecord> {
        if self.cancel.is_cancelled() {
            return None;
        }
        match tokio::time::timeout(self.term_timeout(), self.resolve_term(&row.key)).await {
            Ok(Ok(record)) => Some(record),
            Ok(Err(EscalationError::NoCandidate)) => {
                debug!(key = %row.key, "Escalation found no usable candidate");
                None
            }
            Ok(Err(e)) => {
                warn!(key = %row.key, backend = self.backend.name(), error = %e, "Escalation search failed");
                None
            }
            Err(_) => {
                warn!(key = %row.key, "Escalation search timed out");
                None
            }
        }
    }

    /// Escalate every row of the intermediate missed store
    ///
    /// Only store I/O failures are returned as errors.
    pub async fn escalate(&self, paths: &OutputPaths) -> Result<EscalationReport> {
        let rows = read_missed(&paths.missed)?;
        if rows.is_empty() {
            debug!("No missed queries to escalate");
            return Ok(EscalationReport::default());
        }

        let mut matched_keys: HashSet<String> = read_keys(&paths.matched)?.into_iter().collect();
        let pending: Vec<&MissedRow> = rows.iter().filter(|r| !matched_keys.contains(&r.key)).collect();
        let superseded_earlier = rows.len() - pending.len();

        info!(
            missed = rows.len(),
            pending = pending.len(),
            backend = self.backend.name(),
            "Starting escalation"
        );

        let mut matched = StoreWriter::open(&paths.matched, &matched_header())?;
        let mut results = stream::iter(pending.iter().copied())
            .map(|row| async move { (row, self.attempt(row).await) })
            .buffer_unordered(self.concurrency);

        let mut newly_matched = 0;
        while let Some((row, record)) = results.next().await {
            let Some(record) = record else {
                continue;
            };
            matched.append(matched_row(&row.raw_text, &row.key, &record))?;
            matched_keys.insert(row.key.clone());
            newly_matched += 1;
            info!(key = %row.key, "Escalation resolved query");
        }
        drop(results);

        let still_unresolved: Vec<&MissedRow> =
            rows.iter().filter(|r| !matched_keys.contains(&r.key)).collect();
        let mut report = EscalationReport {
            attempted: pending.len(),
            newly_matched,
            still_unresolved: still_unresolved.len(),
            committed: false,
            cancelled: self.cancel.is_cancelled(),
        };

        if report.cancelled {
            warn!(newly_matched, "Escalation cancelled, missed store left in place");
            return Ok(report);
        }
        if newly_matched + superseded_earlier == 0 {
            info!(
                unresolved = report.still_unresolved,
                "Escalation resolved nothing, missed store left in place"
            );
            return Ok(report);
        }

        self.commit(paths, &still_unresolved)?;
        report.committed = true;
        info!(
            newly_matched,
            unresolved = report.still_unresolved,
            "Escalation committed"
        );
        Ok(report)
    }

    /// Copy unresolved rows forward, then retire the missed store
    fn commit(&self, paths: &OutputPaths, unresolved: &[&MissedRow]) -> Result<()> {
        let already_final: HashSet<String> = read_keys(&paths.no_match)?.into_iter().collect();
        let mut no_match = StoreWriter::open(&paths.no_match, &MISSED_HEADER)?;
        for row in unresolved.iter().filter(|r| !already_final.contains(&r.key)) {
            no_match.append([row.raw_text.as_str(), row.key.as_str(), NO_SEARCH_MATCH])?;
        }
        drop(no_match);

        std::fs::remove_file(&paths.missed)?;
        debug!(path = %paths.missed.display(), "Removed intermediate missed store");
        Ok(())
    }
}
