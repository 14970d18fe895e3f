//! One search run, start to finish
//!
//! Open stores → snapshot progress → load input → resume filter → persist new
//! rejections → worker pool → escalation. Escalation is skipped when the run
//! was cancelled or escalation is disabled.

use crate::classifier::{HeuristicClassifier, NameClassifier};
use crate::escalation::{build_backend, EscalationStage};
use crate::input::load_queries;
use crate::resolver::ResolverChain;
use crate::sources::build_adapters;
use crate::store::{OutputPaths, OutputStateManager, ProgressState, ResumeFilter};
use crate::workflow::{ProgressReporter, WorkerPool};
use chrono::{DateTime, Utc};
use kestrel_common::config::KestrelConfig;
use kestrel_common::model::normalize_key;
use kestrel_common::{Error, Result, SourceId};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub input: PathBuf,
    pub paths: OutputPaths,
    /// Already clamped to the host (see [`crate::workflow::effective_concurrency`])
    pub concurrency: usize,
    pub progress_interval: usize,
}

/// Counts for one run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Distinct keys in the input
    pub total: usize,
    /// Input keys already present in a store at start-up
    pub previously_done: usize,
    pub matched: usize,
    pub missed: usize,
    /// Missed queries resolved by the escalation stage
    pub escalated: usize,
    /// Missed queries still without a match after escalation
    pub unresolved: usize,
    pub rejected: usize,
    pub cancelled: bool,
}

pub struct SearchPipeline {
    options: PipelineOptions,
    chain: Arc<ResolverChain>,
    classifier: Arc<dyn NameClassifier>,
    escalation: Option<EscalationStage>,
    cancel: CancellationToken,
}

impl SearchPipeline {
    pub fn new(options: PipelineOptions, chain: ResolverChain) -> Self {
        Self {
            options,
            chain: Arc::new(chain),
            classifier: Arc::new(HeuristicClassifier),
            escalation: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Adapters, chain and escalation backend as configured
    pub fn from_config(
        options: PipelineOptions,
        config: &KestrelConfig,
        cli_keys: &HashMap<SourceId, String>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let adapters = build_adapters(config, cli_keys)?;
        if adapters.is_empty() {
            return Err(Error::Config(
                "no taxonomy source is available; check priority and API keys".to_string(),
            ));
        }
        let chain = ResolverChain::new(adapters).with_relaxation(config.search.relax_terms);

        let mut pipeline = Self::new(options, chain).with_cancel(cancel.clone());
        if config.escalation.enabled {
            let backend = build_backend(&config.escalation).map_err(|e| Error::Config(e.to_string()))?;
            info!(backend = backend.name(), "Escalation enabled");
            pipeline = pipeline.with_escalation(
                EscalationStage::new(backend)
                    .with_concurrency(config.escalation.concurrency)
                    .with_timeout(Duration::from_secs(config.escalation.timeout_secs))
                    .with_cancel(cancel),
            );
        }
        Ok(pipeline)
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn NameClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_escalation(mut self, stage: EscalationStage) -> Self {
        self.escalation = Some(stage);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id);
        self.run_stages(run_id).instrument(span).await
    }

    async fn run_stages(&self, run_id: Uuid) -> Result<RunSummary> {
        let started_at = Utc::now();
        let paths = &self.options.paths;
        info!(
            input = %self.options.input.display(),
            output = %paths.matched.display(),
            "Search run starting"
        );

        // Opening repairs torn rows, so the snapshot below sees only complete ones
        let mut store = OutputStateManager::open(paths)?;
        let filter = ResumeFilter::new(ProgressState::load(paths)?);
        let input = load_queries(&self.options.input, self.classifier.as_ref())?;

        let mut keys: Vec<String> = input
            .queries
            .iter()
            .map(|q| q.normalized_key.clone())
            .collect();
        keys.extend(
            input
                .rejected
                .iter()
                .map(|r| normalize_key(&r.query().raw_text)),
        );
        let total = input.len();
        let previously_done = filter.already_done(keys.iter().map(String::as_str));

        let queries = filter.filter(input.queries);
        let rejections = filter.filter_rejections(input.rejected);
        info!(
            total,
            previously_done,
            to_resolve = queries.len(),
            new_rejections = rejections.len(),
            "Resume filter applied"
        );

        let progress = Arc::new(ProgressReporter::new(
            total,
            previously_done,
            self.options.progress_interval,
        ));
        for rejection in &rejections {
            store.append(rejection)?;
            progress.record(rejection);
        }

        let pool = WorkerPool::new(self.options.concurrency).with_cancel(self.cancel.clone());
        let run = pool
            .run(queries, Arc::clone(&self.chain), store, progress)
            .await?;
        // Escalation rewrites the missed store; release our handles first
        drop(run.store);

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            total,
            previously_done,
            matched: run.tally.matched,
            missed: run.tally.missed,
            escalated: 0,
            unresolved: run.tally.missed,
            rejected: rejections.len(),
            cancelled: run.cancelled,
        };

        match &self.escalation {
            Some(stage) if !run.cancelled => {
                let report = stage.escalate(paths).await?;
                summary.escalated = report.newly_matched;
                summary.unresolved = report.still_unresolved;
                summary.cancelled |= report.cancelled;
            }
            Some(_) => info!("Run cancelled, escalation skipped"),
            None => {}
        }

        summary.finished_at = Utc::now();
        info!(
            matched = summary.matched,
            missed = summary.missed,
            escalated = summary.escalated,
            unresolved = summary.unresolved,
            rejected = summary.rejected,
            previously_done = summary.previously_done,
            elapsed_secs = (summary.finished_at - summary.started_at).num_seconds(),
            "Search run finished"
        );
        Ok(summary)
    }
}
