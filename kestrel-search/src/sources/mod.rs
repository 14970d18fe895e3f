//! Taxonomy source adapters
//!
//! Every external source is reached through [`SourceAdapter`]. The resolver
//! chain only sees this trait, so sources can be reordered, dropped or faked
//! without touching the merge logic.
//!
//! # Architecture
//! - One adapter instance per source, shared by all workers through `Arc`
//! - Each adapter owns a [`RateGovernor`] (requests/second quota + backoff)
//! - Transport failures are retried locally (`max_retries`); negatives never are
//! - Every partial record passes through [`normalize::normalize_ranks`]

use async_trait::async_trait;
use kestrel_common::config::{KestrelConfig, SourceSettings};
use kestrel_common::{NameKind, Ranks, SourceId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub mod eol;
pub mod gbif;
pub mod http;
pub mod itis;
pub mod iucn;
pub mod ncbi;
pub mod normalize;
pub mod rate_governor;
pub mod taxobox;
pub mod wikipedia;

pub use eol::EolAdapter;
pub use gbif::GbifAdapter;
pub use http::{AdapterSettings, HttpSource};
pub use itis::ItisAdapter;
pub use iucn::IucnAdapter;
pub use ncbi::NcbiAdapter;
pub use rate_governor::RateGovernor;
pub use wikipedia::WikipediaAdapter;

/// Ranks one source returned for one name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialRecord {
    pub ranks: Ranks,
    /// Page or API URL the ranks came from (audit only)
    pub url: Option<String>,
}

impl PartialRecord {
    pub fn new(ranks: Ranks, url: impl Into<String>) -> Self {
        Self {
            ranks,
            url: Some(url.into()),
        }
    }
}

/// Lookup failure reported by a source
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// Authoritative negative: the source has no record for this name
    #[error("not found")]
    NotFound,

    /// Network or service failure
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The source asked us to slow down
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
}

impl SourceError {
    /// Transient failures are worth another attempt in a later run
    pub fn is_transient(&self) -> bool {
        !matches!(self, SourceError::NotFound)
    }
}

/// Uniform capability every taxonomy source provides
///
/// Implementations must be safe to call concurrently; the only state shared
/// across calls is the adapter's rate governor.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Source identifier (provenance column)
    fn source(&self) -> SourceId;

    /// Check if the adapter can run (API key configured, etc.)
    fn is_available(&self) -> bool {
        true
    }

    /// Upper bound on one whole lookup, enforced by the resolver chain
    ///
    /// Must cover every request the lookup makes, its local retries and
    /// retry delays, and any rate-limit wait in front of them.
    fn lookup_timeout(&self) -> Duration;

    /// Look up a search term
    ///
    /// # Returns
    /// * `Ok(PartialRecord)` - at least one rank field was found
    /// * `Err(SourceError::NotFound)` - the source has nothing for this name
    /// * `Err(_)` - transient failure; logged, never aborts the chain
    async fn lookup(&self, key: &str, kind: NameKind) -> Result<PartialRecord, SourceError>;
}

/// Build the configured adapter chain in priority order
///
/// Adapters that report `is_available() == false` (missing API key) are
/// dropped with a warning. `cli_keys` holds keys given on the command line.
pub fn build_adapters(
    config: &KestrelConfig,
    cli_keys: &HashMap<SourceId, String>,
) -> kestrel_common::Result<Vec<Arc<dyn SourceAdapter>>> {
    let mut adapters: Vec<Arc<dyn SourceAdapter>> = Vec::new();

    for source in config.sources.ordered() {
        let Some(settings) = config.sources.settings(source) else {
            continue;
        };
        let api_key = kestrel_common::config::resolve_api_key(
            source,
            cli_keys.get(&source).map(String::as_str),
            config,
        );
        let adapter = build_adapter(source, settings, api_key)?;

        if adapter.is_available() {
            adapters.push(adapter);
        } else {
            warn!(
                source = %source,
                env = %source.api_key_env(),
                "Source requires an API key and none was configured, skipping"
            );
        }
    }

    info!(
        sources = %adapters.iter().map(|a| a.source().to_string()).collect::<Vec<_>>().join(" > "),
        "Resolver chain configured"
    );
    Ok(adapters)
}

fn build_adapter(
    source: SourceId,
    settings: &SourceSettings,
    api_key: Option<String>,
) -> kestrel_common::Result<Arc<dyn SourceAdapter>> {
    let client_error = |e: SourceError| kestrel_common::Error::Config(format!("{} adapter: {}", source, e));
    let adapter: Arc<dyn SourceAdapter> = match source {
        SourceId::Ncbi => Arc::new(NcbiAdapter::new(AdapterSettings::resolve(
            ncbi::DEFAULT_BASE_URL,
            ncbi::DEFAULT_REQUESTS_PER_SECOND,
            settings,
            api_key,
        )).map_err(client_error)?),
        SourceId::Gbif => Arc::new(GbifAdapter::new(AdapterSettings::resolve(
            gbif::DEFAULT_BASE_URL,
            gbif::DEFAULT_REQUESTS_PER_SECOND,
            settings,
            api_key,
        )).map_err(client_error)?),
        SourceId::Itis => Arc::new(ItisAdapter::new(AdapterSettings::resolve(
            itis::DEFAULT_BASE_URL,
            itis::DEFAULT_REQUESTS_PER_SECOND,
            settings,
            api_key,
        )).map_err(client_error)?),
        SourceId::Iucn => Arc::new(IucnAdapter::new(AdapterSettings::resolve(
            iucn::DEFAULT_BASE_URL,
            iucn::DEFAULT_REQUESTS_PER_SECOND,
            settings,
            api_key,
        )).map_err(client_error)?),
        SourceId::Eol => Arc::new(EolAdapter::new(AdapterSettings::resolve(
            eol::DEFAULT_BASE_URL,
            eol::DEFAULT_REQUESTS_PER_SECOND,
            settings,
            api_key,
        )).map_err(client_error)?),
        SourceId::Wikipedia => Arc::new(WikipediaAdapter::new(AdapterSettings::resolve(
            wikipedia::DEFAULT_BASE_URL,
            wikipedia::DEFAULT_REQUESTS_PER_SECOND,
            settings,
            api_key,
        )).map_err(client_error)?),
        SourceId::WebSearch => {
            return Err(kestrel_common::Error::Config(
                "web search is an escalation backend, not a chain source".to_string(),
            ))
        }
    };
    Ok(adapter)
}
