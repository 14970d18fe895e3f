//! NCBI Taxonomy adapter (Datasets v2 JSON API)
//!
//! `GET {base}/taxonomy/taxon/{name}` returns taxonomy nodes whose
//! `classification` object carries one `{name, id}` entry per rank. An API key
//! is optional and raises NCBI's rate allowance when present.

use super::http::{AdapterSettings, HttpSource};
use super::normalize::normalize_ranks;
use super::{PartialRecord, SourceAdapter, SourceError};
use async_trait::async_trait;
use kestrel_common::{NameKind, Rank, Ranks, SourceId};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.ncbi.nlm.nih.gov/datasets/v2";
pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 3;

const REQUESTS_PER_LOOKUP: u32 = 1;

#[derive(Debug, Deserialize)]
struct TaxonomyResponse {
    #[serde(default)]
    taxonomy_nodes: Vec<TaxonomyNode>,
}

#[derive(Debug, Deserialize)]
struct TaxonomyNode {
    taxonomy: Option<Taxonomy>,
}

#[derive(Debug, Deserialize)]
struct Taxonomy {
    tax_id: Option<u64>,
    #[serde(default)]
    classification: Classification,
}

#[derive(Debug, Default, Deserialize)]
struct Classification {
    kingdom: Option<Named>,
    phylum: Option<Named>,
    class: Option<Named>,
    order: Option<Named>,
    family: Option<Named>,
    genus: Option<Named>,
    species: Option<Named>,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

impl Classification {
    fn ranks(&self) -> Ranks {
        [
            (Rank::Kingdom, &self.kingdom),
            (Rank::Phylum, &self.phylum),
            (Rank::Class, &self.class),
            (Rank::Order, &self.order),
            (Rank::Family, &self.family),
            (Rank::Genus, &self.genus),
            (Rank::Species, &self.species),
        ]
        .into_iter()
        .filter_map(|(rank, named)| named.as_ref().map(|n| (rank, n.name.clone())))
        .collect()
    }
}

pub struct NcbiAdapter {
    http: HttpSource,
}

impl NcbiAdapter {
    pub fn new(settings: AdapterSettings) -> Result<Self, SourceError> {
        Ok(Self {
            http: HttpSource::new(SourceId::Ncbi, settings)?,
        })
    }

    async fn lookup_once(&self, key: &str) -> Result<PartialRecord, SourceError> {
        let url = self.http.segment_url(&["taxonomy", "taxon", key])?;
        let mut request = self.http.get(url.clone());
        if let Some(api_key) = self.http.api_key() {
            request = request.header("api-key", api_key);
        }

        let response: TaxonomyResponse = self.http.get_json(request).await?;

        let taxonomy = response
            .taxonomy_nodes
            .into_iter()
            .find_map(|node| node.taxonomy)
            .ok_or(SourceError::NotFound)?;

        let ranks = normalize_ranks(&taxonomy.classification.ranks());
        if ranks.is_empty() {
            return Err(SourceError::NotFound);
        }

        debug!(key, tax_id = taxonomy.tax_id, fields = ranks.len(), "NCBI hit");
        Ok(PartialRecord::new(ranks, url))
    }
}

#[async_trait]
impl SourceAdapter for NcbiAdapter {
    fn source(&self) -> SourceId {
        SourceId::Ncbi
    }

    fn lookup_timeout(&self) -> Duration {
        self.http.settings().lookup_budget(REQUESTS_PER_LOOKUP)
    }

    async fn lookup(&self, key: &str, _kind: NameKind) -> Result<PartialRecord, SourceError> {
        self.http
            .with_retries(key, move || self.lookup_once(key))
            .await
    }
}
