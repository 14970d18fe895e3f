//! ITIS adapter (JSON web service)
//!
//! Two steps: find a TSN by name, then fetch its full hierarchy. The name
//! search endpoint depends on the query's [`NameKind`]; unlabelled names try
//! the scientific search first and fall back to the common-name search.

use super::http::{AdapterSettings, HttpSource};
use super::normalize::normalize_ranks;
use super::{PartialRecord, SourceAdapter, SourceError};
use async_trait::async_trait;
use kestrel_common::{NameKind, Rank, Ranks, SourceId};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://www.itis.gov/ITISWebService/jsonservice";
pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 5;

/// Name search, then the full hierarchy
const REQUESTS_PER_LOOKUP: u32 = 2;

// ITIS pads empty result lists with a single `null`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScientificSearch {
    #[serde(default)]
    scientific_names: Vec<Option<NameHit>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommonSearch {
    #[serde(default)]
    common_names: Vec<Option<NameHit>>,
}

#[derive(Debug, Deserialize)]
struct NameHit {
    tsn: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Hierarchy {
    #[serde(default)]
    hierarchy_list: Vec<Option<HierarchyEntry>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HierarchyEntry {
    rank_name: Option<String>,
    taxon_name: Option<String>,
    tsn: Option<String>,
}

fn first_tsn(hits: Vec<Option<NameHit>>) -> Option<String> {
    hits.into_iter()
        .flatten()
        .filter_map(|hit| hit.tsn)
        .find(|tsn| !tsn.trim().is_empty())
}

/// Ranks at or above `tsn`; the full hierarchy also lists its children
fn lineage_ranks(entries: Vec<Option<HierarchyEntry>>, tsn: &str) -> Ranks {
    let mut ranks = Ranks::new();
    for entry in entries.into_iter().flatten() {
        if let (Some(rank), Some(name)) = (
            entry.rank_name.as_deref().and_then(Rank::parse),
            entry.taxon_name.as_deref(),
        ) {
            if !ranks.contains(rank) {
                ranks.set(rank, name);
            }
        }
        if entry.tsn.as_deref() == Some(tsn) {
            break;
        }
    }
    ranks
}

pub struct ItisAdapter {
    http: HttpSource,
}

impl ItisAdapter {
    pub fn new(settings: AdapterSettings) -> Result<Self, SourceError> {
        Ok(Self {
            http: HttpSource::new(SourceId::Itis, settings)?,
        })
    }

    async fn scientific_tsn(&self, key: &str) -> Result<Option<String>, SourceError> {
        let request = self
            .http
            .get(self.http.url("searchByScientificName"))
            .query(&[("srchKey", key)]);
        let response: ScientificSearch = self.http.get_json(request).await?;
        Ok(first_tsn(response.scientific_names))
    }

    async fn common_tsn(&self, key: &str) -> Result<Option<String>, SourceError> {
        let request = self
            .http
            .get(self.http.url("searchByCommonName"))
            .query(&[("srchKey", key)]);
        let response: CommonSearch = self.http.get_json(request).await?;
        Ok(first_tsn(response.common_names))
    }

    async fn find_tsn(&self, key: &str, kind: NameKind) -> Result<Option<String>, SourceError> {
        match kind {
            NameKind::Scientific => self.scientific_tsn(key).await,
            NameKind::Common => self.common_tsn(key).await,
            NameKind::Unknown => match self.scientific_tsn(key).await? {
                Some(tsn) => Ok(Some(tsn)),
                None => self.common_tsn(key).await,
            },
        }
    }

    async fn lookup_once(&self, key: &str, kind: NameKind) -> Result<PartialRecord, SourceError> {
        let tsn = self
            .find_tsn(key, kind)
            .await?
            .ok_or(SourceError::NotFound)?;

        let url = self.http.url("getFullHierarchyFromTSN");
        let request = self.http.get(&url).query(&[("tsn", tsn.as_str())]);
        let hierarchy: Hierarchy = self.http.get_json(request).await?;

        let ranks = normalize_ranks(&lineage_ranks(hierarchy.hierarchy_list, &tsn));
        if ranks.is_empty() {
            return Err(SourceError::NotFound);
        }

        debug!(key, tsn = %tsn, fields = ranks.len(), "ITIS hit");
        Ok(PartialRecord::new(
            ranks,
            format!(
                "https://www.itis.gov/servlet/SingleRpt/SingleRpt?search_topic=TSN&search_value={}",
                tsn
            ),
        ))
    }
}

#[async_trait]
impl SourceAdapter for ItisAdapter {
    fn source(&self) -> SourceId {
        SourceId::Itis
    }

    fn lookup_timeout(&self) -> Duration {
        self.http.settings().lookup_budget(REQUESTS_PER_LOOKUP)
    }

    async fn lookup(&self, key: &str, kind: NameKind) -> Result<PartialRecord, SourceError> {
        self.http
            .with_retries(key, move || self.lookup_once(key, kind))
            .await
    }
}
