//! IUCN Red List adapter
//!
//! Requires an API token; without one the adapter reports itself unavailable
//! and is dropped from the chain. Values come back upper-case and are
//! title-cased by the normaliser.

use super::http::{AdapterSettings, HttpSource};
use super::normalize::normalize_ranks;
use super::{PartialRecord, SourceAdapter, SourceError};
use async_trait::async_trait;
use kestrel_common::{NameKind, Rank, Ranks, SourceId};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://apiv3.iucnredlist.org/api/v3";
pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 2;

const REQUESTS_PER_LOOKUP: u32 = 1;

#[derive(Debug, Deserialize)]
struct SpeciesResponse {
    #[serde(default)]
    result: Vec<SpeciesRow>,
}

#[derive(Debug, Deserialize)]
struct SpeciesRow {
    taxonid: Option<u64>,
    scientific_name: Option<String>,
    kingdom: Option<String>,
    phylum: Option<String>,
    class: Option<String>,
    order: Option<String>,
    family: Option<String>,
    genus: Option<String>,
}

impl SpeciesRow {
    fn ranks(self) -> Ranks {
        [
            (Rank::Kingdom, self.kingdom),
            (Rank::Phylum, self.phylum),
            (Rank::Class, self.class),
            (Rank::Order, self.order),
            (Rank::Family, self.family),
            (Rank::Genus, self.genus),
            (Rank::Species, self.scientific_name),
        ]
        .into_iter()
        .filter_map(|(rank, value)| value.map(|v| (rank, v)))
        .collect()
    }
}

pub struct IucnAdapter {
    http: HttpSource,
}

impl IucnAdapter {
    pub fn new(settings: AdapterSettings) -> Result<Self, SourceError> {
        Ok(Self {
            http: HttpSource::new(SourceId::Iucn, settings)?,
        })
    }

    async fn lookup_once(&self, key: &str) -> Result<PartialRecord, SourceError> {
        let token = self
            .http
            .api_key()
            .ok_or_else(|| SourceError::Unavailable("IUCN token not configured".to_string()))?;

        let url = self.http.segment_url(&["species", key])?;
        let request = self.http.get(url.clone()).query(&[("token", token)]);
        let response: SpeciesResponse = self.http.get_json(request).await?;

        let row = response
            .result
            .into_iter()
            .next()
            .ok_or(SourceError::NotFound)?;
        let taxon_id = row.taxonid;

        let ranks = normalize_ranks(&row.ranks());
        if ranks.is_empty() {
            return Err(SourceError::NotFound);
        }

        debug!(key, taxon_id, fields = ranks.len(), "IUCN hit");
        // The audit URL must not carry the token
        Ok(PartialRecord::new(ranks, url))
    }
}

#[async_trait]
impl SourceAdapter for IucnAdapter {
    fn source(&self) -> SourceId {
        SourceId::Iucn
    }

    fn is_available(&self) -> bool {
        self.http.api_key().is_some()
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

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> IucnAdapter {
        let settings = AdapterSettings::new(server.uri())
            .with_api_key("secret")
            .with_retries(0, Duration::from_millis(1));
        IucnAdapter::new(settings).unwrap()
    }

    #[test]
    fn test_unavailable_without_key() {
        let adapter = IucnAdapter::new(AdapterSettings::new(DEFAULT_BASE_URL)).unwrap();
        assert!(!adapter.is_available());
    }

    #[tokio::test]
    async fn test_first_result_row() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/species/vulpes%20macrotis"))
            .and(query_param("token", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "vulpes macrotis",
                "result": [{
                    "taxonid": 41587,
                    "scientific_name": "Vulpes macrotis",
                    "kingdom": "ANIMALIA",
                    "phylum": "CHORDATA",
                    "class": "MAMMALIA",
                    "order": "CARNIVORA",
                    "family": "CANIDAE",
                    "genus": "Vulpes"
                }]
            })))
            .mount(&server)
            .await;

        let record = adapter(&server)
            .lookup("vulpes macrotis", NameKind::Scientific)
            .await
            .unwrap();
        assert_eq!(record.ranks.get(Rank::Order), Some("Carnivora"));
        assert_eq!(record.ranks.get(Rank::Species), Some("Vulpes macrotis"));
        assert!(!record.url.unwrap().contains("secret"));
    }

    #[tokio::test]
    async fn test_empty_result_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"name": "kit fox", "result": []})),
            )
            .mount(&server)
            .await;

        let result = adapter(&server).lookup("kit fox", NameKind::Common).await;
        assert_eq!(result, Err(SourceError::NotFound));
    }
}
