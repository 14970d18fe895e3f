//! GBIF backbone adapter (`species/match`)
//!
//! GBIF always answers 200; a failed match is signalled by
//! `matchType: "NONE"`, which maps to [`SourceError::NotFound`].

use super::http::{AdapterSettings, HttpSource};
use super::normalize::normalize_ranks;
use super::{PartialRecord, SourceAdapter, SourceError};
use async_trait::async_trait;
use kestrel_common::{NameKind, Rank, Ranks, SourceId};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.gbif.org/v1";
pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 10;

const REQUESTS_PER_LOOKUP: u32 = 1;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MatchResponse {
    match_type: Option<String>,
    usage_key: Option<u64>,
    confidence: Option<u32>,
    kingdom: Option<String>,
    phylum: Option<String>,
    class: Option<String>,
    order: Option<String>,
    family: Option<String>,
    genus: Option<String>,
    species: Option<String>,
}

impl MatchResponse {
    fn is_match(&self) -> bool {
        !matches!(self.match_type.as_deref(), None | Some("NONE"))
    }

    fn ranks(self) -> Ranks {
        [
            (Rank::Kingdom, self.kingdom),
            (Rank::Phylum, self.phylum),
            (Rank::Class, self.class),
            (Rank::Order, self.order),
            (Rank::Family, self.family),
            (Rank::Genus, self.genus),
            (Rank::Species, self.species),
        ]
        .into_iter()
        .filter_map(|(rank, value)| value.map(|v| (rank, v)))
        .collect()
    }
}

pub struct GbifAdapter {
    http: HttpSource,
}

impl GbifAdapter {
    pub fn new(settings: AdapterSettings) -> Result<Self, SourceError> {
        Ok(Self {
            http: HttpSource::new(SourceId::Gbif, settings)?,
        })
    }

    async fn lookup_once(&self, key: &str) -> Result<PartialRecord, SourceError> {
        let url = self.http.url("species/match");
        let request = self.http.get(&url).query(&[("name", key), ("verbose", "false")]);

        let response: MatchResponse = self.http.get_json(request).await?;
        if !response.is_match() {
            debug!(key, "GBIF match type NONE");
            return Err(SourceError::NotFound);
        }

        let usage_key = response.usage_key;
        debug!(
            key,
            usage_key,
            match_type = response.match_type.as_deref().unwrap_or_default(),
            confidence = response.confidence,
            "GBIF hit"
        );

        let ranks = normalize_ranks(&response.ranks());
        if ranks.is_empty() {
            return Err(SourceError::NotFound);
        }

        let audit = match usage_key {
            Some(id) => format!("https://www.gbif.org/species/{}", id),
            None => url,
        };
        Ok(PartialRecord::new(ranks, audit))
    }
}

#[async_trait]
impl SourceAdapter for GbifAdapter {
    fn source(&self) -> SourceId {
        SourceId::Gbif
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

    fn adapter(server: &MockServer, retries: u32) -> GbifAdapter {
        let settings = AdapterSettings::new(server.uri()).with_retries(retries, Duration::from_millis(1));
        GbifAdapter::new(settings).unwrap()
    }

    #[tokio::test]
    async fn test_exact_match() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/species/match"))
            .and(query_param("name", "vulpes macrotis"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "usageKey": 5219255,
                "scientificName": "Vulpes macrotis Merriam, 1888",
                "rank": "SPECIES",
                "matchType": "EXACT",
                "confidence": 99,
                "kingdom": "Animalia",
                "phylum": "Chordata",
                "class": "Mammalia",
                "order": "Carnivora",
                "family": "Canidae",
                "genus": "Vulpes",
                "species": "Vulpes macrotis"
            })))
            .mount(&server)
            .await;

        let record = adapter(&server, 0)
            .lookup("vulpes macrotis", NameKind::Scientific)
            .await
            .unwrap();
        assert_eq!(record.ranks.len(), 7);
        assert_eq!(record.ranks.get(Rank::Species), Some("Vulpes macrotis"));
        assert_eq!(record.url.as_deref(), Some("https://www.gbif.org/species/5219255"));
    }

    #[tokio::test]
    async fn test_match_type_none_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "confidence": 100,
                "matchType": "NONE",
                "synonym": false
            })))
            .mount(&server)
            .await;

        let result = adapter(&server, 0).lookup("jackalope", NameKind::Common).await;
        assert_eq!(result, Err(SourceError::NotFound));
    }

    #[tokio::test]
    async fn test_server_error_retried_then_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let result = adapter(&server, 2).lookup("vulpes", NameKind::Scientific).await;
        assert!(matches!(result, Err(SourceError::Unavailable(_))));
    }
}
