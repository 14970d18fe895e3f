//! Encyclopedia of Life adapter
//!
//! Three requests per lookup:
//! 1. `search` → page id of the best-matching result
//! 2. `pages` → identifier of the species-rank taxon concept
//! 3. `hierarchy_entries` → canonical name plus ancestor ranks
//!
//! Requires an API key.

use super::http::{AdapterSettings, HttpSource};
use super::normalize::normalize_ranks;
use super::{PartialRecord, SourceAdapter, SourceError};
use async_trait::async_trait;
use kestrel_common::{NameKind, Rank, Ranks, SourceId};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://eol.org/api";
pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 2;

/// Search, page, then hierarchy entry
const REQUESTS_PER_LOOKUP: u32 = 3;

/// Minimum title similarity for a search hit to be accepted
const MIN_TITLE_SIMILARITY: f64 = 0.6;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    id: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageResponse {
    #[serde(default)]
    taxon_concepts: Vec<TaxonConcept>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaxonConcept {
    identifier: u64,
    #[serde(default)]
    taxon_rank: String,
}

#[derive(Debug, Deserialize)]
struct HierarchyResponse {
    entry: Option<HierarchyEntry>,
    #[serde(default)]
    ancestors: Vec<Ancestor>,
}

#[derive(Debug, Deserialize)]
struct HierarchyEntry {
    canonical_form: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ancestor {
    scientific_name: String,
    #[serde(default)]
    taxon_rank: String,
}

/// Best search hit: the title or one `;`-separated content name must be close
/// to the query
fn best_hit(key: &str, hits: &[SearchHit]) -> Option<u64> {
    let mut best: Option<(f64, u64)> = None;

    for hit in hits {
        let score = std::iter::once(hit.title.as_str())
            .chain(hit.content.split(';'))
            .map(|name| strsim::normalized_levenshtein(key, &name.trim().to_lowercase()))
            .fold(0.0_f64, f64::max);

        if score >= 1.0 {
            return Some(hit.id);
        }
        if score >= MIN_TITLE_SIMILARITY && best.map_or(true, |(s, _)| score > s) {
            best = Some((score, hit.id));
        }
    }

    best.map(|(_, id)| id)
}

pub struct EolAdapter {
    http: HttpSource,
}

impl EolAdapter {
    pub fn new(settings: AdapterSettings) -> Result<Self, SourceError> {
        Ok(Self {
            http: HttpSource::new(SourceId::Eol, settings)?,
        })
    }

    fn key_param(&self) -> Result<&str, SourceError> {
        self.http
            .api_key()
            .ok_or_else(|| SourceError::Unavailable("EOL key not configured".to_string()))
    }

    async fn page_id(&self, key: &str) -> Result<u64, SourceError> {
        let request = self
            .http
            .get(self.http.url("search/1.0.json"))
            .query(&[("q", key), ("key", self.key_param()?)]);
        let response: SearchResponse = self.http.get_json(request).await?;
        best_hit(key, &response.results).ok_or(SourceError::NotFound)
    }

    async fn species_concept(&self, page_id: u64) -> Result<u64, SourceError> {
        let request = self.http.get(self.http.url("pages/1.0.json")).query(&[
            ("id", page_id.to_string().as_str()),
            ("taxonomy", "true"),
            ("key", self.key_param()?),
        ]);
        let response: PageResponse = self.http.get_json(request).await?;
        response
            .taxon_concepts
            .into_iter()
            .find(|c| c.taxon_rank.eq_ignore_ascii_case("species"))
            .map(|c| c.identifier)
            .ok_or(SourceError::NotFound)
    }

    async fn lookup_once(&self, key: &str) -> Result<PartialRecord, SourceError> {
        let page_id = self.page_id(key).await?;
        let concept = self.species_concept(page_id).await?;

        let request = self.http.get(self.http.url("hierarchy_entries/1.0.json")).query(&[
            ("id", concept.to_string().as_str()),
            ("key", self.key_param()?),
        ]);
        let response: HierarchyResponse = self.http.get_json(request).await?;

        let mut raw = Ranks::new();
        for ancestor in response.ancestors {
            if let Some(rank) = Rank::parse(&ancestor.taxon_rank) {
                if !raw.contains(rank) {
                    raw.set(rank, ancestor.scientific_name);
                }
            }
        }
        if let Some(species) = response.entry.and_then(|e| e.canonical_form) {
            raw.set(Rank::Species, species);
        }

        let ranks = normalize_ranks(&raw);
        if ranks.is_empty() {
            return Err(SourceError::NotFound);
        }

        debug!(key, page_id, concept, fields = ranks.len(), "EOL hit");
        Ok(PartialRecord::new(
            ranks,
            format!("https://eol.org/pages/{}", page_id),
        ))
    }
}

#[async_trait]
impl SourceAdapter for EolAdapter {
    fn source(&self) -> SourceId {
        SourceId::Eol
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

    fn hit(id: u64, title: &str, content: &str) -> SearchHit {
        SearchHit {
            id,
            title: title.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_best_hit_prefers_exact_content_name() {
        let hits = vec![
            hit(1, "Vulpes velox", "swift fox; Vulpes velox"),
            hit(2, "Vulpes macrotis", "kit fox; Vulpes macrotis"),
        ];
        assert_eq!(best_hit("kit fox", &hits), Some(2));
    }

    #[test]
    fn test_best_hit_rejects_distant_titles() {
        let hits = vec![hit(1, "Felis catus", "house cat")];
        assert_eq!(best_hit("kit fox", &hits), None);
    }

    #[tokio::test]
    async fn test_three_step_lookup() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search/1.0.json"))
            .and(query_param("q", "kit fox"))
            .and(query_param("key", "eol-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [{"id": 328609, "title": "Vulpes macrotis", "content": "Kit Fox; Vulpes macrotis"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/pages/1.0.json"))
            .and(query_param("id", "328609"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "taxonConcepts": [
                    {"identifier": 111, "taxonRank": "genus"},
                    {"identifier": 52615075, "taxonRank": "Species"}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/hierarchy_entries/1.0.json"))
            .and(query_param("id", "52615075"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "entry": {"canonical_form": "Vulpes macrotis"},
                "ancestors": [
                    {"scientificName": "Animalia", "taxonRank": "kingdom"},
                    {"scientificName": "Chordata", "taxonRank": "phylum"},
                    {"scientificName": "Canidae", "taxonRank": "family"},
                    {"scientificName": "Vulpes", "taxonRank": "genus"}
                ]
            })))
            .mount(&server)
            .await;

        let settings = AdapterSettings::new(server.uri())
            .with_api_key("eol-key")
            .with_retries(0, Duration::from_millis(1));
        let record = EolAdapter::new(settings)
            .unwrap()
            .lookup("kit fox", NameKind::Common)
            .await
            .unwrap();

        assert_eq!(record.ranks.get(Rank::Kingdom), Some("Animalia"));
        assert_eq!(record.ranks.get(Rank::Genus), Some("Vulpes"));
        assert_eq!(record.ranks.get(Rank::Species), Some("Vulpes macrotis"));
        assert!(record.ranks.get(Rank::Class).is_none());
        assert_eq!(record.url.as_deref(), Some("https://eol.org/pages/328609"));
    }
}
