//! Wikipedia adapter: scrapes the taxobox of the article named by the term

use super::http::{AdapterSettings, HttpSource};
use super::normalize::normalize_ranks;
use super::taxobox::{parse_page, PageKind};
use super::{PartialRecord, SourceAdapter, SourceError};
use async_trait::async_trait;
use kestrel_common::{NameKind, SourceId};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://en.wikipedia.org";
pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 5;

const REQUESTS_PER_LOOKUP: u32 = 1;

/// Article title for a search term: first letter upper-case, spaces as `_`
pub fn article_title(term: &str) -> String {
    let joined = term.split_whitespace().collect::<Vec<_>>().join("_");
    let mut chars = joined.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub struct WikipediaAdapter {
    http: HttpSource,
}

impl WikipediaAdapter {
    pub fn new(settings: AdapterSettings) -> Result<Self, SourceError> {
        Ok(Self {
            http: HttpSource::new(SourceId::Wikipedia, settings)?,
        })
    }

    async fn lookup_once(&self, key: &str) -> Result<PartialRecord, SourceError> {
        let title = article_title(key);
        if title.is_empty() {
            return Err(SourceError::NotFound);
        }

        let url = self.http.segment_url(&["wiki", title.as_str()])?;
        let html = self.http.get_text(self.http.get(url.clone())).await?;

        let ranks = normalize_ranks(&parse_page(PageKind::Wikipedia, &html));
        if ranks.is_empty() {
            debug!(key, title = %title, "Wikipedia article has no taxobox");
            return Err(SourceError::NotFound);
        }

        Ok(PartialRecord::new(ranks, url))
    }
}

#[async_trait]
impl SourceAdapter for WikipediaAdapter {
    fn source(&self) -> SourceId {
        SourceId::Wikipedia
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
