//! Candidate page extraction from a search results page

use crate::sources::taxobox::PageKind;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;

static HREF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)href\s*=\s*["']([^"']+)["']"#).expect("href pattern is valid")
});

/// Hosts whose pages carry a scrapeable taxobox, checked in this order
const MARKERS: [(&str, PageKind); 3] = [
    ("species.wikimedia.org/wiki/", PageKind::Wikispecies),
    ("wikipedia.org/wiki/", PageKind::Wikipedia),
    ("itis.gov", PageKind::Itis),
];

/// Redirect parameters search engines wrap result links in
const REDIRECT_PARAMS: [&str; 3] = ["uddg", "q", "url"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub kind: PageKind,
    pub url: String,
}

/// First link of each page kind, in result order
///
/// Relative links are resolved against `base`. Search-engine redirect links are
/// unwrapped; cache links, namespaced pages (`Special:`, `File:`) and
/// disambiguation titles are skipped.
pub fn extract_candidates(html: &str, base: &Url) -> Vec<Candidate> {
    let mut found: Vec<Candidate> = Vec::new();

    for cap in HREF.captures_iter(html) {
        let href = cap[1].replace("&amp;", "&");
        let Some(target) = resolve_link(&href, base) else {
            continue;
        };
        if target.matches(':').count() > 1 || target.contains('(') || target.contains("webcache")
        {
            continue;
        }
        let Some(kind) = MARKERS
            .iter()
            .find(|(marker, _)| target.contains(marker))
            .map(|(_, kind)| *kind)
        else {
            continue;
        };
        if found.iter().any(|c| c.kind == kind) {
            continue;
        }
        found.push(Candidate { kind, url: target });
        if found.len() == MARKERS.len() {
            break;
        }
    }
    found
}

fn resolve_link(href: &str, base: &Url) -> Option<String> {
    let mut url = base.join(href).ok()?;

    let redirected = url.query_pairs().find_map(|(name, value)| {
        (REDIRECT_PARAMS.contains(&name.as_ref()) && value.starts_with("http"))
            .then(|| value.into_owned())
    });
    if let Some(inner) = redirected {
        url = Url::parse(&inner).ok()?;
    }

    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    Some(url.to_string())
}
