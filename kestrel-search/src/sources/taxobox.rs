//! Taxobox scraping for HTML sources
//!
//! Wikipedia and ITIS lay ranks out as two-cell table rows (`Kingdom:` |
//! `Animalia`); Wikispecies prints `Regnum: Animalia` lines inside a
//! paragraph. The first occurrence of each rank wins. Values come back raw and
//! still need [`super::normalize::normalize_ranks`].

use kestrel_common::{Rank, Ranks};
use once_cell::sync::Lazy;
use regex::Regex;

static ROW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<tr[^>]*>(.*?)</tr>").expect("row pattern is valid"));
static CELL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<t[dh][^>]*>(.*?)</t[dh]>").expect("cell pattern is valid"));
static ITALIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<i[^>]*>(.*?)</i>").expect("italic pattern is valid"));
static BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<br\s*/?>|</p>|</li>").expect("break pattern is valid"));
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("tag pattern is valid"));

/// Page layouts the scraper understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Wikipedia,
    Wikispecies,
    Itis,
}

impl PageKind {
    pub fn label(self) -> &'static str {
        match self {
            PageKind::Wikipedia => "wikipedia",
            PageKind::Wikispecies => "wikispecies",
            PageKind::Itis => "itis",
        }
    }
}

/// Scrape raw rank values from a page of the given layout
pub fn parse_page(kind: PageKind, html: &str) -> Ranks {
    match kind {
        PageKind::Wikipedia | PageKind::Itis => parse_rank_table(html),
        PageKind::Wikispecies => parse_rank_lines(html),
    }
}

/// Two-cell table rows whose first cell is a rank label
pub fn parse_rank_table(html: &str) -> Ranks {
    let mut ranks = Ranks::new();

    for row in ROW.captures_iter(html) {
        let mut cells = CELL.captures_iter(&row[1]);
        let (Some(label), Some(value)) = (cells.next(), cells.next()) else {
            continue;
        };
        let Some(rank) = Rank::parse(&text_of(&label[1])) else {
            continue;
        };
        if ranks.contains(rank) {
            continue;
        }

        // Italic text carries the name; the rest is authority and links
        let value = match ITALIC.captures(&value[1]) {
            Some(italic) => text_of(&italic[1]),
            None => text_of(&value[1]),
        };
        if !value.is_empty() {
            ranks.set(rank, value);
        }
    }

    ranks
}

/// `Label: value` lines, as Wikispecies prints its classification
pub fn parse_rank_lines(html: &str) -> Ranks {
    let mut ranks = Ranks::new();
    let text = decode_entities(&TAG.replace_all(&BREAK.replace_all(html, "\n"), ""));

    for line in text.lines() {
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let Some(rank) = Rank::parse(label) else {
            continue;
        };
        let value = value.trim();
        if !ranks.contains(rank) && !value.is_empty() {
            ranks.set(rank, value);
        }
    }

    ranks
}

fn text_of(fragment: &str) -> String {
    let stripped = TAG.replace_all(fragment, "");
    decode_entities(&stripped)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&#160;", " ")
        .replace("&#xa0;", " ")
        .replace('\u{a0}', " ")
        .replace("&amp;", "&")
        .replace("&#39;", "'")
        .replace("&quot;", "\"")
}
