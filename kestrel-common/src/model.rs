//! Record and state model shared by the search pipeline
//!
//! - [`Query`]: a search term with its normalized join key
//! - [`TaxonomyRecord`]: the seven ordered rank fields plus source provenance
//! - [`ResolutionOutcome`]: the single result produced for every query
//!
//! A query's `normalized_key` is the only identity that matters across the
//! matched, missed and rejected stores; two queries that differ only in case or
//! surrounding whitespace are the same query.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Reason recorded for queries that no structured source could resolve
pub const NO_SOURCE_MATCH: &str = "no source match";

/// Reason recorded for queries the escalation stage could not resolve either
pub const NO_SEARCH_MATCH: &str = "no search match";

/// Lower-case, trimmed form of a search term
pub fn normalize_key(term: &str) -> String {
    term.trim().to_lowercase()
}

// ============================================================================
// Query
// ============================================================================

/// Label assigned to a name by the name classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NameKind {
    Common,
    Scientific,
    #[default]
    Unknown,
}

impl FromStr for NameKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "common" => Ok(NameKind::Common),
            "scientific" => Ok(NameKind::Scientific),
            "" | "unknown" | "na" => Ok(NameKind::Unknown),
            other => Err(format!("unknown name type: {}", other)),
        }
    }
}

/// A single search query
///
/// Equality and hashing use `normalized_key` only, so a `HashSet<Query>`
/// performs duplicate suppression by key.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Query text exactly as it appeared in the input
    pub raw_text: String,
    /// Trimmed, lower-cased search term (join key)
    pub normalized_key: String,
    /// Common/scientific label, when known
    #[serde(default)]
    pub kind: NameKind,
}

impl Query {
    /// Query whose search term is its own raw text
    pub fn new(raw_text: impl Into<String>) -> Self {
        let raw_text = raw_text.into();
        let normalized_key = normalize_key(&raw_text);
        Self {
            raw_text,
            normalized_key,
            kind: NameKind::Unknown,
        }
    }

    /// Query whose search term was cleaned separately from the raw text
    pub fn with_search_term(raw_text: impl Into<String>, search_term: &str) -> Self {
        Self {
            raw_text: raw_text.into(),
            normalized_key: normalize_key(search_term),
            kind: NameKind::Unknown,
        }
    }

    pub fn with_kind(mut self, kind: NameKind) -> Self {
        self.kind = kind;
        self
    }

    /// Number of whitespace-separated words in the search term
    pub fn word_count(&self) -> usize {
        self.normalized_key.split_whitespace().count()
    }
}

impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        self.normalized_key == other.normalized_key
    }
}

impl Hash for Query {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized_key.hash(state);
    }
}

// ============================================================================
// Ranks
// ============================================================================

/// Taxonomic rank, in hierarchy order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Rank {
    Kingdom,
    Phylum,
    Class,
    Order,
    Family,
    Genus,
    Species,
}

impl Rank {
    pub const ALL: [Rank; 7] = [
        Rank::Kingdom,
        Rank::Phylum,
        Rank::Class,
        Rank::Order,
        Rank::Family,
        Rank::Genus,
        Rank::Species,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Column header used in the output stores
    pub fn header(self) -> &'static str {
        match self {
            Rank::Kingdom => "Kingdom",
            Rank::Phylum => "Phylum",
            Rank::Class => "Class",
            Rank::Order => "Order",
            Rank::Family => "Family",
            Rank::Genus => "Genus",
            Rank::Species => "Species",
        }
    }

    /// Parse a rank label as sources print it ("Kingdom:", "genus", "Familia")
    ///
    /// Latin labels used by Wikispecies are accepted alongside English ones.
    pub fn parse(label: &str) -> Option<Rank> {
        let label = label.trim().trim_end_matches(':').trim().to_lowercase();
        match label.as_str() {
            "kingdom" | "regnum" => Some(Rank::Kingdom),
            "phylum" | "division" => Some(Rank::Phylum),
            "class" | "classis" => Some(Rank::Class),
            "order" | "ordo" => Some(Rank::Order),
            "family" | "familia" => Some(Rank::Family),
            "genus" => Some(Rank::Genus),
            "species" => Some(Rank::Species),
            _ => None,
        }
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.header())
    }
}

/// The seven rank fields, each absent until filled
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ranks([Option<String>; 7]);

impl Ranks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, rank: Rank) -> Option<&str> {
        self.0[rank.index()].as_deref()
    }

    pub fn set(&mut self, rank: Rank, value: impl Into<String>) {
        self.0[rank.index()] = Some(value.into());
    }

    pub fn clear(&mut self, rank: Rank) {
        self.0[rank.index()] = None;
    }

    pub fn contains(&self, rank: Rank) -> bool {
        self.0[rank.index()].is_some()
    }

    /// Number of filled fields
    pub fn len(&self) -> usize {
        self.0.iter().filter(|v| v.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Filled fields in rank order
    pub fn iter(&self) -> impl Iterator<Item = (Rank, &str)> {
        Rank::ALL
            .into_iter()
            .filter_map(move |rank| self.get(rank).map(|v| (rank, v)))
    }

    pub fn has_genus_and_species(&self) -> bool {
        self.contains(Rank::Genus) && self.contains(Rank::Species)
    }
}

impl<S: Into<String>> FromIterator<(Rank, S)> for Ranks {
    fn from_iter<I: IntoIterator<Item = (Rank, S)>>(iter: I) -> Self {
        let mut ranks = Ranks::new();
        for (rank, value) in iter {
            ranks.set(rank, value);
        }
        ranks
    }
}

// ============================================================================
// Sources and records
// ============================================================================

/// Every source that can contribute to a record, in provenance column order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    Ncbi,
    Gbif,
    Itis,
    Iucn,
    Eol,
    Wikipedia,
    #[serde(alias = "web_search")]
    WebSearch,
}

impl SourceId {
    pub const ALL: [SourceId; 7] = [
        SourceId::Ncbi,
        SourceId::Gbif,
        SourceId::Itis,
        SourceId::Iucn,
        SourceId::Eol,
        SourceId::Wikipedia,
        SourceId::WebSearch,
    ];

    /// Structured sources, in default priority order
    pub const STRUCTURED: [SourceId; 6] = [
        SourceId::Ncbi,
        SourceId::Gbif,
        SourceId::Itis,
        SourceId::Iucn,
        SourceId::Eol,
        SourceId::Wikipedia,
    ];

    /// Provenance column header
    pub fn column(self) -> &'static str {
        match self {
            SourceId::Ncbi => "NCBI",
            SourceId::Gbif => "GBIF",
            SourceId::Itis => "ITIS",
            SourceId::Iucn => "IUCN",
            SourceId::Eol => "EOL",
            SourceId::Wikipedia => "Wikipedia",
            SourceId::WebSearch => "WebSearch",
        }
    }

    /// Environment variable holding this source's API key
    pub fn api_key_env(self) -> String {
        format!("KESTREL_{}_API_KEY", self.column().to_uppercase())
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl FromStr for SourceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace(['_', '-'], "");
        SourceId::ALL
            .into_iter()
            .find(|id| id.column().to_lowercase() == wanted)
            .ok_or_else(|| format!("unknown source: {}", s))
    }
}

/// Merged taxonomy with the set of sources that contributed to it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaxonomyRecord {
    ranks: Ranks,
    provenance: BTreeSet<SourceId>,
}

impl TaxonomyRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a record read back from a store
    pub fn from_parts(ranks: Ranks, provenance: impl IntoIterator<Item = SourceId>) -> Self {
        Self {
            ranks,
            provenance: provenance.into_iter().collect(),
        }
    }

    pub fn ranks(&self) -> &Ranks {
        &self.ranks
    }

    pub fn get(&self, rank: Rank) -> Option<&str> {
        self.ranks.get(rank)
    }

    pub fn provenance(&self) -> &BTreeSet<SourceId> {
        &self.provenance
    }

    /// Fill every empty field from `partial`; populated fields are never
    /// overwritten. `source` joins the provenance only when it filled at least
    /// one field. Returns the number of fields filled.
    pub fn fill_from(&mut self, source: SourceId, partial: &Ranks) -> usize {
        let mut filled = 0;
        for (rank, value) in partial.iter() {
            if !self.ranks.contains(rank) {
                self.ranks.set(rank, value);
                filled += 1;
            }
        }
        if filled > 0 {
            self.provenance.insert(source);
        }
        filled
    }

    /// Genus and Species are both present
    pub fn is_complete_enough(&self) -> bool {
        self.ranks.has_genus_and_species()
    }

    /// A record with no provenance is not a match
    pub fn is_match(&self) -> bool {
        !self.provenance.is_empty()
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Result of resolving one query; exactly one is persisted per query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    Matched { query: Query, record: TaxonomyRecord },
    /// No source produced a record; eligible for escalation
    Missed { query: Query, reason: String },
    /// Structurally invalid input; never resolved
    Rejected { query: Query, reason: String },
}

impl ResolutionOutcome {
    pub fn missed(query: Query) -> Self {
        ResolutionOutcome::Missed {
            query,
            reason: NO_SOURCE_MATCH.to_string(),
        }
    }

    pub fn query(&self) -> &Query {
        match self {
            ResolutionOutcome::Matched { query, .. }
            | ResolutionOutcome::Missed { query, .. }
            | ResolutionOutcome::Rejected { query, .. } => query,
        }
    }

    pub fn is_matched(&self) -> bool {
        matches!(self, ResolutionOutcome::Matched { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            ResolutionOutcome::Matched { .. } => "matched",
            ResolutionOutcome::Missed { .. } => "missed",
            ResolutionOutcome::Rejected { .. } => "rejected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_query_identity_is_normalized_key() {
        let a = Query::new("  Kit Fox ");
        let b = Query::new("kit fox");
        assert_eq!(a.normalized_key, "kit fox");
        assert_eq!(a, b);

        let set: HashSet<Query> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_query_with_search_term() {
        let q = Query::with_search_term("Gila monster (juvenile)", " Gila Monster");
        assert_eq!(q.raw_text, "Gila monster (juvenile)");
        assert_eq!(q.normalized_key, "gila monster");
        assert_eq!(q.word_count(), 2);
    }

    #[test]
    fn test_rank_parse_accepts_labels_and_latin() {
        assert_eq!(Rank::parse("Kingdom:"), Some(Rank::Kingdom));
        assert_eq!(Rank::parse(" familia "), Some(Rank::Family));
        assert_eq!(Rank::parse("Ordo:"), Some(Rank::Order));
        assert_eq!(Rank::parse("subfamily"), None);
    }

    #[test]
    fn test_fill_from_never_overwrites() {
        let mut record = TaxonomyRecord::new();
        let a: Ranks = [(Rank::Genus, "Canis")].into_iter().collect();
        let b: Ranks = [(Rank::Genus, "Vulpes"), (Rank::Species, "Vulpes vulpes")]
            .into_iter()
            .collect();

        assert_eq!(record.fill_from(SourceId::Ncbi, &a), 1);
        assert_eq!(record.fill_from(SourceId::Gbif, &b), 1);

        assert_eq!(record.get(Rank::Genus), Some("Canis"));
        assert_eq!(record.get(Rank::Species), Some("Vulpes vulpes"));
        assert!(record.is_complete_enough());
        assert_eq!(
            record.provenance().iter().copied().collect::<Vec<_>>(),
            vec![SourceId::Ncbi, SourceId::Gbif]
        );
    }

    #[test]
    fn test_fill_from_without_contribution_adds_no_provenance() {
        let mut record = TaxonomyRecord::new();
        let a: Ranks = [(Rank::Genus, "Canis")].into_iter().collect();
        record.fill_from(SourceId::Ncbi, &a);
        record.fill_from(SourceId::Eol, &a);

        assert!(record.is_match());
        assert!(!record.provenance().contains(&SourceId::Eol));
        assert!(!TaxonomyRecord::new().is_match());
    }

    #[test]
    fn test_source_id_parse_and_columns() {
        assert_eq!("ncbi".parse::<SourceId>(), Ok(SourceId::Ncbi));
        assert_eq!("Web_Search".parse::<SourceId>(), Ok(SourceId::WebSearch));
        assert!("bold".parse::<SourceId>().is_err());
        assert_eq!(SourceId::Iucn.api_key_env(), "KESTREL_IUCN_API_KEY");
    }

    #[test]
    fn test_name_kind_parse() {
        assert_eq!("Scientific".parse::<NameKind>(), Ok(NameKind::Scientific));
        assert_eq!("".parse::<NameKind>(), Ok(NameKind::Unknown));
        assert!("vernacular".parse::<NameKind>().is_err());
    }
}
