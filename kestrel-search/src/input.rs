//! Input loading
//!
//! Reads the cleaned name list (`Query,SearchTerm[,Type]`, header row
//! required). A single-column file is read as `Query` only. Rows are
//! deduplicated by normalised key with the first row winning; rows with a
//! blank search term become `Rejected`, keyed by their normalised raw text.
//! Queries and rejections share one key space, so a key is either resolved or
//! rejected, never both.

use crate::classifier::NameClassifier;
use kestrel_common::model::normalize_key;
use kestrel_common::{NameKind, Query, ResolutionOutcome, Result};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

/// Reason recorded for input rows with no usable search term
pub const EMPTY_SEARCH_TERM: &str = "empty search term";

/// Deduplicated input, split into resolvable queries and rejections
#[derive(Debug, Default)]
pub struct InputSet {
    pub queries: Vec<Query>,
    pub rejected: Vec<ResolutionOutcome>,
    /// Rows dropped because their key was already seen
    pub duplicates: usize,
}

impl InputSet {
    /// Distinct keys across queries and rejections
    pub fn len(&self) -> usize {
        self.queries.len() + self.rejected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Columns {
    query: usize,
    search_term: Option<usize>,
    kind: Option<usize>,
}

impl Columns {
    fn from_header(header: &csv::StringRecord) -> Self {
        let find = |name: &str| {
            header
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(name))
        };
        Self {
            query: find("Query").unwrap_or(0),
            search_term: find("SearchTerm"),
            kind: find("Type"),
        }
    }
}

/// Load and deduplicate the input file
pub fn load_queries(path: &Path, classifier: &dyn NameClassifier) -> Result<InputSet> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let columns = Columns::from_header(reader.headers()?);

    let mut set = InputSet::default();
    let mut seen: HashSet<String> = HashSet::new();

    for row in reader.records() {
        let row = row?;
        let raw = row.get(columns.query).unwrap_or_default();
        let term = match columns.search_term {
            Some(idx) => row.get(idx).unwrap_or_default(),
            None => raw,
        };

        if raw.is_empty() && term.is_empty() {
            continue;
        }

        if term.trim().is_empty() {
            if seen.insert(normalize_key(raw)) {
                set.rejected.push(ResolutionOutcome::Rejected {
                    query: Query::new(raw),
                    reason: EMPTY_SEARCH_TERM.to_string(),
                });
            } else {
                set.duplicates += 1;
            }
            continue;
        }

        let query = Query::with_search_term(raw, term);
        if !seen.insert(query.normalized_key.clone()) {
            set.duplicates += 1;
            continue;
        }

        let kind = columns
            .kind
            .and_then(|idx| row.get(idx))
            .and_then(|label| match label.parse::<NameKind>() {
                Ok(kind) => Some(kind),
                Err(e) => {
                    warn!(query = %raw, error = %e, "Ignoring unrecognised name type");
                    None
                }
            })
            .filter(|kind| *kind != NameKind::Unknown)
            .unwrap_or_else(|| classifier.classify(term));

        set.queries.push(query.with_kind(kind));
    }

    info!(
        path = %path.display(),
        queries = set.queries.len(),
        rejected = set.rejected.len(),
        duplicates = set.duplicates,
        "Loaded input"
    );
    Ok(set)
}
