//! Resume Filter
//!
//! [`ProgressState`] is a read-only snapshot of every key already present in
//! the output stores when the run starts. It is built once and handed to the
//! [`ResumeFilter`]; outcomes written during the run are never merged back.

use super::{read_keys, OutputPaths};
use kestrel_common::model::normalize_key;
use kestrel_common::{Query, ResolutionOutcome, Result};
use std::collections::HashSet;
use tracing::info;

/// Keys already persisted, per outcome kind
#[derive(Debug, Clone, Default)]
pub struct ProgressState {
    pub matched: HashSet<String>,
    /// Intermediate missed store plus the final no-match store
    pub missed: HashSet<String>,
    pub rejected: HashSet<String>,
}

impl ProgressState {
    /// Read the stores; a missing store counts as empty
    pub fn load(paths: &OutputPaths) -> Result<Self> {
        let mut missed: HashSet<String> = read_keys(&paths.missed)?.into_iter().collect();
        missed.extend(read_keys(&paths.no_match)?);

        let state = Self {
            matched: read_keys(&paths.matched)?.into_iter().collect(),
            missed,
            rejected: read_keys(&paths.rejected)?.into_iter().collect(),
        };
        info!(
            matched = state.matched.len(),
            missed = state.missed.len(),
            rejected = state.rejected.len(),
            "Loaded progress snapshot"
        );
        Ok(state)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.matched.contains(key) || self.missed.contains(key) || self.rejected.contains(key)
    }

    pub fn is_empty(&self) -> bool {
        self.matched.is_empty() && self.missed.is_empty() && self.rejected.is_empty()
    }
}

/// Splits incoming work into already-done and still-to-do
pub struct ResumeFilter {
    state: ProgressState,
}

impl ResumeFilter {
    pub fn new(state: ProgressState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    /// Queries whose key is in none of the three stores
    pub fn filter(&self, queries: Vec<Query>) -> Vec<Query> {
        queries
            .into_iter()
            .filter(|q| !self.state.contains(&q.normalized_key))
            .collect()
    }

    /// Rejections not yet recorded; their key is the normalised raw text
    pub fn filter_rejections(&self, rejected: Vec<ResolutionOutcome>) -> Vec<ResolutionOutcome> {
        rejected
            .into_iter()
            .filter(|outcome| !self.state.contains(&normalize_key(&outcome.query().raw_text)))
            .collect()
    }

    /// Number of `keys` the snapshot already accounts for
    pub fn already_done<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> usize {
        keys.into_iter().filter(|k| self.state.contains(k)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &std::path::Path, content: &str) {
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_first_run_snapshot_is_empty() {
        let dir = TempDir::new().unwrap();
        let state = ProgressState::load(&OutputPaths::in_dir(dir.path())).unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn test_filter_excludes_every_store() {
        let dir = TempDir::new().unwrap();
        let paths = OutputPaths::in_dir(dir.path());
        write(
            &paths.matched,
            "Query,SearchTerm,Kingdom,Phylum,Class,Order,Family,Genus,Species,NCBI,GBIF,ITIS,IUCN,EOL,Wikipedia,WebSearch\n\
             Kit Fox,kit fox,Animalia,Chordata,Mammalia,Carnivora,Canidae,Vulpes,Vulpes macrotis,0,1,0,0,0,0,0\n",
        );
        write(&paths.missed, "Query,SearchTerm,Reason\nJackalope,jackalope,no source match\n");
        write(&paths.no_match, "Query,SearchTerm,Reason\nDropbear,dropbear,no search match\n");
        write(&paths.rejected, "Query,Reason\n(Unknown),empty search term\n");

        let filter = ResumeFilter::new(ProgressState::load(&paths).unwrap());
        let queries = ["KIT FOX", "jackalope", "Dropbear", "ocelot"]
            .into_iter()
            .map(Query::new)
            .collect();

        let todo = filter.filter(queries);
        assert_eq!(todo.len(), 1);
        assert_eq!(todo[0].normalized_key, "ocelot");

        let rejections = vec![
            ResolutionOutcome::Rejected {
                query: Query::new("(unknown)"),
                reason: "empty search term".into(),
            },
            ResolutionOutcome::Rejected {
                query: Query::new("???"),
                reason: "empty search term".into(),
            },
        ];
        let fresh = filter.filter_rejections(rejections);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].query().raw_text, "???");

        assert_eq!(filter.already_done(["kit fox", "ocelot", "dropbear"]), 2);
    }

    #[test]
    fn test_short_rows_are_skipped() {
        let dir = TempDir::new().unwrap();
        let paths = OutputPaths::in_dir(dir.path());
        write(&paths.missed, "Query,SearchTerm,Reason\nJackalope\nOcelot,ocelot,no source match\n");

        let state = ProgressState::load(&paths).unwrap();
        assert!(state.missed.contains("ocelot"));
        assert!(!state.missed.contains("jackalope"));
    }
}
