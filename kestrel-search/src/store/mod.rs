//! Output State Manager
//!
//! Append-only CSV stores, one per outcome kind:
//!
//! | store | file | columns |
//! |---|---|---|
//! | matched | `--output` (default `KestrelTaxonomies.csv`) | `Query,SearchTerm,<7 ranks>,<7 provenance flags>` |
//! | missed (intermediate) | `KestrelMissed.csv` | `Query,SearchTerm,Reason` |
//! | no-match (final) | `KestrelNoMatch.csv` | `Query,SearchTerm,Reason` |
//! | rejected | `KestrelRejected.csv` | `Query,Reason` |
//!
//! # Durability
//! Each row is flushed and `sync_data`'d before `append` returns, so a crash
//! after N appends leaves exactly N complete rows. A torn trailing line left
//! by a crash mid-write is cut off when the store is next opened.

use kestrel_common::{Rank, ResolutionOutcome, Result, SourceId, TaxonomyRecord};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub mod resume;

pub use resume::{ProgressState, ResumeFilter};

pub const DEFAULT_MATCHED_FILE: &str = "KestrelTaxonomies.csv";
pub const MISSED_FILE: &str = "KestrelMissed.csv";
pub const NO_MATCH_FILE: &str = "KestrelNoMatch.csv";
pub const REJECTED_FILE: &str = "KestrelRejected.csv";

/// Placeholder written for absent rank fields
pub const EMPTY_FIELD: &str = "NA";

/// Locations of the four stores
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub matched: PathBuf,
    pub missed: PathBuf,
    pub no_match: PathBuf,
    pub rejected: PathBuf,
}

impl OutputPaths {
    /// Stores in `dir`, with the default matched-store name
    pub fn in_dir(dir: &Path) -> Self {
        Self::for_matched(dir.join(DEFAULT_MATCHED_FILE))
    }

    /// Sibling stores next to an explicit matched-store path
    pub fn for_matched(matched: PathBuf) -> Self {
        let dir = matched
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            missed: dir.join(MISSED_FILE),
            no_match: dir.join(NO_MATCH_FILE),
            rejected: dir.join(REJECTED_FILE),
            matched,
        }
    }
}

// ============================================================================
// Row shapes
// ============================================================================

pub fn matched_header() -> Vec<&'static str> {
    let mut header = vec!["Query", "SearchTerm"];
    header.extend(Rank::ALL.iter().map(|r| r.header()));
    header.extend(SourceId::ALL.iter().map(|s| s.column()));
    header
}

pub const MISSED_HEADER: [&str; 3] = ["Query", "SearchTerm", "Reason"];
pub const REJECTED_HEADER: [&str; 2] = ["Query", "Reason"];

pub fn matched_row(raw_text: &str, key: &str, record: &TaxonomyRecord) -> Vec<String> {
    let mut row = vec![raw_text.to_string(), key.to_string()];
    row.extend(
        Rank::ALL
            .iter()
            .map(|r| record.get(*r).unwrap_or(EMPTY_FIELD).to_string()),
    );
    row.extend(SourceId::ALL.iter().map(|s| {
        if record.provenance().contains(s) { "1" } else { "0" }.to_string()
    }));
    row
}

// ============================================================================
// Store writer
// ============================================================================

/// One append-only CSV file
pub struct StoreWriter {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows: usize,
}

impl StoreWriter {
    /// Open for append, creating the file with `header` if absent or empty
    pub fn open(path: &Path, header: &[&str]) -> Result<Self> {
        let fresh = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        if !fresh {
            repair_torn_tail(path)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        let mut store = Self {
            path: path.to_path_buf(),
            writer,
            rows: 0,
        };
        if fresh {
            store.write_durable(header)?;
            debug!(path = %path.display(), "Created store");
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows appended through this writer
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Append one row and make it durable
    pub fn append<I, T>(&mut self, row: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        self.write_durable(row)?;
        self.rows += 1;
        Ok(())
    }

    fn write_durable<I, T>(&mut self, row: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        self.writer.write_record(row)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

/// Cut a trailing partial line (no final newline) left by an interrupted write
fn repair_torn_tail(path: &Path) -> Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(());
    }

    let mut content = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut content)?;
    let keep = content
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|i| i as u64 + 1)
        .unwrap_or(0);

    warn!(
        path = %path.display(),
        dropped_bytes = len - keep,
        "Store ends with a partial row, truncating it"
    );
    file.set_len(keep)?;
    file.sync_data()?;
    Ok(())
}

// ============================================================================
// Output State Manager
// ============================================================================

/// Running counts of persisted outcomes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub matched: usize,
    pub missed: usize,
    pub rejected: usize,
}

impl Tally {
    pub fn total(&self) -> usize {
        self.matched + self.missed + self.rejected
    }
}

/// Single writer for the matched, missed and rejected stores
///
/// All three stores are opened once, up front, so an unwritable output
/// directory fails the run before any lookup is made.
pub struct OutputStateManager {
    matched: StoreWriter,
    missed: StoreWriter,
    rejected: StoreWriter,
    tally: Tally,
}

impl OutputStateManager {
    pub fn open(paths: &OutputPaths) -> Result<Self> {
        if let Some(dir) = paths.matched.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let manager = Self {
            matched: StoreWriter::open(&paths.matched, &matched_header())?,
            missed: StoreWriter::open(&paths.missed, &MISSED_HEADER)?,
            rejected: StoreWriter::open(&paths.rejected, &REJECTED_HEADER)?,
            tally: Tally::default(),
        };
        info!(matched = %paths.matched.display(), "Output stores open");
        Ok(manager)
    }

    /// Persist one outcome to its store
    pub fn append(&mut self, outcome: &ResolutionOutcome) -> Result<()> {
        match outcome {
            ResolutionOutcome::Matched { query, record } => {
                self.matched
                    .append(matched_row(&query.raw_text, &query.normalized_key, record))?;
                self.tally.matched += 1;
            }
            ResolutionOutcome::Missed { query, reason } => {
                self.missed
                    .append([query.raw_text.as_str(), query.normalized_key.as_str(), reason.as_str()])?;
                self.tally.missed += 1;
            }
            ResolutionOutcome::Rejected { query, reason } => {
                self.rejected.append([query.raw_text.as_str(), reason.as_str()])?;
                self.tally.rejected += 1;
            }
        }
        Ok(())
    }

    pub fn tally(&self) -> Tally {
        self.tally
    }
}

// ============================================================================
// Reading stores back
// ============================================================================

/// One row of a missed or no-match store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissedRow {
    pub raw_text: String,
    pub key: String,
    pub reason: String,
}

fn open_reader(path: &Path) -> Result<Option<csv::Reader<File>>> {
    if !path.exists() {
        return Ok(None);
    }
    let reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)?;
    Ok(Some(reader))
}

fn column(headers: &csv::StringRecord, name: &str, fallback: usize) -> usize {
    headers
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case(name))
        .unwrap_or(fallback)
}

/// Keys of a store: `SearchTerm` when the store has one, otherwise the
/// normalised `Query`
pub fn read_keys(path: &Path) -> Result<Vec<String>> {
    let Some(mut reader) = open_reader(path)? else {
        return Ok(Vec::new());
    };
    let headers = reader.headers()?.clone();
    let key_col = headers
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case("SearchTerm"));
    let query_col = column(&headers, "Query", 0);

    let mut keys = Vec::new();
    for row in reader.records() {
        let row = row?;
        let key = match key_col {
            Some(idx) => row.get(idx).map(kestrel_common::model::normalize_key),
            None => row.get(query_col).map(kestrel_common::model::normalize_key),
        };
        if let Some(key) = key.filter(|k| !k.is_empty()) {
            keys.push(key);
        }
    }
    Ok(keys)
}

/// Rows of a missed/no-match store, first occurrence of each key only
pub fn read_missed(path: &Path) -> Result<Vec<MissedRow>> {
    let Some(mut reader) = open_reader(path)? else {
        return Ok(Vec::new());
    };
    let headers = reader.headers()?.clone();
    let query_col = column(&headers, "Query", 0);
    let key_col = column(&headers, "SearchTerm", 1);
    let reason_col = column(&headers, "Reason", 2);

    let mut seen = std::collections::HashSet::new();
    let mut rows = Vec::new();
    for row in reader.records() {
        let row = row?;
        let raw_text = row.get(query_col).unwrap_or_default().to_string();
        let key = kestrel_common::model::normalize_key(row.get(key_col).unwrap_or_default());
        if key.is_empty() || !seen.insert(key.clone()) {
            continue;
        }
        rows.push(MissedRow {
            raw_text,
            key,
            reason: row.get(reason_col).unwrap_or_default().to_string(),
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::{Query, Ranks};
    use tempfile::TempDir;

    fn vulpes() -> TaxonomyRecord {
        let ranks: Ranks = [(Rank::Genus, "Vulpes"), (Rank::Species, "Vulpes macrotis")]
            .into_iter()
            .collect();
        TaxonomyRecord::from_parts(ranks, [SourceId::Gbif])
    }

    #[test]
    fn test_matched_row_shape() {
        let row = matched_row("Kit Fox", "kit fox", &vulpes());
        assert_eq!(row.len(), matched_header().len());
        assert_eq!(row.len(), 16);
        assert_eq!(&row[..2], &["Kit Fox", "kit fox"]);
        assert_eq!(row[2], "NA");
        assert_eq!(row[7], "Vulpes");
        assert_eq!(row[8], "Vulpes macrotis");
        assert_eq!(&row[9..], &["0", "1", "0", "0", "0", "0", "0"]);
    }

    #[test]
    fn test_header_written_once() {
        let dir = TempDir::new().unwrap();
        let paths = OutputPaths::in_dir(dir.path());

        {
            let mut manager = OutputStateManager::open(&paths).unwrap();
            manager
                .append(&ResolutionOutcome::missed(Query::new("kit fox")))
                .unwrap();
        }
        {
            let mut manager = OutputStateManager::open(&paths).unwrap();
            manager
                .append(&ResolutionOutcome::missed(Query::new("gila monster")))
                .unwrap();
        }

        let content = std::fs::read_to_string(&paths.missed).unwrap();
        assert_eq!(
            content,
            "Query,SearchTerm,Reason\nkit fox,kit fox,no source match\ngila monster,gila monster,no source match\n"
        );
    }

    #[test]
    fn test_outcomes_routed_to_stores() {
        let dir = TempDir::new().unwrap();
        let paths = OutputPaths::in_dir(dir.path());
        let mut manager = OutputStateManager::open(&paths).unwrap();

        manager
            .append(&ResolutionOutcome::Matched {
                query: Query::new("Kit Fox"),
                record: vulpes(),
            })
            .unwrap();
        manager
            .append(&ResolutionOutcome::Rejected {
                query: Query::new("???"),
                reason: "empty search term".into(),
            })
            .unwrap();

        assert_eq!(
            manager.tally(),
            Tally {
                matched: 1,
                missed: 0,
                rejected: 1
            }
        );
        assert_eq!(read_keys(&paths.matched).unwrap(), vec!["kit fox"]);
        assert_eq!(read_keys(&paths.rejected).unwrap(), vec!["???"]);
        assert!(read_keys(&paths.missed).unwrap().is_empty());
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(MISSED_FILE);
        std::fs::write(&path, "Query,SearchTerm,Reason\nkit fox,kit fox,no source match\ngila mon").unwrap();

        let mut store = StoreWriter::open(&path, &MISSED_HEADER).unwrap();
        store.append(["ocelot", "ocelot", "no source match"]).unwrap();

        let rows = read_missed(&path).unwrap();
        let keys: Vec<&str> = rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["kit fox", "ocelot"]);
    }

    #[test]
    fn test_read_missing_store_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(read_keys(&dir.path().join("absent.csv")).unwrap().is_empty());
        assert!(read_missed(&dir.path().join("absent.csv")).unwrap().is_empty());
    }

    #[test]
    fn test_for_matched_places_siblings() {
        let paths = OutputPaths::for_matched(PathBuf::from("/data/run/taxa.csv"));
        assert_eq!(paths.missed, PathBuf::from("/data/run/KestrelMissed.csv"));
        assert_eq!(paths.rejected, PathBuf::from("/data/run/KestrelRejected.csv"));
    }
}
