//! Common/scientific name classification
//!
//! The classifier is a black box to the pipeline: it labels a name and the
//! ITIS adapter picks its search endpoint from the label. The default
//! [`HeuristicClassifier`] looks at the shape of the name only.

use kestrel_common::NameKind;

/// Labels a name as common or scientific
pub trait NameClassifier: Send + Sync {
    fn classify(&self, name: &str) -> NameKind;
}

/// Latin endings typical of genus names and specific epithets
const LATIN_SUFFIXES: &[&str] = &[
    "us", "um", "a", "ae", "i", "is", "es", "ensis", "oides", "ii", "orum", "arum", "ata", "ica",
    "ina", "ella", "ops", "yx", "ix", "ax",
];

/// Endings of family and higher rank names
const RANK_SUFFIXES: &[&str] = &["idae", "inae", "aceae", "ales", "formes", "ini", "oidea"];

/// Words that only appear in vernacular names
const COMMON_WORDS: &[&str] = &[
    "common", "great", "lesser", "red", "black", "white", "gray", "grey", "brown", "golden",
    "spotted", "striped", "wild", "domestic", "american", "african", "european", "asian",
    "northern", "southern", "eastern", "western", "giant", "pygmy", "dwarf", "fox", "cat", "dog",
    "bird", "fish", "snake", "frog", "monkey", "bear", "rat", "mouse", "bat", "owl", "hawk",
];

/// Shape-based classifier
///
/// A name is scientific when it has one to three purely alphabetic words, none
/// of them a vernacular marker, and every word after the first carries a Latin
/// ending. Single words count as scientific only with a rank suffix
/// (`Canidae`) or a Latin ending.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicClassifier;

impl HeuristicClassifier {
    fn latin_word(word: &str) -> bool {
        LATIN_SUFFIXES.iter().any(|s| word.ends_with(s))
    }
}

impl NameClassifier for HeuristicClassifier {
    fn classify(&self, name: &str) -> NameKind {
        let lower = name.trim().to_lowercase();
        let words: Vec<&str> = lower.split_whitespace().collect();

        if words.is_empty() {
            return NameKind::Unknown;
        }
        if words.len() > 3
            || words
                .iter()
                .any(|w| !w.chars().all(|c| c.is_ascii_alphabetic()) || COMMON_WORDS.contains(w))
        {
            return NameKind::Common;
        }

        match words.as_slice() {
            [single] => {
                if RANK_SUFFIXES.iter().any(|s| single.ends_with(s)) || Self::latin_word(single) {
                    NameKind::Scientific
                } else {
                    NameKind::Common
                }
            }
            [_, rest @ ..] => {
                if rest.iter().all(|w| Self::latin_word(w)) {
                    NameKind::Scientific
                } else {
                    NameKind::Common
                }
            }
            [] => NameKind::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binomials_are_scientific() {
        let classifier = HeuristicClassifier;
        assert_eq!(classifier.classify("Vulpes macrotis"), NameKind::Scientific);
        assert_eq!(classifier.classify("canis lupus familiaris"), NameKind::Scientific);
        assert_eq!(classifier.classify("Canidae"), NameKind::Scientific);
    }

    #[test]
    fn test_vernacular_names_are_common() {
        let classifier = HeuristicClassifier;
        assert_eq!(classifier.classify("Kit Fox"), NameKind::Common);
        assert_eq!(classifier.classify("gila monster"), NameKind::Common);
        assert_eq!(classifier.classify("red-tailed hawk"), NameKind::Common);
        assert_eq!(classifier.classify("three toed box turtle"), NameKind::Common);
    }

    #[test]
    fn test_blank_is_unknown() {
        assert_eq!(HeuristicClassifier.classify("   "), NameKind::Unknown);
    }
}
