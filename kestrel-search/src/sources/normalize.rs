//! Rank value clean-up applied to every partial record
//!
//! Sources disagree on casing, punctuation and species formatting. This
//! module brings them to one shape before merging:
//! - higher ranks: first word only, title case, no punctuation
//! - species: binomial `Genus epithet`, genus abbreviations expanded
//! - `NA`, empty and bracketed (`[...]`) values are dropped

use kestrel_common::{Rank, Ranks};

/// Normalise every field of a partial record
pub fn normalize_ranks(raw: &Ranks) -> Ranks {
    let mut ranks = Ranks::new();

    for (rank, value) in raw.iter() {
        if rank == Rank::Species {
            continue;
        }
        if let Some(clean) = normalize_level(rank, value) {
            ranks.set(rank, clean);
        }
    }

    if let Some(species) = raw.get(Rank::Species) {
        if let Some(clean) = normalize_species(species, ranks.get(Rank::Genus)) {
            // A binomial implies its genus when the source omitted it
            if !ranks.contains(Rank::Genus) {
                if let Some(genus) = clean.split(' ').next() {
                    ranks.set(Rank::Genus, genus.to_string());
                }
            }
            ranks.set(Rank::Species, clean);
        }
    }

    ranks
}

fn is_placeholder(value: &str) -> bool {
    let value = value.trim();
    value.is_empty()
        || value.eq_ignore_ascii_case("na")
        || value.eq_ignore_ascii_case("n/a")
        || value.contains('[')
}

fn strip_punctuation(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_ascii_punctuation())
        .collect()
}

fn title_case(word: &str) -> String {
    let lower = word.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn normalize_level(rank: Rank, value: &str) -> Option<String> {
    if is_placeholder(value) {
        return None;
    }
    let first = value.split_whitespace().next()?;
    let word = strip_punctuation(first);
    if word.is_empty() {
        return None;
    }
    if rank == Rank::Kingdom && word.eq_ignore_ascii_case("metazoa") {
        return Some("Animalia".to_string());
    }
    Some(title_case(&word))
}

fn normalize_species(value: &str, genus: Option<&str>) -> Option<String> {
    if is_placeholder(value) {
        return None;
    }
    let mut value = value.trim();

    // "V. macrotis" → "macrotis"; the genus is re-attached below
    if let Some(idx) = value.find('.') {
        let head = &value[..idx];
        if head.len() <= 2 && !head.contains(' ') {
            value = value[idx + 1..].trim();
        }
    }

    let cleaned = strip_punctuation(value);
    let words: Vec<&str> = cleaned.split_whitespace().collect();

    match (words.as_slice(), genus) {
        ([], _) => None,
        ([epithet], Some(genus)) => Some(format!("{} {}", genus, epithet.to_lowercase())),
        // A lone epithet says nothing about its genus
        ([_], None) => None,
        ([genus_word, epithet, ..], _) => Some(format!(
            "{} {}",
            title_case(genus_word),
            epithet.to_lowercase()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranks(pairs: &[(Rank, &str)]) -> Ranks {
        pairs.iter().map(|(r, v)| (*r, *v)).collect()
    }

    #[test]
    fn test_metazoa_becomes_animalia() {
        let out = normalize_ranks(&ranks(&[(Rank::Kingdom, "Metazoa")]));
        assert_eq!(out.get(Rank::Kingdom), Some("Animalia"));
    }

    #[test]
    fn test_levels_title_cased_first_word() {
        let out = normalize_ranks(&ranks(&[
            (Rank::Phylum, "CHORDATA"),
            (Rank::Family, "Canidae Fischer, 1817"),
            (Rank::Order, " carnivora "),
        ]));
        assert_eq!(out.get(Rank::Phylum), Some("Chordata"));
        assert_eq!(out.get(Rank::Family), Some("Canidae"));
        assert_eq!(out.get(Rank::Order), Some("Carnivora"));
    }

    #[test]
    fn test_placeholders_dropped() {
        let out = normalize_ranks(&ranks(&[
            (Rank::Class, "NA"),
            (Rank::Order, "[unranked]"),
            (Rank::Family, "   "),
        ]));
        assert!(out.is_empty());
    }

    #[test]
    fn test_species_abbreviation_expanded() {
        let out = normalize_ranks(&ranks(&[(Rank::Genus, "Vulpes"), (Rank::Species, "V. macrotis")]));
        assert_eq!(out.get(Rank::Species), Some("Vulpes macrotis"));
    }

    #[test]
    fn test_bare_epithet_gets_genus() {
        let out = normalize_ranks(&ranks(&[(Rank::Genus, "Canis"), (Rank::Species, "lupus")]));
        assert_eq!(out.get(Rank::Species), Some("Canis lupus"));
    }

    #[test]
    fn test_binomial_recased_and_trimmed() {
        let out = normalize_ranks(&ranks(&[(Rank::Species, "VULPES VULPES (Linnaeus, 1758)")]));
        assert_eq!(out.get(Rank::Species), Some("Vulpes vulpes"));
        assert_eq!(out.get(Rank::Genus), Some("Vulpes"));
    }

    #[test]
    fn test_bare_epithet_without_genus_dropped() {
        let out = normalize_ranks(&ranks(&[(Rank::Family, "Canidae"), (Rank::Species, "macrotis")]));
        assert!(out.get(Rank::Species).is_none());
        assert!(out.get(Rank::Genus).is_none());
        assert_eq!(out.get(Rank::Family), Some("Canidae"));
    }

    #[test]
    fn test_abbreviation_without_genus_dropped() {
        let out = normalize_ranks(&ranks(&[(Rank::Species, "V. macrotis")]));
        assert!(out.get(Rank::Species).is_none());
    }
}
