// src/matching/normalize.rs
//
// Canonical forms used for every name and address comparison. All functions
// are total: missing input normalizes to "".
use once_cell::sync::Lazy;
use regex::Regex;

static STREET_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(street|st|avenue|ave|road|rd|drive|dr|lane|ln|boulevard|blvd|court|ct|place|pl|way)\b",
    )
    .expect("street suffix pattern is valid")
});

const ADDRESS_PUNCTUATION: [char; 4] = ['.', ',', '#', '-'];

/// Lowercases and drops everything that is not alphanumeric, so
/// "Smith Residence, LLC" becomes "smithresidencellc".
pub fn normalize_name(name: Option<&str>) -> String {
    name.unwrap_or_default()
        .chars()
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Lowercases, strips punctuation, removes street-suffix words and collapses whitespace.
pub fn normalize_address(address: Option<&str>) -> String {
    let Some(address) = address else {
        return String::new();
    };
    let stripped: String = address
        .to_lowercase()
        .chars()
        .filter(|c| !ADDRESS_PUNCTUATION.contains(c))
        .collect();
    let without_suffixes = STREET_SUFFIX_RE.replace_all(&stripped, " ");
    collapse_whitespace(&without_suffixes)
}

/// Lowercase, punctuation-free, single-spaced form used for cities, states and
/// tracked field values.
pub fn normalize_text(value: Option<&str>) -> String {
    let Some(value) = value else {
        return String::new();
    };
    let stripped: String = value
        .to_lowercase()
        .chars()
        .filter(|c| !ADDRESS_PUNCTUATION.contains(c))
        .collect();
    collapse_whitespace(&stripped)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// True when `token` appears in `haystack` as a whole space-delimited run of words.
pub fn contains_words(haystack: &str, token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    let padded_haystack = format!(" {} ", haystack);
    let padded_token = format!(" {} ", token);
    padded_haystack.contains(&padded_token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name(Some("Smith Residence")), "smithresidence");
        assert_eq!(normalize_name(Some("  O'Brien & Sons, Inc. ")), "obriensonsinc");
        assert_eq!(normalize_name(Some("Lot #42 - Phase 2")), "lot42phase2");
        assert_eq!(normalize_name(None), "");
        assert_eq!(normalize_name(Some("")), "");
    }

    #[test]
    fn test_normalize_address_strips_suffixes_as_words() {
        assert_eq!(normalize_address(Some("123 Main St.")), "123 main");
        assert_eq!(normalize_address(Some("123 Main Street")), "123 main");
        assert_eq!(normalize_address(Some("55 Elm Ave, #4")), "55 elm 4");
        assert_eq!(normalize_address(Some("9 Court Way")), "9");
        // "st" inside a word is kept
        assert_eq!(normalize_address(Some("400 Stone Rd")), "400 stone");
        assert_eq!(normalize_address(Some("12 Westway Blvd")), "12 westway");
    }

    #[test]
    fn test_normalize_address_collapses_whitespace() {
        assert_eq!(normalize_address(Some("  77   North-West   Dr ")), "77 northwest");
        assert_eq!(normalize_address(None), "");
        assert_eq!(normalize_address(Some(" , . ")), "");
    }

    #[test]
    fn test_normalize_text_keeps_words() {
        assert_eq!(normalize_text(Some("St. Louis")), "st louis");
        assert_eq!(normalize_text(Some("  DENVER ")), "denver");
        assert_eq!(normalize_text(None), "");
    }

    #[test]
    fn test_normalization_is_deterministic() {
        let input = Some("1600 Pennsylvania Avenue, N.W.");
        assert_eq!(normalize_address(input), normalize_address(input));
        assert_eq!(normalize_address(input), "1600 pennsylvania nw");
    }

    #[test]
    fn test_contains_words() {
        assert!(contains_words("123 main denver", "denver"));
        assert!(contains_words("123 main fort collins", "fort collins"));
        assert!(!contains_words("123 main denverton", "denver"));
        assert!(!contains_words("123 main", ""));
    }
}
