// src/matching/score.rs
use crate::matching::normalize::contains_words;
use crate::models::core::NormalizedFields;

pub const NAME_EXACT_SCORE: u32 = 100;
pub const NAME_STRONG_OVERLAP_SCORE: u32 = 70;
pub const NAME_PARTIAL_OVERLAP_SCORE: u32 = 50;
pub const NAME_WEAK_OVERLAP_SCORE: u32 = 30;
pub const ADDRESS_EXACT_SCORE: u32 = 80;
pub const ADDRESS_PARTIAL_SCORE: u32 = 40;
pub const LOCALITY_BONUS: u32 = 20;

pub const MAX_SCORE: u32 = NAME_EXACT_SCORE + ADDRESS_EXACT_SCORE + LOCALITY_BONUS;

/// Additive similarity between two normalized records. Every component is
/// non-negative and exact agreement never scores below partial agreement.
pub fn score(a: &NormalizedFields, b: &NormalizedFields) -> u32 {
    name_score(&a.name, &b.name) + address_score(&a.address, &b.address) + locality_bonus(a, b)
}

pub fn name_score(a: &str, b: &str) -> u32 {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    if a == b {
        return NAME_EXACT_SCORE;
    }
    let (shorter, longer) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if !longer.contains(shorter) {
        return 0;
    }
    let ratio = shorter.chars().count() as f64 / longer.chars().count() as f64;
    if ratio > 0.7 {
        NAME_STRONG_OVERLAP_SCORE
    } else if ratio > 0.5 {
        NAME_PARTIAL_OVERLAP_SCORE
    } else {
        NAME_WEAK_OVERLAP_SCORE
    }
}

pub fn address_score(a: &str, b: &str) -> u32 {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    if a == b {
        ADDRESS_EXACT_SCORE
    } else if a.contains(b) || b.contains(a) {
        ADDRESS_PARTIAL_SCORE
    } else {
        0
    }
}

/// Both sides must name a city, and each side's city must appear as whole
/// words in the other side's locality string.
pub fn locality_bonus(a: &NormalizedFields, b: &NormalizedFields) -> u32 {
    if a.city.is_empty() || b.city.is_empty() {
        return 0;
    }
    if contains_words(&b.locality, &a.city) && contains_words(&a.locality, &b.city) {
        LOCALITY_BONUS
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(name: &str, address: &str, city: &str) -> NormalizedFields {
        NormalizedFields::new(Some(name), Some(address), Some(city), None)
    }

    #[test]
    fn test_exact_match_scores_maximum() {
        let a = fields("Smith Residence", "123 Main St", "Denver");
        let b = fields("smith residence", "123 Main Street", "DENVER");
        assert_eq!(score(&a, &b), MAX_SCORE);
        assert_eq!(MAX_SCORE, 200);
    }

    #[test]
    fn test_name_overlap_bands() {
        // 8/10 = 0.8
        assert_eq!(name_score("abcdefgh", "abcdefghij"), 70);
        // 7/10 = 0.7 is not above 0.7
        assert_eq!(name_score("abcdefg", "abcdefghij"), 50);
        // 6/10 = 0.6
        assert_eq!(name_score("abcdef", "abcdefghij"), 50);
        // 5/10 = 0.5 is not above 0.5
        assert_eq!(name_score("abcde", "abcdefghij"), 30);
        assert_eq!(name_score("xyz", "abcdefghij"), 0);
        assert_eq!(name_score("", "abc"), 0);
    }

    #[test]
    fn test_name_score_is_symmetric() {
        assert_eq!(name_score("smithresidenceremodel", "smithresidence"), 50);
        assert_eq!(name_score("smithresidence", "smithresidenceremodel"), 50);
    }

    #[test]
    fn test_address_scores() {
        assert_eq!(address_score("123 main", "123 main"), 80);
        assert_eq!(address_score("123 main", "123 main 4"), 40);
        assert_eq!(address_score("123 main 4", "123 main"), 40);
        assert_eq!(address_score("123 main", "9 elm"), 0);
        assert_eq!(address_score("", ""), 0);
    }

    #[test]
    fn test_locality_bonus_requires_both_cities() {
        let a = fields("A", "123 Main St", "Denver");
        let b = fields("B", "9 Elm St", "Denver");
        assert_eq!(locality_bonus(&a, &b), 20);

        let no_city = fields("B", "9 Elm St", "");
        assert_eq!(locality_bonus(&a, &no_city), 0);

        let other_city = fields("B", "9 Elm St", "Boulder");
        assert_eq!(locality_bonus(&a, &other_city), 0);

        // "denver" must be a whole word, not a prefix of another city
        let lookalike = fields("B", "9 Elm St", "Denverton");
        assert_eq!(locality_bonus(&a, &lookalike), 0);
    }

    #[test]
    fn test_exact_name_and_address_beats_name_only() {
        let a = fields("Lakeview Clinic", "500 Lake Dr", "Austin");
        let full = fields("Lakeview Clinic", "500 Lake Drive", "Austin");
        let name_only = fields("Lakeview Clinic", "42 Other Rd", "Austin");
        assert!(score(&a, &full) >= score(&a, &name_only));
        assert_eq!(score(&a, &full), 200);
        assert_eq!(score(&a, &name_only), 120);
    }

    #[test]
    fn test_smith_residence_scores_above_threshold() {
        let photo = fields("Smith Residence", "123 Main St", "Denver");
        let pm = fields("Smith Residence Remodel", "123 Main Street", "Denver");
        // name overlap 14/21 → 50, suffix-stripped addresses equal → 80, city → 20
        assert_eq!(score(&photo, &pm), 150);
    }
}
