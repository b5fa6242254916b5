//! Deterministic pseudo-noun name generation for empty-name sessions.
//!
//! Docker-`namesgenerator`-style adjective-noun compounds, seeded by an
//! attempt index so the caller can retry deterministically on collision.

const ADJECTIVES: &[&str] = &[
    "admiring", "brave", "clever", "dazzling", "eager", "frosty", "gentle", "happy", "intrepid",
    "jovial", "keen", "lively", "mellow", "nimble", "optimistic", "plucky", "quiet", "relaxed",
    "sleepy", "trusting", "upbeat", "vigilant", "wry", "zealous",
];

const NOUNS: &[&str] = &[
    "badger", "cormorant", "dolphin", "egret", "falcon", "gecko", "heron", "ibis", "jaguar",
    "kestrel", "lemur", "marten", "newt", "otter", "pelican", "quokka", "raven", "stoat",
    "tapir", "urchin", "vole", "wombat", "xerus", "yak", "zebra",
];

/// Generate the `attempt`-th candidate name (0-indexed).
///
/// Each attempt walks a different adjective/noun pair, deterministically, so
/// a caller retrying on collision never repeats a candidate within
/// `ADJECTIVES.len() * NOUNS.len()` attempts.
pub fn candidate(attempt: usize) -> String {
    let adj = ADJECTIVES[attempt % ADJECTIVES.len()];
    let noun = NOUNS[(attempt / ADJECTIVES.len()) % NOUNS.len()];
    format!("{adj}_{noun}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_candidate_is_adjective_underscore_noun() {
        let name = candidate(0);
        assert!(name.contains('_'));
        assert_eq!(name, "admiring_badger");
    }

    #[test]
    fn test_candidate_is_deterministic() {
        assert_eq!(candidate(5), candidate(5));
    }

    #[test]
    fn test_first_ten_candidates_are_distinct() {
        let names: HashSet<String> = (0..10).map(candidate).collect();
        assert_eq!(names.len(), 10);
    }
}
