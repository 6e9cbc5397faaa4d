//! Textual reference analysis.
//!
//! An entity references another when the other's name occurs as a whole identifier
//! token inside its expression. Candidate names are tried longest first and each match
//! is blanked out of a scratch copy of the expression, so `k` is never found inside
//! `k2` and no occurrence is counted twice. References are transitive.

use std::collections::{BTreeMap, BTreeSet};

/// Blanks out matched names. Names never contain a space, so no later candidate can be
/// found inside it.
const PLACEHOLDER: &str = " ";

/// Reference graph of one registry snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceAnalysis {
    direct: BTreeMap<String, BTreeSet<String>>,
    transitive: BTreeMap<String, BTreeSet<String>>,
    circular: BTreeSet<String>,
    errored: BTreeSet<String>,
}

/// Immutable `(name, expression)` view taken before analysis starts.
struct Snapshot<'a> {
    entries: &'a [(&'a str, &'a str)],
    by_length: Vec<usize>,
}

impl<'a> Snapshot<'a> {
    fn new(entries: &'a [(&'a str, &'a str)]) -> Self {
        let mut by_length: Vec<usize> = (0..entries.len()).collect();
        // Stable: equal lengths keep registry order.
        by_length.sort_by(|&a, &b| entries[b].0.len().cmp(&entries[a].0.len()));
        Self { entries, by_length }
    }

    /// Names found directly in `expression`, in scan order.
    fn scan(&self, expression: &str) -> Vec<usize> {
        let mut scratch = expression.to_string();
        let mut found = Vec::new();
        for &candidate in &self.by_length {
            let name = self.entries[candidate].0;
            if name.is_empty() || find_token(&scratch, name).is_none() {
                continue;
            }
            scratch = replace_tokens(&scratch, name, PLACEHOLDER);
            found.push(candidate);
        }
        found
    }

    fn collect(&self, origin: usize, expression: &str, acc: &mut BTreeSet<String>) {
        for candidate in self.scan(expression) {
            let newly_seen = acc.insert(self.entries[candidate].0.to_string());
            // The origin's own expression is the one being scanned; recording its name
            // is enough to mark the cycle.
            if newly_seen && candidate != origin {
                self.collect(origin, self.entries[candidate].1, acc);
            }
        }
    }
}

impl ReferenceAnalysis {
    /// Analyzes `(name, expression)` pairs. Names are assumed unique.
    pub fn analyze(entries: &[(&str, &str)]) -> Self {
        let snapshot = Snapshot::new(entries);
        let mut analysis = ReferenceAnalysis::default();

        for (index, (name, expression)) in entries.iter().enumerate() {
            let direct = snapshot
                .scan(expression)
                .into_iter()
                .map(|i| entries[i].0.to_string())
                .collect();
            let mut transitive = BTreeSet::new();
            snapshot.collect(index, expression, &mut transitive);

            analysis.direct.insert(name.to_string(), direct);
            analysis.transitive.insert(name.to_string(), transitive);
        }

        analysis.circular = analysis
            .transitive
            .iter()
            .filter(|(name, refs)| refs.contains(name.as_str()))
            .map(|(name, _)| name.clone())
            .collect();
        analysis.errored = analysis
            .transitive
            .iter()
            .filter(|(name, refs)| {
                !analysis.circular.contains(name.as_str())
                    && refs.iter().any(|r| analysis.circular.contains(r))
            })
            .map(|(name, _)| name.clone())
            .collect();

        analysis
    }

    /// All names `name` references, directly or through other entities.
    pub fn references(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.transitive.get(name)
    }

    pub fn direct_references(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.direct.get(name)
    }

    /// Names whose expressions reference `name`, directly or transitively.
    pub fn dependents(&self, name: &str) -> BTreeSet<String> {
        self.transitive
            .iter()
            .filter(|(other, refs)| other.as_str() != name && refs.contains(name))
            .map(|(other, _)| other.clone())
            .collect()
    }

    pub fn is_circular(&self, name: &str) -> bool {
        self.circular.contains(name)
    }

    pub fn is_errored(&self, name: &str) -> bool {
        self.errored.contains(name)
    }

    pub fn circular(&self) -> &BTreeSet<String> {
        &self.circular
    }

    pub fn errored(&self) -> &BTreeSet<String> {
        &self.errored
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_token_at(haystack: &str, at: usize, len: usize) -> bool {
    let before = haystack[..at].chars().next_back();
    let after = haystack[at + len..].chars().next();
    !before.is_some_and(is_ident_char) && !after.is_some_and(is_ident_char)
}

/// Byte offset of the first whole-token occurrence of `needle`.
pub fn find_token(haystack: &str, needle: &str) -> Option<usize> {
    haystack
        .match_indices(needle)
        .map(|(at, _)| at)
        .find(|&at| is_token_at(haystack, at, needle.len()))
}

/// Replaces every whole-token occurrence of `needle`.
pub fn replace_tokens(haystack: &str, needle: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(haystack.len());
    let mut last = 0;
    for (at, _) in haystack.match_indices(needle) {
        if at < last || !is_token_at(haystack, at, needle.len()) {
            continue;
        }
        out.push_str(&haystack[last..at]);
        out.push_str(replacement);
        last = at + needle.len();
    }
    out.push_str(&haystack[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(set: Option<&BTreeSet<String>>) -> Vec<&str> {
        set.map(|s| s.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    #[test]
    fn token_matching_respects_identifier_boundaries() {
        assert_eq!(find_token("k2 + k", "k"), Some(5));
        assert_eq!(find_token("k2 + kk", "k"), None);
        assert_eq!(find_token("sqrt(t)", "t"), Some(5));
        assert_eq!(find_token("t_0*2", "t"), None);
        assert_eq!(replace_tokens("a*a + ab + a", "a", "#"), "#*# + ab + #");
    }

    #[test]
    fn longer_names_are_matched_before_their_prefixes() {
        let entries = [("k", "1"), ("k2", "3"), ("f", "k2 * x")];
        let analysis = ReferenceAnalysis::analyze(&entries);
        assert_eq!(names(analysis.references("f")), vec!["k2"]);
    }

    #[test]
    fn references_are_transitive() {
        let entries = [("a", "1"), ("b", "a + 1"), ("c", "2 * b")];
        let analysis = ReferenceAnalysis::analyze(&entries);
        assert_eq!(names(analysis.direct_references("c")), vec!["b"]);
        assert_eq!(names(analysis.references("c")), vec!["a", "b"]);
        assert_eq!(
            analysis.dependents("a").into_iter().collect::<Vec<_>>(),
            vec!["b", "c"]
        );
    }

    #[test]
    fn self_reference_is_circular_and_dependents_are_errored() {
        let entries = [("f", "f + 1"), ("g", "2 * f"), ("h", "g + 1"), ("k", "3")];
        let analysis = ReferenceAnalysis::analyze(&entries);
        assert!(analysis.is_circular("f"));
        assert!(!analysis.is_errored("f"));
        assert!(analysis.is_errored("g"));
        assert!(!analysis.is_circular("g"));
        assert!(analysis.is_errored("h"));
        assert!(!analysis.is_circular("k") && !analysis.is_errored("k"));
    }

    #[test]
    fn mutual_references_are_all_circular() {
        let entries = [("a", "b + 1"), ("b", "c * 2"), ("c", "a - 1"), ("d", "c")];
        let analysis = ReferenceAnalysis::analyze(&entries);
        for name in ["a", "b", "c"] {
            assert!(analysis.is_circular(name), "{name} should be circular");
        }
        assert!(analysis.is_errored("d"));
        assert_eq!(analysis.circular().len(), 3);
        assert_eq!(analysis.errored().len(), 1);
    }

    #[test]
    fn blanked_matches_are_not_mistaken_for_names() {
        let entries = [("#", "# + 1"), ("ab", "2"), ("f", "ab + 1")];
        let analysis = ReferenceAnalysis::analyze(&entries);
        assert_eq!(names(analysis.references("f")), vec!["ab"]);
        assert!(!analysis.is_errored("f"));
        assert!(analysis.is_circular("#"));
    }
}
