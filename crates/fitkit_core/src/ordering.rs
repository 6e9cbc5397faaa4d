use crate::references::ReferenceAnalysis;
use std::collections::BTreeSet;
use tracing::warn;

/// Computes the order in which entities can be evaluated.
///
/// `names` is the registry order; it is also the tie-break between entities that become
/// ready in the same pass. Circular and errored entities are excluded. Each pass plans
/// every entity whose references are all resolved; a pass without progress ends the
/// loop and leaves the remaining entities out of the plan.
pub fn evaluation_order<'a>(
    names: impl IntoIterator<Item = &'a str>,
    analysis: &ReferenceAnalysis,
) -> Vec<String> {
    let mut working: Vec<&str> = names
        .into_iter()
        .filter(|name| !analysis.is_circular(name) && !analysis.is_errored(name))
        .collect();
    let mut resolved: BTreeSet<&str> = BTreeSet::new();
    let mut plan = Vec::with_capacity(working.len());

    while !working.is_empty() {
        let before = plan.len();
        working.retain(|&name| {
            let ready = analysis
                .references(name)
                .map_or(true, |refs| refs.iter().all(|r| resolved.contains(r.as_str())));
            if ready {
                resolved.insert(name);
                plan.push(name.to_string());
            }
            !ready
        });
        if plan.len() == before {
            warn!(
                unresolved = ?working,
                "evaluation ordering stalled; leaving entities out of the plan"
            );
            break;
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn order(entries: &[(&str, &str)]) -> Vec<String> {
        let analysis = ReferenceAnalysis::analyze(entries);
        evaluation_order(entries.iter().map(|(n, _)| *n), &analysis)
    }

    #[test]
    fn dependencies_come_first() {
        let entries = [("c", "b * 2"), ("b", "a + 1"), ("a", "1"), ("d", "7")];
        assert_eq!(order(&entries), vec!["a", "d", "b", "c"]);
    }

    #[test]
    fn circular_and_errored_entities_are_left_out() {
        let entries = [("a", "1"), ("f", "f + a"), ("g", "f * 2"), ("h", "a")];
        assert_eq!(order(&entries), vec!["a", "h"]);
    }

    #[test]
    fn empty_registry_has_empty_plan() {
        assert!(order(&[]).is_empty());
    }

    /// Random acyclic registries: entity `i` may reference any `j < i`, and the
    /// registry lists them in a shuffled order.
    fn acyclic_registry() -> impl Strategy<Value = Vec<(String, String)>> {
        (1usize..12)
            .prop_flat_map(|n| {
                let deps = proptest::collection::vec(proptest::collection::vec(any::<bool>(), n), n);
                (deps, Just((0..n).collect::<Vec<_>>()).prop_shuffle())
            })
            .prop_map(|(deps, shuffled)| {
                shuffled
                    .into_iter()
                    .map(|i| {
                        let refs: Vec<String> = (0..i)
                            .filter(|&j| deps[i][j])
                            .map(|j| format!("p{j}"))
                            .collect();
                        let expression = if refs.is_empty() {
                            format!("{i}")
                        } else {
                            refs.join(" + ")
                        };
                        (format!("p{i}"), expression)
                    })
                    .collect()
            })
    }

    proptest! {
        #[test]
        fn plan_covers_every_entity_after_its_references(entries in acyclic_registry()) {
            let pairs: Vec<(&str, &str)> =
                entries.iter().map(|(n, e)| (n.as_str(), e.as_str())).collect();
            let analysis = ReferenceAnalysis::analyze(&pairs);
            let plan = evaluation_order(pairs.iter().map(|(n, _)| *n), &analysis);

            prop_assert_eq!(plan.len(), pairs.len());
            for (position, name) in plan.iter().enumerate() {
                for reference in analysis.references(name).unwrap() {
                    let at = plan.iter().position(|p| p == reference);
                    prop_assert!(at.is_some_and(|at| at < position),
                        "{} must precede {}", reference, name);
                }
            }
        }
    }
}
