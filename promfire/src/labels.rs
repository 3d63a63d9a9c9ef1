//! Label sets and replica label combinations
//!
//! Every replicated series is the original series' label set overlaid with one
//! combination produced by [`combine`]. Combinations are enumerated in
//! mixed-radix order over the configured replication labels, the first label
//! varying fastest, and are bounded by the replication factor so the full
//! cartesian product is never materialized.

use std::{borrow::Cow, collections::BTreeMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A label set. Keys are kept sorted, the order remote-write receivers expect.
pub type LabelSet = BTreeMap<String, String>;

/// The label holding a series' metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";
/// Replica marker used when no replication labels are configured.
pub const REPLICA_LABEL: &str = "benchmark_replica";
/// Replication label whose values are generated when left empty.
pub const INSTANCE_LABEL: &str = "benchmark_instance";

/// One replication label and its candidate values.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ReplicationLabel {
    /// Label name
    pub name: String,
    /// Candidate values, in the order they are enumerated
    #[serde(default)]
    pub values: Vec<String>,
}

impl ReplicationLabel {
    /// Create a new [`ReplicationLabel`].
    #[must_use]
    pub fn new<N, V, I>(name: N, values: I) -> Self
    where
        N: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = V>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Overlay `overlay` onto `base`. Keys present in `overlay` win.
#[must_use]
pub fn merge(base: &LabelSet, overlay: &LabelSet) -> LabelSet {
    let mut merged = base.clone();
    merged.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Expand `spec` into at most `replication_factor` label sets.
///
/// With an empty `spec` the result is `replication_factor` singleton sets
/// `{benchmark_replica: "replica-<i>"}`. Otherwise an empty
/// `benchmark_instance` entry is filled with `bench-1 ..
/// bench-<replication_factor>` and the result holds
/// `min(replication_factor, product of value-list lengths)` combinations,
/// empty value lists contributing no factor and no label.
#[must_use]
pub fn combine(spec: &[ReplicationLabel], replication_factor: usize) -> Vec<LabelSet> {
    if spec.is_empty() {
        return (0..replication_factor)
            .map(|i| LabelSet::from([(REPLICA_LABEL.to_string(), format!("replica-{i}"))]))
            .collect();
    }

    let resolved: Vec<(&str, Cow<'_, [String]>)> = spec
        .iter()
        .map(|label| {
            if label.name == INSTANCE_LABEL && label.values.is_empty() {
                let values: Vec<String> = (1..=replication_factor)
                    .map(|j| format!("bench-{j}"))
                    .collect();
                debug!(
                    count = values.len(),
                    "Auto-generated {INSTANCE_LABEL} values"
                );
                (label.name.as_str(), Cow::Owned(values))
            } else {
                (label.name.as_str(), Cow::Borrowed(label.values.as_slice()))
            }
        })
        .filter(|(_, values)| !values.is_empty())
        .collect();

    let total = resolved
        .iter()
        .fold(1_usize, |acc, (_, values)| acc.saturating_mul(values.len()));
    let count = replication_factor.min(total);

    (0..count)
        .map(|i| {
            // Mixed-radix decomposition of `i`, the first label is the least
            // significant digit.
            let mut index = i;
            let mut set = LabelSet::new();
            for (name, values) in &resolved {
                set.insert((*name).to_string(), values[index % values.len()].clone());
                index /= values.len();
            }
            set
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::{collection, prelude::*};

    use super::*;

    fn set(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn empty_spec_yields_replica_markers() {
        let combinations = combine(&[], 3);
        assert_eq!(
            combinations,
            vec![
                set(&[("benchmark_replica", "replica-0")]),
                set(&[("benchmark_replica", "replica-1")]),
                set(&[("benchmark_replica", "replica-2")]),
            ]
        );
    }

    #[test]
    fn two_labels_enumerate_in_mixed_radix_order() {
        let spec = vec![
            ReplicationLabel::new("region", ["us", "eu"]),
            ReplicationLabel::new("env", ["x", "y"]),
        ];
        assert_eq!(
            combine(&spec, 4),
            vec![
                set(&[("region", "us"), ("env", "x")]),
                set(&[("region", "eu"), ("env", "x")]),
                set(&[("region", "us"), ("env", "y")]),
                set(&[("region", "eu"), ("env", "y")]),
            ]
        );
    }

    #[test]
    fn replication_factor_bounds_and_product_bounds() {
        let spec = vec![
            ReplicationLabel::new("region", ["us", "eu"]),
            ReplicationLabel::new("env", ["x", "y"]),
        ];
        assert_eq!(combine(&spec, 3).len(), 3);
        assert_eq!(combine(&spec, 10).len(), 4);
    }

    #[test]
    fn benchmark_instance_is_auto_filled() {
        let spec = vec![ReplicationLabel::new("benchmark_instance", Vec::<String>::new())];
        assert_eq!(
            combine(&spec, 2),
            vec![
                set(&[("benchmark_instance", "bench-1")]),
                set(&[("benchmark_instance", "bench-2")]),
            ]
        );
    }

    #[test]
    fn other_empty_labels_are_skipped() {
        let spec = vec![
            ReplicationLabel::new("unused", Vec::<String>::new()),
            ReplicationLabel::new("region", ["us", "eu"]),
        ];
        assert_eq!(
            combine(&spec, 5),
            vec![set(&[("region", "us")]), set(&[("region", "eu")])]
        );
    }

    #[test]
    fn huge_products_do_not_overflow() {
        let values: Vec<String> = (0..1_000).map(|i| i.to_string()).collect();
        let spec: Vec<ReplicationLabel> = (0..10)
            .map(|i| ReplicationLabel::new(format!("l{i}"), values.clone()))
            .collect();
        let combinations = combine(&spec, 7);
        assert_eq!(combinations.len(), 7);
        assert_eq!(combinations[6]["l0"], "6");
        assert_eq!(combinations[6]["l9"], "0");
    }

    #[test]
    fn merge_overlays() {
        let base = set(&[("__name__", "up"), ("job", "node"), ("region", "local")]);
        let overlay = set(&[("region", "us")]);
        assert_eq!(
            merge(&base, &overlay),
            set(&[("__name__", "up"), ("job", "node"), ("region", "us")])
        );
    }

    fn spec_strategy() -> impl Strategy<Value = Vec<ReplicationLabel>> {
        collection::vec(
            (
                "[a-z]{1,6}",
                collection::vec("[a-z0-9]{1,4}", 0..5),
            ),
            0..5,
        )
        .prop_map(|labels| {
            labels
                .into_iter()
                .enumerate()
                // Distinct names keep the per-entry membership check simple.
                .map(|(i, (name, values))| ReplicationLabel::new(format!("{name}{i}"), values))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn count_and_membership(spec in spec_strategy(), replication_factor in 0..40_usize) {
            let combinations = combine(&spec, replication_factor);

            if spec.is_empty() {
                prop_assert_eq!(combinations.len(), replication_factor);
            } else {
                let total: usize = spec
                    .iter()
                    .map(|label| label.values.len())
                    .filter(|len| *len > 0)
                    .product();
                prop_assert_eq!(combinations.len(), replication_factor.min(total));

                for combination in &combinations {
                    for (name, value) in combination {
                        let label = spec.iter().find(|l| &l.name == name);
                        prop_assert!(label.is_some());
                        prop_assert!(label.unwrap().values.contains(value));
                    }
                }
            }
        }

        #[test]
        fn combinations_are_distinct(spec in spec_strategy(), replication_factor in 1..40_usize) {
            let combinations = combine(&spec, replication_factor);
            let mut unique = combinations.clone();
            unique.sort();
            unique.dedup();
            // Values within one label may repeat, distinctness only holds for
            // distinct candidate values.
            let distinct_values = spec.iter().all(|label| {
                let mut values = label.values.clone();
                values.sort();
                values.dedup();
                values.len() == label.values.len()
            });
            if distinct_values {
                prop_assert_eq!(unique.len(), combinations.len());
            }
        }
    }
}
