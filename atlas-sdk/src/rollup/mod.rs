//! Offline post-aggregation that drops or merges dimensions before publish
//! (component I).
//!
//! A [`RollupPolicy`] is either a no-op (every measurement passes through
//! under the registry's common tags unchanged) or a list of rules, each a
//! query plus a set of dimensions to remove and a `Rollup`/`Drop` action.
//! Rules are pre-compiled into a [`QueryIndex`] the same way subscriptions
//! are, so `apply` pays `O(d · log m)` per measurement rather than scanning
//! every rule.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use atlas_core::{AtlasError, Id, Measurement};

use crate::query::{parse_query, Query, QueryIndex};

/// What a matching rule does to a measurement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RollupAction {
    /// Remove the named dimensions, merging any measurements that collide
    /// once removed.
    Rollup,
    /// Drop the measurement entirely.
    Drop,
}

/// One rollup rule: `(queryString, dimensionsToRemove, action)`.
#[derive(Clone, Debug)]
pub struct RollupRule {
    query: Query,
    dimensions: Arc<[Arc<str>]>,
    action: RollupAction,
}

impl RollupRule {
    /// Parses `query_expr` (the same postfix grammar [`parse_query`]
    /// accepts) and pairs it with the dimensions a match should remove.
    /// `dimensions` is ignored for [`RollupAction::Drop`] rules.
    pub fn new<D, S>(query_expr: &str, dimensions: D, action: RollupAction) -> Result<Self, AtlasError>
    where
        D: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        Ok(RollupRule {
            query: parse_query(query_expr)?,
            dimensions: dimensions.into_iter().map(Into::into).collect(),
            action,
        })
    }
}

/// One distinct-common-tag group of the rollup result: measurements that
/// share `common_tags` after rule application.
#[derive(Clone, Debug, Default)]
pub struct RollupResult {
    pub common_tags: BTreeMap<Arc<str>, Arc<str>>,
    pub measurements: Vec<Measurement>,
}

/// Rule-driven dimension-dropping/aggregation with common-tag partitioning,
/// or a no-op passthrough when no rules are configured.
#[derive(Debug)]
pub struct RollupPolicy {
    index: QueryIndex<usize>,
    rules: Vec<RollupRule>,
}

impl RollupPolicy {
    /// A policy that never drops or merges anything.
    pub fn no_op() -> Self {
        RollupPolicy {
            index: QueryIndex::new(),
            rules: Vec::new(),
        }
    }

    /// Pre-compiles each rule's query (simplified against `common_tags`,
    /// per the design's "Pre-compile each rule's query" step) into a
    /// [`QueryIndex`].
    pub fn new(rules: Vec<RollupRule>, common_tags: &BTreeMap<Arc<str>, Arc<str>>) -> Self {
        let mut index = QueryIndex::new();
        for (i, rule) in rules.iter().enumerate() {
            let simplified = rule.query.simplify(&|k| common_tags.get(k).map(|v| v.as_ref()));
            index.add(&simplified, i);
        }
        RollupPolicy { index, rules }
    }

    pub fn is_no_op(&self) -> bool {
        self.rules.is_empty()
    }

    /// Applies every matching rule to each measurement, then groups the
    /// survivors by their (possibly rewritten) common tags, merging
    /// duplicate `(commonTags, id)` pairs with sum or max depending on the
    /// id's `statistic` tag.
    pub fn apply(
        &self,
        common_tags: &BTreeMap<Arc<str>, Arc<str>>,
        measurements: Vec<Measurement>,
    ) -> Vec<RollupResult> {
        if self.is_no_op() {
            return vec![RollupResult {
                common_tags: common_tags.clone(),
                measurements,
            }];
        }

        let mut groups: HashMap<(BTreeMap<Arc<str>, Arc<str>>, Id), Measurement> = HashMap::new();
        for m in measurements {
            let mut hit: Vec<usize> = Vec::new();
            self.index.for_each_match(&m.id, &mut |i| hit.push(*i));

            if hit.iter().any(|&i| self.rules[i].action == RollupAction::Drop) {
                continue;
            }

            let mut drop_dims: Vec<Arc<str>> = Vec::new();
            for &i in &hit {
                drop_dims.extend(self.rules[i].dimensions.iter().cloned());
            }

            if drop_dims.is_empty() {
                merge_into(&mut groups, common_tags.clone(), m);
                continue;
            }

            let mut new_common = common_tags.clone();
            for dim in &drop_dims {
                new_common.remove(dim);
            }
            let new_id = m.id.filter_by_key(|k| !drop_dims.iter().any(|d| &**d == k));
            merge_into(&mut groups, new_common, Measurement::new(new_id, m.timestamp, m.value));
        }

        let mut by_common: HashMap<BTreeMap<Arc<str>, Arc<str>>, Vec<Measurement>> = HashMap::new();
        for ((tags, _id), measurement) in groups {
            by_common.entry(tags).or_default().push(measurement);
        }
        by_common
            .into_iter()
            .map(|(common_tags, measurements)| RollupResult { common_tags, measurements })
            .collect()
    }
}

fn merge_into(
    groups: &mut HashMap<(BTreeMap<Arc<str>, Arc<str>>, Id), Measurement>,
    tags: BTreeMap<Arc<str>, Arc<str>>,
    m: Measurement,
) {
    let key = (tags, m.id.clone());
    groups
        .entry(key)
        .and_modify(|existing| {
            existing.value = merge_value(existing.id.get("statistic"), existing.value, m.value);
            existing.timestamp = existing.timestamp.max(m.timestamp);
        })
        .or_insert(m);
}

fn is_sum_based_statistic(statistic: &str) -> bool {
    matches!(statistic, "count" | "totalAmount" | "totalTime" | "totalOfSquares" | "percentile")
}

fn merge_value(statistic: Option<&str>, a: f64, b: f64) -> f64 {
    if a.is_nan() {
        return b;
    }
    if b.is_nan() {
        return a;
    }
    if statistic.is_some_and(is_sum_based_statistic) {
        a + b
    } else {
        a.max(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<Arc<str>, Arc<str>> {
        pairs.iter().map(|(k, v)| (Arc::from(*k), Arc::from(*v))).collect()
    }

    #[test]
    fn no_op_policy_returns_input_unchanged_with_identity_common_tags() {
        let policy = RollupPolicy::no_op();
        let common = tags(&[("nf.cluster", "c1")]);
        let measurements = vec![Measurement::new(Id::new("cpu", [("app", "x")]), 1_000, 5.0)];
        let results = policy.apply(&common, measurements.clone());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].common_tags, common);
        assert_eq!(results[0].measurements, measurements);
    }

    #[test]
    fn drop_rule_removes_matching_measurements() {
        let rule = RollupRule::new("name,^debug,:re", Vec::<Arc<str>>::new(), RollupAction::Drop).unwrap();
        let common = BTreeMap::new();
        let policy = RollupPolicy::new(vec![rule], &common);

        let measurements = vec![
            Measurement::new(Id::new("debug.queueSize", []), 1_000, 1.0),
            Measurement::new(Id::new("requests", []), 1_000, 2.0),
        ];
        let results = policy.apply(&common, measurements);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].measurements.len(), 1);
        assert_eq!(results[0].measurements[0].id.name(), "requests");
    }

    #[test]
    fn rollup_rule_drops_a_dimension_and_merges_duplicates() {
        let rule = RollupRule::new("name,requests,:eq", ["host"], RollupAction::Rollup).unwrap();
        let common = BTreeMap::new();
        let policy = RollupPolicy::new(vec![rule], &common);

        let id1 = Id::new("requests", [("host", "h-1"), ("statistic", "count")]);
        let id2 = Id::new("requests", [("host", "h-2"), ("statistic", "count")]);
        let measurements = vec![
            Measurement::new(id1, 1_000, 3.0),
            Measurement::new(id2, 1_000, 4.0),
        ];
        let results = policy.apply(&common, measurements);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].measurements.len(), 1);
        assert_eq!(results[0].measurements[0].value, 7.0);
        assert_eq!(results[0].measurements[0].id.get("host"), None);
    }

    #[test]
    fn rollup_rule_uses_max_merge_for_max_statistic() {
        let rule = RollupRule::new("name,latency,:eq", ["host"], RollupAction::Rollup).unwrap();
        let common = BTreeMap::new();
        let policy = RollupPolicy::new(vec![rule], &common);

        let id1 = Id::new("latency", [("host", "h-1"), ("statistic", "max")]);
        let id2 = Id::new("latency", [("host", "h-2"), ("statistic", "max")]);
        let measurements = vec![Measurement::new(id1, 1_000, 3.0), Measurement::new(id2, 1_000, 9.0)];
        let results = policy.apply(&common, measurements);
        assert_eq!(results[0].measurements[0].value, 9.0);
    }
}
