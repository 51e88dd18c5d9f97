//! Per-subscription consolidators driven by `for_each_match` (component F).
//!
//! The evaluator owns a [`QueryIndex`] from matched data ids to
//! subscription ids, plus one [`SubscriptionEntry`] per live subscription
//! holding its own `Id -> Consolidator` map. `update` feeds every
//! meter-emitted datapoint through the index exactly once; `eval` drains
//! each subscription whose frequency divides the current tick, aggregates
//! its live values with the subscription's `DataExpr`, and returns one
//! result per subscription.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use atlas_core::{atlas_warn, Id, Measurement, Statistic};

use crate::consolidation::Consolidator;
use crate::query::{parse_data_expr, AggregateFunction, DataExpr, Grouping, SharedQueryIndex};
use crate::subscribe::Subscription;
use crate::tags::ValidTagCharacters;

/// One live subscription's state: its parsed expression, its frequency
/// expressed as a multiple of the registry's LWC step, and a consolidator
/// per distinct id the subscription's query has matched so far.
#[derive(Debug)]
struct SubscriptionEntry {
    subscription: Subscription,
    data_expr: DataExpr,
    multiple: i64,
    consolidators: Mutex<HashMap<Id, Consolidator>>,
}

/// One subscription's aggregated output for a single evaluation tick.
#[derive(Clone, Debug, PartialEq)]
pub struct EvalResult {
    pub subscription_id: Arc<str>,
    pub timestamp: i64,
    pub measurements: Vec<Measurement>,
}

thread_local! {
    /// A reusable match buffer, one per worker thread calling `update`.
    /// Avoids allocating a fresh closure/collection on every datapoint , 
    /// the "thread-local reusable consumer" called out in the design notes
    /// for `forEachMatch`.
    static MATCH_BUF: RefCell<HashSet<Arc<str>>> = RefCell::new(HashSet::new());
}

/// Owns the subscription query index, the per-subscription consolidator
/// state, and the writer lock that serializes `sync`.
#[derive(Debug)]
pub struct Evaluator {
    lwc_step_millis: i64,
    index: SharedQueryIndex<Arc<str>>,
    entries: RwLock<HashMap<Arc<str>, Arc<SubscriptionEntry>>>,
    writer_lock: Mutex<()>,
}

impl Evaluator {
    pub fn new(lwc_step_millis: i64) -> Self {
        Evaluator {
            lwc_step_millis,
            index: SharedQueryIndex::new(),
            entries: RwLock::new(HashMap::new()),
            writer_lock: Mutex::new(()),
        }
    }

    /// Computes the set diff against the current subscription list: new
    /// subscriptions are parsed, simplified against `common_tags`, and
    /// registered in the index; departed ones are removed. A single
    /// subscription failing to parse is logged and skipped, it never
    /// aborts the rest of the sync.
    pub fn sync(&self, subscriptions: &[Subscription], common_tags: &BTreeMap<Arc<str>, Arc<str>>) {
        let _guard = self.writer_lock.lock().expect("evaluator writer lock poisoned");
        let mut entries = self.entries.write().expect("evaluator entries lock poisoned");

        let incoming: HashMap<Arc<str>, &Subscription> =
            subscriptions.iter().map(|s| (s.id.clone(), s)).collect();

        let departed: Vec<Arc<str>> = entries
            .keys()
            .filter(|id| !incoming.contains_key(id.as_ref()))
            .cloned()
            .collect();
        for id in departed {
            if let Some(entry) = entries.remove(&id) {
                self.index.remove(&entry.data_expr.query, &id);
            }
        }

        for (id, subscription) in incoming {
            if entries.contains_key(&id) {
                continue; // unchanged subscription: keep its live consolidator state
            }
            match self.compile(subscription, common_tags) {
                Ok(entry) => {
                    self.index.add(&entry.data_expr.query, id.clone());
                    entries.insert(id, Arc::new(entry));
                }
                Err(reason) => {
                    atlas_warn!(name: "subscription_sync_failed", id = id.as_ref(), reason = reason);
                }
            }
        }
    }

    fn compile(
        &self,
        subscription: &Subscription,
        common_tags: &BTreeMap<Arc<str>, Arc<str>>,
    ) -> Result<SubscriptionEntry, String> {
        if subscription.frequency_millis <= 0 || subscription.frequency_millis % self.lwc_step_millis != 0 {
            return Err(format!(
                "frequency {} is not a positive multiple of the LWC step {}",
                subscription.frequency_millis, self.lwc_step_millis
            ));
        }
        let mut data_expr = parse_data_expr(&subscription.expression).map_err(|e| e.to_string())?;
        data_expr.query = data_expr.query.simplify(&|k| common_tags.get(k).map(|v| v.as_ref()));
        let multiple = subscription.frequency_millis / self.lwc_step_millis;
        Ok(SubscriptionEntry {
            subscription: subscription.clone(),
            data_expr,
            multiple,
            consolidators: Mutex::new(HashMap::new()),
        })
    }

    /// Feeds one `(id, timestamp, value)` datapoint through the index,
    /// folding it into every matching subscription's per-id consolidator.
    pub fn update(&self, id: &Id, t: i64, v: f64) {
        let Ok(entries) = self.entries.read() else { return };
        if entries.is_empty() {
            return;
        }
        MATCH_BUF.with(|buf| {
            let mut buf = buf.borrow_mut();
            buf.clear();
            self.index.for_each_match(id, &mut |sub_id: &Arc<str>| {
                buf.insert(sub_id.clone());
            });
            for sub_id in buf.iter() {
                let Some(entry) = entries.get(sub_id) else { continue };
                let statistic = id.get("statistic").and_then(Statistic::parse).unwrap_or(Statistic::Gauge);
                let mut consolidators = entry.consolidators.lock().expect("consolidator map lock poisoned");
                let consolidator = consolidators
                    .entry(id.clone())
                    .or_insert_with(|| Consolidator::for_statistic(statistic, self.lwc_step_millis, entry.multiple));
                consolidator.update(t, v);
            }
        });
    }

    /// Evaluates every subscription whose frequency divides `t`: force-
    /// polls its consolidators, aggregates the live values per the
    /// subscription's `DataExpr`, and drops any consolidator that goes
    /// empty in the process.
    pub fn eval(
        &self,
        t: i64,
        common_tags: &BTreeMap<Arc<str>, Arc<str>>,
        valid_tag_characters: &ValidTagCharacters,
    ) -> Vec<EvalResult> {
        let Ok(entries) = self.entries.read() else { return Vec::new() };
        let mut results = Vec::with_capacity(entries.len());
        for (sub_id, entry) in entries.iter() {
            if entry.subscription.frequency_millis <= 0 || t % entry.subscription.frequency_millis != 0 {
                continue;
            }
            let live = {
                let mut consolidators = entry.consolidators.lock().expect("consolidator map lock poisoned");
                let mut live = Vec::new();
                consolidators.retain(|id, c| {
                    c.update(t, f64::NAN);
                    let v = c.value(t);
                    if v.is_finite() {
                        live.push((id.clone(), v));
                    }
                    !c.is_empty()
                });
                live
            };
            if live.is_empty() {
                continue;
            }
            let measurements = aggregate(&entry.data_expr, live, t, common_tags, valid_tag_characters);
            results.push(EvalResult {
                subscription_id: sub_id.clone(),
                timestamp: t,
                measurements,
            });
        }
        results
    }

    pub fn subscription_count(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }
}

fn aggregate(
    expr: &DataExpr,
    live: Vec<(Id, f64)>,
    t: i64,
    common_tags: &BTreeMap<Arc<str>, Arc<str>>,
    valid_tag_characters: &ValidTagCharacters,
) -> Vec<Measurement> {
    if expr.aggregate == AggregateFunction::All {
        return live
            .into_iter()
            .map(|(id, v)| Measurement::new(finish_id(&id, common_tags, valid_tag_characters), t, v))
            .collect();
    }

    let mut groups: HashMap<Id, Vec<f64>> = HashMap::new();
    for (id, v) in live {
        groups.entry(grouping_key(&expr.grouping, &id)).or_default().push(v);
    }
    groups
        .into_iter()
        .map(|(id, values)| {
            let value = reduce(expr.aggregate, &values);
            Measurement::new(finish_id(&id, common_tags, valid_tag_characters), t, value)
        })
        .collect()
}

/// Shapes a matched id's tags down to what the subscription's grouping
/// clause asks for: `None` keeps only the name, `By`/`RollupKeep` keep
/// exactly the named keys, `RollupDrop` keeps everything except them.
fn grouping_key(grouping: &Grouping, id: &Id) -> Id {
    match grouping {
        Grouping::None => id.filter_by_key(|_| false),
        Grouping::By(keys) | Grouping::RollupKeep(keys) => {
            id.filter_by_key(|k| keys.iter().any(|key| &**key == k))
        }
        Grouping::RollupDrop(keys) => id.filter_by_key(|k| !keys.iter().any(|key| &**key == k)),
    }
}

fn reduce(aggregate: AggregateFunction, values: &[f64]) -> f64 {
    match aggregate {
        AggregateFunction::Sum => values.iter().sum(),
        AggregateFunction::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        AggregateFunction::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AggregateFunction::Count => values.len() as f64,
        AggregateFunction::All => unreachable!("AggregateFunction::All is handled before grouping"),
    }
}

fn finish_id(id: &Id, common_tags: &BTreeMap<Arc<str>, Arc<str>>, valid_tag_characters: &ValidTagCharacters) -> Id {
    let with_common = id.with_tags(common_tags.iter().map(|(k, v)| (k.clone(), v.clone())));
    valid_tag_characters.rewrite_id(&with_common)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(id: &str, expr: &str, frequency_millis: i64) -> Subscription {
        Subscription {
            id: id.into(),
            expression: expr.into(),
            frequency_millis,
        }
    }

    #[test]
    fn sync_registers_parseable_subscriptions_and_skips_bad_ones() {
        let evaluator = Evaluator::new(10_000);
        let subs = vec![
            sub("s1", "name,cpu,:eq,:sum", 10_000),
            sub("s2", ":bogus-operator", 10_000),
        ];
        evaluator.sync(&subs, &BTreeMap::new());
        assert_eq!(evaluator.subscription_count(), 1);
    }

    #[test]
    fn sync_drops_a_subscription_no_longer_present() {
        let evaluator = Evaluator::new(10_000);
        evaluator.sync(&[sub("s1", "name,cpu,:eq,:sum", 10_000)], &BTreeMap::new());
        assert_eq!(evaluator.subscription_count(), 1);
        evaluator.sync(&[], &BTreeMap::new());
        assert_eq!(evaluator.subscription_count(), 0);
    }

    #[test]
    fn update_then_eval_sums_matching_ids_on_the_subscriptions_frequency() {
        let evaluator = Evaluator::new(10_000);
        evaluator.sync(&[sub("s1", "name,cpu,:eq,:sum", 10_000)], &BTreeMap::new());

        let id1 = Id::new("cpu", [("host", "h-1")]);
        let id2 = Id::new("cpu", [("host", "h-2")]);
        evaluator.update(&id1, 10_000, 3.0);
        evaluator.update(&id2, 10_000, 4.0);

        let results = evaluator.eval(10_000, &BTreeMap::new(), &ValidTagCharacters::default());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].subscription_id.as_ref(), "s1");
        assert_eq!(results[0].measurements.len(), 1);
        assert_eq!(results[0].measurements[0].value, 7.0);
    }

    #[test]
    fn eval_skips_subscriptions_whose_frequency_does_not_divide_the_tick() {
        let evaluator = Evaluator::new(10_000);
        evaluator.sync(&[sub("s1", "name,cpu,:eq,:sum", 20_000)], &BTreeMap::new());
        let id = Id::new("cpu", []);
        evaluator.update(&id, 10_000, 1.0);
        assert!(evaluator.eval(10_000, &BTreeMap::new(), &ValidTagCharacters::default()).is_empty());
    }

    #[test]
    fn by_grouping_splits_the_aggregate_per_distinct_key_value() {
        let evaluator = Evaluator::new(10_000);
        evaluator.sync(
            &[sub("s1", "name,cpu,:eq,:sum,(,az,),:by", 10_000)],
            &BTreeMap::new(),
        );
        evaluator.update(&Id::new("cpu", [("az", "a")]), 10_000, 1.0);
        evaluator.update(&Id::new("cpu", [("az", "a")]), 10_000, 2.0);
        evaluator.update(&Id::new("cpu", [("az", "b")]), 10_000, 5.0);

        let results = evaluator.eval(10_000, &BTreeMap::new(), &ValidTagCharacters::default());
        assert_eq!(results[0].measurements.len(), 2);
        let get = |az: &str| results[0].measurements.iter().find(|m| m.id.get("az") == Some(az)).unwrap();
        assert_eq!(get("a").value, 3.0);
        assert_eq!(get("b").value, 5.0);
    }

    #[test]
    fn all_aggregate_emits_every_matched_id_individually() {
        let evaluator = Evaluator::new(10_000);
        evaluator.sync(&[sub("s1", "name,cpu,:eq,:all", 10_000)], &BTreeMap::new());
        evaluator.update(&Id::new("cpu", [("host", "h-1")]), 10_000, 1.0);
        evaluator.update(&Id::new("cpu", [("host", "h-2")]), 10_000, 2.0);
        let results = evaluator.eval(10_000, &BTreeMap::new(), &ValidTagCharacters::default());
        assert_eq!(results[0].measurements.len(), 2);
    }
}
