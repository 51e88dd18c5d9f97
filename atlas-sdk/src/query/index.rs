//! A prefix/equality-partitioned tree that answers "which subscriptions
//! match this id?" in sub-linear time (component E's dispatcher).
//!
//! The tree discriminates one tag key per level. `add` walks each
//! disjunctive-normal-form AND-chain of a query, sorts its members by key
//! (name-first), groups adjacent same-key members into a single predicate,
//! and inserts that chain one key-level at a time. `for_each_match` walks
//! an id's tags in the same order, descending through whichever branches
//! the id's tag values select, and additionally through the two branches
//! that don't key off the current tag at all (`other_keys_idx`,
//! `missing_keys_idx`) so that queries naming a key this id lacks, or a key
//! this node doesn't discriminate on, are still reached.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use atlas_core::{compare_keys, Id};

use super::ast::{Leaf, Query};
use super::lfu::LfuCache;
use super::prefix_tree::PrefixTree;

/// One key-level predicate: either a single leaf-shaped query (`Leaf` or
/// `Not(Leaf)`) or several merged into an `And` chain when a chain has more
/// than one predicate on the same key (e.g. `host > a AND host < z`).
#[derive(Clone, Debug)]
struct Predicate {
    key: Arc<str>,
    query: Query,
}

impl Predicate {
    fn equal_value(&self) -> Option<&str> {
        match &self.query {
            Query::Leaf(Leaf::Equal(_, v)) => Some(v),
            _ => None,
        }
    }

    fn is_has(&self) -> bool {
        matches!(self.query, Query::Leaf(Leaf::Has(_)))
    }

    /// The literal prefix this predicate is anchored on, for narrowing the
    /// regex/other-check fan-out scan. Only a single `Regex` leaf has a
    /// useful prefix; everything else (composites included) registers at
    /// the root so the linear scan still finds it.
    fn literal_prefix(&self) -> &str {
        match &self.query {
            Query::Leaf(l) => l.literal_prefix(),
            _ => "",
        }
    }

    fn matches_value(&self, value: Option<&str>) -> bool {
        matches_value_deep(&self.query, value)
    }
}

/// Evaluates `q` against a single resolved tag value, treating every leaf
/// in `q` as referring to that same key, valid for both a lone leaf and a
/// same-key `And`/`Or`/`Not` composite, which is all `Predicate` ever
/// builds.
fn matches_value_deep(q: &Query, value: Option<&str>) -> bool {
    match q {
        Query::True => true,
        Query::False => false,
        Query::Not(inner) => !matches_value_deep(inner, value),
        Query::And(a, b) => matches_value_deep(a, value) && matches_value_deep(b, value),
        Query::Or(a, b) => matches_value_deep(a, value) || matches_value_deep(b, value),
        Query::Leaf(l) => l.matches_value(value),
    }
}

/// Flattens one AND-chain into a sorted, key-grouped predicate list. A
/// chain containing `False` can never match any id and is dropped
/// entirely; `True` members are unconditionally satisfied and dropped from
/// the list (they contribute no discrimination).
fn chain_to_predicates(chain: &Query) -> Option<Vec<Predicate>> {
    let members = chain.and_list();
    if members.iter().any(|m| matches!(m, Query::False)) {
        return None;
    }
    let mut leaves: Vec<Query> = members.into_iter().filter(|m| !matches!(m, Query::True)).collect();
    leaves.sort_by(|a, b| compare_keys(a.leaf_key().unwrap_or(""), b.leaf_key().unwrap_or("")));

    let mut predicates: Vec<Predicate> = Vec::new();
    for leaf in leaves {
        let key: Arc<str> = leaf.leaf_key().unwrap_or("").into();
        match predicates.last_mut() {
            Some(last) if last.key == key => {
                last.query = Query::And(Box::new(last.query.clone()), Box::new(leaf));
            }
            _ => predicates.push(Predicate { key, query: leaf }),
        }
    }
    Some(predicates)
}

#[derive(Debug)]
struct Node<T> {
    key: Option<Arc<str>>,
    equal_checks: HashMap<Arc<str>, Box<Node<T>>>,
    other_checks: Vec<(Predicate, Box<Node<T>>)>,
    other_checks_cache: LfuCache<String, Vec<usize>>,
    prefix_tree: PrefixTree<usize>,
    has_key_idx: Option<Box<Node<T>>>,
    other_keys_idx: Option<Box<Node<T>>>,
    missing_keys_idx: Option<Box<Node<T>>>,
    matches: Vec<T>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Node {
            key: None,
            equal_checks: HashMap::new(),
            other_checks: Vec::new(),
            other_checks_cache: LfuCache::new(256),
            prefix_tree: PrefixTree::new(),
            has_key_idx: None,
            other_keys_idx: None,
            missing_keys_idx: None,
            matches: Vec::new(),
        }
    }
}

impl<T: Clone + PartialEq> Node<T> {
    fn is_empty(&self) -> bool {
        self.matches.is_empty()
            && self.equal_checks.is_empty()
            && self.other_checks.is_empty()
            && self.has_key_idx.is_none()
            && self.other_keys_idx.is_none()
            && self.missing_keys_idx.is_none()
    }

    fn insert(&mut self, members: &[Predicate], value: T) {
        let Some((first, rest)) = members.split_first() else {
            if !self.matches.contains(&value) {
                self.matches.push(value);
            }
            return;
        };
        if self.key.is_none() {
            self.key = Some(first.key.clone());
        }
        if self.key.as_deref() == Some(first.key.as_ref()) {
            if let Some(v) = first.equal_value() {
                self.equal_checks
                    .entry(v.into())
                    .or_default()
                    .insert(rest, value);
            } else if first.is_has() {
                self.has_key_idx.get_or_insert_with(Default::default).insert(rest, value);
            } else {
                let idx = self.other_checks.len();
                self.prefix_tree.insert(first.literal_prefix(), idx);
                self.other_checks.push((first.clone(), Box::default()));
                self.other_checks.last_mut().unwrap().1.insert(rest, value.clone());
                if first.matches_value(None) {
                    self.missing_keys_idx
                        .get_or_insert_with(Default::default)
                        .insert(rest, value);
                }
                self.other_checks_cache = LfuCache::new(256);
            }
        } else {
            self.other_keys_idx
                .get_or_insert_with(Default::default)
                .insert(members, value);
        }
    }

    /// Returns `true` if this node became empty and the caller should drop
    /// its reference to it.
    fn remove(&mut self, members: &[Predicate], value: &T) -> bool {
        let Some((first, rest)) = members.split_first() else {
            self.matches.retain(|v| v != value);
            return self.is_empty();
        };
        if self.key.as_deref() != Some(first.key.as_ref()) {
            let empty = match &mut self.other_keys_idx {
                Some(child) => child.remove(members, value),
                None => false,
            };
            if empty {
                self.other_keys_idx = None;
            }
            return self.is_empty();
        }
        if let Some(v) = first.equal_value() {
            if let Some(child) = self.equal_checks.get_mut(v) {
                if child.remove(rest, value) {
                    self.equal_checks.remove(v);
                }
            }
        } else if first.is_has() {
            let empty = match &mut self.has_key_idx {
                Some(child) => child.remove(rest, value),
                None => false,
            };
            if empty {
                self.has_key_idx = None;
            }
        } else if let Some(pos) = self.other_checks.iter().position(|(p, _)| {
            p.key == first.key && format!("{:?}", p.query) == format!("{:?}", first.query)
        }) {
            let empty = self.other_checks[pos].1.remove(rest, value);
            if empty {
                self.prefix_tree.remove(first.literal_prefix(), &pos);
                self.other_checks.remove(pos);
                self.other_checks_cache = LfuCache::new(256);
            }
            if first.matches_value(None) {
                let empty = match &mut self.missing_keys_idx {
                    Some(child) => child.remove(rest, value),
                    None => false,
                };
                if empty {
                    self.missing_keys_idx = None;
                }
            }
        }
        self.is_empty()
    }

    fn dispatch(&self, id: &Id, start_idx: usize, sink: &mut dyn FnMut(&T)) {
        for v in &self.matches {
            sink(v);
        }
        let entries: Vec<(&str, &str)> = id.entries().collect();
        let mut found_at: Option<(usize, &str)> = None;
        if let Some(key) = &self.key {
            let mut idx = start_idx;
            while idx < entries.len() {
                let (k, v) = entries[idx];
                match compare_keys(k, key) {
                    std::cmp::Ordering::Equal => {
                        found_at = Some((idx, v));
                        break;
                    }
                    std::cmp::Ordering::Greater => break,
                    std::cmp::Ordering::Less => idx += 1,
                }
            }

            if let Some((match_idx, value)) = found_at {
                let next_idx = match_idx + 1;
                if let Some(child) = self.equal_checks.get(value) {
                    child.dispatch(id, next_idx, sink);
                }

                if let Some(indices) = self.other_checks_cache.get(&value.to_string()) {
                    for i in &indices {
                        self.other_checks[*i].1.dispatch(id, next_idx, sink);
                    }
                } else {
                    let candidates = self.prefix_tree.matching(value);
                    let mut hits = Vec::new();
                    for i in candidates {
                        if self.other_checks[i].0.matches_value(Some(value)) {
                            hits.push(i);
                        }
                    }
                    for &i in &hits {
                        self.other_checks[i].1.dispatch(id, next_idx, sink);
                    }
                    self.other_checks_cache.insert(value.to_string(), hits);
                }

                if let Some(child) = &self.has_key_idx {
                    child.dispatch(id, start_idx, sink);
                }
            }
        }

        if let Some(child) = &self.other_keys_idx {
            child.dispatch(id, start_idx, sink);
        }

        if found_at.is_none() {
            if let Some(child) = &self.missing_keys_idx {
                child.dispatch(id, start_idx, sink);
            }
        }
    }
}

/// A discriminating trie over ids' tag keys that answers "which
/// subscriptions match this id?" without scanning every registered query.
///
/// Reads (`for_each_match`) take a shared reference and need no external
/// synchronization beyond what `T`'s clone requires; writes (`add`/
/// `remove`) take `&mut self` and are expected to be serialized by the
/// owning evaluator's single writer lock, per the design's concurrency
/// model.
#[derive(Debug)]
pub struct QueryIndex<T> {
    root: Node<T>,
}

impl<T> Default for QueryIndex<T> {
    fn default() -> Self {
        QueryIndex { root: Node::default() }
    }
}

impl<T: Clone + PartialEq + Eq + Hash> QueryIndex<T> {
    pub fn new() -> Self {
        QueryIndex::default()
    }

    /// Registers `value` under every AND-chain of `query`'s disjunctive
    /// normal form.
    pub fn add(&mut self, query: &Query, value: T) {
        for chain in query.dnf_list() {
            if let Some(predicates) = chain_to_predicates(&chain) {
                self.root.insert(&predicates, value.clone());
            }
        }
    }

    /// Removes `value` from every chain it was registered under. A
    /// mismatched `(query, value)` pair that was never added is a no-op.
    pub fn remove(&mut self, query: &Query, value: &T) {
        for chain in query.dnf_list() {
            if let Some(predicates) = chain_to_predicates(&chain) {
                self.root.remove(&predicates, value);
            }
        }
    }

    /// Invokes `sink` once for every value whose query matches `id`.
    /// Duplicate invocations for a value registered under more than one
    /// chain of the same query are possible if the caller's `sink` doesn't
    /// dedupe; `Evaluator` callers pass a `HashSet`-backed consumer for
    /// exactly this reason.
    pub fn for_each_match(&self, id: &Id, sink: &mut dyn FnMut(&T)) {
        self.root.dispatch(id, 0, sink);
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

/// Thread-safe wrapper used by the evaluator: reads take a shared lock
/// (many dispatches may run concurrently), writes take an exclusive lock
/// and are additionally serialized by the evaluator's own writer mutex.
#[derive(Debug, Default)]
pub struct SharedQueryIndex<T> {
    inner: RwLock<QueryIndex<T>>,
}

impl<T: Clone + PartialEq + Eq + Hash> SharedQueryIndex<T> {
    pub fn new() -> Self {
        SharedQueryIndex {
            inner: RwLock::new(QueryIndex::new()),
        }
    }

    pub fn add(&self, query: &Query, value: T) {
        if let Ok(mut guard) = self.inner.write() {
            guard.add(query, value);
        }
    }

    pub fn remove(&self, query: &Query, value: &T) {
        if let Ok(mut guard) = self.inner.write() {
            guard.remove(query, value);
        }
    }

    pub fn for_each_match(&self, id: &Id, sink: &mut dyn FnMut(&T)) {
        if let Ok(guard) = self.inner.read() {
            guard.for_each_match(id, sink);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::parse_query;

    #[test]
    fn matches_conjunction_of_equalities() {
        let mut idx: QueryIndex<&'static str> = QueryIndex::new();
        let q = parse_query("name,foo,:eq,app,x,:eq,:and").unwrap();
        idx.add(&q, "s1");

        let id = Id::new("foo", [("app", "x"), ("host", "h-1")]);
        let mut hits = Vec::new();
        idx.for_each_match(&id, &mut |v| hits.push(*v));
        assert_eq!(hits, vec!["s1"]);

        let id2 = Id::new("foo", [("app", "y")]);
        let mut hits2 = Vec::new();
        idx.for_each_match(&id2, &mut |v| hits2.push(*v));
        assert!(hits2.is_empty());
    }

    #[test]
    fn query_index_soundness_and_completeness_scenario() {
        // S1 = name=foo AND app=x; S2 = name=foo AND host ~ ^h-
        let mut idx: QueryIndex<&'static str> = QueryIndex::new();
        let s1 = parse_query("name,foo,:eq,app,x,:eq,:and").unwrap();
        let s2 = parse_query("name,foo,:eq,host,^h-,:re,:and").unwrap();
        idx.add(&s1, "S1");
        idx.add(&s2, "S2");

        let both = Id::new("foo", [("app", "x"), ("host", "h-1")]);
        let mut hits: Vec<&str> = Vec::new();
        idx.for_each_match(&both, &mut |v| hits.push(*v));
        hits.sort_unstable();
        assert_eq!(hits, vec!["S1", "S2"]);

        let only_s2 = Id::new("foo", [("app", "y"), ("host", "h-1")]);
        let mut hits2: Vec<&str> = Vec::new();
        idx.for_each_match(&only_s2, &mut |v| hits2.push(*v));
        assert_eq!(hits2, vec!["S2"]);
    }

    #[test]
    fn remove_forgets_a_registered_query() {
        let mut idx: QueryIndex<&'static str> = QueryIndex::new();
        let q = parse_query("name,foo,:eq").unwrap();
        idx.add(&q, "s1");
        idx.remove(&q, &"s1");

        let id = Id::new("foo", []);
        let mut hits = Vec::new();
        idx.for_each_match(&id, &mut |v| hits.push(*v));
        assert!(hits.is_empty());
        assert!(idx.is_empty());
    }

    #[test]
    fn has_query_matches_any_value_for_the_key() {
        let mut idx: QueryIndex<&'static str> = QueryIndex::new();
        let q = parse_query("host,:has").unwrap();
        idx.add(&q, "s1");

        let with_host = Id::new("x", [("host", "anything")]);
        let mut hits = Vec::new();
        idx.for_each_match(&with_host, &mut |v| hits.push(*v));
        assert_eq!(hits, vec!["s1"]);

        let without_host = Id::new("x", []);
        let mut hits2 = Vec::new();
        idx.for_each_match(&without_host, &mut |v| hits2.push(*v));
        assert!(hits2.is_empty());
    }

    #[test]
    fn negated_query_matches_ids_missing_the_key() {
        let mut idx: QueryIndex<&'static str> = QueryIndex::new();
        let q = parse_query("env,prod,:eq,:not").unwrap();
        idx.add(&q, "s1");

        let missing = Id::new("x", []);
        let mut hits = Vec::new();
        idx.for_each_match(&missing, &mut |v| hits.push(*v));
        assert_eq!(hits, vec!["s1"]);

        let other_value = Id::new("x", [("env", "staging")]);
        let mut hits2 = Vec::new();
        idx.for_each_match(&other_value, &mut |v| hits2.push(*v));
        assert_eq!(hits2, vec!["s1"]);

        let prod = Id::new("x", [("env", "prod")]);
        let mut hits3 = Vec::new();
        idx.for_each_match(&prod, &mut |v| hits3.push(*v));
        assert!(hits3.is_empty());
    }
}
