//! The query predicate tree (component E) and its leaf types.
//!
//! A `Query` is evaluated against an [`Id`] to decide whether a
//! subscription or rollup rule applies to a datapoint. The tree is kept
//! intentionally small and total: there is no way to construct a `Query`
//! that fails to evaluate, so `matches` never returns a `Result`.

use std::fmt;
use std::sync::Arc;

use atlas_core::Id;
use regex::Regex;

/// A leaf predicate over a single tag key. Every variant names exactly one
/// key, which is what lets [`crate::query::index::QueryIndex`] dispatch on
/// that key without inspecting the rest of the expression.
#[derive(Clone)]
pub enum Leaf {
    Has(Arc<str>),
    Equal(Arc<str>, Arc<str>),
    In(Arc<str>, Arc<[Arc<str>]>),
    LessThan(Arc<str>, Arc<str>),
    LessThanEqual(Arc<str>, Arc<str>),
    GreaterThan(Arc<str>, Arc<str>),
    GreaterThanEqual(Arc<str>, Arc<str>),
    Regex {
        key: Arc<str>,
        pattern: Arc<str>,
        case_insensitive: bool,
        compiled: Arc<Regex>,
    },
}

impl Leaf {
    pub fn key(&self) -> &str {
        match self {
            Leaf::Has(k)
            | Leaf::Equal(k, _)
            | Leaf::LessThan(k, _)
            | Leaf::LessThanEqual(k, _)
            | Leaf::GreaterThan(k, _)
            | Leaf::GreaterThanEqual(k, _)
            | Leaf::In(k, _) => k,
            Leaf::Regex { key, .. } => key,
        }
    }

    /// The literal prefix a regex is anchored on, used by the query index
    /// to skip leaves whose prefix cannot possibly match a given value.
    /// Non-regex leaves have no useful prefix and always report `""`.
    pub fn literal_prefix(&self) -> &str {
        match self {
            Leaf::Regex { pattern, .. } => {
                let bytes = pattern.as_bytes();
                let mut end = 0;
                while end < bytes.len() && is_regex_literal_byte(bytes[end]) {
                    end += 1;
                }
                &pattern[..end]
            }
            _ => "",
        }
    }

    pub fn matches_value(&self, value: Option<&str>) -> bool {
        match self {
            Leaf::Has(_) => value.is_some(),
            Leaf::Equal(_, v) => value == Some(v.as_ref()),
            Leaf::In(_, set) => match value {
                Some(v) => set.iter().any(|candidate| candidate.as_ref() == v),
                None => false,
            },
            Leaf::LessThan(_, bound) => value.is_some_and(|v| v < bound.as_ref()),
            Leaf::LessThanEqual(_, bound) => value.is_some_and(|v| v <= bound.as_ref()),
            Leaf::GreaterThan(_, bound) => value.is_some_and(|v| v > bound.as_ref()),
            Leaf::GreaterThanEqual(_, bound) => value.is_some_and(|v| v >= bound.as_ref()),
            Leaf::Regex { compiled, .. } => value.is_some_and(|v| compiled.is_match(v)),
        }
    }
}

fn is_regex_literal_byte(b: u8) -> bool {
    !matches!(
        b,
        b'.' | b'*'
            | b'+'
            | b'?'
            | b'('
            | b')'
            | b'['
            | b']'
            | b'{'
            | b'}'
            | b'|'
            | b'^'
            | b'$'
            | b'\\'
    )
}

impl PartialEq for Leaf {
    /// Structural equality for index bookkeeping (matching a `remove` call
    /// back to the leaf an earlier `add` registered). Compiled regexes
    /// compare by source pattern and case-sensitivity, not by identity.
    fn eq(&self, other: &Self) -> bool {
        use Leaf::*;
        match (self, other) {
            (Has(a), Has(b)) => a == b,
            (Equal(ak, av), Equal(bk, bv)) => ak == bk && av == bv,
            (In(ak, av), In(bk, bv)) => ak == bk && av == bv,
            (LessThan(ak, av), LessThan(bk, bv)) => ak == bk && av == bv,
            (LessThanEqual(ak, av), LessThanEqual(bk, bv)) => ak == bk && av == bv,
            (GreaterThan(ak, av), GreaterThan(bk, bv)) => ak == bk && av == bv,
            (GreaterThanEqual(ak, av), GreaterThanEqual(bk, bv)) => ak == bk && av == bv,
            (
                Regex { key: ak, pattern: ap, case_insensitive: aci, .. },
                Regex { key: bk, pattern: bp, case_insensitive: bci, .. },
            ) => ak == bk && ap == bp && aci == bci,
            _ => false,
        }
    }
}

impl fmt::Debug for Leaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leaf::Has(k) => write!(f, "Has({k})"),
            Leaf::Equal(k, v) => write!(f, "Equal({k},{v})"),
            Leaf::In(k, vs) => write!(f, "In({k},{vs:?})"),
            Leaf::LessThan(k, v) => write!(f, "LessThan({k},{v})"),
            Leaf::LessThanEqual(k, v) => write!(f, "LessThanEqual({k},{v})"),
            Leaf::GreaterThan(k, v) => write!(f, "GreaterThan({k},{v})"),
            Leaf::GreaterThanEqual(k, v) => write!(f, "GreaterThanEqual({k},{v})"),
            Leaf::Regex { key, pattern, .. } => write!(f, "Regex({key},{pattern})"),
        }
    }
}

/// The full predicate tree: boolean connectives over [`Leaf`] predicates.
#[derive(Clone, Debug)]
pub enum Query {
    True,
    False,
    And(Box<Query>, Box<Query>),
    Or(Box<Query>, Box<Query>),
    Not(Box<Query>),
    Leaf(Leaf),
}

impl Query {
    pub fn matches(&self, id: &Id) -> bool {
        match self {
            Query::True => true,
            Query::False => false,
            Query::And(a, b) => a.matches(id) && b.matches(id),
            Query::Or(a, b) => a.matches(id) || b.matches(id),
            Query::Not(q) => !q.matches(id),
            Query::Leaf(l) => l.matches_value(id.get(l.key())),
        }
    }

    /// The tag key a leaf-shaped query (a bare leaf, or a negated leaf)
    /// names, or `None` for `True`/`False`/unresolved `And`/`Or` nodes.
    /// Every member of an AND-chain produced by `dnf_list` + `and_list` is
    /// leaf-shaped except `True`/`False`, which is what lets the query
    /// index dispatch purely on keys.
    pub fn leaf_key(&self) -> Option<&str> {
        match self {
            Query::Leaf(l) => Some(l.key()),
            Query::Not(inner) => inner.leaf_key(),
            _ => None,
        }
    }

    /// Evaluates this leaf-shaped query (see [`Query::leaf_key`]) against a
    /// single resolved value. Panics if called on a non-leaf-shaped query;
    /// callers only invoke this after confirming `leaf_key().is_some()`.
    pub fn matches_leaf_value(&self, value: Option<&str>) -> bool {
        match self {
            Query::Leaf(l) => l.matches_value(value),
            Query::Not(inner) => !inner.matches_leaf_value(value),
            other => panic!("matches_leaf_value called on non-leaf query {other:?}"),
        }
    }

    /// Substitutes `True`/`False` for leaves whose key is resolved by
    /// `common`, then algebraically folds the result: `True ∧ q ≡ q`,
    /// `False ∧ q ≡ False`, and the Or-dual.
    pub fn simplify(&self, common: &dyn Fn(&str) -> Option<&str>) -> Query {
        match self {
            Query::True => Query::True,
            Query::False => Query::False,
            Query::Not(q) => match q.simplify(common) {
                Query::True => Query::False,
                Query::False => Query::True,
                other => Query::Not(Box::new(other)),
            },
            Query::And(a, b) => {
                let a = a.simplify(common);
                let b = b.simplify(common);
                match (a, b) {
                    (Query::False, _) | (_, Query::False) => Query::False,
                    (Query::True, x) | (x, Query::True) => x,
                    (a, b) => Query::And(Box::new(a), Box::new(b)),
                }
            }
            Query::Or(a, b) => {
                let a = a.simplify(common);
                let b = b.simplify(common);
                match (a, b) {
                    (Query::True, _) | (_, Query::True) => Query::True,
                    (Query::False, x) | (x, Query::False) => x,
                    (a, b) => Query::Or(Box::new(a), Box::new(b)),
                }
            }
            Query::Leaf(l) => match common(l.key()) {
                Some(v) => {
                    if l.matches_value(Some(v)) {
                        Query::True
                    } else {
                        Query::False
                    }
                }
                None => Query::Leaf(l.clone()),
            },
        }
    }

    /// Pushes negation down to the leaves (De Morgan), leaving only
    /// `Not(Leaf(_))` as a possible negation.
    fn to_nnf(&self, negate: bool) -> Query {
        match self {
            Query::True => {
                if negate {
                    Query::False
                } else {
                    Query::True
                }
            }
            Query::False => {
                if negate {
                    Query::True
                } else {
                    Query::False
                }
            }
            Query::Not(inner) => inner.to_nnf(!negate),
            Query::And(a, b) => {
                let (a, b) = (a.to_nnf(negate), b.to_nnf(negate));
                if negate {
                    Query::Or(Box::new(a), Box::new(b))
                } else {
                    Query::And(Box::new(a), Box::new(b))
                }
            }
            Query::Or(a, b) => {
                let (a, b) = (a.to_nnf(negate), b.to_nnf(negate));
                if negate {
                    Query::And(Box::new(a), Box::new(b))
                } else {
                    Query::Or(Box::new(a), Box::new(b))
                }
            }
            Query::Leaf(l) => {
                if negate {
                    Query::Not(Box::new(Query::Leaf(l.clone())))
                } else {
                    Query::Leaf(l.clone())
                }
            }
        }
    }

    fn expand_dnf(&self) -> Vec<Query> {
        match self {
            Query::Or(a, b) => {
                let mut out = a.expand_dnf();
                out.extend(b.expand_dnf());
                out
            }
            Query::And(a, b) => {
                let left = a.expand_dnf();
                let right = b.expand_dnf();
                let mut out = Vec::with_capacity(left.len() * right.len().max(1));
                for l in &left {
                    for r in &right {
                        out.push(Query::And(Box::new(l.clone()), Box::new(r.clone())));
                    }
                }
                out
            }
            other => vec![other.clone()],
        }
    }

    /// Expands `¬(a∧b)` to `¬a ∨ ¬b` and `¬(a∨b)` to `¬a ∧ ¬b`, returning
    /// the resulting disjunction as a list of AND-chains (each chain
    /// itself a `Query`, flatten with `and_list`).
    pub fn dnf_list(&self) -> Vec<Query> {
        self.to_nnf(false).expand_dnf()
    }

    /// Flattens a top-level `And` chain into its members, left to right.
    pub fn and_list(&self) -> Vec<Query> {
        match self {
            Query::And(a, b) => {
                let mut out = a.and_list();
                out.extend(b.and_list());
                out
            }
            other => vec![other.clone()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eq(k: &str, v: &str) -> Query {
        Query::Leaf(Leaf::Equal(k.into(), v.into()))
    }

    #[test]
    fn matches_evaluates_boolean_connectives() {
        let id = Id::new("foo", [("app", "x"), ("host", "h-1")]);
        let q = Query::And(Box::new(eq("name", "foo")), Box::new(eq("app", "x")));
        assert!(q.matches(&id));
        let q2 = Query::Not(Box::new(eq("app", "y")));
        assert!(q2.matches(&id));
    }

    #[test]
    fn simplify_constant_folds_common_tag_keys() {
        let q = Query::And(Box::new(eq("name", "foo")), Box::new(eq("app", "x")));
        let simplified = q.simplify(&|k| if k == "name" { Some("foo") } else { None });
        assert!(matches!(simplified, Query::Leaf(_)));
    }

    #[test]
    fn simplify_short_circuits_and_to_false() {
        let q = Query::And(Box::new(eq("name", "foo")), Box::new(eq("app", "x")));
        let simplified = q.simplify(&|k| if k == "name" { Some("bar") } else { None });
        assert!(matches!(simplified, Query::False));
    }

    #[test]
    fn dnf_list_distributes_and_over_or() {
        let q = Query::And(
            Box::new(Query::Or(Box::new(eq("a", "1")), Box::new(eq("a", "2")))),
            Box::new(eq("b", "x")),
        );
        let chains = q.dnf_list();
        assert_eq!(chains.len(), 2);
        for chain in &chains {
            let members = chain.and_list();
            assert_eq!(members.len(), 2);
        }
    }

    #[test]
    fn dnf_list_pushes_negation_to_leaves() {
        let q = Query::Not(Box::new(Query::And(
            Box::new(eq("a", "1")),
            Box::new(eq("b", "2")),
        )));
        let chains = q.dnf_list();
        assert_eq!(chains.len(), 2);
        assert!(chains
            .iter()
            .all(|c| matches!(c, Query::Not(inner) if matches!(**inner, Query::Leaf(_)))));
    }

    #[test]
    fn leaf_key_sees_through_negation() {
        let q = Query::Not(Box::new(eq("host", "h-1")));
        assert_eq!(q.leaf_key(), Some("host"));
        assert!(!q.matches_leaf_value(Some("h-1")));
        assert!(q.matches_leaf_value(Some("h-2")));
    }

    #[test]
    fn literal_prefix_stops_at_first_metacharacter() {
        let leaf = Leaf::Regex {
            key: "host".into(),
            pattern: "i-abc.*".into(),
            case_insensitive: false,
            compiled: Arc::new(Regex::new("i-abc.*").unwrap()),
        };
        assert_eq!(leaf.literal_prefix(), "i-abc");
    }
}
