use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// A single `(key, value)` dimension of an [`Id`].
///
/// Ordering compares the key first, then the value, so that a sorted `[Tag]`
/// slice groups same-key tags together, the invariant the query index
/// relies on when it merges adjacent leaves on the same key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    pub key: Arc<str>,
    pub value: Arc<str>,
}

impl Tag {
    pub fn new(key: impl Into<Arc<str>>, value: impl Into<Arc<str>>) -> Self {
        Tag {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Compares two tag keys the way an [`Id`] orders its dimensions: `"name"`
/// always sorts first, everything else falls back to lexical order.
pub fn compare_keys(a: &str, b: &str) -> Ordering {
    match (a == "name", b == "name") {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.cmp(b),
    }
}

/// An immutable dimensional identity: a `name` plus an ordered, unique-key
/// set of tags. `name` is conceptually the tag with key `"name"`, and always
/// sorts first regardless of its lexical value.
///
/// Cloning an `Id` is cheap, the name and every tag's key/value are
/// `Arc<str>`, so `with_tag`/`with_tags` only allocate a new backing vector,
/// not new string data.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Id {
    name: Arc<str>,
    // Sorted by key (lexical; never contains a tag literally keyed "name"),
    // unique keys, last writer wins on conflicting inserts.
    tags: Arc<[Tag]>,
}

impl Id {
    /// Builds an `Id` from a name and an unordered tag set. Duplicate keys
    /// are resolved last-write-wins, mirroring how the attribute-set
    /// deduplication in the consuming SDK resolves duplicate keys.
    pub fn new<N, K, V, I>(name: N, tags: I) -> Self
    where
        N: Into<Arc<str>>,
        K: Into<Arc<str>>,
        V: Into<Arc<str>>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut vec: Vec<Tag> = tags
            .into_iter()
            .map(|(k, v)| Tag::new(k, v))
            .filter(|t| &*t.key != "name")
            .collect();
        dedup_sorted_by_key(&mut vec);
        Id {
            name: name.into(),
            tags: vec.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Looks up a single dimension's value, including `"name"`.
    pub fn get(&self, key: &str) -> Option<&str> {
        if key == "name" {
            return Some(&self.name);
        }
        self.tags
            .binary_search_by(|t| t.key.as_ref().cmp(key))
            .ok()
            .map(|i| self.tags[i].value.as_ref())
    }

    /// Iterates every dimension, `name` first, then tags in sorted order , 
    /// the traversal order the query index's dispatch algorithm assumes.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        std::iter::once(("name", self.name.as_ref()))
            .chain(self.tags.iter().map(|t| (t.key.as_ref(), t.value.as_ref())))
    }

    /// Returns a new `Id` with one tag set (or `name` replaced, if `key ==
    /// "name"`).
    pub fn with_tag(&self, key: impl Into<Arc<str>>, value: impl Into<Arc<str>>) -> Self {
        let key = key.into();
        let value = value.into();
        if &*key == "name" {
            return Id {
                name: value,
                tags: self.tags.clone(),
            };
        }
        let mut vec = self.tags.to_vec();
        match vec.binary_search_by(|t| t.key.cmp(&key)) {
            Ok(i) => vec[i].value = value,
            Err(i) => vec.insert(i, Tag { key, value }),
        }
        Id {
            name: self.name.clone(),
            tags: vec.into(),
        }
    }

    /// Returns a new `Id` with every `(key, value)` pair applied via
    /// [`Id::with_tag`], in iteration order.
    pub fn with_tags<K, V, I>(&self, tags: I) -> Self
    where
        K: Into<Arc<str>>,
        V: Into<Arc<str>>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut vec = self.tags.to_vec();
        let mut name = self.name.clone();
        for (k, v) in tags {
            let k = k.into();
            let v = v.into();
            if &*k == "name" {
                name = v;
                continue;
            }
            match vec.binary_search_by(|t| t.key.cmp(&k)) {
                Ok(i) => vec[i].value = v,
                Err(i) => vec.insert(i, Tag { key: k, value: v }),
            }
        }
        Id {
            name,
            tags: vec.into(),
        }
    }

    /// Returns a new `Id` keeping only tags whose key satisfies `pred`.
    /// `name` is never dropped, it isn't a tag, it's the identity's root.
    pub fn filter_by_key(&self, mut pred: impl FnMut(&str) -> bool) -> Self {
        let vec: Vec<Tag> = self
            .tags
            .iter()
            .filter(|t| pred(&t.key))
            .cloned()
            .collect();
        Id {
            name: self.name.clone(),
            tags: vec.into(),
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for tag in self.tags.iter() {
            write!(f, ",{}={}", tag.key, tag.value)?;
        }
        Ok(())
    }
}

fn dedup_sorted_by_key(vec: &mut Vec<Tag>) {
    vec.sort_by(|a, b| a.key.cmp(&b.key));
    if vec.len() > 1 {
        let mut i = vec.len() - 1;
        while i != 0 {
            if vec[i - 1].key == vec[i].key {
                vec.remove(i - 1);
            }
            i -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_sorts_first_regardless_of_lexical_value() {
        let id = Id::new("zzz", [("app", "foo"), ("aaa", "bar")]);
        let keys: Vec<&str> = id.entries().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["name", "aaa", "app"]);
    }

    #[test]
    fn duplicate_keys_last_write_wins() {
        let id = Id::new("req", [("app", "a"), ("app", "b")]);
        assert_eq!(id.get("app"), Some("b"));
        assert_eq!(id.tags().len(), 1);
    }

    #[test]
    fn with_tag_replaces_existing_value() {
        let id = Id::new("req", [("app", "a")]);
        let id2 = id.with_tag("app", "b");
        assert_eq!(id2.get("app"), Some("b"));
        assert_eq!(id.get("app"), Some("a"), "original Id is unmodified");
    }

    #[test]
    fn with_tag_on_name_key_replaces_name() {
        let id = Id::new("req", [("app", "a")]);
        let id2 = id.with_tag("name", "other");
        assert_eq!(id2.name(), "other");
    }

    #[test]
    fn filter_by_key_keeps_name() {
        let id = Id::new("req", [("app", "a"), ("host", "h-1")]);
        let filtered = id.filter_by_key(|k| k != "host");
        assert_eq!(filtered.name(), "req");
        assert_eq!(filtered.get("host"), None);
        assert_eq!(filtered.get("app"), Some("a"));
    }

    #[test]
    fn equality_is_full_tuple() {
        let a = Id::new("req", [("app", "a")]);
        let b = Id::new("req", [("app", "a")]);
        let c = Id::new("req", [("app", "b")]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
