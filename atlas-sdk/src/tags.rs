//! Valid-tag-character rewriting (`validTagCharacters`, §6).
//!
//! Both the publish path and the streaming-eval path rewrite tag values
//! before handing them to the transport: any byte outside the configured
//! allowed set becomes `_`. Pulled out into its own tiny module because
//! both call sites need it, rather than duplicating the rewrite per
//! call site.

use atlas_core::Id;

/// A validator over a fixed ASCII allow-set, built once from a pattern like
/// `A-Za-z0-9._-` and then reused for every rewrite.
#[derive(Debug, Clone)]
pub struct ValidTagCharacters {
    allowed: [bool; 128],
}

impl Default for ValidTagCharacters {
    fn default() -> Self {
        ValidTagCharacters::parse("A-Za-z0-9._-")
    }
}

impl ValidTagCharacters {
    /// Parses a character-class pattern of the form `A-Za-z0-9._-`: ranges
    /// (`a-z`) and single characters are both accepted.
    pub fn parse(pattern: &str) -> Self {
        let mut allowed = [false; 128];
        let chars: Vec<char> = pattern.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            if i + 2 < chars.len() && chars[i + 1] == '-' {
                let (lo, hi) = (chars[i] as u32, chars[i + 2] as u32);
                for c in lo..=hi {
                    if let Some(ch) = char::from_u32(c) {
                        if ch.is_ascii() {
                            allowed[ch as usize] = true;
                        }
                    }
                }
                i += 3;
            } else {
                if chars[i].is_ascii() {
                    allowed[chars[i] as usize] = true;
                }
                i += 1;
            }
        }
        ValidTagCharacters { allowed }
    }

    pub fn is_allowed(&self, c: char) -> bool {
        c.is_ascii() && self.allowed[c as usize]
    }

    /// Replaces every disallowed byte in `value` with `_`. Returns a
    /// `Cow`-free owned `String` only when a rewrite is actually needed by
    /// checking first, avoiding an allocation on the (common) fully-valid
    /// path.
    pub fn rewrite(&self, value: &str) -> String {
        if value.chars().all(|c| self.is_allowed(c)) {
            return value.to_string();
        }
        value
            .chars()
            .map(|c| if self.is_allowed(c) { c } else { '_' })
            .collect()
    }

    /// Rewrites every tag value (not key) of `id`, leaving `name` untouched
    ///, Atlas names are validated independently and are typically
    /// hand-chosen constants, not user-controlled dimension values.
    pub fn rewrite_id(&self, id: &Id) -> Id {
        id.with_tags(
            id.tags()
                .iter()
                .map(|t| (t.key.clone(), self.rewrite(&t.value))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_allows_common_metric_characters() {
        let v = ValidTagCharacters::default();
        assert_eq!(v.rewrite("abc.123_x-Y"), "abc.123_x-Y");
    }

    #[test]
    fn disallowed_characters_become_underscore() {
        let v = ValidTagCharacters::default();
        assert_eq!(v.rewrite("a b/c"), "a_b_c");
    }

    #[test]
    fn rewrite_id_leaves_name_alone() {
        let v = ValidTagCharacters::default();
        let id = Id::new("my name", [("host", "h 1")]);
        let rewritten = v.rewrite_id(&id);
        assert_eq!(rewritten.name(), "my name");
        assert_eq!(rewritten.get("host"), Some("h_1"));
    }
}
