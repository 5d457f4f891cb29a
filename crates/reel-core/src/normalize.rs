//! Name normalization: slugs for near-unique lookup, compact keys for loose matching.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub const SLUG_MAX_LEN: usize = 50;

/// Characters operators and chat exports prefix names with ("@juan", "#1 pick").
pub const NAME_MARKERS: &[char] = &['@', '#', '*', '~'];

/// Separator used by sources that credit one pick to two participants ("Ana - Luis").
pub const CREDIT_DELIMITER: &str = " - ";

const FALLBACK_SLUG: &str = "participant";

fn ascii_fold(name: &str) -> impl Iterator<Item = char> + '_ {
    name.nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
}

/// Lowercase, diacritic-free, `-`-separated slug bounded to [`SLUG_MAX_LEN`] chars.
///
/// Characters that survive decomposition but are not ASCII (e.g. `ß`, emoji)
/// are dropped without introducing a separator.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len().min(SLUG_MAX_LEN + 1));
    let mut pending_separator = false;

    for c in ascii_fold(name) {
        if c.is_ascii_alphanumeric() {
            if pending_separator && !slug.is_empty() {
                slug.push('-');
            }
            pending_separator = false;
            slug.push(c);
        } else if c.is_ascii() {
            pending_separator = true;
        }
    }

    slug.truncate(SLUG_MAX_LEN);
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Lowercase, diacritic-free, alphanumerics only. Loose matching key, never a primary key.
pub fn compact_key(name: &str) -> String {
    ascii_fold(name)
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Trim whitespace and any leading marker characters.
pub fn strip_markers(name: &str) -> &str {
    name.trim().trim_start_matches(NAME_MARKERS).trim()
}

/// Split a jointly credited name into its participants.
pub fn split_credits(raw: &str) -> Vec<&str> {
    raw.split(CREDIT_DELIMITER)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect()
}

/// First free slug derived from `base`: `base`, `base-1`, `base-2`, ...
pub fn unique_slug(base: &str, is_taken: impl Fn(&str) -> bool) -> String {
    let base = if base.is_empty() { FALLBACK_SLUG } else { base };
    if !is_taken(base) {
        return base.to_string();
    }

    let mut n: u32 = 1;
    loop {
        let suffix = format!("-{n}");
        let mut stem = base[..base.len().min(SLUG_MAX_LEN - suffix.len())].to_string();
        while stem.ends_with('-') {
            stem.pop();
        }
        let candidate = format!("{stem}{suffix}");
        if !is_taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn slugify_strips_diacritics_and_collapses_separators() {
        assert_eq!(slugify("Juan Pérez"), "juan-perez");
        assert_eq!(slugify("  --Amélie   Poulain!! "), "amelie-poulain");
        assert_eq!(slugify("O'Brien & Sons"), "o-brien-sons");
        assert_eq!(slugify("Straße"), "strae");
        assert_eq!(slugify("***"), "");
    }

    #[test]
    fn slugify_truncates_without_trailing_separator() {
        let long = format!("{} tail", "a".repeat(49));
        let slug = slugify(&long);
        assert_eq!(slug.len(), 49);
        assert!(!slug.ends_with('-'));

        let longer = "b".repeat(80);
        assert_eq!(slugify(&longer).len(), SLUG_MAX_LEN);
    }

    #[test]
    fn compact_key_drops_every_separator() {
        assert_eq!(compact_key("Juan Pérez"), "juanperez");
        assert_eq!(compact_key("juan-perez"), "juanperez");
        assert_eq!(compact_key("Juan P."), "juanp");
        assert_eq!(compact_key("@juan"), "juan");
    }

    #[test]
    fn normalization_is_deterministic() {
        for name in ["Zoë", "Renée O'Hara", "@@Mx. Kim", ""] {
            assert_eq!(slugify(name), slugify(name));
            assert_eq!(compact_key(name), compact_key(name));
        }
    }

    #[test]
    fn strip_markers_only_touches_the_prefix() {
        assert_eq!(strip_markers("  @juan "), "juan");
        assert_eq!(strip_markers("#*Ana"), "Ana");
        assert_eq!(strip_markers("Ana@home"), "Ana@home");
    }

    #[test]
    fn split_credits_keeps_hyphenated_names_together() {
        assert_eq!(split_credits("Ana - Luis"), vec!["Ana", "Luis"]);
        assert_eq!(split_credits("Jean-Luc"), vec!["Jean-Luc"]);
        assert_eq!(split_credits("Ana - "), vec!["Ana"]);
    }

    #[test]
    fn unique_slug_appends_counter_on_collision() {
        let taken: HashSet<&str> = ["a", "a-1"].into_iter().collect();
        assert_eq!(unique_slug("a", |s| taken.contains(s)), "a-2");
        assert_eq!(unique_slug("b", |s| taken.contains(s)), "b");
        assert_eq!(unique_slug("", |_| false), "participant");

        let long = "c".repeat(SLUG_MAX_LEN);
        let next = unique_slug(&long, |s| s == long);
        assert!(next.len() <= SLUG_MAX_LEN);
        assert!(next.ends_with("-1"));
    }
}
