use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Joins translation, book, chapter and verse number.
pub const PRIMARY_SEPARATOR: char = ':';
/// Introduces the suffix segment. Omitted entirely for an empty suffix.
pub const SUFFIX_SEPARATOR: char = '#';

/// The natural key of a verse within the corpus.
///
/// The derived ordering is the corpus ordering: book, chapter, verse number,
/// then suffix compared bytewise with the empty suffix first.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub struct NaturalKey {
    pub translation: String,
    pub book: u32,
    pub chapter: u32,
    pub verse: u32,
    #[serde(default)]
    pub suffix: String,
}

impl NaturalKey {
    /// Build a validated natural key.
    ///
    /// Rejects segments that could not round-trip through a [`VerseId`]:
    /// separators, whitespace, control characters, an empty translation
    /// code, and a zero book or chapter number.
    pub fn new(
        translation: &str,
        book: u32,
        chapter: u32,
        verse: u32,
        suffix: &str,
    ) -> Result<Self> {
        validate_segment("translation", translation, false)?;
        validate_segment("suffix", suffix, true)?;
        if book == 0 {
            return Err(Error::InvalidKey {
                field: "book",
                reason: "book numbers start at 1".into(),
            });
        }
        if chapter == 0 {
            return Err(Error::InvalidKey {
                field: "chapter",
                reason: "chapter numbers start at 1".into(),
            });
        }

        Ok(Self {
            translation: translation.to_string(),
            book,
            chapter,
            verse,
            suffix: suffix.to_string(),
        })
    }

    /// Key of the chapter this verse belongs to.
    pub fn chapter_key(&self) -> (&str, u32, u32) {
        (&self.translation, self.book, self.chapter)
    }
}

fn validate_segment(
    field: &'static str,
    value: &str,
    allow_empty: bool,
) -> Result<()> {
    if value.is_empty() {
        if allow_empty {
            return Ok(());
        }
        return Err(Error::InvalidKey {
            field,
            reason: "must not be empty".into(),
        });
    }
    if let Some(bad) = value.chars().find(|c| {
        *c == PRIMARY_SEPARATOR
            || *c == SUFFIX_SEPARATOR
            || c.is_whitespace()
            || c.is_control()
    }) {
        return Err(Error::InvalidKey {
            field,
            reason: format!("{value:?} contains reserved character {bad:?}"),
        });
    }
    Ok(())
}

/// The canonical identifier of a verse, e.g. `KJV:43:3:16` or
/// `KJV:43:3:16#a`.
///
/// Constructed exactly once, when the verse row is created, and stored
/// alongside it. Everything downstream (embeddings, bucket membership,
/// the lexical index) refers to verses by this value.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct VerseId(String);

impl VerseId {
    /// Derive the identifier from a validated natural key.
    ///
    /// # Examples
    ///
    /// ```
    /// use versedb::verse_id::{NaturalKey, VerseId};
    ///
    /// let key = NaturalKey::new("KJV", 43, 3, 16, "").unwrap();
    /// assert_eq!(VerseId::from_key(&key).as_str(), "KJV:43:3:16");
    ///
    /// let split = NaturalKey::new("KJV", 43, 3, 16, "a").unwrap();
    /// assert_eq!(VerseId::from_key(&split).as_str(), "KJV:43:3:16#a");
    /// ```
    pub fn from_key(key: &NaturalKey) -> Self {
        let mut id = format!(
            "{}{sep}{}{sep}{}{sep}{}",
            key.translation,
            key.book,
            key.chapter,
            key.verse,
            sep = PRIMARY_SEPARATOR,
        );
        if !key.suffix.is_empty() {
            id.push(SUFFIX_SEPARATOR);
            id.push_str(&key.suffix);
        }
        Self(id)
    }

    /// Parse a stored identifier back into its natural key.
    ///
    /// Only canonical spellings are accepted: `KJV:01:1:1` or a trailing
    /// `#` with no suffix are rejected because [`VerseId::from_key`] never
    /// produces them.
    pub fn parse(raw: &str) -> Result<NaturalKey> {
        let invalid = |reason: &str| Error::InvalidKey {
            field: "verse_id",
            reason: format!("{raw:?}: {reason}"),
        };

        let (primary, suffix) = match raw.split_once(SUFFIX_SEPARATOR) {
            Some((primary, suffix)) => (primary, suffix),
            None => (raw, ""),
        };

        let parts: Vec<&str> = primary.split(PRIMARY_SEPARATOR).collect();
        let &[translation, book, chapter, verse] = parts.as_slice() else {
            return Err(invalid("expected four primary segments"));
        };
        let number = |s: &str| {
            s.parse::<u32>().map_err(|_| invalid("non-numeric segment"))
        };

        let key = NaturalKey::new(
            translation,
            number(book)?,
            number(chapter)?,
            number(verse)?,
            suffix,
        )?;
        if Self::from_key(&key).0 != raw {
            return Err(invalid("not in canonical form"));
        }
        Ok(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<&NaturalKey> for VerseId {
    fn from(key: &NaturalKey) -> Self {
        Self::from_key(key)
    }
}

impl std::fmt::Display for VerseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn key(suffix: &str) -> NaturalKey {
        NaturalKey::new("KJV", 43, 3, 16, suffix).unwrap()
    }

    #[test]
    fn deterministic() {
        assert_eq!(VerseId::from_key(&key("")), VerseId::from_key(&key("")));
    }

    #[test]
    fn empty_suffix_is_omitted() {
        assert_eq!(VerseId::from_key(&key("")).as_str(), "KJV:43:3:16");
    }

    #[test]
    fn suffix_uses_its_own_separator() {
        let a = VerseId::from_key(&key("a"));
        let b = VerseId::from_key(&key("b"));
        assert_eq!(a.as_str(), "KJV:43:3:16#a");
        assert_eq!(b.as_str(), "KJV:43:3:16#b");
        assert_ne!(a, b);
    }

    #[test]
    fn separators_in_segments_are_rejected() {
        assert!(NaturalKey::new("KJ:V", 1, 1, 1, "").is_err());
        assert!(NaturalKey::new("KJV", 1, 1, 1, "a#b").is_err());
        assert!(NaturalKey::new("KJV", 1, 1, 1, "a:b").is_err());
        assert!(NaturalKey::new("KJV", 1, 1, 1, "a b").is_err());
        assert!(NaturalKey::new("", 1, 1, 1, "").is_err());
    }

    #[test]
    fn zero_book_or_chapter_is_rejected() {
        assert!(NaturalKey::new("KJV", 0, 1, 1, "").is_err());
        assert!(NaturalKey::new("KJV", 1, 0, 1, "").is_err());
        assert!(NaturalKey::new("KJV", 1, 1, 0, "").is_ok());
    }

    #[test]
    fn parse_roundtrips_canonical_ids() {
        let k = key("a");
        let id = VerseId::from_key(&k);
        assert_eq!(VerseId::parse(id.as_str()).unwrap(), k);
    }

    #[test]
    fn parse_rejects_non_canonical_spellings() {
        assert!(VerseId::parse("KJV:043:3:16").is_err());
        assert!(VerseId::parse("KJV:43:3:16#").is_err());
        assert!(VerseId::parse("KJV:43:3").is_err());
        assert!(VerseId::parse("KJV:43:3:x").is_err());
    }

    #[test]
    fn ordering_puts_empty_suffix_first() {
        let mut keys = vec![key("b"), key(""), key("a")];
        keys.sort();
        let suffixes: Vec<_> = keys.iter().map(|k| k.suffix.as_str()).collect();
        assert_eq!(suffixes, vec!["", "a", "b"]);
    }

    fn natural_key() -> impl Strategy<Value = NaturalKey> {
        (
            "[A-Z]{2,6}",
            1u32..80,
            1u32..160,
            0u32..200,
            "[a-z]{0,2}",
        )
            .prop_map(|(t, b, c, v, s)| {
                NaturalKey::new(&t, b, c, v, &s).unwrap()
            })
    }

    proptest! {
        #[test]
        fn identifier_is_a_pure_function(k in natural_key()) {
            prop_assert_eq!(VerseId::from_key(&k), VerseId::from_key(&k.clone()));
        }

        #[test]
        fn distinct_keys_never_collide(a in natural_key(), b in natural_key()) {
            let (ia, ib) = (VerseId::from_key(&a), VerseId::from_key(&b));
            prop_assert_eq!(a == b, ia == ib);
        }

        #[test]
        fn parse_inverts_construction(k in natural_key()) {
            let id = VerseId::from_key(&k);
            prop_assert_eq!(VerseId::parse(id.as_str()).unwrap(), k);
        }
    }
}
