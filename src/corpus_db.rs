use std::{collections::HashSet, path::Path};

use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    TableDefinition,
    WriteTransaction,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    migrations::{self, Migration},
    verse_id::{NaturalKey, VerseId},
};

pub(crate) const TRANSLATIONS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("translations");
pub(crate) const BOOKS: TableDefinition<(&str, u32), &[u8]> =
    TableDefinition::new("books");
pub(crate) const CHAPTERS: TableDefinition<(&str, u32, u32), ()> =
    TableDefinition::new("chapters");
pub(crate) const VERSES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("verses");
/// Natural key -> verse id. Iteration order is the corpus order.
pub(crate) const VERSE_KEYS: TableDefinition<
    (&str, u32, u32, u32, &str),
    &str,
> = TableDefinition::new("verse_keys");
/// (translation, absolute index) -> verse id. Unset indexes have no row.
pub(crate) const ABSOLUTE_INDEX: TableDefinition<(&str, u64), &str> =
    TableDefinition::new("absolute_index");
pub(crate) const BUCKETS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("buckets");
/// (translation, level, book, chapter) -> bucket id.
pub(crate) const BUCKET_KEYS: TableDefinition<
    (&str, &str, u32, Option<u32>),
    u64,
> = TableDefinition::new("bucket_keys");
/// (bucket id, ordinal) -> verse id.
pub(crate) const BUCKET_MEMBERS: TableDefinition<(u64, u32), &str> =
    TableDefinition::new("bucket_members");
/// (verse id, level) -> (bucket id, ordinal).
pub(crate) const MEMBERSHIP: TableDefinition<(&str, &str), (u64, u32)> =
    TableDefinition::new("bucket_membership");
pub(crate) const COUNTERS: TableDefinition<&str, u64> =
    TableDefinition::new("counters");
pub(crate) const RUN_MANIFESTS: TableDefinition<&str, &str> =
    TableDefinition::new("run_manifests");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

fn create_corpus_tables(txn: &WriteTransaction) -> Result<()> {
    txn.open_table(TRANSLATIONS)?;
    txn.open_table(BOOKS)?;
    txn.open_table(CHAPTERS)?;
    txn.open_table(VERSES)?;
    txn.open_table(VERSE_KEYS)?;
    txn.open_table(SETTINGS)?;
    Ok(())
}

fn create_absolute_index(txn: &WriteTransaction) -> Result<()> {
    txn.open_table(ABSOLUTE_INDEX)?;
    Ok(())
}

fn create_bucket_tables(txn: &WriteTransaction) -> Result<()> {
    txn.open_table(BUCKETS)?;
    txn.open_table(BUCKET_KEYS)?;
    txn.open_table(BUCKET_MEMBERS)?;
    txn.open_table(MEMBERSHIP)?;
    txn.open_table(COUNTERS)?;
    Ok(())
}

fn create_run_manifests(txn: &WriteTransaction) -> Result<()> {
    txn.open_table(RUN_MANIFESTS)?;
    Ok(())
}

const CORPUS_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "corpus tables",
        apply: create_corpus_tables,
    },
    Migration {
        version: 2,
        name: "absolute index",
        apply: create_absolute_index,
    },
    Migration {
        version: 3,
        name: "buckets",
        apply: create_bucket_tables,
    },
    Migration {
        version: 4,
        name: "run manifests",
        apply: create_run_manifests,
    },
];

/// A named text collection. The code never changes once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    pub code: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub source_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Testament {
    Old,
    New,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub translation: String,
    pub number: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub testament: Option<Testament>,
}

/// A stored verse row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verse {
    pub id: VerseId,
    #[serde(flatten)]
    pub key: NaturalKey,
    pub text: String,
    #[serde(default)]
    pub source_version: Option<String>,
    #[serde(default)]
    pub absolute_index: Option<u64>,
}

/// Result of looking up many verse ids at once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerseBatch {
    /// Found verses, in request order.
    pub verses: Vec<Verse>,
    /// Requested ids with no stored verse, in request order.
    pub missing_ids: Vec<String>,
}

/// One verse position read across several translations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranslationComparison {
    pub book: u32,
    pub chapter: u32,
    pub verse: u32,
    pub suffix: String,
    /// Verses found, in the order the translations were requested.
    pub verses: Vec<Verse>,
    /// Requested translations without this verse.
    pub missing_translations: Vec<String>,
}

/// Row counts for one translation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslationStats {
    pub verses: u64,
    pub indexed: u64,
    pub chapters: u64,
}

pub(crate) fn decode_verse(bytes: &[u8]) -> Result<Verse> {
    Ok(serde_json::from_slice(bytes)?)
}

pub(crate) fn load_verse(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    id: &str,
) -> Result<Option<Verse>> {
    match table.get(id)? {
        Some(guard) => Ok(Some(decode_verse(guard.value())?)),
        None => Ok(None),
    }
}

/// Verse ids of one translation (optionally one book/chapter) in corpus
/// order.
pub(crate) fn ordered_verse_ids(
    keys: &impl ReadableTable<(&'static str, u32, u32, u32, &'static str), &'static str>,
    translation: &str,
    chapter: Option<(u32, u32)>,
) -> Result<Vec<String>> {
    let (book, ch) = chapter.unwrap_or((0, 0));
    let mut ids = Vec::new();
    for entry in keys.range((translation, book, ch, 0u32, "")..)? {
        let (key, id) = entry?;
        let (t, b, c, _, _) = key.value();
        if t != translation {
            break;
        }
        if chapter.is_some() && (b, c) != (book, ch) {
            break;
        }
        ids.push(id.value().to_string());
    }
    Ok(ids)
}

/// Allocate the next value of a named counter inside `txn`.
pub(crate) fn allocate_id(txn: &WriteTransaction, counter: &str) -> Result<u64> {
    let mut table = txn.open_table(COUNTERS)?;
    let next = table.get(counter)?.map(|v| v.value()).unwrap_or(0) + 1;
    table.insert(counter, next)?;
    Ok(next)
}

/// The canonical corpus store: translations, books, chapters, verses and
/// the derived sequential and bucket structures.
pub struct CorpusDb {
    db: Database,
}

impl CorpusDb {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;
        migrations::apply(&db, "corpus", CORPUS_MIGRATIONS)?;
        Ok(Self { db })
    }

    pub(crate) fn database(&self) -> &Database {
        &self.db
    }

    pub fn schema_version(&self) -> Result<u64> {
        migrations::current_version(&self.db)
    }

    // -- Translations --

    pub fn get_translation(&self, code: &str) -> Result<Option<Translation>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TRANSLATIONS)?;
        match table.get(code)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    pub fn list_translations(&self) -> Result<Vec<Translation>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TRANSLATIONS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }

    /// Update translation metadata. The code is the key and is never
    /// rewritten.
    pub fn set_translation(&self, translation: &Translation) -> Result<()> {
        let bytes = serde_json::to_vec(translation)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(TRANSLATIONS)?;
            table.insert(translation.code.as_str(), bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    // -- Books --

    pub fn get_book(&self, translation: &str, number: u32) -> Result<Option<Book>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(BOOKS)?;
        match table.get((translation, number))? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    pub fn list_books(&self, translation: &str) -> Result<Vec<Book>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(BOOKS)?;
        let mut result = Vec::new();
        for entry in table.range((translation, 0u32)..)? {
            let (k, v) = entry?;
            if k.value().0 != translation {
                break;
            }
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }

    /// Attach a name and testament to a book that ingestion created.
    pub fn set_book(&self, book: &Book) -> Result<()> {
        let bytes = serde_json::to_vec(book)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(BOOKS)?;
            table.insert((book.translation.as_str(), book.number), bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn list_chapters(&self, translation: &str, book: u32) -> Result<Vec<u32>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(CHAPTERS)?;
        let mut result = Vec::new();
        for entry in table.range((translation, book, 0u32)..)? {
            let (k, _) = entry?;
            let (t, b, c) = k.value();
            if t != translation || b != book {
                break;
            }
            result.push(c);
        }
        Ok(result)
    }

    // -- Verses --

    pub fn get_verse(&self, id: &str) -> Result<Option<Verse>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(VERSES)?;
        load_verse(&table, id)
    }

    pub fn get_verse_by_key(&self, key: &NaturalKey) -> Result<Option<Verse>> {
        let txn = self.db.begin_read()?;
        let keys = txn.open_table(VERSE_KEYS)?;
        let Some(id) = keys.get((
            key.translation.as_str(),
            key.book,
            key.chapter,
            key.verse,
            key.suffix.as_str(),
        ))?
        else {
            return Ok(None);
        };
        let verses = txn.open_table(VERSES)?;
        load_verse(&verses, id.value())
    }

    /// Look up many ids in one read transaction. Duplicate ids are
    /// returned once.
    pub fn get_verses<S: AsRef<str>>(&self, ids: &[S]) -> Result<VerseBatch> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(VERSES)?;
        let mut seen = HashSet::new();
        let mut batch = VerseBatch::default();
        for id in ids {
            let id: &str = id.as_ref();
            if !seen.insert(id) {
                continue;
            }
            match load_verse(&table, id)? {
                Some(verse) => batch.verses.push(verse),
                None => batch.missing_ids.push(id.to_string()),
            }
        }
        Ok(batch)
    }

    /// The same book, chapter, verse and suffix in each of `translations`.
    pub fn compare_translations<S: AsRef<str>>(
        &self,
        book: u32,
        chapter: u32,
        verse: u32,
        suffix: &str,
        translations: &[S],
    ) -> Result<TranslationComparison> {
        let mut comparison = TranslationComparison {
            book,
            chapter,
            verse,
            suffix: suffix.to_string(),
            verses: Vec::new(),
            missing_translations: Vec::new(),
        };
        let txn = self.db.begin_read()?;
        let keys = txn.open_table(VERSE_KEYS)?;
        let verses = txn.open_table(VERSES)?;
        for translation in translations {
            let translation: &str = translation.as_ref();
            let found = match keys.get((translation, book, chapter, verse, suffix))? {
                Some(id) => load_verse(&verses, id.value())?,
                None => None,
            };
            match found {
                Some(v) => comparison.verses.push(v),
                None => comparison.missing_translations.push(translation.to_string()),
            }
        }
        Ok(comparison)
    }

    /// All verses of a translation in corpus order.
    pub fn verses_in_translation(&self, translation: &str) -> Result<Vec<Verse>> {
        self.ordered_verses(translation, None)
    }

    /// All verses of one chapter in corpus order.
    pub fn verses_in_chapter(
        &self,
        translation: &str,
        book: u32,
        chapter: u32,
    ) -> Result<Vec<Verse>> {
        self.ordered_verses(translation, Some((book, chapter)))
    }

    fn ordered_verses(
        &self,
        translation: &str,
        chapter: Option<(u32, u32)>,
    ) -> Result<Vec<Verse>> {
        let txn = self.db.begin_read()?;
        let keys = txn.open_table(VERSE_KEYS)?;
        let verses = txn.open_table(VERSES)?;
        let mut result = Vec::new();
        for id in ordered_verse_ids(&keys, translation, chapter)? {
            if let Some(verse) = load_verse(&verses, &id)? {
                result.push(verse);
            }
        }
        Ok(result)
    }

    /// The verse at `position` in a translation's absolute order.
    pub fn verse_at(&self, translation: &str, position: u64) -> Result<Option<Verse>> {
        let txn = self.db.begin_read()?;
        let index = txn.open_table(ABSOLUTE_INDEX)?;
        let Some(id) = index.get((translation, position))? else {
            return Ok(None);
        };
        let verses = txn.open_table(VERSES)?;
        load_verse(&verses, id.value())
    }

    /// Up to `count` consecutive verses starting at absolute index `start`.
    ///
    /// Reads the absolute-index table directly, so "next N" and "previous
    /// N" never reconstruct order from composite keys.
    pub fn absolute_slice(
        &self,
        translation: &str,
        start: u64,
        count: u64,
    ) -> Result<Vec<Verse>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let end = start.saturating_add(count);
        let txn = self.db.begin_read()?;
        let index = txn.open_table(ABSOLUTE_INDEX)?;
        let verses = txn.open_table(VERSES)?;
        let mut result = Vec::new();
        for entry in index.range((translation, start)..(translation, end))? {
            let (_, id) = entry?;
            if let Some(verse) = load_verse(&verses, id.value())? {
                result.push(verse);
            }
        }
        Ok(result)
    }

    pub fn translation_stats(&self, translation: &str) -> Result<TranslationStats> {
        let txn = self.db.begin_read()?;
        let keys = txn.open_table(VERSE_KEYS)?;
        let index = txn.open_table(ABSOLUTE_INDEX)?;
        let chapters = txn.open_table(CHAPTERS)?;

        let mut stats = TranslationStats::default();
        stats.verses = ordered_verse_ids(&keys, translation, None)?.len() as u64;
        for entry in index.range((translation, 0u64)..)? {
            let (k, _) = entry?;
            if k.value().0 != translation {
                break;
            }
            stats.indexed += 1;
        }
        for entry in chapters.range((translation, 0u32, 0u32)..)? {
            let (k, _) = entry?;
            if k.value().0 != translation {
                break;
            }
            stats.chapters += 1;
        }
        Ok(stats)
    }

    // -- Settings --

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    /// Get a setting, returning the default if not set.
    pub fn get_setting_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self
            .get_setting(key)?
            .unwrap_or_else(|| default.to_string()))
    }

    pub fn list_settings(&self) -> Result<Vec<(String, String)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            result.push((k.value().to_string(), v.value().to_string()));
        }
        Ok(result)
    }
}

impl std::fmt::Debug for CorpusDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorpusDb").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::{ConflictPolicy, VerseRecord, ingest_verse};

    fn test_db() -> (tempfile::TempDir, CorpusDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = CorpusDb::open(&tmp.path().join("corpus.redb")).unwrap();
        (tmp, db)
    }

    fn add(db: &CorpusDb, book: u32, chapter: u32, verse: u32, suffix: &str) {
        let record = VerseRecord::new("KJV", book, chapter, verse, suffix, "text");
        ingest_verse(db, &record, ConflictPolicy::Reject).unwrap();
    }

    #[test]
    fn open_applies_all_migrations() {
        let (_tmp, db) = test_db();
        assert_eq!(db.schema_version().unwrap(), 4);
    }

    #[test]
    fn verses_come_back_in_corpus_order() {
        let (_tmp, db) = test_db();
        add(&db, 2, 1, 1, "");
        add(&db, 1, 10, 1, "");
        add(&db, 1, 2, 5, "b");
        add(&db, 1, 2, 5, "");
        add(&db, 1, 2, 5, "a");

        let ids: Vec<String> = db
            .verses_in_translation("KJV")
            .unwrap()
            .into_iter()
            .map(|v| v.id.into_string())
            .collect();
        assert_eq!(
            ids,
            vec![
                "KJV:1:2:5",
                "KJV:1:2:5#a",
                "KJV:1:2:5#b",
                "KJV:1:10:1",
                "KJV:2:1:1",
            ]
        );
    }

    #[test]
    fn translations_do_not_bleed_into_each_other() {
        let (_tmp, db) = test_db();
        add(&db, 1, 1, 1, "");
        let other = VerseRecord::new("KJV2", 1, 1, 1, "", "other");
        ingest_verse(&db, &other, ConflictPolicy::Reject).unwrap();

        assert_eq!(db.verses_in_translation("KJV").unwrap().len(), 1);
        assert_eq!(db.verses_in_translation("KJV2").unwrap().len(), 1);
        assert_eq!(db.list_translations().unwrap().len(), 2);
    }

    #[test]
    fn chapter_listing_is_scoped() {
        let (_tmp, db) = test_db();
        add(&db, 1, 1, 1, "");
        add(&db, 1, 2, 1, "");
        add(&db, 2, 7, 1, "");

        assert_eq!(db.list_chapters("KJV", 1).unwrap(), vec![1, 2]);
        assert_eq!(db.list_chapters("KJV", 2).unwrap(), vec![7]);
        assert_eq!(db.verses_in_chapter("KJV", 1, 2).unwrap().len(), 1);
    }

    #[test]
    fn book_metadata_can_be_attached() {
        let (_tmp, db) = test_db();
        add(&db, 43, 3, 16, "");

        db.set_book(&Book {
            translation: "KJV".into(),
            number: 43,
            name: Some("John".into()),
            testament: Some(Testament::New),
        })
        .unwrap();

        let book = db.get_book("KJV", 43).unwrap().unwrap();
        assert_eq!(book.name.as_deref(), Some("John"));
        assert_eq!(db.list_books("KJV").unwrap().len(), 1);
    }

    #[test]
    fn batch_lookup_reports_missing_ids() {
        let (_tmp, db) = test_db();
        add(&db, 1, 1, 1, "");
        add(&db, 1, 1, 2, "");

        let batch = db
            .get_verses(&["KJV:1:1:2", "KJV:9:9:9", "KJV:1:1:1", "KJV:1:1:2"])
            .unwrap();
        let ids: Vec<&str> = batch.verses.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["KJV:1:1:2", "KJV:1:1:1"]);
        assert_eq!(batch.missing_ids, vec!["KJV:9:9:9".to_string()]);
    }

    #[test]
    fn comparison_lists_translations_without_the_verse() {
        let (_tmp, db) = test_db();
        add(&db, 43, 3, 16, "");
        let web = VerseRecord::new("WEB", 43, 3, 16, "", "For God so loved the world");
        ingest_verse(&db, &web, ConflictPolicy::Reject).unwrap();
        let split = VerseRecord::new("ASV", 43, 3, 16, "a", "For God so loved");
        ingest_verse(&db, &split, ConflictPolicy::Reject).unwrap();

        let cmp = db
            .compare_translations(43, 3, 16, "", &["WEB", "ASV", "KJV", "YLT"])
            .unwrap();
        let ids: Vec<&str> = cmp.verses.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["WEB:43:3:16", "KJV:43:3:16"]);
        assert_eq!(cmp.missing_translations, vec!["ASV", "YLT"]);

        let parts = db.compare_translations(43, 3, 16, "a", &["ASV"]).unwrap();
        assert_eq!(parts.verses[0].text, "For God so loved");
        assert!(parts.missing_translations.is_empty());
    }

    #[test]
    fn settings_crud() {
        let (_tmp, db) = test_db();

        assert_eq!(db.get_setting("embedding.model").unwrap(), None);
        assert_eq!(
            db.get_setting_or("embedding.model", "default-model").unwrap(),
            "default-model"
        );

        db.set_setting("embedding.model", "custom-model").unwrap();
        assert_eq!(
            db.get_setting("embedding.model").unwrap(),
            Some("custom-model".to_string())
        );
    }

    #[test]
    fn reopen_preserves_data() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("corpus.redb");

        {
            let db = CorpusDb::open(&path).unwrap();
            add(&db, 1, 1, 1, "");
        }

        {
            let db = CorpusDb::open(&path).unwrap();
            assert!(db.get_verse("KJV:1:1:1").unwrap().is_some());
            assert_eq!(db.schema_version().unwrap(), 4);
        }
    }
}
