//! Absolute index backfill.
//!
//! Every verse of a translation gets a dense position `1..=N` following the
//! corpus order (book, chapter, verse number, suffix). Backfill only writes
//! verses whose position is unset, so it can be re-run after a partial or
//! killed run. Each translation commits in its own transaction.

use redb::{ReadableDatabase, ReadableTable};
use tracing::{info, warn};

use crate::{
    corpus_db::{
        ABSOLUTE_INDEX,
        CorpusDb,
        VERSE_KEYS,
        VERSES,
        load_verse,
        ordered_verse_ids,
    },
    error::{Error, Result},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationBackfill {
    pub translation: String,
    /// Verses that received a position in this run.
    pub assigned: u64,
    /// Verses in the translation.
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillFailure {
    pub translation: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub completed: Vec<TranslationBackfill>,
    pub failed: Vec<BackfillFailure>,
}

impl BackfillReport {
    pub fn assigned(&self) -> u64 {
        self.completed.iter().map(|t| t.assigned).sum()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Backfill every translation. A uniqueness violation aborts only the
/// affected translation; it is recorded in the report and the remaining
/// translations still run.
pub fn backfill_absolute_index(db: &CorpusDb) -> Result<BackfillReport> {
    let mut report = BackfillReport::default();
    for translation in db.list_translations()? {
        match backfill_translation(db, &translation.code) {
            Ok(done) => report.completed.push(done),
            Err(e @ Error::ConstraintViolation { .. }) => {
                warn!(
                    translation = %translation.code,
                    error = %e,
                    "absolute index backfill aborted"
                );
                report.failed.push(BackfillFailure {
                    translation: translation.code,
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }
    Ok(report)
}

/// Backfill one translation in a single write transaction.
pub fn backfill_translation(
    db: &CorpusDb,
    translation: &str,
) -> Result<TranslationBackfill> {
    let txn = db.database().begin_write()?;
    let mut assigned = 0;
    let total;
    {
        let keys = txn.open_table(VERSE_KEYS)?;
        let mut verses = txn.open_table(VERSES)?;
        let mut index = txn.open_table(ABSOLUTE_INDEX)?;

        let ids = ordered_verse_ids(&keys, translation, None)?;
        total = ids.len() as u64;

        for (position, id) in (1u64..).zip(&ids) {
            let Some(mut verse) = load_verse(&verses, id)? else {
                continue;
            };
            if verse.absolute_index.is_some() {
                continue;
            }

            if let Some(holder) = index.get((translation, position))? {
                let holder = holder.value().to_string();
                if holder != *id {
                    return Err(Error::ConstraintViolation {
                        translation: translation.to_string(),
                        position,
                        holder,
                    });
                }
            }

            verse.absolute_index = Some(position);
            let bytes = serde_json::to_vec(&verse)?;
            verses.insert(id.as_str(), bytes.as_slice())?;
            index.insert((translation, position), id.as_str())?;
            assigned += 1;
        }
    }
    txn.commit()?;

    info!(translation, assigned, total, "absolute index backfilled");
    Ok(TranslationBackfill {
        translation: translation.to_string(),
        assigned,
        total,
    })
}

/// Discard and reassign every position of a translation.
///
/// This is the administrative remedy when verses were ingested between
/// already-numbered neighbours. It is never run implicitly.
pub fn renumber_translation(
    db: &CorpusDb,
    translation: &str,
) -> Result<TranslationBackfill> {
    let txn = db.database().begin_write()?;
    let total;
    {
        let keys = txn.open_table(VERSE_KEYS)?;
        let mut verses = txn.open_table(VERSES)?;
        let mut index = txn.open_table(ABSOLUTE_INDEX)?;

        let mut stale = Vec::new();
        for entry in index.range((translation, 0u64)..)? {
            let (k, _) = entry?;
            let (t, position) = k.value();
            if t != translation {
                break;
            }
            stale.push(position);
        }
        for position in stale {
            index.remove((translation, position))?;
        }

        let ids = ordered_verse_ids(&keys, translation, None)?;
        total = ids.len() as u64;
        for (position, id) in (1u64..).zip(&ids) {
            let Some(mut verse) = load_verse(&verses, id)? else {
                continue;
            };
            verse.absolute_index = Some(position);
            let bytes = serde_json::to_vec(&verse)?;
            verses.insert(id.as_str(), bytes.as_slice())?;
            index.insert((translation, position), id.as_str())?;
        }
    }
    txn.commit()?;

    info!(translation, total, "absolute index renumbered");
    Ok(TranslationBackfill {
        translation: translation.to_string(),
        assigned: total,
        total,
    })
}

/// Whether a translation's positions are exactly `1..=N` for its N verses.
pub fn is_contiguous(db: &CorpusDb, translation: &str) -> Result<bool> {
    let txn = db.database().begin_read()?;
    let keys = txn.open_table(VERSE_KEYS)?;
    let index = txn.open_table(ABSOLUTE_INDEX)?;

    let total = ordered_verse_ids(&keys, translation, None)?.len() as u64;
    let mut expected = 1u64;
    for entry in index.range((translation, 0u64)..)? {
        let (k, _) = entry?;
        let (t, position) = k.value();
        if t != translation {
            break;
        }
        if position != expected {
            return Ok(false);
        }
        expected += 1;
    }
    Ok(expected - 1 == total)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::ingestion::{ConflictPolicy, VerseRecord, ingest_verse};

    fn test_db() -> (tempfile::TempDir, CorpusDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = CorpusDb::open(&tmp.path().join("corpus.redb")).unwrap();
        (tmp, db)
    }

    fn add(db: &CorpusDb, t: &str, book: u32, chapter: u32, verse: u32, suffix: &str) {
        let record = VerseRecord::new(t, book, chapter, verse, suffix, "text");
        ingest_verse(db, &record, ConflictPolicy::Reject).unwrap();
    }

    fn positions(db: &CorpusDb, t: &str) -> Vec<(String, Option<u64>)> {
        db.verses_in_translation(t)
            .unwrap()
            .into_iter()
            .map(|v| (v.id.into_string(), v.absolute_index))
            .collect()
    }

    #[test]
    fn assigns_positions_in_corpus_order() {
        let (_tmp, db) = test_db();
        add(&db, "KJV", 1, 2, 1, "");
        add(&db, "KJV", 1, 1, 2, "");
        add(&db, "KJV", 1, 1, 1, "b");
        add(&db, "KJV", 1, 1, 1, "");

        let report = backfill_absolute_index(&db).unwrap();
        assert!(report.is_success());
        assert_eq!(report.assigned(), 4);

        assert_eq!(
            positions(&db, "KJV"),
            vec![
                ("KJV:1:1:1".to_string(), Some(1)),
                ("KJV:1:1:1#b".to_string(), Some(2)),
                ("KJV:1:1:2".to_string(), Some(3)),
                ("KJV:1:2:1".to_string(), Some(4)),
            ]
        );
        assert!(is_contiguous(&db, "KJV").unwrap());
    }

    #[test]
    fn second_run_changes_nothing() {
        let (_tmp, db) = test_db();
        add(&db, "KJV", 1, 1, 1, "");
        add(&db, "KJV", 1, 1, 2, "");

        backfill_absolute_index(&db).unwrap();
        let before = positions(&db, "KJV");
        let report = backfill_absolute_index(&db).unwrap();

        assert_eq!(report.assigned(), 0);
        assert_eq!(positions(&db, "KJV"), before);
    }

    #[test]
    fn translations_are_numbered_independently() {
        let (_tmp, db) = test_db();
        add(&db, "KJV", 1, 1, 1, "");
        add(&db, "KJV", 1, 1, 2, "");
        add(&db, "WEB", 1, 1, 1, "");

        backfill_absolute_index(&db).unwrap();
        assert_eq!(db.verse_at("WEB", 1).unwrap().unwrap().id.as_str(), "WEB:1:1:1");
        assert_eq!(db.verse_at("KJV", 2).unwrap().unwrap().id.as_str(), "KJV:1:1:2");
        assert!(db.verse_at("WEB", 2).unwrap().is_none());
    }

    #[test]
    fn appended_verses_extend_the_range() {
        let (_tmp, db) = test_db();
        add(&db, "KJV", 1, 1, 1, "");
        backfill_absolute_index(&db).unwrap();

        add(&db, "KJV", 1, 1, 2, "");
        let report = backfill_absolute_index(&db).unwrap();

        assert_eq!(report.assigned(), 1);
        assert!(is_contiguous(&db, "KJV").unwrap());
    }

    #[test]
    fn out_of_order_insert_is_reported_not_overwritten() {
        let (_tmp, db) = test_db();
        add(&db, "KJV", 1, 1, 1, "");
        add(&db, "KJV", 1, 1, 3, "");
        add(&db, "WEB", 1, 1, 1, "");
        backfill_absolute_index(&db).unwrap();

        // Lands between two numbered verses: its rank (2) is already held.
        add(&db, "KJV", 1, 1, 2, "");
        add(&db, "WEB", 1, 1, 2, "");
        let report = backfill_absolute_index(&db).unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].translation, "KJV");
        assert_eq!(db.get_verse("KJV:1:1:2").unwrap().unwrap().absolute_index, None);
        assert_eq!(db.get_verse("KJV:1:1:3").unwrap().unwrap().absolute_index, Some(2));
        // The other translation still completed.
        assert_eq!(db.get_verse("WEB:1:1:2").unwrap().unwrap().absolute_index, Some(2));
    }

    #[test]
    fn renumber_restores_contiguity() {
        let (_tmp, db) = test_db();
        add(&db, "KJV", 1, 1, 1, "");
        add(&db, "KJV", 1, 1, 3, "");
        backfill_absolute_index(&db).unwrap();
        add(&db, "KJV", 1, 1, 2, "");

        let done = renumber_translation(&db, "KJV").unwrap();
        assert_eq!(done.total, 3);
        assert_eq!(
            positions(&db, "KJV"),
            vec![
                ("KJV:1:1:1".to_string(), Some(1)),
                ("KJV:1:1:2".to_string(), Some(2)),
                ("KJV:1:1:3".to_string(), Some(3)),
            ]
        );
        assert!(is_contiguous(&db, "KJV").unwrap());
    }

    #[test]
    fn absolute_slice_reads_contiguous_range() {
        let (_tmp, db) = test_db();
        for v in 1..=10 {
            add(&db, "KJV", 1, 1, v, "");
        }
        backfill_absolute_index(&db).unwrap();

        let slice = db.absolute_slice("KJV", 4, 3).unwrap();
        let verses: Vec<u32> = slice.iter().map(|v| v.key.verse).collect();
        assert_eq!(verses, vec![4, 5, 6]);

        assert_eq!(db.absolute_slice("KJV", 9, 5).unwrap().len(), 2);
        assert!(db.absolute_slice("KJV", 1, 0).unwrap().is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn positions_are_exactly_one_to_n(
            keys in proptest::collection::btree_set(
                (1u32..4, 1u32..4, 1u32..6, prop_oneof!["", "a", "b"]),
                1..30,
            ),
            runs in 1usize..3,
        ) {
            let (_tmp, db) = test_db();
            // Ingest in reverse so insertion order differs from corpus order.
            for (b, c, v, s) in keys.iter().rev() {
                add(&db, "KJV", *b, *c, *v, s);
            }
            for _ in 0..runs {
                backfill_absolute_index(&db).unwrap();
            }

            let got: Vec<u64> = db
                .verses_in_translation("KJV")
                .unwrap()
                .iter()
                .map(|v| v.absolute_index.unwrap())
                .collect();
            let expected: Vec<u64> = (1..=keys.len() as u64).collect();
            prop_assert_eq!(got, expected);
            prop_assert_eq!(backfill_absolute_index(&db).unwrap().assigned(), 0);
        }
    }
}
