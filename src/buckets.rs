//! Hierarchical grouping of verses into ordered buckets.
//!
//! Only chapter buckets are derived automatically, from the verses present
//! in the corpus. Other levels are supplied from outside through
//! [`create_bucket`] and [`append_members`], which enforce the same rules:
//! one bucket per (translation, level, book, chapter), ordinals contiguous
//! from 1, and at most one bucket per verse per level.

use std::{fmt, str::FromStr};

use redb::{ReadableDatabase, ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    corpus_db::{
        BOOKS,
        BUCKET_KEYS,
        BUCKET_MEMBERS,
        BUCKETS,
        Book,
        CorpusDb,
        MEMBERSHIP,
        TRANSLATIONS,
        VERSE_KEYS,
        VERSES,
        Verse,
        allocate_id,
        load_verse,
    },
    error::{Error, Result},
};

/// First ordinal in every bucket.
pub const FIRST_ORDINAL: u32 = 1;

const BUCKET_COUNTER: &str = "bucket";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BucketLevel {
    Chapter,
    Paragraph,
    Pericope,
    Section,
    Custom,
}

impl BucketLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chapter => "chapter",
            Self::Paragraph => "paragraph",
            Self::Pericope => "pericope",
            Self::Section => "section",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for BucketLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BucketLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "chapter" => Ok(Self::Chapter),
            "paragraph" => Ok(Self::Paragraph),
            "pericope" => Ok(Self::Pericope),
            "section" => Ok(Self::Section),
            "custom" => Ok(Self::Custom),
            other => Err(Error::InvalidKey {
                field: "bucket level",
                reason: format!("unknown level '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub id: u64,
    pub translation: String,
    pub level: BucketLevel,
    pub book: u32,
    /// Unset for levels that are not chapter-scoped.
    pub chapter: Option<u32>,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketBuildReport {
    pub buckets_created: u64,
    pub members_added: u64,
    /// Verses left out because their rank did not extend their chapter
    /// bucket contiguously. Once one verse of a chapter is left out, the
    /// rest of that chapter's newcomers are too.
    pub skipped_conflicts: u64,
}

struct ChapterGroup {
    translation: String,
    book: u32,
    chapter: u32,
    verse_ids: Vec<String>,
}

/// Group every verse id by (translation, book, chapter), in corpus order.
fn chapter_groups(txn: &WriteTransaction) -> Result<Vec<ChapterGroup>> {
    let keys = txn.open_table(VERSE_KEYS)?;
    let mut groups: Vec<ChapterGroup> = Vec::new();
    for entry in keys.iter()? {
        let (key, id) = entry?;
        let (translation, book, chapter, _, _) = key.value();
        let id = id.value().to_string();
        match groups.last_mut() {
            Some(g)
                if g.translation == translation
                    && g.book == book
                    && g.chapter == chapter =>
            {
                g.verse_ids.push(id);
            }
            _ => groups.push(ChapterGroup {
                translation: translation.to_string(),
                book,
                chapter,
                verse_ids: vec![id],
            }),
        }
    }
    Ok(groups)
}

fn chapter_bucket_name(book: Option<Book>, number: u32, chapter: u32) -> String {
    match book.and_then(|b| b.name) {
        Some(name) => format!("{name} {chapter}"),
        None => format!("Book {number} Chapter {chapter}"),
    }
}

fn insert_bucket(txn: &WriteTransaction, mut bucket: Bucket) -> Result<Bucket> {
    bucket.id = allocate_id(txn, BUCKET_COUNTER)?;
    let bytes = serde_json::to_vec(&bucket)?;
    {
        let mut buckets = txn.open_table(BUCKETS)?;
        buckets.insert(bucket.id, bytes.as_slice())?;
        let mut keys = txn.open_table(BUCKET_KEYS)?;
        keys.insert(
            (
                bucket.translation.as_str(),
                bucket.level.as_str(),
                bucket.book,
                bucket.chapter,
            ),
            bucket.id,
        )?;
    }
    Ok(bucket)
}

/// One past the highest ordinal held in a bucket.
fn next_ordinal(
    members: &impl ReadableTable<(u64, u32), &'static str>,
    bucket_id: u64,
) -> Result<u32> {
    Ok(members
        .range((bucket_id, 0u32)..=(bucket_id, u32::MAX))?
        .next_back()
        .transpose()?
        .map(|(k, _)| k.value().1 + 1)
        .unwrap_or(FIRST_ORDINAL))
}

/// Materialize chapter buckets and their memberships.
///
/// Runs in one write transaction. Buckets and memberships that already
/// exist are left alone, so the second of two consecutive runs inserts
/// nothing.
pub fn build_chapter_buckets(db: &CorpusDb) -> Result<BucketBuildReport> {
    let level = BucketLevel::Chapter;
    let mut report = BucketBuildReport::default();

    let txn = db.database().begin_write()?;
    for group in chapter_groups(&txn)? {
        let existing = {
            let keys = txn.open_table(BUCKET_KEYS)?;
            keys.get((
                group.translation.as_str(),
                level.as_str(),
                group.book,
                Some(group.chapter),
            ))?
            .map(|id| id.value())
        };

        let bucket_id = match existing {
            Some(id) => id,
            None => {
                let book = {
                    let books = txn.open_table(BOOKS)?;
                    match books.get((group.translation.as_str(), group.book))? {
                        Some(v) => Some(serde_json::from_slice(v.value())?),
                        None => None,
                    }
                };
                let bucket = insert_bucket(
                    &txn,
                    Bucket {
                        id: 0,
                        translation: group.translation.clone(),
                        level,
                        book: group.book,
                        chapter: Some(group.chapter),
                        name: chapter_bucket_name(book, group.book, group.chapter),
                    },
                )?;
                report.buckets_created += 1;
                bucket.id
            }
        };

        let mut members = txn.open_table(BUCKET_MEMBERS)?;
        let mut membership = txn.open_table(MEMBERSHIP)?;
        let mut next = next_ordinal(&members, bucket_id)?;
        let mut blocked = false;
        for (rank, id) in (FIRST_ORDINAL..).zip(&group.verse_ids) {
            if membership.get((id.as_str(), level.as_str()))?.is_some() {
                continue;
            }
            // Newcomers may only extend the bucket by exactly one ordinal.
            if blocked || rank != next {
                if !blocked {
                    let holder = members
                        .get((bucket_id, rank))?
                        .map(|v| v.value().to_string());
                    warn!(
                        bucket = bucket_id,
                        ordinal = rank,
                        verse = %id,
                        holder = ?holder,
                        "verse does not extend the chapter bucket, skipping rest of chapter"
                    );
                    blocked = true;
                }
                report.skipped_conflicts += 1;
                continue;
            }
            members.insert((bucket_id, rank), id.as_str())?;
            membership.insert((id.as_str(), level.as_str()), (bucket_id, rank))?;
            report.members_added += 1;
            next += 1;
        }
    }
    txn.commit()?;

    info!(
        created = report.buckets_created,
        members = report.members_added,
        skipped = report.skipped_conflicts,
        "chapter buckets built"
    );
    Ok(report)
}

/// Create a bucket for an externally supplied grouping.
///
/// Returns the existing bucket when one with the same natural key is
/// already present.
pub fn create_bucket(
    db: &CorpusDb,
    translation: &str,
    level: BucketLevel,
    book: u32,
    chapter: Option<u32>,
    name: &str,
) -> Result<Bucket> {
    if level == BucketLevel::Chapter && chapter.is_none() {
        return Err(Error::InvalidKey {
            field: "chapter",
            reason: "chapter buckets need a chapter number".to_string(),
        });
    }

    let txn = db.database().begin_write()?;
    if txn.open_table(TRANSLATIONS)?.get(translation)?.is_none() {
        return Err(Error::NotFound {
            kind: "translation",
            name: translation.to_string(),
        });
    }

    let existing = txn
        .open_table(BUCKET_KEYS)?
        .get((translation, level.as_str(), book, chapter))?
        .map(|id| id.value());
    if let Some(id) = existing {
        let bucket = read_bucket(&txn.open_table(BUCKETS)?, id)?;
        return bucket.ok_or_else(|| Error::NotFound {
            kind: "bucket",
            name: id.to_string(),
        });
    }

    let bucket = insert_bucket(
        &txn,
        Bucket {
            id: 0,
            translation: translation.to_string(),
            level,
            book,
            chapter,
            name: name.to_string(),
        },
    )?;
    txn.commit()?;
    debug!(id = bucket.id, %level, translation, "created bucket");
    Ok(bucket)
}

/// Append verses to the end of a bucket, in the given order.
///
/// All-or-nothing: a verse that is unknown, belongs to another
/// translation (or, for chapter buckets, another chapter), or already has
/// a bucket at this level rejects the call.
/// Returns the ordinals assigned.
pub fn append_members(
    db: &CorpusDb,
    bucket_id: u64,
    verse_ids: &[&str],
) -> Result<Vec<u32>> {
    let txn = db.database().begin_write()?;
    let bucket = read_bucket(&txn.open_table(BUCKETS)?, bucket_id)?.ok_or_else(
        || Error::NotFound {
            kind: "bucket",
            name: bucket_id.to_string(),
        },
    )?;
    let level = bucket.level.as_str();

    let mut assigned = Vec::with_capacity(verse_ids.len());
    {
        let verses = txn.open_table(VERSES)?;
        let mut members = txn.open_table(BUCKET_MEMBERS)?;
        let mut membership = txn.open_table(MEMBERSHIP)?;

        let mut next = next_ordinal(&members, bucket_id)?;

        for &id in verse_ids {
            let verse = load_verse(&verses, id)?.ok_or_else(|| Error::NotFound {
                kind: "verse",
                name: id.to_string(),
            })?;
            if verse.key.translation != bucket.translation {
                return Err(Error::Conflict {
                    key: id.to_string(),
                    reason: format!(
                        "bucket {bucket_id} belongs to translation {}",
                        bucket.translation
                    ),
                });
            }
            if bucket.level == BucketLevel::Chapter
                && (verse.key.book, Some(verse.key.chapter))
                    != (bucket.book, bucket.chapter)
            {
                return Err(Error::Conflict {
                    key: id.to_string(),
                    reason: format!(
                        "chapter bucket {bucket_id} holds only book {} chapter {}",
                        bucket.book,
                        bucket.chapter.unwrap_or_default()
                    ),
                });
            }
            let current = membership.get((id, level))?.map(|v| v.value());
            if let Some((other, ordinal)) = current {
                return Err(Error::Conflict {
                    key: id.to_string(),
                    reason: format!(
                        "already member {ordinal} of {level} bucket {other}"
                    ),
                });
            }
            members.insert((bucket_id, next), id)?;
            membership.insert((id, level), (bucket_id, next))?;
            assigned.push(next);
            next += 1;
        }
    }
    txn.commit()?;
    Ok(assigned)
}

fn read_bucket(
    table: &impl ReadableTable<u64, &'static [u8]>,
    id: u64,
) -> Result<Option<Bucket>> {
    match table.get(id)? {
        Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
        None => Ok(None),
    }
}

pub fn get_bucket(db: &CorpusDb, id: u64) -> Result<Option<Bucket>> {
    let txn = db.database().begin_read()?;
    read_bucket(&txn.open_table(BUCKETS)?, id)
}

pub fn find_bucket(
    db: &CorpusDb,
    translation: &str,
    level: BucketLevel,
    book: u32,
    chapter: Option<u32>,
) -> Result<Option<Bucket>> {
    let txn = db.database().begin_read()?;
    let keys = txn.open_table(BUCKET_KEYS)?;
    let Some(id) = keys.get((translation, level.as_str(), book, chapter))? else {
        return Ok(None);
    };
    read_bucket(&txn.open_table(BUCKETS)?, id.value())
}

/// Buckets of one level in a translation, ordered by (book, chapter).
pub fn list_buckets(
    db: &CorpusDb,
    translation: &str,
    level: BucketLevel,
) -> Result<Vec<Bucket>> {
    let txn = db.database().begin_read()?;
    let keys = txn.open_table(BUCKET_KEYS)?;
    let buckets = txn.open_table(BUCKETS)?;
    let mut result = Vec::new();
    for entry in keys.range((translation, level.as_str(), 0u32, None::<u32>)..)? {
        let (k, id) = entry?;
        let (t, l, _, _) = k.value();
        if t != translation || l != level.as_str() {
            break;
        }
        if let Some(bucket) = read_bucket(&buckets, id.value())? {
            result.push(bucket);
        }
    }
    Ok(result)
}

/// Member verses of a bucket in ordinal order.
pub fn bucket_members(db: &CorpusDb, bucket_id: u64) -> Result<Vec<Verse>> {
    Ok(bucket_member_ordinals(db, bucket_id)?
        .into_iter()
        .map(|(_, verse)| verse)
        .collect())
}

pub fn bucket_member_ordinals(
    db: &CorpusDb,
    bucket_id: u64,
) -> Result<Vec<(u32, Verse)>> {
    let txn = db.database().begin_read()?;
    let members = txn.open_table(BUCKET_MEMBERS)?;
    let verses = txn.open_table(VERSES)?;
    let mut result = Vec::new();
    for entry in members.range((bucket_id, 0u32)..=(bucket_id, u32::MAX))? {
        let (k, id) = entry?;
        if let Some(verse) = load_verse(&verses, id.value())? {
            result.push((k.value().1, verse));
        }
    }
    Ok(result)
}

/// The bucket and ordinal a verse holds at `level`.
pub fn bucket_of(
    db: &CorpusDb,
    verse_id: &str,
    level: BucketLevel,
) -> Result<Option<(Bucket, u32)>> {
    let txn = db.database().begin_read()?;
    let membership = txn.open_table(MEMBERSHIP)?;
    let Some(slot) = membership.get((verse_id, level.as_str()))? else {
        return Ok(None);
    };
    let (bucket_id, ordinal) = slot.value();
    Ok(read_bucket(&txn.open_table(BUCKETS)?, bucket_id)?
        .map(|bucket| (bucket, ordinal)))
}
