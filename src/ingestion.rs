use std::{io::BufRead, str::FromStr};

use redb::{ReadableTable, WriteTransaction};
use serde::Deserialize;
use tracing::debug;

use crate::{
    corpus_db::{
        BOOKS,
        Book,
        CHAPTERS,
        CorpusDb,
        TRANSLATIONS,
        Testament,
        Translation,
        VERSE_KEYS,
        VERSES,
        Verse,
        load_verse,
    },
    error::{Error, Result},
    verse_id::{NaturalKey, VerseId},
};

/// One unit as delivered by a source loader.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VerseRecord {
    pub translation: String,
    pub book: u32,
    pub chapter: u32,
    pub verse: u32,
    #[serde(default)]
    pub suffix: String,
    pub text: String,
    #[serde(default)]
    pub source_version: Option<String>,
    #[serde(default)]
    pub book_name: Option<String>,
    #[serde(default)]
    pub testament: Option<Testament>,
}

impl VerseRecord {
    pub fn new(
        translation: &str,
        book: u32,
        chapter: u32,
        verse: u32,
        suffix: &str,
        text: &str,
    ) -> Self {
        Self {
            translation: translation.to_string(),
            book,
            chapter,
            verse,
            suffix: suffix.to_string(),
            text: text.to_string(),
            source_version: None,
            book_name: None,
            testament: None,
        }
    }
}

/// What to do when a natural key is re-ingested with different content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    #[default]
    Reject,
    Overwrite,
}

impl FromStr for ConflictPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reject" => Ok(Self::Reject),
            "overwrite" => Ok(Self::Overwrite),
            other => Err(Error::Config(format!(
                "unknown conflict policy '{other}' (expected reject or overwrite)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl IngestReport {
    fn count(&mut self, outcome: IngestOutcome) {
        match outcome {
            IngestOutcome::Inserted => self.inserted += 1,
            IngestOutcome::Updated => self.updated += 1,
            IngestOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

/// Ingest a single verse in its own transaction.
pub fn ingest_verse(
    db: &CorpusDb,
    record: &VerseRecord,
    policy: ConflictPolicy,
) -> Result<IngestOutcome> {
    let txn = db.database().begin_write()?;
    let outcome = ingest_in_txn(&txn, record, policy)?;
    txn.commit()?;
    Ok(outcome)
}

/// Ingest a batch atomically: any rejected record aborts the whole batch.
pub fn ingest_batch(
    db: &CorpusDb,
    records: &[VerseRecord],
    policy: ConflictPolicy,
) -> Result<IngestReport> {
    let mut report = IngestReport::default();
    if records.is_empty() {
        return Ok(report);
    }
    let txn = db.database().begin_write()?;
    for record in records {
        report.count(ingest_in_txn(&txn, record, policy)?);
    }
    txn.commit()?;
    debug!(?report, "ingested batch");
    Ok(report)
}

fn ingest_in_txn(
    txn: &WriteTransaction,
    record: &VerseRecord,
    policy: ConflictPolicy,
) -> Result<IngestOutcome> {
    let key = NaturalKey::new(
        &record.translation,
        record.book,
        record.chapter,
        record.verse,
        &record.suffix,
    )?;
    let id = VerseId::from_key(&key);

    ensure_parents(txn, record)?;

    let mut keys = txn.open_table(VERSE_KEYS)?;
    let mut verses = txn.open_table(VERSES)?;
    let key_tuple = (
        key.translation.as_str(),
        key.book,
        key.chapter,
        key.verse,
        key.suffix.as_str(),
    );

    if let Some(existing) = keys.get(key_tuple)? {
        let existing = existing.value().to_string();
        if existing != id.as_str() {
            return Err(Error::Conflict {
                key: id.to_string(),
                reason: format!("natural key already maps to {existing}"),
            });
        }
    }

    let Some(mut verse) = load_verse(&verses, id.as_str())? else {
        keys.insert(key_tuple, id.as_str())?;
        let verse = Verse {
            id: id.clone(),
            key,
            text: record.text.clone(),
            source_version: record.source_version.clone(),
            absolute_index: None,
        };
        let bytes = serde_json::to_vec(&verse)?;
        verses.insert(id.as_str(), bytes.as_slice())?;
        return Ok(IngestOutcome::Inserted);
    };

    if verse.key != key {
        return Err(Error::Conflict {
            key: id.to_string(),
            reason: "identifier already belongs to a different natural key"
                .into(),
        });
    }
    if verse.text == record.text
        && verse.source_version == record.source_version
    {
        return Ok(IngestOutcome::Unchanged);
    }

    match policy {
        ConflictPolicy::Reject => Err(Error::Conflict {
            key: id.to_string(),
            reason: "verse already exists with different content".into(),
        }),
        ConflictPolicy::Overwrite => {
            verse.text = record.text.clone();
            verse.source_version = record.source_version.clone();
            let bytes = serde_json::to_vec(&verse)?;
            verses.insert(id.as_str(), bytes.as_slice())?;
            Ok(IngestOutcome::Updated)
        }
    }
}

/// Create the translation, book and chapter rows a verse hangs off.
fn ensure_parents(txn: &WriteTransaction, record: &VerseRecord) -> Result<()> {
    let code = record.translation.as_str();
    {
        let mut table = txn.open_table(TRANSLATIONS)?;
        if table.get(code)?.is_none() {
            let translation = Translation {
                code: code.to_string(),
                language: None,
                format: None,
                source_version: record.source_version.clone(),
            };
            let bytes = serde_json::to_vec(&translation)?;
            table.insert(code, bytes.as_slice())?;
        }
    }
    {
        let mut table = txn.open_table(BOOKS)?;
        let existing: Option<Book> = match table.get((code, record.book))? {
            Some(guard) => Some(serde_json::from_slice(guard.value())?),
            None => None,
        };
        let needs_write = match &existing {
            None => true,
            Some(book) => {
                (book.name.is_none() && record.book_name.is_some())
                    || (book.testament.is_none() && record.testament.is_some())
            }
        };
        if needs_write {
            let book = Book {
                translation: code.to_string(),
                number: record.book,
                name: existing
                    .as_ref()
                    .and_then(|b| b.name.clone())
                    .or_else(|| record.book_name.clone()),
                testament: existing
                    .as_ref()
                    .and_then(|b| b.testament)
                    .or(record.testament),
            };
            let bytes = serde_json::to_vec(&book)?;
            table.insert((code, record.book), bytes.as_slice())?;
        }
    }
    {
        let mut table = txn.open_table(CHAPTERS)?;
        if table.get((code, record.book, record.chapter))?.is_none() {
            table.insert((code, record.book, record.chapter), ())?;
        }
    }
    Ok(())
}

/// Read newline-delimited JSON verse records, skipping blank lines.
pub fn read_records(reader: impl BufRead) -> Result<Vec<VerseRecord>> {
    let mut records = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| {
            Error::InvalidInput {
                line: line_no + 1,
                reason: e.to_string(),
            }
        })?;
        records.push(record);
    }
    Ok(records)
}
