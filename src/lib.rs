//! versedb - storage, numbering, grouping and retrieval for verse corpora.
//!
//! Verses from many translations are stored under deterministic ids
//! derived from their natural key, numbered sequentially per translation,
//! grouped into ordered buckets, and searched through a
//! [Tantivy](https://github.com/quickwit-oss/tantivy) full-text index and
//! a vector store. All persistent state lives in [redb](https://www.redb.org)
//! databases under one data directory.
//!
//! # Quick start
//!
//! ```no_run
//! use versedb::{CorpusDb, DataDir};
//! use versedb::ingestion::{self, ConflictPolicy, VerseRecord};
//! use versedb::{buckets, sequential};
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let corpus = CorpusDb::open(&data_dir.corpus_db()).unwrap();
//!
//! let records = vec![
//!     VerseRecord::new("KJV", 43, 11, 35, "", "Jesus wept."),
//!     VerseRecord::new("KJV", 43, 11, 36, "", "Then said the Jews, Behold how he loved him!"),
//! ];
//! ingestion::ingest_batch(&corpus, &records, ConflictPolicy::Reject).unwrap();
//!
//! let report = sequential::backfill_absolute_index(&corpus).unwrap();
//! assert!(report.is_success());
//! buckets::build_chapter_buckets(&corpus).unwrap();
//!
//! for verse in corpus.absolute_slice("KJV", 1, 2).unwrap() {
//!     println!("{} {}", verse.id, verse.text);
//! }
//! ```

pub mod ann_index;
pub mod buckets;
pub mod corpus_db;
pub mod data_dir;
pub mod embedding_db;
pub mod error;
pub mod ingestion;
pub mod lexical_index;
pub mod manifest;
pub mod migrations;
pub mod query_log;
pub mod search;
pub mod sequential;
pub mod settings;
pub mod verse_id;

pub use corpus_db::CorpusDb;
pub use data_dir::DataDir;
pub use embedding_db::EmbeddingDb;
pub use error::{Error, Result};
pub use lexical_index::LexicalIndex;
pub use query_log::QueryLog;
pub use settings::Settings;
pub use verse_id::{NaturalKey, VerseId};
