use std::path::Path;

use serde::Serialize;
use tantivy::{
    Index,
    IndexReader,
    IndexWriter,
    TantivyDocument,
    collector::TopDocs,
    doc,
    query::{BooleanQuery, Occur, Query, QueryParser, TermQuery},
    schema::*,
    tokenizer::{
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
    },
};

use crate::{corpus_db::Verse, error::Result};

/// Memory budget for writers created by [`LexicalIndex::index_verses`].
pub const WRITER_MEMORY_BUDGET: usize = 50_000_000;

/// Field names used in the schema.
pub mod fields {
    pub const VERSE_ID: &str = "verse_id";
    pub const TRANSLATION: &str = "translation";
    pub const BOOK: &str = "book";
    pub const CHAPTER: &str = "chapter";
    pub const TEXT: &str = "text";
}

/// Tantivy full-text index over verse text.
pub struct LexicalIndex {
    index: Index,
    reader: IndexReader,
    fields: SchemaFields,
}

/// Resolved field handles for the schema.
#[derive(Clone, Copy)]
pub struct SchemaFields {
    pub verse_id: Field,
    pub translation: Field,
    pub book: Field,
    pub chapter: Field,
    pub text: Field,
}

/// A lexical match.
#[derive(Debug, Clone, Serialize)]
pub struct LexicalHit {
    pub score: f32,
    pub verse_id: String,
    pub translation: String,
    pub book: u64,
    pub chapter: u64,
    pub text: String,
}

fn build_schema() -> (Schema, SchemaFields) {
    let mut builder = Schema::builder();

    let verse_id = builder.add_text_field(fields::VERSE_ID, STRING | STORED);
    let translation =
        builder.add_text_field(fields::TRANSLATION, STRING | STORED | FAST);
    let book = builder.add_u64_field(fields::BOOK, STORED | FAST);
    let chapter = builder.add_u64_field(fields::CHAPTER, STORED | FAST);

    let text_opts = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer("en_stem")
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored();
    let text = builder.add_text_field(fields::TEXT, text_opts);

    let schema = builder.build();
    let fields = SchemaFields {
        verse_id,
        translation,
        book,
        chapter,
        text,
    };

    (schema, fields)
}

fn register_tokenizers(index: &Index) {
    let en_stem = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(tantivy::tokenizer::Language::English))
        .build();
    index.tokenizers().register("en_stem", en_stem);
}

impl LexicalIndex {
    /// Open or create an index at the given directory.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let (schema, fields) = build_schema();

        let mmap_dir = tantivy::directory::MmapDirectory::open(dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?;
        let index = if Index::exists(&mmap_dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?
        {
            Index::open(mmap_dir)?
        } else {
            Index::create(mmap_dir, schema, tantivy::IndexSettings::default())?
        };

        register_tokenizers(&index);
        let reader = index.reader()?;

        Ok(Self {
            index,
            reader,
            fields,
        })
    }

    /// Create an in-memory index (for testing).
    pub fn open_in_ram() -> Result<Self> {
        let (schema, fields) = build_schema();
        let index = Index::create_in_ram(schema);
        register_tokenizers(&index);
        let reader = index.reader()?;

        Ok(Self {
            index,
            reader,
            fields,
        })
    }

    pub fn fields(&self) -> SchemaFields {
        self.fields
    }

    /// Create a writer with the given memory budget (in bytes).
    pub fn writer(&self, memory_budget: usize) -> Result<IndexWriter> {
        Ok(self.index.writer(memory_budget)?)
    }

    /// Add or replace one verse via the given writer.
    pub fn add_verse(&self, writer: &IndexWriter, verse: &Verse) -> Result<()> {
        let f = self.fields;

        let term = tantivy::Term::from_field_text(f.verse_id, verse.id.as_str());
        writer.delete_term(term);

        writer.add_document(doc!(
            f.verse_id => verse.id.as_str(),
            f.translation => verse.key.translation.as_str(),
            f.book => u64::from(verse.key.book),
            f.chapter => u64::from(verse.key.chapter),
            f.text => verse.text.as_str(),
        ))?;

        Ok(())
    }

    /// Index a batch of verses and commit.
    pub fn index_verses(&self, verses: &[Verse]) -> Result<usize> {
        let mut writer = self.writer(WRITER_MEMORY_BUDGET)?;
        for verse in verses {
            self.add_verse(&writer, verse)?;
        }
        writer.commit()?;
        Ok(verses.len())
    }

    /// Delete every verse of a translation.
    pub fn delete_translation(&self, writer: &IndexWriter, translation: &str) {
        let term =
            tantivy::Term::from_field_text(self.fields.translation, translation);
        writer.delete_term(term);
    }

    /// BM25 search over verse text, optionally restricted to one
    /// translation.
    pub fn search(
        &self,
        query_str: &str,
        translation: Option<&str>,
        limit: usize,
    ) -> Result<Vec<LexicalHit>> {
        let f = self.fields;
        self.reader.reload()?;
        let searcher = self.reader.searcher();

        let parser = QueryParser::for_index(&self.index, vec![f.text]);
        let (user_query, _errors) = parser.parse_query_lenient(query_str);

        let query: Box<dyn Query> = match translation {
            Some(code) => {
                let term = tantivy::Term::from_field_text(f.translation, code);
                let filter = TermQuery::new(term, IndexRecordOption::Basic);
                Box::new(BooleanQuery::new(vec![
                    (Occur::Must, user_query),
                    (Occur::Must, Box::new(filter)),
                ]))
            }
            None => user_query,
        };

        let top_docs = searcher.search(&*query, &TopDocs::with_limit(limit))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher.doc(doc_address)?;
            results.push(LexicalHit {
                score,
                verse_id: extract_text(&doc, f.verse_id),
                translation: extract_text(&doc, f.translation),
                book: extract_u64(&doc, f.book),
                chapter: extract_u64(&doc, f.chapter),
                text: extract_text(&doc, f.text),
            });
        }

        Ok(results)
    }

    /// Number of live documents.
    pub fn num_docs(&self) -> Result<u64> {
        self.reader.reload()?;
        Ok(self.reader.searcher().num_docs())
    }
}

impl std::fmt::Debug for LexicalIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LexicalIndex").finish_non_exhaustive()
    }
}

fn extract_text(doc: &TantivyDocument, field: Field) -> String {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn extract_u64(doc: &TantivyDocument, field: Field) -> u64 {
    doc.get_first(field).and_then(|v| v.as_u64()).unwrap_or(0)
}
