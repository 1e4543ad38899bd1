use std::{io::BufRead, path::Path};

use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    ReadableTableMetadata,
    TableDefinition,
    WriteTransaction,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    ann_index::{IndexCatalog, IndexDefinition},
    corpus_db::CorpusDb,
    error::{Error, Result},
    migrations::{self, Migration},
};

const VERSE_EMBEDDINGS: TableDefinition<(&str, &str), &[u8]> =
    TableDefinition::new("verse_embeddings");
const CHUNK_EMBEDDINGS: TableDefinition<(&str, &str), &[u8]> =
    TableDefinition::new("chunk_embeddings");
const ASSET_EMBEDDINGS: TableDefinition<(&str, &str), &[u8]> =
    TableDefinition::new("asset_embeddings");
/// Embedding table name -> declared vector length.
const DIMENSIONS: TableDefinition<&str, u64> =
    TableDefinition::new("embedding_dimensions");
/// Embedding table name -> JSON [`IndexDefinition`].
const ANN_INDEXES: TableDefinition<&str, &str> =
    TableDefinition::new("ann_indexes");

/// Header size: 4 bytes dimension + 4 bytes label count.
const HEADER_SIZE: usize = 8;

fn create_embedding_tables(txn: &WriteTransaction) -> Result<()> {
    for table in EmbeddingTable::ALL {
        txn.open_table(table.definition())?;
    }
    txn.open_table(DIMENSIONS)?;
    Ok(())
}

fn create_index_catalog(txn: &WriteTransaction) -> Result<()> {
    txn.open_table(ANN_INDEXES)?;
    Ok(())
}

const EMBEDDING_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "embedding tables",
        apply: create_embedding_tables,
    },
    Migration {
        version: 2,
        name: "ann index catalog",
        apply: create_index_catalog,
    },
];

/// The three kinds of embedding owner.
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
#[serde(rename_all = "snake_case")]
pub enum EmbeddingTable {
    Verse,
    Chunk,
    Asset,
}

impl EmbeddingTable {
    pub const ALL: [EmbeddingTable; 3] = [Self::Verse, Self::Chunk, Self::Asset];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verse => "verse_embeddings",
            Self::Chunk => "chunk_embeddings",
            Self::Asset => "asset_embeddings",
        }
    }

    fn definition(
        self,
    ) -> TableDefinition<'static, (&'static str, &'static str), &'static [u8]>
    {
        match self {
            Self::Verse => VERSE_EMBEDDINGS,
            Self::Chunk => CHUNK_EMBEDDINGS,
            Self::Asset => ASSET_EMBEDDINGS,
        }
    }
}

impl std::str::FromStr for EmbeddingTable {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "verse" | "verse_embeddings" => Ok(Self::Verse),
            "chunk" | "chunk_embeddings" => Ok(Self::Chunk),
            "asset" | "asset_embeddings" => Ok(Self::Asset),
            other => Err(Error::Config(format!(
                "unknown embedding table '{other}' (expected verse, chunk or asset)"
            ))),
        }
    }
}

/// One vector for one owner under one model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EmbeddingRecord {
    /// Verse id, chunk id or asset id.
    pub owner: String,
    pub model: String,
    pub vector: Vec<f32>,
    /// Small integer tags for pre-filtering. Sorted and deduplicated on
    /// write.
    #[serde(default)]
    pub labels: Vec<u16>,
}

impl EmbeddingRecord {
    pub fn new(owner: &str, model: &str, vector: Vec<f32>) -> Self {
        Self {
            owner: owner.to_string(),
            model: model.to_string(),
            vector,
            labels: Vec::new(),
        }
    }

    pub fn with_labels(mut self, labels: &[u16]) -> Self {
        self.labels = labels.to_vec();
        self
    }
}

/// Embedding progress for one translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageStats {
    pub translation: String,
    pub verses: u64,
    pub embedded: u64,
    /// Verses with no embedding for the model.
    pub missing: u64,
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let chunk = bytes.get(at..at + 4)?;
    Some(u32::from_le_bytes(chunk.try_into().ok()?))
}

/// Binary format per entry:
/// - 4 bytes: dimension D (u32 LE)
/// - 4 bytes: label count L (u32 LE)
/// - D * 4 bytes: f32 values
/// - L * 2 bytes: u16 labels
fn encoded_len(dimension: usize, labels: usize) -> usize {
    HEADER_SIZE + dimension * 4 + labels * 2
}

fn decode(owner: &str, model: &str, bytes: &[u8]) -> Option<EmbeddingRecord> {
    let dimension = read_u32(bytes, 0)? as usize;
    let label_count = read_u32(bytes, 4)? as usize;
    if bytes.len() != encoded_len(dimension, label_count) {
        return None;
    }
    let split = HEADER_SIZE + dimension * 4;
    Some(EmbeddingRecord {
        owner: owner.to_string(),
        model: model.to_string(),
        vector: bytemuck::pod_collect_to_vec(&bytes[HEADER_SIZE..split]),
        labels: bytemuck::pod_collect_to_vec(&bytes[split..]),
    })
}

/// Vector embeddings for verses, chunks and assets, keyed by
/// (owner id, model). Each table has a declared dimensionality that every
/// write must match.
pub struct EmbeddingDb {
    db: Database,
}

impl EmbeddingDb {
    /// Open or create the embedding store. Tables without a declared
    /// dimensionality get `default_dimension`.
    pub fn open(path: &Path, default_dimension: usize) -> Result<Self> {
        let db = Database::create(path)?;
        migrations::apply(&db, "embeddings", EMBEDDING_MIGRATIONS)?;

        let txn = db.begin_write()?;
        {
            let mut dims = txn.open_table(DIMENSIONS)?;
            for table in EmbeddingTable::ALL {
                if dims.get(table.as_str())?.is_none() {
                    dims.insert(table.as_str(), default_dimension as u64)?;
                }
            }
        }
        txn.commit()?;

        Ok(Self { db })
    }

    pub fn dimension(&self, table: EmbeddingTable) -> Result<usize> {
        let txn = self.db.begin_read()?;
        let dims = txn.open_table(DIMENSIONS)?;
        dims.get(table.as_str())?
            .map(|d| d.value() as usize)
            .ok_or_else(|| Error::NotFound {
                kind: "embedding dimension",
                name: table.as_str().to_string(),
            })
    }

    /// Change a table's declared dimensionality. Only allowed while the
    /// table is empty.
    pub fn declare_dimension(
        &self,
        table: EmbeddingTable,
        dimension: usize,
    ) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let rows = txn.open_table(table.definition())?.len()?;
            let mut dims = txn.open_table(DIMENSIONS)?;
            let current = dims.get(table.as_str())?.map(|d| d.value() as usize);
            if rows > 0 && current != Some(dimension) {
                return Err(Error::Config(format!(
                    "{} holds {rows} embeddings; cannot change dimension to {dimension}",
                    table.as_str()
                )));
            }
            dims.insert(table.as_str(), dimension as u64)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn store_in_txn(
        txn: &WriteTransaction,
        table: EmbeddingTable,
        record: &EmbeddingRecord,
    ) -> Result<()> {
        let expected = txn
            .open_table(DIMENSIONS)?
            .get(table.as_str())?
            .map(|d| d.value() as usize)
            .unwrap_or(0);
        if record.vector.len() != expected {
            return Err(Error::DimensionMismatch {
                table: table.as_str(),
                expected,
                actual: record.vector.len(),
            });
        }

        let mut labels = record.labels.clone();
        labels.sort_unstable();
        labels.dedup();

        let byte_len = encoded_len(record.vector.len(), labels.len());
        let split = HEADER_SIZE + record.vector.len() * 4;

        let mut rows = txn.open_table(table.definition())?;
        let mut guard = rows
            .insert_reserve((record.owner.as_str(), record.model.as_str()), byte_len)?;
        let dest = guard.as_mut();
        dest[0..4].copy_from_slice(&(record.vector.len() as u32).to_le_bytes());
        dest[4..8].copy_from_slice(&(labels.len() as u32).to_le_bytes());
        dest[HEADER_SIZE..split].copy_from_slice(bytemuck::cast_slice(&record.vector));
        dest[split..].copy_from_slice(bytemuck::cast_slice(&labels));
        Ok(())
    }

    /// Store or overwrite one embedding.
    pub fn store(&self, table: EmbeddingTable, record: &EmbeddingRecord) -> Result<()> {
        let txn = self.db.begin_write()?;
        Self::store_in_txn(&txn, table, record)?;
        txn.commit()?;
        Ok(())
    }

    /// Store several embeddings in a single transaction.
    pub fn store_batch(
        &self,
        table: EmbeddingTable,
        records: &[EmbeddingRecord],
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        for record in records {
            Self::store_in_txn(&txn, table, record)?;
        }
        txn.commit()?;
        debug!(table = table.as_str(), count = records.len(), "stored embeddings");
        Ok(())
    }

    /// Store a verse embedding after checking the verse exists.
    pub fn store_verse_embedding(
        &self,
        corpus: &CorpusDb,
        record: &EmbeddingRecord,
    ) -> Result<()> {
        if corpus.get_verse(&record.owner)?.is_none() {
            return Err(Error::NotFound {
                kind: "verse",
                name: record.owner.clone(),
            });
        }
        self.store(EmbeddingTable::Verse, record)
    }

    pub fn load(
        &self,
        table: EmbeddingTable,
        owner: &str,
        model: &str,
    ) -> Result<Option<EmbeddingRecord>> {
        let txn = self.db.begin_read()?;
        let rows = txn.open_table(table.definition())?;
        let Some(guard) = rows.get((owner, model))? else {
            return Ok(None);
        };
        Ok(decode(owner, model, guard.value()))
    }

    pub fn remove(&self, table: EmbeddingTable, owner: &str, model: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut rows = txn.open_table(table.definition())?;
            rows.remove((owner, model))?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    /// Every embedding of `model` in a table, ordered by owner id.
    pub fn records_for_model(
        &self,
        table: EmbeddingTable,
        model: &str,
    ) -> Result<Vec<EmbeddingRecord>> {
        let txn = self.db.begin_read()?;
        let rows = txn.open_table(table.definition())?;
        let mut result = Vec::new();
        for entry in rows.iter()? {
            let (k, v) = entry?;
            let (owner, m) = k.value();
            if m != model {
                continue;
            }
            if let Some(record) = decode(owner, m, v.value()) {
                result.push(record);
            }
        }
        Ok(result)
    }

    /// How many verses of each translation have an embedding for `model`.
    pub fn embedding_coverage(
        &self,
        corpus: &CorpusDb,
        model: &str,
    ) -> Result<Vec<CoverageStats>> {
        let txn = self.db.begin_read()?;
        let rows = txn.open_table(VERSE_EMBEDDINGS)?;
        let mut result = Vec::new();
        for translation in corpus.list_translations()? {
            let verses = corpus.verses_in_translation(&translation.code)?;
            let mut embedded = 0;
            for verse in &verses {
                if rows.get((verse.id.as_str(), model))?.is_some() {
                    embedded += 1;
                }
            }
            result.push(CoverageStats {
                translation: translation.code,
                verses: verses.len() as u64,
                embedded,
                missing: verses.len() as u64 - embedded,
            });
        }
        Ok(result)
    }
}

/// Read newline-delimited JSON embedding records, skipping blank lines.
pub fn read_embedding_records(reader: impl BufRead) -> Result<Vec<EmbeddingRecord>> {
    let mut records = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| Error::InvalidInput {
            line: line_no + 1,
            reason: e.to_string(),
        })?;
        records.push(record);
    }
    Ok(records)
}

impl IndexCatalog for EmbeddingDb {
    fn existing_index(
        &self,
        table: EmbeddingTable,
    ) -> Result<Option<IndexDefinition>> {
        let txn = self.db.begin_read()?;
        let catalog = txn.open_table(ANN_INDEXES)?;
        match catalog.get(table.as_str())? {
            Some(json) => Ok(Some(serde_json::from_str(json.value())?)),
            None => Ok(None),
        }
    }

    fn row_count(&self, table: EmbeddingTable) -> Result<u64> {
        let txn = self.db.begin_read()?;
        Ok(txn.open_table(table.definition())?.len()?)
    }

    fn create_index(&self, definition: &IndexDefinition) -> Result<()> {
        let json = serde_json::to_string(definition)?;
        let txn = self.db.begin_write()?;
        {
            let mut catalog = txn.open_table(ANN_INDEXES)?;
            if catalog.get(definition.table.as_str())?.is_some() {
                return Err(Error::Conflict {
                    key: definition.table.as_str().to_string(),
                    reason: "an ANN index already exists".to_string(),
                });
            }
            catalog.insert(definition.table.as_str(), json.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn replace_index(
        &self,
        definition: &IndexDefinition,
    ) -> Result<Option<IndexDefinition>> {
        let json = serde_json::to_string(definition)?;
        let txn = self.db.begin_write()?;
        let previous = {
            let mut catalog = txn.open_table(ANN_INDEXES)?;
            let previous = catalog.insert(definition.table.as_str(), json.as_str())?;
            match previous {
                Some(old) => Some(serde_json::from_str(old.value())?),
                None => None,
            }
        };
        txn.commit()?;
        Ok(previous)
    }
}

impl std::fmt::Debug for EmbeddingDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingDb").finish_non_exhaustive()
    }
}
