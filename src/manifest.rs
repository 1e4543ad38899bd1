//! Run manifests: the JSON document describing one ingestion/embedding run
//! (embedding recipe and index plan), stored verbatim under its run id.

use redb::{ReadableDatabase, ReadableTable};
use serde::Deserialize;
use tracing::debug;

use crate::{
    corpus_db::{CorpusDb, RUN_MANIFESTS},
    error::{Error, Result},
};

/// Store a manifest. The text must be a JSON object and is kept byte for
/// byte. Re-storing the same text is a no-op; different text under an
/// existing run id is a conflict.
pub fn put_manifest(db: &CorpusDb, run_id: &str, json: &str) -> Result<()> {
    if run_id.trim().is_empty() {
        return Err(Error::InvalidKey {
            field: "run id",
            reason: "must not be empty".to_string(),
        });
    }
    let value: serde_json::Value = serde_json::from_str(json)?;
    if !value.is_object() {
        return Err(Error::InvalidInput {
            line: 1,
            reason: "manifest must be a JSON object".to_string(),
        });
    }

    let txn = db.database().begin_write()?;
    {
        let mut table = txn.open_table(RUN_MANIFESTS)?;
        let existing = table.get(run_id)?.map(|v| v.value().to_string());
        match existing {
            Some(stored) if stored == json => return Ok(()),
            Some(_) => {
                return Err(Error::Conflict {
                    key: run_id.to_string(),
                    reason: "a different manifest is already stored".to_string(),
                });
            }
            None => {
                table.insert(run_id, json)?;
            }
        }
    }
    txn.commit()?;
    debug!(run_id, "stored run manifest");
    Ok(())
}

pub fn get_manifest(db: &CorpusDb, run_id: &str) -> Result<Option<String>> {
    let txn = db.database().begin_read()?;
    let table = txn.open_table(RUN_MANIFESTS)?;
    Ok(table.get(run_id)?.map(|v| v.value().to_string()))
}

/// Stored run ids in ascending order.
pub fn list_manifests(db: &CorpusDb) -> Result<Vec<String>> {
    let txn = db.database().begin_read()?;
    let table = txn.open_table(RUN_MANIFESTS)?;
    let mut ids = Vec::new();
    for entry in table.iter()? {
        let (k, _) = entry?;
        ids.push(k.value().to_string());
    }
    Ok(ids)
}

/// Read-only typed view over the parts of a manifest this crate uses.
/// Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RunManifest {
    pub embedding: Option<EmbeddingRecipe>,
    pub index_plan: IndexPlan,
}

impl RunManifest {
    pub fn parse(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EmbeddingRecipe {
    pub model: String,
    pub dimensions: usize,
    #[serde(default)]
    pub chunking: Option<ChunkingParams>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ChunkingParams {
    pub size: usize,
    #[serde(default)]
    pub overlap: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct IndexPlan {
    pub hybrid: HybridPlan,
}

/// Candidate list sizes for hybrid retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HybridPlan {
    pub vector_k: usize,
    pub fts_k: usize,
}

impl Default for HybridPlan {
    fn default() -> Self {
        Self {
            vector_k: 50,
            fts_k: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
  "run_id": "2026-03-01",
  "embedding": {
    "model": "embeddinggemma",
    "dimensions": 768,
    "chunking": { "size": 512, "overlap": 64 }
  },
  "index_plan": { "hybrid": { "vector_k": 40 } },
  "notes": "kept verbatim"
}"#;

    fn test_db() -> (tempfile::TempDir, CorpusDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = CorpusDb::open(&tmp.path().join("corpus.redb")).unwrap();
        (tmp, db)
    }

    #[test]
    fn stores_text_verbatim() {
        let (_tmp, db) = test_db();
        put_manifest(&db, "run-1", MANIFEST).unwrap();
        assert_eq!(get_manifest(&db, "run-1").unwrap().as_deref(), Some(MANIFEST));
        assert_eq!(list_manifests(&db).unwrap(), vec!["run-1"]);
    }

    #[test]
    fn same_text_is_idempotent_and_different_text_conflicts() {
        let (_tmp, db) = test_db();
        put_manifest(&db, "run-1", MANIFEST).unwrap();
        put_manifest(&db, "run-1", MANIFEST).unwrap();
        assert!(matches!(
            put_manifest(&db, "run-1", "{}"),
            Err(Error::Conflict { .. })
        ));
    }

    #[test]
    fn rejects_non_objects() {
        let (_tmp, db) = test_db();
        assert!(matches!(put_manifest(&db, "r", "[1, 2]"), Err(Error::InvalidInput { .. })));
        assert!(matches!(put_manifest(&db, "r", "{"), Err(Error::Json(_))));
        assert!(put_manifest(&db, " ", "{}").is_err());
    }

    #[test]
    fn typed_view_fills_defaults() {
        let manifest = RunManifest::parse(MANIFEST).unwrap();
        let recipe = manifest.embedding.unwrap();
        assert_eq!(recipe.dimensions, 768);
        assert_eq!(recipe.chunking, Some(ChunkingParams { size: 512, overlap: 64 }));
        assert_eq!(manifest.index_plan.hybrid, HybridPlan { vector_k: 40, fts_k: 50 });

        assert_eq!(RunManifest::parse("{}").unwrap(), RunManifest::default());
    }
}
