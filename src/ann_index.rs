//! ANN index method selection.
//!
//! The engine that serves vector search is probed once for the access
//! methods and extensions it provides, and the first entry of the cascade
//! whose prerequisites hold is applied to every embedding table. An index
//! that already exists is never replaced here; switching methods goes
//! through [`rebuild_ann_index`].

use std::{collections::BTreeSet, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    corpus_db::CorpusDb,
    embedding_db::EmbeddingTable,
    error::{Error, Result},
};

pub const HNSW_M: u32 = 16;
pub const HNSW_EF_CONSTRUCTION: u32 = 64;
pub const DISKANN_NUM_NEIGHBORS: u32 = 50;
/// Rows per IVF list.
pub const IVFFLAT_ROWS_PER_LIST: u64 = 1000;

pub const SETTING_ACCESS_METHODS: &str = "ann.access_methods";
pub const SETTING_EXTENSIONS: &str = "ann.extensions";

/// Supported methods, highest fidelity first.
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
pub enum IndexMethod {
    /// Disk-resident graph index with label pre-filtering.
    DiskAnnFiltered,
    /// In-memory graph index, no label filtering.
    Hnsw,
    /// Partition-and-probe clustering index. Always available.
    IvfFlat,
}

impl IndexMethod {
    pub const CASCADE: [IndexMethod; 3] =
        [Self::DiskAnnFiltered, Self::Hnsw, Self::IvfFlat];

    /// Access method name as registered with the engine.
    pub fn access_method(self) -> &'static str {
        match self {
            Self::DiskAnnFiltered => "diskann",
            Self::Hnsw => "hnsw",
            Self::IvfFlat => "ivfflat",
        }
    }

    pub fn supports_label_filter(self) -> bool {
        matches!(self, Self::DiskAnnFiltered)
    }

    fn is_available(self, caps: &EngineCapabilities) -> bool {
        match self {
            Self::DiskAnnFiltered => {
                caps.has_access_method("diskann")
                    && caps.has_extension("vectorscale")
            }
            Self::Hnsw => caps.has_access_method("hnsw"),
            Self::IvfFlat => true,
        }
    }
}

impl fmt::Display for IndexMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.access_method())
    }
}

impl FromStr for IndexMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "diskann" => Ok(Self::DiskAnnFiltered),
            "hnsw" => Ok(Self::Hnsw),
            "ivfflat" => Ok(Self::IvfFlat),
            other => Err(Error::Config(format!(
                "unknown index method '{other}' (expected diskann, hnsw or ivfflat)"
            ))),
        }
    }
}

/// What the vector engine reports as installed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineCapabilities {
    pub access_methods: BTreeSet<String>,
    pub extensions: BTreeSet<String>,
}

impl EngineCapabilities {
    /// Capabilities assumed when probing fails.
    pub fn fallback() -> Self {
        Self {
            access_methods: BTreeSet::from(["ivfflat".to_string()]),
            extensions: BTreeSet::new(),
        }
    }

    pub fn has_access_method(&self, name: &str) -> bool {
        self.access_methods.contains(name)
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.contains(name)
    }

    /// First cascade entry whose prerequisites are met.
    pub fn best_method(&self) -> IndexMethod {
        IndexMethod::CASCADE
            .into_iter()
            .find(|m| m.is_available(self))
            .unwrap_or(IndexMethod::IvfFlat)
    }
}

/// Read-only view of the engine's feature registry.
pub trait CapabilityProbe {
    fn probe(&self) -> Result<EngineCapabilities>;
}

/// Probe backed by the corpus settings table, where deployments record the
/// access methods and extensions their vector engine exposes as
/// comma-separated lists.
pub struct SettingsProbe<'a> {
    db: &'a CorpusDb,
}

impl<'a> SettingsProbe<'a> {
    pub fn new(db: &'a CorpusDb) -> Self {
        Self { db }
    }
}

fn split_list(value: Option<String>) -> BTreeSet<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

impl CapabilityProbe for SettingsProbe<'_> {
    fn probe(&self) -> Result<EngineCapabilities> {
        let access_methods =
            split_list(self.db.get_setting(SETTING_ACCESS_METHODS)?);
        if access_methods.is_empty() {
            return Err(Error::Config(format!(
                "{SETTING_ACCESS_METHODS} is not set"
            )));
        }
        let extensions = split_list(self.db.get_setting(SETTING_EXTENSIONS)?);
        Ok(EngineCapabilities {
            access_methods,
            extensions,
        })
    }
}

/// Probe the engine, degrading to [`EngineCapabilities::fallback`] when
/// the registry cannot be read.
pub fn detect_capabilities(probe: &dyn CapabilityProbe) -> EngineCapabilities {
    match probe.probe() {
        Ok(caps) => caps,
        Err(e) => {
            warn!(
                error = %e,
                "capability probe failed, running in degraded mode with ivfflat"
            );
            EngineCapabilities::fallback()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    Cosine,
}

impl DistanceMetric {
    fn operator_class(self) -> &'static str {
        match self {
            Self::Cosine => "vector_cosine_ops",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexParams {
    DiskAnn { num_neighbors: u32 },
    Hnsw { m: u32, ef_construction: u32 },
    IvfFlat { lists: u64 },
}

impl IndexParams {
    pub fn for_method(method: IndexMethod, rows: u64) -> Self {
        match method {
            IndexMethod::DiskAnnFiltered => Self::DiskAnn {
                num_neighbors: DISKANN_NUM_NEIGHBORS,
            },
            IndexMethod::Hnsw => Self::Hnsw {
                m: HNSW_M,
                ef_construction: HNSW_EF_CONSTRUCTION,
            },
            IndexMethod::IvfFlat => Self::IvfFlat {
                lists: (rows / IVFFLAT_ROWS_PER_LIST).max(1),
            },
        }
    }

    fn with_clause(self) -> String {
        match self {
            Self::DiskAnn { num_neighbors } => {
                format!("num_neighbors = {num_neighbors}")
            }
            Self::Hnsw { m, ef_construction } => {
                format!("m = {m}, ef_construction = {ef_construction}")
            }
            Self::IvfFlat { lists } => format!("lists = {lists}"),
        }
    }
}

pub fn quote_ident(input: &str) -> String {
    format!("\"{}\"", input.replace('"', "\"\""))
}

/// A planned or recorded ANN index on one embedding table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub table: EmbeddingTable,
    pub method: IndexMethod,
    pub metric: DistanceMetric,
    pub params: IndexParams,
    /// Equivalent statement for a PostgreSQL deployment.
    pub ddl: String,
    pub created_at: DateTime<Utc>,
}

impl IndexDefinition {
    pub fn plan(table: EmbeddingTable, method: IndexMethod, rows: u64) -> Self {
        let name = format!("{}_{}_idx", table.as_str(), method.access_method());
        let metric = DistanceMetric::Cosine;
        let params = IndexParams::for_method(method, rows);

        let columns = if method.supports_label_filter() {
            format!("embedding {}, labels", metric.operator_class())
        } else {
            format!("embedding {}", metric.operator_class())
        };
        let ddl = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} USING {} ({}) WITH ({})",
            quote_ident(&name),
            quote_ident(table.as_str()),
            method.access_method(),
            columns,
            params.with_clause(),
        );

        Self {
            name,
            table,
            method,
            metric,
            params,
            ddl,
            created_at: Utc::now(),
        }
    }
}

/// Where ANN index definitions live.
pub trait IndexCatalog {
    fn existing_index(
        &self,
        table: EmbeddingTable,
    ) -> Result<Option<IndexDefinition>>;

    fn row_count(&self, table: EmbeddingTable) -> Result<u64>;

    fn create_index(&self, definition: &IndexDefinition) -> Result<()>;

    /// Swap the index on `definition.table` for `definition` in one step,
    /// returning the one it replaced. On error the previous index stays.
    fn replace_index(
        &self,
        definition: &IndexDefinition,
    ) -> Result<Option<IndexDefinition>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndexAction {
    Created(IndexDefinition),
    /// An index was already present and was left untouched.
    Kept(IndexDefinition),
}

impl IndexAction {
    pub fn definition(&self) -> &IndexDefinition {
        match self {
            Self::Created(d) | Self::Kept(d) => d,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnsureReport {
    pub capabilities: EngineCapabilities,
    pub chosen: IndexMethod,
    pub actions: Vec<IndexAction>,
}

/// Make sure every embedding table has exactly one ANN index.
pub fn ensure_ann_indexes(
    probe: &dyn CapabilityProbe,
    catalog: &dyn IndexCatalog,
) -> Result<EnsureReport> {
    let capabilities = detect_capabilities(probe);
    let chosen = capabilities.best_method();
    info!(method = %chosen, "selected ANN index method");

    let mut actions = Vec::with_capacity(EmbeddingTable::ALL.len());
    for table in EmbeddingTable::ALL {
        if let Some(existing) = catalog.existing_index(table)? {
            if existing.method != chosen {
                info!(
                    table = table.as_str(),
                    existing = %existing.method,
                    available = %chosen,
                    "keeping existing index; rebuild explicitly to switch"
                );
            }
            actions.push(IndexAction::Kept(existing));
            continue;
        }

        let rows = catalog.row_count(table)?;
        let definition = IndexDefinition::plan(table, chosen, rows);
        catalog.create_index(&definition)?;
        info!(table = table.as_str(), index = %definition.name, rows, "created ANN index");
        actions.push(IndexAction::Created(definition));
    }

    Ok(EnsureReport {
        capabilities,
        chosen,
        actions,
    })
}

/// Replace the index on `table` with one using `method`.
pub fn rebuild_ann_index(
    catalog: &dyn IndexCatalog,
    table: EmbeddingTable,
    method: IndexMethod,
) -> Result<IndexDefinition> {
    let rows = catalog.row_count(table)?;
    let definition = IndexDefinition::plan(table, method, rows);
    let previous = catalog.replace_index(&definition)?;
    warn!(
        table = table.as_str(),
        previous = previous.as_ref().map(|d| d.name.as_str()),
        index = %definition.name,
        "rebuilt ANN index"
    );
    Ok(definition)
}
