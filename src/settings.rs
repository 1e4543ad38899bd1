//! Typed view over the runtime settings stored in the corpus database.

use crate::{
    ann_index::{SETTING_ACCESS_METHODS, SETTING_EXTENSIONS},
    corpus_db::CorpusDb,
    error::{Error, Result},
    ingestion::ConflictPolicy,
};

pub const EMBEDDING_DIM: &str = "embedding.dim";
pub const EMBEDDING_MODEL: &str = "embedding.model";
pub const CONFLICT_POLICY: &str = "ingest.conflict_policy";
pub const RETENTION_DAYS: &str = "query_log.retention_days";

pub const DEFAULT_EMBEDDING_DIM: usize = 768;
pub const DEFAULT_EMBEDDING_MODEL: &str = "embeddinggemma";
pub const DEFAULT_RETENTION_DAYS: u64 = 90;

/// Every recognised key with its default, if it has one.
pub const KNOWN_SETTINGS: &[(&str, Option<&str>)] = &[
    (EMBEDDING_DIM, Some("768")),
    (EMBEDDING_MODEL, Some(DEFAULT_EMBEDDING_MODEL)),
    (CONFLICT_POLICY, Some("reject")),
    (RETENTION_DAYS, Some("90")),
    (SETTING_ACCESS_METHODS, None),
    (SETTING_EXTENSIONS, None),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub embedding_dim: usize,
    pub embedding_model: String,
    pub conflict_policy: ConflictPolicy,
    pub retention_days: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            conflict_policy: ConflictPolicy::default(),
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        Error::Config(format!("{key} must be a non-negative integer, got '{value}'"))
    })
}

impl Settings {
    pub fn load(db: &CorpusDb) -> Result<Self> {
        let mut settings = Self::default();
        if let Some(v) = db.get_setting(EMBEDDING_DIM)? {
            settings.embedding_dim = parse_number(EMBEDDING_DIM, &v)?;
        }
        if let Some(v) = db.get_setting(EMBEDDING_MODEL)? {
            settings.embedding_model = v;
        }
        if let Some(v) = db.get_setting(CONFLICT_POLICY)? {
            settings.conflict_policy = v.parse()?;
        }
        if let Some(v) = db.get_setting(RETENTION_DAYS)? {
            settings.retention_days = parse_number(RETENTION_DAYS, &v)?;
        }
        Ok(settings)
    }
}

/// Check a value before it is written with `config set`.
pub fn validate(key: &str, value: &str) -> Result<()> {
    match key {
        EMBEDDING_DIM => {
            let dim: usize = parse_number(key, value)?;
            if dim == 0 {
                return Err(Error::Config(format!("{key} must be positive")));
            }
        }
        RETENTION_DAYS => {
            parse_number::<u64>(key, value)?;
        }
        CONFLICT_POLICY => {
            value.parse::<ConflictPolicy>()?;
        }
        EMBEDDING_MODEL | SETTING_ACCESS_METHODS | SETTING_EXTENSIONS => {}
        other => {
            return Err(Error::Config(format!("unknown setting '{other}'")));
        }
    }
    Ok(())
}
