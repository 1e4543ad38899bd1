use std::{
    ffi::OsString,
    fmt,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::error::{Error, Result};

/// Environment variable naming the data directory.
pub const DATA_DIR_ENV: &str = "VERSEDB_DATA_DIR";

/// Where the data directory was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirSource {
    Flag,
    Env,
    Xdg,
}

impl fmt::Display for DataDirSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Flag => "--data-dir",
            Self::Env => DATA_DIR_ENV,
            Self::Xdg => "xdg",
        })
    }
}

/// Root of every store versedb keeps on disk: the corpus, embeddings and
/// query log databases plus the full-text index directory.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
    source: DataDirSource,
}

/// Pick the root from the flag or the environment. An empty variable
/// counts as unset.
fn choose_root(
    explicit: Option<&Path>,
    env: Option<OsString>,
) -> Option<(PathBuf, DataDirSource)> {
    if let Some(path) = explicit {
        return Some((path.to_path_buf(), DataDirSource::Flag));
    }
    env.filter(|v| !v.is_empty())
        .map(|v| (PathBuf::from(v), DataDirSource::Env))
}

fn ensure_dir(path: PathBuf) -> Result<PathBuf> {
    std::fs::create_dir_all(&path).map_err(|_| Error::DataDir(path.clone()))?;
    Ok(path)
}

impl DataDir {
    /// Resolve the data directory from `--data-dir`, then
    /// `VERSEDB_DATA_DIR`, then `$XDG_DATA_HOME/versedb`, creating it if
    /// needed.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let (root, source) = match choose_root(explicit, std::env::var_os(DATA_DIR_ENV)) {
            Some(chosen) => chosen,
            None => {
                let home = xdg::BaseDirectories::with_prefix("versedb")
                    .get_data_home()
                    .ok_or_else(|| {
                        Error::Config("could not determine XDG data home directory".into())
                    })?;
                (home, DataDirSource::Xdg)
            }
        };

        let root = ensure_dir(root)?;
        debug!(root = %root.display(), %source, "using data directory");
        Ok(Self { root, source })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source(&self) -> DataDirSource {
        self.source
    }

    pub fn corpus_db(&self) -> PathBuf {
        self.root.join("corpus.redb")
    }

    pub fn embeddings_db(&self) -> PathBuf {
        self.root.join("embeddings.redb")
    }

    pub fn query_log_db(&self) -> PathBuf {
        self.root.join("query_log.redb")
    }

    /// Tantivy index directory, created on first use.
    pub fn lexical_dir(&self) -> Result<PathBuf> {
        ensure_dir(self.root.join("lexical"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_paths_live_under_the_root() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();

        assert_eq!(dir.root(), tmp.path());
        assert_eq!(dir.source(), DataDirSource::Flag);
        assert_eq!(dir.corpus_db(), tmp.path().join("corpus.redb"));
        assert_eq!(dir.embeddings_db(), tmp.path().join("embeddings.redb"));
        assert_eq!(dir.query_log_db(), tmp.path().join("query_log.redb"));
    }

    #[test]
    fn flag_wins_over_environment() {
        let chosen = choose_root(Some(Path::new("/flag")), Some("/env".into()));
        assert_eq!(chosen, Some((PathBuf::from("/flag"), DataDirSource::Flag)));

        let chosen = choose_root(None, Some("/env".into()));
        assert_eq!(chosen, Some((PathBuf::from("/env"), DataDirSource::Env)));
    }

    #[test]
    fn empty_environment_falls_through() {
        assert_eq!(choose_root(None, Some(OsString::new())), None);
        assert_eq!(choose_root(None, None), None);
    }

    #[test]
    fn lexical_dir_and_nested_root_are_created() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        let dir = DataDir::resolve(Some(&nested)).unwrap();
        assert!(dir.root().is_dir());

        let lexical = dir.lexical_dir().unwrap();
        assert!(lexical.is_dir());
        assert_eq!(lexical, nested.join("lexical"));
    }
}
