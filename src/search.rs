use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::{
    ann_index::IndexCatalog,
    buckets,
    corpus_db::{CorpusDb, Verse},
    embedding_db::{EmbeddingDb, EmbeddingRecord, EmbeddingTable},
    error::{Error, Result},
    lexical_index::{LexicalHit, LexicalIndex},
    manifest::HybridPlan,
    query_log::{QueryLog, QueryLogEntry, SearchMode},
    verse_id::PRIMARY_SEPARATOR,
};

/// Candidate multiplier when labels are filtered after scoring.
const POST_FILTER_OVERSAMPLE: usize = 4;

/// A vector search request.
#[derive(Debug, Clone)]
pub struct VectorQuery<'a> {
    /// Text that produced the vector, for the query log.
    pub text: &'a str,
    pub vector: &'a [f32],
    pub table: EmbeddingTable,
    pub model: &'a str,
    /// Keep only owners whose label set shares at least one label.
    pub labels: Option<&'a [u16]>,
    /// Restrict verse results to one translation.
    pub translation: Option<&'a str>,
    pub top_k: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorHit {
    pub owner: String,
    /// Cosine distance, lower is closer.
    pub distance: f32,
}

/// Both candidate lists of a hybrid search. No fusion is applied.
#[derive(Debug, Clone, Serialize)]
pub struct HybridCandidates {
    pub vector: Vec<VectorHit>,
    pub lexical: Vec<LexicalHit>,
}

pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    1.0 - dot / (na.sqrt() * nb.sqrt())
}

fn shares_label(record: &EmbeddingRecord, wanted: &[u16]) -> bool {
    wanted.iter().any(|l| record.labels.binary_search(l).is_ok())
}

fn in_translation(owner: &str, translation: &str) -> bool {
    owner
        .strip_prefix(translation)
        .is_some_and(|rest| rest.starts_with(PRIMARY_SEPARATOR))
}

/// Read-side entry point. Every search is recorded in the query log.
pub struct Searcher<'a> {
    corpus: &'a CorpusDb,
    embeddings: &'a EmbeddingDb,
    lexical: &'a LexicalIndex,
    log: &'a QueryLog,
}

impl<'a> Searcher<'a> {
    pub fn new(
        corpus: &'a CorpusDb,
        embeddings: &'a EmbeddingDb,
        lexical: &'a LexicalIndex,
        log: &'a QueryLog,
    ) -> Self {
        Self {
            corpus,
            embeddings,
            lexical,
            log,
        }
    }

    fn scan_vectors(&self, query: &VectorQuery<'_>) -> Result<Vec<VectorHit>> {
        let expected = self.embeddings.dimension(query.table)?;
        if query.vector.len() != expected {
            return Err(Error::DimensionMismatch {
                table: query.table.as_str(),
                expected,
                actual: query.vector.len(),
            });
        }

        // Label pre-filtering needs an index that carries the labels.
        let prefilter = self
            .embeddings
            .existing_index(query.table)?
            .is_some_and(|def| def.method.supports_label_filter());

        let mut records =
            self.embeddings.records_for_model(query.table, query.model)?;
        if let (Some(t), EmbeddingTable::Verse) = (query.translation, query.table) {
            records.retain(|r| in_translation(&r.owner, t));
        }
        if let (Some(labels), true) = (query.labels, prefilter) {
            records.retain(|r| shares_label(r, labels));
        }

        let mut scored: Vec<(VectorHit, &EmbeddingRecord)> = records
            .par_iter()
            .map(|r| {
                let hit = VectorHit {
                    owner: r.owner.clone(),
                    distance: cosine_distance(query.vector, &r.vector),
                };
                (hit, r)
            })
            .collect();
        scored.sort_by(|a, b| {
            a.0.distance
                .partial_cmp(&b.0.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.owner.cmp(&b.0.owner))
        });

        let hits = match query.labels {
            Some(labels) if !prefilter => {
                scored.truncate(query.top_k.saturating_mul(POST_FILTER_OVERSAMPLE));
                scored
                    .into_iter()
                    .filter(|(_, r)| shares_label(r, labels))
                    .map(|(hit, _)| hit)
                    .take(query.top_k)
                    .collect()
            }
            _ => scored.into_iter().map(|(hit, _)| hit).take(query.top_k).collect(),
        };
        Ok(hits)
    }

    fn log_search(
        &self,
        text: &str,
        mode: SearchMode,
        top_k: usize,
        translation: Option<&str>,
        started: Instant,
        ids: Vec<String>,
    ) {
        let mut entry = QueryLogEntry::new(text, mode, top_k).with_results(ids);
        entry.latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        entry.translation = translation.map(str::to_string);
        debug!(
            mode = %mode,
            results = entry.result_count,
            latency_ms = entry.latency_ms,
            "search complete"
        );
        self.log.record(&entry);
    }

    /// Nearest owners by cosine distance.
    pub fn vector_search(&self, query: &VectorQuery<'_>) -> Result<Vec<VectorHit>> {
        let started = Instant::now();
        let hits = self.scan_vectors(query)?;
        self.log_search(
            query.text,
            SearchMode::Vector,
            query.top_k,
            query.translation,
            started,
            hits.iter().map(|h| h.owner.clone()).collect(),
        );
        Ok(hits)
    }

    /// BM25 matches over verse text.
    pub fn lexical_search(
        &self,
        text: &str,
        translation: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<LexicalHit>> {
        let started = Instant::now();
        let hits = self.lexical.search(text, translation, top_k)?;
        self.log_search(
            text,
            SearchMode::Lexical,
            top_k,
            translation,
            started,
            hits.iter().map(|h| h.verse_id.clone()).collect(),
        );
        Ok(hits)
    }

    /// Run both retrievals with the plan's list sizes and return both
    /// candidate lists. The query's own `top_k` is ignored in favour of
    /// `plan.vector_k`.
    pub fn hybrid_search(
        &self,
        query: &VectorQuery<'_>,
        plan: HybridPlan,
    ) -> Result<HybridCandidates> {
        let started = Instant::now();
        let vector_query = VectorQuery {
            top_k: plan.vector_k,
            ..query.clone()
        };
        let vector = self.scan_vectors(&vector_query)?;
        let lexical = self.lexical.search(query.text, query.translation, plan.fts_k)?;

        let ids = vector
            .iter()
            .map(|h| h.owner.clone())
            .chain(lexical.iter().map(|h| h.verse_id.clone()))
            .collect();
        self.log_search(
            query.text,
            SearchMode::Hybrid,
            plan.vector_k.max(plan.fts_k),
            query.translation,
            started,
            ids,
        );
        Ok(HybridCandidates { vector, lexical })
    }

    /// `count` verses from absolute index `start`.
    pub fn absolute_slice(
        &self,
        translation: &str,
        start: u64,
        count: u64,
    ) -> Result<Vec<Verse>> {
        self.corpus.absolute_slice(translation, start, count)
    }

    /// Members of a bucket in ordinal order.
    pub fn bucket_members(&self, bucket_id: u64) -> Result<Vec<Verse>> {
        if buckets::get_bucket(self.corpus, bucket_id)?.is_none() {
            return Err(Error::NotFound {
                kind: "bucket",
                name: bucket_id.to_string(),
            });
        }
        buckets::bucket_members(self.corpus, bucket_id)
    }
}

impl std::fmt::Debug for Searcher<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Searcher").finish_non_exhaustive()
    }
}

/// Format verses for human-readable terminal output.
pub fn format_verses(verses: &[Verse]) {
    if verses.is_empty() {
        println!("No verses found.");
        return;
    }
    for v in verses {
        match v.absolute_index {
            Some(n) => println!("{:>6}  {}  {}", n, v.id, v.text),
            None => println!("     -  {}  {}", v.id, v.text),
        }
    }
}

pub fn format_vector_hits(hits: &[VectorHit]) {
    if hits.is_empty() {
        println!("No results found.");
        return;
    }
    for (i, h) in hits.iter().enumerate() {
        println!("{:>3}. [{:.4}] {}", i + 1, h.distance, h.owner);
    }
}

pub fn format_lexical_hits(hits: &[LexicalHit]) {
    if hits.is_empty() {
        println!("No results found.");
        return;
    }
    for (i, h) in hits.iter().enumerate() {
        println!("{:>3}. [{:.3}] {}", i + 1, h.score, h.verse_id);
        println!("     {}", h.text);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        ann_index::{IndexDefinition, IndexMethod},
        buckets::build_chapter_buckets,
        ingestion::{ConflictPolicy, VerseRecord, ingest_batch},
        query_log::CounterMetrics,
        sequential::backfill_absolute_index,
    };

    struct Fixture {
        corpus: CorpusDb,
        embeddings: EmbeddingDb,
        lexical: LexicalIndex,
        log: QueryLog,
        _tmp: tempfile::TempDir,
    }

    impl Fixture {
        fn searcher(&self) -> Searcher<'_> {
            Searcher::new(&self.corpus, &self.embeddings, &self.lexical, &self.log)
        }

        fn log_count(&self) -> usize {
            let now = chrono::Utc::now();
            self.log
                .scan(now - chrono::Duration::hours(1), now + chrono::Duration::hours(1))
                .unwrap()
                .len()
        }
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let corpus = CorpusDb::open(&tmp.path().join("corpus.redb")).unwrap();
        let embeddings = EmbeddingDb::open(&tmp.path().join("emb.redb"), 2).unwrap();
        let lexical = LexicalIndex::open_in_ram().unwrap();
        let log = QueryLog::open(
            &tmp.path().join("log.redb"),
            Arc::new(CounterMetrics::default()),
        )
        .unwrap();

        let records = vec![
            VerseRecord::new("KJV", 1, 1, 1, "", "In the beginning God created the heaven"),
            VerseRecord::new("KJV", 1, 1, 2, "", "And the earth was without form"),
            VerseRecord::new("KJV", 1, 1, 3, "", "Let there be light"),
            VerseRecord::new("WEB", 1, 1, 1, "", "In the beginning, God created the heavens"),
        ];
        ingest_batch(&corpus, &records, ConflictPolicy::Reject).unwrap();
        backfill_absolute_index(&corpus).unwrap();
        build_chapter_buckets(&corpus).unwrap();

        let mut verses = corpus.verses_in_translation("KJV").unwrap();
        verses.extend(corpus.verses_in_translation("WEB").unwrap());
        lexical.index_verses(&verses).unwrap();

        let vectors = [
            ("KJV:1:1:1", [1.0, 0.0], vec![1]),
            ("KJV:1:1:2", [0.9, 0.1], vec![2]),
            ("KJV:1:1:3", [0.0, 1.0], vec![1, 3]),
            ("WEB:1:1:1", [1.0, 0.01], vec![1]),
        ];
        for (owner, v, labels) in vectors {
            embeddings
                .store(
                    EmbeddingTable::Verse,
                    &EmbeddingRecord::new(owner, "m", v.to_vec()).with_labels(&labels),
                )
                .unwrap();
        }

        Fixture {
            corpus,
            embeddings,
            lexical,
            log,
            _tmp: tmp,
        }
    }

    fn query<'a>(vector: &'a [f32]) -> VectorQuery<'a> {
        VectorQuery {
            text: "firmament",
            vector,
            table: EmbeddingTable::Verse,
            model: "m",
            labels: None,
            translation: None,
            top_k: 10,
        }
    }

    #[test]
    fn vector_search_orders_by_distance_and_logs() {
        let fx = fixture();
        let hits = fx.searcher().vector_search(&query(&[1.0, 0.0])).unwrap();

        let owners: Vec<&str> = hits.iter().map(|h| h.owner.as_str()).collect();
        assert_eq!(owners, vec!["KJV:1:1:1", "WEB:1:1:1", "KJV:1:1:2", "KJV:1:1:3"]);
        assert!(hits[0].distance.abs() < 1e-6);
        assert_eq!(fx.log_count(), 1);
    }

    #[test]
    fn vector_search_translation_and_label_filters() {
        let fx = fixture();
        let mut q = query(&[1.0, 0.0]);
        q.translation = Some("KJV");
        q.labels = Some(&[1]);

        let hits = fx.searcher().vector_search(&q).unwrap();
        let owners: Vec<&str> = hits.iter().map(|h| h.owner.as_str()).collect();
        assert_eq!(owners, vec!["KJV:1:1:1", "KJV:1:1:3"]);
    }

    #[test]
    fn label_prefilter_with_filtered_index() {
        let fx = fixture();
        fx.embeddings
            .create_index(&IndexDefinition::plan(
                EmbeddingTable::Verse,
                IndexMethod::DiskAnnFiltered,
                4,
            ))
            .unwrap();

        let mut q = query(&[1.0, 0.0]);
        q.labels = Some(&[3]);
        q.top_k = 1;
        let hits = fx.searcher().vector_search(&q).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].owner, "KJV:1:1:3");
    }

    #[test]
    fn vector_search_rejects_wrong_dimension() {
        let fx = fixture();
        let err = fx.searcher().vector_search(&query(&[1.0, 0.0, 0.0]));
        assert!(matches!(err, Err(Error::DimensionMismatch { .. })));
        assert_eq!(fx.log_count(), 0);
    }

    #[test]
    fn lexical_search_logs_each_call() {
        let fx = fixture();
        let s = fx.searcher();
        assert_eq!(s.lexical_search("light", None, 5).unwrap().len(), 1);
        assert_eq!(s.lexical_search("beginning", Some("WEB"), 5).unwrap().len(), 1);
        assert_eq!(fx.log_count(), 2);
    }

    #[test]
    fn hybrid_returns_both_lists_unfused() {
        let fx = fixture();
        let q = query(&[0.0, 1.0]);
        let plan = HybridPlan {
            vector_k: 2,
            fts_k: 5,
        };
        let candidates = fx.searcher().hybrid_search(&q, plan).unwrap();

        assert_eq!(candidates.vector.len(), 2);
        assert_eq!(candidates.vector[0].owner, "KJV:1:1:3");
        assert!(candidates.lexical.is_empty());
        assert_eq!(fx.log_count(), 1);
    }

    #[test]
    fn slices_and_buckets() {
        let fx = fixture();
        let s = fx.searcher();

        let slice = s.absolute_slice("KJV", 2, 2).unwrap();
        let ids: Vec<&str> = slice.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["KJV:1:1:2", "KJV:1:1:3"]);

        let bucket = buckets::find_bucket(
            &fx.corpus,
            "KJV",
            buckets::BucketLevel::Chapter,
            1,
            Some(1),
        )
        .unwrap()
        .unwrap();
        assert_eq!(s.bucket_members(bucket.id).unwrap().len(), 3);
        assert!(matches!(s.bucket_members(999), Err(Error::NotFound { .. })));
    }

    #[test]
    fn cosine_distance_edges() {
        assert!(cosine_distance(&[1.0, 0.0], &[1.0, 0.0]).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
    }
}
