//! Append-only record of search invocations.
//!
//! Entries land in one table per UTC day (`search_log_YYYYMMDD`), picked
//! from the entry's own timestamp, so retention is a matter of dropping
//! whole tables. Writers never see the partitioning and never see errors:
//! a failed write is counted through [`LogMetrics`] and logged.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::Path,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeDelta, Timelike, Utc};
use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    TableDefinition,
    TableError,
    TableHandle,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    corpus_db::CorpusDb,
    error::{Error, Result},
    verse_id::VerseId,
};

const PARTITION_PREFIX: &str = "search_log_";
const PARTITION_DATE_FORMAT: &str = "%Y%m%d";

/// How many result ids an entry keeps.
pub const RESULT_SUMMARY_LIMIT: usize = 10;
/// How many queries [`QueryLog::summarize`] ranks.
pub const TOP_QUERIES: usize = 10;

type PartitionTable<'a> = TableDefinition<'a, (u64, u64), &'static [u8]>;

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
pub enum SearchMode {
    Lexical,
    Vector,
    Hybrid,
}

impl SearchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lexical => "lexical",
            Self::Vector => "vector",
            Self::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lexical" => Ok(Self::Lexical),
            "vector" => Ok(Self::Vector),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(Error::Config(format!("unknown search mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryLogEntry {
    pub timestamp: DateTime<Utc>,
    pub query: String,
    pub mode: SearchMode,
    pub top_k: usize,
    pub latency_ms: f64,
    #[serde(default)]
    pub translation: Option<String>,
    pub result_count: usize,
    /// First ids returned, capped at [`RESULT_SUMMARY_LIMIT`].
    #[serde(default)]
    pub result_ids: Vec<String>,
}

impl QueryLogEntry {
    pub fn new(query: &str, mode: SearchMode, top_k: usize) -> Self {
        Self {
            timestamp: Utc::now(),
            query: query.to_string(),
            mode,
            top_k,
            latency_ms: 0.0,
            translation: None,
            result_count: 0,
            result_ids: Vec::new(),
        }
    }

    pub fn with_results<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.result_count = 0;
        self.result_ids.clear();
        for id in ids {
            if self.result_ids.len() < RESULT_SUMMARY_LIMIT {
                self.result_ids.push(id.into());
            }
            self.result_count += 1;
        }
        self
    }
}

/// Receives write failures that [`QueryLog::record`] swallows.
pub trait LogMetrics: Send + Sync {
    fn write_failed(&self, error: &Error);
}

/// Counts failures in memory.
#[derive(Debug, Default)]
pub struct CounterMetrics {
    failures: AtomicU64,
}

impl CounterMetrics {
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl LogMetrics for CounterMetrics {
    fn write_failed(&self, _error: &Error) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeCount {
    pub mode: SearchMode,
    pub count: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopQuery {
    pub query: String,
    pub count: u64,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogSummary {
    pub total: u64,
    pub avg_latency_ms: Option<f64>,
    /// Most used mode first.
    pub by_mode: Vec<ModeCount>,
    /// Most frequent query texts, most frequent first.
    pub top_queries: Vec<TopQuery>,
}

/// Width of a trend bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendInterval {
    Hour,
    Day,
}

impl TrendInterval {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    fn width(self) -> TimeDelta {
        match self {
            Self::Hour => TimeDelta::hours(1),
            Self::Day => TimeDelta::days(1),
        }
    }

    /// Start of the bucket containing `ts`.
    fn truncate(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let hour = match self {
            Self::Hour => ts.hour(),
            Self::Day => 0,
        };
        let time = NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN);
        ts.date_naive().and_time(time).and_utc()
    }
}

impl fmt::Display for TrendInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrendInterval {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            other => Err(Error::Config(format!(
                "unknown trend interval '{other}' (expected hour or day)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub count: u64,
}

/// Query volume over time. Only buckets with at least one search appear.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryTrends {
    pub interval: TrendInterval,
    pub points: Vec<TrendPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslationUsage {
    /// `None` for searches across every translation.
    pub translation: Option<String>,
    pub count: u64,
    pub percentage: f64,
}

/// How often a book supplied the first result of a search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookUsage {
    pub book: u32,
    pub name: Option<String>,
    pub count: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageStats {
    pub translations: Vec<TranslationUsage>,
    pub books: Vec<BookUsage>,
}

impl UsageStats {
    /// Fill in book names from the first translation that has one.
    pub fn resolve_book_names(&mut self, corpus: &CorpusDb) -> Result<()> {
        let translations = corpus.list_translations()?;
        for usage in &mut self.books {
            for translation in &translations {
                let name = corpus
                    .get_book(&translation.code, usage.book)?
                    .and_then(|b| b.name);
                if name.is_some() {
                    usage.name = name;
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Share of `total`, in percent with one decimal.
fn percentage(count: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (count as f64 * 1000.0 / total as f64).round() / 10.0
}

/// Rank `(key, count)` pairs by count descending, then key.
fn ranked<K: Ord>(counts: impl IntoIterator<Item = (K, u64)>) -> Vec<(K, u64)> {
    let mut ranked: Vec<(K, u64)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

fn partition_name(date: NaiveDate) -> String {
    format!("{PARTITION_PREFIX}{}", date.format(PARTITION_DATE_FORMAT))
}

fn partition_date(name: &str) -> Option<NaiveDate> {
    let suffix = name.strip_prefix(PARTITION_PREFIX)?;
    NaiveDate::parse_from_str(suffix, PARTITION_DATE_FORMAT).ok()
}

fn micros(ts: DateTime<Utc>) -> Result<u64> {
    u64::try_from(ts.timestamp_micros()).map_err(|_| {
        Error::Config(format!("query log timestamp {ts} is before the epoch"))
    })
}

pub struct QueryLog {
    db: Database,
    seq: AtomicU64,
    metrics: Arc<dyn LogMetrics>,
}

impl QueryLog {
    pub fn open(path: &Path, metrics: Arc<dyn LogMetrics>) -> Result<Self> {
        let db = Database::create(path)?;
        Ok(Self {
            db,
            seq: AtomicU64::new(0),
            metrics,
        })
    }

    /// Append an entry. Never fails from the caller's point of view.
    pub fn record(&self, entry: &QueryLogEntry) {
        if let Err(e) = self.append(entry) {
            self.metrics.write_failed(&e);
            warn!(error = %e, mode = %entry.mode, "query log write failed");
        }
    }

    fn append(&self, entry: &QueryLogEntry) -> Result<()> {
        let ts = micros(entry.timestamp)?;
        let name = partition_name(entry.timestamp.date_naive());
        let bytes = serde_json::to_vec(entry)?;

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(PartitionTable::new(&name))?;
            let mut seq = self.seq.fetch_add(1, Ordering::Relaxed);
            while table.get((ts, seq))?.is_some() {
                seq = self.seq.fetch_add(1, Ordering::Relaxed);
            }
            table.insert((ts, seq), bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Days that currently have a partition, oldest first.
    pub fn partitions(&self) -> Result<Vec<NaiveDate>> {
        let txn = self.db.begin_read()?;
        let mut dates: Vec<NaiveDate> = txn
            .list_tables()?
            .filter_map(|handle| partition_date(handle.name()))
            .collect();
        dates.sort();
        Ok(dates)
    }

    /// Entries with `start <= timestamp < end`, in timestamp order.
    pub fn scan(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<QueryLogEntry>> {
        let (from, to) = (micros(start)?, micros(end)?);
        let (first_day, last_day) = (start.date_naive(), end.date_naive());

        let txn = self.db.begin_read()?;
        let mut entries = Vec::new();
        for date in self.partitions()? {
            if date < first_day || date > last_day {
                continue;
            }
            let name = partition_name(date);
            let table = match txn.open_table(PartitionTable::new(&name)) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            for row in table.range((from, 0u64)..(to, 0u64))? {
                let (_, value) = row?;
                entries.push(serde_json::from_slice(value.value())?);
            }
        }
        Ok(entries)
    }

    /// Drop every partition for a day before `cutoff`. Returns the dropped
    /// table names.
    pub fn drop_partitions_before(&self, cutoff: NaiveDate) -> Result<Vec<String>> {
        let stale: Vec<String> = self
            .partitions()?
            .into_iter()
            .filter(|date| *date < cutoff)
            .map(partition_name)
            .collect();
        if stale.is_empty() {
            return Ok(stale);
        }

        let txn = self.db.begin_write()?;
        for name in &stale {
            txn.delete_table(PartitionTable::new(name))?;
        }
        txn.commit()?;
        info!(dropped = stale.len(), %cutoff, "dropped query log partitions");
        Ok(stale)
    }

    /// Keep only the last `days` days of partitions, counting `now`'s day.
    pub fn apply_retention(&self, days: u64, now: DateTime<Utc>) -> Result<Vec<String>> {
        let today = now.date_naive();
        let cutoff = today
            .checked_sub_days(Days::new(days.saturating_sub(1)))
            .unwrap_or(NaiveDate::MIN);
        debug!(days, %cutoff, "applying query log retention");
        self.drop_partitions_before(cutoff)
    }

    pub fn summarize(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<LogSummary> {
        let entries = self.scan(start, end)?;
        let total = entries.len() as u64;
        let mut summary = LogSummary {
            total,
            ..Default::default()
        };
        if entries.is_empty() {
            return Ok(summary);
        }

        let mut latency = 0.0;
        let mut modes: BTreeMap<SearchMode, u64> = BTreeMap::new();
        let mut queries: HashMap<&str, (u64, DateTime<Utc>)> = HashMap::new();
        for entry in &entries {
            latency += entry.latency_ms;
            *modes.entry(entry.mode).or_default() += 1;
            let slot = queries
                .entry(entry.query.as_str())
                .or_insert((0, entry.timestamp));
            slot.0 += 1;
            slot.1 = slot.1.max(entry.timestamp);
        }
        summary.avg_latency_ms = Some(latency / entries.len() as f64);

        summary.by_mode = ranked(modes)
            .into_iter()
            .map(|(mode, count)| ModeCount {
                mode,
                count,
                percentage: percentage(count, total),
            })
            .collect();

        summary.top_queries = ranked(queries.iter().map(|(q, (n, _))| (*q, *n)))
            .into_iter()
            .take(TOP_QUERIES)
            .map(|(query, count)| TopQuery {
                query: query.to_string(),
                count,
                last_seen: queries[query].1,
            })
            .collect();
        Ok(summary)
    }

    /// Search volume per hour or day bucket.
    pub fn trends(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: TrendInterval,
    ) -> Result<QueryTrends> {
        let mut buckets: BTreeMap<DateTime<Utc>, u64> = BTreeMap::new();
        for entry in self.scan(start, end)? {
            *buckets.entry(interval.truncate(entry.timestamp)).or_default() += 1;
        }
        let points = buckets
            .into_iter()
            .map(|(bucket_start, count)| TrendPoint {
                bucket_start,
                bucket_end: bucket_start + interval.width(),
                count,
            })
            .collect();
        Ok(QueryTrends { interval, points })
    }

    /// Searches per translation filter, and per book of the first result.
    ///
    /// Book shares are taken over searches whose first result is a verse.
    /// Book names are left unset; see [`UsageStats::resolve_book_names`].
    pub fn usage(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<UsageStats> {
        let entries = self.scan(start, end)?;
        let total = entries.len() as u64;

        let mut translations: HashMap<Option<&str>, u64> = HashMap::new();
        let mut books: BTreeMap<u32, u64> = BTreeMap::new();
        for entry in &entries {
            *translations.entry(entry.translation.as_deref()).or_default() += 1;
            let first_book = entry
                .result_ids
                .first()
                .and_then(|id| VerseId::parse(id).ok())
                .map(|key| key.book);
            if let Some(book) = first_book {
                *books.entry(book).or_default() += 1;
            }
        }
        let with_hits: u64 = books.values().sum();

        Ok(UsageStats {
            translations: ranked(translations)
                .into_iter()
                .map(|(translation, count)| TranslationUsage {
                    translation: translation.map(str::to_string),
                    count,
                    percentage: percentage(count, total),
                })
                .collect(),
            books: ranked(books)
                .into_iter()
                .map(|(book, count)| BookUsage {
                    book,
                    name: None,
                    count,
                    percentage: percentage(count, with_hits),
                })
                .collect(),
        })
    }
}

impl fmt::Debug for QueryLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryLog").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn test_log() -> (tempfile::TempDir, QueryLog, Arc<CounterMetrics>) {
        let tmp = tempfile::tempdir().unwrap();
        let metrics = Arc::new(CounterMetrics::default());
        let log = QueryLog::open(&tmp.path().join("query_log.redb"), metrics.clone())
            .unwrap();
        (tmp, log, metrics)
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn entry(query: &str, mode: SearchMode, ts: DateTime<Utc>) -> QueryLogEntry {
        let mut e = QueryLogEntry::new(query, mode, 10);
        e.timestamp = ts;
        e
    }

    #[test]
    fn entries_route_to_daily_partitions() {
        let (_tmp, log, _) = test_log();
        log.record(&entry("love", SearchMode::Lexical, at(2026, 3, 1, 10)));
        log.record(&entry("grace", SearchMode::Vector, at(2026, 3, 2, 9)));

        assert_eq!(
            log.partitions().unwrap(),
            vec![
                NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
                NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            ]
        );

        let all = log.scan(at(2026, 3, 1, 0), at(2026, 3, 3, 0)).unwrap();
        let queries: Vec<&str> = all.iter().map(|e| e.query.as_str()).collect();
        assert_eq!(queries, vec!["love", "grace"]);
    }

    #[test]
    fn scan_respects_range_bounds() {
        let (_tmp, log, _) = test_log();
        log.record(&entry("a", SearchMode::Lexical, at(2026, 3, 1, 8)));
        log.record(&entry("b", SearchMode::Lexical, at(2026, 3, 1, 12)));
        log.record(&entry("c", SearchMode::Lexical, at(2026, 3, 1, 16)));

        let mid = log.scan(at(2026, 3, 1, 12), at(2026, 3, 1, 16)).unwrap();
        assert_eq!(mid.len(), 1);
        assert_eq!(mid[0].query, "b");
    }

    #[test]
    fn failed_write_is_counted_not_returned() {
        let (_tmp, log, metrics) = test_log();
        let before_epoch = Utc.with_ymd_and_hms(1960, 1, 1, 0, 0, 0).unwrap();
        log.record(&entry("old", SearchMode::Hybrid, before_epoch));

        assert_eq!(metrics.failures(), 1);
        assert!(log.partitions().unwrap().is_empty());
    }

    #[test]
    fn concurrent_writes_all_land() {
        let (_tmp, log, metrics) = test_log();
        let ts = at(2026, 5, 5, 5);

        std::thread::scope(|s| {
            for t in 0..8 {
                let log = &log;
                s.spawn(move || {
                    for i in 0..25 {
                        log.record(&entry(&format!("q{t}-{i}"), SearchMode::Vector, ts));
                    }
                });
            }
        });

        let rows = log.scan(at(2026, 5, 5, 0), at(2026, 5, 6, 0)).unwrap();
        assert_eq!(rows.len(), 200);
        let distinct: std::collections::HashSet<&str> =
            rows.iter().map(|e| e.query.as_str()).collect();
        assert_eq!(distinct.len(), 200);
        assert_eq!(metrics.failures(), 0);
    }

    #[test]
    fn retention_drops_old_partitions() {
        let (_tmp, log, _) = test_log();
        log.record(&entry("old", SearchMode::Lexical, at(2026, 1, 1, 0)));
        log.record(&entry("recent", SearchMode::Lexical, at(2026, 3, 30, 0)));
        log.record(&entry("today", SearchMode::Lexical, at(2026, 3, 31, 0)));

        let dropped = log.apply_retention(2, at(2026, 3, 31, 12)).unwrap();
        assert_eq!(dropped, vec!["search_log_20260101".to_string()]);
        assert_eq!(log.partitions().unwrap().len(), 2);
        assert!(log.drop_partitions_before(NaiveDate::MIN).unwrap().is_empty());
    }

    #[test]
    fn summary_counts_modes_and_queries() {
        let (_tmp, log, _) = test_log();
        let ts = at(2026, 4, 1, 1);
        for (q, mode, latency) in [
            ("faith", SearchMode::Lexical, 10.0),
            ("faith", SearchMode::Hybrid, 20.0),
            ("hope", SearchMode::Vector, 30.0),
        ] {
            let mut e = entry(q, mode, ts);
            e.latency_ms = latency;
            log.record(&e);
        }

        let summary = log.summarize(at(2026, 4, 1, 0), at(2026, 4, 2, 0)).unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.avg_latency_ms, Some(20.0));
        assert_eq!(summary.by_mode.len(), 3);
        assert!(summary.by_mode.iter().all(|m| m.count == 1 && m.percentage == 33.3));
        assert_eq!(summary.top_queries[0].query, "faith");
        assert_eq!(summary.top_queries[0].count, 2);
    }

    #[test]
    fn summary_ranks_modes_and_tracks_last_seen() {
        let (_tmp, log, _) = test_log();
        log.record(&entry("faith", SearchMode::Vector, at(2026, 4, 1, 1)));
        log.record(&entry("faith", SearchMode::Vector, at(2026, 4, 1, 5)));
        log.record(&entry("hope", SearchMode::Vector, at(2026, 4, 1, 3)));
        log.record(&entry("hope", SearchMode::Lexical, at(2026, 4, 1, 2)));

        let summary = log.summarize(at(2026, 4, 1, 0), at(2026, 4, 2, 0)).unwrap();
        assert_eq!(
            summary.by_mode,
            vec![
                ModeCount { mode: SearchMode::Vector, count: 3, percentage: 75.0 },
                ModeCount { mode: SearchMode::Lexical, count: 1, percentage: 25.0 },
            ]
        );
        assert_eq!(
            summary.top_queries,
            vec![
                TopQuery { query: "faith".into(), count: 2, last_seen: at(2026, 4, 1, 5) },
                TopQuery { query: "hope".into(), count: 2, last_seen: at(2026, 4, 1, 3) },
            ]
        );
    }

    #[test]
    fn trends_bucket_by_hour_and_day() {
        let (_tmp, log, _) = test_log();
        let mut late = entry("a", SearchMode::Lexical, at(2026, 6, 1, 10));
        late.timestamp += TimeDelta::minutes(45);
        log.record(&entry("a", SearchMode::Lexical, at(2026, 6, 1, 10)));
        log.record(&late);
        log.record(&entry("b", SearchMode::Lexical, at(2026, 6, 1, 13)));
        log.record(&entry("c", SearchMode::Lexical, at(2026, 6, 2, 0)));

        let hourly = log
            .trends(at(2026, 6, 1, 0), at(2026, 6, 3, 0), TrendInterval::Hour)
            .unwrap();
        let counts: Vec<(DateTime<Utc>, u64)> =
            hourly.points.iter().map(|p| (p.bucket_start, p.count)).collect();
        assert_eq!(
            counts,
            vec![
                (at(2026, 6, 1, 10), 2),
                (at(2026, 6, 1, 13), 1),
                (at(2026, 6, 2, 0), 1),
            ]
        );
        assert_eq!(hourly.points[0].bucket_end, at(2026, 6, 1, 11));

        let daily = log
            .trends(at(2026, 6, 1, 0), at(2026, 6, 3, 0), TrendInterval::Day)
            .unwrap();
        assert_eq!(daily.points.len(), 2);
        assert_eq!(daily.points[0].count, 3);
        assert_eq!(daily.points[1].bucket_end, at(2026, 6, 3, 0));
        assert!("week".parse::<TrendInterval>().is_err());
    }

    #[test]
    fn usage_counts_translations_and_first_hit_books() {
        let (_tmp, log, _) = test_log();
        let ts = at(2026, 7, 1, 0);

        let mut john = entry("love", SearchMode::Lexical, ts)
            .with_results(["KJV:43:3:16", "KJV:1:1:1"]);
        john.translation = Some("KJV".into());
        log.record(&john);
        log.record(&john);
        log.record(
            &entry("light", SearchMode::Lexical, ts).with_results(["WEB:1:1:3"]),
        );
        log.record(&entry("chunk", SearchMode::Vector, ts).with_results(["chunk-7"]));

        let usage = log.usage(at(2026, 7, 1, 0), at(2026, 7, 2, 0)).unwrap();
        assert_eq!(
            usage.translations,
            vec![
                TranslationUsage { translation: None, count: 2, percentage: 50.0 },
                TranslationUsage {
                    translation: Some("KJV".into()),
                    count: 2,
                    percentage: 50.0,
                },
            ]
        );
        let books: Vec<(u32, u64, f64)> =
            usage.books.iter().map(|b| (b.book, b.count, b.percentage)).collect();
        assert_eq!(books, vec![(43, 2, 66.7), (1, 1, 33.3)]);
    }

    #[test]
    fn usage_resolves_book_names_from_corpus() {
        use crate::ingestion::{ConflictPolicy, VerseRecord, ingest_verse};

        let (tmp, log, _) = test_log();
        let corpus = CorpusDb::open(&tmp.path().join("corpus.redb")).unwrap();
        let mut record = VerseRecord::new("KJV", 43, 3, 16, "", "For God so loved");
        record.book_name = Some("John".into());
        ingest_verse(&corpus, &record, ConflictPolicy::Reject).unwrap();

        log.record(
            &entry("love", SearchMode::Lexical, at(2026, 7, 1, 0))
                .with_results(["KJV:43:3:16"]),
        );
        let mut usage = log.usage(at(2026, 7, 1, 0), at(2026, 7, 2, 0)).unwrap();
        usage.resolve_book_names(&corpus).unwrap();
        assert_eq!(usage.books[0].name.as_deref(), Some("John"));
    }

    #[test]
    fn result_summary_is_capped() {
        let e = QueryLogEntry::new("x", SearchMode::Lexical, 50)
            .with_results((0..25).map(|i| format!("KJV:1:1:{i}")));
        assert_eq!(e.result_count, 25);
        assert_eq!(e.result_ids.len(), RESULT_SUMMARY_LIMIT);
    }
}
