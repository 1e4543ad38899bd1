use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use chrono::{Days, Duration, Utc};
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use versedb::{
    CorpusDb,
    DataDir,
    EmbeddingDb,
    LexicalIndex,
    QueryLog,
    Settings,
    ann_index::{self, IndexCatalog, IndexMethod, SettingsProbe},
    buckets::{self, BucketLevel},
    embedding_db::{self, EmbeddingTable},
    error::{self, Error},
    ingestion::{self, ConflictPolicy},
    manifest::{self, HybridPlan, RunManifest},
    query_log::{CounterMetrics, TrendInterval},
    search::{self, Searcher, VectorQuery},
    sequential,
    settings,
};

mod cli;

use cli::{
    BucketAction,
    Cli,
    Command,
    ConfigAction,
    IndexAction,
    LogAction,
    ManifestAction,
    SearchCommand,
};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("VERSEDB_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let corpus = CorpusDb::open(&data_dir.corpus_db())?;
    let settings = Settings::load(&corpus)?;

    match cli.command {
        Command::Ingest(args) => cmd_ingest(&corpus, &data_dir, &settings, &args)?,
        Command::Backfill => cmd_backfill(&corpus)?,
        Command::Renumber { translation } => {
            let done = sequential::renumber_translation(&corpus, &translation)?;
            println!(
                "Renumbered {}: {} verses",
                done.translation, done.assigned
            );
        }
        Command::Bucket { action } => cmd_bucket(&corpus, action)?,
        Command::Index { action } => {
            let embeddings =
                EmbeddingDb::open(&data_dir.embeddings_db(), settings.embedding_dim)?;
            cmd_index(&corpus, &embeddings, action)?;
        }
        Command::Embed(args) => {
            let embeddings =
                EmbeddingDb::open(&data_dir.embeddings_db(), settings.embedding_dim)?;
            cmd_embed(&corpus, &embeddings, &args)?;
        }
        Command::Manifest { action } => cmd_manifest(&corpus, action)?,
        Command::Search { mode } => {
            cmd_search(&corpus, &data_dir, &settings, mode)?;
        }
        Command::Slice(args) => {
            let verses =
                corpus.absolute_slice(&args.translation, args.start, args.count)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&verses)?);
            } else {
                search::format_verses(&verses);
            }
        }
        Command::Verse(args) => {
            let batch = corpus.get_verses(args.ids.as_slice())?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&batch)?);
            } else {
                search::format_verses(&batch.verses);
                for id in &batch.missing_ids {
                    warn!(%id, "verse not found");
                }
            }
        }
        Command::Compare(args) => cmd_compare(&corpus, &args)?,
        Command::Log { action } => {
            let log = open_query_log(&data_dir)?;
            cmd_log(&corpus, &log, &settings, action)?;
        }
        Command::Config { action } => cmd_config(&corpus, action)?,
        Command::Status(args) => {
            cmd_status(&corpus, &data_dir, &settings, args.json)?;
        }
        Command::Completions(_) => {}
    }

    Ok(())
}

fn open_file(path: &Path) -> error::Result<BufReader<File>> {
    Ok(BufReader::new(File::open(path)?))
}

fn open_query_log(data_dir: &DataDir) -> error::Result<QueryLog> {
    QueryLog::open(&data_dir.query_log_db(), Arc::new(CounterMetrics::default()))
}

fn cmd_ingest(
    corpus: &CorpusDb,
    data_dir: &DataDir,
    settings: &Settings,
    args: &cli::IngestArgs,
) -> error::Result<()> {
    let policy = match &args.policy {
        Some(p) => p.parse::<ConflictPolicy>()?,
        None => settings.conflict_policy,
    };
    let records = ingestion::read_records(open_file(&args.file)?)?;
    eprintln!("Read {} records from {}", records.len(), args.file.display());

    let report = ingestion::ingest_batch(corpus, &records, policy)?;
    println!(
        "Inserted {}, updated {}, unchanged {}",
        report.inserted, report.updated, report.unchanged
    );

    if !args.no_lexical && report.inserted + report.updated > 0 {
        let mut translations: Vec<&str> =
            records.iter().map(|r| r.translation.as_str()).collect();
        translations.sort_unstable();
        translations.dedup();

        let lexical = LexicalIndex::open(&data_dir.lexical_dir()?)?;
        for code in translations {
            let verses = corpus.verses_in_translation(code)?;
            let count = lexical.index_verses(&verses)?;
            eprintln!("  Indexed {count} verses of {code}");
        }
    }
    Ok(())
}

fn cmd_backfill(corpus: &CorpusDb) -> error::Result<()> {
    let report = sequential::backfill_absolute_index(corpus)?;
    for done in &report.completed {
        println!(
            "{}: assigned {} of {} verses",
            done.translation, done.assigned, done.total
        );
    }
    for failure in &report.failed {
        eprintln!("{}: FAILED: {}", failure.translation, failure.reason);
    }
    if !report.is_success() {
        eprintln!(
            "Backfill failed for {} translation(s); run `versedb renumber <translation>` to repair.",
            report.failed.len()
        );
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_bucket(corpus: &CorpusDb, action: BucketAction) -> error::Result<()> {
    match action {
        BucketAction::Build => {
            let report = buckets::build_chapter_buckets(corpus)?;
            println!(
                "Created {} buckets, added {} members",
                report.buckets_created, report.members_added
            );
            if report.skipped_conflicts > 0 {
                warn!(
                    skipped = report.skipped_conflicts,
                    "verses skipped because their ordinal is held by another verse"
                );
            }
        }
        BucketAction::Create {
            translation,
            level,
            book,
            chapter,
            name,
        } => {
            let level: BucketLevel = level.parse()?;
            let bucket =
                buckets::create_bucket(corpus, &translation, level, book, chapter, &name)?;
            println!("{}", bucket.id);
        }
        BucketAction::Append { bucket, verses } => {
            let ids: Vec<&str> = verses.iter().map(String::as_str).collect();
            let ordinals = buckets::append_members(corpus, bucket, &ids)?;
            for (id, ordinal) in ids.iter().zip(&ordinals) {
                println!("{ordinal:>4}  {id}");
            }
        }
        BucketAction::List {
            translation,
            level,
            json,
        } => {
            let level: BucketLevel = level.parse()?;
            let list = buckets::list_buckets(corpus, &translation, level)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else if list.is_empty() {
                println!("No {level} buckets for {translation}.");
            } else {
                for bucket in &list {
                    println!("{:>6}  {}", bucket.id, bucket.name);
                }
            }
        }
        BucketAction::Members { bucket, json } => {
            if buckets::get_bucket(corpus, bucket)?.is_none() {
                return Err(Error::NotFound {
                    kind: "bucket",
                    name: bucket.to_string(),
                });
            }
            let members = buckets::bucket_member_ordinals(corpus, bucket)?;
            if json {
                let rows: Vec<serde_json::Value> = members
                    .iter()
                    .map(|(ordinal, verse)| {
                        serde_json::json!({ "ordinal": ordinal, "verse": verse })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for (ordinal, verse) in &members {
                    println!("{ordinal:>4}  {}  {}", verse.id, verse.text);
                }
            }
        }
    }
    Ok(())
}

fn cmd_index(
    corpus: &CorpusDb,
    embeddings: &EmbeddingDb,
    action: IndexAction,
) -> error::Result<()> {
    match action {
        IndexAction::Ensure => {
            let probe = SettingsProbe::new(corpus);
            let report = ann_index::ensure_ann_indexes(&probe, embeddings)?;
            println!("Best available method: {}", report.chosen);
            for action in &report.actions {
                let verb = match action {
                    ann_index::IndexAction::Created(_) => "created",
                    ann_index::IndexAction::Kept(_) => "kept",
                };
                let def = action.definition();
                println!("  {}: {verb} {} ({})", def.table.as_str(), def.name, def.method);
            }
        }
        IndexAction::Rebuild { table, method } => {
            let table: EmbeddingTable = table.parse()?;
            let method: IndexMethod = method.parse()?;
            let def = ann_index::rebuild_ann_index(embeddings, table, method)?;
            println!("{}", def.ddl);
        }
        IndexAction::Show => {
            for table in EmbeddingTable::ALL {
                match embeddings.existing_index(table)? {
                    Some(def) => println!("{}: {}", table.as_str(), def.ddl),
                    None => println!("{}: no index", table.as_str()),
                }
            }
        }
    }
    Ok(())
}

fn cmd_embed(
    corpus: &CorpusDb,
    embeddings: &EmbeddingDb,
    args: &cli::EmbedArgs,
) -> error::Result<()> {
    let table: EmbeddingTable = args.table.parse()?;
    let records = embedding_db::read_embedding_records(open_file(&args.file)?)?;

    if table == EmbeddingTable::Verse {
        for record in &records {
            if corpus.get_verse(&record.owner)?.is_none() {
                return Err(Error::NotFound {
                    kind: "verse",
                    name: record.owner.clone(),
                });
            }
        }
    }

    embeddings.store_batch(table, &records)?;
    println!("Stored {} embeddings in {}", records.len(), table.as_str());
    Ok(())
}

fn cmd_manifest(corpus: &CorpusDb, action: ManifestAction) -> error::Result<()> {
    match action {
        ManifestAction::Put { run_id, file } => {
            let json = std::fs::read_to_string(&file)?;
            manifest::put_manifest(corpus, &run_id, &json)?;
            println!("Stored manifest for {run_id}");
        }
        ManifestAction::Get { run_id } => {
            let json = manifest::get_manifest(corpus, &run_id)?.ok_or_else(|| {
                Error::NotFound {
                    kind: "manifest",
                    name: run_id.clone(),
                }
            })?;
            print!("{json}");
            if !json.ends_with('\n') {
                println!();
            }
        }
        ManifestAction::List => {
            for run_id in manifest::list_manifests(corpus)? {
                println!("{run_id}");
            }
        }
    }
    Ok(())
}

fn hybrid_plan(corpus: &CorpusDb, run: Option<&str>) -> error::Result<HybridPlan> {
    let Some(run_id) = run else {
        return Ok(HybridPlan::default());
    };
    let json = manifest::get_manifest(corpus, run_id)?.ok_or_else(|| {
        Error::NotFound {
            kind: "manifest",
            name: run_id.to_string(),
        }
    })?;
    Ok(RunManifest::parse(&json)?.index_plan.hybrid)
}

fn cmd_search(
    corpus: &CorpusDb,
    data_dir: &DataDir,
    settings: &Settings,
    mode: SearchCommand,
) -> error::Result<()> {
    let embeddings =
        EmbeddingDb::open(&data_dir.embeddings_db(), settings.embedding_dim)?;
    let lexical = LexicalIndex::open(&data_dir.lexical_dir()?)?;
    let log = open_query_log(data_dir)?;
    let searcher = Searcher::new(corpus, &embeddings, &lexical, &log);

    match mode {
        SearchCommand::Lexical(args) => {
            let hits = searcher.lexical_search(
                &args.query,
                args.translation.as_deref(),
                args.count,
            )?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else {
                search::format_lexical_hits(&hits);
            }
        }
        SearchCommand::Vector(args) => {
            let table: EmbeddingTable = args.table.parse()?;
            let model = args.model.as_deref().unwrap_or(&settings.embedding_model);
            let query = VectorQuery {
                text: &args.query,
                vector: &args.vector,
                table,
                model,
                labels: (!args.labels.is_empty()).then_some(args.labels.as_slice()),
                translation: args.translation.as_deref(),
                top_k: args.count,
            };
            let hits = searcher.vector_search(&query)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else {
                search::format_vector_hits(&hits);
            }
        }
        SearchCommand::Hybrid(args) => {
            let plan = hybrid_plan(corpus, args.run.as_deref())?;
            let args = args.vector;
            let table: EmbeddingTable = args.table.parse()?;
            let model = args.model.as_deref().unwrap_or(&settings.embedding_model);
            let query = VectorQuery {
                text: &args.query,
                vector: &args.vector,
                table,
                model,
                labels: (!args.labels.is_empty()).then_some(args.labels.as_slice()),
                translation: args.translation.as_deref(),
                top_k: plan.vector_k,
            };
            let candidates = searcher.hybrid_search(&query, plan)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&candidates)?);
            } else {
                println!("Vector candidates (k={}):", plan.vector_k);
                search::format_vector_hits(&candidates.vector);
                println!("\nLexical candidates (k={}):", plan.fts_k);
                search::format_lexical_hits(&candidates.lexical);
            }
        }
    }
    Ok(())
}

fn cmd_compare(corpus: &CorpusDb, args: &cli::CompareArgs) -> error::Result<()> {
    let translations = if args.translations.is_empty() {
        corpus
            .list_translations()?
            .into_iter()
            .map(|t| t.code)
            .collect()
    } else {
        args.translations.clone()
    };
    let comparison = corpus.compare_translations(
        args.book,
        args.chapter,
        args.verse,
        &args.suffix,
        translations.as_slice(),
    )?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&comparison)?);
        return Ok(());
    }
    for verse in &comparison.verses {
        println!("{:<8} {}", verse.key.translation, verse.text);
    }
    if !comparison.missing_translations.is_empty() {
        println!("Missing in: {}", comparison.missing_translations.join(", "));
    }
    Ok(())
}

fn cmd_log(
    corpus: &CorpusDb,
    log: &QueryLog,
    settings: &Settings,
    action: LogAction,
) -> error::Result<()> {
    match action {
        LogAction::Stats {
            days,
            interval,
            json,
        } => {
            let interval = interval.parse::<TrendInterval>()?;
            let now = Utc::now();
            let first_day = now
                .date_naive()
                .checked_sub_days(Days::new(days.saturating_sub(1)))
                .unwrap_or(now.date_naive());
            let start = first_day.and_time(chrono::NaiveTime::MIN).and_utc();
            let end = now + Duration::seconds(1);

            let summary = log.summarize(start, end)?;
            let trends = log.trends(start, end, interval)?;
            let mut usage = log.usage(start, end)?;
            usage.resolve_book_names(corpus)?;

            if json {
                let stats = serde_json::json!({
                    "summary": summary,
                    "trends": trends,
                    "usage": usage,
                });
                println!("{}", serde_json::to_string_pretty(&stats)?);
                return Ok(());
            }

            println!("Searches: {}", summary.total);
            if let Some(avg) = summary.avg_latency_ms {
                println!("Average latency: {avg:.1} ms");
            }
            for m in &summary.by_mode {
                println!("  {}: {} ({:.1}%)", m.mode, m.count, m.percentage);
            }
            if !summary.top_queries.is_empty() {
                println!("Top queries:");
                for q in &summary.top_queries {
                    println!(
                        "  {:>5}  {}  (last {})",
                        q.count,
                        q.query,
                        q.last_seen.format("%Y-%m-%d %H:%M")
                    );
                }
            }
            if !trends.points.is_empty() {
                println!("Per {}:", trends.interval);
                for p in &trends.points {
                    println!("  {}  {}", p.bucket_start.format("%Y-%m-%d %H:%M"), p.count);
                }
            }
            if !usage.translations.is_empty() {
                println!("Translations:");
                for t in &usage.translations {
                    let name = t.translation.as_deref().unwrap_or("(all)");
                    println!("  {name}: {} ({:.1}%)", t.count, t.percentage);
                }
            }
            if !usage.books.is_empty() {
                println!("Books of first result:");
                for b in &usage.books {
                    let label = b.name.clone().unwrap_or_else(|| b.book.to_string());
                    println!("  {label}: {} ({:.1}%)", b.count, b.percentage);
                }
            }
        }
        LogAction::Prune { days } => {
            let days = days.unwrap_or(settings.retention_days);
            let dropped = log.apply_retention(days, Utc::now())?;
            println!("Dropped {} partition(s)", dropped.len());
        }
    }
    Ok(())
}

fn cmd_config(corpus: &CorpusDb, action: ConfigAction) -> error::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let default = settings::KNOWN_SETTINGS
                .iter()
                .find(|(k, _)| *k == key)
                .and_then(|(_, d)| *d);
            match (corpus.get_setting(&key)?, default) {
                (Some(value), _) => println!("{value}"),
                (None, Some(default)) => println!("{default} (default)"),
                (None, None) => {
                    return Err(Error::NotFound {
                        kind: "setting",
                        name: key,
                    });
                }
            }
        }
        ConfigAction::Set { key, value } => {
            settings::validate(&key, &value)?;
            corpus.set_setting(&key, &value)?;
        }
        ConfigAction::List => {
            for (key, value) in corpus.list_settings()? {
                println!("{key} = {value}");
            }
        }
    }
    Ok(())
}

fn cmd_status(
    corpus: &CorpusDb,
    data_dir: &DataDir,
    settings: &Settings,
    json: bool,
) -> error::Result<()> {
    let embeddings =
        EmbeddingDb::open(&data_dir.embeddings_db(), settings.embedding_dim)?;
    let coverage = embeddings.embedding_coverage(corpus, &settings.embedding_model)?;
    let lexical_docs = LexicalIndex::open(&data_dir.lexical_dir()?)?.num_docs()?;

    let mut translations = Vec::new();
    for translation in corpus.list_translations()? {
        let stats = corpus.translation_stats(&translation.code)?;
        let (embedded, missing) = coverage
            .iter()
            .find(|c| c.translation == translation.code)
            .map_or((0, stats.verses), |c| (c.embedded, c.missing));
        translations.push((translation.code, stats, embedded, missing));
    }

    if json {
        let rows: Vec<serde_json::Value> = translations
            .iter()
            .map(|(code, stats, embedded, missing)| {
                serde_json::json!({
                    "code": code,
                    "verses": stats.verses,
                    "indexed": stats.indexed,
                    "chapters": stats.chapters,
                    "embedded": embedded,
                    "missing_embeddings": missing,
                })
            })
            .collect();
        let status = serde_json::json!({
            "data_dir": data_dir.root(),
            "data_dir_source": data_dir.source().to_string(),
            "schema_version": corpus.schema_version()?,
            "model": settings.embedding_model,
            "lexical_documents": lexical_docs,
            "translations": rows,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!(
            "Data directory: {} (from {})",
            data_dir.root().display(),
            data_dir.source()
        );
        println!("Schema version: {}", corpus.schema_version()?);
        println!("Model: {}", settings.embedding_model);
        println!("Lexical documents: {lexical_docs}");
        println!("Translations: {}", translations.len());
        for (code, stats, embedded, missing) in &translations {
            println!(
                "  {code}: {} verses, {} numbered, {} chapters, \
                 {embedded} embedded, {missing} missing",
                stats.verses, stats.indexed, stats.chapters
            );
        }
    }
    Ok(())
}
