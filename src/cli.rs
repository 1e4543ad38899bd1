use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "versedb",
    about = "Store, number, group and search verse corpora"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ingest verses from a JSON-lines file
    Ingest(IngestArgs),
    /// Assign absolute positions to verses that have none
    Backfill,
    /// Discard and reassign every absolute position of a translation
    Renumber {
        /// Translation code
        translation: String,
    },
    /// Build and inspect verse buckets
    Bucket {
        #[command(subcommand)]
        action: BucketAction,
    },
    /// Manage approximate-nearest-neighbour indexes
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },
    /// Store embeddings from a JSON-lines file
    Embed(EmbedArgs),
    /// Store and read run manifests
    Manifest {
        #[command(subcommand)]
        action: ManifestAction,
    },
    /// Search the corpus
    Search {
        #[command(subcommand)]
        mode: SearchCommand,
    },
    /// Print verses by absolute position
    Slice(SliceArgs),
    /// Print verses by id
    Verse(VerseArgs),
    /// Print one verse from several translations side by side
    Compare(CompareArgs),
    /// Inspect and prune the query log
    Log {
        #[command(subcommand)]
        action: LogAction,
    },
    /// Read and write settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show system status and statistics
    Status(StatusArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Ingest --

#[derive(Debug, Parser)]
pub struct IngestArgs {
    /// JSON-lines file with one verse record per line
    pub file: PathBuf,

    /// Conflict policy for changed verses (reject or overwrite)
    #[arg(long)]
    pub policy: Option<String>,

    /// Skip updating the full-text index
    #[arg(long)]
    pub no_lexical: bool,
}

// -- Buckets --

#[derive(Debug, Subcommand)]
pub enum BucketAction {
    /// Create one bucket per chapter and fill it
    Build,
    /// Create a bucket for an external grouping
    Create {
        /// Translation code
        translation: String,
        /// Bucket level (chapter, paragraph, pericope, section or custom)
        #[arg(long)]
        level: String,
        /// Book number
        #[arg(long)]
        book: u32,
        /// Chapter number
        #[arg(long)]
        chapter: Option<u32>,
        /// Display name
        #[arg(long)]
        name: String,
    },
    /// Append verses to the end of a bucket
    Append {
        /// Bucket id
        bucket: u64,
        /// Verse ids in member order
        #[arg(required = true)]
        verses: Vec<String>,
    },
    /// List buckets of one level
    List {
        /// Translation code
        translation: String,
        /// Bucket level
        #[arg(long, default_value = "chapter")]
        level: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the members of a bucket in order
    Members {
        /// Bucket id
        bucket: u64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

// -- ANN indexes --

#[derive(Debug, Subcommand)]
pub enum IndexAction {
    /// Create the best available index on every embedding table
    Ensure,
    /// Replace the index on one table
    Rebuild {
        /// Embedding table (verse, chunk or asset)
        table: String,
        /// Index method (diskann, hnsw or ivfflat)
        method: String,
    },
    /// Show the index on every embedding table
    Show,
}

// -- Embeddings --

#[derive(Debug, Parser)]
pub struct EmbedArgs {
    /// JSON-lines file with one embedding record per line
    pub file: PathBuf,

    /// Embedding table (verse, chunk or asset)
    #[arg(long, default_value = "verse")]
    pub table: String,
}

// -- Manifests --

#[derive(Debug, Subcommand)]
pub enum ManifestAction {
    /// Store a manifest file under a run id
    Put {
        /// Run id
        run_id: String,
        /// JSON file
        file: PathBuf,
    },
    /// Print a stored manifest
    Get {
        /// Run id
        run_id: String,
    },
    /// List stored run ids
    List,
}

// -- Search --

#[derive(Debug, Subcommand)]
pub enum SearchCommand {
    /// Full-text search over verse text
    Lexical(LexicalArgs),
    /// Nearest neighbours of a query vector
    Vector(VectorArgs),
    /// Both candidate lists for a query
    Hybrid(HybridArgs),
}

#[derive(Debug, Parser)]
pub struct LexicalArgs {
    /// The search query
    pub query: String,

    /// Number of results to return
    #[arg(short = 'n', long, default_value = "10")]
    pub count: usize,

    /// Search only within this translation
    #[arg(short = 't', long)]
    pub translation: Option<String>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct VectorArgs {
    /// Text the vector was computed from, recorded in the query log
    pub query: String,

    /// Query vector as comma-separated floats
    #[arg(long, value_delimiter = ',', required = true, allow_hyphen_values = true)]
    pub vector: Vec<f32>,

    /// Embedding table (verse, chunk or asset)
    #[arg(long, default_value = "verse")]
    pub table: String,

    /// Embedding model (defaults to the configured model)
    #[arg(long)]
    pub model: Option<String>,

    /// Keep only owners carrying one of these labels
    #[arg(long, value_delimiter = ',')]
    pub labels: Vec<u16>,

    /// Number of results to return
    #[arg(short = 'n', long, default_value = "10")]
    pub count: usize,

    /// Search only within this translation
    #[arg(short = 't', long)]
    pub translation: Option<String>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct HybridArgs {
    #[command(flatten)]
    pub vector: VectorArgs,

    /// Take candidate list sizes from this run's manifest
    #[arg(long)]
    pub run: Option<String>,
}

// -- Slice --

#[derive(Debug, Parser)]
pub struct SliceArgs {
    /// Translation code
    pub translation: String,

    /// First absolute position
    pub start: u64,

    /// Number of verses
    #[arg(default_value = "10")]
    pub count: u64,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Verse lookup --

#[derive(Debug, Parser)]
pub struct VerseArgs {
    /// Verse ids, e.g. KJV:43:3:16
    #[arg(required = true)]
    pub ids: Vec<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct CompareArgs {
    /// Book number
    pub book: u32,

    /// Chapter number
    pub chapter: u32,

    /// Verse number
    pub verse: u32,

    /// Split-verse suffix
    #[arg(long, default_value = "")]
    pub suffix: String,

    /// Translations to compare (defaults to every stored translation)
    #[arg(short = 't', long, value_delimiter = ',')]
    pub translations: Vec<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Query log --

#[derive(Debug, Subcommand)]
pub enum LogAction {
    /// Summarise recent searches
    Stats {
        /// Number of days to include, counting today
        #[arg(long, default_value = "7")]
        days: u64,
        /// Trend bucket width (hour or day)
        #[arg(long, default_value = "day")]
        interval: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Drop partitions older than the retention window
    Prune {
        /// Days to keep (defaults to the configured retention)
        #[arg(long)]
        days: Option<u64>,
    },
}

// -- Config --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print one setting
    Get {
        /// Setting key
        key: String,
    },
    /// Validate and store a setting
    Set {
        /// Setting key
        key: String,
        /// New value
        value: String,
    },
    /// Print every stored setting
    List,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "versedb",
            &mut std::io::stdout(),
        );
    }
}
