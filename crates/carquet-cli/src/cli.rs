use std::path::PathBuf;

use carquet_ingest::IngestConfig;
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "carquet",
    about = "Convert content-addressed block archives into columnar bundles",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Convert a CAR archive into a bundle directory
    Convert(ConvertArgs),
    /// Print the original bytes of one block
    Get(GetArgs),
    /// List block identifiers in index order
    List(ListArgs),
    /// Show buckets, largest first
    Schemas(SchemasArgs),
    /// Rehydrate and hash-check every block
    Verify(VerifyArgs),
    /// Write selected blocks to a new CAR archive
    Extract(ExtractArgs),
}

#[derive(Args)]
pub struct ConvertArgs {
    pub archive: PathBuf,
    pub out: PathBuf,
    /// TOML file with ingestion settings; flags override it
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub flush_rows: Option<usize>,
    #[arg(long)]
    pub flush_bytes: Option<usize>,
    #[arg(long)]
    pub workers: Option<usize>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// zstd level for Parquet column chunks
    #[arg(long)]
    pub level: Option<i32>,
}

impl ConvertArgs {
    pub fn apply(&self, config: &mut IngestConfig) {
        if let Some(n) = self.flush_rows {
            config.writer.flush_rows = n;
        }
        if let Some(n) = self.flush_bytes {
            config.writer.flush_bytes = n;
        }
        if let Some(n) = self.workers {
            config.workers = n;
        }
        if let Some(n) = self.batch_size {
            config.batch_size = n;
        }
        if let Some(level) = self.level {
            config.writer.compression_level = level;
        }
    }
}

#[derive(Args)]
pub struct GetArgs {
    pub bundle: PathBuf,
    /// Block CID as a multibase string (CIDv0 or CIDv1)
    pub cid: String,
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct ListArgs {
    pub bundle: PathBuf,
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,
}

#[derive(Args)]
pub struct SchemasArgs {
    pub bundle: PathBuf,
}

#[derive(Args)]
pub struct VerifyArgs {
    pub bundle: PathBuf,
}

#[derive(Args)]
pub struct ExtractArgs {
    pub bundle: PathBuf,
    /// File with one multibase CID per line
    pub cids: PathBuf,
    pub out: PathBuf,
}
