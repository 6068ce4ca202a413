//! # CLI Interface
//!
//! Defines the command-line argument structure for `lattice-node` using
//! `clap` derive, plus the small parsers that turn argument strings into
//! buckets and byte strings.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use lattice_db::Bucket;

use crate::logging::LogFormat;

/// Lattice node storage administration.
///
/// Opens the node's database directly (reconciling it as a normal start
/// would) to inspect, verify, and edit it. Do not point it at a database a
/// running node has open.
#[derive(Parser, Debug)]
#[command(
    name = "lattice-node",
    about = "Lattice node storage administration",
    version,
    propagate_version = true
)]
pub struct LatticeNodeCli {
    /// Database directory. Created on first use.
    #[arg(long, short = 'd', global = true, env = "LATTICE_DATA_DIR", default_value = "lattice-data")]
    pub data_dir: PathBuf,

    /// JSON file with database tunables (`max_open_files`, `max_file_size`).
    #[arg(long, short = 'c', global = true, env = "LATTICE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format. Logs go to stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Open and reconcile the database, then list every store and its
    /// write cursor.
    Info,
    /// Check the framing and checksum of every record in one or all stores.
    Verify(VerifyArgs),
    /// Print the value stored under a key.
    Get(KeyArgs),
    /// Store a value under a key.
    Put(PutArgs),
    /// Remove a key.
    Delete(KeyArgs),
    /// List every key of a bucket in order.
    List(ListArgs),
    /// Append a record to a flat-file store and print its location.
    Append(AppendArgs),
    /// Print the record at a location in a flat-file store.
    Retrieve(RetrieveArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Store to verify. All recorded stores when omitted.
    pub store: Option<String>,
}

#[derive(Args, Debug)]
pub struct KeyArgs {
    /// Bucket path, segments separated by `/` (e.g. `dag/tips`).
    pub bucket: String,
    pub key: String,
    /// Key (and printed value) are hex instead of UTF-8.
    #[arg(long)]
    pub hex: bool,
}

#[derive(Args, Debug)]
pub struct PutArgs {
    /// Bucket path, segments separated by `/`.
    pub bucket: String,
    pub key: String,
    pub value: String,
    /// Key and value are hex instead of UTF-8.
    #[arg(long)]
    pub hex: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Bucket path, segments separated by `/`.
    pub bucket: String,
    /// Print keys and values as hex.
    #[arg(long)]
    pub hex: bool,
}

#[derive(Args, Debug)]
pub struct AppendArgs {
    /// Flat-file store name.
    pub store: String,
    /// Record payload. Read from `--file` when omitted.
    #[arg(required_unless_present = "file", conflicts_with = "file")]
    pub data: Option<String>,
    /// Read the payload from a file.
    #[arg(long)]
    pub file: Option<PathBuf>,
    /// The payload argument is hex instead of UTF-8.
    #[arg(long)]
    pub hex: bool,
}

#[derive(Args, Debug)]
pub struct RetrieveArgs {
    /// Flat-file store name.
    pub store: String,
    /// Hex-encoded 12-byte location as printed by `append`.
    pub location: String,
    /// Print the payload as hex.
    #[arg(long)]
    pub hex: bool,
}

// ---------------------------------------------------------------------------
// Argument parsing
// ---------------------------------------------------------------------------

/// `a/b/c` into a three-segment bucket. Empty segments are ignored.
pub fn parse_bucket(path: &str) -> Result<Bucket> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        anyhow::bail!("bucket path {path:?} has no segments");
    }
    Ok(Bucket::new(segments))
}

/// Argument bytes, hex-decoded when `hex` is set.
pub fn parse_bytes(input: &str, hex: bool) -> Result<Vec<u8>> {
    if hex {
        hex::decode(input.trim_start_matches("0x")).with_context(|| format!("{input:?} is not valid hex"))
    } else {
        Ok(input.as_bytes().to_vec())
    }
}

/// Bytes for display: hex, or UTF-8 with replacement characters.
pub fn render_bytes(bytes: &[u8], hex: bool) -> String {
    if hex {
        hex::encode(bytes)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}
