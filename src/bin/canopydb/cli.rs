use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CanopyDB store CLI
#[derive(Parser, Debug)]
#[command(name = "canopydb", version, about = "CanopyDB store CLI", arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as Parser>::parse()
    }
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Print germ, zones, trees and metrics of a store
    Status {
        #[arg(long)]
        path: PathBuf,
        /// JSON output (single object)
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// List trees (name, kind, length, sizes)
    Trees {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Put key/value into an ordered map and commit
    ///
    /// Keys and values: literal UTF-8 or `hex:..`; values also `@file` or `-` (stdin).
    Put {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        tree: String,
        #[arg(long)]
        key: String,
        #[arg(long)]
        value: String,
    },
    /// Get a key from an ordered map
    Get {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        tree: String,
        #[arg(long)]
        key: String,
        /// Optional file to write the raw value into
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Remove a key from an ordered map and commit
    Del {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        tree: String,
        #[arg(long)]
        key: String,
    },
    /// Ordered scan of a map, optionally starting at a key
    Scan {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        tree: String,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        /// JSONL output
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Append an entry to a sequence list and commit
    Append {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        list: String,
        #[arg(long)]
        key: String,
        #[arg(long)]
        value: String,
    },
    /// Compact the store (rewrite old pages, retire unreferenced zones)
    Compact {
        #[arg(long)]
        path: PathBuf,
        /// Skip unless fill is below this (default: config min_tree_fill)
        #[arg(long)]
        min_fill: Option<f64>,
        /// Rewrite pages older than this version (default: everything committed)
        #[arg(long)]
        floor: Option<u64>,
        #[arg(long, default_value_t = false)]
        force: bool,
        /// Start a new zone first so older zones can be retired
        #[arg(long, default_value_t = false)]
        shift: bool,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Start a new zone
    Shift {
        #[arg(long)]
        path: PathBuf,
    },
}
