//! Command line definition for the `quarry-cli` binary.

use std::collections::BTreeSet;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ActionArg {
    /// Print one CSV row per file
    #[value(alias = "ls")]
    List,
    /// Write decompressed files under the output directory
    #[value(alias = "ex")]
    Extract,
    /// Print rows and extract under content-addressed ids
    Index,
    /// Print the product version embedded in executables
    Exever,
    /// Print md5/sha1 digests or link targets
    Checksum,
}

#[derive(Parser, Debug)]
#[command(
    name = "quarry",
    version,
    about = "Inspect and extract game distribution containers"
)]
pub struct Cli {
    /// Action to perform
    #[arg(value_enum)]
    pub action: ActionArg,

    /// Manifest file, archive, or directory to inspect
    pub manifest: PathBuf,

    /// Cdn directory backing the manifest
    pub cdn: Option<PathBuf>,

    /// Remote URL prefix to fetch missing bundles from
    #[arg(long)]
    pub remote: Option<String>,

    /// Output directory for extraction
    #[arg(short, long, default_value = ".")]
    pub output: PathBuf,

    /// Filter: languages, comma or space separated ("none" selects
    /// international files)
    #[arg(short = 'l', long = "lang")]
    pub lang: Option<String>,

    /// Filter: paths, textual or as 0x-prefixed 64-bit hashes
    #[arg(short = 'p', long = "path")]
    pub path: Option<String>,

    /// Filter: extensions with leading dot
    #[arg(short = 'e', long = "ext")]
    pub ext: Option<String>,

    /// Hash list file for names
    #[arg(long)]
    pub hashes_names: Option<PathBuf>,

    /// Hash list file for extensions
    #[arg(long)]
    pub hashes_exts: Option<PathBuf>,

    /// Maximum archive recursion depth
    #[arg(long, default_value_t = 1)]
    pub max_depth: u32,

    /// Also print archive files that are being recursed into
    #[arg(long)]
    pub show_wads: bool,

    /// Skip top-level files that are not archives
    #[arg(long)]
    pub skip_root: bool,
}

/// Splits a filter list on commas and spaces, lowercasing every entry.
pub fn parse_list(value: &str) -> BTreeSet<String> {
    value
        .split([',', ' '])
        .filter(|piece| !piece.is_empty())
        .map(|piece| piece.to_lowercase())
        .collect()
}
