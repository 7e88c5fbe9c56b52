//! # CLI Interface
//!
//! Defines the command-line argument structure for `logbee` using `clap`
//! derive. Every subcommand runs against one tree file; views (sub-trees and
//! checkouts) are selected with global flags.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Inspect and edit logbee trees stored in a local file.
///
/// Output is one JSON object per line on stdout. Diagnostics go to stderr.
#[derive(Parser, Debug)]
#[command(
    name = "logbee",
    about = "Inspect and edit logbee trees",
    version,
    propagate_version = true
)]
pub struct LogbeeCli {
    /// Path to the tree file. Created on first write.
    #[arg(long, short = 'f', env = "LOGBEE_FILE", global = true, default_value = "tree.bee")]
    pub file: PathBuf,

    /// Log output format on stderr: "pretty" or "json".
    #[arg(long, env = "LOGBEE_LOG_FORMAT", global = true, default_value = "pretty")]
    pub log_format: String,

    /// Scope the command to a sub-tree. Repeat to nest.
    #[arg(long, global = true)]
    pub sub: Vec<String>,

    /// Run against a historical version instead of the head.
    #[arg(long, global = true)]
    pub checkout: Option<u64>,

    /// Treat keys and values as hex, both on input and output.
    #[arg(long, global = true)]
    pub hex: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Store a value under a key.
    Put {
        key: String,
        value: String,
        /// Refuse to overwrite unless the stored value equals this. Keys
        /// that are not present are always written.
        #[arg(long)]
        expect: Option<String>,
    },
    /// Print the entry stored under a key.
    Get { key: String },
    /// Delete a key.
    Del { key: String },
    /// List entries in key order.
    Scan(RangeArgs),
    /// List every record of the log, deletes included.
    History(HistoryArgs),
    /// List keys that differ between the current view and another version.
    Diff {
        /// Version to compare against.
        #[arg(id = "diff_version", value_name = "VERSION")]
        version: u64,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Print the tree header.
    Header,
    /// Walk the tree and report structural problems.
    Check,
    /// Print version information and exit.
    Version,
}

/// Key bounds shared by `scan` and `diff`.
#[derive(Args, Debug, Default)]
pub struct RangeArgs {
    #[arg(long)]
    pub gt: Option<String>,
    #[arg(long)]
    pub gte: Option<String>,
    #[arg(long)]
    pub lt: Option<String>,
    #[arg(long)]
    pub lte: Option<String>,
    #[arg(long)]
    pub reverse: bool,
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// First seq to include.
    #[arg(long)]
    pub gte: Option<u64>,
    /// Seq to stop before.
    #[arg(long)]
    pub lt: Option<u64>,
    #[arg(long)]
    pub reverse: bool,
    #[arg(long)]
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        LogbeeCli::command().debug_assert();
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = LogbeeCli::parse_from([
            "logbee", "scan", "--gte", "a", "--limit", "3", "--sub", "users", "--hex",
        ]);
        assert!(cli.hex);
        assert_eq!(cli.sub, vec!["users".to_string()]);
        match cli.command {
            Commands::Scan(range) => {
                assert_eq!(range.gte.as_deref(), Some("a"));
                assert_eq!(range.limit, Some(3));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
