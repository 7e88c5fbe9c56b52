// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # logbee CLI
//!
//! Entry point for the `logbee` binary. Opens a tree file, selects a view
//! from the global flags, runs one subcommand and prints its results as JSON
//! lines.
//!
//! - `put` / `get` / `del`: single-key reads and writes
//! - `scan`: ordered range listing
//! - `history`: every record in the log
//! - `diff`: keys that changed between two versions
//! - `header`: the tree header
//! - `check`: structural validation
//! - `version`: print build version information

mod cli;
mod file_log;
mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use serde_json::{json, Value};

use logbee::{Bee, BeeOptions, Entry, HistoryKind, HistoryOptions, RangeOptions, WriteOptions};

use cli::{Commands, HistoryArgs, LogbeeCli, RangeArgs};
use file_log::FileLog;
use logging::LogFormat;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = LogbeeCli::parse();
    logging::init_logging("logbee=warn,logbee_cli=info", LogFormat::from_str_lossy(&cli.log_format));

    if let Commands::Version = cli.command {
        print_version();
        return Ok(());
    }

    let log = FileLog::open(&cli.file)
        .await
        .with_context(|| format!("failed to open tree file {}", cli.file.display()))?;
    let root = Bee::new(Arc::new(log), BeeOptions::default());

    let mut bee = match cli.checkout {
        Some(version) => root.checkout(version),
        None => root.clone(),
    };
    for sub in &cli.sub {
        bee = bee.sub(sub.as_bytes());
    }

    let codec = Codec { hex: cli.hex };
    let result = run(&bee, &codec, cli.command).await;
    root.close().await.context("failed to close tree")?;
    result
}

async fn run(bee: &Bee, codec: &Codec, command: Commands) -> Result<()> {
    match command {
        Commands::Put { key, value, expect } => {
            let key = codec.decode(&key)?;
            let value = codec.decode(&value)?;
            let opts = match expect {
                Some(expected) => {
                    let expected = codec.decode(&expected)?;
                    WriteOptions::with_cas(move |prev: &Entry, _: &Entry| {
                        prev.value.as_ref() == Some(&expected)
                    })
                }
                None => WriteOptions::default(),
            };
            let before = bee.version();
            bee.put_with(&key, &value, opts).await.context("put failed")?;
            emit(json!({ "written": bee.version() > before, "version": bee.version() }));
        }
        Commands::Get { key } => {
            let key = codec.decode(&key)?;
            match bee.get(&key).await.context("get failed")? {
                Some(entry) => emit(codec.entry(&entry)),
                None => emit(json!({ "key": codec.encode(&key), "value": null })),
            }
        }
        Commands::Del { key } => {
            let key = codec.decode(&key)?;
            let before = bee.version();
            bee.del(&key).await.context("del failed")?;
            emit(json!({ "deleted": bee.version() > before, "version": bee.version() }));
        }
        Commands::Scan(range) => {
            let mut iter = bee.range(range_options(codec, range)?);
            while let Some(entry) = iter.next().await.context("scan failed")? {
                emit(codec.entry(&entry));
            }
        }
        Commands::History(args) => {
            let mut iter = bee.history(history_options(args));
            while let Some(entry) = iter.next().await.context("history failed")? {
                let kind = match entry.kind {
                    HistoryKind::Put => "put",
                    HistoryKind::Del => "del",
                };
                emit(json!({
                    "type": kind,
                    "seq": entry.seq,
                    "key": codec.encode(&entry.key),
                    "value": entry.value.as_deref().map(|v| codec.encode(v)),
                }));
            }
        }
        Commands::Diff { version, range } => {
            let mut iter = bee.diff(version, range_options(codec, range)?);
            while let Some(change) = iter.next().await.context("diff failed")? {
                let side = |e: &Option<Entry>| e.as_ref().map(|e| codec.entry(e)).unwrap_or(Value::Null);
                emit(json!({ "left": side(&change.left), "right": side(&change.right) }));
            }
        }
        Commands::Header => {
            let header = bee.get_header().await.context("failed to read header")?;
            emit(json!({
                "protocol": header.protocol,
                "metadata": header.metadata.as_deref().map(hex::encode),
            }));
        }
        Commands::Check => {
            let report = bee.check().await.context("check failed")?;
            emit(json!({
                "ok": report.is_ok(),
                "version": report.version,
                "keys": report.keys,
                "nodes": report.nodes,
                "depth": report.depth,
                "violations": report.violations,
            }));
            if !report.is_ok() {
                anyhow::bail!("tree has {} violation(s)", report.violations.len());
            }
        }
        Commands::Version => print_version(),
    }
    Ok(())
}

fn range_options(codec: &Codec, args: RangeArgs) -> Result<RangeOptions> {
    let mut opts = RangeOptions::new();
    if let Some(k) = args.gt {
        opts = opts.gt(codec.decode(&k)?);
    }
    if let Some(k) = args.gte {
        opts = opts.gte(codec.decode(&k)?);
    }
    if let Some(k) = args.lt {
        opts = opts.lt(codec.decode(&k)?);
    }
    if let Some(k) = args.lte {
        opts = opts.lte(codec.decode(&k)?);
    }
    if args.reverse {
        opts = opts.reverse();
    }
    if let Some(n) = args.limit {
        opts = opts.limit(n);
    }
    Ok(opts)
}

fn history_options(args: HistoryArgs) -> HistoryOptions {
    HistoryOptions {
        gte: args.gte,
        lt: args.lt,
        reverse: args.reverse,
        limit: args.limit,
    }
}

/// Converts keys and values between the command line and raw bytes.
struct Codec {
    hex: bool,
}

impl Codec {
    fn decode(&self, s: &str) -> Result<Bytes> {
        if self.hex {
            let raw = hex::decode(s).with_context(|| format!("invalid hex: {s}"))?;
            Ok(Bytes::from(raw))
        } else {
            Ok(Bytes::copy_from_slice(s.as_bytes()))
        }
    }

    fn encode(&self, raw: &[u8]) -> String {
        if self.hex {
            hex::encode(raw)
        } else {
            String::from_utf8_lossy(raw).into_owned()
        }
    }

    fn entry(&self, entry: &Entry) -> Value {
        json!({
            "seq": entry.seq,
            "key": self.encode(&entry.key),
            "value": entry.value.as_deref().map(|v| self.encode(v)),
        })
    }
}

fn emit(value: Value) {
    println!("{value}");
}

fn print_version() {
    println!("logbee {}", env!("CARGO_PKG_VERSION"));
}
