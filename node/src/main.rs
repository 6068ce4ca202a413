// Copyright (c) 2026 Lattice Contributors. MIT License.
// See LICENSE for details.

//! # Lattice Node Storage CLI
//!
//! Entry point for the `lattice-node` binary. Parses CLI arguments,
//! initializes logging, opens the database (which reconciles flat files with
//! metadata exactly as a node start does), runs one command, and closes the
//! database again.
//!
//! - `info`     stores and their write cursors
//! - `verify`   scrub one or all flat-file stores
//! - `get` / `put` / `delete` / `list`  metadata keys
//! - `append` / `retrieve`  flat-file records
//! - `version`  print build version information

mod cli;
mod logging;

use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;

use lattice_db::{Database, DatabaseConfig, FlatFileLocation, StoreReport};

use cli::{parse_bucket, parse_bytes, render_bytes, Commands, LatticeNodeCli};

fn main() -> Result<()> {
    let cli = LatticeNodeCli::parse();
    let mut stdout = io::stdout().lock();

    if matches!(cli.command, Commands::Version) {
        return write_version(&mut stdout);
    }

    logging::init_logging("lattice_node=info,lattice_db=warn", cli.log_format);

    let config = load_config(cli.config.as_deref())?;
    let db = Database::builder(&cli.data_dir)
        .config(config)
        .open()
        .with_context(|| format!("failed to open database at {}", cli.data_dir.display()))?;
    tracing::info!(data_dir = %cli.data_dir.display(), "database opened");

    let result = execute(&db, cli.command, &mut stdout);
    let closed = db.close().context("failed to close database");
    result?;
    closed?;
    stdout.flush()?;
    Ok(())
}

/// Database tunables from `path`, or the defaults.
fn load_config(path: Option<&Path>) -> Result<DatabaseConfig> {
    match path {
        Some(path) => DatabaseConfig::from_json_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(DatabaseConfig::default()),
    }
}

/// Run one command against an open database, writing its output to `out`.
fn execute(db: &Database, command: Commands, out: &mut impl Write) -> Result<()> {
    match command {
        Commands::Info => {
            let mut stores = Vec::new();
            for name in db.store_names()? {
                let location = db.current_location(&name)?;
                stores.push(json!({
                    "store": name,
                    "file": location.file_number,
                    "offset": location.file_offset,
                }));
            }
            let info = json!({
                "path": db.path().display().to_string(),
                "max_open_files": db.config().max_open_files,
                "max_file_size": db.config().max_file_size,
                "stores": stores,
            });
            writeln!(out, "{}", serde_json::to_string_pretty(&info)?)?;
        }

        Commands::Verify(args) => {
            let names = match args.store {
                Some(store) => vec![store],
                None => db.store_names()?,
            };
            let reports = names
                .iter()
                .map(|name| db.verify_store(name).with_context(|| format!("failed to verify store '{name}'")))
                .collect::<Result<Vec<StoreReport>>>()?;
            writeln!(out, "{}", serde_json::to_string_pretty(&reports)?)?;

            let corrupt: Vec<&str> = reports
                .iter()
                .filter(|r| r.first_corrupt.is_some())
                .map(|r| r.store.as_str())
                .collect();
            if !corrupt.is_empty() {
                anyhow::bail!("corrupt records found in: {}", corrupt.join(", "));
            }
        }

        Commands::Get(args) => {
            let key = parse_bucket(&args.bucket)?.key(parse_bytes(&args.key, args.hex)?);
            let value = db.get(&key).with_context(|| format!("failed to read {key}"))?;
            writeln!(out, "{}", render_bytes(&value, args.hex))?;
        }

        Commands::Put(args) => {
            let key = parse_bucket(&args.bucket)?.key(parse_bytes(&args.key, args.hex)?);
            let value = parse_bytes(&args.value, args.hex)?;
            db.put(&key, &value).with_context(|| format!("failed to write {key}"))?;
            tracing::info!(%key, bytes = value.len(), "value stored");
        }

        Commands::Delete(args) => {
            let key = parse_bucket(&args.bucket)?.key(parse_bytes(&args.key, args.hex)?);
            db.delete(&key).with_context(|| format!("failed to delete {key}"))?;
            tracing::info!(%key, "key deleted");
        }

        Commands::List(args) => {
            let bucket = parse_bucket(&args.bucket)?;
            let mut cursor = db.cursor(&bucket)?;
            while cursor.next()? {
                let key = cursor.key()?;
                writeln!(
                    out,
                    "{}\t{}",
                    render_bytes(key.suffix(), args.hex),
                    render_bytes(cursor.value()?, args.hex)
                )?;
            }
            cursor.close()?;
        }

        Commands::Append(args) => {
            let data = match (&args.file, &args.data) {
                (Some(file), _) => std::fs::read(file)
                    .with_context(|| format!("failed to read {}", file.display()))?,
                (None, Some(data)) => parse_bytes(data, args.hex)?,
                (None, None) => anyhow::bail!("nothing to append"),
            };
            let location = db
                .append_to_store(&args.store, &data)
                .with_context(|| format!("failed to append to store '{}'", args.store))?;
            tracing::info!(
                store = %args.store,
                location = %FlatFileLocation::deserialize(&location)?,
                bytes = data.len(),
                "record appended"
            );
            writeln!(out, "{}", hex::encode(location))?;
        }

        Commands::Retrieve(args) => {
            let location = hex::decode(args.location.trim())
                .with_context(|| format!("{:?} is not a hex location", args.location))?;
            let payload = db
                .retrieve_from_store(&args.store, &location)
                .with_context(|| format!("failed to retrieve from store '{}'", args.store))?;
            if args.hex {
                writeln!(out, "{}", hex::encode(&payload))?;
            } else {
                out.write_all(&payload)?;
            }
        }

        Commands::Version => write_version(out)?,
    }
    Ok(())
}

/// Prints version information.
fn write_version(out: &mut impl Write) -> Result<()> {
    writeln!(out, "lattice-node {}", env!("CARGO_PKG_VERSION"))?;
    writeln!(out, "rustc        {}", rustc_version())?;
    Ok(())
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}
