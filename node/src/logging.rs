//! # Logging
//!
//! `lattice-node` prints command results (JSON reports, values, hex
//! locations) on stdout so they can be piped. Logs therefore go to stderr,
//! either as coloured text or as JSON lines (`--log-format json`).
//!
//! The default filter keeps the storage engine quiet unless something goes
//! wrong; `RUST_LOG` replaces it entirely:
//!
//! ```text
//! RUST_LOG=lattice_db=debug lattice-node verify      # reconciliation + scrub detail
//! RUST_LOG=lattice_db=trace lattice-node append blocks cafe --hex
//! ```

use clap::ValueEnum;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Coloured text for a terminal.
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Install the global subscriber. Must run once, before the database is
/// opened, so that reconciliation on open is logged.
pub fn init_logging(default_filter: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .init(),
    }
}
