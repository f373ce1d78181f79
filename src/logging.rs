//! Logging setup on top of `tracing`.
//!
//! Diagnostics always go to stderr so stdout stays clean for `--json` and `--text` output.
//! `RUST_LOG` overrides the default filter unless `--verbose` or `--quiet` is given.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How loud the process should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Full-screen TUI owns the terminal; log nothing unless `RUST_LOG` asks for it.
    Tui,
    Quiet,
    Normal,
    Verbose,
}

fn filter_for(verbosity: Verbosity) -> EnvFilter {
    match verbosity {
        Verbosity::Verbose => EnvFilter::new("archgraph=debug,warn"),
        Verbosity::Quiet => EnvFilter::new("error"),
        Verbosity::Normal => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("archgraph=warn,error")),
        Verbosity::Tui => {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off"))
        }
    }
}

/// Install the global subscriber. Call once, before anything logs.
pub fn init_logger(verbosity: Verbosity, no_color: bool) {
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .with_ansi(!no_color)
        .compact();

    // A subscriber may already be installed (tests, embedding); keep the existing one.
    let _ = tracing_subscriber::registry()
        .with(filter_for(verbosity))
        .with(fmt_layer)
        .try_init();
}
