mod backend;
mod cli;
mod engine;
mod error;
mod export;
mod logging;
mod model;
mod orchestrator;
mod render;
mod storage;
mod text_summary;
#[cfg(feature = "tui")]
mod tui;

use anyhow::Result;
use clap::Parser;
use logging::Verbosity;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let is_silent = args.silent;
    let is_non_tui = !args.is_interactive();

    let verbosity = if args.verbose {
        Verbosity::Verbose
    } else if args.quiet || args.silent {
        Verbosity::Quiet
    } else if !is_non_tui {
        Verbosity::Tui
    } else {
        Verbosity::Normal
    };
    logging::init_logger(verbosity, args.no_color);

    match cli::run(args).await {
        Ok(()) => {
            // Explicitly exit with code 0 on success, especially for non-TUI modes
            if is_non_tui {
                std::process::exit(0);
            }
            Ok(())
        }
        Err(e) => {
            if is_silent {
                println!("{:#}", e);
                std::process::exit(1);
            } else {
                Err(e)
            }
        }
    }
}
