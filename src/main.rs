//! hotupdater CLI entry point
//!
//! Parses the command line, runs the command and prints failures with recovery advice.
//! Also serves as the elevated helper when started with `--update`.

use anyhow::Result;
use clap::Parser;
use hotupdater::cli;
use hotupdater::core::user_friendly_error;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    // Set up colored output for Windows
    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();

    match cli.execute().await {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(e) => {
            let error_ctx = user_friendly_error(e);
            error_ctx.display();
            std::process::exit(1);
        }
    }
}
