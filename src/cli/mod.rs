//! Command-line interface for hotupdater.
//!
//! # Commands
//!
//! - `run` - Replace an installed application with a new version
//! - `backups list` - Show the backup catalog
//! - `backups restore` - Put a backup back in place
//!
//! # Helper mode
//!
//! `hotupdater --update <request file> [--pipe <path>] [--config <file>]` runs the
//! elevated helper. It is started by `run --elevate` and not meant to be typed by hand.
//!
//! # Examples
//!
//! ```bash
//! # Replace a single executable, waiting for it to exit first
//! hotupdater run --app /usr/local/bin/myapp --artifact /tmp/myapp-2.0 --new-version 2.0.0
//!
//! # Download and install a macOS bundle with administrator rights, then restart it
//! hotupdater run --app /Applications/MyApp.app --artifact /tmp/MyApp.zip \
//!     --url https://example.com/MyApp-2.0.zip --elevate --restart
//!
//! # Roll back by hand
//! hotupdater backups restore --app /usr/local/bin/myapp --latest
//! ```

mod backups;
mod lock;
mod render;
mod run;

pub use lock::UpdateLock;
pub use render::{NO_PROGRESS_ENV, ProgressRenderer};

use crate::config::UpdaterConfig;
use crate::helper;
use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Main CLI structure for hotupdater.
#[derive(Parser, Debug)]
#[command(
    name = "hotupdater",
    about = "Self-update engine: download, back up, replace and roll back an application",
    version,
    author
)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable debug output.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only print errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a custom configuration file.
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Disable the progress bar.
    #[arg(long, global = true)]
    no_progress: bool,

    /// Run as the elevated helper for this request file.
    #[arg(long, value_name = "REQUEST", hide = true)]
    update: Option<PathBuf>,

    /// Named pipe to write the helper channel to.
    #[arg(long, value_name = "PIPE", hide = true, requires = "update")]
    pipe: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Update an installed application.
    Run(run::RunCommand),

    /// Inspect and restore backups.
    Backups(backups::BackupsCommand),
}

impl Cli {
    /// Execute the parsed command line and return the process exit code.
    pub async fn execute(self) -> Result<i32> {
        init_logging(self.log_level());

        if let Some(request_file) = &self.update {
            let config = UpdaterConfig::load_with_optional(self.config.as_deref()).await?;
            return Ok(helper::run_helper(config, request_file, self.pipe.as_deref()).await);
        }

        match self.command {
            Some(Commands::Run(cmd)) => cmd.execute(self.config, self.no_progress, self.quiet).await?,
            Some(Commands::Backups(cmd)) => cmd.execute(self.config, self.quiet).await?,
            None => bail!("No command given; run `hotupdater --help` for usage"),
        }
        Ok(0)
    }

    fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else if self.update.is_some() {
            "info"
        } else {
            "warn"
        }
    }
}

/// Install the global `tracing` subscriber. `RUST_LOG` takes precedence over `level`.
///
/// Logs always go to stderr, since the helper's stdout may be its channel.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
