// sflow - sector hierarchy reconciliation, headless

mod catalog;
mod exit_codes;
mod ratios;
mod reconcile;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use exit_codes::EXIT_SUCCESS;

#[derive(Parser)]
#[command(name = "sflow")]
#[command(about = "Reconcile flow datasets onto a sector hierarchy")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a reconciliation from a TOML config file
    #[command(after_help = "\
Examples:
  sflow reconcile water-4digit.recon.toml
  sflow reconcile water-4digit.recon.toml --json
  sflow reconcile water-4digit.recon.toml --output result.json")]
    Reconcile {
        /// Path to the .recon.toml config file
        config: PathBuf,

        /// Print the JSON result to stdout
        #[arg(long)]
        json: bool,

        /// Write the JSON result to file
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Compute a config's donor ratio table without running the pipeline
    #[command(after_help = "\
Examples:
  sflow ratios water-by-employment.recon.toml
  sflow ratios water-by-employment.recon.toml --output ratios.csv")]
    Ratios {
        /// Path to the .recon.toml config file
        config: PathBuf,

        /// Write the CSV table to file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Validate a config without running
    #[command(after_help = "\
Examples:
  sflow validate water-4digit.recon.toml")]
    Validate {
        /// Path to the .recon.toml config file
        config: PathBuf,
    },

    /// Inspect a sector code list
    #[command(after_help = "\
Examples:
  sflow catalog naics_2017.csv --year 2017
  sflow catalog data/ --year 2017
  sflow catalog naics_2017.csv --year 2017 --code 311")]
    Catalog {
        /// Code list CSV, or a directory holding naics_<year>.csv files
        path: PathBuf,

        /// Catalog vintage year
        #[arg(long)]
        year: u16,

        /// Show one code's subtree instead of the overview
        #[arg(long)]
        code: Option<String>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        None => {
            eprintln!("Usage: sflow <command> [options]");
            eprintln!("       sflow --help for more information");
            Ok(())
        }
        Some(Commands::Reconcile { config, json, output }) => {
            reconcile::cmd_reconcile(config, json, output)
        }
        Some(Commands::Ratios { config, output }) => ratios::cmd_ratios(config, output),
        Some(Commands::Validate { config }) => reconcile::cmd_validate(config),
        Some(Commands::Catalog { path, year, code }) => catalog::cmd_catalog(path, year, code),
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn new(code: u8, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), hint: None }
    }

    /// Add a hint to an existing error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}
