//! Command-line interface of the `casmr` binary.

use std::path::PathBuf;

use clap::Parser;

use crate::io::format::casmr_output;

const VERSION: Option<&str> = option_env!("CARGO_PKG_VERSION");

/// Logs a nicely formatted `casmr` heading to the `casmr-output` logger.
pub fn log_heading() {
    let version = VERSION
        .map(|ver| format!("v{ver}"))
        .unwrap_or_else(|| "v unknown".to_string());
    casmr_output!("╭───────────────────────────────────────────────────────────────────────────────────────╮");
    casmr_output!("│                                                                                       │");
    casmr_output!("│    ██████  █████  ███████ ███    ███ ██████                                           │");
    casmr_output!("│   ██      ██   ██ ██      ████  ████ ██   ██                                          │");
    casmr_output!("│   ██      ███████ ███████ ██ ████ ██ ██████                                           │");
    casmr_output!("│   ██      ██   ██      ██ ██  ██  ██ ██   ██                                          │");
    casmr_output!("│    ██████ ██   ██ ███████ ██      ██ ██   ██                                          │");
    casmr_output!("│                                                                                       │");
    casmr_output!("│   Complete-active-space SCF and second-order perturbation theory      {version:>15} │");
    casmr_output!("╰───────────────────────────────────────────────────────────────────────────────────────╯");
    casmr_output!("");
}

/// Command-line arguments of the `casmr` binary.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// The YAML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// The file receiving the main output. If absent, the main output is written to the console.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Print diagnostic messages to the console.
    #[arg(short, long)]
    pub debug: bool,
}
