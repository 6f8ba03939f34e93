//! Command-line entry point for the demo binary.
//!
//! `--correct-fraction`/`--flight-computers` are carried through for
//! completeness (spec.md §6 lists them as the out-of-scope flight-control
//! application's own flags) but are not consumed by this crate's core
//! abstractions; `--process-number`/`--config` select which peer this
//! process is and where to load its [`crate::config::Configuration`] from.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{Configuration, ConfigurationError};

#[derive(Parser, Debug, Clone)]
#[command(name = "flight-consensus", about = "Distributed consensus core for a single flight-control peer")]
pub struct Cli {
    /// This peer's process number. Overrides the value in the config file
    /// when given.
    #[arg(long)]
    pub process_number: Option<u64>,

    /// Path to a TOML configuration file (peers, socket directory, timeout).
    #[arg(long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Fraction of flight computers assumed correct. Carried through for the
    /// external flight-control application; unused by the core abstractions.
    #[arg(long)]
    pub correct_fraction: Option<f64>,

    /// Number of flight computers in the cluster. Carried through for the
    /// external flight-control application; unused by the core abstractions.
    #[arg(long)]
    pub flight_computers: Option<u64>,
}

impl Cli {
    pub fn load_configuration(&self) -> Result<Configuration, ConfigurationError> {
        let mut configuration = Configuration::try_load(self.config.clone())?;
        if let Some(process_number) = self.process_number {
            configuration.node.process_number = process_number;
        }
        Ok(configuration)
    }
}
