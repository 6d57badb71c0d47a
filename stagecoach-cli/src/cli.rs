//! CLI argument parsing definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the benchmark, driving remote worker processes
    Coordinator {
        /// Port to listen on, overrides the configuration
        #[arg(long, value_name = "PORT")]
        port: Option<u16>,

        /// Write the benchmark report as JSON
        #[arg(long, value_name = "PATH")]
        report: Option<PathBuf>,
    },

    /// Connect to a coordinator and execute distributed stages
    Worker {
        /// Coordinator host, overrides the configuration
        #[arg(long, value_name = "HOST")]
        host: Option<String>,

        /// Coordinator port, overrides the configuration
        #[arg(long, value_name = "PORT")]
        port: Option<u16>,

        /// Logical worker index to request (used when rejoining after a restart)
        #[arg(long, value_name = "INDEX")]
        index: Option<usize>,

        /// Generation token announced by the process this one replaces
        #[arg(long, value_name = "UUID")]
        generation: Option<Uuid>,
    },

    /// Run the benchmark with a single in-process worker
    Local {
        /// Write the benchmark report as JSON
        #[arg(long, value_name = "PATH")]
        report: Option<PathBuf>,
    },

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        config_cmd: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(long, value_name = "PATH")]
        config_file: PathBuf,
    },

    /// Generate a sample configuration file
    Generate {
        /// Output file path
        #[arg(long, value_name = "PATH")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}
