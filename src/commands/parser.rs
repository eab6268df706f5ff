//! Command line parsing
//!
//! clap definitions for every subcommand. Running without a subcommand starts the
//! background enforcer (`run`).

use crate::display::SortColumn;
use clap::{Args, Parser, Subcommand};
use std::ffi::OsString;
use std::path::PathBuf;

/// PinAffinity - per-program CPU affinity policies
#[derive(Parser, Debug, Clone)]
#[command(
    name = "pinaffinity",
    about = "Keeps per-program CPU affinity policies enforced on running processes",
    version,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingArgs {
    /// Log filter (trace, debug, info, warn, error, or a full directive)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Also append logs to this file
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Enforce saved policies until interrupted, restoring original affinities on exit
    Run(RunArgs),

    /// Save programs with the first non-default affinity type
    Add {
        /// Program names, e.g. game.exe
        #[arg(required = true, value_name = "PROGRAM")]
        programs: Vec<String>,
    },

    /// Assign an affinity type (name or index) to a program
    Set {
        #[arg(value_name = "PROGRAM")]
        program: String,
        #[arg(value_name = "TYPE")]
        affinity_type: String,
    },

    /// Return a program to the default affinity type
    Remove {
        #[arg(value_name = "PROGRAM")]
        program: String,
    },

    /// List saved programs
    List,

    /// List affinity types
    Types,

    /// Show running processes with their policies without changing anything
    Status {
        /// Only show processes that have a saved policy
        #[arg(long)]
        saved_only: bool,

        #[arg(long, value_enum, default_value_t = SortColumn::Type)]
        sort: SortColumn,

        /// Reverse the sort order
        #[arg(long)]
        reverse: bool,
    },

    /// Terminate a process
    #[command(name = "end-task")]
    EndTask {
        #[arg(value_name = "PID")]
        pid: u32,
    },
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct RunArgs {
    /// Redraw the process table whenever it changes
    #[arg(long)]
    pub show: bool,

    /// Reconciliation period in milliseconds
    #[arg(long, value_name = "MS")]
    pub interval_ms: Option<u64>,

    /// Initial sort column of the table
    #[arg(long, value_enum)]
    pub sort: Option<SortColumn>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Parses an explicit argv, for tests or embedding
    pub fn try_parse_args_from<I, T>(iter: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Self::try_parse_from(iter)
    }

    /// The subcommand, `run` when none was given.
    pub fn command(&self) -> Commands {
        self.command
            .clone()
            .unwrap_or_else(|| Commands::Run(RunArgs::default()))
    }
}
