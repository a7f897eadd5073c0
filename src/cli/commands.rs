//! CLI commands and argument parsing

use crate::engine::ResetTarget;
use crate::types::Mode;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Incremental record sync CLI
#[derive(Parser, Debug)]
#[command(name = "recsync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Host configuration file (YAML or JSON)
    #[arg(short = 'C', long, global = true)]
    pub config: Option<PathBuf>,

    /// State file (JSON); state is kept in memory when absent
    #[arg(short, long, global = true)]
    pub state: Option<PathBuf>,

    /// JSON seed for the in-memory data store
    #[arg(long, global = true)]
    pub source: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, default_value = "json")]
    pub format: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start one mode and print its events until it stops
    Run {
        /// Mode to run
        #[arg(long, value_enum)]
        mode: ModeArg,

        /// Execution budget; the run stops gracefully before it runs out
        #[arg(long)]
        budget_secs: Option<u64>,

        /// Longest time to wait for the run to stop
        #[arg(long, default_value = "30")]
        wait_secs: u64,
    },

    /// Restart live, and historical if its last run ended early
    Resume {
        /// Execution budget per mode
        #[arg(long)]
        budget_secs: Option<u64>,

        /// Longest time to wait for the runs to stop
        #[arg(long, default_value = "30")]
        wait_secs: u64,
    },

    /// Show persisted progress
    Status {
        /// Only this mode (default: both)
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
    },

    /// Clear persisted state
    Reset {
        /// What to reset
        #[arg(long, value_enum)]
        mode: ResetArg,
    },
}

/// Mode selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ModeArg {
    /// New records from the fence forward
    Live,
    /// Backfill before the fence
    Historical,
}

impl From<ModeArg> for Mode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Live => Mode::Live,
            ModeArg::Historical => Mode::Historical,
        }
    }
}

/// Reset selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ResetArg {
    /// Live scope only
    Live,
    /// Historical scope only
    Historical,
    /// Every scope, including the account
    All,
}

impl From<ResetArg> for ResetTarget {
    fn from(arg: ResetArg) -> Self {
        match arg {
            ResetArg::Live => ResetTarget::Mode(Mode::Live),
            ResetArg::Historical => ResetTarget::Mode(Mode::Historical),
            ResetArg::All => ResetTarget::All,
        }
    }
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// JSON output (one message per line)
    Json,
    /// Indented JSON
    Pretty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "recsync", "-C", "host.yaml", "run", "--mode", "historical", "--budget-secs", "25",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("host.yaml")));
        match cli.command {
            Commands::Run {
                mode,
                budget_secs,
                wait_secs,
            } => {
                assert_eq!(Mode::from(mode), Mode::Historical);
                assert_eq!(budget_secs, Some(25));
                assert_eq!(wait_secs, 30);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_reset_all() {
        let cli = Cli::try_parse_from(["recsync", "reset", "--mode", "all", "--verbose"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Reset { mode } => assert_eq!(ResetTarget::from(mode), ResetTarget::All),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_run_requires_mode() {
        assert!(Cli::try_parse_from(["recsync", "run"]).is_err());
    }
}
