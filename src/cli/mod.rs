//! CLI module
//!
//! Command-line interface for running the sync engine against a JSON-seeded
//! in-memory source.
//!
//! # Commands
//!
//! - `run` - Start one mode and print its events
//! - `resume` - Restart whatever was interrupted
//! - `status` - Print persisted progress
//! - `reset` - Clear one mode or everything

mod commands;
mod runner;

pub use commands::{Cli, Commands, ModeArg, OutputFormat, ResetArg};
pub use runner::Runner;
