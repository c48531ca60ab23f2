//! Command-line interface for prepforge.
//!
//! Provides commands for running a pipeline over a source directory and
//! for inspecting or cleaning up per-execution result stores.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli};
