//! Command-line interface for bead-pipeline.
//!
//! Provides the `run` command that hosts the worker pools plus operator
//! commands for enqueueing, publishing and dead-letter handling.

mod commands;

pub use commands::{parse_cli, run_with_cli, BrokerKind, Cli, Commands};
