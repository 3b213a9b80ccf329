//! # Cli
//!
//! Cli module, defining the command line interface of the tool: the main
//! configuration shared by all commands and the subcommands themselves.

#[allow(clippy::module_inception)]
pub(crate) mod cli;
pub(crate) mod cmd;

// Re-export cli.rs
pub(crate) use cli::*;
