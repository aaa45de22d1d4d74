//! # CLI Command Implementations
//!
//! Each subcommand of the `inrepo-config` tool lives in its own file with:
//! - An `Args` struct that defines the command-specific arguments, derived
//!   using `clap`.
//! - An `execute` function that takes the parsed `Args` and calls into the
//!   `inrepo_config` library.

pub mod check;
pub mod fetch;
pub mod touches;
