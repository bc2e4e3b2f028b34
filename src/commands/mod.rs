//! CLI command implementations.
//!
//! Each submodule implements a codecell subcommand, with rendering kept in
//! pure functions so it can be tested without a server.

pub mod client;
pub mod languages;
pub mod serve;
