//! Subcommand implementations

pub mod db;
pub mod migrate;
pub mod serve;
