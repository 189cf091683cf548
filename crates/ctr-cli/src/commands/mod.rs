//! Command handler modules for the `ctr` CLI.

pub mod audit;
pub mod config;
