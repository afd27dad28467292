//! Command implementations for the Nuclear CLI.

pub mod args;
pub mod checkpoints;
pub mod run;
pub mod worker;
