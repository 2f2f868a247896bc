//! irisopsctl - command line front end for IrisOps
//!
//! Library half of the binary so the CLI pieces can be tested in isolation.

pub mod cli;
pub mod commands;
pub mod errors;
pub mod output;
