//! Command-line interface for the sigsampler demo binary
//!
//! This module contains CLI argument parsing and its mapping onto a
//! [`SessionConfig`](crate::config::SessionConfig)

pub mod args;

pub use args::Args;
