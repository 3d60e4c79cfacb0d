//! rexec: Command-line interface for Unreal Engine remote Python execution
//!
//! Provides the `rexec` binary for listing engine nodes on the discovery
//! group and running Python on one of them.

pub mod commands;
pub mod output;
