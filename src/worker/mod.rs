//! Agent-side command execution.
//!
//! - **Execution**: [`ShellExecutor`] runs `sh -c <command>` bounded by a
//!   deadline and a cancellation token, returning partial output when cut short
//! - **Sanitizing**: [`clean_html_entities`] normalizes command text before it
//!   reaches the shell
//!
//! The [`Execute`] trait is the seam the RPC handler runs commands through.

pub mod executor;
pub mod sanitize;

pub use executor::{ExecError, ExecOutput, Execute, ShellExecutor};
pub use sanitize::clean_html_entities;
