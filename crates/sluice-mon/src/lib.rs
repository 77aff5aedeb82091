#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::undocumented_unsafe_blocks
)]

//! Byte monitors.
//!
//! A [BytesMonitor] tracks the bytes allocated against it and optionally
//! enforces a limit. Monitors form a tree: bytes reserved in a child are also
//! reserved in every ancestor, so a limit anywhere on the path applies.
//! Components allocate through a [BoundAccount], which returns its bytes to
//! the monitor when closed or dropped.

mod account;
mod error;
mod monitor;

pub use account::*;
pub use error::*;
pub use monitor::*;
