#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::undocumented_unsafe_blocks
)]

//! Disk-backed row containers.

mod disk_backed;
mod disk_store;
mod error;
mod temp_storage;

pub use disk_backed::*;
pub use error::*;
pub use temp_storage::*;
