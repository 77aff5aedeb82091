#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::undocumented_unsafe_blocks
)]

//! Flow specifications.
//!
//! A [FlowSpec] is the on-node portion of a distributed query: a list of
//! [ProcessorSpec]s whose inputs and outputs are joined by streams.

mod error;
mod flow;
mod input;
mod output;
mod stream;

pub use error::*;
pub use flow::*;
pub use input::*;
pub use output::*;
pub use stream::*;
