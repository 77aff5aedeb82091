#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::undocumented_unsafe_blocks
)]

//! Core data model shared by the flow runtime.
//!
//! Rows are tuples of [Datum]s with a per-stream schema of [ColumnType]s.
//! Producers send rows and [ProducerMetadata] downstream, and consumers
//! answer with a [ConsumerStatus] flowing back upstream.

mod datum;
pub mod encoding;
mod error;
mod ids;
mod metadata;
mod ordering;
mod status;

pub use datum::*;
pub use error::*;
pub use ids::*;
pub use metadata::*;
pub use ordering::*;
pub use status::*;
