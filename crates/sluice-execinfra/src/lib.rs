#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::undocumented_unsafe_blocks
)]

//! Execution infrastructure for flows.
//!
//! Rows move from producers to consumers through the [RowReceiver] contract
//! (push based) or the [RowSource] contract (pull based). A [RowChannel]
//! adapts one to the other across tasks. Processors are created by a
//! [ProcessorFactory] and either expose the pull-based contract, which lets
//! the flow fuse them into their consumer, or run as their own task.

mod builtin;
mod config;
mod error;
mod flow_ctx;
mod metadata_source;
mod processor;
mod receiver;
mod row_buffer;
mod row_channel;
mod rpc;
mod settings;
mod stats;

pub use builtin::*;
pub use config::*;
pub use error::*;
pub use flow_ctx::*;
pub use metadata_source::*;
pub use processor::*;
pub use receiver::*;
pub use row_buffer::*;
pub use row_channel::*;
pub use rpc::*;
pub use settings::*;
pub use stats::*;
