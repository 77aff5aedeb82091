#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::undocumented_unsafe_blocks
)]

//! Messages of the `FlowStream` RPC.
//!
//! A producer sends a [ProducerMessage] header first, followed by data and
//! trailing metadata. The consumer answers with [ConsumerSignal]s: one or two
//! handshakes, then optionally a drain request or a close.

mod convert;
mod error;
mod v1;

pub use convert::*;
pub use error::*;
pub use v1::*;

/// Protocol version spoken by this node.
pub const VERSION: u32 = 24;

/// Oldest protocol version this node accepts from a peer.
pub const MIN_ACCEPTED_VERSION: u32 = 24;
