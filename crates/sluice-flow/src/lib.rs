#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::undocumented_unsafe_blocks
)]

//! The distributed flow runtime of a node.
//!
//! A [Flow] is the portion of a query running on this node: processors wired
//! together by local row channels, [Router]s fanning a processor's output out
//! to several streams, input synchronizers merging several streams into one
//! input, [Outbox]es shipping rows to other nodes and inbound stream handlers
//! receiving them. Inbound streams meet their flow in the node-wide
//! [FlowRegistry]. The [FlowServer] ties these together for a node.

mod error;
mod flow;
mod inbound;
mod min_heap;
mod outbox;
mod pending;
mod registry;
mod router;
mod server;
mod setup;
mod startable;
mod synchronizer;
pub mod vectorized;
mod wire;

pub use error::*;
pub use flow::*;
pub use inbound::*;
pub use outbox::*;
pub use registry::*;
pub use router::*;
pub use server::*;
pub use setup::{FlowSetupOptions, FuseOpt, VectorizeMode};
pub use startable::*;
pub use synchronizer::*;
