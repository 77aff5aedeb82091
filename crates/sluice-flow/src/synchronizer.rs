//! Input synchronizers merge the streams of one processor input.
//!
//! The multiplexed unordered synchronizer is a [sluice_execinfra::RowChannel]
//! shared by every stream of the input. The others pull from one source per
//! stream.

mod ordered;
mod serial;

pub use ordered::*;
pub use serial::*;
