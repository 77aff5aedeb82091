//! Flows that move column batches between processors instead of rows.
//!
//! Every processor runs in a driver that pulls its rows, groups them into
//! [ColumnBatch]es and pushes them to its output: a local [BatchChannel], a
//! remote [BatchOutbox], a [HashBatchRouter] or a materializer feeding the
//! sync consumer. Processor inputs are materialized back into rows.
//!
//! Metadata does not travel with batches. Each driver buffers the metadata
//! of its processor, and whoever consumes the driver's output drains that
//! buffer once the output ends.

mod batch;
mod channel;
mod columnarizer;
mod inbox;
mod materializer;
mod outbox;
mod router;
mod setup;

pub use batch::*;
pub use channel::*;
pub use columnarizer::*;
pub use inbox::*;
pub use materializer::*;
pub use outbox::*;
pub use router::*;
pub(crate) use setup::setup_flow;
