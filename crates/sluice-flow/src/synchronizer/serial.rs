use std::collections::VecDeque;
use std::sync::Arc;

use sluice_core::ColumnType;
use sluice_execinfra::{FlowCtx, RowMessage, RowSource};

/// Drains its sources one after the other, in order.
///
/// A source is not read until every source before it is exhausted.
pub struct SerialUnorderedSync {
    types: Vec<ColumnType>,
    sources: VecDeque<Box<dyn RowSource>>,
}

impl std::fmt::Debug for SerialUnorderedSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialUnorderedSync")
            .field("remaining", &self.sources.len())
            .finish_non_exhaustive()
    }
}

impl SerialUnorderedSync {
    pub fn new(types: Vec<ColumnType>, sources: Vec<Box<dyn RowSource>>) -> Self {
        Self {
            types,
            sources: sources.into(),
        }
    }
}

#[async_trait::async_trait]
impl RowSource for SerialUnorderedSync {
    fn output_types(&self) -> &[ColumnType] {
        &self.types
    }

    fn start(&mut self, ctx: &Arc<FlowCtx>) {
        for source in self.sources.iter_mut() {
            source.start(ctx);
        }
    }

    async fn next(&mut self) -> Option<RowMessage> {
        while let Some(source) = self.sources.front_mut() {
            match source.next().await {
                Some(msg) => return Some(msg),
                None => {
                    self.sources.pop_front();
                }
            }
        }
        None
    }

    fn consumer_done(&mut self) {
        for source in self.sources.iter_mut() {
            source.consumer_done();
        }
    }

    fn consumer_closed(&mut self) {
        for source in self.sources.iter_mut() {
            source.consumer_closed();
        }
        self.sources.clear();
    }
}
