use std::sync::Arc;

use sluice_core::{ColumnType, ProcessorId, Row};
use sluice_physical::{PostProcessSpec, ProcessorSpec};
use tracing::Instrument;

use crate::{run_source, Error, FlowCtx, RowReceiver, RowSource, StatsRowReceiver};

/// A constructed processor.
///
/// Most processors are pull based and can be fused into their consumer. The
/// few that must push on their own schedule run as a [ProcessorTask].
pub enum Processor {
    Source(Box<dyn RowSource>),
    Task(Box<dyn ProcessorTask>),
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Processor::Source(_) => f.write_str("Processor::Source"),
            Processor::Task(_) => f.write_str("Processor::Task"),
        }
    }
}

/// A processor that needs its own task and pushes to its output.
#[async_trait::async_trait]
pub trait ProcessorTask: Send {
    fn output_types(&self) -> &[ColumnType];

    /// Runs to completion. Must call `producer_done` on `output`.
    async fn run(self: Box<Self>, ctx: Arc<FlowCtx>, output: Arc<dyn RowReceiver>);
}

impl Processor {
    pub fn output_types(&self) -> &[ColumnType] {
        match self {
            Processor::Source(source) => source.output_types(),
            Processor::Task(task) => task.output_types(),
        }
    }

    /// Runs the processor, pushing everything it produces to `output`.
    pub async fn run(self, ctx: Arc<FlowCtx>, output: Arc<dyn RowReceiver>, id: ProcessorId) {
        let span = tracing::info_span!("processor", flow = %ctx.id, processor = %id);
        async move {
            tracing::trace!("Processor starting");
            if ctx.collect_stats {
                let stats = Arc::new(StatsRowReceiver::new(output));
                self.run_to(&ctx, stats.clone()).await;
                stats.finish(stats.processor_span(id)).await;
            } else {
                self.run_to(&ctx, output).await;
            }
            tracing::trace!("Processor finished");
        }
        .instrument(span)
        .await
    }

    async fn run_to(self, ctx: &Arc<FlowCtx>, output: Arc<dyn RowReceiver>) {
        match self {
            Processor::Source(mut source) => {
                source.start(ctx);
                run_source(ctx, source.as_mut(), &output).await;
            }
            Processor::Task(task) => task.run(ctx.clone(), output).await,
        }
    }
}

/// Creates processors from their specs.
pub trait ProcessorFactory: Send + Sync {
    fn new_processor(
        &self,
        ctx: &Arc<FlowCtx>,
        spec: &ProcessorSpec,
        inputs: Vec<Box<dyn RowSource>>,
    ) -> error_stack::Result<Processor, Error>;
}

/// Applies a [PostProcessSpec] to the rows of a processor.
#[derive(Debug)]
pub struct PostProcessor {
    output_columns: Option<Vec<usize>>,
    offset: u64,
    limit: Option<u64>,
    seen: u64,
    emitted: u64,
}

#[derive(Debug, PartialEq)]
pub enum PostResult {
    Emit(Row),
    Skip,
    /// The limit was reached. No further rows will be emitted.
    Done,
}

impl PostProcessor {
    pub fn new(spec: &PostProcessSpec) -> Self {
        Self {
            output_columns: spec.output_columns.clone(),
            offset: spec.offset,
            limit: spec.limit,
            seen: 0,
            emitted: 0,
        }
    }

    /// Column types after projection.
    pub fn output_types(&self, input_types: &[ColumnType]) -> Vec<ColumnType> {
        match &self.output_columns {
            Some(columns) => columns
                .iter()
                .filter_map(|c| input_types.get(*c).copied())
                .collect(),
            None => input_types.to_vec(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.limit.is_some_and(|limit| self.emitted >= limit)
    }

    pub fn process(&mut self, row: Row) -> PostResult {
        if self.is_done() {
            return PostResult::Done;
        }
        self.seen += 1;
        if self.seen <= self.offset {
            return PostResult::Skip;
        }
        self.emitted += 1;
        let row = match &self.output_columns {
            Some(columns) => columns
                .iter()
                .map(|c| row.get(*c).cloned().unwrap_or(sluice_core::Datum::Null))
                .collect(),
            None => row,
        };
        PostResult::Emit(row)
    }
}
