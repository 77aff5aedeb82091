use std::sync::Arc;

use parking_lot::Mutex;
use sluice_core::{ColumnType, ConsumerStatus, ProcessorId, ProducerMetadata};
use sluice_execinfra::{FlowCtx, MetadataSource, RowMessage, RowSource};
use tracing::Instrument;

use super::{BatchSink, ColumnBatch};
use crate::{StartCtx, Startable};

/// Metadata held back by a vectorized component until its consumer drains
/// it.
#[derive(Clone, Debug, Default)]
pub struct MetadataBuffer(Arc<Mutex<Vec<ProducerMetadata>>>);

impl MetadataBuffer {
    pub fn push(&self, meta: ProducerMetadata) {
        self.0.lock().push(meta);
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

#[async_trait::async_trait]
impl MetadataSource for MetadataBuffer {
    async fn drain_meta(&mut self) -> Vec<ProducerMetadata> {
        std::mem::take(&mut *self.0.lock())
    }
}

/// Groups the rows of a row source into batches.
pub struct Columnarizer {
    input: Box<dyn RowSource>,
    batch_size: usize,
    metadata: MetadataBuffer,
    done: bool,
}

impl std::fmt::Debug for Columnarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Columnarizer")
            .field("batch_size", &self.batch_size)
            .field("metadata", &self.metadata.len())
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl Columnarizer {
    pub fn new(input: Box<dyn RowSource>, batch_size: usize) -> Self {
        Self {
            input,
            batch_size: batch_size.max(1),
            metadata: MetadataBuffer::default(),
            done: false,
        }
    }

    pub fn output_types(&self) -> &[ColumnType] {
        self.input.output_types()
    }

    /// The metadata of the input, complete once the input is exhausted.
    pub fn metadata(&self) -> MetadataBuffer {
        self.metadata.clone()
    }

    pub fn start(&mut self, ctx: &Arc<FlowCtx>) {
        self.input.start(ctx);
    }

    /// The next non-empty batch, or `None` once the input is exhausted.
    pub async fn next_batch(&mut self) -> Option<ColumnBatch> {
        if self.done {
            return None;
        }
        let mut batch = ColumnBatch::with_capacity(self.output_types().to_vec(), self.batch_size);
        while batch.len() < self.batch_size {
            match self.input.next().await {
                Some(RowMessage::Row(row)) => batch.push_row(row),
                Some(RowMessage::Meta(meta)) => self.metadata.push(meta),
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        (!batch.is_empty()).then_some(batch)
    }

    /// Stops reading rows and collects the input's remaining metadata.
    pub async fn drain(&mut self) {
        self.input.consumer_done();
        while let Some(msg) = self.input.next().await {
            if let RowMessage::Meta(meta) = msg {
                self.metadata.push(meta);
            }
        }
        self.done = true;
    }

    pub fn close(&mut self) {
        self.input.consumer_closed();
        self.done = true;
    }
}

/// Runs a processor in batches, pushing them to its output.
pub struct ProcessorDriver {
    id: ProcessorId,
    columnarizer: Columnarizer,
    output: Arc<dyn BatchSink>,
}

impl std::fmt::Debug for ProcessorDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorDriver")
            .field("id", &self.id)
            .field("columnarizer", &self.columnarizer)
            .finish_non_exhaustive()
    }
}

impl ProcessorDriver {
    pub fn new(id: ProcessorId, columnarizer: Columnarizer, output: Arc<dyn BatchSink>) -> Self {
        Self {
            id,
            columnarizer,
            output,
        }
    }

    async fn run(mut self, ctx: Arc<FlowCtx>) {
        self.columnarizer.start(&ctx);
        let mut batches = 0usize;
        while let Some(batch) = self.columnarizer.next_batch().await {
            batches += 1;
            match self.output.push(batch).await {
                ConsumerStatus::NeedMoreRows => continue,
                ConsumerStatus::DrainRequested => {
                    self.columnarizer.drain().await;
                    break;
                }
                ConsumerStatus::ConsumerClosed => {
                    self.columnarizer.close();
                    break;
                }
            }
        }
        tracing::trace!(batches, "Vectorized processor finished");
        self.output.producer_done();
    }
}

impl Startable for ProcessorDriver {
    fn start(self: Box<Self>, ctx: &StartCtx) {
        let span = tracing::debug_span!(
            "vectorized processor",
            flow_id = %ctx.flow_ctx.id,
            processor = %self.id
        );
        ctx.spawn(
            format!("vectorized processor {}", self.id),
            self.run(ctx.flow_ctx.clone()).instrument(span),
        );
    }
}

#[cfg(test)]
mod tests {
    use sluice_core::RowNum;
    use sluice_execinfra::{RowBuffer, RowReceiver};
    use sluice_testing::{int_rows, int_types};

    use super::*;

    #[tokio::test]
    async fn test_batches_and_metadata() {
        let buffer = RowBuffer::new(int_types(1));
        for row in int_rows(5, 1) {
            buffer.push(RowMessage::Row(row)).await;
        }
        let meta = ProducerMetadata::RowNum(RowNum {
            sender_id: "values".to_owned(),
            row_num: 5,
            last_msg: true,
        });
        buffer.push(RowMessage::Meta(meta.clone())).await;
        buffer.producer_done();

        let mut columnarizer = Columnarizer::new(Box::new(buffer), 2);
        let mut sizes = Vec::new();
        while let Some(batch) = columnarizer.next_batch().await {
            sizes.push(batch.len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(columnarizer.metadata().drain_meta().await, vec![meta]);
    }
}
