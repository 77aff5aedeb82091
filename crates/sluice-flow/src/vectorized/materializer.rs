use std::collections::VecDeque;
use std::sync::Arc;

use sluice_core::{ColumnType, ConsumerStatus, Row};
use sluice_execinfra::{run_source, FlowCtx, MetadataSource, RowMessage, RowReceiver, RowSource};
use tracing::Instrument;

use super::BatchReceiver;
use crate::{StartCtx, Startable};

/// Turns the batches of a channel back into rows.
///
/// Once the channel ends, the metadata of everything feeding it is drained
/// and returned after the rows.
pub struct Materializer {
    types: Vec<ColumnType>,
    input: BatchReceiver,
    rows: VecDeque<Row>,
    input_done: bool,
    metadata_sources: Vec<Box<dyn MetadataSource>>,
    pending_meta: Option<VecDeque<RowMessage>>,
}

impl std::fmt::Debug for Materializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Materializer")
            .field("types", &self.types)
            .field("input", &self.input)
            .field("rows", &self.rows.len())
            .field("metadata_sources", &self.metadata_sources.len())
            .finish_non_exhaustive()
    }
}

impl Materializer {
    pub fn new(
        types: Vec<ColumnType>,
        input: BatchReceiver,
        metadata_sources: Vec<Box<dyn MetadataSource>>,
    ) -> Self {
        Self {
            types,
            input,
            rows: VecDeque::new(),
            input_done: false,
            metadata_sources,
            pending_meta: None,
        }
    }

    async fn next_meta(&mut self) -> Option<RowMessage> {
        if self.pending_meta.is_none() {
            let mut pending = VecDeque::new();
            for source in self.metadata_sources.iter_mut() {
                pending.extend(source.drain_meta().await.into_iter().map(RowMessage::Meta));
            }
            self.pending_meta = Some(pending);
        }
        self.pending_meta.as_mut().and_then(VecDeque::pop_front)
    }
}

#[async_trait::async_trait]
impl RowSource for Materializer {
    fn output_types(&self) -> &[ColumnType] {
        &self.types
    }

    fn start(&mut self, _ctx: &Arc<FlowCtx>) {}

    async fn next(&mut self) -> Option<RowMessage> {
        while !self.input_done {
            if let Some(row) = self.rows.pop_front() {
                return Some(RowMessage::Row(row));
            }
            match self.input.next().await {
                Some(batch) => self.rows.extend(batch.rows()),
                None => self.input_done = true,
            }
        }
        // Metadata is complete once every sender is done.
        self.next_meta().await
    }

    fn consumer_done(&mut self) {
        self.rows.clear();
        self.input.set_status(ConsumerStatus::DrainRequested);
    }

    fn consumer_closed(&mut self) {
        self.rows.clear();
        self.input.set_status(ConsumerStatus::ConsumerClosed);
    }
}

/// Feeds a materialized batch channel into a row receiver, such as the
/// sync consumer.
pub struct MaterializerDriver {
    materializer: Materializer,
    output: Arc<dyn RowReceiver>,
}

impl MaterializerDriver {
    pub fn new(materializer: Materializer, output: Arc<dyn RowReceiver>) -> Self {
        Self {
            materializer,
            output,
        }
    }
}

impl Startable for MaterializerDriver {
    fn start(self: Box<Self>, ctx: &StartCtx) {
        let span = tracing::debug_span!("materializer", flow_id = %ctx.flow_ctx.id);
        let MaterializerDriver {
            mut materializer,
            output,
        } = *self;
        let flow_ctx = ctx.flow_ctx.clone();
        ctx.spawn(
            "materializer",
            async move { run_source(&flow_ctx, &mut materializer, output.as_ref()).await }
                .instrument(span),
        );
    }
}

#[cfg(test)]
mod tests {
    use sluice_core::{ProducerMetadata, RowNum};
    use sluice_testing::{int_rows, int_types};

    use super::*;
    use crate::vectorized::{BatchChannel, BatchSink, ColumnBatch, MetadataBuffer};

    fn row_num(n: i32) -> ProducerMetadata {
        ProducerMetadata::RowNum(RowNum {
            sender_id: "columnarizer".to_owned(),
            row_num: n,
            last_msg: false,
        })
    }

    #[tokio::test]
    async fn test_rows_then_metadata() {
        let (sender, receiver) = BatchChannel::new(1);
        let metadata = MetadataBuffer::default();
        metadata.push(row_num(1));
        let mut materializer =
            Materializer::new(int_types(1), receiver, vec![Box::new(metadata.clone())]);

        sender
            .push(ColumnBatch::from_rows(int_types(1), int_rows(3, 1)))
            .await;
        metadata.push(row_num(2));
        sender.producer_done();

        let mut messages = Vec::new();
        while let Some(msg) = materializer.next().await {
            messages.push(msg);
        }
        let mut expected: Vec<_> = int_rows(3, 1).into_iter().map(RowMessage::Row).collect();
        expected.push(RowMessage::Meta(row_num(1)));
        expected.push(RowMessage::Meta(row_num(2)));
        assert_eq!(messages, expected);
    }

    #[tokio::test]
    async fn test_drain_skips_rows() {
        let (sender, receiver) = BatchChannel::new(1);
        let metadata = MetadataBuffer::default();
        metadata.push(row_num(7));
        let mut materializer =
            Materializer::new(int_types(1), receiver, vec![Box::new(metadata)]);
        sender
            .push(ColumnBatch::from_rows(int_types(1), int_rows(3, 1)))
            .await;

        assert!(matches!(materializer.next().await, Some(RowMessage::Row(_))));
        materializer.consumer_done();
        assert_eq!(
            sender
                .push(ColumnBatch::from_rows(int_types(1), int_rows(1, 1)))
                .await,
            ConsumerStatus::DrainRequested
        );
        sender.producer_done();
        assert_eq!(materializer.next().await, Some(RowMessage::Meta(row_num(7))));
        assert_eq!(materializer.next().await, None);
    }
}
