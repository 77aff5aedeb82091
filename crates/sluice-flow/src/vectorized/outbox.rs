use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use error_stack::ResultExt;
use futures::FutureExt;
use sluice_api::{consumer_signal, ProducerMessage};
use sluice_core::{ColumnType, ConsumerStatus, MetadataError, NodeId, StreamId};
use sluice_execinfra::{FlowCtx, MetadataSource};
use tracing::Instrument;

use super::BatchReceiver;
use crate::outbox::{dial, fail_metadata_sources, send};
use crate::wire::DataEncoder;
use crate::{Error, StartCtx, Startable};

/// Ships the batches of a channel to a remote batch inbox, one data message
/// per batch.
pub struct BatchOutbox {
    flow_ctx: Arc<FlowCtx>,
    target: NodeId,
    stream_id: StreamId,
    types: Vec<ColumnType>,
    input: BatchReceiver,
    metadata_sources: Vec<Box<dyn MetadataSource>>,
}

impl std::fmt::Debug for BatchOutbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOutbox")
            .field("target", &self.target)
            .field("stream_id", &self.stream_id)
            .field("metadata_sources", &self.metadata_sources.len())
            .finish_non_exhaustive()
    }
}

impl BatchOutbox {
    pub fn new(
        flow_ctx: Arc<FlowCtx>,
        target: NodeId,
        stream_id: StreamId,
        types: Vec<ColumnType>,
        input: BatchReceiver,
    ) -> Self {
        Self {
            flow_ctx,
            target,
            stream_id,
            types,
            input,
            metadata_sources: Vec::new(),
        }
    }

    /// Adds a source whose metadata is sent once the input ends.
    pub fn add_metadata_source(&mut self, source: Box<dyn MetadataSource>) {
        self.metadata_sources.push(source);
    }

    async fn run(mut self) {
        let result = AssertUnwindSafe(self.main_loop())
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                Err(error_stack::report!(Error::Panic(message)))
            });
        if let Err(report) = &result {
            tracing::warn!("Batch outbox to node {} failed: {report:?}", self.target);
            let error = MetadataError::from_report(report.current_context().kind(), report);
            fail_metadata_sources(&mut self.metadata_sources, &error).await;
        }
        // Unblock the producer.
        self.input.set_status(ConsumerStatus::ConsumerClosed);
        if result.is_err() {
            self.flow_ctx.cancel.cancel();
        }
    }

    async fn main_loop(&mut self) -> error_stack::Result<(), Error> {
        let (messages, mut signals) = dial(&self.flow_ctx, self.target, self.stream_id).await?;

        let mut encoder = DataEncoder::new(self.types.clone());
        let mut handshake_seen = false;
        loop {
            tokio::select! {
                _ = self.flow_ctx.cancel.cancelled() => error_stack::bail!(Error::QueryCanceled),
                signal = signals.recv() => {
                    let Some(signal) = signal.change_context(Error::Receive)? else {
                        error_stack::ensure!(handshake_seen, Error::Outbox(self.stream_id));
                        return Ok(());
                    };
                    match signal.value {
                        Some(consumer_signal::Value::Handshake(handshake)) => {
                            handshake.check_compatible().change_context(Error::Handshake)?;
                            handshake_seen = true;
                        }
                        Some(consumer_signal::Value::DrainRequest(_)) => {
                            tracing::debug!("Consumer requested drain");
                            self.input.set_status(ConsumerStatus::DrainRequested);
                        }
                        Some(consumer_signal::Value::Close(_)) => return Ok(()),
                        None => error_stack::bail!(Error::UnexpectedMessage("empty signal")),
                    }
                }
                batch = self.input.next() => match batch {
                    Some(batch) => {
                        for row in batch.rows() {
                            encoder.add_row(&row);
                        }
                        let data = ProducerMessage::data(encoder.flush());
                        send(&self.flow_ctx, &messages, &data).await?;
                    }
                    None => {
                        for source in self.metadata_sources.iter_mut() {
                            for meta in source.drain_meta().await {
                                send(&self.flow_ctx, &messages, &ProducerMessage::metadata(&meta))
                                    .await?;
                            }
                        }
                        return Ok(());
                    }
                },
            }
        }
    }
}

impl Startable for BatchOutbox {
    fn start(self: Box<Self>, ctx: &StartCtx) {
        let span = tracing::debug_span!(
            "batch outbox",
            flow_id = %ctx.flow_ctx.id,
            stream_id = %self.stream_id,
            target = %self.target,
        );
        let name = format!("batch outbox {}", self.stream_id);
        ctx.spawn(name, self.run().instrument(span));
    }
}
