use std::sync::Arc;

use error_stack::ResultExt;
use sluice_api::{producer_message, ConsumerSignal};
use sluice_core::{ColumnType, ConsumerStatus, MetadataError, ProducerMetadata};
use sluice_execinfra::{FlowCtx, FlowStreamServer, MetadataSource};

use super::{BatchSender, BatchSink, ColumnBatch, MetadataBuffer};
use crate::error::error_metadata;
use crate::wire::decode_data;
use crate::{Error, InboundStreamHandler};

/// Receives batches from a remote batch outbox.
///
/// Every data message becomes one batch. Metadata is held until drained.
pub struct BatchInbox {
    sender: Arc<BatchSender>,
    types: Vec<ColumnType>,
    metadata: MetadataBuffer,
}

impl std::fmt::Debug for BatchInbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchInbox")
            .field("types", &self.types)
            .field("metadata", &self.metadata.len())
            .finish_non_exhaustive()
    }
}

impl BatchInbox {
    pub fn new(sender: Arc<BatchSender>, types: Vec<ColumnType>) -> Self {
        Self {
            sender,
            types,
            metadata: MetadataBuffer::default(),
        }
    }

    /// The metadata received so far, including errors of the stream.
    pub fn metadata(&self) -> MetadataBuffer {
        self.metadata.clone()
    }

    pub async fn drain_meta(&self) -> Vec<ProducerMetadata> {
        self.metadata.clone().drain_meta().await
    }

    async fn process(
        &self,
        flow_ctx: &FlowCtx,
        stream: &mut FlowStreamServer,
    ) -> error_stack::Result<(), Error> {
        let mut types = None;
        let mut drain_sent = false;
        loop {
            let message = tokio::select! {
                biased;
                _ = flow_ctx.cancel.cancelled() => error_stack::bail!(Error::QueryCanceled),
                message = stream.messages.recv() => message.change_context(Error::Receive)?,
            };
            let Some(message) = message else {
                return Ok(());
            };

            let status = match message.value {
                None => error_stack::bail!(Error::UnexpectedMessage("empty message")),
                Some(producer_message::Value::Header(_)) => {
                    error_stack::bail!(Error::UnexpectedMessage("header"))
                }
                Some(producer_message::Value::Data(data)) => {
                    let rows = decode_data(&data, &mut types, &self.types)?;
                    self.sender
                        .push(ColumnBatch::from_rows(self.types.clone(), rows))
                        .await
                }
                Some(producer_message::Value::Metadata(meta)) => {
                    let meta =
                        ProducerMetadata::try_from(meta).change_context(Error::DecodeMetadata)?;
                    self.metadata.push(meta);
                    continue;
                }
            };

            match status {
                ConsumerStatus::NeedMoreRows => {}
                ConsumerStatus::DrainRequested if !drain_sent => {
                    stream
                        .signals
                        .send(&ConsumerSignal::drain_request())
                        .await
                        .change_context(Error::Send)?;
                    drain_sent = true;
                }
                ConsumerStatus::DrainRequested => {}
                ConsumerStatus::ConsumerClosed => {
                    if let Err(e) = stream.signals.send(&ConsumerSignal::close()).await {
                        tracing::debug!("Producer went away before close: {e:?}");
                    }
                    return Ok(());
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl InboundStreamHandler for BatchInbox {
    async fn run(
        &self,
        flow_ctx: Arc<FlowCtx>,
        stream: &mut FlowStreamServer,
    ) -> error_stack::Result<(), Error> {
        let result = self.process(&flow_ctx, stream).await;
        if let Err(report) = &result {
            self.metadata.push(error_metadata(report));
        }
        self.sender.producer_done();
        result
    }

    async fn timeout(&self, err: MetadataError) {
        self.metadata.push(ProducerMetadata::Error(err));
        self.sender.producer_done();
    }
}
